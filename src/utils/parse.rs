use std::error::Error;
use std::fmt;
use std::io;
use std::net::{AddrParseError, IpAddr};
use std::num::ParseIntError;

use bgp_rs::{Prefix, AFI};
use ipnetwork::{IpNetwork, NetworkSize};

#[derive(Debug)]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: String) -> Self {
        ParseError { reason }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseError: {}", self.reason)
    }
}

impl Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(error: io::Error) -> Self {
        ParseError::new(error.to_string())
    }
}

/// Determine if a given IPNetwork is for a single host; if so, return the IpAddr
pub fn get_host_address(network: &IpNetwork) -> Option<IpAddr> {
    let is_host = match network.size() {
        NetworkSize::V4(size) => size == 1,
        NetworkSize::V6(size) => size == 1,
    };
    if is_host {
        Some(network.ip())
    } else {
        None
    }
}

/// Convert an ASN string to a u32
/// E.g. "65000.100" -> 42598400100
pub fn asn_from_dotted(value: &str) -> Result<u32, ParseError> {
    let mut chunks = [0u32; 2];
    let check_for_overflow = value.contains('.');
    for (i, chunk) in value
        .splitn(2, '.')
        .collect::<Vec<&str>>()
        .into_iter()
        .rev()
        .enumerate()
    {
        let chunk: u32 = chunk
            .parse()
            .map_err(|err| ParseError::new(format!("{} '{}'", err, value)))?;
        if check_for_overflow && chunk > std::u16::MAX as u32 {
            return Err(ParseError::new(format!("Unsupported ASN '{}'", value)));
        }
        chunks[i] = chunk;
    }
    Ok((chunks[1] * 65536) + chunks[0])
}

/// Convert a CIDR prefix (e.g. "192.168.0.0/24") to a bgp_rs::Prefix
pub fn prefix_from_str(prefix: &str) -> Result<Prefix, ParseError> {
    if let Some(i) = prefix.find('/') {
        let (addr, mask) = prefix.split_at(i);
        let mask = &mask[1..];
        let addr: IpAddr = addr
            .parse()
            .map_err(|err: AddrParseError| ParseError::new(format!("{} '{}'", err, prefix)))?;
        let length: u8 = mask
            .parse()
            .map_err(|err: ParseIntError| ParseError::new(format!("{} '{}'", err, prefix)))?;
        let (protocol, octets) = match addr {
            IpAddr::V4(v4) => (AFI::IPV4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (AFI::IPV6, v6.octets().to_vec()),
        };
        Ok(Prefix {
            protocol,
            length,
            prefix: octets,
        })
    } else {
        Err(ParseError::new(format!("Not a valid prefix: '{}'", prefix)))
    }
}

pub fn prefix_from_network(network: &IpNetwork) -> Prefix {
    match network {
        IpNetwork::V4(net) => Prefix {
            protocol: AFI::IPV4,
            length: net.prefix(),
            prefix: net.ip().octets().to_vec(),
        },
        IpNetwork::V6(net) => Prefix {
            protocol: AFI::IPV6,
            length: net.prefix(),
            prefix: net.ip().octets().to_vec(),
        },
    }
}

/// The reverse of [`prefix_from_network`]: a wire `Prefix` as received in an
/// UPDATE's NLRI back to an `IpNetwork` for table storage.
pub fn network_from_prefix(prefix: &Prefix) -> Result<IpNetwork, ParseError> {
    match prefix.protocol {
        AFI::IPV4 => {
            let mut octets = [0u8; 4];
            let len = prefix.prefix.len().min(4);
            octets[..len].copy_from_slice(&prefix.prefix[..len]);
            IpNetwork::new(IpAddr::V4(octets.into()), prefix.length)
                .map_err(|err| ParseError::new(err.to_string()))
        }
        AFI::IPV6 => {
            let mut octets = [0u8; 16];
            let len = prefix.prefix.len().min(16);
            octets[..len].copy_from_slice(&prefix.prefix[..len]);
            IpNetwork::new(IpAddr::V6(octets.into()), prefix.length)
                .map_err(|err| ParseError::new(err.to_string()))
        }
        other => Err(ParseError::new(format!("Unsupported prefix AFI: {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asn_from_dotted() {
        assert_eq!(asn_from_dotted("100").unwrap(), 100);
        assert_eq!(asn_from_dotted("65000.100").unwrap(), 4_259_840_100);
        assert!(asn_from_dotted("65537.100").is_err());
    }

    #[test]
    fn test_prefix_from_str() {
        let prefix = prefix_from_str("192.168.10.0/24").unwrap();
        assert_eq!(prefix.length, 24);
        assert!(prefix_from_str("not-a-prefix").is_err());
    }

    #[test]
    fn test_network_from_prefix_round_trips() {
        let network: IpNetwork = "192.168.10.0/24".parse().unwrap();
        let prefix = prefix_from_network(&network);
        let back = network_from_prefix(&prefix).unwrap();
        assert_eq!(back, network);

        let network6: IpNetwork = "2620:10:20::/64".parse().unwrap();
        let prefix6 = prefix_from_network(&network6);
        let back6 = network_from_prefix(&prefix6).unwrap();
        assert_eq!(back6, network6);
    }
}
