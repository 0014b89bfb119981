//! Turns a received `bgp_rs::Update` into table operations (spec.md §4.7
//! wire layer meeting §4.1/§4.2 storage). The reverse direction of
//! `export.rs`/`instance::export_route`.
//!
//! Grounded in the teacher's `rib::parse::parse_update` (withdrawals first
//! via MP_UNREACH_NLRI plus direct `withdrawn_routes`, then announcements
//! via either plain IPv4 NLRI or MP_REACH_NLRI) adapted from the teacher's
//! attribute-group cache onto this crate's per-family interned `Table`.
//! Only the families a wire peer can actually negotiate (spec.md
//! `families::to_address_family`: plain IPv4/IPv6 unicast) are handled;
//! VPN/EVPN/multicast families arrive over the compute-agent channel
//! instead (spec.md §4.3/§4.4), never directly from a BGP peer.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bgp_rs::{Identifier, NLRIEncoding, PathAttribute, Update, AFI};

use crate::attr::{AttrDb, AttrValue, AsPathSpec, Community, CommunityList, ExtCommunity, Handle};
use crate::error::{DecodeError, SessionError};
use crate::instance::Instance;
use crate::route::{AddressFamily, Path, PathSource, PeerRef, RouteKey};
use crate::utils::network_from_prefix;

use super::families::{to_address_family, Family};

/// Apply one received UPDATE to `instance`'s tables on `peer`'s behalf:
/// withdrawals are enqueued before announcements, mirroring the order a
/// real UPDATE processes them in (spec.md §4.7).
pub fn ingest_update(db: &AttrDb, instance: &Instance, peer: &PeerRef, update: Update) -> Result<(), SessionError> {
    if let Some(PathAttribute::MP_UNREACH_NLRI(nlri)) = update.get(Identifier::MP_UNREACH_NLRI) {
        if let Some(af) = to_address_family(Family::new(nlri.afi, nlri.safi)) {
            withdraw_nlri(instance, peer, af, &nlri.withdrawn_routes);
        }
    }
    if !update.withdrawn_routes.is_empty() {
        withdraw_nlri(instance, peer, AddressFamily::Inet, &update.withdrawn_routes);
    }

    if !update.announced_routes.is_empty() {
        let next_hop = update
            .attributes
            .iter()
            .find_map(|attr| match attr {
                PathAttribute::NEXT_HOP(addr) => Some(IpAddr::V4(*addr)),
                _ => None,
            })
            .ok_or(SessionError::Decode(DecodeError::InvalidNextHop))?;
        let attr = decode_attrs(db, next_hop, &update.attributes);
        announce_nlri(instance, peer, AddressFamily::Inet, attr, &update.announced_routes);
    } else if let Some(PathAttribute::MP_REACH_NLRI(nlri)) = update.get(Identifier::MP_REACH_NLRI) {
        if let Some(af) = to_address_family(Family::new(nlri.afi, nlri.safi)) {
            let next_hop = parse_next_hop(nlri.afi, &nlri.next_hop)?;
            let attr = decode_attrs(db, next_hop, &update.attributes);
            announce_nlri(instance, peer, af, attr, &nlri.announced_routes);
        }
    }
    Ok(())
}

fn withdraw_nlri(instance: &Instance, peer: &PeerRef, af: AddressFamily, nlri: &[NLRIEncoding]) {
    let table = instance.table(af);
    for entry in nlri {
        if let NLRIEncoding::IP(prefix) = entry {
            if let Ok(network) = network_from_prefix(prefix) {
                table.enqueue_delete(route_key(af, network), Some(peer.id), 0);
            }
        }
    }
}

fn announce_nlri(instance: &Instance, peer: &PeerRef, af: AddressFamily, attr: Handle<AttrValue>, nlri: &[NLRIEncoding]) {
    let table = instance.table(af);
    for entry in nlri {
        if let NLRIEncoding::IP(prefix) = entry {
            if let Ok(network) = network_from_prefix(prefix) {
                let path = Path::new(Some(peer.clone()), 0, PathSource::BgpXmpp, attr.clone());
                table.enqueue_add(route_key(af, network), path);
            }
        }
    }
}

fn route_key(af: AddressFamily, network: ipnetwork::IpNetwork) -> RouteKey {
    match af {
        AddressFamily::Inet => RouteKey::Inet(network),
        AddressFamily::Inet6 => RouteKey::Inet6(network),
        _ => unreachable!("to_address_family only yields Inet/Inet6"),
    }
}

fn parse_next_hop(afi: AFI, bytes: &[u8]) -> Result<IpAddr, SessionError> {
    match afi {
        AFI::IPV4 if bytes.len() >= 4 => Ok(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))),
        AFI::IPV6 if bytes.len() >= 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(SessionError::Decode(DecodeError::InvalidNextHop)),
    }
}

/// Fold a wire attribute list into one canonical, interned `AttrValue`
/// (spec.md §4.1). Unrecognized/unsupported attributes (DPA, AS4_PATH,
/// PMSI_TUNNEL, ...) are dropped rather than rejected, matching the
/// teacher's permissive attribute pass-through.
fn decode_attrs(db: &AttrDb, next_hop: IpAddr, attrs: &[PathAttribute]) -> Handle<AttrValue> {
    let mut as_path = AsPathSpec::empty();
    let mut standard = Vec::new();
    let mut extended = Vec::new();
    let mut local_pref = 100u32;
    let mut med = None;
    let mut atomic_aggregate = false;
    let mut aggregator = None;
    let mut originator_id = None;
    let mut cluster_list = Vec::new();
    let mut origin = bgp_rs::Origin::INCOMPLETE;

    for attr in attrs {
        match attr {
            PathAttribute::ORIGIN(o) => origin = *o,
            PathAttribute::AS_PATH(path) => as_path = AsPathSpec::from(path),
            PathAttribute::MULTI_EXIT_DISC(v) => med = Some(*v),
            PathAttribute::LOCAL_PREF(v) => local_pref = *v,
            PathAttribute::ATOMIC_AGGREGATOR => atomic_aggregate = true,
            PathAttribute::AGGREGATOR((asn, addr)) => aggregator = Some((*asn, IpAddr::V4(*addr))),
            PathAttribute::COMMUNITY(list) => standard = list.iter().map(|v| Community(*v)).collect(),
            PathAttribute::ORIGINATOR_ID(id) => originator_id = Some(IpAddr::V4(Ipv4Addr::from(*id))),
            PathAttribute::CLUSTER_LIST(list) => cluster_list = list.clone(),
            PathAttribute::EXTENDED_COMMUNITIES(list) => extended = list.iter().map(|v| ExtCommunity(*v)).collect(),
            _ => {}
        }
    }

    let mut value = AttrValue::bare(
        next_hop,
        db.locate_as_path(as_path),
        db.locate_communities(CommunityList::new(standard, extended)),
    );
    value.origin = origin;
    value.local_pref = local_pref;
    value.med = med;
    value.atomic_aggregate = atomic_aggregate;
    value.aggregator = aggregator;
    value.originator_id = originator_id;
    value.cluster_list = cluster_list;
    db.locate(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bgp_rs::{Origin, Prefix};

    use crate::instance::InstanceMgr;

    fn peer_ref(id: u64, alive: &Arc<()>) -> PeerRef {
        PeerRef::new(
            id,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            true,
            alive,
        )
    }

    fn prefix(addr: [u8; 4], length: u8) -> Prefix {
        Prefix { protocol: AFI::IPV4, length, prefix: addr.to_vec() }
    }

    #[test]
    fn test_announce_inserts_route() {
        let db = AttrDb::new();
        let mgr = InstanceMgr::new(Arc::new(AttrDb::new()));
        let instance = mgr.create("default");
        let alive = Arc::new(());
        let peer = peer_ref(1, &alive);

        let update = Update {
            attributes: vec![
                PathAttribute::ORIGIN(Origin::IGP),
                PathAttribute::NEXT_HOP(Ipv4Addr::new(10, 0, 0, 1)),
                PathAttribute::LOCAL_PREF(200),
            ],
            announced_routes: vec![NLRIEncoding::IP(prefix([192, 168, 1, 0], 24))],
            withdrawn_routes: vec![],
        };
        ingest_update(&db, &instance, &peer, update).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(instance.table(AddressFamily::Inet).route_count(), 1);
    }

    #[test]
    fn test_withdraw_removes_route() {
        let db = AttrDb::new();
        let mgr = InstanceMgr::new(Arc::new(AttrDb::new()));
        let instance = mgr.create("default");
        let alive = Arc::new(());
        let peer = peer_ref(1, &alive);

        let announce = Update {
            attributes: vec![
                PathAttribute::ORIGIN(Origin::IGP),
                PathAttribute::NEXT_HOP(Ipv4Addr::new(10, 0, 0, 1)),
            ],
            announced_routes: vec![NLRIEncoding::IP(prefix([192, 168, 1, 0], 24))],
            withdrawn_routes: vec![],
        };
        ingest_update(&db, &instance, &peer, announce).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(instance.table(AddressFamily::Inet).route_count(), 1);

        let withdraw = Update {
            attributes: vec![],
            announced_routes: vec![],
            withdrawn_routes: vec![NLRIEncoding::IP(prefix([192, 168, 1, 0], 24))],
        };
        ingest_update(&db, &instance, &peer, withdraw).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(instance.table(AddressFamily::Inet).route_count(), 0);
    }
}
