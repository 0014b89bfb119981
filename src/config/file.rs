//! TOML-backed adapter producing `ConfigEvent`s (SPEC_FULL.md §6), grounded
//! in the teacher's `ServerConfigSpec`/`PeerConfigSpec` field-by-field
//! defaulting.
use std::convert::TryFrom;
use std::fs;
use std::net::IpAddr;

use bgp_rs::{AFI, SAFI};
use ipnetwork::IpNetwork;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::instance::MASTER_INSTANCE;
use crate::session::families::Family;
use crate::utils::get_host_address;

use super::{
    parse_route_target, FamilyAttributes, InstanceConfig, NeighborConfig, PolicyConfig,
    ServerConfig, StaticRouteSpec,
};

struct Defaults;

impl Defaults {
    fn enabled() -> bool {
        true
    }
    fn passive() -> bool {
        false
    }
    fn hold_timer() -> u16 {
        180
    }
    fn dest_port() -> u16 {
        179
    }
    fn families() -> Vec<Family> {
        vec![
            Family::new(AFI::IPV4, SAFI::Unicast),
            Family::new(AFI::IPV6, SAFI::Unicast),
        ]
    }
    fn instance() -> String {
        MASTER_INSTANCE.to_string()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RouteSpec {
    pub prefix: String,
    pub next_hop: IpAddr,
    pub local_pref: Option<u32>,
    #[serde(default)]
    pub communities: Vec<String>,
}

impl RouteSpec {
    fn into_static_route(self) -> Result<StaticRouteSpec, ConfigError> {
        let prefix: IpNetwork = self
            .prefix
            .parse()
            .map_err(|_| ConfigError::new(format!("invalid static route prefix '{}'", self.prefix)))?;
        Ok(StaticRouteSpec {
            prefix,
            next_hop: self.next_hop,
            local_pref: self.local_pref,
            communities: self.communities,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
struct InstanceSpec {
    name: String,
    #[serde(default)]
    import_rt: Vec<String>,
    #[serde(default)]
    export_rt: Vec<String>,
    #[serde(default = "Defaults::families")]
    address_families: Vec<Family>,
    virtual_network_name: Option<String>,
    vn_index: Option<u32>,
    #[serde(default)]
    static_routes: Vec<RouteSpec>,
    #[serde(default)]
    service_chain: Vec<String>,
    #[serde(default)]
    policy_refs: Vec<String>,
}

impl InstanceSpec {
    fn into_instance_config(self) -> Result<InstanceConfig, ConfigError> {
        let import_rt_set = self.import_rt.iter().map(|s| parse_route_target(s)).collect::<Result<_, _>>()?;
        let export_rt_set = self.export_rt.iter().map(|s| parse_route_target(s)).collect::<Result<_, _>>()?;
        let static_routes = self
            .static_routes
            .into_iter()
            .map(RouteSpec::into_static_route)
            .collect::<Result<_, _>>()?;
        Ok(InstanceConfig {
            name: self.name,
            import_rt_set,
            export_rt_set,
            address_families: self.address_families,
            virtual_network_name: self.virtual_network_name,
            vn_index: self.vn_index,
            static_routes,
            service_chain: self.service_chain,
            policy_refs: self.policy_refs,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
struct FamilyAttributesSpec {
    family: Family,
    #[serde(default)]
    loop_count: u8,
    prefix_limit: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
struct NeighborSpec {
    name: String,
    uuid: Option<String>,
    #[serde(default = "Defaults::instance")]
    instance: String,
    remote_ip: IpNetwork,
    remote_as: u32,
    local_as: Option<u32>,
    local_router_id: Option<IpAddr>,
    #[serde(default = "Defaults::enabled")]
    enabled: bool,
    #[serde(default = "Defaults::passive")]
    passive: bool,
    #[serde(default)]
    as_override: bool,
    #[serde(default = "Defaults::hold_timer")]
    hold_timer: u16,
    #[serde(default = "Defaults::dest_port")]
    dest_port: u16,
    #[serde(default)]
    auth_keys: Vec<String>,
    #[serde(default = "Defaults::families")]
    address_families: Vec<Family>,
    #[serde(default)]
    family_attributes: Vec<FamilyAttributesSpec>,
}

impl NeighborSpec {
    fn into_neighbor_config(self, default_as: u32, router_id: IpAddr) -> NeighborConfig {
        let peer_address = get_host_address(&self.remote_ip).unwrap_or_else(|| self.remote_ip.ip());
        NeighborConfig {
            uuid: self.uuid.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            instance: self.instance,
            peer_as: self.remote_as,
            peer_address,
            port: self.dest_port,
            hold_time: self.hold_timer,
            local_as: self.local_as.unwrap_or(default_as),
            local_identifier: self.local_router_id.unwrap_or(router_id),
            auth_keys: self.auth_keys,
            address_families: self.address_families,
            family_attributes: self
                .family_attributes
                .into_iter()
                .map(|f| FamilyAttributes {
                    family: f.family,
                    loop_count: f.loop_count,
                    prefix_limit: f.prefix_limit,
                })
                .collect(),
            admin_down: !self.enabled,
            passive: self.passive,
            as_override: self.as_override,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct PolicySpec {
    name: String,
    #[serde(default)]
    terms: Vec<super::PolicyTerm>,
}

#[derive(Clone, Debug, Deserialize)]
struct ProtocolSpec {
    instance: String,
    local_as: Option<u32>,
    local_identifier: Option<IpAddr>,
    #[serde(default = "Defaults::hold_timer")]
    hold_time: u16,
    #[serde(default = "Defaults::dest_port")]
    port: u16,
}

impl ProtocolSpec {
    fn into_protocol_config(self, default_as: u32, router_id: IpAddr) -> super::ProtocolConfig {
        super::ProtocolConfig {
            instance: self.instance,
            local_as: self.local_as.unwrap_or(default_as),
            local_identifier: self.local_identifier.unwrap_or(router_id),
            hold_time: self.hold_time,
            port: self.port,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    router_id: IpAddr,
    default_as: u32,
    #[serde(default)]
    instances: Vec<InstanceSpec>,
    #[serde(default)]
    protocols: Vec<ProtocolSpec>,
    #[serde(default)]
    neighbors: Vec<NeighborSpec>,
    #[serde(default)]
    policies: Vec<PolicySpec>,
}

impl ConfigFile {
    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|err| ConfigError::new(err.to_string()))
    }

    pub fn into_server_config(self) -> Result<ServerConfig, ConfigError> {
        let router_id = self.router_id;
        let default_as = self.default_as;
        let mut instances: Vec<InstanceConfig> = self
            .instances
            .into_iter()
            .map(InstanceSpec::into_instance_config)
            .collect::<Result<_, _>>()?;
        if !instances.iter().any(|i| i.name == MASTER_INSTANCE) {
            instances.insert(
                0,
                InstanceConfig {
                    name: MASTER_INSTANCE.to_string(),
                    address_families: Defaults::families(),
                    ..Default::default()
                },
            );
        }
        let neighbors = self
            .neighbors
            .into_iter()
            .map(|n| n.into_neighbor_config(default_as, router_id))
            .collect();
        let policies = self
            .policies
            .into_iter()
            .map(|p| PolicyConfig { name: p.name, terms: p.terms })
            .collect();
        let protocols = self
            .protocols
            .into_iter()
            .map(|p| p.into_protocol_config(default_as, router_id))
            .collect();
        Ok(ServerConfig {
            router_id,
            default_as,
            instances,
            protocols,
            neighbors,
            policies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const DEMO_CONFIG: &str = r#"
        router_id = "1.1.1.1"
        default_as = 65000

        [[instances]]
        name = "blue"
        import_rt = ["target:65000:100"]
        export_rt = ["target:65000:100"]
        virtual_network_name = "blue-vn"
        vn_index = 5

        [[instances.static_routes]]
        prefix = "10.1.0.0/16"
        next_hop = "10.1.0.1"
        local_pref = 200
        communities = ["100:200"]

        [[neighbors]]
        name = "peer1"
        remote_ip = "127.0.0.2/32"
        remote_as = 65001
        hold_timer = 30
        dest_port = 1179
        passive = true

        [[neighbors]]
        name = "peer2"
        instance = "blue"
        remote_ip = "127.0.0.3/32"
        remote_as = 65000
    "#;

    #[test]
    fn test_parse_config() {
        let config = ConfigFile::from_str(DEMO_CONFIG).unwrap().into_server_config().unwrap();
        assert_eq!(config.router_id, IpAddr::from(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(config.default_as, 65000);
        // master is always synthesized even when not configured explicitly
        assert_eq!(config.instances.len(), 2);
        let blue = config.instances.iter().find(|i| i.name == "blue").unwrap();
        assert_eq!(blue.vn_index, Some(5));
        assert_eq!(blue.static_routes.len(), 1);
        assert_eq!(blue.import_rt_set.len(), 1);

        assert_eq!(config.neighbors.len(), 2);
        let peer1 = config.neighbors.iter().find(|n| n.name == "peer1").unwrap();
        assert_eq!(peer1.peer_address, IpAddr::from(Ipv4Addr::new(127, 0, 0, 2)));
        assert_eq!(peer1.hold_time, 30);
        assert_eq!(peer1.port, 1179);
        assert!(peer1.passive);
        assert!(peer1.is_ebgp());

        let peer2 = config.neighbors.iter().find(|n| n.name == "peer2").unwrap();
        assert_eq!(peer2.instance, "blue");
        assert!(!peer2.is_ebgp());
    }

    #[test]
    fn test_events_order_instances_before_peers() {
        let config = ConfigFile::from_str(DEMO_CONFIG).unwrap().into_server_config().unwrap();
        let events = config.events();
        let first_peer_up = events.iter().position(|e| matches!(e, super::super::ConfigEvent::PeerUp(_))).unwrap();
        let last_instance_up = events.iter().rposition(|e| matches!(e, super::super::ConfigEvent::InstanceUp(_))).unwrap();
        assert!(last_instance_up < first_peer_up);
    }
}
