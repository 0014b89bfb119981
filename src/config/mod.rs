//! Configuration ingestion pipeline (SPEC_FULL.md §6).
//!
//! Out of scope is a config *schema* (file format/database); in scope is
//! the `ConfigEvent` stream the core consumes plus the in-repo TOML-backed
//! adapter (`file`) that produces it for tests and the demo CLI, grounded
//! in the teacher's `config/mod.rs`/`config/file.rs` `ServerConfig`/
//! `PeerConfig` defaulting pattern.
mod file;

pub use file::RouteSpec;

use std::collections::HashSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::attr::RouteTarget;
use crate::error::ConfigError;
use crate::session::families::Family;

/// One configured static route inside an `InstanceConfig` (SPEC_FULL.md
/// §4.3: "Instance also carries ... an optional static-route ... table").
#[derive(Debug, Clone, PartialEq)]
pub struct StaticRouteSpec {
    pub prefix: ipnetwork::IpNetwork,
    pub next_hop: IpAddr,
    pub local_pref: Option<u32>,
    pub communities: Vec<String>,
}

/// Per-family knobs a neighbor negotiates loop prevention/limits under
/// (spec.md §6 `NeighborConfig.family_attributes[]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyAttributes {
    pub family: Family,
    pub loop_count: u8,
    pub prefix_limit: Option<u32>,
}

/// A named routing instance (VRF), spec.md §6.
#[derive(Debug, Clone, Default)]
pub struct InstanceConfig {
    pub name: String,
    pub import_rt_set: HashSet<RouteTarget>,
    pub export_rt_set: HashSet<RouteTarget>,
    pub address_families: Vec<Family>,
    pub virtual_network_name: Option<String>,
    pub vn_index: Option<u32>,
    pub static_routes: Vec<StaticRouteSpec>,
    pub service_chain: Vec<String>,
    pub policy_refs: Vec<String>,
}

/// The instance-wide BGP protocol parameters (spec.md §6).
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub instance: String,
    pub local_as: u32,
    pub local_identifier: IpAddr,
    pub hold_time: u16,
    pub port: u16,
}

/// One configured peer (spec.md §6).
#[derive(Debug, Clone)]
pub struct NeighborConfig {
    pub name: String,
    pub uuid: String,
    pub instance: String,
    pub peer_as: u32,
    pub peer_address: IpAddr,
    pub port: u16,
    pub hold_time: u16,
    pub local_as: u32,
    pub local_identifier: IpAddr,
    pub auth_keys: Vec<String>,
    pub address_families: Vec<Family>,
    pub family_attributes: Vec<FamilyAttributes>,
    pub admin_down: bool,
    pub passive: bool,
    pub as_override: bool,
}

impl NeighborConfig {
    pub fn is_ebgp(&self) -> bool {
        self.peer_as != self.local_as
    }
}

/// A single policy term's match predicate (data shape only — no evaluator,
/// per spec.md §1 non-goals).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMatch {
    pub community: Option<String>,
    pub prefix: Option<String>,
    pub protocol: Option<String>,
}

/// Outcome of a matched term, optionally rewriting attributes before the
/// next term (or before acceptance) is evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    Accept {
        set_community: Option<String>,
        set_local_pref: Option<u32>,
        set_med: Option<u32>,
    },
    Reject,
    NextTerm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTerm {
    #[serde(rename = "match")]
    pub matches: PolicyMatch,
    pub action: PolicyAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    pub terms: Vec<PolicyTerm>,
}

/// One configuration change the core reacts to (spec.md §6). Produced by
/// an out-of-scope configuration backend; `config::file` is the in-repo
/// adapter used to exercise these end-to-end.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    InstanceUp(InstanceConfig),
    InstanceDown(String),
    PeerUp(NeighborConfig),
    PeerDown(String),
    PolicyUpdated(PolicyConfig),
}

/// The parsed form of a whole config file: one `ProtocolConfig` per
/// instance plus the instances/neighbors/policies it names. Kept
/// separately from `ConfigEvent` so the demo CLI and tests can inspect
/// the snapshot directly, then ask for it as an event sequence.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub router_id: IpAddr,
    pub default_as: u32,
    pub instances: Vec<InstanceConfig>,
    pub protocols: Vec<ProtocolConfig>,
    pub neighbors: Vec<NeighborConfig>,
    pub policies: Vec<PolicyConfig>,
}

impl ServerConfig {
    /// The `ProtocolConfig` governing `instance`, falling back to the
    /// server-wide router-id/ASN/default hold-time/port if none was
    /// configured explicitly for it.
    pub fn protocol_for(&self, instance: &str) -> ProtocolConfig {
        self.protocols
            .iter()
            .find(|p| p.instance == instance)
            .cloned()
            .unwrap_or_else(|| ProtocolConfig {
                instance: instance.to_string(),
                local_as: self.default_as,
                local_identifier: self.router_id,
                hold_time: 180,
                port: 179,
            })
    }
}

impl ServerConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        file::ConfigFile::from_path(path)?.into_server_config()
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        file::ConfigFile::from_str(contents)?.into_server_config()
    }

    /// Flatten into the `ConfigEvent` sequence a `Server` consumes:
    /// instances before the peers that reference them, matching the
    /// dependency order spec.md §2 lists.
    pub fn events(&self) -> Vec<ConfigEvent> {
        let mut events = Vec::with_capacity(self.instances.len() + self.neighbors.len() + self.policies.len());
        for instance in &self.instances {
            events.push(ConfigEvent::InstanceUp(instance.clone()));
        }
        for policy in &self.policies {
            events.push(ConfigEvent::PolicyUpdated(policy.clone()));
        }
        for neighbor in &self.neighbors {
            events.push(ConfigEvent::PeerUp(neighbor.clone()));
        }
        events
    }
}

pub(crate) fn parse_route_target(value: &str) -> Result<RouteTarget, ConfigError> {
    std::convert::TryFrom::try_from(value).map_err(|e: std::io::Error| ConfigError::new(e.to_string()))
}
