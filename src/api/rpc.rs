//! Introspection RPC surface (SPEC_FULL.md §6 "Introspection surface"):
//! read-only snapshots of peers, routes, and instances, the "safe
//! iterator" hook the design notes ask for realized with the crate the
//! corpus already depends on for RPC.
//!
//! Grounded directly in the teacher's `api/rpc.rs` `#[rpc]` trait and its
//! `PeerSummary`/`LearnedRoute` DTOs, pared down to what this crate's data
//! model (`route::Path`/`RouteKey`, `session::Peer`) can actually report
//! and to the read-only scope SPEC_FULL.md assigns `ShowApi` — the
//! teacher's `advertise_route`/`advertise_flow` write methods have no
//! counterpart here.
use std::net::IpAddr;

use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};

#[rpc(client, server)]
pub trait ShowApi {
    #[method(name = "show_peers")]
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>>;
    #[method(name = "show_peer_detail")]
    async fn show_peer_detail(&self, peer_address: IpAddr) -> RpcResult<Option<PeerDetail>>;
    #[method(name = "show_instances")]
    async fn show_instances(&self) -> RpcResult<Vec<InstanceSummary>>;
    #[method(name = "show_routes")]
    async fn show_routes(&self, instance: String, family: String) -> RpcResult<Vec<RouteSummary>>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerSummary {
    pub peer_address: IpAddr,
    pub instance: String,
    pub enabled: bool,
    pub local_as: u32,
    pub peer_as: u32,
    pub state: String,
    pub msg_received: u64,
    pub msg_sent: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerDetail {
    pub summary: PeerSummary,
    pub router_id: IpAddr,
    pub hold_time: u16,
    pub negotiated_families: Vec<String>,
    pub graceful_restart: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    pub families: Vec<String>,
    pub route_counts: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteSummary {
    pub prefix: String,
    pub next_hop: IpAddr,
    pub origin: String,
    pub as_path: String,
    pub local_pref: u32,
    pub med: Option<u32>,
    pub source: String,
    pub peer: Option<IpAddr>,
}
