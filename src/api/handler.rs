//! `ShowApiServer` implementation plus the jsonrpsee server bootstrap
//! (SPEC_FULL.md §6 "Introspection surface").
//!
//! Grounded in the teacher's `api/handler.rs` request-dispatch shape
//! (collect a snapshot, serialize, answer), adapted from hyper's raw
//! `Request`/`Response` plumbing to the `#[rpc]`-generated
//! `ShowApiServer` trait this crate's `api::rpc` declares.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use jsonrpsee::core::{async_trait, Error as RpcError, RpcResult};
use jsonrpsee::http_server::{HttpServerBuilder, HttpServerHandle};

use crate::route::AddressFamily;
use crate::server::Server;

use super::rpc::{InstanceSummary, PeerDetail, PeerSummary, RouteSummary, ShowApiServer};

/// Parse a family name as shown by `AddressFamily`'s `Display` (spec.md §3
/// GLOSSARY) back into the enum, for `show_routes`'s string parameter.
fn parse_family(name: &str) -> Option<AddressFamily> {
    match name {
        "inet" => Some(AddressFamily::Inet),
        "inet6" => Some(AddressFamily::Inet6),
        "inet-vpn" => Some(AddressFamily::InetVpn),
        "inet6-vpn" => Some(AddressFamily::Inet6Vpn),
        "evpn" => Some(AddressFamily::Evpn),
        "erm-vpn" => Some(AddressFamily::ErmVpn),
        "rtarget" => Some(AddressFamily::RTarget),
        "enet" => Some(AddressFamily::Enet),
        _ => None,
    }
}

/// Thin read-only wrapper around `Server` exposed over the RPC surface.
pub struct ShowApiImpl {
    server: Arc<Server>,
}

impl ShowApiImpl {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl ShowApiServer for ShowApiImpl {
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>> {
        Ok(self
            .server
            .sessions
            .snapshot_peers()
            .await
            .into_iter()
            .map(|p| PeerSummary {
                peer_address: p.peer_address,
                instance: p.instance,
                enabled: !p.admin_down,
                local_as: p.local_as,
                peer_as: p.peer_as,
                state: format!("{:?}", p.state),
                msg_received: p.msg_received,
                msg_sent: p.msg_sent,
            })
            .collect())
    }

    async fn show_peer_detail(&self, peer_address: IpAddr) -> RpcResult<Option<PeerDetail>> {
        let snapshot = match self.server.sessions.peer_snapshot(peer_address).await {
            Some(s) => s,
            None => return Ok(None),
        };
        Ok(Some(PeerDetail {
            router_id: snapshot.router_id,
            hold_time: snapshot.hold_time,
            negotiated_families: snapshot.negotiated_families.clone(),
            graceful_restart: snapshot.graceful_restart,
            summary: PeerSummary {
                peer_address: snapshot.peer_address,
                instance: snapshot.instance,
                enabled: !snapshot.admin_down,
                local_as: snapshot.local_as,
                peer_as: snapshot.peer_as,
                state: format!("{:?}", snapshot.state),
                msg_received: snapshot.msg_received,
                msg_sent: snapshot.msg_sent,
            },
        }))
    }

    async fn show_instances(&self) -> RpcResult<Vec<InstanceSummary>> {
        let mut out = Vec::new();
        for name in self.server.instance_mgr.names() {
            let instance = match self.server.instance_mgr.get(&name) {
                Some(i) => i,
                None => continue,
            };
            let families = instance.families();
            let route_counts = families
                .iter()
                .filter_map(|family| instance.try_table(*family).map(|t| (family.to_string(), t.snapshot_best_paths().len())))
                .collect();
            out.push(InstanceSummary {
                name,
                families: families.iter().map(ToString::to_string).collect(),
                route_counts,
            });
        }
        Ok(out)
    }

    async fn show_routes(&self, instance: String, family: String) -> RpcResult<Vec<RouteSummary>> {
        let af = match parse_family(&family) {
            Some(af) => af,
            None => return Err(RpcError::Custom(format!("unknown address family {:?}", family))),
        };
        let inst = match self.server.instance_mgr.get(&instance) {
            Some(i) => i,
            None => return Err(RpcError::Custom(format!("unknown instance {:?}", instance))),
        };
        let table = match inst.try_table(af) {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };
        Ok(table
            .snapshot_best_paths()
            .into_iter()
            .map(|(key, path)| RouteSummary {
                prefix: key.to_string(),
                next_hop: path.attr.next_hop,
                origin: format!("{:?}", path.attr.origin),
                as_path: (*path.attr.as_path).to_string(),
                local_pref: path.attr.local_pref,
                med: path.attr.med,
                source: path.source.to_string(),
                peer: path.peer.as_ref().map(|p| p.peer_address),
            })
            .collect())
    }
}

/// Start the `ShowApi` JSON-RPC server over `addr`, returning a handle the
/// caller keeps alive for as long as the RPC surface should stay up
/// (dropping it, or calling `.stop()`, shuts the listener down). Grounded
/// in the teacher's `cli/mod.rs` client-side `HttpClientBuilder` usage,
/// mirrored on the server side.
pub async fn serve_rpc(addr: SocketAddr, server: Arc<Server>) -> Result<HttpServerHandle, RpcError> {
    let rpc_server = HttpServerBuilder::default().build(addr).await?;
    let module = ShowApiImpl::new(server).into_rpc();
    rpc_server.start(module)
}
