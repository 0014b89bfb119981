//! Composition root (SPEC_FULL.md §4.1 "top-level wiring"): owns the
//! listener, the attribute store, the instance/fabric manager, the
//! scheduler and the session manager, and applies `ConfigEvent`s onto
//! them as a running config-driven process.
//!
//! Grounded in the teacher's `bgpd/src/handler.rs` `serve()` (bind a
//! listener, build the peer set from config, spawn the accept loop and
//! the update-drain loop) generalized from a flat peer list to instances,
//! route-target replication, multicast trees and the compute-agent
//! channel this crate adds on top of the teacher's single-table design.
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use crate::api::serve_rpc;
use crate::attr::{AttrDb, Community, CommunityList, ExtCommunity, RouteTarget};
use crate::channel::{Channel, ChannelAttrs, ChannelMessage};
use crate::config::{ConfigEvent, InstanceConfig, ServerConfig, StaticRouteSpec};
use crate::instance::{Instance, InstanceMgr, MASTER_INSTANCE};
use crate::mcast::McastMgr;
use crate::route::{AddressFamily, Path, PathSource, PeerRef, RouteKey};
use crate::scheduler::Scheduler;
use crate::session::families::to_address_family;
use crate::session::{ingest_update, RibOut, SessionManager, SessionUpdate};

/// Default port the `ShowApi` introspection surface listens on, matching
/// `cli::Args`'s own default `--port` for the query client.
pub const DEFAULT_RPC_PORT: u16 = 8080;

/// The compute-agent's standing identity inside one instance: the `id` it
/// subscribed with, a `PeerRef` so its routes get split-horizon/originator
/// bookkeeping like any other path source, and the `Arc<()>` that peer ref
/// is weakly tied to (spec.md §9 design notes on `PeerRef::alive`).
struct AgentSubscription {
    id: u64,
    peer: PeerRef,
    _alive: Arc<()>,
}

/// The whole running speaker: attribute interning, instances + RT fabric,
/// task-group scheduler, peer sessions, plus the RIB-out and multicast
/// listeners wired onto each instance's tables as they come up.
pub struct Server {
    pub attr_db: Arc<AttrDb>,
    pub instance_mgr: Arc<InstanceMgr>,
    pub scheduler: Arc<Scheduler>,
    pub sessions: Arc<SessionManager>,
    rib_outs: Mutex<HashMap<(String, AddressFamily), Arc<RibOut>>>,
    mcast_managers: Mutex<HashMap<String, Arc<McastMgr>>>,
    /// `NeighborConfig.name` -> peer address, so a `ConfigEvent::PeerDown`
    /// (named by config key, not by IP) can find the `SessionManager`
    /// entry to tear down.
    peer_addresses: Mutex<HashMap<String, IpAddr>>,
    agent_subscriptions: Mutex<HashMap<String, AgentSubscription>>,
    next_agent_peer_id: std::sync::atomic::AtomicU64,
}

impl Server {
    /// Bind the shared TCP listener and construct every always-on piece
    /// (attribute store, instance manager + `master`, scheduler, session
    /// manager). No instances or peers exist yet; apply `ConfigEvent`s to
    /// bring them up.
    pub async fn bind(addr: IpAddr, port: u16) -> io::Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionUpdate>)> {
        let listener = TcpListener::bind((addr, port)).await?;
        let attr_db = Arc::new(AttrDb::new());
        let instance_mgr = InstanceMgr::new(attr_db.clone());
        let scheduler = Scheduler::new();
        let (sessions, updates_rx) =
            SessionManager::new(listener, std::time::Duration::from_secs(30), instance_mgr.clone(), scheduler.clone());
        info!("bgpd listening on {}:{}", addr, port);
        let server = Arc::new(Self {
            attr_db,
            instance_mgr,
            scheduler,
            sessions,
            rib_outs: Mutex::new(HashMap::new()),
            mcast_managers: Mutex::new(HashMap::new()),
            peer_addresses: Mutex::new(HashMap::new()),
            agent_subscriptions: Mutex::new(HashMap::new()),
            next_agent_peer_id: std::sync::atomic::AtomicU64::new(1),
        });
        Ok((server, updates_rx))
    }

    /// Apply one `ConfigEvent` (spec.md §6), in whatever order the caller
    /// already arranged (`ServerConfig::events()` orders instances before
    /// the peers referencing them).
    pub async fn apply_event(self: &Arc<Self>, event: ConfigEvent) {
        match event {
            ConfigEvent::InstanceUp(cfg) => self.bring_up_instance(cfg).await,
            ConfigEvent::InstanceDown(name) => {
                self.rib_outs.lock().await.retain(|(instance, _), _| instance != &name);
                self.mcast_managers.lock().await.remove(&name);
                self.instance_mgr.delete(&name);
            }
            ConfigEvent::PeerUp(cfg) => {
                self.peer_addresses.lock().await.insert(cfg.name.clone(), cfg.peer_address);
                self.sessions.add_peer(cfg).await;
            }
            ConfigEvent::PeerDown(name) => {
                let addr = self.peer_addresses.lock().await.remove(&name);
                match addr {
                    Some(addr) => self.sessions.remove_peer(addr).await,
                    None => warn!("PeerDown for unconfigured peer {}", name),
                }
            }
            ConfigEvent::PolicyUpdated(_policy) => {
                // No policy evaluator is in scope (spec.md §1 non-goals):
                // the event is observed so config-replay tests see it
                // acknowledged, but nothing downstream consumes it yet.
            }
        }
    }

    /// Create the instance, wire its RT sets, register a `RibOut` on each
    /// wire-negotiable family's table and a `McastMgr` on its `erm-vpn`
    /// table, then inject any configured static routes.
    async fn bring_up_instance(self: &Arc<Self>, cfg: InstanceConfig) {
        let instance = self.instance_mgr.create_with_vn_index(cfg.name.clone(), cfg.vn_index);
        self.instance_mgr.set_import_rt(&cfg.name, cfg.import_rt_set.clone());
        self.instance_mgr.set_export_rt(&cfg.name, cfg.export_rt_set.clone());

        for family in &cfg.address_families {
            let af = match to_address_family(*family) {
                Some(af) => af,
                None => continue, // VPN/rtarget families are reached through master, not a peer negotiation
            };
            let table = instance.table(af);
            let rib_out = RibOut::new(self.sessions.clone(), self.attr_db.clone(), cfg.name.clone(), af);
            table.add_listener(rib_out.clone());
            self.rib_outs.lock().await.insert((cfg.name.clone(), af), rib_out);
        }

        let mcast_table = instance.table(AddressFamily::ErmVpn);
        let mcast_mgr = McastMgr::new(mcast_table.clone(), self.attr_db.clone(), 4);
        mcast_table.add_listener(mcast_mgr.clone());
        self.mcast_managers.lock().await.insert(cfg.name.clone(), mcast_mgr);

        for route in &cfg.static_routes {
            self.inject_static_route(&instance, route);
        }
        info!("instance {} up ({} static routes)", cfg.name, cfg.static_routes.len());
    }

    fn inject_static_route(&self, instance: &Arc<Instance>, route: &StaticRouteSpec) {
        let (af, key) = match route.prefix {
            ipnetwork::IpNetwork::V4(_) => (AddressFamily::Inet, RouteKey::Inet(route.prefix)),
            ipnetwork::IpNetwork::V6(_) => (AddressFamily::Inet6, RouteKey::Inet6(route.prefix)),
        };
        let mut attr = self.attr_db.new_path(route.next_hop);
        if let Some(local_pref) = route.local_pref {
            attr = self.attr_db.replace_local_pref(&attr, local_pref);
        }
        if !route.communities.is_empty() {
            attr = self.attr_db.replace_communities(&attr, parse_community_strings(&route.communities));
        }
        let path = Path::new(None, 0, PathSource::StaticRoute, attr);
        instance.table(af).enqueue_add(key, path);
    }

    /// Run the session layer's accept/retry loop and drain its learned
    /// updates into the matching instance's tables forever. Intended to be
    /// the last thing `serve()` awaits.
    pub async fn run(self: Arc<Self>, mut updates_rx: mpsc::UnboundedReceiver<SessionUpdate>) {
        tokio::spawn(self.sessions.clone().run());
        while let Some(update) = updates_rx.recv().await {
            match update {
                SessionUpdate::Learned((addr, bgp_update)) => {
                    let context = self.sessions.peer_context(addr).await;
                    let (peer_ref, instance_name) = match context {
                        Some(ctx) => ctx,
                        None => continue, // peer torn down between send and drain
                    };
                    let instance = match self.instance_mgr.get(&instance_name) {
                        Some(inst) => inst,
                        None => continue,
                    };
                    if let Err(err) = ingest_update(&self.attr_db, &instance, &peer_ref, bgp_update) {
                        warn!("ingest error from {}: {}", addr, err);
                    }
                }
                SessionUpdate::Ended(addrs) => {
                    for addr in addrs {
                        info!("session with {} ended", addr);
                    }
                }
            }
        }
    }

    /// Drive one compute-agent `Channel` forever, mapping its decoded
    /// message stream onto instance table/RT-subscription operations
    /// (spec.md §6). Intended to be spawned once per connected agent.
    pub async fn drive_channel(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        while let Some(message) = channel.recv().await {
            match message {
                ChannelMessage::Subscribe { instance, id } => self.agent_subscribe(&instance, id).await,
                ChannelMessage::Unsubscribe { instance } => self.agent_unsubscribe(&instance).await,
                ChannelMessage::AddRoute { instance, prefix, attrs, label } => {
                    self.agent_add_route(&instance, prefix, attrs, label).await
                }
                ChannelMessage::DeleteRoute { instance, prefix } => self.agent_delete_route(&instance, prefix).await,
            }
        }
    }

    async fn agent_subscribe(self: &Arc<Self>, instance: &str, id: u64) {
        let inst = match self.instance_mgr.get(instance) {
            Some(i) => i,
            None => return,
        };
        let peer_id = self.next_agent_peer_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let alive = Arc::new(());
        let router_id = IpAddr::from([0, 0, 0, 0]);
        let peer = PeerRef::new(peer_id, router_id, router_id, false, &alive);
        self.instance_mgr.publish_rtarget_subscription(instance, 0, id, &peer);
        self.agent_subscriptions
            .lock()
            .await
            .insert(instance.to_string(), AgentSubscription { id, peer, _alive: alive });
        let _ = inst;
    }

    async fn agent_unsubscribe(&self, instance: &str) {
        if let Some(sub) = self.agent_subscriptions.lock().await.remove(instance) {
            self.instance_mgr.withdraw_rtarget_subscription(instance, 0, sub.id);
        }
    }

    async fn agent_add_route(&self, instance: &str, prefix: ipnetwork::IpNetwork, attrs: ChannelAttrs, label: Option<u32>) {
        let inst = match self.instance_mgr.get(instance) {
            Some(i) => i,
            None => return,
        };
        let peer = self.agent_subscriptions.lock().await.get(instance).map(|s| s.peer.clone());
        let (af, key) = match prefix {
            ipnetwork::IpNetwork::V4(_) => (AddressFamily::Inet, RouteKey::Inet(prefix)),
            ipnetwork::IpNetwork::V6(_) => (AddressFamily::Inet6, RouteKey::Inet6(prefix)),
        };
        let mut attr = self.attr_db.new_path(attrs.next_hop);
        attr = self.attr_db.replace_local_pref(&attr, attrs.local_pref);
        if attrs.med.is_some() {
            attr = self.attr_db.replace_med(&attr, attrs.med);
        }
        if !attrs.communities.is_empty() {
            attr = self.attr_db.replace_communities(&attr, parse_community_strings(&attrs.communities));
        }
        let mut path = Path::new(peer, 0, PathSource::BgpXmpp, attr);
        if let Some(label) = label {
            path = path.with_label(label);
        }
        inst.table(af).enqueue_add(key, path);
    }

    async fn agent_delete_route(&self, instance: &str, prefix: ipnetwork::IpNetwork) {
        let inst = match self.instance_mgr.get(instance) {
            Some(i) => i,
            None => return,
        };
        let peer_id = self.agent_subscriptions.lock().await.get(instance).map(|s| s.peer.id);
        let (af, key) = match prefix {
            ipnetwork::IpNetwork::V4(_) => (AddressFamily::Inet, RouteKey::Inet(prefix)),
            ipnetwork::IpNetwork::V6(_) => (AddressFamily::Inet6, RouteKey::Inet6(prefix)),
        };
        inst.table(af).enqueue_delete(key, peer_id, 0);
    }
}

/// `RouteTarget`-shaped strings become extended communities; everything
/// else is parsed as a plain (possibly `asn:value`) standard community
/// (spec.md §6 `StaticRouteSpec.communities`/`ChannelAttrs.communities`).
fn parse_community_strings(values: &[String]) -> CommunityList {
    let mut standard = Vec::new();
    let mut extended = Vec::new();
    for value in values {
        if let Ok(rt) = RouteTarget::try_from(value.as_str()) {
            extended.push(ExtCommunity::from(rt));
        } else if let Ok(c) = Community::try_from(value.as_str()) {
            standard.push(c);
        } else {
            warn!("unparseable community {:?}, skipping", value);
        }
    }
    CommunityList::new(standard, extended)
}

/// Bind, apply every event `config` produces in order, start the
/// introspection RPC surface, then run forever — the entry point
/// `main.rs` calls (spec.md §2: instances before peers).
pub async fn serve(addr: IpAddr, port: u16, config: ServerConfig) -> io::Result<()> {
    let (server, updates_rx) = Server::bind(addr, port).await?;
    for event in config.events() {
        server.apply_event(event).await;
    }
    let rpc_addr = std::net::SocketAddr::new(addr, DEFAULT_RPC_PORT);
    match serve_rpc(rpc_addr, server.clone()).await {
        Ok(handle) => {
            info!("show-api listening on {}", rpc_addr);
            // Leak the handle rather than thread it through `run()`'s
            // forever-loop: the RPC listener should live exactly as long
            // as the process does.
            std::mem::forget(handle);
        }
        Err(err) => warn!("show-api failed to start on {}: {}", rpc_addr, err),
    }
    server.run(updates_rx).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NeighborConfig, ProtocolConfig};
    use crate::session::families::Family;
    use bgp_rs::{AFI, SAFI};
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_bring_up_instance_registers_rib_out_and_mcast() {
        let (server, _updates_rx) = Server::bind(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0).await.unwrap();
        let cfg = InstanceConfig {
            name: "blue".into(),
            address_families: vec![Family::new(AFI::IPV4, SAFI::Unicast)],
            ..Default::default()
        };
        server.apply_event(ConfigEvent::InstanceUp(cfg)).await;
        assert!(server.rib_outs.lock().await.contains_key(&("blue".to_string(), AddressFamily::Inet)));
        assert!(server.mcast_managers.lock().await.contains_key("blue"));
        assert!(server.instance_mgr.get("blue").is_some());
    }

    #[tokio::test]
    async fn test_static_route_lands_in_table() {
        let (server, _updates_rx) = Server::bind(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0).await.unwrap();
        let cfg = InstanceConfig {
            name: "blue".into(),
            address_families: vec![Family::new(AFI::IPV4, SAFI::Unicast)],
            static_routes: vec![StaticRouteSpec {
                prefix: "10.9.0.0/16".parse().unwrap(),
                next_hop: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
                local_pref: Some(200),
                communities: vec![],
            }],
            ..Default::default()
        };
        server.apply_event(ConfigEvent::InstanceUp(cfg)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let inst = server.instance_mgr.get("blue").unwrap();
        let best = inst.table(AddressFamily::Inet).snapshot_best_paths();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].1.attr.local_pref, 200);
    }

    #[tokio::test]
    async fn test_peer_up_then_down_by_name() {
        let (server, _updates_rx) = Server::bind(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0).await.unwrap();
        let router_id = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let peer_addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        server
            .apply_event(ConfigEvent::PeerUp(NeighborConfig {
                name: "r2".into(),
                uuid: "r2".into(),
                instance: MASTER_INSTANCE.into(),
                peer_as: 65001,
                peer_address: peer_addr,
                port: 179,
                hold_time: 180,
                local_as: 65000,
                local_identifier: router_id,
                auth_keys: vec![],
                address_families: vec![Family::new(AFI::IPV4, SAFI::Unicast)],
                family_attributes: vec![],
                admin_down: true,
                passive: true,
                as_override: false,
            }))
            .await;
        assert!(server.sessions.peer_snapshot(peer_addr).await.is_some());
        server.apply_event(ConfigEvent::PeerDown("r2".into())).await;
        assert!(server.sessions.peer_snapshot(peer_addr).await.is_none());
        let _ = ProtocolConfig { instance: MASTER_INSTANCE.into(), local_as: 65000, local_identifier: router_id, hold_time: 180, port: 179 };
    }
}
