//! Routing instance manager and route-target fabric (spec.md §4.3).
//!
//! Grounded in the teacher's `config/mod.rs` `ServerConfig`/`PeerConfig`
//! (which instance/peer-set relationships a config event produces) folded
//! together with the design notes' closed-sum-type approach: an `Instance`
//! owns one `Table` per configured family plus its RT sets, and
//! `RTargetFabric` is a `RouteListener` registered on the `master`
//! instance's VPN-family tables that fans matching routes out to every
//! importing instance's corresponding non-VPN table.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::attr::{AttrDb, CommunityList, RouteTarget};
use crate::export::{export_for_key, ExportContext};
use crate::route::{AddressFamily, Path, PathFlags, PathSource, Route, RouteKey};
use crate::table::{RouteListener, Table};

/// The distinguished instance name holding the `rtarget` table and acting
/// as the peering domain (spec.md §4.3).
pub const MASTER_INSTANCE: &str = "master";

/// A named VRF: import/export RT sets, one table per configured address
/// family (spec.md §3 "Routing instance").
pub struct Instance {
    pub name: String,
    pub virtual_network_index: Option<u32>,
    tables: Mutex<HashMap<AddressFamily, Arc<Table>>>,
    import_rt: Mutex<HashSet<RouteTarget>>,
    export_rt: Mutex<HashSet<RouteTarget>>,
}

impl Instance {
    fn new(name: impl Into<String>, virtual_network_index: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            virtual_network_index,
            tables: Mutex::new(HashMap::new()),
            import_rt: Mutex::new(HashSet::new()),
            export_rt: Mutex::new(HashSet::new()),
        })
    }

    pub fn table(&self, family: AddressFamily) -> Arc<Table> {
        self.tables
            .lock()
            .unwrap()
            .entry(family)
            .or_insert_with(|| Table::new(family, self.name.clone()))
            .clone()
    }

    pub fn try_table(&self, family: AddressFamily) -> Option<Arc<Table>> {
        self.tables.lock().unwrap().get(&family).cloned()
    }

    pub fn families(&self) -> Vec<AddressFamily> {
        self.tables.lock().unwrap().keys().copied().collect()
    }

    pub fn import_rt_set(&self) -> HashSet<RouteTarget> {
        self.import_rt.lock().unwrap().clone()
    }

    pub fn export_rt_set(&self) -> HashSet<RouteTarget> {
        self.export_rt.lock().unwrap().clone()
    }
}

/// The non-VPN family a VPN family replicates into inside an importing
/// instance (spec.md §4.3): the RD is dropped, the instance itself
/// provides the scoping the RD used to.
fn vpn_counterpart(family: AddressFamily) -> Option<AddressFamily> {
    match family {
        AddressFamily::InetVpn => Some(AddressFamily::Inet),
        AddressFamily::Inet6Vpn => Some(AddressFamily::Inet6),
        AddressFamily::Evpn => Some(AddressFamily::Enet),
        AddressFamily::ErmVpn => Some(AddressFamily::ErmVpn),
        _ => None,
    }
}

/// Dispatches routes learned in `master` into importing instances based on
/// extended-community route-target matches (spec.md §4.3).
pub struct RTargetFabric {
    /// RT -> set of instance names that import it.
    importers: Mutex<HashMap<RouteTarget, HashSet<String>>>,
    instances: Arc<Mutex<HashMap<String, Arc<Instance>>>>,
    attr_db: Arc<AttrDb>,
}

impl RTargetFabric {
    fn new(instances: Arc<Mutex<HashMap<String, Arc<Instance>>>>, attr_db: Arc<AttrDb>) -> Arc<Self> {
        Arc::new(Self {
            importers: Mutex::new(HashMap::new()),
            instances,
            attr_db,
        })
    }

    /// Recompute which instances import which RTs when `instance`'s
    /// import-RT set changes; walk source tables for added RTs, withdraw
    /// for removed ones (spec.md §4.3 "Operation").
    pub fn update_import_rt(&self, instance: &str, old: &HashSet<RouteTarget>, new: &HashSet<RouteTarget>) {
        let added: Vec<RouteTarget> = new.difference(old).copied().collect();
        let removed: Vec<RouteTarget> = old.difference(new).copied().collect();

        {
            let mut importers = self.importers.lock().unwrap();
            for rt in &added {
                importers.entry(*rt).or_default().insert(instance.to_string());
            }
            for rt in &removed {
                if let Some(set) = importers.get_mut(rt) {
                    set.remove(instance);
                }
            }
        }

        for rt in &added {
            self.replicate_matching_routes(*rt, instance);
        }
        for rt in &removed {
            self.withdraw_matching_routes(*rt, instance);
        }
    }

    fn master(&self) -> Option<Arc<Instance>> {
        self.instances.lock().unwrap().get(MASTER_INSTANCE).cloned()
    }

    /// Walk every VPN-family table in `master` for routes carrying `rt`
    /// and inject a secondary path into `instance`'s matching table.
    fn replicate_matching_routes(&self, rt: RouteTarget, instance: &str) {
        let master = match self.master() {
            Some(m) => m,
            None => return,
        };
        let dest = match self.instances.lock().unwrap().get(instance).cloned() {
            Some(i) => i,
            None => return,
        };
        for family in [AddressFamily::InetVpn, AddressFamily::Inet6Vpn, AddressFamily::Evpn, AddressFamily::ErmVpn] {
            let src_table = match master.try_table(family) {
                Some(t) => t,
                None => continue,
            };
            let dest_family = match vpn_counterpart(family) {
                Some(f) => f,
                None => continue,
            };
            let dest_table = dest.table(dest_family);
            for (key, best) in src_table.snapshot_best_paths() {
                if best.attr.communities.contains_route_target(rt) {
                    self.inject_replica(&family, &key, &best, &dest, &dest_table, dest_family);
                }
            }
        }
    }

    fn withdraw_matching_routes(&self, rt: RouteTarget, instance: &str) {
        let master = match self.master() {
            Some(m) => m,
            None => return,
        };
        let dest = match self.instances.lock().unwrap().get(instance).cloned() {
            Some(i) => i,
            None => return,
        };
        for family in [AddressFamily::InetVpn, AddressFamily::Inet6Vpn, AddressFamily::Evpn, AddressFamily::ErmVpn] {
            let src_table = match master.try_table(family) {
                Some(t) => t,
                None => continue,
            };
            let dest_family = match vpn_counterpart(family) {
                Some(f) => f,
                None => continue,
            };
            let dest_table = dest.table(dest_family);
            for (key, best) in src_table.snapshot_best_paths() {
                if best.attr.communities.contains_route_target(rt) {
                    let dest_key = key.strip_rd();
                    dest_table.enqueue_delete(dest_key, best.peer.as_ref().map(|p| p.id), best.path_id);
                }
            }
        }
        let _ = instance;
    }

    /// Build and enqueue the secondary path (spec.md §4.2 "Replication").
    /// De-duplication against an existing identical secondary path is left
    /// to `Route::add_or_replace`'s identity-based replace semantics,
    /// which already treats same (peer, path-id) as a replace, not a
    /// duplicate insert — matching the spec's no-op/replace rule.
    fn inject_replica(
        &self,
        src_family: &AddressFamily,
        src_key: &RouteKey,
        source_best: &Path,
        _dest: &Arc<Instance>,
        dest_table: &Arc<Table>,
        _dest_family: AddressFamily,
    ) {
        let dest_key = src_key.strip_rd();
        let mut replica = source_best.clone();
        replica.flags.insert(PathFlags::IS_REPLICATED);
        // LLGR/Stale propagation is ANDed across instances of the same RT
        // (spec.md Open Question 2, resolved in SPEC_FULL.md): the flag is
        // already set on `source_best` if the origin was stale, so simply
        // carrying it over here satisfies that rule.
        replica.replicated_from = Some((MASTER_INSTANCE.to_string(), *src_family, src_key.clone()));
        debug!(
            "replicate {} {} -> {} {}",
            src_family, src_key, dest_table.instance, dest_key
        );
        dest_table.enqueue_add(dest_key, replica);
        let _ = &self.attr_db;
    }
}

impl RouteListener for RTargetFabric {
    fn on_route_changed(&self, family: AddressFamily, key: &RouteKey, best: Option<&Path>) {
        let best = match best {
            Some(p) => p,
            None => return, // withdrawal notifications are handled by update_import_rt's explicit delete
        };
        if best.is_replicated() {
            return; // secondary paths never replicate further (spec.md §4.2)
        }
        let dest_family = match vpn_counterpart(family) {
            Some(f) => f,
            None => return,
        };
        let targets: Vec<RouteTarget> = best.attr.communities.route_targets().collect();
        if targets.is_empty() {
            return;
        }
        let importers = self.importers.lock().unwrap();
        let mut dests: HashSet<String> = HashSet::new();
        for rt in &targets {
            if let Some(set) = importers.get(rt) {
                dests.extend(set.iter().cloned());
            }
        }
        drop(importers);
        let instances = self.instances.lock().unwrap();
        for dest_name in dests {
            if let Some(dest) = instances.get(&dest_name) {
                let dest_table = dest.table(dest_family);
                self.inject_replica(&family, key, best, dest, &dest_table, dest_family);
            }
        }
    }
}

/// Owns the set of `Instance`s by name, the `master` instance, and the
/// `RTargetFabric` wired to replicate across them (spec.md §4.3).
pub struct InstanceMgr {
    instances: Arc<Mutex<HashMap<String, Arc<Instance>>>>,
    pub fabric: Arc<RTargetFabric>,
    attr_db: Arc<AttrDb>,
}

impl InstanceMgr {
    pub fn new(attr_db: Arc<AttrDb>) -> Arc<Self> {
        let instances = Arc::new(Mutex::new(HashMap::new()));
        let fabric = RTargetFabric::new(instances.clone(), attr_db.clone());
        let mgr = Arc::new(Self { instances, fabric, attr_db });
        let master = mgr.create(MASTER_INSTANCE);
        master.table(AddressFamily::RTarget);
        // Register the fabric on every VPN-family table master can carry so
        // replication is live the instant a route lands, rather than only
        // on the next explicit import-RT change (spec.md §4.3).
        for family in [
            AddressFamily::InetVpn,
            AddressFamily::Inet6Vpn,
            AddressFamily::Evpn,
            AddressFamily::ErmVpn,
        ] {
            master.table(family).add_listener(mgr.fabric.clone());
        }
        mgr
    }

    pub fn create(&self, name: impl Into<String>) -> Arc<Instance> {
        self.create_with_vn_index(name, None)
    }

    /// Create (or fetch) an instance, stamping it with `vn_index` the first
    /// time it's created (spec.md §4.3 SUPPLEMENT "virtual_network_index");
    /// a no-op on an already-existing instance, since `Instance` is handed
    /// out as a shared `Arc` once created.
    pub fn create_with_vn_index(&self, name: impl Into<String>, vn_index: Option<u32>) -> Arc<Instance> {
        let name = name.into();
        let mut instances = self.instances.lock().unwrap();
        instances
            .entry(name.clone())
            .or_insert_with(|| Instance::new(name, vn_index))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.lock().unwrap().get(name).cloned()
    }

    pub fn delete(&self, name: &str) -> Option<Arc<Instance>> {
        if name == MASTER_INSTANCE {
            return None; // master is never deleted while the server runs
        }
        self.instances.lock().unwrap().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.instances.lock().unwrap().keys().cloned().collect()
    }

    /// Apply a configuration-driven import-RT set change for `instance`,
    /// triggering the fabric's replicate/withdraw walk (spec.md §4.3).
    pub fn set_import_rt(&self, instance: &str, new_set: HashSet<RouteTarget>) {
        let inst = match self.get(instance) {
            Some(i) => i,
            None => return,
        };
        let old_set = {
            let mut guard = inst.import_rt.lock().unwrap();
            let old = guard.clone();
            *guard = new_set.clone();
            old
        };
        self.fabric.update_import_rt(instance, &old_set, &new_set);
    }

    pub fn set_export_rt(&self, instance: &str, new_set: HashSet<RouteTarget>) {
        if let Some(inst) = self.get(instance) {
            *inst.export_rt.lock().unwrap() = new_set;
        }
    }

    /// A peer's RTarget-NLRI publication into `master` (spec.md §4.3
    /// "when a compute-agent subscribes to an instance"): emits one
    /// RTarget route per target in the instance's import set so the
    /// fabric can discover subscriber peers without an out-of-band
    /// signal.
    pub fn publish_rtarget_subscription(&self, instance: &str, peer_asn: u32, peer_id: u64, peer: &crate::route::PeerRef) {
        let inst = match self.get(instance) {
            Some(i) => i,
            None => return,
        };
        let master = self.create(MASTER_INSTANCE);
        let rtarget_table = master.table(AddressFamily::RTarget);
        for rt in inst.import_rt_set() {
            let key = RouteKey::RTarget(peer_asn, rt);
            let attr = self.attr_db.new_path(peer.peer_address);
            let path = Path::new(Some(peer.clone()), 0, PathSource::BgpXmpp, attr);
            rtarget_table.enqueue_add(key, path);
        }
        let _ = peer_id;
    }

    pub fn withdraw_rtarget_subscription(&self, instance: &str, peer_asn: u32, peer_id: u64) {
        let inst = match self.get(instance) {
            Some(i) => i,
            None => return,
        };
        let master = self.create(MASTER_INSTANCE);
        let rtarget_table = master.table(AddressFamily::RTarget);
        for rt in inst.import_rt_set() {
            let key = RouteKey::RTarget(peer_asn, rt);
            rtarget_table.enqueue_delete(key, Some(peer_id), 0);
        }
    }
}

/// One peer's export decision against one instance's table, the
/// composition point the `Peer`/session layer calls per route-changed
/// notification (spec.md §4.2 "Export interface" wired through an
/// instance rather than operating on a bare `Table`).
pub fn export_route(ctx: &ExportContext, db: &AttrDb, key: &RouteKey, route: &Route) -> Option<crate::export::UpdateInfo> {
    export_for_key(ctx, db, key, route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::ExtCommunity;
    use crate::route::{PathSource, PeerRef};
    use ipnetwork::IpNetwork;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn rd() -> crate::attr::RouteDistinguisher {
        crate::attr::RouteDistinguisher::new(64512, 100)
    }

    #[tokio::test]
    async fn test_vpn_to_vrf_replication() {
        let db = Arc::new(AttrDb::new());
        let mgr = InstanceMgr::new(db.clone());
        let blue = mgr.create("blue");
        mgr.set_import_rt("blue", [RouteTarget { asn: 64512, target: 100 }].into_iter().collect());

        let master = mgr.get(MASTER_INSTANCE).unwrap();
        let vpn_table = master.table(AddressFamily::InetVpn);
        mgr.fabric.on_route_changed(AddressFamily::InetVpn, &RouteKey::Inet(IpNetwork::V4("0.0.0.0/0".parse().unwrap())), None);
        // register fabric on the vpn table so future adds replicate live
        vpn_table.add_listener(mgr.fabric.clone());

        let alive = Arc::new(());
        let peer = PeerRef::new(1, IpAddr::V4(Ipv4Addr::new(5, 5, 5, 5)), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)), true, &alive);
        let communities = CommunityList::new(vec![], vec![ExtCommunity::route_target(64512, 100)]);
        let attr = db.replace_communities(&db.new_path(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1))), communities);
        let key = RouteKey::InetVpn(rd(), "10.1.0.0/16".parse::<IpNetwork>().unwrap());
        let path = Path::new(Some(peer), 0, PathSource::BgpXmpp, attr).with_label(20001);
        vpn_table.enqueue_add(key, path);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let inet_table = blue.table(AddressFamily::Inet);
        let best = inet_table.snapshot_best_paths();
        assert_eq!(best.len(), 1);
        let (k, p) = &best[0];
        assert_eq!(k, &RouteKey::Inet("10.1.0.0/16".parse::<IpNetwork>().unwrap()));
        assert_eq!(p.label, Some(20001));
        assert!(p.is_replicated());
    }
}
