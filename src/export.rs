//! Route export / RibOut batching (spec.md §4.2 "Export interface").
//!
//! Grounded in the teacher's `rib/export.rs` (`ExportEntry`/`ExportedUpdate`
//! turning a stored route into outbound wire material) generalized to the
//! spec's per-peer policy hook: BGP peers get extended communities
//! stripped by default, the compute-agent (XMPP-style) transport keeps
//! them so VPN label/RT information survives to the agent.
use std::sync::Arc;

use crate::attr::{AttrDb, AttrValue, CommunityList, Handle};
use crate::route::{Path, Route, RouteKey};

/// What an export decision produced: the attributes and label to send for
/// one route, independent of wire encoding (owned by the session/channel
/// layer). The route key itself is carried alongside by the caller
/// (`export_for_key`), since a bare path has no notion of its own key.
#[derive(Clone)]
pub struct UpdateInfo {
    pub attr: Handle<AttrValue>,
    pub label: Option<u32>,
}

/// Per-peer export policy inputs (spec.md §4.2): whether the destination
/// is a BGP peer (strip ext-communities unless opted back in) or the
/// compute-agent transport (ext-communities preserved), and whether this
/// peer is itself the route's originator (never re-advertise back to the
/// source, BGP split-horizon).
#[derive(Debug, Clone, Copy)]
pub struct ExportContext {
    pub destination_peer_id: Option<u64>,
    pub is_bgp_peer: bool,
    pub keep_ext_communities: bool,
}

/// `export(peer_set, route) -> Option<UpdateInfo>` (spec.md §4.2), reduced
/// to one peer at a time: the caller iterates its peer set and calls this
/// once per peer, matching how `RibOut` batches per-peer updates in the
/// original.
pub fn export(ctx: &ExportContext, db: &AttrDb, route: &Route) -> Option<UpdateInfo> {
    let best = route.best_feasible()?;
    if best.peer.as_ref().map(|p| p.id) == ctx.destination_peer_id {
        return None; // split horizon: never reflect a path back to its source
    }
    export_path(ctx, db, best)
}

/// Same decision as `export`, starting from an already-resolved best path
/// rather than a `Route` — the shape a `RouteListener::on_route_changed`
/// callback has on hand, since the table has already picked the winner.
pub fn export_best(ctx: &ExportContext, db: &AttrDb, best: &Path) -> Option<UpdateInfo> {
    if best.peer.as_ref().map(|p| p.id) == ctx.destination_peer_id {
        return None;
    }
    export_path(ctx, db, best)
}

fn export_path(ctx: &ExportContext, db: &AttrDb, path: &Path) -> Option<UpdateInfo> {
    let attr = if ctx.is_bgp_peer && !ctx.keep_ext_communities && !path.attr.communities.extended.is_empty() {
        let stripped = CommunityList::new(path.attr.communities.standard.clone(), Vec::new());
        db.replace_communities(&path.attr, stripped)
    } else {
        path.attr.clone()
    };
    Some(UpdateInfo { attr, label: path.label })
}

/// Batches a set of per-route export decisions keyed by their route, used
/// by `RibOut` to coalesce a drain cycle's worth of notifications into one
/// outbound wire batch (spec.md §4.2, §5 "notifications are emitted in
/// that same order" within a partition).
#[derive(Default)]
pub struct RibOutBatch {
    pub updates: Vec<(RouteKey, Option<UpdateInfo>)>,
}

impl RibOutBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: RouteKey, update: Option<UpdateInfo>) {
        self.updates.push((key, update));
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(RouteKey, Option<UpdateInfo>)> {
        std::mem::take(&mut self.updates)
    }
}

/// Per-peer export driven directly off a route key + its resolved route,
/// the shape `Table`'s listener callback actually has on hand.
pub fn export_for_key(
    ctx: &ExportContext,
    db: &AttrDb,
    _key: &RouteKey,
    route: &Route,
) -> Option<UpdateInfo> {
    export(ctx, db, route)
}

#[allow(dead_code)]
fn _assert_arc_send<T: Send + Sync>() {}
#[allow(dead_code)]
fn _assert() {
    _assert_arc_send::<Arc<AttrDb>>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{AsPathSpec, CommunityList, ExtCommunity};
    use crate::route::{PathSource, PeerRef};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    #[test]
    fn test_strip_ext_communities_for_bgp_peer() {
        let db = AttrDb::new();
        let alive = Arc::new(());
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let communities = CommunityList::new(vec![], vec![ExtCommunity::route_target(64512, 100)]);
        let attr = db.replace_communities(&db.new_path(nh), communities);
        let peer = PeerRef::new(1, IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), true, &alive);
        let mut route = Route::new();
        route.add_or_replace(Path::new(Some(peer), 0, PathSource::BgpXmpp, attr));

        let ctx = ExportContext { destination_peer_id: Some(2), is_bgp_peer: true, keep_ext_communities: false };
        let update = export(&ctx, &db, &route).unwrap();
        assert!(update.attr.communities.extended.is_empty());
    }

    #[test]
    fn test_keep_ext_communities_for_xmpp_peer() {
        let db = AttrDb::new();
        let alive = Arc::new(());
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let communities = CommunityList::new(vec![], vec![ExtCommunity::route_target(64512, 100)]);
        let attr = db.replace_communities(&db.new_path(nh), communities);
        let peer = PeerRef::new(1, IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), true, &alive);
        let mut route = Route::new();
        route.add_or_replace(Path::new(Some(peer), 0, PathSource::BgpXmpp, attr));

        let ctx = ExportContext { destination_peer_id: Some(2), is_bgp_peer: false, keep_ext_communities: true };
        let update = export(&ctx, &db, &route).unwrap();
        assert_eq!(update.attr.communities.extended.len(), 1);
    }

    #[test]
    fn test_split_horizon_skips_source_peer() {
        let db = AttrDb::new();
        let alive = Arc::new(());
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let attr = db.new_path(nh);
        let peer = PeerRef::new(1, IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), true, &alive);
        let mut route = Route::new();
        route.add_or_replace(Path::new(Some(peer), 0, PathSource::BgpXmpp, attr));

        let ctx = ExportContext { destination_peer_id: Some(1), is_bgp_peer: true, keep_ext_communities: false };
        assert!(export(&ctx, &db, &route).is_none());
        let _ = AsPathSpec::empty();
    }
}
