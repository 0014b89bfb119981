//! Route key, path, and path-selection (spec.md §3, §4.2).
//!
//! `RouteKey` replaces the original's per-family NLRI classes
//! (`InetRoute`, `InetVpnRoute`, `EvpnRoute`, ...) with a closed sum type,
//! per the design notes (spec.md §9): one enum tagged by address family
//! instead of a family-parameterized `Table<AF>` class hierarchy. Each
//! variant carries the bit-exact prefix value spec.md §3 requires.
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use ipnetwork::IpNetwork;

use crate::attr::{AttrValue, Handle, RouteDistinguisher, RouteTarget};

/// Address family tag (spec.md §3). Determines the `RouteKey` shape and
/// the replication rules a route is subject to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    Inet,
    Inet6,
    InetVpn,
    Inet6Vpn,
    Evpn,
    ErmVpn,
    RTarget,
    Enet,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressFamily::Inet => "inet",
            AddressFamily::Inet6 => "inet6",
            AddressFamily::InetVpn => "inet-vpn",
            AddressFamily::Inet6Vpn => "inet6-vpn",
            AddressFamily::Evpn => "evpn",
            AddressFamily::ErmVpn => "erm-vpn",
            AddressFamily::RTarget => "rtarget",
            AddressFamily::Enet => "enet",
        };
        write!(f, "{}", s)
    }
}

/// MAC address, carried by `evpn`/`enet` NLRI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// EVPN NLRI key: MAC plus an optional IP (type-2 MAC/IP advertisement),
/// qualified by an ethernet-tag (spec.md §3 "evpn").
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvpnKey {
    pub ethernet_tag: u32,
    pub mac: MacAddress,
    pub ip: Option<IpAddr>,
}

/// `enet` (layer-2 within an instance) NLRI key: same shape as EVPN's
/// MAC/IP but without an RD component of its own (the instance supplies
/// scoping); kept distinct to match spec.md's family list.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnetKey {
    pub mac: MacAddress,
    pub ip: Option<IpAddr>,
}

/// (Source, Group) key for `erm-vpn` multicast state (spec.md §4.4).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SgKey {
    pub source: IpAddr,
    pub group: IpAddr,
}

impl fmt::Display for SgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.source, self.group)
    }
}

/// The opaque prefix value plus family tag (spec.md §3 "Route key").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteKey {
    Inet(IpNetwork),
    Inet6(IpNetwork),
    InetVpn(RouteDistinguisher, IpNetwork),
    Inet6Vpn(RouteDistinguisher, IpNetwork),
    Evpn(RouteDistinguisher, EvpnKey),
    ErmVpn(RouteDistinguisher, SgKey),
    RTarget(u32, RouteTarget),
    Enet(RouteDistinguisher, EnetKey),
}

impl RouteKey {
    pub fn family(&self) -> AddressFamily {
        match self {
            RouteKey::Inet(_) => AddressFamily::Inet,
            RouteKey::Inet6(_) => AddressFamily::Inet6,
            RouteKey::InetVpn(..) => AddressFamily::InetVpn,
            RouteKey::Inet6Vpn(..) => AddressFamily::Inet6Vpn,
            RouteKey::Evpn(..) => AddressFamily::Evpn,
            RouteKey::ErmVpn(..) => AddressFamily::ErmVpn,
            RouteKey::RTarget(..) => AddressFamily::RTarget,
            RouteKey::Enet(..) => AddressFamily::Enet,
        }
    }

    /// The route-distinguisher a VPN-family key carries, if any. Used by
    /// the multicast tree manager to sort `erm-vpn` forwarders (spec.md
    /// §4.4 step 1) and by replication's export-policy rewrite.
    pub fn route_distinguisher(&self) -> Option<RouteDistinguisher> {
        match self {
            RouteKey::InetVpn(rd, _)
            | RouteKey::Inet6Vpn(rd, _)
            | RouteKey::Evpn(rd, _)
            | RouteKey::ErmVpn(rd, _)
            | RouteKey::Enet(rd, _) => Some(*rd),
            RouteKey::Inet(_) | RouteKey::Inet6(_) | RouteKey::RTarget(..) => None,
        }
    }

    /// The non-VPN key (prefix only, RD stripped) a VPN route replicates
    /// into a VRF's non-vpn table as (spec.md §4.3).
    pub fn strip_rd(&self) -> RouteKey {
        match self {
            RouteKey::InetVpn(_, prefix) => RouteKey::Inet(*prefix),
            RouteKey::Inet6Vpn(_, prefix) => RouteKey::Inet6(*prefix),
            RouteKey::Evpn(_, key) => RouteKey::Evpn(RouteDistinguisher(0), *key),
            RouteKey::ErmVpn(_, sg) => RouteKey::ErmVpn(RouteDistinguisher(0), *sg),
            RouteKey::Enet(_, key) => RouteKey::Enet(RouteDistinguisher(0), *key),
            other => other.clone(),
        }
    }

    /// A stable hash used to pick this key's table partition
    /// (`hash(prefix) mod P`, spec.md §4.2).
    pub fn partition_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::Inet(p) | RouteKey::Inet6(p) => write!(f, "{}", p),
            RouteKey::InetVpn(rd, p) | RouteKey::Inet6Vpn(rd, p) => write!(f, "{}:{}", rd, p),
            RouteKey::Evpn(rd, k) => write!(f, "{}:evpn:{}", rd, k.mac),
            RouteKey::ErmVpn(rd, sg) => write!(f, "{}:{}", rd, sg),
            RouteKey::RTarget(asn, rt) => write!(f, "{}:{}", asn, rt),
            RouteKey::Enet(rd, k) => write!(f, "{}:enet:{}", rd, k.mac),
        }
    }
}

/// Ordered preference tag a path carries (spec.md §3, §4.2 step 2).
/// `Local > StaticRoute > ServiceChain > BgpXmpp`; a smaller discriminant
/// sorts first (preferred) to match `PathCompare`'s "lower wins".
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSource {
    Local = 0,
    StaticRoute = 1,
    ServiceChain = 2,
    BgpXmpp = 3,
    Aggregate = 4,
}

impl fmt::Display for PathSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PathSource::Local => "Local",
            PathSource::StaticRoute => "StaticRoute",
            PathSource::ServiceChain => "ServiceChain",
            PathSource::BgpXmpp => "BGP_XMPP",
            PathSource::Aggregate => "Aggregate",
        };
        write!(f, "{}", s)
    }
}

/// Minimal hand-rolled bitset, in lieu of pulling in the `bitflags` crate
/// for a six-bit set the corpus has no other use for.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Hash)]
        pub struct $name($ty);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub fn contains(&self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            pub fn intersects(&self, other: Self) -> bool {
                (self.0 & other.0) != 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }
        }
    };
}

bitflags_lite! {
    /// Path feasibility/lifecycle flags (spec.md §3).
    pub struct PathFlags: u8 {
        const AS_PATH_LOOPED = 0b0000_0001;
        const NO_NEIGHBOR_AS = 0b0000_0010;
        const STALE          = 0b0000_0100;
        const LLGR_STALE     = 0b0000_1000;
        const NO_TUNNEL_ENCAP = 0b0001_0000;
        const IS_REPLICATED  = 0b0010_0000;
    }
}

/// A weak, lookup-style reference to the peer that originated a path
/// (spec.md §9 design notes): never an owning reference, so peer
/// destruction never needs to walk live paths to drop them — it walks its
/// own membership set and issues explicit withdrawals instead
/// (`PeerCloseManager`, spec.md §4.6).
#[derive(Clone)]
pub struct PeerRef {
    pub id: u64,
    pub router_id: IpAddr,
    pub peer_address: IpAddr,
    pub is_ebgp: bool,
    alive: Weak<()>,
}

impl PeerRef {
    pub fn new(id: u64, router_id: IpAddr, peer_address: IpAddr, is_ebgp: bool, alive: &Arc<()>) -> Self {
        Self {
            id,
            router_id,
            peer_address,
            is_ebgp,
            alive: Arc::downgrade(alive),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

impl fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerRef({}, {})", self.id, self.peer_address)
    }
}

static NEXT_PATH_SEQ: AtomicU64 = AtomicU64::new(1);

/// One candidate path for a route (spec.md §3).
#[derive(Clone)]
pub struct Path {
    pub peer: Option<PeerRef>,
    pub path_id: u32,
    pub source: PathSource,
    pub attr: Handle<AttrValue>,
    pub flags: PathFlags,
    pub label: Option<u32>,
    /// Back-reference to the (instance, family, key) a secondary/replicated
    /// path was created from (spec.md §4.2 "Replication").
    pub replicated_from: Option<(String, AddressFamily, RouteKey)>,
    /// Monotonic insertion sequence, used only to break remaining ties in a
    /// way that is still deterministic (never part of `PathCompare` itself).
    seq: u64,
}

impl Path {
    pub fn new(
        peer: Option<PeerRef>,
        path_id: u32,
        source: PathSource,
        attr: Handle<AttrValue>,
    ) -> Self {
        Self {
            peer,
            path_id,
            source,
            attr,
            flags: PathFlags::empty(),
            label: None,
            replicated_from: None,
            seq: NEXT_PATH_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    pub fn with_flags(mut self, flags: PathFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_label(mut self, label: u32) -> Self {
        self.label = Some(label);
        self
    }

    /// spec.md §3: "A path is feasible iff flags & (AsPathLooped|
    /// NoNeighborAs|NoTunnelEncap) == 0".
    pub fn is_feasible(&self) -> bool {
        !self.flags.intersects(
            PathFlags::AS_PATH_LOOPED | PathFlags::NO_NEIGHBOR_AS | PathFlags::NO_TUNNEL_ENCAP,
        )
    }

    pub fn is_replicated(&self) -> bool {
        self.flags.contains(PathFlags::IS_REPLICATED)
    }

    pub fn is_stale(&self) -> bool {
        self.flags.contains(PathFlags::STALE)
    }

    pub fn is_llgr_stale(&self) -> bool {
        self.flags.contains(PathFlags::LLGR_STALE)
    }

    /// Identity used by replication's de-duplication rule (spec.md §4.2):
    /// "same source (table, route), peer, path-id, source-tag".
    pub fn replication_identity(&self) -> (Option<u64>, u32, PathSource) {
        (self.peer.as_ref().map(|p| p.id), self.path_id, self.source)
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("peer", &self.peer)
            .field("path_id", &self.path_id)
            .field("source", &self.source)
            .field("flags", &self.flags)
            .field("label", &self.label)
            .finish()
    }
}

/// Strict total ordering over two paths, spec.md §4.2: lower `Ordering`
/// (`Less`) means `a` is preferred over `b`. Step 12 (ECMP) is handled
/// separately by `ecmp_equal` since it needs caller opt-in; this function
/// implements steps 1-11 plus the next-hop tie break.
pub fn path_compare(a: &Path, b: &Path) -> Ordering {
    // Stale/LlgrStale deprioritization (spec.md §4.5, §8 scenario 5): a
    // path a peer hasn't refreshed since a graceful-restart close is kept
    // in the list but never outranks a fresh one. Checked ahead of the
    // 12-step list proper since it reflects session health, not path
    // attributes.
    match stale_rank(a).cmp(&stale_rank(b)) {
        Ordering::Equal => {}
        other => return other,
    }
    // 1. locally-originated (no peer) beats received.
    match (a.peer.is_none(), b.peer.is_none()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    // 2. path source tag.
    match a.source.cmp(&b.source) {
        Ordering::Equal => {}
        other => return other,
    }
    // 3. local-preference, higher wins -> invert.
    match b.attr.local_pref.cmp(&a.attr.local_pref) {
        Ordering::Equal => {}
        other => return other,
    }
    // 4. AS-path length, shorter wins.
    match a.attr.as_path.path_length().cmp(&b.attr.as_path.path_length()) {
        Ordering::Equal => {}
        other => return other,
    }
    // 5. origin: IGP < EGP < INCOMPLETE.
    match origin_rank(a.attr.origin).cmp(&origin_rank(b.attr.origin)) {
        Ordering::Equal => {}
        other => return other,
    }
    // 6. MED, only when left-most AS matches.
    let left_most_matches = match (a.attr.as_path.leftmost_asn(), b.attr.as_path.leftmost_asn()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    };
    if left_most_matches {
        match a.attr.med.unwrap_or(0).cmp(&b.attr.med.unwrap_or(0)) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    // 7. eBGP beats iBGP.
    let a_ebgp = a.peer.as_ref().map(|p| p.is_ebgp).unwrap_or(false);
    let b_ebgp = b.peer.as_ref().map(|p| p.is_ebgp).unwrap_or(false);
    match b_ebgp.cmp(&a_ebgp) {
        Ordering::Equal => {}
        other => return other,
    }
    // 8. originator-id (lower wins) then cluster-list length (shorter wins).
    match a.attr.originator_id.cmp(&b.attr.originator_id) {
        Ordering::Equal => {}
        other => return other,
    }
    match a.attr.cluster_list.len().cmp(&b.attr.cluster_list.len()) {
        Ordering::Equal => {}
        other => return other,
    }
    // 9. peer router-id, lower wins.
    let a_rid = a.peer.as_ref().map(|p| p.router_id);
    let b_rid = b.peer.as_ref().map(|p| p.router_id);
    match a_rid.cmp(&b_rid) {
        Ordering::Equal => {}
        other => return other,
    }
    // 10. peer address, lower wins.
    let a_addr = a.peer.as_ref().map(|p| p.peer_address);
    let b_addr = b.peer.as_ref().map(|p| p.peer_address);
    match a_addr.cmp(&b_addr) {
        Ordering::Equal => {}
        other => return other,
    }
    // 11. path-id, lower wins.
    match a.path_id.cmp(&b.path_id) {
        Ordering::Equal => {}
        other => return other,
    }
    // Deterministic fallback: next-hop, then insertion order.
    match a.attr.next_hop.cmp(&b.attr.next_hop) {
        Ordering::Equal => a.seq.cmp(&b.seq),
        other => other,
    }
}

/// 0 = fresh, 1 = GR-stale, 2 = LLGR-stale (demoted further still, per
/// spec.md §4.5 "demotes stale paths in path selection").
fn stale_rank(p: &Path) -> u8 {
    if p.is_llgr_stale() {
        2
    } else if p.is_stale() {
        1
    } else {
        0
    }
}

fn origin_rank(origin: bgp_rs::Origin) -> u8 {
    match origin {
        bgp_rs::Origin::IGP => 0,
        bgp_rs::Origin::EGP => 1,
        bgp_rs::Origin::INCOMPLETE => 2,
    }
}

/// spec.md §4.2 step 12: "when `allow_ecmp` is requested by the caller and
/// the two paths are equal through step 11 modulo next-hop, report
/// 'equal'". Two paths are ECMP-equal when everything `path_compare`
/// checks through step 11 ties (ignoring the next-hop fallback it uses to
/// break that tie deterministically).
pub fn ecmp_equal(a: &Path, b: &Path) -> bool {
    if a.peer.is_none() != b.peer.is_none() {
        return false;
    }
    if stale_rank(a) != stale_rank(b) {
        return false;
    }
    a.source == b.source
        && a.attr.local_pref == b.attr.local_pref
        && a.attr.as_path.path_length() == b.attr.as_path.path_length()
        && a.attr.origin == b.attr.origin
        && a.attr.med == b.attr.med
        && a.peer.as_ref().map(|p| p.is_ebgp) == b.peer.as_ref().map(|p| p.is_ebgp)
        && a.attr.originator_id == b.attr.originator_id
        && a.attr.cluster_list.len() == b.attr.cluster_list.len()
        && a.peer.as_ref().map(|p| p.router_id) == b.peer.as_ref().map(|p| p.router_id)
        && a.peer.as_ref().map(|p| p.peer_address) == b.peer.as_ref().map(|p| p.peer_address)
        && a.path_id == b.path_id
}

/// A route: an (implicit prefix, path-list) pair. The prefix/key itself is
/// the table's `HashMap` key; `Route` only owns the sorted path list
/// (spec.md §3 "Route").
#[derive(Default)]
pub struct Route {
    paths: Vec<Path>,
}

impl Route {
    pub fn new() -> Self {
        Self { paths: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    /// The head of the sorted list: `r.best() == r.paths[0]` (spec.md §8).
    pub fn best(&self) -> Option<&Path> {
        self.paths.first()
    }

    pub fn best_feasible(&self) -> Option<&Path> {
        self.paths.iter().find(|p| p.is_feasible())
    }

    /// Insert/replace, keeping the list sorted by `path_compare`
    /// (spec.md §4.2). Replaces any existing path with the same
    /// (peer id, path-id) identity.
    pub fn add_or_replace(&mut self, path: Path) {
        let identity = (path.peer.as_ref().map(|p| p.id), path.path_id);
        self.paths
            .retain(|p| (p.peer.as_ref().map(|x| x.id), p.path_id) != identity);
        let pos = self
            .paths
            .binary_search_by(|existing| path_compare(existing, &path))
            .unwrap_or_else(|e| e);
        self.paths.insert(pos, path);
    }

    /// Remove the path matching (peer id, path-id); returns it if present.
    pub fn remove(&mut self, peer_id: Option<u64>, path_id: u32) -> Option<Path> {
        let idx = self
            .paths
            .iter()
            .position(|p| p.peer.as_ref().map(|x| x.id) == peer_id && p.path_id == path_id)?;
        Some(self.paths.remove(idx))
    }

    /// Remove every path whose `replicated_from` matches `source`, used by
    /// replication's RT-removal withdrawal (spec.md §4.3).
    pub fn remove_replicated_from(&mut self, source: &(String, AddressFamily, RouteKey)) -> bool {
        let before = self.paths.len();
        self.paths.retain(|p| p.replicated_from.as_ref() != Some(source));
        self.paths.len() != before
    }

    pub fn mark_peer_stale(&mut self, peer_id: u64, llgr: bool) {
        for p in self.paths.iter_mut() {
            if p.peer.as_ref().map(|x| x.id) == Some(peer_id) {
                if llgr {
                    p.flags.insert(PathFlags::LLGR_STALE);
                } else {
                    p.flags.insert(PathFlags::STALE);
                }
            }
        }
        self.resort();
    }

    pub fn clear_stale(&mut self, peer_id: u64, path_id: u32) {
        if let Some(p) = self
            .paths
            .iter_mut()
            .find(|p| p.peer.as_ref().map(|x| x.id) == Some(peer_id) && p.path_id == path_id)
        {
            p.flags.remove(PathFlags::STALE);
            p.flags.remove(PathFlags::LLGR_STALE);
        }
        self.resort();
    }

    pub fn remove_peer(&mut self, peer_id: u64) -> usize {
        let before = self.paths.len();
        self.paths
            .retain(|p| p.peer.as_ref().map(|x| x.id) != Some(peer_id));
        before - self.paths.len()
    }

    /// Remove only the *still-stale* paths a peer contributed, leaving any
    /// paths it already refreshed (cleared via `clear_stale`) untouched
    /// (spec.md §4.5 GR stale-timer expiry: "paths not re-learned by
    /// stale-timer expiry are deleted").
    pub fn remove_stale_for_peer(&mut self, peer_id: u64) -> usize {
        let before = self.paths.len();
        self.paths.retain(|p| {
            !(p.peer.as_ref().map(|x| x.id) == Some(peer_id)
                && (p.flags.contains(PathFlags::STALE) || p.flags.contains(PathFlags::LLGR_STALE)))
        });
        before - self.paths.len()
    }

    fn resort(&mut self) {
        self.paths.sort_by(path_compare);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrDb;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn peer(id: u64, router_id: u8, is_ebgp: bool, alive: &Arc<()>) -> PeerRef {
        PeerRef::new(
            id,
            IpAddr::V4(Ipv4Addr::new(router_id, router_id, router_id, router_id)),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, router_id)),
            is_ebgp,
            alive,
        )
    }

    #[test]
    fn test_best_path_by_local_pref() {
        let db = AttrDb::new();
        let alive = Arc::new(());
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let attr_a = db.replace_local_pref(&db.new_path(nh), 100);
        let attr_b = db.replace_local_pref(&db.new_path(nh), 200);

        let mut route = Route::new();
        route.add_or_replace(Path::new(Some(peer(1, 1, true, &alive)), 0, PathSource::BgpXmpp, attr_a));
        route.add_or_replace(Path::new(Some(peer(2, 2, true, &alive)), 0, PathSource::BgpXmpp, attr_b.clone()));

        let best = route.best().unwrap();
        assert_eq!(best.attr.local_pref, 200);

        route.remove(Some(2), 0);
        let best = route.best().unwrap();
        assert_eq!(best.attr.local_pref, 100);
    }

    #[test]
    fn test_local_origin_beats_received() {
        let db = AttrDb::new();
        let alive = Arc::new(());
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let local_attr = db.replace_local_pref(&db.new_path(nh), 50);
        let peer_attr = db.replace_local_pref(&db.new_path(nh), 500);

        let mut route = Route::new();
        route.add_or_replace(Path::new(None, 0, PathSource::StaticRoute, local_attr));
        route.add_or_replace(Path::new(Some(peer(1, 1, true, &alive)), 0, PathSource::BgpXmpp, peer_attr));

        assert!(route.best().unwrap().peer.is_none());
    }

    #[test]
    fn test_infeasible_path_is_skipped_for_best_feasible() {
        let db = AttrDb::new();
        let alive = Arc::new(());
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let attr = db.replace_local_pref(&db.new_path(nh), 500);

        let mut route = Route::new();
        let looped = Path::new(Some(peer(1, 1, true, &alive)), 0, PathSource::BgpXmpp, attr.clone())
            .with_flags(PathFlags::AS_PATH_LOOPED);
        route.add_or_replace(looped);
        let attr2 = db.replace_local_pref(&db.new_path(nh), 100);
        route.add_or_replace(Path::new(Some(peer(2, 2, true, &alive)), 0, PathSource::BgpXmpp, attr2));

        assert!(!route.best().unwrap().is_feasible());
        assert_eq!(route.best_feasible().unwrap().attr.local_pref, 100);
    }

    #[test]
    fn test_stale_marking_and_clear() {
        let db = AttrDb::new();
        let alive = Arc::new(());
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let attr = db.new_path(nh);

        let mut route = Route::new();
        route.add_or_replace(Path::new(Some(peer(1, 1, true, &alive)), 0, PathSource::BgpXmpp, attr));
        route.mark_peer_stale(1, false);
        assert!(route.best().unwrap().is_stale());
        route.clear_stale(1, 0);
        assert!(!route.best().unwrap().is_stale());
    }

    #[test]
    fn test_stale_path_is_demoted_below_fresh_path() {
        let db = AttrDb::new();
        let alive = Arc::new(());
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let stale_attr = db.replace_local_pref(&db.new_path(nh), 500);
        let fresh_attr = db.replace_local_pref(&db.new_path(nh), 50);

        let mut route = Route::new();
        let stale = Path::new(Some(peer(1, 1, true, &alive)), 0, PathSource::BgpXmpp, stale_attr)
            .with_flags(PathFlags::STALE);
        route.add_or_replace(stale);
        route.add_or_replace(Path::new(Some(peer(2, 2, true, &alive)), 0, PathSource::BgpXmpp, fresh_attr));

        // Fresh path wins despite its much lower local-pref.
        assert!(!route.best().unwrap().is_stale());
        assert_eq!(route.best().unwrap().attr.local_pref, 50);
    }
}
