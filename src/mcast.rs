//! Multicast (*,G) distribution-tree manager (spec.md §4.4).
//!
//! Grounded in `table.rs`'s `RouteListener`/partition-thread design: an
//! `erm-vpn` table's leaves are its routes sharing one `SgKey` but distinct
//! route-distinguishers, one leaf per subscribed forwarder. `McastMgr`
//! registers itself on that table and, whenever a leaf's best path changes,
//! rebuilds the (S,G) entry's k-ary tree deterministically and re-enqueues
//! every leaf with a fresh `BgpOList` of its tree neighbours.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::attr::{AttrDb, ExtCommunity, OList, OListEntry, RouteDistinguisher};
use crate::route::{AddressFamily, Path, RouteKey, SgKey};
use crate::table::{RouteListener, Table};

/// Default encapsulation advertised to a tree neighbour when the leaf's own
/// attributes carry none (RFC 5512 GRE sub-type).
fn default_tunnel_encap() -> ExtCommunity {
    ExtCommunity(u64::from_be_bytes([0x03, 0x0c, 0, 0, 0, 0, 0, 2]))
}

/// One (leaf) forwarder in an (S,G) entry: the route-distinguisher that
/// orders it, the address/label it should be reached at, and the original
/// route key it was learned under (spec.md §4.4 "one `McastForwarder` per
/// route entry").
#[derive(Clone)]
struct McastForwarder {
    key: RouteKey,
    rd: RouteDistinguisher,
    address: IpAddr,
    label: u32,
    tunnel_encap: ExtCommunity,
    path: Path,
}

/// Per-(S,G) tree state: the last rebuilt leaf signature, used to make
/// rebuilds idempotent so re-enqueuing updated olists doesn't recurse
/// (a rebuild's own route-changed notification is a no-op once the leaf
/// set it observes matches what was just built).
struct McastSgEntry {
    last_signature: Vec<RouteDistinguisher>,
}

impl McastSgEntry {
    fn new() -> Self {
        Self { last_signature: Vec::new() }
    }
}

/// Owns one (S,G) distribution-tree manager scoped to a single `erm-vpn`
/// table (spec.md §4.4). One `McastMgr` per instance's multicast table.
pub struct McastMgr {
    table: Arc<Table>,
    attr_db: Arc<AttrDb>,
    degree: usize,
    entries: Mutex<HashMap<SgKey, McastSgEntry>>,
}

impl McastMgr {
    /// `degree` is the tree's branching factor `k` (spec.md §4.4 step 3,
    /// "typical 4").
    pub fn new(table: Arc<Table>, attr_db: Arc<AttrDb>, degree: usize) -> Arc<Self> {
        Arc::new(Self {
            table,
            attr_db,
            degree: degree.max(2),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Forwarders currently subscribed to `sg`, sorted by route-distinguisher
    /// (spec.md §4.4 step 1: "Sort all forwarders by their
    /// route-distinguisher value (stable, total order)").
    fn collect_forwarders(&self, sg: SgKey) -> Vec<McastForwarder> {
        let mut forwarders: Vec<McastForwarder> = self
            .table
            .snapshot_best_paths()
            .into_iter()
            .filter_map(|(key, path)| match &key {
                RouteKey::ErmVpn(rd, leaf_sg) if *leaf_sg == sg => {
                    let tunnel_encap = path
                        .attr
                        .communities
                        .tunnel_encap()
                        .first()
                        .copied()
                        .unwrap_or_else(default_tunnel_encap);
                    let label = path.attr.label_block.map(|b| b.first).or(path.label).unwrap_or(0);
                    Some(McastForwarder {
                        key: key.clone(),
                        rd: *rd,
                        address: path.peer.as_ref().map(|p| p.peer_address).unwrap_or(path.attr.next_hop),
                        label,
                        tunnel_encap,
                        path,
                    })
                }
                _ => None,
            })
            .collect();
        forwarders.sort_by_key(|f| f.rd);
        forwarders
    }

    /// Parent index of `i` in the k-ary heap arrangement (spec.md §4.4
    /// step 3: "the parent of index `i` (for `i >= 1`) is `(i - 1) / k`").
    fn parent_index(&self, i: usize) -> Option<usize> {
        if i == 0 {
            None
        } else {
            Some((i - 1) / self.degree)
        }
    }

    /// Rebuild (or flush) the tree for `sg` and re-enqueue every leaf with
    /// its fresh olist (spec.md §4.4). No-op if the leaf set (by RD) is
    /// unchanged since the last rebuild.
    fn rebuild_sg(&self, sg: SgKey) {
        let forwarders = self.collect_forwarders(sg);
        let signature: Vec<RouteDistinguisher> = forwarders.iter().map(|f| f.rd).collect();

        {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(sg).or_insert_with(McastSgEntry::new);
            if entry.last_signature == signature {
                return;
            }
            entry.last_signature = signature.clone();
        }

        if forwarders.len() <= 1 {
            // spec.md §4.4 "Failure semantics": flush all links, no tree.
            for forwarder in &forwarders {
                self.emit(forwarder, OList::default());
            }
            debug!("mcast {} flushed: {} forwarder(s)", sg, forwarders.len());
            return;
        }

        let n = forwarders.len();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 1..n {
            if let Some(parent) = self.parent_index(i) {
                children[parent].push(i);
            }
        }

        for (i, forwarder) in forwarders.iter().enumerate() {
            let mut neighbours = Vec::new();
            if let Some(parent) = self.parent_index(i) {
                neighbours.push(parent);
            }
            neighbours.extend(children[i].iter().copied());

            let olist = OList(
                neighbours
                    .iter()
                    .map(|&idx| {
                        let neighbour = &forwarders[idx];
                        OListEntry {
                            address: neighbour.address,
                            label: neighbour.label,
                            tunnel_encap: neighbour.tunnel_encap,
                        }
                    })
                    .collect(),
            );
            self.emit(forwarder, olist);
        }
        debug!("mcast {} rebuilt: {} forwarders, degree {}", sg, n, self.degree);
    }

    /// Re-enqueue a leaf with an updated `olist` and allocated label
    /// (spec.md §4.4 step 4: "Emit a new path on every leaf route carrying
    /// a `BgpOList` of its neighbours").
    fn emit(&self, forwarder: &McastForwarder, olist: OList) {
        let attr = self.attr_db.replace_olist(&forwarder.path.attr, Some(olist));
        let mut path = Path::new(
            forwarder.path.peer.clone(),
            forwarder.path.path_id,
            forwarder.path.source,
            attr,
        )
        .with_flags(forwarder.path.flags);
        if forwarder.label != 0 {
            path = path.with_label(forwarder.label);
        }
        self.table.enqueue_add(forwarder.key.clone(), path);
    }
}

impl RouteListener for McastMgr {
    fn on_route_changed(&self, family: AddressFamily, key: &RouteKey, _best: Option<&Path>) {
        if family != AddressFamily::ErmVpn {
            return;
        }
        if let RouteKey::ErmVpn(_, sg) = key {
            self.rebuild_sg(*sg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrDb;
    use crate::route::{PathSource, PeerRef};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn sg() -> SgKey {
        SgKey {
            source: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            group: IpAddr::V4(Ipv4Addr::new(239, 1, 1, 1)),
        }
    }

    fn rd(n: u32) -> RouteDistinguisher {
        RouteDistinguisher::new(64512, n)
    }

    async fn add_forwarder(table: &Table, db: &AttrDb, alive: &Arc<()>, n: u32) {
        let peer = PeerRef::new(
            n as u64,
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, n as u8)),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, n as u8)),
            true,
            alive,
        );
        let attr = db.new_path(IpAddr::V4(Ipv4Addr::new(10, 1, 1, n as u8)));
        let key = RouteKey::ErmVpn(rd(n), sg());
        table.enqueue_add(key, Path::new(Some(peer), 0, PathSource::BgpXmpp, attr));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_seven_forwarder_tree_matches_scenario() {
        let db = Arc::new(AttrDb::new());
        let table = Table::new(AddressFamily::ErmVpn, "default");
        let mgr = McastMgr::new(table.clone(), db.clone(), 4);
        table.add_listener(mgr.clone());

        let alive = Arc::new(());
        for n in 1..=7 {
            add_forwarder(&table, &db, &alive, n).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        // F1 (rd=1) should neighbour F2..F5; F2 should neighbour F6, F7.
        let f1_olist = leaf_olist(&table, 1);
        let mut f1_labels_by_addr: Vec<IpAddr> = f1_olist.0.iter().map(|e| e.address).collect();
        f1_labels_by_addr.sort();
        let mut expected: Vec<IpAddr> = (2..=5).map(|n| IpAddr::V4(Ipv4Addr::new(1, 1, 1, n))).collect();
        expected.sort();
        assert_eq!(f1_labels_by_addr, expected);

        let f2_olist = leaf_olist(&table, 2);
        let mut f2_neighbours: Vec<IpAddr> = f2_olist.0.iter().map(|e| e.address).collect();
        f2_neighbours.sort();
        let mut expected2 = vec![
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 6)),
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 7)),
        ];
        expected2.sort();
        assert_eq!(f2_neighbours, expected2);
    }

    #[tokio::test]
    async fn test_tree_is_deterministic_regardless_of_join_order() {
        let db = Arc::new(AttrDb::new());
        let table = Table::new(AddressFamily::ErmVpn, "default");
        let mgr = McastMgr::new(table.clone(), db.clone(), 4);
        table.add_listener(mgr.clone());

        let alive = Arc::new(());
        for n in [3, 1, 7, 2, 5, 4, 6] {
            add_forwarder(&table, &db, &alive, n).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let f1_olist = leaf_olist(&table, 1);
        let mut neighbours: Vec<IpAddr> = f1_olist.0.iter().map(|e| e.address).collect();
        neighbours.sort();
        let mut expected: Vec<IpAddr> = (2..=5).map(|n| IpAddr::V4(Ipv4Addr::new(1, 1, 1, n))).collect();
        expected.sort();
        assert_eq!(neighbours, expected);
    }

    #[tokio::test]
    async fn test_single_forwarder_flushes_no_tree() {
        let db = Arc::new(AttrDb::new());
        let table = Table::new(AddressFamily::ErmVpn, "default");
        let mgr = McastMgr::new(table.clone(), db.clone(), 4);
        table.add_listener(mgr.clone());

        let alive = Arc::new(());
        add_forwarder(&table, &db, &alive, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let olist = leaf_olist(&table, 1);
        assert!(olist.0.is_empty());
    }

    fn leaf_olist(table: &Table, n: u32) -> OList {
        let key = RouteKey::ErmVpn(rd(n), sg());
        table
            .with_route(&key, |r| r.and_then(|r| r.best().and_then(|p| p.attr.olist.clone())))
            .map(|h| (*h).clone())
            .unwrap_or_default()
    }
}
