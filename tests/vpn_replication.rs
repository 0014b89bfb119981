//! VPN -> VRF replication, end to end through `InstanceMgr`/`RTargetFabric`
//! (spec.md §8 scenario 3): a `vpn-inet` route carrying a matching
//! route-target lands as a secondary `inet` route in the importing
//! instance, preserving label and next-hop.
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;

use bgpd::attr::{AttrDb, CommunityList, ExtCommunity, RouteDistinguisher, RouteTarget};
use bgpd::instance::{InstanceMgr, MASTER_INSTANCE};
use bgpd::route::{AddressFamily, Path, PathSource, PeerRef, RouteKey};

#[tokio::test]
async fn vpn_route_replicates_into_importing_vrf() {
    let db = Arc::new(AttrDb::new());
    let mgr = InstanceMgr::new(db.clone());

    let blue = mgr.create("blue");
    let rt = RouteTarget { asn: 64512, target: 100 };
    mgr.set_import_rt("blue", [rt].into_iter().collect());

    let master = mgr.get(MASTER_INSTANCE).unwrap();
    let vpn_table = master.table(AddressFamily::InetVpn);

    let alive = Arc::new(());
    let peer = PeerRef::new(
        1,
        IpAddr::V4(Ipv4Addr::new(5, 5, 5, 5)),
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
        true,
        &alive,
    );
    let next_hop = IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1));
    let communities = CommunityList::new(vec![], vec![ExtCommunity::from(rt)]);
    let attr = db.replace_communities(&db.new_path(next_hop), communities);

    let rd = RouteDistinguisher::new(64512, 100);
    let key = RouteKey::InetVpn(rd, "10.1.0.0/16".parse::<IpNetwork>().unwrap());
    let path = Path::new(Some(peer), 0, PathSource::BgpXmpp, attr).with_label(20001);
    vpn_table.enqueue_add(key, path);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let inet_table = blue.table(AddressFamily::Inet);
    let best = inet_table.snapshot_best_paths();
    assert_eq!(best.len(), 1);
    let (replicated_key, replicated_path) = &best[0];
    assert_eq!(replicated_key, &RouteKey::Inet("10.1.0.0/16".parse::<IpNetwork>().unwrap()));
    assert_eq!(replicated_path.label, Some(20001));
    assert_eq!(replicated_path.attr.next_hop, next_hop);
    assert!(replicated_path.is_replicated());
}

#[tokio::test]
async fn withdrawing_import_rt_removes_replicated_routes() {
    let db = Arc::new(AttrDb::new());
    let mgr = InstanceMgr::new(db.clone());

    let blue = mgr.create("blue");
    let rt = RouteTarget { asn: 64512, target: 200 };
    mgr.set_import_rt("blue", [rt].into_iter().collect());

    let master = mgr.get(MASTER_INSTANCE).unwrap();
    let vpn_table = master.table(AddressFamily::InetVpn);

    let alive = Arc::new(());
    let peer = PeerRef::new(
        2,
        IpAddr::V4(Ipv4Addr::new(6, 6, 6, 6)),
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 6)),
        true,
        &alive,
    );
    let communities = CommunityList::new(vec![], vec![ExtCommunity::from(rt)]);
    let attr = db.replace_communities(
        &db.new_path(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1))),
        communities,
    );
    let rd = RouteDistinguisher::new(64512, 200);
    let key = RouteKey::InetVpn(rd, "10.2.0.0/16".parse::<IpNetwork>().unwrap());
    vpn_table.enqueue_add(key, Path::new(Some(peer), 0, PathSource::BgpXmpp, attr).with_label(30001));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let inet_table = blue.table(AddressFamily::Inet);
    assert_eq!(inet_table.snapshot_best_paths().len(), 1);

    mgr.set_import_rt("blue", std::collections::HashSet::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(inet_table.snapshot_best_paths().len(), 0);
}
