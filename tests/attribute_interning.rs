//! End-to-end attribute interning coverage (spec.md §8 scenario 1):
//! two equal attribute values located through different call paths must
//! resolve to the same canonical handle, and the DB must carry exactly
//! one entry for them.
use std::net::{IpAddr, Ipv4Addr};

use bgpd::attr::{AsPathSpec, AttrDb};

#[test]
fn locate_dedups_equal_attributes_from_different_paths() {
    let db = AttrDb::new();
    let next_hop = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    // Path A: build up via the mutation primitives, as a decoded UPDATE
    // would (new_path -> replace_local_pref -> replace_as_path).
    let as_path = AsPathSpec::empty().prepend(65001);
    let a = db.replace_as_path(&db.replace_local_pref(&db.new_path(next_hop), 100), as_path.clone());

    // Path B: a independently-constructed but semantically identical
    // value, as if decoded by a different codepath.
    let b = db.replace_as_path(&db.replace_local_pref(&db.new_path(next_hop), 100), as_path);

    assert_eq!(a.local_pref, b.local_pref);
    assert_eq!(a.next_hop, b.next_hop);
    assert_eq!(a.as_path, b.as_path);

    let stats = db.stats();
    assert_eq!(stats.attr_count, 1);
}

#[test]
fn as_path_prepend_is_idempotent_on_leftmost() {
    let path = AsPathSpec::empty().prepend(65001).prepend(65002);
    assert_eq!(path.leftmost_asn(), Some(65002));
    assert!(path.as_left_most_match(65002));
    assert!((1..=2).contains(&path.path_length()));
}

#[test]
fn release_of_last_handle_scrubs_the_db() {
    let db = AttrDb::new();
    let next_hop = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    {
        let _h = db.new_path(next_hop);
        assert_eq!(db.stats().attr_count, 1);
    }
    assert_eq!(db.stats().attr_count, 0);
}
