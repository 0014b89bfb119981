//! Process-wide attribute database: one `Intern` table per sub-attribute
//! kind plus one for the top-level `AttrValue` aggregate, mirroring the
//! original's per-attribute-type `*DB` classes (`PathAttributeDB`,
//! `CommunityDB`, `ExtCommunityDB`, `AsPathDB`) but built on the generic
//! `Intern<T>` primitive instead of one hand-rolled cache per type.
use std::net::IpAddr;

use super::as_path::AsPathSpec;
use super::community::{CommunityList, LabelBlock, RouteDistinguisher};
use super::intern::{Handle, Intern};
use super::value::{AttrValue, Esi, OList, PmsiTunnel};

/// Snapshot of interning-table occupancy, the reduced stand-in for the
/// original's sandesh attribute counters (spec.md §4.1 SUPPLEMENT).
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrDbStats {
    pub attr_count: usize,
    pub as_path_count: usize,
    pub community_count: usize,
    pub olist_count: usize,
}

pub struct AttrDb {
    attrs: Intern<AttrValue>,
    as_paths: Intern<AsPathSpec>,
    communities: Intern<CommunityList>,
    olists: Intern<OList>,
    empty_as_path: Handle<AsPathSpec>,
    empty_communities: Handle<CommunityList>,
}

impl Default for AttrDb {
    fn default() -> Self {
        Self::new()
    }
}

impl AttrDb {
    pub fn new() -> Self {
        let as_paths = Intern::new();
        let communities = Intern::new();
        let empty_as_path = as_paths.locate(AsPathSpec::empty());
        let empty_communities = communities.locate(CommunityList::default());
        Self {
            attrs: Intern::new(),
            as_paths,
            communities,
            olists: Intern::new(),
            empty_as_path,
            empty_communities,
        }
    }

    pub fn locate_as_path(&self, spec: AsPathSpec) -> Handle<AsPathSpec> {
        self.as_paths.locate(spec)
    }

    pub fn locate_communities(&self, list: CommunityList) -> Handle<CommunityList> {
        self.communities.locate(list)
    }

    pub fn locate_olist(&self, olist: OList) -> Handle<OList> {
        self.olists.locate(olist)
    }

    pub fn locate(&self, value: AttrValue) -> Handle<AttrValue> {
        self.attrs.locate(value)
    }

    /// A minimal path attribute value (no AS-path, no communities, default
    /// origin/local-pref), used as the starting point for `replace_*`.
    pub fn new_path(&self, next_hop: IpAddr) -> Handle<AttrValue> {
        let value = AttrValue::bare(
            next_hop,
            self.empty_as_path.clone(),
            self.empty_communities.clone(),
        );
        self.attrs.locate(value)
    }

    pub fn replace_next_hop(&self, attr: &Handle<AttrValue>, next_hop: IpAddr) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.next_hop = next_hop;
        self.attrs.locate(value)
    }

    pub fn replace_local_pref(&self, attr: &Handle<AttrValue>, local_pref: u32) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.local_pref = local_pref;
        self.attrs.locate(value)
    }

    pub fn replace_med(&self, attr: &Handle<AttrValue>, med: Option<u32>) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.med = med;
        self.attrs.locate(value)
    }

    pub fn replace_as_path(&self, attr: &Handle<AttrValue>, as_path: AsPathSpec) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.as_path = self.locate_as_path(as_path);
        self.attrs.locate(value)
    }

    pub fn replace_communities(&self, attr: &Handle<AttrValue>, communities: CommunityList) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.communities = self.locate_communities(communities);
        self.attrs.locate(value)
    }

    pub fn replace_originator_id(&self, attr: &Handle<AttrValue>, id: Option<IpAddr>) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.originator_id = id;
        self.attrs.locate(value)
    }

    pub fn replace_cluster_list(&self, attr: &Handle<AttrValue>, cluster_list: Vec<u32>) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.cluster_list = cluster_list;
        self.attrs.locate(value)
    }

    pub fn replace_source_rd(&self, attr: &Handle<AttrValue>, rd: Option<RouteDistinguisher>) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.source_rd = rd;
        self.attrs.locate(value)
    }

    pub fn replace_esi(&self, attr: &Handle<AttrValue>, esi: Option<Esi>) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.esi = esi;
        self.attrs.locate(value)
    }

    pub fn replace_label_block(&self, attr: &Handle<AttrValue>, block: Option<LabelBlock>) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.label_block = block;
        self.attrs.locate(value)
    }

    pub fn replace_pmsi_tunnel(&self, attr: &Handle<AttrValue>, tunnel: Option<PmsiTunnel>) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.pmsi_tunnel = tunnel;
        self.attrs.locate(value)
    }

    pub fn replace_olist(&self, attr: &Handle<AttrValue>, olist: Option<OList>) -> Handle<AttrValue> {
        let mut value = (**attr).clone();
        value.olist = olist.map(|o| self.locate_olist(o));
        self.attrs.locate(value)
    }

    pub fn stats(&self) -> AttrDbStats {
        AttrDbStats {
            attr_count: self.attrs.len(),
            as_path_count: self.as_paths.len(),
            community_count: self.communities.len(),
            olist_count: self.olists.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_locate_dedups_equal_attribute_sets() {
        let db = AttrDb::new();
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let a = db.new_path(nh);
        let a = db.replace_local_pref(&a, 100);
        let a = db.replace_as_path(&a, AsPathSpec::empty().prepend(65001));

        let b = db.new_path(nh);
        let b = db.replace_local_pref(&b, 100);
        let b = db.replace_as_path(&b, AsPathSpec::empty().prepend(65001));

        assert_eq!(a, b);
        assert_eq!(db.stats().attr_count, 1);
    }

    #[test]
    fn test_distinct_local_pref_distinct_handles() {
        let db = AttrDb::new();
        let nh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let a = db.new_path(nh);
        let a = db.replace_local_pref(&a, 100);
        let b = db.new_path(nh);
        let b = db.replace_local_pref(&b, 200);
        assert_ne!(a, b);
        assert_eq!(db.stats().attr_count, 2);
    }

    #[test]
    fn test_as_path_table_shared_across_attrs() {
        let db = AttrDb::new();
        let nh1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let nh2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let a = db.new_path(nh1);
        let a = db.replace_as_path(&a, AsPathSpec::empty().prepend(65001));
        let b = db.new_path(nh2);
        let b = db.replace_as_path(&b, AsPathSpec::empty().prepend(65001));
        assert_ne!(a, b); // different next-hop => different AttrValue
        assert_eq!(a.as_path, b.as_path); // same canonical AS-path handle
        assert_eq!(db.stats().as_path_count, 2); // empty + [65001]
    }
}
