//! The canonical attribute aggregate and the `Canonicalize` trait that lets
//! a type be turned into (and compared as) an interned `Handle`.
use std::fmt;
use std::net::IpAddr;

use bgp_rs::Origin;
use serde::{Deserialize, Serialize};

use super::community::{CommunityList, ExtCommunity, LabelBlock, RouteDistinguisher};
use super::intern::Handle;
use super::as_path::AsPathSpec;

/// RFC 7432 Ethernet Segment Identifier, carried on EVPN routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Esi(pub [u8; 10]);

/// PMSI tunnel attribute (RFC 6514), needed for multicast VPN NLRI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PmsiTunnel {
    pub tunnel_type: u8,
    pub label: u32,
    pub identifier: u32,
}

/// One neighbour entry in a multicast output-list (spec.md §4.4).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OListEntry {
    pub address: IpAddr,
    pub label: u32,
    pub tunnel_encap: ExtCommunity,
}

/// Per-leaf output list a multicast forwarder attaches to its best path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OList(pub Vec<OListEntry>);

/// The full, canonical set of path attributes a route can carry, with all
/// variable-size sub-fields stored as interned handles so two paths that
/// differ only in, say, next-hop still share one community-list/AS-path
/// object (spec.md §3/§4.1).
#[derive(Clone)]
pub struct AttrValue {
    pub origin: Origin,
    pub next_hop: IpAddr,
    pub local_pref: u32,
    pub med: Option<u32>,
    pub as_path: Handle<AsPathSpec>,
    pub communities: Handle<CommunityList>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<(u32, IpAddr)>,
    pub originator_id: Option<IpAddr>,
    pub cluster_list: Vec<u32>,
    pub source_rd: Option<RouteDistinguisher>,
    pub esi: Option<Esi>,
    pub label_block: Option<LabelBlock>,
    pub pmsi_tunnel: Option<PmsiTunnel>,
    pub olist: Option<Handle<OList>>,
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin
            && self.next_hop == other.next_hop
            && self.local_pref == other.local_pref
            && self.med == other.med
            && self.as_path == other.as_path
            && self.communities == other.communities
            && self.atomic_aggregate == other.atomic_aggregate
            && self.aggregator == other.aggregator
            && self.originator_id == other.originator_id
            && self.cluster_list == other.cluster_list
            && self.source_rd == other.source_rd
            && self.esi == other.esi
            && self.label_block == other.label_block
            && self.pmsi_tunnel == other.pmsi_tunnel
            && self.olist == other.olist
    }
}
impl Eq for AttrValue {}

impl std::hash::Hash for AttrValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Origin has no Hash impl upstream; fold in its discriminant instead.
        std::mem::discriminant(&self.origin).hash(state);
        self.next_hop.hash(state);
        self.local_pref.hash(state);
        self.med.hash(state);
        self.as_path.content_hash().hash(state);
        self.communities.content_hash().hash(state);
        self.atomic_aggregate.hash(state);
        self.aggregator.hash(state);
        self.originator_id.hash(state);
        self.cluster_list.hash(state);
        self.source_rd.hash(state);
        self.esi.hash(state);
        self.label_block.hash(state);
        self.pmsi_tunnel.hash(state);
        self.olist.as_ref().map(|h| h.content_hash()).hash(state);
    }
}

impl fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttrValue")
            .field("origin", &self.origin)
            .field("next_hop", &self.next_hop)
            .field("local_pref", &self.local_pref)
            .field("med", &self.med)
            .field("as_path", &*self.as_path)
            .field("communities", &*self.communities)
            .finish()
    }
}

impl AttrValue {
    /// A bare, attribute-less value built from already-interned empty
    /// sub-attributes; `AttrDb::new_path` is the usual entry point since it
    /// owns the tables those handles come from.
    pub fn bare(next_hop: IpAddr, as_path: Handle<AsPathSpec>, communities: Handle<CommunityList>) -> Self {
        Self {
            origin: Origin::INCOMPLETE,
            next_hop,
            local_pref: 100,
            med: None,
            as_path,
            communities,
            atomic_aggregate: false,
            aggregator: None,
            originator_id: None,
            cluster_list: Vec::new(),
            source_rd: None,
            esi: None,
            label_block: None,
            pmsi_tunnel: None,
            olist: None,
        }
    }
}

/// Types which can be located in (and thus canonicalized by) an `Intern`
/// table. Implemented by every sub-attribute type that `AttrDb` interns
/// independently of the top-level `AttrValue` (spec.md §4.1).
pub trait Canonicalize: Clone + PartialEq + std::hash::Hash {
    fn canonical_default() -> Self;
}

impl Canonicalize for AsPathSpec {
    fn canonical_default() -> Self {
        AsPathSpec::empty()
    }
}

impl Canonicalize for CommunityList {
    fn canonical_default() -> Self {
        CommunityList::default()
    }
}

impl Canonicalize for OList {
    fn canonical_default() -> Self {
        OList::default()
    }
}
