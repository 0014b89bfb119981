//! Canonical attribute interning (spec.md §4.1).
mod as_path;
mod community;
mod db;
mod intern;
mod value;

pub use as_path::{AsPathSegment, AsPathSpec};
pub use community::{
    Community, CommunityList, ExtCommunity, ExtCommunityKind, LabelBlock, RouteDistinguisher,
    RouteTarget,
};
pub use db::{AttrDb, AttrDbStats};
pub use intern::{Handle, Intern};
pub use value::{AttrValue, Canonicalize, Esi, OList, OListEntry, PmsiTunnel};
