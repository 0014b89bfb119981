//! Introspection RPC surface (SPEC_FULL.md §6): the `#[rpc]`-declared
//! `ShowApi` trait plus its server-side implementation against the real
//! `Server`.
pub mod handler;
pub mod rpc;

pub use handler::{serve_rpc, ShowApiImpl};
pub use rpc::{InstanceSummary, PeerDetail, PeerSummary, RouteSummary, ShowApiServer};
