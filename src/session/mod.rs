//! Peer session I/O adapter and wire layer (SPEC_FULL.md §4.7), built
//! around the `fsm::PeerFsm` pure state machine.
mod codec;
pub mod egress;
pub mod families;
pub mod fsm;
mod hold_timer;
pub mod ingest;
mod manager;
mod message_counts;
mod poller;
mod peer;

pub use codec::{MessageCodec, MessageProtocol};
pub use egress::RibOut;
pub use fsm::{Action, Event, PeerFsm, State};
pub use hold_timer::HoldTimer;
pub use ingest::ingest_update;
pub use manager::{PeerSnapshot, SessionManager};
pub use message_counts::MessageCounts;
pub use peer::{reject_extra_transport, Peer, PeerHandle};
pub use poller::{IdlePeer, Poller, PollerEvent, PollerTx};

use std::net::IpAddr;

use bgp_rs::Update;

/// What a completed poll of the session layer produced, for the server's
/// top-level event loop to react to.
#[derive(Debug)]
pub enum SessionUpdate {
    Learned((IpAddr, Update)),
    Ended(Vec<IpAddr>),
}
