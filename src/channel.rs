//! Compute-agent pub/sub `Channel` abstraction (spec.md §6).
//!
//! The core's transport requirement is deliberately thin: send bytes,
//! receive a decoded inbound message, get told about blocked writes and
//! open/close. The pub/sub transport itself (XMPP or otherwise) is out of
//! scope (spec.md §1 non-goals); this module is the seam plus an in-memory
//! test double, grounded in how the teacher tests its own wire layer
//! (`session/codec.rs`'s tests push raw byte buffers through the codec
//! rather than standing up a live socket).
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnetwork::IpNetwork;

/// Result of a `Channel::send`: either the bytes were accepted, or the
/// transport is backpressured and the caller must wait for `write_ready`
/// before sending more (spec.md §4.5 "Send-blocked backpressure").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    Blocked,
}

/// Attributes carried on an `add_route` message, reduced to the fields a
/// compute-agent actually advertises — a flattened view of `AttrValue`
/// rather than the interned handle itself, since the agent transport has
/// no notion of `AttrDb`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAttrs {
    pub next_hop: IpAddr,
    pub local_pref: u32,
    pub med: Option<u32>,
    pub as_path: Vec<u32>,
    pub communities: Vec<String>,
}

impl ChannelAttrs {
    pub fn new(next_hop: IpAddr) -> Self {
        Self {
            next_hop,
            local_pref: 100,
            med: None,
            as_path: Vec::new(),
            communities: Vec::new(),
        }
    }
}

/// One decoded inbound message (spec.md §6 "inbound message stream decoded
/// into ..."). `id` on `Subscribe` is the agent's own route-id, used to
/// identify the paths it later originates in that instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Subscribe { instance: String, id: u64 },
    Unsubscribe { instance: String },
    AddRoute { instance: String, prefix: IpNetwork, attrs: ChannelAttrs, label: Option<u32> },
    DeleteRoute { instance: String, prefix: IpNetwork },
}

/// Open/close lifecycle events a channel reports alongside its message
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Closed,
}

/// The core's view of a compute-agent transport (spec.md §6). A real
/// implementation wraps whatever wire protocol the pub/sub backend speaks;
/// `LoopbackChannel` below is the in-memory test double.
#[async_trait]
pub trait Channel: Send + Sync {
    fn send(&self, bytes: &[u8]) -> SendResult;

    /// Register a callback to run once the transport becomes writable
    /// again after a `Blocked` result (spec.md §4.5). Implementations that
    /// are never blocked may simply invoke `cb` inline.
    fn on_write_ready(&self, cb: Box<dyn FnOnce() + Send>);

    /// Pull the next decoded inbound message, or `None` once the channel
    /// has closed and drained.
    async fn recv(&self) -> Option<ChannelMessage>;

    fn events(&self) -> Vec<ChannelEvent>;
}

struct LoopbackState {
    inbound: VecDeque<ChannelMessage>,
    outbound: Vec<Vec<u8>>,
    events: Vec<ChannelEvent>,
    blocked: bool,
    pending_write_ready: Vec<Box<dyn FnOnce() + Send>>,
}

/// In-memory `Channel`, grounded in the teacher's codec tests' raw-buffer
/// style: `push_inbound`/`sent_bytes` let a test drive and inspect the
/// channel without any socket or XMPP stack.
pub struct LoopbackChannel {
    state: Mutex<LoopbackState>,
}

impl LoopbackChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoopbackState {
                inbound: VecDeque::new(),
                outbound: Vec::new(),
                events: vec![ChannelEvent::Open],
                blocked: false,
                pending_write_ready: Vec::new(),
            }),
        })
    }

    /// Queue a message as if it arrived from the agent.
    pub fn push_inbound(&self, message: ChannelMessage) {
        self.state.lock().unwrap().inbound.push_back(message);
    }

    /// Every buffer handed to `send` so far, in order.
    pub fn sent_bytes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().outbound.clone()
    }

    /// Flip the transport into backpressure; subsequent `send`s return
    /// `Blocked` until `unblock` runs.
    pub fn block(&self) {
        self.state.lock().unwrap().blocked = true;
    }

    /// Clear backpressure and fire every registered `write_ready` callback,
    /// in registration order (spec.md §4.5: "no update batches are
    /// dropped — they queue ... and drain in order on `write_ready`").
    pub fn unblock(&self) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            state.blocked = false;
            std::mem::take(&mut state.pending_write_ready)
        };
        for cb in callbacks {
            cb();
        }
    }

    pub fn close(&self) {
        self.state.lock().unwrap().events.push(ChannelEvent::Closed);
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn send(&self, bytes: &[u8]) -> SendResult {
        let mut state = self.state.lock().unwrap();
        if state.blocked {
            return SendResult::Blocked;
        }
        state.outbound.push(bytes.to_vec());
        SendResult::Ok
    }

    fn on_write_ready(&self, cb: Box<dyn FnOnce() + Send>) {
        let mut state = self.state.lock().unwrap();
        if state.blocked {
            state.pending_write_ready.push(cb);
        } else {
            drop(state);
            cb();
        }
    }

    async fn recv(&self) -> Option<ChannelMessage> {
        self.state.lock().unwrap().inbound.pop_front()
    }

    fn events(&self) -> Vec<ChannelEvent> {
        self.state.lock().unwrap().events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_send_ok_until_blocked() {
        let chan = LoopbackChannel::new();
        assert_eq!(chan.send(b"hello"), SendResult::Ok);
        chan.block();
        assert_eq!(chan.send(b"world"), SendResult::Blocked);
        assert_eq!(chan.sent_bytes(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_write_ready_fires_on_unblock_in_order() {
        let chan = LoopbackChannel::new();
        chan.block();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            chan.on_write_ready(Box::new(move || order.lock().unwrap().push(i)));
        }
        assert!(order.lock().unwrap().is_empty());
        chan.unblock();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_write_ready_fires_immediately_when_not_blocked() {
        let chan = LoopbackChannel::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        chan.on_write_ready(Box::new(move || fired_clone.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_recv_decodes_pushed_messages() {
        let chan = LoopbackChannel::new();
        chan.push_inbound(ChannelMessage::Subscribe { instance: "blue".into(), id: 1 });
        chan.push_inbound(ChannelMessage::AddRoute {
            instance: "blue".into(),
            prefix: "10.1.0.0/16".parse().unwrap(),
            attrs: ChannelAttrs::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            label: Some(20001),
        });

        assert_eq!(
            chan.recv().await,
            Some(ChannelMessage::Subscribe { instance: "blue".into(), id: 1 })
        );
        match chan.recv().await {
            Some(ChannelMessage::AddRoute { label, .. }) => assert_eq!(label, Some(20001)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(chan.recv().await, None);
    }

    #[test]
    fn test_events_record_open_and_close() {
        let chan = LoopbackChannel::new();
        assert_eq!(chan.events(), vec![ChannelEvent::Open]);
        chan.close();
        assert_eq!(chan.events(), vec![ChannelEvent::Open, ChannelEvent::Closed]);
    }
}
