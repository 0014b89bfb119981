//! Owns the set of configured peers and drives each one's connection
//! lifecycle end to end (SPEC_FULL.md §4.8): registers peers with the
//! `Poller`, attaches a transport once one connects, feeds wire events
//! into `PeerFsm` via `Peer::apply`, and hands a closing peer's table
//! memberships to `PeerCloseManager`.
//!
//! Grounded in the teacher's `session/manager.rs` `SessionManager::get_update`
//! (new-connection handling, per-error NOTIFICATION dispatch, re-arming the
//! poller on session end) adapted to the FSM-driven `Peer`/`PeerFsm` split.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bgp_rs::{Message, Notification};
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use crate::config::NeighborConfig;
use crate::error::SessionError;
use crate::instance::InstanceMgr;
use crate::lifecycle::PeerCloseManager;
use crate::route::{AddressFamily, PeerRef};
use crate::scheduler::Scheduler;

use super::codec::{MessageCodec, MessageProtocol};
use super::families::to_address_family;
use super::fsm::{Event, State};
use super::peer::{reject_extra_transport, Peer, PeerHandle};
use super::poller::{Poller, PollerEvent, PollerTx};
use super::SessionUpdate;

/// Read-only peer state for the introspection RPC surface (SPEC_FULL.md
/// §6), built off whatever `Peer`'s own fields already track rather than
/// a parallel bookkeeping structure.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer_address: IpAddr,
    pub instance: String,
    pub admin_down: bool,
    pub local_as: u32,
    pub peer_as: u32,
    pub router_id: IpAddr,
    pub hold_time: u16,
    pub state: State,
    pub msg_received: u64,
    pub msg_sent: u64,
    pub negotiated_families: Vec<String>,
    pub graceful_restart: bool,
}

impl From<&Peer> for PeerSnapshot {
    fn from(peer: &Peer) -> Self {
        Self {
            peer_address: peer.config.peer_address,
            instance: peer.config.instance.clone(),
            admin_down: peer.config.admin_down,
            local_as: peer.config.local_as,
            peer_as: peer.config.peer_as,
            router_id: peer.config.local_identifier,
            hold_time: peer.config.hold_time,
            state: peer.state(),
            msg_received: peer.counts.received(),
            msg_sent: peer.counts.sent(),
            negotiated_families: peer.negotiated_families.iter().map(ToString::to_string).collect(),
            graceful_restart: peer.gr.is_some(),
        }
    }
}

struct PeerEntry {
    id: u64,
    handle: PeerHandle,
    /// Kept alive only for its `Arc` identity; `PeerRef` holds a `Weak` to
    /// this, so tables can tell a peer was torn down without this entry's
    /// cooperation (spec.md §9 design notes).
    _alive: Arc<()>,
}

/// Peer set + poller + config-change feed, the whole session layer a
/// `Server` drives (SPEC_FULL.md §4.8).
pub struct SessionManager {
    instance_mgr: Arc<InstanceMgr>,
    close_mgr: Arc<PeerCloseManager>,
    scheduler: Arc<Scheduler>,
    peers: Mutex<HashMap<IpAddr, PeerEntry>>,
    next_peer_id: AtomicU64,
    poller: Mutex<Poller>,
    poller_tx: PollerTx,
    updates_tx: mpsc::UnboundedSender<SessionUpdate>,
}

impl SessionManager {
    pub fn new(
        listener: TcpListener,
        retry_interval: Duration,
        instance_mgr: Arc<InstanceMgr>,
        scheduler: Arc<Scheduler>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (poller_tx, poller_rx) = mpsc::unbounded_channel();
        let poller = Poller::new(listener, retry_interval, poller_rx);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let close_mgr = PeerCloseManager::new(instance_mgr.clone());
        let mgr = Arc::new(Self {
            instance_mgr,
            close_mgr,
            scheduler,
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            poller: Mutex::new(poller),
            poller_tx,
            updates_tx,
        });
        (mgr, updates_rx)
    }

    /// Configure a new peer: build its `Peer`/`PeerFsm`, apply `AdminUp`
    /// unless it starts administratively down, and register it with the
    /// poller so an active peer's outbound retries begin immediately.
    pub async fn add_peer(self: &Arc<Self>, config: NeighborConfig) {
        let config = Arc::new(config);
        let addr = config.peer_address;
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(());
        let peer_ref = PeerRef::new(id, config.local_identifier, addr, config.is_ebgp(), &alive);
        let mut peer = Peer::new(config.clone(), peer_ref);
        if !config.admin_down {
            let _ = peer.apply(Event::AdminUp).await;
        }
        let handle: PeerHandle = Arc::new(Mutex::new(peer));
        {
            let mut peers = self.peers.lock().await;
            peers.insert(addr, PeerEntry { id, handle: handle.clone(), _alive: alive });
        }
        self.poller.lock().await.upsert_config(config);
        info!("peer {} ({}) configured", addr, id);
        self.spawn_io_task(addr, id, handle);
    }

    /// De-configure a peer: stop the poller from retrying it and drive its
    /// FSM to `AdminDown`, which tears down any live transport and begins
    /// the peer-close sequence.
    pub async fn remove_peer(self: &Arc<Self>, addr: IpAddr) {
        let entry = self.peers.lock().await.remove(&addr);
        let (id, handle) = match entry {
            Some(e) => (e.id, e.handle),
            None => return,
        };
        self.poller.lock().await.remove_config(addr);
        let outcome = self.drive_event(id, handle.clone(), Event::AdminDown).await;
        if matches!(outcome, Ok(o) if o.close_requested) {
            self.begin_close(id, handle).await;
        }
        self.scheduler.forget_state_machine(id);
        self.scheduler.forget_io_reader(id);
    }

    /// Run the connection-layer loop: accept inbound sockets, fire
    /// outbound retries, and translate both into FSM events. Intended to
    /// be spawned once per server and run for the server's lifetime.
    pub async fn run(self: Arc<Self>) {
        loop {
            let event = {
                let mut poller = self.poller.lock().await;
                match poller.next_event().await {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("poller accept loop error: {}", err);
                        None
                    }
                }
            };
            match event {
                Some(PollerEvent::Inbound(stream, config)) => self.on_connected(stream, config, true).await,
                Some(PollerEvent::Outbound(stream, config)) => self.on_connected(stream, config, false).await,
                Some(PollerEvent::OutboundFailed(config)) => self.on_connect_failed(config).await,
                None => {}
            }
        }
    }

    async fn on_connected(self: &Arc<Self>, stream: tokio::net::TcpStream, config: Arc<NeighborConfig>, inbound: bool) {
        let addr = config.peer_address;
        let (id, handle) = match self.peers.lock().await.get(&addr) {
            Some(entry) => (entry.id, entry.handle.clone()),
            None => {
                warn!("connection for unconfigured peer {}, dropping", addr);
                return;
            }
        };

        let state = handle.lock().await.state();
        let already_live = handle.lock().await.has_live_transport();

        if already_live {
            if matches!(state, State::OpenConfirm | State::Established) {
                // Past the collision-resolution window (RFC 4271 §6.8):
                // this is just a stray duplicate connection, reject it.
                warn!("extra connection from {} after session reached {:?}, rejecting", addr, state);
                reject_extra_transport(MessageProtocol::new(stream, MessageCodec::new())).await;
                return;
            }
            // A genuine session collision: hold the new transport apart as
            // the passive track until `resolve_collision` (run from
            // whichever side's OPEN arrives first) picks a survivor.
            debug!("connection collision for {}, starting passive track", addr);
            handle
                .lock()
                .await
                .begin_collision_session(MessageProtocol::new(stream, MessageCodec::new()));
            return;
        }

        {
            let mut peer = handle.lock().await;
            peer.attach_transport(MessageProtocol::new(stream, MessageCodec::new()));
        }

        if !inbound && state == State::Active {
            // The poller already performed the connect; drive the FSM
            // through the same Active->Connect step a real connect timer
            // would (spec.md §4.7), so `TcpConnected` lands on `Connect`.
            let _ = self.drive_event(id, handle.clone(), Event::ConnectTimerExpired).await;
        }

        let event = if inbound { Event::TcpPassiveOpen } else { Event::TcpConnected };
        match self.drive_event(id, handle.clone(), event).await {
            Ok(outcome) if outcome.close_requested => self.begin_close(id, handle).await,
            Ok(_) => {}
            Err(err) => warn!("peer {} transport handshake error: {}", addr, err),
        }
    }

    async fn on_connect_failed(self: &Arc<Self>, config: Arc<NeighborConfig>) {
        let addr = config.peer_address;
        let (id, handle) = match self.peers.lock().await.get(&addr) {
            Some(entry) => (entry.id, entry.handle.clone()),
            None => return,
        };
        let _ = self.drive_event(id, handle, Event::TcpConnectFail).await;
    }

    /// Run one per-peer I/O task: drains wire messages (and the hold
    /// timer) through `Peer::run_once`, forwarding learned updates and
    /// reacting to session-ending errors with the matching NOTIFICATION.
    fn spawn_io_task(self: &Arc<Self>, addr: IpAddr, id: u64, handle: PeerHandle) {
        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.scheduler
                .run_io_reader(id, || async {
                    loop {
                        let result = {
                            let mut peer = handle.lock().await;
                            peer.run_once().await
                        };
                        match result {
                            Ok(Some(update @ SessionUpdate::Learned(_))) => {
                                let _ = mgr.updates_tx.send(update);
                            }
                            Ok(Some(SessionUpdate::Ended(ips))) => {
                                mgr.begin_close(id, handle.clone()).await;
                                let _ = mgr.updates_tx.send(SessionUpdate::Ended(ips));
                                break;
                            }
                            Ok(None) => continue,
                            Err(err) => {
                                mgr.handle_session_error(id, &handle, err).await;
                                mgr.begin_close(id, handle.clone()).await;
                                let _ = mgr.updates_tx.send(SessionUpdate::Ended(vec![addr]));
                                break;
                            }
                        }
                    }
                })
                .await;
        });
    }

    /// Turn a propagated `SessionError` into the matching FSM event,
    /// sending a NOTIFICATION first when the error carries one (spec.md
    /// §7): `HoldTimeExpired` has its own dedicated event (the FSM sends
    /// its own 4/0 notification); everything else is reported, then
    /// folded through `BgpNotification` to force the session closed.
    async fn handle_session_error(&self, id: u64, handle: &PeerHandle, err: SessionError) {
        debug!("peer session {} ended: {}", id, err);
        let event = match &err {
            SessionError::HoldTimeExpired(_) => Event::HoldTimerExpired,
            _ => {
                if let Some((major, minor)) = err.notification_codes() {
                    let mut peer = handle.lock().await;
                    let notif = Notification { major_err_code: major, minor_err_code: minor, data: vec![] };
                    let _ = peer.send_message(Message::Notification(notif)).await;
                }
                Event::BgpNotification
            }
        };
        let _ = self.drive_event(id, handle.clone(), event).await;
    }

    /// Run `event` through `peer_id`'s FSM under the `bgp::StateMachine`
    /// task-group lock (spec.md §5: "serialized per-peer").
    async fn drive_event(
        &self,
        peer_id: u64,
        handle: PeerHandle,
        event: Event,
    ) -> Result<super::peer::PeerOutcome, SessionError> {
        self.scheduler
            .run_state_machine(peer_id, move || async move {
                let mut peer = handle.lock().await;
                peer.apply(event).await
            })
            .await
    }

    /// Run the full table-membership teardown for a closing peer, then
    /// re-arm the poller for reconnection unless it was deconfigured out
    /// from under us (`remove_peer` already removed its entry in that
    /// case).
    async fn begin_close(self: &Arc<Self>, id: u64, handle: PeerHandle) {
        let (instance, families, gr, config) = {
            let peer = handle.lock().await;
            (
                peer.config.instance.clone(),
                peer.negotiated_families.iter().copied().collect::<Vec<_>>(),
                peer.gr,
                peer.config.clone(),
            )
        };
        let memberships = families
            .into_iter()
            .filter_map(|family| to_address_family(family).map(|af| (instance.clone(), af)))
            .collect();

        let mgr = self.clone();
        let addr = config.peer_address;
        self.close_mgr
            .close_peer(id, memberships, gr, move || {
                info!("peer {} close sequence complete", addr);
                let _ = mgr.poller_tx.send(config);
            })
            .await;
    }

    pub fn instance_mgr(&self) -> &Arc<InstanceMgr> {
        &self.instance_mgr
    }

    /// The originating peer's identity plus its configured routing
    /// instance, for the server's update-ingestion loop to attribute a
    /// `SessionUpdate::Learned` to the right table set.
    pub async fn peer_context(&self, addr: IpAddr) -> Option<(PeerRef, String)> {
        let handle = self.peers.lock().await.get(&addr).map(|e| e.handle.clone())?;
        let peer = handle.lock().await;
        Some((peer.peer_ref.clone(), peer.config.instance.clone()))
    }

    pub async fn snapshot_peers(&self) -> Vec<PeerSnapshot> {
        let handles: Vec<PeerHandle> = self.peers.lock().await.values().map(|e| e.handle.clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(PeerSnapshot::from(&*handle.lock().await));
        }
        out
    }

    pub async fn peer_snapshot(&self, addr: IpAddr) -> Option<PeerSnapshot> {
        let handle = self.peers.lock().await.get(&addr).map(|e| e.handle.clone())?;
        Some(PeerSnapshot::from(&*handle.lock().await))
    }

    /// Every established peer in `instance` that has negotiated `family`,
    /// for the RIB-out encoder to fan a route change out to (SPEC_FULL.md
    /// §4.2 "table export -> RibOut batching -> encoder -> session writer
    /// -> outbound bytes"). Returns `(peer_id, is_ebgp, handle)` so the
    /// caller can apply split-horizon and AS-path prepend without locking
    /// every peer twice.
    pub async fn export_targets(&self, instance: &str, family: AddressFamily) -> Vec<(u64, bool, PeerHandle)> {
        let entries: Vec<(u64, PeerHandle)> = self
            .peers
            .lock()
            .await
            .values()
            .map(|e| (e.id, e.handle.clone()))
            .collect();
        let mut out = Vec::new();
        for (id, handle) in entries {
            let peer = handle.lock().await;
            if peer.config.instance != instance || !peer.is_established() {
                continue;
            }
            let negotiated = peer
                .negotiated_families
                .iter()
                .any(|f| to_address_family(*f) == Some(family));
            if negotiated {
                out.push((id, peer.peer_ref.is_ebgp, handle.clone()));
            }
        }
        out
    }
}
