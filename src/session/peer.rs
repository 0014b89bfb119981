//! A single peer's session: `NeighborConfig` + `PeerFsm` + wire transport,
//! driven by `run_once` translating inbound wire messages and timers into
//! `fsm::Event`s and executing the resulting `Action`s (SPEC_FULL.md §4.7).
//!
//! A peer can briefly carry *two* live transports at once: its own
//! canonical session (`protocol`/`fsm`) plus a `collision` track that
//! exists only for the pre-OpenConfirm window RFC 4271 §6.8 describes,
//! when the peer dials in while we already have a session of our own in
//! flight. `resolve_collision` (fsm.rs) decides which one survives as
//! soon as either side's OPEN identifies the peer.
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bgp_rs::{Header, Message, Notification, Open, OpenCapability, PathParameter};
use futures::{pin_mut, select, FutureExt};
use log::debug;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use crate::config::NeighborConfig;
use crate::error::SessionError;
use crate::lifecycle::GracefulRestartParams;
use crate::route::PeerRef;
use crate::session::families::{Families, Family};

use super::fsm::{resolve_collision, CollisionOutcome};
use super::{Action, Event, HoldTimer, MessageCounts, MessageProtocol, PeerFsm, SessionUpdate, State};

use futures::{SinkExt, StreamExt};

pub type PeerHandle = Arc<Mutex<Peer>>;

/// How long the passively-accepted side of a collision waits for a
/// concurrent outbound attempt to win the race before sending its own OPEN
/// (RFC 4271's Open timer, used here purely for collision deferral since
/// our own canonical session's Open timer path is driven the same way).
const OPEN_DELAY: Duration = Duration::from_secs(4);

/// IANA-assigned BGP capability codes (RFC 5492 registry) for the optional
/// capabilities this crate negotiates but `bgp_rs::OpenCapability` has no
/// dedicated variant for (see DESIGN.md: only `FourByteASN`/`MultiProtocol`
/// are evidenced anywhere in the corpus). Encoded/decoded through the
/// crate's `Unsupported` catch-all variant.
const CAP_ROUTE_REFRESH: u8 = 2;
const CAP_GRACEFUL_RESTART: u8 = 64;
const CAP_ADD_PATH: u8 = 69;
const CAP_ENHANCED_ROUTE_REFRESH: u8 = 70;
const CAP_LLGR: u8 = 71;

/// The passively-accepted half of a session collision: its own `PeerFsm`
/// (always somewhere in Active/Connect/OpenSent) plus the transport it
/// arrived on, held apart from the canonical session until resolution.
struct Collision {
    fsm: PeerFsm,
    protocol: MessageProtocol,
    open_deadline: Instant,
}

/// Everything a live (or idle) peer session needs: identity, negotiated
/// state, and the transport once connected.
pub struct Peer {
    pub config: Arc<NeighborConfig>,
    pub fsm: PeerFsm,
    pub counts: MessageCounts,
    pub peer_ref: PeerRef,
    pub negotiated_families: Families,
    pub gr: Option<GracefulRestartParams>,
    hold_timer: Option<HoldTimer>,
    remote_hold_time: Option<u16>,
    protocol: Option<MessageProtocol>,
    collision: Option<Collision>,
    local_identifier: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Canonical,
    Collision,
}

impl Peer {
    pub fn new(config: Arc<NeighborConfig>, peer_ref: PeerRef) -> Self {
        let local_identifier = match config.local_identifier {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        Self {
            config,
            fsm: PeerFsm::new(),
            counts: MessageCounts::new(),
            peer_ref,
            negotiated_families: Families::default(),
            gr: None,
            hold_timer: None,
            remote_hold_time: None,
            protocol: None,
            collision: None,
            local_identifier,
        }
    }

    pub fn state(&self) -> State {
        self.fsm.state
    }

    pub fn is_established(&self) -> bool {
        self.fsm.state == State::Established
    }

    pub fn has_live_transport(&self) -> bool {
        self.protocol.is_some()
    }

    /// Lowest of our configured hold time and whatever the peer offered in
    /// its OPEN (RFC 4271 §4.2); falls back to our own value until the
    /// peer's OPEN has been seen.
    fn negotiated_hold_time(&self) -> u16 {
        match self.remote_hold_time {
            Some(remote) => self.config.hold_time.min(remote),
            None => self.config.hold_time,
        }
    }

    /// Create (or confirm) the `HoldTimer` against the current negotiated
    /// value. A fresh negotiated value (peer's OPEN just landed) gets a
    /// fresh timer; an unchanged one just gets its receipt bumped so an
    /// already-ticking timer isn't reset on every KEEPALIVE.
    fn rearm_hold_timer(&mut self) {
        let negotiated = self.negotiated_hold_time();
        let needs_new = match &self.hold_timer {
            Some(timer) => timer.hold_timer != negotiated,
            None => true,
        };
        if needs_new {
            self.hold_timer = Some(HoldTimer::new(negotiated));
        } else if let Some(timer) = &mut self.hold_timer {
            timer.received();
        }
    }

    /// Drive one `fsm::Event` through to completion: step the FSM, then
    /// execute the resulting actions against this peer's own transport.
    /// Caller-visible results (a learned `Update`, or session end) are
    /// returned; `BeginPeerClose` is surfaced for the caller to run
    /// through `lifecycle::PeerCloseManager`.
    pub async fn apply(&mut self, event: Event) -> Result<PeerOutcome, SessionError> {
        let transition = self.fsm.step(event);
        let mut outcome = PeerOutcome::default();
        for action in transition.actions {
            match action {
                Action::ArmIdleHoldTimer(_) | Action::ArmConnectTimer | Action::DisarmConnectTimer => {}
                Action::ArmOpenTimer | Action::DisarmOpenTimer => {}
                Action::InitiateTcpConnect | Action::AcceptTcpConnection => {}
                Action::ArmHoldTimer(_) | Action::ArmKeepaliveTimer(_) => {
                    self.rearm_hold_timer();
                }
                Action::DisarmHoldTimer => {
                    self.hold_timer = None;
                }
                Action::DisarmKeepaliveTimer => {}
                Action::SendOpen => {
                    self.send_open().await?;
                }
                Action::SendKeepalive => {
                    self.send_message(Message::KeepAlive).await?;
                }
                Action::SendNotification { major, minor } => {
                    let notif = Notification { major_err_code: major, minor_err_code: minor, data: vec![] };
                    let _ = self.send_message(Message::Notification(notif)).await;
                }
                Action::CloseTransport => {
                    self.protocol = None;
                    self.hold_timer = None;
                }
                Action::BeginPeerClose => {
                    outcome.close_requested = true;
                }
                Action::Log(msg) => debug!("peer {}: {}", self.config.peer_address, msg),
            }
        }
        outcome.state = transition.next;
        Ok(outcome)
    }

    fn build_open(&self) -> Message {
        let mut parameters = vec![PathParameter::Capabilities(vec![OpenCapability::FourByteASN(self.config.local_as)])];
        for family in &self.config.address_families {
            parameters.push(PathParameter::Capabilities(vec![family_capability(family)]));
        }
        parameters.push(PathParameter::Capabilities(vec![
            OpenCapability::Unsupported(CAP_ROUTE_REFRESH, vec![]),
            OpenCapability::Unsupported(CAP_ENHANCED_ROUTE_REFRESH, vec![]),
        ]));
        parameters.push(PathParameter::Capabilities(vec![OpenCapability::Unsupported(
            CAP_GRACEFUL_RESTART,
            graceful_restart_capability_bytes(&self.negotiated_families),
        )]));
        parameters.push(PathParameter::Capabilities(vec![OpenCapability::Unsupported(CAP_LLGR, vec![])]));
        parameters.push(PathParameter::Capabilities(vec![OpenCapability::Unsupported(
            CAP_ADD_PATH,
            add_path_capability_bytes(&self.config.address_families),
        )]));
        Message::Open(Open {
            version: 4,
            peer_asn: (self.config.local_as & 0xffff) as u16,
            hold_timer: self.config.hold_time,
            identifier: u32::from(self.local_identifier),
            parameters,
        })
    }

    async fn send_open(&mut self) -> Result<(), SessionError> {
        let open = self.build_open();
        self.send_message(open).await
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), SessionError> {
        if let Some(protocol) = &mut self.protocol {
            protocol.send(message).await.map_err(SessionError::from)?;
            self.counts.increment_sent();
            if let Some(timer) = &mut self.hold_timer {
                timer.sent();
            }
            Ok(())
        } else {
            Err(SessionError::Transport("no active transport".to_string()))
        }
    }

    pub fn attach_transport(&mut self, protocol: MessageProtocol) {
        self.protocol = Some(protocol);
    }

    /// Accept a second, concurrently-arrived transport as the passive side
    /// of a collision: a fresh `PeerFsm`, started at `Active` and
    /// immediately stepped through `TcpPassiveOpen` (stays `Active`, arms
    /// the Open timer per spec.md §4.5), held apart from the canonical
    /// session until `resolve_collision` picks a survivor.
    pub fn begin_collision_session(&mut self, protocol: MessageProtocol) {
        let mut fsm = PeerFsm::new();
        fsm.state = State::Active;
        fsm.step(Event::TcpPassiveOpen);
        self.collision = Some(Collision {
            fsm,
            protocol,
            open_deadline: Instant::now() + OPEN_DELAY,
        });
    }

    fn close_update(&self, outcome: PeerOutcome) -> Option<SessionUpdate> {
        if outcome.close_requested {
            Some(SessionUpdate::Ended(vec![self.config.peer_address]))
        } else {
            None
        }
    }

    /// Race the canonical session's next inbound message, the collision
    /// track's next inbound message (if one is in progress), its Open
    /// timer, and the hold timer keepalive tick — the legal suspension
    /// points once at least one transport is attached (spec.md §5
    /// "Suspension points").
    pub async fn run_once(&mut self) -> Result<Option<SessionUpdate>, SessionError> {
        if self.protocol.is_none() && self.collision.is_none() {
            return Ok(None);
        }

        let canonical_opt = self.protocol.as_mut();
        let canonical_next = async move {
            match canonical_opt {
                Some(p) => p.next().await,
                None => std::future::pending().await,
            }
        }
        .fuse();
        pin_mut!(canonical_next);

        let open_deadline = self.collision.as_ref().map(|c| c.open_deadline);
        let collision_opt = self.collision.as_mut().map(|c| &mut c.protocol);
        let collision_next = async move {
            match collision_opt {
                Some(p) => p.next().await,
                None => std::future::pending().await,
            }
        }
        .fuse();
        pin_mut!(collision_next);

        let collision_open_timer = async move {
            match open_deadline {
                Some(deadline) => {
                    sleep_until(deadline).await;
                    true
                }
                None => std::future::pending().await,
            }
        }
        .fuse();
        pin_mut!(collision_open_timer);

        let hold_timer_opt = self.hold_timer.as_mut();
        let keepalive_due = async move {
            match hold_timer_opt {
                Some(timer) => timer.should_send_keepalive().await,
                None => std::future::pending().await,
            }
        }
        .fuse();
        pin_mut!(keepalive_due);

        select! {
            incoming = canonical_next => {
                match incoming {
                    Some(Ok((_header, message))) => self.handle_canonical_message(message).await,
                    Some(Err(err)) => Err(SessionError::from(err)),
                    None => {
                        let outcome = self.apply(Event::TcpClose).await?;
                        Ok(self.close_update(outcome).or(Some(SessionUpdate::Ended(vec![self.config.peer_address]))))
                    }
                }
            }
            incoming = collision_next => {
                match incoming {
                    Some(Ok((_header, message))) => self.handle_collision_message(message).await,
                    _ => {
                        self.collision = None;
                        Ok(None)
                    }
                }
            }
            _fired = collision_open_timer => {
                self.promote_collision_to_opensent().await?;
                Ok(None)
            }
            expired = keepalive_due => {
                match expired {
                    Ok(true) => {
                        self.send_message(Message::KeepAlive).await?;
                        Ok(None)
                    }
                    Ok(false) => Ok(None),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Step the collision track's own Open timer: it keeps its own FSM
    /// (so it can independently reach `OpenSent`) but only the `SendOpen`
    /// action is meaningful here, since its hold/keepalive bookkeeping is
    /// only ever adopted by the canonical session if it goes on to win.
    async fn promote_collision_to_opensent(&mut self) -> Result<(), SessionError> {
        let actions = match &mut self.collision {
            Some(collision) => collision.fsm.step(Event::OpenTimerExpired).actions,
            None => return Ok(()),
        };
        for action in actions {
            if let Action::SendOpen = action {
                let open = self.build_open();
                if let Some(collision) = &mut self.collision {
                    collision.protocol.send(open).await.map_err(SessionError::from)?;
                }
            }
        }
        Ok(())
    }

    async fn notify_and_close(protocol: &mut MessageProtocol, major: u8, minor: u8) {
        let notif = Message::Notification(Notification { major_err_code: major, minor_err_code: minor, data: vec![] });
        let _ = protocol.send(notif).await;
    }

    /// Send a NOTIFICATION on the losing canonical transport and drop it
    /// (used only when collision resolution picks the *collision* track as
    /// survivor, which then gets promoted into `protocol`/`fsm`).
    async fn close_canonical_for_collision(&mut self, major: u8, minor: u8) {
        if let Some(mut protocol) = self.protocol.take() {
            Self::notify_and_close(&mut protocol, major, minor).await;
        }
        self.hold_timer = None;
    }

    async fn handle_canonical_message(&mut self, message: Message) -> Result<Option<SessionUpdate>, SessionError> {
        self.counts.increment_received();
        if let Some(timer) = &mut self.hold_timer {
            timer.received();
        }
        match message {
            Message::Open(open) => self.handle_open(Side::Canonical, open).await,
            Message::KeepAlive => {
                let outcome = self.apply(Event::BgpKeepalive).await?;
                Ok(self.close_update(outcome))
            }
            Message::Notification(_) => {
                self.apply(Event::BgpNotification).await?;
                Ok(Some(SessionUpdate::Ended(vec![self.config.peer_address])))
            }
            Message::Update(update) => {
                self.apply(Event::BgpUpdate).await?;
                Ok(Some(SessionUpdate::Learned((self.config.peer_address, update))))
            }
            Message::RouteRefresh(_) => Ok(None),
        }
    }

    async fn handle_collision_message(&mut self, message: Message) -> Result<Option<SessionUpdate>, SessionError> {
        match message {
            Message::Open(open) => self.handle_open(Side::Collision, open).await,
            _ => {
                // Nothing legitimate arrives on the collision track before
                // its own OPEN; treat anything else as abandoning it.
                self.collision = None;
                Ok(None)
            }
        }
    }

    /// Resolve a just-received OPEN on `side` against `local_identifier`
    /// (duplicate check, spec.md §4.5 `BgpOpenDuplicateId`) and, when a
    /// collision is in progress, against `resolve_collision` (spec.md §4.5
    /// "active+passive session collision resolution").
    async fn handle_open(&mut self, side: Side, open: Open) -> Result<Option<SessionUpdate>, SessionError> {
        let remote_id = Ipv4Addr::from(open.identifier);
        if remote_id == self.local_identifier {
            if let Some(mut collision) = self.collision.take() {
                Self::notify_and_close(&mut collision.protocol, 2, 3).await;
            }
            let outcome = self.apply(Event::BgpOpenDuplicateId).await?;
            return Ok(self.close_update(outcome));
        }

        self.remote_hold_time = Some(open.hold_timer);
        if let Some(params) = parse_graceful_restart(&open) {
            self.gr = Some(params);
        }
        let families = Families::new(capabilities_families(&open));

        let collision = match self.collision.take() {
            Some(c) => c,
            None => {
                self.negotiated_families = families;
                let outcome = self.apply(Event::BgpOpenWinner).await?;
                return Ok(self.close_update(outcome));
            }
        };

        let outcome_for_active = resolve_collision(self.local_identifier, remote_id);
        let side_wins = matches!(
            (side, outcome_for_active),
            (Side::Canonical, CollisionOutcome::KeepActive) | (Side::Collision, CollisionOutcome::KeepPassive)
        );

        if side_wins {
            if side == Side::Collision {
                self.close_canonical_for_collision(6, 7).await;
                self.protocol = Some(collision.protocol);
                self.fsm = collision.fsm;
            } else {
                let mut collision = collision;
                Self::notify_and_close(&mut collision.protocol, 6, 7).await;
            }
            self.negotiated_families = families;
            let outcome = self.apply(Event::BgpOpenWinner).await?;
            Ok(self.close_update(outcome))
        } else {
            match side {
                Side::Canonical => {
                    self.collision = Some(collision);
                    let outcome = self.apply(Event::BgpOpenLoser).await?;
                    Ok(self.close_update(outcome))
                }
                Side::Collision => {
                    let mut collision = collision;
                    collision.fsm.step(Event::BgpOpenLoser);
                    self.collision = Some(collision);
                    Ok(None)
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerOutcome {
    pub state: State,
    pub close_requested: bool,
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

fn family_capability(family: &Family) -> OpenCapability {
    family.to_open_param()
}

fn capabilities_families(open: &Open) -> Vec<Family> {
    let mut families = Vec::new();
    for param in &open.parameters {
        if let PathParameter::Capabilities(caps) = param {
            for cap in caps {
                if let OpenCapability::MultiProtocol((afi, safi)) = cap {
                    families.push(Family::new(*afi, *safi));
                }
            }
        }
    }
    families
}

/// Restart time advertised in our own Graceful Restart capability: we
/// don't hold any forwarding state across a restart of our own, so this is
/// purely the "please keep my stale routes around" signal to the peer. Per-
/// AFI/SAFI forwarding-state entries are omitted (we never claim to
/// preserve forwarding state across our own restart), only the restart-time
/// field is meaningful here.
fn graceful_restart_capability_bytes(_families: &Families) -> Vec<u8> {
    vec![0u8, 120] // restart-time (12 bits) | flags (4 bits), big-endian u16, R-bit unset
}

/// We advertise add-path support without per-family AFI/SAFI entries since
/// we only ever negotiate it as "receive" for the families already
/// negotiated via `MultiProtocol`.
fn add_path_capability_bytes(_families: &[Family]) -> Vec<u8> {
    vec![1] // receive-only
}

/// Parse the peer's Graceful Restart capability (and, if present, the
/// Long-Lived variant) out of a received OPEN (spec.md §4.5 "stale ->
/// refresh"). DESIGN.md flags the `Unsupported(u8, Vec<u8>)` decoding this
/// relies on as a best-effort assumption: `bgp-rs`'s source isn't vendored
/// in the corpus, so only `FourByteASN`/`MultiProtocol` are directly
/// evidenced; adjust this against the real crate's capability enum if it
/// differs.
fn parse_graceful_restart(open: &Open) -> Option<GracefulRestartParams> {
    let mut advertised = false;
    let mut restart_secs: u64 = 0;
    let mut llgr = false;
    let mut stale_secs: u64 = 0;

    for param in &open.parameters {
        if let PathParameter::Capabilities(caps) = param {
            for cap in caps {
                if let OpenCapability::Unsupported(code, data) = cap {
                    match *code {
                        CAP_GRACEFUL_RESTART => {
                            advertised = true;
                            if data.len() >= 2 {
                                restart_secs = (u16::from_be_bytes([data[0], data[1]]) & 0x0fff) as u64;
                            }
                        }
                        CAP_LLGR => {
                            llgr = true;
                            // Stale time per AFI/SAFI entry; we only need a
                            // single value so take the first entry's.
                            if data.len() >= 4 {
                                stale_secs = (u32::from_be_bytes([0, data[1], data[2], data[3]])) as u64;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    if !advertised {
        return None;
    }
    let stale_timer = if llgr && stale_secs > 0 {
        Duration::from_secs(stale_secs)
    } else {
        Duration::from_secs(restart_secs)
    };
    Some(GracefulRestartParams { llgr, stale_timer })
}

pub(crate) fn dummy_header() -> Header {
    Header { length: 0, record_type: 4 }
}

/// Reject a transport that arrived after the session was already past the
/// collision-resolution window (OpenConfirm/Established): RFC 4271 §6.8
/// only runs identifier comparison pre-OpenConfirm, so anything later is
/// just a stray duplicate connection.
pub async fn reject_extra_transport(mut protocol: MessageProtocol) {
    let notif = Message::Notification(Notification { major_err_code: 6, minor_err_code: 7, data: vec![] });
    let _ = protocol.send(notif).await;
}
