//! Outbound connect scheduling plus inbound connection dispatch: the
//! I/O-only half of session establishment (SPEC_FULL.md §4.7). Deciding
//! *when* to attempt an outbound TCP connect and matching an inbound one
//! to its configured peer lives here; everything that happens once a
//! socket exists (OPEN negotiation, collision resolution, timers) is
//! owned by `fsm::PeerFsm` and driven by `SessionManager`.
//!
//! Grounded in the teacher's `session/poller.rs` `Poller`/`IdlePeer`
//! (`DelayQueue`-driven outbound retry, source-bound `TcpBuilder` connect),
//! adapted from a single-session-per-peer model to feeding `PollerEvent`s
//! into the FSM's active+passive session duality (spec.md §4.5).
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::{pin_mut, select, FutureExt, StreamExt};
use log::{debug, trace, warn};
use net2::TcpBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, DelayQueue, Duration, Instant};

use crate::config::NeighborConfig;

const TCP_CONNECT_TIMEOUT_MS: u16 = 1000;

pub type PollerTx = mpsc::UnboundedSender<Arc<NeighborConfig>>;
pub type PollerRx = mpsc::UnboundedReceiver<Arc<NeighborConfig>>;

/// A configured peer with no attached transport, waiting on either the
/// outbound retry timer or an inbound connection.
#[derive(Debug)]
pub struct IdlePeer(Arc<NeighborConfig>);

impl IdlePeer {
    pub fn new(config: Arc<NeighborConfig>) -> Self {
        Self(config)
    }

    pub fn get_config(&self) -> Arc<NeighborConfig> {
        Arc::clone(&self.0)
    }

    /// Source-bind to the server's own listening address so the outbound
    /// connect presents from the same local address peers see us listen
    /// on (mirrors the teacher's `TcpBuilder` source-bind).
    async fn connect(&self, source_addr: SocketAddr) -> Result<(TcpStream, Arc<NeighborConfig>), io::Error> {
        let peer_addr = SocketAddr::new(self.0.peer_address, self.0.port);
        let builder = match peer_addr {
            SocketAddr::V4(_) => TcpBuilder::new_v4()?,
            SocketAddr::V6(_) => TcpBuilder::new_v6()?,
        };
        builder.reuse_address(true)?;
        builder.bind(source_addr)?;
        let connect = TcpStream::connect_std(builder.to_tcp_stream()?, &peer_addr);
        match timeout(Duration::from_millis(TCP_CONNECT_TIMEOUT_MS.into()), connect).await? {
            Ok(stream) => Ok((stream, self.0.clone())),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Display for IdlePeer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<IdlePeer {}>", self.0.peer_address)
    }
}

/// One connection-layer occurrence for `SessionManager` to translate into
/// an `fsm::Event` and attach to the right `Peer` (spec.md §4.7).
pub enum PollerEvent {
    Inbound(TcpStream, Arc<NeighborConfig>),
    Outbound(TcpStream, Arc<NeighborConfig>),
    OutboundFailed(Arc<NeighborConfig>),
}

/// Tracks idle (unattached) peers and drives the accept loop plus the
/// outbound retry schedule.
pub struct Poller {
    idle_peers: HashMap<IpAddr, IdlePeer>,
    /// Addresses with a live entry in `delay_queue`, so re-registering an
    /// already-scheduled peer (a config reload) doesn't queue a second
    /// attempt, while re-registering one whose entry already fired (a
    /// session that just ended) does (`SessionManager` drives this via
    /// `PollerTx` once a peer goes idle again).
    scheduled: std::collections::HashSet<IpAddr>,
    tcp_listener: TcpListener,
    rx: PollerRx,
    interval: Duration,
    delay_queue: DelayQueue<IpAddr>,
}

impl Poller {
    pub fn new(listener: TcpListener, retry_interval: Duration, rx: PollerRx) -> Self {
        let mut delay_queue = DelayQueue::with_capacity(4);
        // Keeps the queue non-empty so `next()` never resolves to `None`
        // while no real peer is scheduled.
        delay_queue.insert_at(
            IpAddr::from(std::net::Ipv4Addr::new(0, 0, 0, 0)),
            Instant::now() + Duration::from_secs(31_536_000),
        );
        Self {
            idle_peers: HashMap::new(),
            scheduled: std::collections::HashSet::new(),
            tcp_listener: listener,
            interval: retry_interval,
            delay_queue,
            rx,
        }
    }

    /// Register (or re-register) `config`. A passive neighbor (spec.md
    /// §4.5: "a neighbor configured passive never initiates") is tracked
    /// for inbound matching only and never enters the retry queue. An
    /// admin-down neighbor is tracked but not scheduled either.
    pub fn upsert_config(&mut self, config: Arc<NeighborConfig>) {
        let addr = config.peer_address;
        let should_schedule = !config.passive && !config.admin_down;
        self.idle_peers.insert(addr, IdlePeer::new(config));
        if should_schedule && self.scheduled.insert(addr) {
            self.delay_queue.insert(addr, self.interval);
        }
    }

    pub fn remove_config(&mut self, addr: IpAddr) {
        self.idle_peers.remove(&addr);
        self.scheduled.remove(&addr);
    }

    /// Block until the next connection-layer occurrence: an inbound
    /// accept, an outbound retry firing, or a peer being (re-)registered
    /// mid-run (config change).
    pub async fn next_event(&mut self) -> io::Result<Option<PollerEvent>> {
        let local_outbound_addr = self.tcp_listener.local_addr()?;
        let listener = FutureExt::fuse(self.tcp_listener.accept());
        let initializer = FutureExt::fuse(self.delay_queue.next());
        let rescheduled_peers = FutureExt::fuse(self.rx.recv());
        pin_mut!(listener, initializer, rescheduled_peers);
        select! {
            incoming = listener => {
                let (stream, socket) = incoming?;
                match self.idle_peers.get(&socket.ip()).map(IdlePeer::get_config) {
                    Some(config) if !config.admin_down => {
                        debug!("incoming connection from {}", socket.ip());
                        Ok(Some(PollerEvent::Inbound(stream, config)))
                    }
                    Some(_) => Ok(None),
                    None => {
                        warn!("unexpected connection from {}: not a configured peer", socket.ip());
                        Ok(None)
                    }
                }
            },
            outgoing = initializer => {
                let addr = match outgoing {
                    Some(Ok(entry)) => entry.into_inner(),
                    _ => return Ok(None),
                };
                trace!("poller outbound triggered for {}", addr);
                self.scheduled.remove(&addr);
                let config = match self.idle_peers.get(&addr).map(IdlePeer::get_config) {
                    Some(config) if !config.admin_down && !config.passive => config,
                    _ => return Ok(None),
                };
                let peer = IdlePeer::new(config.clone());
                match peer.connect(SocketAddr::new(local_outbound_addr.ip(), 0)).await {
                    Ok((stream, config)) => Ok(Some(PollerEvent::Outbound(stream, config))),
                    Err(err) => {
                        warn!("error connecting to {}: {}", addr, err);
                        self.delay_queue.insert(addr, self.interval);
                        self.scheduled.insert(addr);
                        Ok(Some(PollerEvent::OutboundFailed(config)))
                    }
                }
            },
            peer = rescheduled_peers => {
                if let Some(config) = peer {
                    self.upsert_config(config);
                }
                Ok(None)
            }
        }
    }
}

impl fmt::Display for Poller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Poller peers={}>", self.idle_peers.len())
    }
}
