//! Staged lifetime / deletion protocol, and the peer-close manager built on
//! top of it (spec.md §3 "Staged lifetime / deletion protocol", §4.6
//! "Peer-close manager").
//!
//! Grounded in the design notes (spec.md §9): deletion of `Instance`,
//! `Table`, `Peer`, or tree-manager objects is non-instantaneous because
//! routes/paths may still transit. `Deleter` gives any such object a
//! three-state lifecycle (`Live` / `DeletionPending` / `Destroyed`) plus a
//! `MayDelete` hook mechanism so destruction only completes once every
//! interested party agrees. Dependents (e.g. an `Instance`'s `Table`s)
//! register a dependency edge with their parent's deleter, so requesting
//! deletion on the parent cascades the request down, and each dependent's
//! eventual destruction re-triggers the parent's own check.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use tokio::time::sleep;

use crate::instance::InstanceMgr;
use crate::route::AddressFamily;
use crate::table::Table;

/// Observable lifecycle state of a deletable object (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteState {
    Live,
    DeletionPending,
    Destroyed,
}

type MayDeleteHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// A deleter coordinates one object's staged teardown. It never owns the
/// object itself — callers hold the `Arc<Deleter>` alongside whatever
/// resource it's guarding and consult `state()` before acting on it.
pub struct Deleter {
    state: Mutex<DeleteState>,
    hooks: Mutex<Vec<MayDeleteHook>>,
    dependents: Mutex<Vec<Arc<Deleter>>>,
    listeners: Mutex<Vec<Arc<Deleter>>>,
    on_destroy: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Deleter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DeleteState::Live),
            hooks: Mutex::new(Vec::new()),
            dependents: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            on_destroy: Mutex::new(None),
        })
    }

    pub fn state(&self) -> DeleteState {
        *self.state.lock().unwrap()
    }

    /// Register a `MayDelete` predicate; destruction only completes once
    /// every registered hook returns `true` (spec.md §3).
    pub fn add_hook(&self, hook: impl Fn() -> bool + Send + Sync + 'static) {
        self.hooks.lock().unwrap().push(Arc::new(hook));
    }

    /// Register `dependent` as something this deleter may not outlive:
    /// requesting deletion here cascades to `dependent`, and `dependent`
    /// reaching `Destroyed` re-triggers this deleter's own check (spec.md
    /// §3 "Dependents register into a dependency edge with their parent's
    /// deleter so parent deletion cascades").
    pub fn add_dependent(self: &Arc<Self>, dependent: &Arc<Deleter>) {
        self.dependents.lock().unwrap().push(dependent.clone());
        dependent.listeners.lock().unwrap().push(self.clone());
    }

    /// Run once, when this deleter actually reaches `Destroyed`.
    pub fn on_destroy(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_destroy.lock().unwrap() = Some(Box::new(f));
    }

    /// Enter `DeletionPending` (idempotent) and cascade to dependents.
    pub fn request_delete(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == DeleteState::Live {
                *state = DeleteState::DeletionPending;
            } else {
                return;
            }
        }
        for dependent in self.dependents.lock().unwrap().iter() {
            dependent.request_delete();
        }
        self.notify();
    }

    /// Re-evaluate whether this deleter can now finish (spec.md §3: "fires
    /// `MayDelete` hooks after every relevant event"). Call this whenever
    /// something changes that a hook might care about (a route removed, a
    /// membership dropped, a dependent destroyed).
    pub fn notify(self: &Arc<Self>) {
        if self.state() != DeleteState::DeletionPending {
            return;
        }
        let dependents_done = self
            .dependents
            .lock()
            .unwrap()
            .iter()
            .all(|d| d.state() == DeleteState::Destroyed);
        let hooks_agree = self.hooks.lock().unwrap().iter().all(|h| h());
        if dependents_done && hooks_agree {
            *self.state.lock().unwrap() = DeleteState::Destroyed;
            if let Some(f) = self.on_destroy.lock().unwrap().take() {
                f();
            }
            for listener in self.listeners.lock().unwrap().iter() {
                listener.notify();
            }
        }
    }
}

/// Graceful-restart parameters governing a peer's close, negotiated during
/// OPEN (spec.md §4.5 "Graceful restart (GR) / long-lived GR (LLGR)").
#[derive(Debug, Clone, Copy)]
pub struct GracefulRestartParams {
    pub llgr: bool,
    pub stale_timer: Duration,
}

/// Coordinates the multi-step close of a peer across every table it's a
/// member of (spec.md §4.6). This is what makes peer close safe in the
/// presence of concurrent table traffic: `Table::mark_peer_stale` and
/// `Table::remove_peer_paths` are synchronous precisely so this manager
/// knows a table's walk has completed before moving on.
pub struct PeerCloseManager {
    instance_mgr: Arc<InstanceMgr>,
}

impl PeerCloseManager {
    pub fn new(instance_mgr: Arc<InstanceMgr>) -> Arc<Self> {
        Arc::new(Self { instance_mgr })
    }

    /// Run the full close sequence for `peer_id`'s membership in
    /// `memberships` (spec.md §4.6 steps 1-4). `graceful_restart` selects
    /// ribin-stale (kept, stale-marked, sprung by a timer) vs. an
    /// immediate ribin-delete; `on_complete` fires once every table in
    /// `memberships` has completed its walk, letting the FSM finish its
    /// transition to IDLE or proceed to peer destruction.
    pub async fn close_peer(
        &self,
        peer_id: u64,
        memberships: Vec<(String, AddressFamily)>,
        graceful_restart: Option<GracefulRestartParams>,
        on_complete: impl FnOnce() + Send + 'static,
    ) {
        let mut stale_tables: Vec<Arc<Table>> = Vec::new();
        for (instance_name, family) in &memberships {
            let instance = match self.instance_mgr.get(instance_name) {
                Some(i) => i,
                None => continue,
            };
            let table = match instance.try_table(*family) {
                Some(t) => t,
                None => continue,
            };
            match graceful_restart {
                Some(gr) => {
                    let marked = table.mark_peer_stale(peer_id, gr.llgr);
                    debug!(
                        "peer {} close: marked {} paths stale in {}:{}",
                        peer_id, marked, instance_name, family
                    );
                    stale_tables.push(table);
                }
                None => {
                    let removed = table.remove_peer_paths(peer_id);
                    debug!(
                        "peer {} close: removed {} paths from {}:{}",
                        peer_id, removed, instance_name, family
                    );
                }
            }
        }

        if let Some(gr) = graceful_restart {
            if !stale_tables.is_empty() {
                tokio::spawn(async move {
                    sleep(gr.stale_timer).await;
                    let mut swept = 0;
                    for table in &stale_tables {
                        swept += table.remove_stale_peer_paths(peer_id);
                    }
                    info!(
                        "peer {} stale timer expired: swept {} leftover stale paths",
                        peer_id, swept
                    );
                });
            }
        }

        on_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_deleter_stays_pending_until_hook_agrees() {
        let deleter = Deleter::new();
        let allow = Arc::new(AtomicBool::new(false));
        let allow_clone = allow.clone();
        deleter.add_hook(move || allow_clone.load(Ordering::SeqCst));

        deleter.request_delete();
        assert_eq!(deleter.state(), DeleteState::DeletionPending);

        allow.store(true, Ordering::SeqCst);
        deleter.notify();
        assert_eq!(deleter.state(), DeleteState::Destroyed);
    }

    #[test]
    fn test_parent_cascades_to_dependent_and_waits_for_it() {
        let parent = Deleter::new();
        let child = Deleter::new();
        parent.add_dependent(&child);

        let child_may_delete = Arc::new(AtomicBool::new(false));
        let flag = child_may_delete.clone();
        child.add_hook(move || flag.load(Ordering::SeqCst));

        parent.request_delete();
        assert_eq!(parent.state(), DeleteState::DeletionPending);
        assert_eq!(child.state(), DeleteState::DeletionPending);

        child_may_delete.store(true, Ordering::SeqCst);
        child.notify();
        assert_eq!(child.state(), DeleteState::Destroyed);
        // the child's own destruction notified its parent back
        assert_eq!(parent.state(), DeleteState::Destroyed);
    }

    #[test]
    fn test_on_destroy_runs_exactly_once() {
        let deleter = Deleter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        deleter.on_destroy(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        deleter.request_delete();
        deleter.notify();
        deleter.notify();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_close_without_gr_removes_paths_immediately() {
        use crate::attr::AttrDb;
        use crate::route::{Path, PathSource, PeerRef, RouteKey};
        use ipnetwork::IpNetwork;
        use std::net::{IpAddr, Ipv4Addr};
        use std::time::Duration as StdDuration;

        let db = Arc::new(AttrDb::new());
        let mgr = InstanceMgr::new(db.clone());
        let master = mgr.get(crate::instance::MASTER_INSTANCE).unwrap();
        let table = master.table(AddressFamily::Inet);

        let alive = Arc::new(());
        let peer = PeerRef::new(
            9,
            IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)),
            true,
            &alive,
        );
        let attr = db.new_path(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let key = RouteKey::Inet("203.0.113.0/24".parse::<IpNetwork>().unwrap());
        table.enqueue_add(key.clone(), Path::new(Some(peer), 0, PathSource::BgpXmpp, attr));
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert_eq!(table.route_count(), 1);

        let close_mgr = PeerCloseManager::new(mgr.clone());
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        close_mgr
            .close_peer(
                9,
                vec![(crate::instance::MASTER_INSTANCE.to_string(), AddressFamily::Inet)],
                None,
                move || done_clone.store(true, Ordering::SeqCst),
            )
            .await;

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(table.route_count(), 0);
    }
}
