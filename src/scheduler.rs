//! Cooperative task-group scheduler (spec.md §5 "Scheduling model").
//!
//! Grounded in `table.rs`'s own per-partition worker task (the concrete
//! realization of the `db::Table` group — one task per partition, already
//! serialized by construction since each owns a single-consumer `mpsc`
//! receiver). This module formalizes the *other* named groups spec.md §5
//! requires (`bgp::Config`, `bgp::StateMachine`, `bgp::PeerMembership`,
//! `bgp::ShowCommand`, `io::Reader`) and the cross-group exclusion policy
//! between them and `db::Table`, using one `tokio::sync::RwLock<()>` per
//! partition as the mutual-exclusion primitive: a group that must exclude
//! `db::Table` takes a write guard on the partitions it touches; a reader
//! (`bgp::ShowCommand`) takes a read guard, so it "yields to writers"
//! without blocking other concurrent readers.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, RwLock};

use crate::table::PARTITION_COUNT;

/// Owns the locks backing every named task-group spec.md §5 requires.
/// Stateless beyond those locks — it coordinates, it doesn't execute.
pub struct Scheduler {
    /// One write/read lock per `db::Table` partition.
    partitions: Vec<Arc<RwLock<()>>>,
    /// `bgp::Config`: serialized; excludes `db::Table` on every partition.
    config: Mutex<()>,
    /// `bgp::PeerMembership`: serialized; excludes `db::Table` on the
    /// affected partitions only.
    peer_membership: Mutex<()>,
    /// `bgp::ShowCommand`: serialized among themselves, read-only against
    /// `db::Table`.
    show_command: Mutex<()>,
    /// `bgp::StateMachine`: serialized per-peer, parallel across peers.
    state_machines: StdMutex<HashMap<u64, Arc<Mutex<()>>>>,
    /// `io::Reader`: serialized per-connection, parallel across connections.
    io_readers: StdMutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        let partitions = (0..PARTITION_COUNT).map(|_| Arc::new(RwLock::new(()))).collect();
        Arc::new(Self {
            partitions,
            config: Mutex::new(()),
            peer_membership: Mutex::new(()),
            show_command: Mutex::new(()),
            state_machines: StdMutex::new(HashMap::new()),
            io_readers: StdMutex::new(HashMap::new()),
        })
    }

    /// Run `task` under the `db::Table` group's exclusion for `partition`
    /// (spec.md §5: "partition `i` tasks are mutually exclusive").
    pub async fn run_db_table<F, Fut, R>(&self, partition: usize, task: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let lock = self.partitions[partition].clone();
        let _guard = lock.write().await;
        task().await
    }

    /// Run `task` under `bgp::Config` (spec.md §5: "serialized; all
    /// instance/peer creation and teardown runs here", mutually exclusive
    /// with `db::Table`).
    pub async fn run_config<F, Fut, R>(&self, task: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _config = self.config.lock().await;
        let mut guards = Vec::with_capacity(self.partitions.len());
        for lock in &self.partitions {
            guards.push(lock.write().await);
        }
        task().await
    }

    /// Run `task` under `bgp::PeerMembership`, excluding `db::Table` only
    /// on `affected_partitions` (spec.md §5: "excludes `db::Table` on the
    /// affected partitions").
    pub async fn run_peer_membership<F, Fut, R>(&self, affected_partitions: &[usize], task: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _membership = self.peer_membership.lock().await;
        let mut sorted: Vec<usize> = affected_partitions.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for idx in &sorted {
            guards.push(self.partitions[*idx].write().await);
        }
        task().await
    }

    /// Run `task` under `bgp::ShowCommand` (spec.md §5: "serialized;
    /// introspection readers, yields to writers" — a read guard on each
    /// touched partition lets concurrent `db::Table` writers on *other*
    /// partitions proceed while this read blocks only that partition's
    /// writer).
    pub async fn run_show_command<F, Fut, R>(&self, partitions: &[usize], task: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _serial = self.show_command.lock().await;
        let mut sorted: Vec<usize> = partitions.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for idx in &sorted {
            guards.push(self.partitions[*idx].read().await);
        }
        task().await
    }

    /// Run `task` under `bgp::StateMachine` for `peer_id` (spec.md §5:
    /// "per-peer; a peer's FSM work is serialized per-peer but parallel
    /// across peers").
    pub async fn run_state_machine<F, Fut, R>(&self, peer_id: u64, task: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let lock = self
            .state_machines
            .lock()
            .unwrap()
            .entry(peer_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        task().await
    }

    /// Run `task` under `io::Reader` for `conn_id` (spec.md §5: "per-
    /// connection; drains from the socket into decoded messages").
    pub async fn run_io_reader<F, Fut, R>(&self, conn_id: u64, task: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let lock = self
            .io_readers
            .lock()
            .unwrap()
            .entry(conn_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        task().await
    }

    /// Drop the cached per-peer state-machine lock once a peer is fully
    /// destroyed, so the map doesn't grow unbounded across peer churn.
    pub fn forget_state_machine(&self, peer_id: u64) {
        self.state_machines.lock().unwrap().remove(&peer_id);
    }

    pub fn forget_io_reader(&self, conn_id: u64) {
        self.io_readers.lock().unwrap().remove(&conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_partition_tasks_serialize() {
        let sched = Scheduler::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let o1 = order.clone();
        let s1 = sched.clone();
        let t1 = tokio::spawn(async move {
            s1.run_db_table(0, || async move {
                sleep(Duration::from_millis(30)).await;
                o1.lock().unwrap().push(1);
            })
            .await;
        });
        sleep(Duration::from_millis(5)).await;
        let o2 = order.clone();
        let s2 = sched.clone();
        let t2 = tokio::spawn(async move {
            s2.run_db_table(0, || async move {
                o2.lock().unwrap().push(2);
            })
            .await;
        });
        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_partitions_run_concurrently() {
        let sched = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for partition in 0..2 {
            let sched = sched.clone();
            let counter = counter.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                sched
                    .run_db_table(partition, || async move {
                        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(30)).await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_config_excludes_db_table() {
        let sched = Scheduler::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let o1 = order.clone();
        let s1 = sched.clone();
        let writer = tokio::spawn(async move {
            s1.run_db_table(3, || async move {
                sleep(Duration::from_millis(30)).await;
                o1.lock().unwrap().push("db_table");
            })
            .await;
        });
        sleep(Duration::from_millis(5)).await;
        let o2 = order.clone();
        let s2 = sched.clone();
        let config = tokio::spawn(async move {
            s2.run_config(|| async move {
                o2.lock().unwrap().push("config");
            })
            .await;
        });
        writer.await.unwrap();
        config.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["db_table", "config"]);
    }

    #[tokio::test]
    async fn test_state_machine_locks_are_per_peer() {
        let sched = Scheduler::new();
        let a = sched.run_state_machine(1, || async { 1 + 1 }).await;
        let b = sched.run_state_machine(2, || async { 2 + 2 }).await;
        assert_eq!(a, 2);
        assert_eq!(b, 4);
        sched.forget_state_machine(1);
    }
}
