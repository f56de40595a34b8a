//! Scheduler lifecycle: configuration, worker spawning, root submission,
//! and shutdown.
//!
//! The calling thread *is* worker 0. `Scheduler::new` builds the topology,
//! materializes every worker's head deque node, wires the static victim
//! links, and spawns one OS thread per remaining worker running the steal
//! loop. `spawn_and_wait` then runs worker 0's local loop on the caller
//! until the submitted root task's tree completes, so a run never needs a
//! handoff between the caller and the pool.
//!
//! Shutdown is cooperative: `terminate` (or `Drop`) raises the shared stop
//! flag, joins the worker threads, and merges their event counters into a
//! [`StatsSnapshot`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;

use crate::affinity;
use crate::stats::{StatsSnapshot, WorkerStats};
use crate::task::Task;
use crate::topology::{Topology, TopologyConfig, TopologyError};
use crate::worker::{DequeNode, WorkerCore};

/// Scheduler parameters. Zero-valued fields derive from the machine.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Worker count; 0 uses every cpu `available_parallelism` reports.
    pub workers: usize,
    /// Initial per-deque capacity is `1 << deque_log2_size`.
    pub deque_log2_size: u32,
    /// Maximum thieves assigned per victim in the topology.
    pub max_thieves: usize,
    /// Remaining-worker threshold below which a socket's second
    /// hardware-thread pass is skipped during topology construction.
    pub threads_threshold: usize,
    /// Pin each worker thread to its topology cpu. Failure to pin is a
    /// warning, never an error.
    pub pin_threads: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            deque_log2_size: 8,
            max_thieves: 1,
            threads_threshold: 4,
            pin_threads: false,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.deque_log2_size == 0 || self.deque_log2_size > 24 {
            return Err(SchedulerError::InvalidConfig(
                "deque_log2_size must be in 1..=24",
            ));
        }
        if self.max_thieves == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_thieves must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A running worker pool. One instance owns its threads; dropping it
/// terminates them.
pub struct Scheduler {
    topology: Topology,
    /// Worker 0, executed by whichever thread calls `spawn_and_wait`.
    master: WorkerCore,
    handles: Vec<JoinHandle<WorkerStats>>,
    stopped: Arc<AtomicBool>,
    terminated: bool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let topology = Topology::new(TopologyConfig {
            workers: config.workers,
            max_thieves: config.max_thieves,
            threads_threshold: config.threads_threshold,
            ..TopologyConfig::default()
        })?;
        tracing::debug!(workers = topology.nworkers(), "victim graph\n{topology}");

        let stopped = Arc::new(AtomicBool::new(false));

        // Head nodes first: victim links point at heads that must exist
        // before any worker starts.
        let heads: Vec<Arc<DequeNode>> = (0..topology.nworkers())
            .map(|_| DequeNode::new_head(config.deque_log2_size))
            .collect();

        let mut cores: Vec<Option<WorkerCore>> = (0..topology.nworkers())
            .map(|id| {
                let victim = topology.worker(id).victim.map(|v| Arc::clone(&heads[v]));
                Some(WorkerCore::new(
                    id,
                    Arc::clone(&heads[id]),
                    victim,
                    Arc::clone(&stopped),
                    config.deque_log2_size,
                ))
            })
            .collect();

        let master = cores[0].take().expect("worker 0 exists");
        if config.pin_threads {
            pin_or_warn(0, topology.worker(0).cpu);
        }

        let mut handles = Vec::with_capacity(topology.nworkers().saturating_sub(1));
        for id in 1..topology.nworkers() {
            let mut core = cores[id].take().expect("worker exists");
            let cpu = topology.worker(id).cpu;
            let pin = config.pin_threads;

            let spawned = std::thread::Builder::new()
                .name(format!("plywork-worker-{id}"))
                .spawn(move || {
                    if pin {
                        pin_or_warn(id, cpu);
                    }
                    tracing::trace!(worker = id, "steal loop starting");
                    core.steal_loop();
                    tracing::trace!(worker = id, "steal loop stopped");
                    core.finalize_stats()
                });

            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    // Unwind the pool before reporting: threads already
                    // running must not outlive their victim deques.
                    stopped.store(true, Ordering::Release);
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(SchedulerError::Spawn(e));
                }
            }
        }

        tracing::info!(workers = topology.nworkers(), "scheduler started");

        Ok(Self {
            topology,
            master,
            handles,
            stopped,
            terminated: false,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Submit a root task and run it to completion on the calling thread as
    /// worker 0. Returns once the whole task tree has finished. Callable
    /// repeatedly on the same pool.
    pub fn spawn_and_wait<T: Task + 'static>(&mut self, root: T) {
        let latch = AtomicUsize::new(1);
        let t = self.master.alloc_task(root, &latch as *const AtomicUsize);
        let head = Arc::clone(self.master.head());
        self.master.put_task(&head, t);
        self.master.local_loop(&head, &latch);
        debug_assert_eq!(latch.load(Ordering::Relaxed), 0);
    }

    /// Stop all workers, join their threads, and return merged statistics.
    /// Subsequent calls return an empty snapshot.
    pub fn terminate(&mut self) -> StatsSnapshot {
        if self.terminated {
            return StatsSnapshot::default();
        }
        self.terminated = true;

        self.stopped.store(true, Ordering::Release);

        let mut per_worker = vec![self.master.finalize_stats()];
        for h in self.handles.drain(..) {
            match h.join() {
                Ok(stats) => per_worker.push(stats),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }

        let snapshot = StatsSnapshot::new(per_worker);
        tracing::info!(
            executed = snapshot.total.executed(),
            steals = snapshot.total.single_steal + snapshot.total.multiple_steal,
            "scheduler terminated"
        );
        snapshot
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn pin_or_warn(worker: usize, cpu: usize) {
    if let Err(e) = affinity::pin_current_thread(cpu) {
        tracing::warn!(worker, cpu, error = %e, "failed to pin worker thread");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::task::TaskCtx;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Leaf {
        hits: Arc<AtomicUsize>,
    }

    impl Task for Leaf {
        fn execute(&mut self, _ctx: &mut TaskCtx<'_>) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct Fanout {
        width: usize,
        hits: Arc<AtomicUsize>,
    }

    impl Task for Fanout {
        fn execute(&mut self, ctx: &mut TaskCtx<'_>) {
            for _ in 0..self.width {
                ctx.spawn(Leaf {
                    hits: Arc::clone(&self.hits),
                });
            }
            ctx.wait_for_all();
        }
    }

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            workers,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn rejects_zero_deque_size() {
        let err = Scheduler::new(SchedulerConfig {
            deque_log2_size: 0,
            ..SchedulerConfig::default()
        });
        assert!(matches!(err, Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_max_thieves() {
        let err = Scheduler::new(SchedulerConfig {
            max_thieves: 0,
            ..SchedulerConfig::default()
        });
        assert!(matches!(err, Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn single_worker_runs_to_completion() {
        let mut s = Scheduler::new(config(1)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        s.spawn_and_wait(Fanout {
            width: 200,
            hits: Arc::clone(&hits),
        });
        assert_eq!(hits.load(Ordering::Relaxed), 200);

        let stats = s.terminate();
        assert_eq!(stats.total.put, 201);
        assert_eq!(stats.total.executed(), 201);
    }

    #[test]
    fn pool_accounting_balances() {
        let mut s = Scheduler::new(config(4)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        s.spawn_and_wait(Fanout {
            width: 2_000,
            hits: Arc::clone(&hits),
        });
        assert_eq!(hits.load(Ordering::Relaxed), 2_000);

        let stats = s.terminate();
        // Every published task was executed by exactly one worker.
        assert_eq!(stats.total.put, stats.total.executed());
    }

    #[test]
    fn pool_is_reusable_across_roots() {
        let mut s = Scheduler::new(config(2)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            s.spawn_and_wait(Fanout {
                width: 100,
                hits: Arc::clone(&hits),
            });
        }
        assert_eq!(hits.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn drop_without_terminate_joins_workers() {
        let s = Scheduler::new(config(4)).unwrap();
        drop(s);
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut s = Scheduler::new(config(2)).unwrap();
        let first = s.terminate();
        let second = s.terminate();
        assert!(!first.workers.is_empty());
        assert!(second.workers.is_empty());
    }
}
