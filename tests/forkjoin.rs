//! End-to-end fork-join runs through the public scheduler API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use plywork::{Scheduler, SchedulerConfig, Task, TaskCtx};

fn pool(workers: usize) -> Scheduler {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Scheduler::new(SchedulerConfig {
        workers,
        ..SchedulerConfig::default()
    })
    .expect("scheduler construction")
}

/// Splits a leaf range in half until single leaves remain; every leaf bumps
/// the accumulator once.
struct RangeSplit {
    leaves: usize,
    hits: Arc<AtomicUsize>,
}

impl Task for RangeSplit {
    fn execute(&mut self, ctx: &mut TaskCtx<'_>) {
        if self.leaves == 1 {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let left = self.leaves / 2;
        ctx.spawn(RangeSplit {
            leaves: left,
            hits: Arc::clone(&self.hits),
        });
        ctx.spawn(RangeSplit {
            leaves: self.leaves - left,
            hits: Arc::clone(&self.hits),
        });
        ctx.wait_for_all();
    }
}

/// Naive fib recursion; base cases add `n` (0 or 1), so the accumulator
/// totals fib(n) when the whole tree has joined.
struct Fib {
    n: u64,
    acc: Arc<AtomicUsize>,
}

impl Task for Fib {
    fn execute(&mut self, ctx: &mut TaskCtx<'_>) {
        if self.n <= 1 {
            self.acc.fetch_add(self.n as usize, Ordering::Relaxed);
            return;
        }
        ctx.spawn(Fib {
            n: self.n - 1,
            acc: Arc::clone(&self.acc),
        });
        ctx.spawn(Fib {
            n: self.n - 2,
            acc: Arc::clone(&self.acc),
        });
        // No explicit wait: completion relies on the implicit drain.
    }
}

/// One child per level; exercises chain growth far past the initial depth.
struct DeepChain {
    depth: usize,
    hits: Arc<AtomicUsize>,
}

impl Task for DeepChain {
    fn execute(&mut self, ctx: &mut TaskCtx<'_>) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if self.depth > 0 {
            ctx.spawn(DeepChain {
                depth: self.depth - 1,
                hits: Arc::clone(&self.hits),
            });
            ctx.wait_for_all();
        }
    }
}

fn run_tree(workers: usize, leaves: usize) {
    let mut s = pool(workers);
    let hits = Arc::new(AtomicUsize::new(0));
    s.spawn_and_wait(RangeSplit {
        leaves,
        hits: Arc::clone(&hits),
    });
    assert_eq!(hits.load(Ordering::Relaxed), leaves, "workers={workers}");

    let stats = s.terminate();
    assert_eq!(
        stats.total.put,
        stats.total.executed(),
        "every published task must execute exactly once"
    );
}

#[test]
fn thousand_leaves_one_worker() {
    run_tree(1, 1_000);
}

#[test]
fn thousand_leaves_two_workers() {
    run_tree(2, 1_000);
}

#[test]
fn thousand_leaves_eight_workers() {
    run_tree(8, 1_000);
}

#[test]
fn fib_tree_joins_to_correct_value() {
    let mut s = pool(4);
    let acc = Arc::new(AtomicUsize::new(0));
    s.spawn_and_wait(Fib {
        n: 20,
        acc: Arc::clone(&acc),
    });
    assert_eq!(acc.load(Ordering::Relaxed), 6_765);
}

#[test]
fn deep_chain_grows_depth() {
    let mut s = pool(2);
    let hits = Arc::new(AtomicUsize::new(0));
    s.spawn_and_wait(DeepChain {
        depth: 500,
        hits: Arc::clone(&hits),
    });
    assert_eq!(hits.load(Ordering::Relaxed), 501);
}

#[test]
fn pool_survives_many_roots() {
    let mut s = pool(4);
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        s.spawn_and_wait(RangeSplit {
            leaves: 64,
            hits: Arc::clone(&hits),
        });
    }
    assert_eq!(hits.load(Ordering::Relaxed), 20 * 64);
}

#[test]
fn default_worker_count_runs() {
    let mut s = Scheduler::new(SchedulerConfig::default()).expect("scheduler construction");
    let hits = Arc::new(AtomicUsize::new(0));
    s.spawn_and_wait(RangeSplit {
        leaves: 256,
        hits: Arc::clone(&hits),
    });
    assert_eq!(hits.load(Ordering::Relaxed), 256);
}
