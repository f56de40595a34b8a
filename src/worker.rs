//! Worker execution core: per-depth deque chains, the local work loop,
//! and the dedicated steal loop.
//!
//! Every worker owns a singly-grown chain of [`DequeNode`]s, one per task
//! depth ("ply"): the root task lives in the head node, its children in the
//! next node, and so on. A worker only ever pushes and pops at the chain
//! node matching the depth it is currently executing at, which is what lets
//! the deque's single-owner protocol hold while arbitrarily deep recursion
//! shares one worker.
//!
//! The topology assigns each worker at most one victim. Victim links are
//! mirrored depth-by-depth onto the chain as both sides materialize depths,
//! so a worker blocked at depth `d` steals from its victim's depth-`d` node
//! and keeps the stolen subtree at a comparable recursion depth.
//!
//! A chain node can be in three observable states for a thief: holding
//! work, empty, or *null*. Null means the depth either was never
//! materialized by the owner or has been fully drained with no outstanding
//! stolen tasks; thieves walking a chain move forward (deeper) on empty and
//! backward on null.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_utils::{Backoff, CachePadded};

use crate::arena::LifoArena;
use crate::deque::{Deque, Growable, Steal};
use crate::stats::WorkerStats;
use crate::task::{state, Task, TaskCell, TaskRef};

// ============================================================================
// Chain nodes
// ============================================================================

/// One depth of a worker's deque chain.
pub(crate) struct DequeNode {
    deque: Growable<TaskRef>,
    /// Depth not materialized, or drained with nothing outstanding.
    null: AtomicBool,
    /// Tasks stolen from this node and not yet finished by their thieves.
    /// Advisory only: join correctness is carried by the per-task child
    /// counters, this feeds the null flag and statistics.
    nstolen: AtomicUsize,
    /// Next (deeper) node. Set exactly once, by the owning worker.
    next: OnceLock<Arc<DequeNode>>,
    /// Previous (shallower) node. Weak to keep the chain acyclic for `Arc`.
    prev: Weak<DequeNode>,
    /// Same-depth node of the topology-assigned victim, mirrored lazily.
    victim: OnceLock<Arc<DequeNode>>,
}

/// Outcome of a steal attempt against a chain node.
pub(crate) enum NodeSteal {
    Task(TaskRef),
    /// Materialized but nothing available.
    Empty,
    /// Never materialized or fully drained; walk back toward the head.
    Null,
    /// Lost the top race to another thread.
    Race,
}

impl DequeNode {
    fn new(log2_capacity: u32, null: bool, prev: Weak<DequeNode>) -> Self {
        Self {
            deque: Growable::with_log2_capacity(log2_capacity),
            null: AtomicBool::new(null),
            nstolen: AtomicUsize::new(0),
            next: OnceLock::new(),
            prev,
            victim: OnceLock::new(),
        }
    }

    /// Head node of a worker chain. Materialized from the start.
    pub(crate) fn new_head(log2_capacity: u32) -> Arc<Self> {
        Arc::new(Self::new(log2_capacity, false, Weak::new()))
    }

    /// Wire the same-depth victim node. Head-level links come from the
    /// topology at startup; deeper links are mirrored by `grow_tail`.
    pub(crate) fn set_victim(&self, victim: Arc<DequeNode>) {
        self.victim
            .set(victim)
            .unwrap_or_else(|_| unreachable!("victim link wired twice"));
    }

    /// Owner protocol: publish a task at this depth.
    fn put(&self, t: TaskRef) {
        // SAFETY: called only by the worker owning this chain.
        if unsafe { self.deque.push_bottom(t) }.is_err() {
            unreachable!("growable deque push cannot fail");
        }
        if self.null.load(Ordering::Relaxed) {
            self.null.store(false, Ordering::Release);
        }
    }

    /// Owner protocol: take the most recent task at this depth.
    ///
    /// Marks the node null when it comes up empty with no stolen tasks
    /// outstanding, steering thieves back toward shallower depths.
    fn take(&self) -> Option<TaskRef> {
        // SAFETY: called only by the worker owning this chain.
        match unsafe { self.deque.pop_bottom() } {
            Some(t) => Some(t),
            None => {
                if self.nstolen.load(Ordering::Acquire) == 0 {
                    self.null.store(true, Ordering::Release);
                }
                None
            }
        }
    }

    /// Thief protocol.
    fn steal_from(&self) -> NodeSteal {
        if self.null.load(Ordering::Acquire) {
            return NodeSteal::Null;
        }
        match self.deque.steal() {
            Steal::Success(t) => {
                self.nstolen.fetch_add(1, Ordering::Relaxed);
                NodeSteal::Task(t)
            }
            Steal::Empty => NodeSteal::Empty,
            Steal::Retry => NodeSteal::Race,
        }
    }

    /// Thief protocol: the stolen task (and its whole subtree) finished.
    fn return_stolen(&self) {
        let prev = self.nstolen.fetch_sub(1, Ordering::Release);
        debug_assert!(prev >= 1, "nstolen underflow");
    }
}

// ============================================================================
// Worker core
// ============================================================================

/// Per-worker execution state. Owned by exactly one thread; tasks allocated
/// here may be executed anywhere.
pub(crate) struct WorkerCore {
    id: usize,
    arena: LifoArena,
    head: Arc<DequeNode>,
    /// Deepest victim node mirrored onto this worker's chain so far.
    victim_tail: Option<Arc<DequeNode>>,
    stopped: Arc<AtomicBool>,
    deque_log2: u32,
    stats: CachePadded<WorkerStats>,
}

impl WorkerCore {
    pub(crate) fn new(
        id: usize,
        head: Arc<DequeNode>,
        victim_head: Option<Arc<DequeNode>>,
        stopped: Arc<AtomicBool>,
        deque_log2: u32,
    ) -> Self {
        if let Some(v) = &victim_head {
            head.set_victim(Arc::clone(v));
        }
        Self {
            id,
            arena: LifoArena::new(),
            head,
            victim_tail: victim_head,
            stopped,
            deque_log2,
            stats: CachePadded::new(WorkerStats::default()),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn head(&self) -> &Arc<DequeNode> {
        &self.head
    }

    /// Allocate a task cell in this worker's arena.
    pub(crate) fn alloc_task<T: Task + 'static>(
        &mut self,
        task: T,
        join: *const AtomicUsize,
    ) -> TaskRef {
        let cell = self.arena.alloc(TaskCell::new(task, join));
        TaskRef(cell.cast())
    }

    /// Publish a task at `node`.
    pub(crate) fn put_task(&mut self, node: &Arc<DequeNode>, t: TaskRef) {
        t.header().transition(&[state::FRESH], state::READY);
        self.stats.put += 1;
        node.put(t);
    }

    /// Lazily materialize the next depth of the chain, mirroring the victim
    /// chain one node at a time as the victim materializes its own depths.
    fn grow_tail(&mut self, tail: &Arc<DequeNode>) -> Arc<DequeNode> {
        if let Some(next) = tail.next.get() {
            return Arc::clone(next);
        }

        let node = Arc::new(DequeNode::new(
            self.deque_log2,
            true,
            Arc::downgrade(tail),
        ));

        if let Some(vt) = &self.victim_tail {
            if let Some(vnext) = vt.next.get() {
                node.set_victim(Arc::clone(vnext));
                self.victim_tail = Some(Arc::clone(vnext));
            }
        }

        tail.next
            .set(Arc::clone(&node))
            .unwrap_or_else(|_| unreachable!("chain tail grown twice"));
        node
    }

    /// Execute tasks until `until` reaches zero.
    ///
    /// The loop prefers local work at `tail` (LIFO), then a single targeted
    /// steal from the same-depth victim node. It never parks; between empty
    /// rounds it spin-hints and re-polls the counter.
    pub(crate) fn local_loop(&mut self, tail: &Arc<DequeNode>, until: &AtomicUsize) {
        let backoff = Backoff::new();
        loop {
            if until.load(Ordering::Acquire) == 0 {
                return;
            }

            if let Some(t) = tail.take() {
                self.stats.take += 1;
                let child = self.grow_tail(tail);
                t.header().transition(&[state::READY], state::TAKEN);
                // SAFETY: take() hands the task to this worker exclusively.
                unsafe { t.process(self, &child) };
                backoff.reset();
                continue;
            }
            self.stats.take_failed += 1;

            if let Some(victim) = tail.victim.get().map(Arc::clone) {
                match victim.steal_from() {
                    NodeSteal::Task(t) => {
                        self.stats.single_steal += 1;
                        let child = self.grow_tail(tail);
                        t.header().transition(&[state::READY], state::STOLEN);
                        // SAFETY: the steal CAS handed the task to this
                        // worker exclusively.
                        unsafe { t.process(self, &child) };
                        victim.return_stolen();
                        backoff.reset();
                        continue;
                    }
                    _ => self.stats.single_steal_failed += 1,
                }
            }

            // Escalates from spinning to yielding, so a waiter whose whole
            // subtree was stolen does not burn its timeslice on an
            // oversubscribed host.
            backoff.snooze();
        }
    }

    /// Dedicated stealing path for workers with no submitted work of their
    /// own. Walks the victim's chain until the cooperative stop flag is set:
    /// forward on empty (deeper plies may hold work), backward on null
    /// (depth drained, shallower plies may have refilled).
    ///
    /// Stolen tasks run with this worker's own head as their child deque,
    /// so their subtrees spill into this worker's chain and become
    /// stealable by *its* thieves in turn.
    pub(crate) fn steal_loop(&mut self) {
        let backoff = Backoff::new();

        let Some(mut vnode) = self.head.victim.get().map(Arc::clone) else {
            // Leaf of the victim forest: nothing to steal, wait for stop.
            while !self.stopped.load(Ordering::Acquire) {
                backoff.snooze();
            }
            return;
        };

        while !self.stopped.load(Ordering::Acquire) {
            match vnode.steal_from() {
                NodeSteal::Task(t) => {
                    self.stats.multiple_steal += 1;
                    let child = Arc::clone(&self.head);
                    t.header().transition(&[state::READY], state::STOLEN);
                    // SAFETY: the steal CAS handed the task to this worker
                    // exclusively.
                    unsafe { t.process(self, &child) };
                    vnode.return_stolen();
                    backoff.reset();
                }
                NodeSteal::Empty => {
                    self.stats.multiple_steal_failed += 1;
                    match vnode.next.get() {
                        Some(next) => vnode = Arc::clone(next),
                        None => backoff.snooze(),
                    }
                }
                NodeSteal::Null => {
                    self.stats.multiple_steal_failed += 1;
                    match vnode.prev.upgrade() {
                        Some(prev) => vnode = prev,
                        None => backoff.snooze(),
                    }
                }
                NodeSteal::Race => {
                    self.stats.multiple_steal_failed += 1;
                    backoff.spin();
                }
            }
        }
    }

    /// Fold deque resize counts into the event counters and return them.
    /// Called once, after the worker has stopped executing tasks.
    pub(crate) fn finalize_stats(&mut self) -> WorkerStats {
        let mut resizes = 0;
        let mut node = Some(Arc::clone(&self.head));
        while let Some(n) = node {
            resizes += n.deque.resize_count();
            node = n.next.get().map(Arc::clone);
        }
        self.stats.resize = resizes;
        *self.stats
    }
}

// ============================================================================
// Tests
// ============================================================================
