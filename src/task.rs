//! Task capability and its raw in-memory representation.
//!
//! User work implements [`Task`]; the runtime stores every task as an
//! arena-allocated [`TaskCell`]: a header (join pointer, unresolved-child
//! counter, execution thunk) followed by the user payload. Deques move
//! opaque [`TaskRef`] handles; the monomorphized thunk recovers the concrete
//! payload type when a worker executes the task.
//!
//! # Join protocol
//!
//! `spawn` increments the spawning task's unresolved-child counter *before*
//! publishing the child, so the counter can never be observed below the
//! number of live children. Completion decrements the parent's counter with
//! release ordering; `wait_for_all` (and the implicit drain that runs if the
//! user never waits) polls it with acquire loads between work items. There
//! is no parking and no completion callback.
//!
//! A task finishes only after its own counter is zero, which is what makes
//! the parent's storage outlive every child.

use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::worker::{DequeNode, WorkerCore};

/// A unit of user work.
///
/// `execute` is invoked exactly once, on whichever worker takes or steals
/// the task. `ctx` is only usable from within that invocation.
pub trait Task: Send {
    fn execute(&mut self, ctx: &mut TaskCtx<'_>);
}

/// Opaque handle to an arena-resident task. This is what deques carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TaskRef(pub(crate) NonNull<TaskHeader>);

// SAFETY: the pointee is arena storage that outlives the scheduler run, and
// every access after publication goes through the deque protocol, which
// hands the task to exactly one executing worker.
unsafe impl Send for TaskRef {}

/// Execution thunk: recovers the concrete cell type, runs the payload,
/// drains unresolved children, drops the payload, and notifies the join
/// counter.
pub(crate) type ProcessFn = unsafe fn(NonNull<TaskHeader>, &mut WorkerCore, &Arc<DequeNode>);

/// Type-erased prefix of every task cell.
#[repr(C)]
pub(crate) struct TaskHeader {
    /// The counter to decrement on completion: the parent's `children`, or
    /// the scheduler's root latch. Never dereferenced after the decrement.
    join: *const AtomicUsize,
    /// Children spawned and not yet finished.
    children: AtomicUsize,
    process: ProcessFn,
    #[cfg(debug_assertions)]
    state: std::sync::atomic::AtomicU8,
}

/// Task lifecycle states, checked in debug builds only.
pub(crate) mod state {
    pub const FRESH: u8 = 0;
    pub const READY: u8 = 1;
    pub const TAKEN: u8 = 2;
    pub const STOLEN: u8 = 3;
    pub const EXECUTING: u8 = 4;
    pub const FINISHED: u8 = 5;
}

impl TaskHeader {
    /// Debug-only state transition with a legality check.
    #[cfg(debug_assertions)]
    pub(crate) fn transition(&self, allowed_from: &[u8], to: u8) {
        let from = self.state.swap(to, Ordering::AcqRel);
        assert!(
            allowed_from.contains(&from),
            "invalid task state transition {from} -> {to}"
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    pub(crate) fn transition(&self, _allowed_from: &[u8], _to: u8) {}
}

/// Header plus concrete payload. `repr(C)` so a cell pointer is a valid
/// header pointer.
#[repr(C)]
pub(crate) struct TaskCell<T: Task> {
    header: TaskHeader,
    payload: UnsafeCell<ManuallyDrop<T>>,
}

impl<T: Task + 'static> TaskCell<T> {
    pub(crate) fn new(payload: T, join: *const AtomicUsize) -> Self {
        Self {
            header: TaskHeader {
                join,
                children: AtomicUsize::new(0),
                process: process_thunk::<T>,
                #[cfg(debug_assertions)]
                state: std::sync::atomic::AtomicU8::new(state::FRESH),
            },
            payload: UnsafeCell::new(ManuallyDrop::new(payload)),
        }
    }
}

impl TaskRef {
    pub(crate) fn header(&self) -> &TaskHeader {
        // SAFETY: arena storage, valid for the scheduler's lifetime.
        unsafe { self.0.as_ref() }
    }

    /// Run this task to completion on `worker`, spawning children into
    /// `child_deque`.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per task, by the worker that took or
    /// stole it, with its state at `TAKEN` or `STOLEN`.
    pub(crate) unsafe fn process(self, worker: &mut WorkerCore, child_deque: &Arc<DequeNode>) {
        (self.header().process)(self.0, worker, child_deque)
    }
}

/// Monomorphized execution path for payload type `T`.
///
/// # Safety
///
/// `h` must point at a live `TaskCell<T>` in the `TAKEN` or `STOLEN` state
/// that no other thread is accessing.
unsafe fn process_thunk<T: Task + 'static>(
    h: NonNull<TaskHeader>,
    worker: &mut WorkerCore,
    child_deque: &Arc<DequeNode>,
) {
    let cell = h.cast::<TaskCell<T>>();
    let header = h.as_ref();

    header.transition(&[state::TAKEN, state::STOLEN], state::EXECUTING);

    {
        let mut ctx = TaskCtx {
            worker,
            header: h,
            child_deque: Arc::clone(child_deque),
        };
        let payload = &mut *cell.as_ref().payload.get();
        payload.execute(&mut ctx);
    }

    // A task never finishes with unresolved children: drain anything the
    // user did not explicitly wait on.
    if header.children.load(Ordering::Acquire) != 0 {
        worker.local_loop(child_deque, &header.children);
    }
    debug_assert_eq!(header.children.load(Ordering::Relaxed), 0);

    // Payload is dead from here on; the arena will not drop it.
    ManuallyDrop::drop(&mut *cell.as_ref().payload.get());

    header.transition(&[state::EXECUTING], state::FINISHED);

    // Notify the join counter last: once the parent observes zero it may
    // finish, and nothing may touch this task afterwards anyway.
    let join = header.join;
    let prev = (*join).fetch_sub(1, Ordering::Release);
    debug_assert!(prev >= 1, "join counter underflow");
}

/// Per-invocation handle passed to [`Task::execute`].
///
/// Spawning pushes the child onto the *next-depth* deque of the executing
/// worker, where any permitted thief may pick it up (continuation
/// stealing). Waiting keeps this worker executing and stealing work until
/// the spawned children are all finished.
pub struct TaskCtx<'a> {
    worker: &'a mut WorkerCore,
    header: NonNull<TaskHeader>,
    child_deque: Arc<DequeNode>,
}

impl TaskCtx<'_> {
    /// Spawn a child task. The child may run on any worker.
    pub fn spawn<T: Task + 'static>(&mut self, task: T) {
        // SAFETY: `header` points at the currently executing task's cell.
        let children = unsafe { &self.header.as_ref().children } as *const AtomicUsize;

        let child = self.worker.alloc_task(task, children);

        // Count before publish: the child could finish on another worker
        // before this function returns.
        unsafe { self.header.as_ref() }
            .children
            .fetch_add(1, Ordering::Relaxed);

        self.worker.put_task(&self.child_deque, child);
    }

    /// Run the local loop until every child spawned so far has finished.
    ///
    /// Never blocks: between work items the calling worker polls the
    /// unresolved-child counter, executes its own ready tasks, and steals
    /// from its assigned victim.
    pub fn wait_for_all(&mut self) {
        // SAFETY: header outlives this call; the counter address is stable.
        let children = unsafe { &self.header.as_ref().children };
        let deque = Arc::clone(&self.child_deque);
        self.worker.local_loop(&deque, children);
    }

    /// Id of the worker currently executing this task.
    pub fn worker_id(&self) -> usize {
        self.worker.id()
    }
}
