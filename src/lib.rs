//! Fork-join task-parallel runtime with per-depth work-stealing deques.
//!
//! ## Scope
//! This crate schedules dynamically unfolding task trees over a fixed pool
//! of workers. Tasks spawn children and wait for them; idle workers steal
//! from a statically chosen victim rather than scanning the whole pool.
//!
//! ## Key invariants
//! - Every deque has one owner; push and pop happen only on the owner
//!   thread, steals may come from anywhere. A contended last element goes
//!   to exactly one side.
//! - Each worker keeps one deque per task depth ("ply"), so deep recursion
//!   never mixes depths in a single deque and stolen subtrees stay at a
//!   comparable depth on the thief.
//! - Victim links are fixed at startup by hardware topology and form a
//!   forest: no steal cycles, bounded fan-in per victim.
//! - A task never finishes with unresolved children; join waiting polls,
//!   it never parks.
//!
//! ## Run flow
//! 1) Build the topology and victim forest from the machine shape.
//! 2) Spawn worker threads; each runs a steal loop against its victim.
//! 3) The caller becomes worker 0 and submits a root via
//!    [`Scheduler::spawn_and_wait`], executing tasks until the tree joins.
//! 4) [`Scheduler::terminate`] stops the pool and merges event counters.
//!
//! ## Notable entry points
//! - [`Scheduler`] / [`SchedulerConfig`]: pool lifecycle.
//! - [`Task`] / [`TaskCtx`]: user work, spawning, joining.
//! - [`Topology`] / [`TopologyConfig`]: placement and the victim graph.
//! - [`deque`]: the work-stealing deque backends, usable standalone.
//!
//! ## Design trade-offs
//! Static single-victim stealing trades work-distribution flexibility for
//! predictable cache and interconnect traffic; the per-depth chains trade a
//! little memory per worker for depth-aligned steals. Grown deque buffers
//! are retired rather than freed until the deque drops, buying safe
//! concurrent steals without an epoch scheme.

pub mod deque;

mod affinity;
mod arena;
mod scheduler;
mod stats;
mod task;
mod topology;
mod worker;

pub use affinity::{allowed_cpus, pin_current_thread, AffinityError, CpuSet};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError};
pub use stats::{StatsSnapshot, WorkerStats};
pub use task::{Task, TaskCtx};
pub use topology::{LinkKind, Topology, TopologyConfig, TopologyError, WorkerDesc};
