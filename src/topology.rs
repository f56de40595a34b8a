//! Static worker topology and victim graph.
//!
//! Built once at startup, immutable afterwards. Two deterministic phases:
//!
//! 1. **Map construction**: enumerate hardware coordinates
//!    (hardware-thread × socket × core) and assign consecutive worker ids,
//!    keyed by cpu id. The second hardware-thread pass walks cores in reverse
//!    and is only taken while more than `threads_threshold` workers remain
//!    unplaced, so a handful of leftover workers is not fragmented across
//!    hyperthreads.
//! 2. **Victim linking**: each worker gets at most `max_thieves` thieves,
//!    preferring locality: the next socket's first core (which then keeps a
//!    single thief, to bound cross-socket traffic), the neighbouring core on
//!    the same hardware thread, the next hardware thread on the same core,
//!    then further cores on the same thread. A worker holds at most one
//!    victim, and a link is rejected if it would close a cycle, so the
//!    victim relation is always a forest.
//!
//! The `victim` field of a descriptor names the worker this one steals from;
//! thieves of `w` are the workers whose `victim` is `w`.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Locality class of a victim link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// Neighbouring core on the same hardware thread.
    Core,
    /// Same core, different hardware thread.
    Thread,
    /// First core of the next socket.
    Socket,
}

/// One worker's hardware placement and victim assignment. Immutable after
/// the topology is built.
#[derive(Clone, Copy, Debug)]
pub struct WorkerDesc {
    /// Dense worker id in `0..nworkers`.
    pub id: usize,
    pub socket: usize,
    /// Hardware thread within the core (0 or 1 on SMT-2 machines).
    pub thread: usize,
    pub core: usize,
    /// Cpu this worker is pinned to.
    pub cpu: usize,
    /// Worker id this worker steals from, if any.
    pub victim: Option<usize>,
    /// Locality class of the victim link. Meaningless when `victim` is None.
    pub link: LinkKind,
}

/// Topology build parameters. Zero means "derive from the machine".
#[derive(Clone, Copy, Debug)]
pub struct TopologyConfig {
    /// Number of workers; 0 uses every enumerated cpu.
    pub workers: usize,
    /// Maximum thieves assigned per victim.
    pub max_thieves: usize,
    /// Remaining-worker threshold below which the second hardware-thread
    /// pass of a socket is skipped.
    pub threads_threshold: usize,
    /// Socket count; 0 defaults to 1.
    pub sockets: usize,
    /// Hardware threads per core; 0 defaults to 2.
    pub threads_per_core: usize,
    /// Cores per socket; 0 derives from `available_parallelism`.
    pub cores: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_thieves: 1,
            threads_threshold: 4,
            sockets: 0,
            threads_per_core: 0,
            cores: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("max_thieves must be at least 1")]
    ZeroMaxThieves,
    #[error("requested {requested} workers but the topology has no cpu slots")]
    NoWorkers { requested: usize },
}

/// The built topology: worker map plus victim graph.
#[derive(Debug)]
pub struct Topology {
    nsockets: usize,
    nthreads: usize,
    ncores: usize,
    nworkers: usize,
    max_thieves: usize,
    thr_threshold: usize,
    /// Descriptors keyed by cpu id. Iteration order (ascending cpu) is
    /// semantic: victim linking scans workers in this order.
    workers: BTreeMap<usize, WorkerDesc>,
    /// Cpu of each worker, indexed by worker id.
    cpu_of: Vec<usize>,
}

impl Topology {
    pub fn new(cfg: TopologyConfig) -> Result<Self, TopologyError> {
        if cfg.max_thieves == 0 {
            return Err(TopologyError::ZeroMaxThieves);
        }

        let nsockets = cfg.sockets.max(1);
        let nthreads = if cfg.threads_per_core == 0 {
            2
        } else {
            cfg.threads_per_core
        };
        let ncores = if cfg.cores == 0 {
            let hw = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (hw / (nsockets * nthreads)).max(1)
        } else {
            cfg.cores
        };

        let nworkers = if cfg.workers == 0 {
            nsockets * nthreads * ncores
        } else {
            cfg.workers
        };

        let mut topo = Self {
            nsockets,
            nthreads,
            ncores,
            nworkers,
            max_thieves: cfg.max_thieves,
            thr_threshold: cfg.threads_threshold,
            workers: BTreeMap::new(),
            cpu_of: Vec::new(),
        };

        topo.build_map();
        if topo.nworkers == 0 {
            return Err(TopologyError::NoWorkers {
                requested: cfg.workers,
            });
        }
        topo.link_thieves();

        topo.cpu_of = vec![0; topo.nworkers];
        for (&cpu, w) in &topo.workers {
            topo.cpu_of[w.id] = cpu;
        }

        tracing::debug!(
            sockets = topo.nsockets,
            threads = topo.nthreads,
            cores = topo.ncores,
            workers = topo.nworkers,
            "topology built"
        );

        Ok(topo)
    }

    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    pub fn nsockets(&self) -> usize {
        self.nsockets
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    pub fn ncores(&self) -> usize {
        self.ncores
    }

    /// Cpu id for a hardware coordinate.
    pub fn cpu_id(&self, socket: usize, thread: usize, core: usize) -> usize {
        thread * self.nsockets * self.ncores + socket * self.ncores + core
    }

    /// Descriptor of a worker by dense id.
    ///
    /// # Panics
    ///
    /// Panics if `id >= nworkers()`.
    pub fn worker(&self, id: usize) -> &WorkerDesc {
        &self.workers[&self.cpu_of[id]]
    }

    /// All descriptors in cpu order.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerDesc> {
        self.workers.values()
    }

    fn build_map(&mut self) {
        let mut left = self.nworkers;
        let mut id = 0;

        'outer: for t in 0..self.nthreads {
            for s in 0..self.nsockets {
                for cc in 0..self.ncores {
                    if left == 0 {
                        break 'outer;
                    }

                    // Second-thread passes walk cores in reverse so late
                    // workers land far from the first-thread workers that
                    // will be their steal victims.
                    let c = if t > 0 { self.ncores - cc - 1 } else { cc };

                    // Leave (s, t>0, core 0) for the next socket's
                    // cross-socket thief slot.
                    if t > 0 && c == 0 && s + 1 < self.nsockets {
                        continue;
                    }

                    let cpu = self.cpu_id(s, t, c);
                    self.workers.insert(
                        cpu,
                        WorkerDesc {
                            id,
                            socket: s,
                            thread: t,
                            core: c,
                            cpu,
                            victim: None,
                            link: LinkKind::Core,
                        },
                    );

                    id += 1;
                    left -= 1;
                }

                if left <= self.thr_threshold && t + 1 < self.nthreads {
                    break;
                }
            }
        }

        // Fewer slots than requested workers: shrink.
        self.nworkers -= left;
    }

    fn link_thieves(&mut self) {
        let cpus: Vec<usize> = self.workers.keys().copied().collect();

        for &cpu in &cpus {
            let w = self.workers[&cpu];
            let mut left = self.max_thieves;

            // First core of a socket donates one thief slot to the next
            // socket, and then keeps only that thief.
            if w.thread == 0 && w.core == 0 && w.socket + 1 < self.nsockets {
                let t = self.cpu_id(w.socket + 1, 0, 0);
                if self.link_thief(cpu, t, LinkKind::Socket) {
                    left = 1;
                }
            }

            // Second-thread workers with a single slot prefer the
            // neighbouring core on their own thread.
            if w.thread > 0 && w.core > 0 && left == 1 {
                let t = self.cpu_id(w.socket, w.thread, w.core - 1);
                self.link_thief(cpu, t, LinkKind::Core);
                continue;
            }

            if left > 0 && self.set_thief_at_next_core(cpu, &w) {
                left -= 1;
            }

            while left > 0 && self.set_thief_at_next_thread(cpu, &w) {
                left -= 1;
            }

            while left > 0 && self.set_thief_at_next_core(cpu, &w) {
                left -= 1;
            }
        }
    }

    /// Install `thief.victim = victim` if the thief exists, has no victim
    /// yet, and the link keeps the victim relation acyclic.
    fn link_thief(&mut self, victim: usize, thief: usize, link: LinkKind) -> bool {
        if !self.workers.contains_key(&thief) {
            return false;
        }
        if self.workers[&thief].victim.is_some() {
            return false;
        }
        if self.would_cycle(victim, thief) {
            return false;
        }

        let victim_id = self.workers[&victim].id;
        let t = self.workers.get_mut(&thief).expect("thief checked above");
        t.victim = Some(victim_id);
        t.link = link;
        true
    }

    /// Would `thief -> victim` close a cycle? Follows existing victim links
    /// from `victim`; chains are at most `nworkers` long.
    fn would_cycle(&self, victim: usize, thief: usize) -> bool {
        let thief_id = self.workers[&thief].id;
        let mut cur = self.workers[&victim].id;
        for _ in 0..self.nworkers {
            if cur == thief_id {
                return true;
            }
            match self.workers[&self.cpu_of_unindexed(cur)].victim {
                Some(v) => cur = v,
                None => return false,
            }
        }
        false
    }

    /// Cpu of a worker id before `cpu_of` is built (linking runs first).
    fn cpu_of_unindexed(&self, id: usize) -> usize {
        self.workers
            .values()
            .find(|w| w.id == id)
            .map(|w| w.cpu)
            .expect("worker ids are dense")
    }

    fn set_thief_at_next_thread(&mut self, victim: usize, w: &WorkerDesc) -> bool {
        for n in (w.thread + 1)..self.nthreads {
            let thief = self.cpu_id(w.socket, n, w.core);
            if self.link_thief(victim, thief, LinkKind::Thread) {
                return true;
            }
        }
        false
    }

    fn set_thief_at_next_core(&mut self, victim: usize, w: &WorkerDesc) -> bool {
        for n in (w.core + 1)..self.ncores {
            let thief = self.cpu_id(w.socket, w.thread, n);
            if self.link_thief(victim, thief, LinkKind::Core) {
                return true;
            }
        }
        false
    }

    fn fmt_subtree(
        &self,
        f: &mut fmt::Formatter<'_>,
        root_id: usize,
        depth: usize,
    ) -> fmt::Result {
        let w = self.worker(root_id);
        write!(f, "{}:{}:{} ", w.socket, w.thread, w.core)?;
        for _ in 0..depth {
            write!(f, "--")?;
        }
        writeln!(f, " #{} CPU{}", w.id, w.cpu)?;

        for t in self.workers.values() {
            if t.victim == Some(root_id) {
                self.fmt_subtree(f, t.id, depth + 1)?;
            }
        }
        Ok(())
    }
}

/// Victim-graph dump: `<socket>:<thread>:<core> -- <worker_id> <cpu_id>`,
/// indented by steal distance from each forest root.
impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<socket>:<thread>:<core> -- <worker_id> <cpu_id>")?;
        for w in self.workers.values() {
            if w.victim.is_none() {
                self.fmt_subtree(f, w.id, 1)?;
            }
        }
        Ok(())
    }
}
