//! Core engine for the pipetree simulation.
//!
//! A tree of simulated processes grows from a single root. Each process
//! is either a hater or a lover; haters spawn children and listen on
//! their pipes, lovers report themselves to their parent once and go
//! dormant. A round-robin scheduler drives the tree until every process
//! has converged to lover, recording a journal of everything that
//! happened along the way.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for pipes backed by a generational slot map.
    ///
    /// Parent and child both hold the same handle, so writes from either
    /// end are observed by the other.
    pub struct PipeId;
}

/// Payload a lover writes to signal itself to the other end of a pipe.
pub const LOVE_MESSAGE: i64 = 831;

/// Process identifier. Allocation is a monotonically increasing counter
/// derived from the process table; the root is always [`Pid::ROOT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u64);

impl Pid {
    /// Identifier of the root process.
    pub const ROOT: Self = Self(1);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Depth in the process tree; the root sits at generation zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Generation(pub u32);

impl Generation {
    /// Generation assigned to a direct child.
    #[must_use]
    pub const fn child(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Behavioural type assigned to every process when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessKind {
    /// Spawns children and listens for love on its pipes.
    Hater,
    /// Reports to its parent once, then stays dormant.
    Lover,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hater => f.write_str("hater"),
            Self::Lover => f.write_str("lover"),
        }
    }
}

/// Unbounded FIFO channel between a parent and one of its direct children.
///
/// Data nominally flows parent to child; the reverse direction reuses the
/// same channel, written by the child and drained by the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipe {
    parent: Pid,
    child: Pid,
    messages: VecDeque<i64>,
}

impl Pipe {
    fn new(parent: Pid, child: Pid) -> Self {
        Self {
            parent,
            child,
            messages: VecDeque::new(),
        }
    }

    /// Pid of the parent endpoint.
    #[must_use]
    pub const fn parent(&self) -> Pid {
        self.parent
    }

    /// Pid of the child endpoint.
    #[must_use]
    pub const fn child(&self) -> Pid {
        self.child
    }

    /// Append a message to the tail of the queue. Never blocks, never fails.
    pub fn write(&mut self, message: i64) {
        self.messages.push_back(message);
    }

    /// Return the entire contents in insertion order, emptying the queue.
    /// A message read once is gone.
    pub fn drain(&mut self) -> Vec<i64> {
        self.messages.drain(..).collect()
    }

    /// Non-destructive check for a queued message value.
    #[must_use]
    pub fn contains(&self, message: i64) -> bool {
        self.messages.contains(&message)
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A node in the simulated process tree.
///
/// The child list and the pipe map always share the same key set; both
/// are only ever mutated together through [`Process::attach_child`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pid: Pid,
    ppid: Pid,
    generation: Generation,
    kind: ProcessKind,
    children: Vec<Pid>,
    pipes: BTreeMap<Pid, PipeId>,
    inbound: Option<PipeId>,
}

impl Process {
    fn new(pid: Pid, ppid: Pid, generation: Generation, kind: ProcessKind) -> Self {
        Self {
            pid,
            ppid,
            generation,
            kind,
            children: Vec::new(),
            pipes: BTreeMap::new(),
            inbound: None,
        }
    }

    /// This process's identifier.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Identifier of the parent; `Pid(0)` for the root.
    #[must_use]
    pub const fn ppid(&self) -> Pid {
        self.ppid
    }

    /// Depth of this process in the tree.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Current behavioural type.
    #[must_use]
    pub const fn kind(&self) -> ProcessKind {
        self.kind
    }

    /// Whether this process has converged.
    #[must_use]
    pub const fn is_lover(&self) -> bool {
        matches!(self.kind, ProcessKind::Lover)
    }

    /// Direct children in creation order.
    #[must_use]
    pub fn children(&self) -> &[Pid] {
        &self.children
    }

    /// Handle of the pipe connecting this process to `child`, if `child`
    /// is one of its direct children.
    #[must_use]
    pub fn pipe_to(&self, child: Pid) -> Option<PipeId> {
        self.pipes.get(&child).copied()
    }

    /// Handle of the pipe this process's parent created for it. Absent
    /// only for the root.
    #[must_use]
    pub const fn inbound(&self) -> Option<PipeId> {
        self.inbound
    }

    /// Record a new child and its connecting pipe in one step, keeping
    /// the child list and pipe map key sets identical.
    fn attach_child(&mut self, child: Pid, pipe: PipeId) {
        self.children.push(child);
        self.pipes.insert(child, pipe);
        debug_assert_eq!(self.children.len(), self.pipes.len());
    }

    /// The only kind transition; once a lover, always a lover.
    fn promote_to_lover(&mut self) {
        self.kind = ProcessKind::Lover;
    }
}

/// Errors raised while constructing a simulation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Probability that a freshly created process is a lover.
    pub lover_probability: f64,
    /// Smallest brood a childless hater may spawn.
    pub brood_min: u32,
    /// Largest brood a childless hater may spawn.
    pub brood_max: u32,
    /// Hard cap on journal length; crossing it forcibly ends the run.
    pub max_events: usize,
    /// Optional RNG seed for reproducible trees.
    pub rng_seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            lover_probability: 0.37,
            brood_min: 1,
            brood_max: 2,
            max_events: 10_000,
            rng_seed: None,
        }
    }
}

impl SimulationConfig {
    fn validate(&self) -> Result<(), SimulationError> {
        if !(0.0..=1.0).contains(&self.lover_probability) {
            return Err(SimulationError::InvalidConfig(
                "lover_probability must lie within [0, 1]",
            ));
        }
        if self.brood_min == 0 {
            return Err(SimulationError::InvalidConfig(
                "brood_min must be at least one",
            ));
        }
        if self.brood_max < self.brood_min {
            return Err(SimulationError::InvalidConfig(
                "brood_max must not be below brood_min",
            ));
        }
        if self.max_events == 0 {
            return Err(SimulationError::InvalidConfig(
                "max_events must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Source of the random draws made while the tree grows.
///
/// The default implementation samples a seeded [`SmallRng`]; tests
/// substitute scripted sources to pin down tree shapes.
pub trait Sampler: Send {
    /// Draw the behavioural type for a newly created process.
    fn draw_kind(&mut self, lover_probability: f64) -> ProcessKind;

    /// Draw a brood size from the inclusive range `[min, max]`.
    fn draw_brood(&mut self, min: u32, max: u32) -> u32;
}

/// [`Sampler`] backed by a seeded [`SmallRng`].
#[derive(Debug)]
pub struct RngSampler {
    rng: SmallRng,
}

impl RngSampler {
    /// Wrap an existing RNG.
    #[must_use]
    pub fn new(rng: SmallRng) -> Self {
        Self { rng }
    }

    /// Convenience constructor from a raw seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::new(SmallRng::seed_from_u64(seed))
    }
}

impl Sampler for RngSampler {
    fn draw_kind(&mut self, lover_probability: f64) -> ProcessKind {
        if self.rng.random::<f64>() < lover_probability {
            ProcessKind::Lover
        } else {
            ProcessKind::Hater
        }
    }

    fn draw_brood(&mut self, min: u32, max: u32) -> u32 {
        self.rng.random_range(min..=max)
    }
}

/// Signal returned by a behaviour step to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep the process in rotation.
    Continue,
    /// Drop the process from the queue; it stays resident in the table.
    Retire,
}

/// Outcome of a single scheduler turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Turn {
    /// Process that acted this turn.
    pub pid: Pid,
    /// Its behavioural type after the step.
    pub kind: ProcessKind,
    /// What the behaviour signalled to the scheduler.
    pub outcome: StepOutcome,
}

/// Entry recorded in the simulation journal.
///
/// The `Display` text of each variant is the externally observable trace
/// contract and is kept stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// The root process entered the table.
    RootCreated {
        pid: Pid,
        kind: ProcessKind,
        generation: Generation,
    },
    /// A childless hater is about to create a brood.
    SpawningChildren { pid: Pid, count: u32 },
    /// A child entered the table.
    ChildCreated {
        pid: Pid,
        kind: ProcessKind,
        generation: Generation,
    },
    /// A hater drained love from its inbound pipe and converged.
    BecameLoverFromParent { pid: Pid },
    /// A converging process forwarded love to one of its children.
    LoveForwarded { pid: Pid, child: Pid },
    /// A hater drained love from one lover child's pipe.
    LoveReceivedFromChild { pid: Pid, child: Pid },
    /// A hater heard at least one child and converged.
    BecameLoverFromChild { pid: Pid },
    /// A lover reported itself to its parent.
    LoveSentToParent { pid: Pid, ppid: Pid },
    /// The journal cap tripped; the run was forcibly ended.
    StepCapReached,
    /// Closing tally of converged processes.
    Summary { lovers: usize },
    /// Deepest generation observed across the run.
    MaxGeneration { generation: Generation },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RootCreated {
                pid,
                kind,
                generation,
            } => write!(f, "Root process {pid} created as {kind}, generation {generation}"),
            Self::SpawningChildren { pid, count } => {
                write!(f, "Process {pid} (hater) creating {count} children")
            }
            Self::ChildCreated {
                pid,
                kind,
                generation,
            } => write!(f, "Child {pid} created as {kind}, generation {generation}"),
            Self::BecameLoverFromParent { pid } => write!(
                f,
                "Process {pid} (hater) received love from parent, becoming lover"
            ),
            Self::LoveForwarded { pid, child } => {
                write!(f, "Process {pid} sent love ({LOVE_MESSAGE}) to child {child}")
            }
            Self::LoveReceivedFromChild { pid, child } => write!(
                f,
                "Process {pid} received love ({LOVE_MESSAGE}) from child {child}"
            ),
            Self::BecameLoverFromChild { pid } => write!(
                f,
                "Process {pid} (hater) received love from child, becoming lover"
            ),
            Self::LoveSentToParent { pid, ppid } => write!(
                f,
                "Process {pid} (lover) sent love ({LOVE_MESSAGE}) to parent {ppid}"
            ),
            Self::StepCapReached => f.write_str("Simulation terminated: too many steps"),
            Self::Summary { lovers } => {
                write!(f, "Simulation complete. All {lovers} processes are lovers.")
            }
            Self::MaxGeneration { generation } => {
                write!(f, "Maximum generation reached: {generation}")
            }
        }
    }
}

/// Aggregate simulation state: process table, pipe arena, round-robin
/// queue, and journal.
pub struct Simulation {
    config: SimulationConfig,
    sampler: Box<dyn Sampler>,
    processes: BTreeMap<Pid, Process>,
    pipes: SlotMap<PipeId, Pipe>,
    active: VecDeque<Pid>,
    events: Vec<Event>,
    max_generation: Generation,
    finished: bool,
    capped: bool,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("process_count", &self.processes.len())
            .field("active", &self.active.len())
            .field("events", &self.events.len())
            .field("max_generation", &self.max_generation)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Simulation {
    /// Instantiate a simulation whose draws come from the config-seeded RNG.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        let sampler = RngSampler::new(config.seeded_rng());
        Self::with_sampler(config, Box::new(sampler))
    }

    /// Instantiate a simulation with an explicit draw source.
    ///
    /// The root process is created (and journalled) immediately, so the
    /// sampler's first kind draw decides the root's type.
    pub fn with_sampler(
        config: SimulationConfig,
        sampler: Box<dyn Sampler>,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        let mut sim = Self {
            config,
            sampler,
            processes: BTreeMap::new(),
            pipes: SlotMap::with_key(),
            active: VecDeque::new(),
            events: Vec::new(),
            max_generation: Generation(0),
            finished: false,
            capped: false,
        };
        sim.spawn_root();
        Ok(sim)
    }

    fn spawn_root(&mut self) {
        let kind = self.sampler.draw_kind(self.config.lover_probability);
        let root = Process::new(Pid::ROOT, Pid(0), Generation(0), kind);
        self.processes.insert(Pid::ROOT, root);
        self.active.push_back(Pid::ROOT);
        self.events.push(Event::RootCreated {
            pid: Pid::ROOT,
            kind,
            generation: Generation(0),
        });
    }

    /// Pid allocation is one past the current maximum table key.
    fn next_pid(&self) -> Pid {
        self.processes
            .last_key_value()
            .map_or(Pid::ROOT, |(pid, _)| Pid(pid.0 + 1))
    }

    /// Drive the scheduler until every process has retired or the journal
    /// cap trips, then append the closing summary. Idempotent once
    /// finished. Returns the deepest generation reached.
    pub fn run(&mut self) -> Generation {
        if self.finished {
            return self.max_generation;
        }
        while self.turn().is_some() {
            if self.events.len() > self.config.max_events {
                self.events.push(Event::StepCapReached);
                self.capped = true;
                break;
            }
        }
        let lovers = self.lover_count();
        self.events.push(Event::Summary { lovers });
        self.events.push(Event::MaxGeneration {
            generation: self.max_generation,
        });
        self.finished = true;
        self.max_generation
    }

    /// Execute one scheduler turn, returning `None` once the queue is empty.
    pub fn turn(&mut self) -> Option<Turn> {
        let pid = self.active.front().copied()?;
        let kind_before = self.processes.get(&pid).map(Process::kind)?;
        if let Some(proc) = self.processes.get(&pid) {
            self.max_generation = self.max_generation.max(proc.generation());
        }

        let outcome = match kind_before {
            ProcessKind::Hater => self.step_hater(pid),
            ProcessKind::Lover => self.step_lover(pid),
        };

        self.active.pop_front();
        if outcome == StepOutcome::Continue {
            // Round-robin fairness: back of the queue.
            self.active.push_back(pid);
        }

        // Children enter rotation after their parent's turn. This also
        // re-adds retired lovers, whose next turn is a send-once no-op.
        let children: Vec<Pid> = self
            .processes
            .get(&pid)
            .map(|proc| proc.children().to_vec())
            .unwrap_or_default();
        for child in children {
            if self.processes.contains_key(&child) && !self.active.contains(&child) {
                self.active.push_back(child);
            }
        }

        let kind = self.processes.get(&pid).map_or(kind_before, Process::kind);
        Some(Turn { pid, kind, outcome })
    }

    /// One scheduling turn of a process currently typed hater.
    fn step_hater(&mut self, pid: Pid) -> StepOutcome {
        // A parental love message is authoritative; it wins over everything
        // else and propagates without re-deriving it from children.
        let inbound = self.processes.get(&pid).and_then(Process::inbound);
        if let Some(pipe_id) = inbound {
            let drained = self
                .pipes
                .get_mut(pipe_id)
                .map(Pipe::drain)
                .unwrap_or_default();
            if !drained.is_empty() {
                self.become_lover(pid, Event::BecameLoverFromParent { pid });
                return StepOutcome::Retire;
            }
        }

        // Childless haters grow the tree.
        if self
            .processes
            .get(&pid)
            .is_some_and(|proc| proc.children().is_empty())
        {
            self.spawn_brood(pid);
        }

        // Consult lover children for pending signals.
        let children: Vec<Pid> = self
            .processes
            .get(&pid)
            .map(|proc| proc.children().to_vec())
            .unwrap_or_default();
        let mut heard = false;
        for child in children {
            if !self.processes.get(&child).is_some_and(Process::is_lover) {
                continue;
            }
            let Some(pipe_id) = self.processes.get(&pid).and_then(|p| p.pipe_to(child)) else {
                continue;
            };
            let drained = self
                .pipes
                .get_mut(pipe_id)
                .map(Pipe::drain)
                .unwrap_or_default();
            if !drained.is_empty() {
                heard = true;
                self.events.push(Event::LoveReceivedFromChild { pid, child });
            }
        }
        if heard {
            self.become_lover(pid, Event::BecameLoverFromChild { pid });
            return StepOutcome::Retire;
        }

        StepOutcome::Continue
    }

    /// One scheduling turn of a process currently typed lover: report to
    /// the parent at most once, then stay dormant.
    fn step_lover(&mut self, pid: Pid) -> StepOutcome {
        let Some(proc) = self.processes.get(&pid) else {
            return StepOutcome::Retire;
        };
        let ppid = proc.ppid();
        if let Some(pipe_id) = proc.inbound()
            && let Some(pipe) = self.pipes.get_mut(pipe_id)
            && !pipe.contains(LOVE_MESSAGE)
        {
            pipe.write(LOVE_MESSAGE);
            self.events.push(Event::LoveSentToParent { pid, ppid });
        }
        StepOutcome::Retire
    }

    /// Transition `pid` to lover and forward love once to every existing
    /// child, not only the ones that signalled; a parent cannot tell
    /// which descendants triggered the condition.
    fn become_lover(&mut self, pid: Pid, event: Event) {
        self.events.push(event);
        if let Some(proc) = self.processes.get_mut(&pid) {
            proc.promote_to_lover();
        }
        let children: Vec<Pid> = self
            .processes
            .get(&pid)
            .map(|proc| proc.children().to_vec())
            .unwrap_or_default();
        for child in children {
            let Some(pipe_id) = self.processes.get(&pid).and_then(|p| p.pipe_to(child)) else {
                continue;
            };
            if let Some(pipe) = self.pipes.get_mut(pipe_id) {
                pipe.write(LOVE_MESSAGE);
                self.events.push(Event::LoveForwarded { pid, child });
            }
        }
    }

    /// Create a freshly drawn brood of children under `parent`.
    fn spawn_brood(&mut self, parent: Pid) {
        let count = self
            .sampler
            .draw_brood(self.config.brood_min, self.config.brood_max);
        self.events.push(Event::SpawningChildren { pid: parent, count });
        for _ in 0..count {
            let Some(parent_proc) = self.processes.get(&parent) else {
                return;
            };
            let generation = parent_proc.generation().child();
            let pid = self.next_pid();
            let kind = self.sampler.draw_kind(self.config.lover_probability);

            let pipe = self.pipes.insert(Pipe::new(parent, pid));
            let mut child = Process::new(pid, parent, generation, kind);
            child.inbound = Some(pipe);
            if let Some(parent_proc) = self.processes.get_mut(&parent) {
                parent_proc.attach_child(pid, pipe);
            }
            self.processes.insert(pid, child);

            // Counted at spawn so the reported depth covers processes the
            // scheduler never reaches on a capped run.
            self.max_generation = self.max_generation.max(generation);
            self.events.push(Event::ChildCreated {
                pid,
                kind,
                generation,
            });
        }
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// The journal recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The journal rendered as human-readable lines.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.events.iter().map(ToString::to_string)
    }

    /// Borrow a process from the table.
    #[must_use]
    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// Iterate over every process ever created, in pid order.
    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// Borrow a pipe from the arena.
    #[must_use]
    pub fn pipe(&self, id: PipeId) -> Option<&Pipe> {
        self.pipes.get(id)
    }

    /// Number of processes in the table.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Number of processes currently typed lover.
    #[must_use]
    pub fn lover_count(&self) -> usize {
        self.processes.values().filter(|p| p.is_lover()).count()
    }

    /// Number of pids still eligible for a turn.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Deepest generation observed so far.
    #[must_use]
    pub const fn max_generation(&self) -> Generation {
        self.max_generation
    }

    /// Whether [`Simulation::run`] has completed.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the run was forcibly ended by the journal cap.
    #[must_use]
    pub const fn was_capped(&self) -> bool {
        self.capped
    }
}

/// Run a simulation with the default configuration to completion,
/// returning the deepest generation reached together with the journal.
pub fn run_default() -> Result<(Generation, Vec<String>), SimulationError> {
    let mut sim = Simulation::new(SimulationConfig::default())?;
    let depth = sim.run();
    let lines = sim.lines().collect();
    Ok((depth, lines))
}
