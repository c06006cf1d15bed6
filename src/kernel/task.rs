//! Task control blocks
//!
//! A task is a simulated process: an async body plus the kernel-side state
//! the scheduler needs to park and resume it. The body itself lives in the
//! executor's slab; the TCB outlives it so ids, names and statistics stay
//! readable after death.

use super::error::SimError;
use super::event::EventId;
use super::fabric::{Channel, NodeId};
use super::lock::LockId;
use super::port::{Message, PortId};
use super::semaphore::SemId;
use super::stats::EntityStats;
use super::time::SimTime;
use std::cmp::Reverse;
use std::fmt;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Pseudo-task that reports resource notices in the trace
pub const KERNEL_TASK: TaskId = TaskId(0);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task priority. Higher runs first among tasks ready at the same time.
pub type Priority = i32;

/// Key into the ready queue: priority descending, then sequence ascending
pub type ReadyKey = (Reverse<Priority>, u64);

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the ready queue
    Ready,
    /// Currently executing (at most one task at a time)
    Running,
    /// Parked in a blocking call
    Blocked,
    /// Parked until another task resumes it
    Suspended,
    /// Terminated; absorbing
    Dead,
}

impl TaskState {
    /// Legal edges of the task state machine
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Ready, Running)
                | (Running, Ready)
                | (Running, Blocked)
                | (Running, Suspended)
                | (Running, Dead)
                | (Blocked, Ready)
                | (Blocked, Dead)
                | (Ready, Suspended)
                | (Ready, Dead)
                | (Suspended, Ready)
                | (Suspended, Dead)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Blocked => "blocked",
            TaskState::Suspended => "suspended",
            TaskState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// Why a blocked task is blocked.
///
/// Each cause is distinct internally; several map onto the same trace
/// phrase (see `trace::TraceEvent`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCause {
    Sleeping,
    Receiving(PortId),
    Sending(PortId),
    Semaphore(SemId),
    Lock(LockId),
    Spinning(LockId),
    /// Queued for, or holding, a CPU of its node
    Computing,
    /// Waiting for, or occupying, a bus or link
    Transmitting,
}

/// How a parked task is woken
#[derive(Debug, Clone, PartialEq)]
pub enum Wakeup {
    /// The awaited condition holds
    Ready,
    /// A message was handed over
    Message(Message),
    /// A receive timed out
    TimedOut,
    /// The blocking call failed
    Fault(SimError),
}

/// Creation parameters for a task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSpec {
    pub name: Option<String>,
    pub node: NodeId,
    pub priority: Priority,
    /// Creating task; `None` for tasks started by the model
    pub parent: Option<TaskId>,
}

impl TaskSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn on(mut self, node: NodeId) -> Self {
        self.node = node;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn child_of(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Task control block
#[derive(Debug)]
pub struct Tcb {
    pub id: TaskId,
    pub name: Option<String>,
    pub priority: Priority,
    pub state: TaskState,
    pub node: NodeId,
    pub parent: Option<TaskId>,
    /// Ports this task owns
    pub ports: Vec<PortId>,
    /// Port that casts are delivered to
    pub std_port: Option<PortId>,
    /// Locks this task holds
    pub locks: Vec<LockId>,
    pub cause: Option<BlockCause>,
    /// Result of the last blocking call, consumed on resume
    pub wakeup: Option<Wakeup>,
    /// Event tied to the current block (sleep end, timeout, CPU burst...)
    pub timer: Option<EventId>,
    /// Present while the task sits in the ready queue
    pub ready_key: Option<ReadyKey>,
    /// Slab slot of the body future while alive
    pub slot: Option<usize>,
    /// Suspend as soon as the current block ends
    pub suspend_pending: bool,
    pub blocked_since: SimTime,
    /// Service demand of the current CPU burst
    pub service: f64,
    /// Message being carried by a bus or link on this task's behalf
    pub in_transit: Option<(PortId, Message, Channel)>,
    /// Most recent fault charged to this task
    pub last_fault: Option<SimError>,
    pub stats: EntityStats,
}

impl Tcb {
    pub fn new(id: TaskId, name: Option<String>, node: NodeId, priority: Priority, now: SimTime) -> Self {
        Self {
            id,
            name,
            priority,
            state: TaskState::Suspended,
            node,
            parent: None,
            ports: Vec::new(),
            std_port: None,
            locks: Vec::new(),
            cause: None,
            wakeup: None,
            timer: None,
            ready_key: None,
            slot: None,
            suspend_pending: false,
            blocked_since: now,
            service: 0.0,
            in_transit: None,
            last_fault: None,
            stats: EntityStats::default(),
        }
    }

    /// Move to `to`, rejecting edges outside the state machine
    pub fn transition(&mut self, to: TaskState) -> Result<(), String> {
        if !self.state.can_transition(to) {
            return Err(format!(
                "illegal transition of task {} from {} to {}",
                self.id, self.state, to
            ));
        }
        self.state = to;
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.state != TaskState::Dead
    }

    /// Park with `cause`, starting the wait clock
    pub fn block(&mut self, cause: BlockCause, now: SimTime) -> Result<(), String> {
        self.transition(TaskState::Blocked)?;
        self.cause = Some(cause);
        self.blocked_since = now;
        Ok(())
    }
}
