//! The kernel - virtual time, tasks, IPC and resources
//!
//! - Tasks are async bodies driven by a single-threaded scheduler
//! - Virtual time only moves when no task is ready
//! - Every blocking call parks the task in the kernel and resumes it
//!   with an explicit wakeup

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod executor;
pub mod fabric;
pub mod lock;
pub mod port;
pub mod semaphore;
pub mod stats;
pub mod syscall;
pub mod task;
pub mod time;
pub mod trace;

#[cfg(test)]
mod invariants_test;

pub use config::{ModelDescription, RunFlags};
pub use context::TaskContext;
pub use error::{SimError, SimResult};
pub use event::{Event, EventId, EventKind, EventQueue};
pub use executor::{EndReason, RunReport, Simulation, StepInfo};
pub use fabric::{
    Availability, BusId, Channel, Distribution, FailureModel, LinkId, NodeId, ResourceFabric,
    ResourceId,
};
pub use lock::{LockId, LockOrder, LockPolicy};
pub use port::{CastScope, Message, PortId, PortKind, ReceiveOrder};
pub use semaphore::SemId;
pub use stats::{EntitySummary, StatId, StatKind, StatSummary, StatsReport};
pub use syscall::Kernel;
pub use task::{KERNEL_TASK, Priority, TaskId, TaskSpec, TaskState};
pub use time::{SimTime, VirtualClock};
pub use trace::{MemorySink, TraceEvent, TraceRecord, TraceSink, WriterSink};
