//! Kernel error types
//!
//! Errors fall into four groups:
//! - configuration faults: bad arguments or references, reported at the call
//! - task-local faults: delivered to the calling task from a blocking call
//! - kernel invariant violations: fatal, carry a dump of the event queue
//! - numeric faults: fatal, a statistic went NaN or infinite

use super::fabric::ResourceId;
use super::lock::LockId;
use super::port::PortId;
use super::semaphore::SemId;
use super::task::TaskId;
use super::time::SimTime;
use thiserror::Error;

/// Kernel result type
pub type SimResult<T> = Result<T, SimError>;

/// Kernel errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    // ---- configuration faults ----
    /// Run duration must be strictly positive and finite
    #[error("invalid run duration {0}")]
    InvalidDuration(SimTime),
    /// Argument outside its valid range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No such task
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    /// No such port
    #[error("unknown port {0}")]
    UnknownPort(PortId),
    /// No such semaphore
    #[error("unknown semaphore {0}")]
    UnknownSemaphore(SemId),
    /// No such lock
    #[error("unknown lock {0}")]
    UnknownLock(LockId),
    /// No such node, bus or link
    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),
    /// Operation not allowed in the object's current state
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Attempt to schedule an event before the current virtual time
    #[error("event scheduled at {at} is before current time {now}")]
    EventInPast { at: SimTime, now: SimTime },
    /// Malformed model description
    #[error("configuration error: {0}")]
    Config(String),

    // ---- task-local faults ----
    /// Caller does not own the port or lock
    #[error("caller is not the owner")]
    NotOwner,
    /// The owner of the awaited port or lock died
    #[error("owner terminated")]
    OwnerTerminated,
    /// Target port is closed
    #[error("port {0} is closed")]
    PortClosed(PortId),
    /// The node, bus or link is down
    #[error("resource {0} is down")]
    ResourceDown(ResourceId),
    /// A kernel table limit was hit
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// The caller already holds this lock
    #[error("lock {0} already held by caller")]
    RecursiveLock(LockId),

    // ---- fatal ----
    /// Kernel invariant violated; indicates a kernel bug
    #[error("kernel fault at time {time}: {detail}\npending events:\n{queue}")]
    KernelFault {
        time: SimTime,
        detail: String,
        queue: String,
    },
    /// A statistic produced NaN or infinity
    #[error("numeric fault in {0}")]
    NumericFault(String),
}

impl SimError {
    /// Kernel and numeric faults abort the run; everything else is local
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::KernelFault { .. } | SimError::NumericFault(_)
        )
    }

    /// Faults delivered to a task from a blocking call
    pub fn is_task_local(&self) -> bool {
        matches!(
            self,
            SimError::NotOwner
                | SimError::OwnerTerminated
                | SimError::PortClosed(_)
                | SimError::ResourceDown(_)
                | SimError::ResourceExhausted(_)
                | SimError::RecursiveLock(_)
        )
    }
}

/// Guard a derived statistic against NaN/Inf
pub fn finite(value: f64, what: &str) -> SimResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SimError::NumericFault(format!("{what} = {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let fault = SimError::KernelFault {
            time: 1.0,
            detail: "negative time".into(),
            queue: String::new(),
        };
        assert!(fault.is_fatal());
        assert!(SimError::NumericFault("x".into()).is_fatal());
        assert!(!SimError::NotOwner.is_fatal());
        assert!(SimError::NotOwner.is_task_local());
        assert!(!SimError::InvalidDuration(0.0).is_task_local());
    }

    #[test]
    fn test_finite_guard() {
        assert_eq!(finite(2.5, "mean"), Ok(2.5));
        assert!(matches!(
            finite(f64::NAN, "mean"),
            Err(SimError::NumericFault(_))
        ));
        assert!(finite(f64::INFINITY, "rate").is_err());
    }

    #[test]
    fn test_error_display() {
        let err = SimError::PortClosed(PortId(3));
        assert_eq!(format!("{}", err), "port 3 is closed");
        let err = SimError::EventInPast { at: 1.0, now: 2.0 };
        assert_eq!(
            format!("{}", err),
            "event scheduled at 1 is before current time 2"
        );
    }
}
