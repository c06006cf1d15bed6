//! Counting semaphores
//!
//! Count is never negative; blocked tasks sit in an explicit FIFO. A signal
//! with waiters hands the unit straight to the head waiter instead of
//! bumping the count.

use super::error::{SimError, SimResult};
use super::stats::EntityStats;
use super::task::TaskId;
use std::collections::VecDeque;
use std::fmt;

/// Semaphore ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SemId(pub u64);

impl fmt::Display for SemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A counting semaphore
#[derive(Debug)]
pub struct Semaphore {
    pub id: SemId,
    count: u32,
    waiters: VecDeque<TaskId>,
    pub stats: EntityStats,
}

impl Semaphore {
    pub fn new(id: SemId, initial: u32) -> Self {
        Self {
            id,
            count: initial,
            waiters: VecDeque::new(),
            stats: EntityStats::default(),
        }
    }

    /// Current count
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Number of blocked tasks
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Take a unit if available. Otherwise `task` joins the wait FIFO and
    /// false is returned.
    pub fn wait(&mut self, task: TaskId) -> bool {
        self.stats.arrivals += 1;
        if self.count > 0 {
            self.count -= 1;
            true
        } else {
            self.waiters.push_back(task);
            false
        }
    }

    /// Release a unit. Returns the waiter that receives it, if any.
    pub fn signal(&mut self) -> Option<TaskId> {
        self.stats.completions += 1;
        match self.waiters.pop_front() {
            Some(task) => Some(task),
            None => {
                self.count += 1;
                None
            }
        }
    }

    /// Set the count. Not allowed while tasks are blocked.
    pub fn reset(&mut self, value: u32) -> SimResult<()> {
        if !self.waiters.is_empty() {
            return Err(SimError::InvalidState(format!(
                "semaphore {} has {} waiters",
                self.id,
                self.waiters.len()
            )));
        }
        self.count = value;
        Ok(())
    }

    /// Drop a waiter (kill or fault). Returns true if it was queued.
    pub fn remove_waiter(&mut self, task: TaskId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|&t| t != task);
        before != self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_takes_available_units() {
        let mut sem = Semaphore::new(SemId(1), 2);
        assert!(sem.wait(TaskId(1)));
        assert!(sem.wait(TaskId(2)));
        assert_eq!(sem.count(), 0);
        assert!(!sem.wait(TaskId(3)));
        assert_eq!(sem.waiting(), 1);
    }

    #[test]
    fn test_signal_wakes_in_fifo_order() {
        let mut sem = Semaphore::new(SemId(1), 0);
        for n in 1..=4 {
            assert!(!sem.wait(TaskId(n)));
        }
        for n in 1..=4 {
            assert_eq!(sem.signal(), Some(TaskId(n)));
        }
        // Handoffs never touch the count
        assert_eq!(sem.count(), 0);
        assert_eq!(sem.signal(), None);
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_reset_with_waiters_fails() {
        let mut sem = Semaphore::new(SemId(3), 0);
        sem.wait(TaskId(1));
        assert!(matches!(sem.reset(5), Err(SimError::InvalidState(_))));
        assert!(sem.remove_waiter(TaskId(1)));
        assert!(sem.reset(5).is_ok());
        assert_eq!(sem.count(), 5);
    }

    #[test]
    fn test_remove_waiter_preserves_order() {
        let mut sem = Semaphore::new(SemId(1), 0);
        sem.wait(TaskId(1));
        sem.wait(TaskId(2));
        sem.wait(TaskId(3));
        assert!(sem.remove_waiter(TaskId(2)));
        assert!(!sem.remove_waiter(TaskId(2)));
        assert_eq!(sem.signal(), Some(TaskId(1)));
        assert_eq!(sem.signal(), Some(TaskId(3)));
    }
}
