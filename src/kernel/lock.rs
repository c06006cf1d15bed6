//! Spin locks
//!
//! Two contention models, chosen per lock:
//! - Blocking: contenders park in a wait list and unlock hands the lock
//!   straight to the next one (FIFO or priority order)
//! - Spinning: contenders stay registered as spinners and retry every spin
//!   quantum; whoever retries first after an unlock wins
//!
//! Recursive acquire and unlock by a non-holder are errors.

use super::error::{SimError, SimResult};
use super::stats::EntityStats;
use super::task::{Priority, TaskId};
use super::time::SimTime;
use serde::Deserialize;
use std::fmt;

/// Lock identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How contention is modelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    #[default]
    Blocking,
    Spinning,
}

/// Order in which blocked contenders are granted the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockOrder {
    #[default]
    Fifo,
    Priority,
}

/// Result of an acquire attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Caller now holds the lock
    Acquired,
    /// Caller parked in the wait list (blocking policy)
    Queued,
    /// Caller must retry after a spin quantum (spinning policy)
    Spin,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    task: TaskId,
    priority: Priority,
    seq: u64,
}

/// A mutual-exclusion lock
#[derive(Debug)]
pub struct SpinLock {
    pub id: LockId,
    pub policy: LockPolicy,
    pub order: LockOrder,
    holder: Option<TaskId>,
    held_since: SimTime,
    waiters: Vec<Waiter>,
    spinners: Vec<TaskId>,
    next_seq: u64,
    pub stats: EntityStats,
}

impl SpinLock {
    pub fn new(id: LockId, policy: LockPolicy, order: LockOrder) -> Self {
        Self {
            id,
            policy,
            order,
            holder: None,
            held_since: 0.0,
            waiters: Vec::new(),
            spinners: Vec::new(),
            next_seq: 0,
            stats: EntityStats::default(),
        }
    }

    pub fn holder(&self) -> Option<TaskId> {
        self.holder
    }

    /// Tasks waiting or spinning
    pub fn contenders(&self) -> usize {
        self.waiters.len() + self.spinners.len()
    }

    fn grant(&mut self, task: TaskId, now: SimTime) {
        self.holder = Some(task);
        self.held_since = now;
        self.stats.arrivals += 1;
    }

    /// First attempt to take the lock
    pub fn acquire(&mut self, task: TaskId, priority: Priority, now: SimTime) -> SimResult<Acquire> {
        if self.holder == Some(task) {
            return Err(SimError::RecursiveLock(self.id));
        }
        if self.holder.is_none() {
            self.grant(task, now);
            return Ok(Acquire::Acquired);
        }
        match self.policy {
            LockPolicy::Blocking => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.waiters.push(Waiter { task, priority, seq });
                Ok(Acquire::Queued)
            }
            LockPolicy::Spinning => {
                if !self.spinners.contains(&task) {
                    self.spinners.push(task);
                }
                Ok(Acquire::Spin)
            }
        }
    }

    /// A spinner's retry. True if it now holds the lock.
    pub fn retry(&mut self, task: TaskId, now: SimTime) -> bool {
        if self.holder.is_some() {
            return false;
        }
        self.spinners.retain(|&t| t != task);
        self.grant(task, now);
        true
    }

    /// Release the lock. Returns the blocked waiter it was handed to.
    pub fn release(&mut self, task: TaskId, now: SimTime) -> SimResult<Option<TaskId>> {
        if self.holder != Some(task) {
            return Err(SimError::NotOwner);
        }
        self.stats.completions += 1;
        self.stats.busy_time += now - self.held_since;
        self.holder = None;

        let next = match self.order {
            LockOrder::Fifo => self
                .waiters
                .iter()
                .enumerate()
                .min_by_key(|(_, w)| w.seq)
                .map(|(i, _)| i),
            LockOrder::Priority => self
                .waiters
                .iter()
                .enumerate()
                .min_by_key(|(_, w)| (std::cmp::Reverse(w.priority), w.seq))
                .map(|(i, _)| i),
        };
        match next {
            Some(i) => {
                let waiter = self.waiters.remove(i);
                self.grant(waiter.task, now);
                Ok(Some(waiter.task))
            }
            None => Ok(None),
        }
    }

    /// Forced release when the holder dies.
    ///
    /// Every waiter and spinner is returned so it can be failed.
    pub fn abandon(&mut self, now: SimTime) -> Vec<TaskId> {
        if self.holder.take().is_some() {
            self.stats.busy_time += now - self.held_since;
            self.stats.faults += 1;
        }
        let mut waiters = std::mem::take(&mut self.waiters);
        waiters.sort_by_key(|w| w.seq);
        let mut out: Vec<TaskId> = waiters.into_iter().map(|w| w.task).collect();
        out.append(&mut self.spinners);
        out
    }

    /// Drop a waiter or spinner (kill or fault). Returns true if present.
    pub fn remove_contender(&mut self, task: TaskId) -> bool {
        let before = self.contenders();
        self.waiters.retain(|w| w.task != task);
        self.spinners.retain(|&t| t != task);
        before != self.contenders()
    }

    /// A waiter's priority changed
    pub fn reprioritize(&mut self, task: TaskId, priority: Priority) {
        for w in self.waiters.iter_mut().filter(|w| w.task == task) {
            w.priority = priority;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_fifo_handoff() {
        let mut lock = SpinLock::new(LockId(1), LockPolicy::Blocking, LockOrder::Fifo);
        assert_eq!(lock.acquire(TaskId(1), 0, 0.0), Ok(Acquire::Acquired));
        assert_eq!(lock.acquire(TaskId(2), 5, 0.0), Ok(Acquire::Queued));
        assert_eq!(lock.acquire(TaskId(3), 9, 0.0), Ok(Acquire::Queued));

        assert_eq!(lock.release(TaskId(1), 2.0), Ok(Some(TaskId(2))));
        assert_eq!(lock.holder(), Some(TaskId(2)));
        assert_eq!(lock.release(TaskId(2), 4.0), Ok(Some(TaskId(3))));
        assert_eq!(lock.release(TaskId(3), 6.0), Ok(None));
        assert_eq!(lock.holder(), None);
        assert_eq!(lock.stats.busy_time, 6.0);
        assert_eq!(lock.stats.completions, 3);
    }

    #[test]
    fn test_blocking_priority_order() {
        let mut lock = SpinLock::new(LockId(1), LockPolicy::Blocking, LockOrder::Priority);
        lock.acquire(TaskId(1), 0, 0.0).unwrap();
        lock.acquire(TaskId(2), 1, 0.0).unwrap();
        lock.acquire(TaskId(3), 7, 0.0).unwrap();
        lock.acquire(TaskId(4), 7, 0.0).unwrap();

        assert_eq!(lock.release(TaskId(1), 1.0), Ok(Some(TaskId(3))));
        assert_eq!(lock.release(TaskId(3), 1.0), Ok(Some(TaskId(4))));
        assert_eq!(lock.release(TaskId(4), 1.0), Ok(Some(TaskId(2))));
    }

    #[test]
    fn test_recursive_acquire_rejected() {
        let mut lock = SpinLock::new(LockId(4), LockPolicy::Blocking, LockOrder::Fifo);
        lock.acquire(TaskId(1), 0, 0.0).unwrap();
        assert_eq!(
            lock.acquire(TaskId(1), 0, 0.0),
            Err(SimError::RecursiveLock(LockId(4)))
        );
    }

    #[test]
    fn test_release_by_non_holder() {
        let mut lock = SpinLock::new(LockId(1), LockPolicy::Blocking, LockOrder::Fifo);
        assert_eq!(lock.release(TaskId(1), 0.0), Err(SimError::NotOwner));
        lock.acquire(TaskId(1), 0, 0.0).unwrap();
        assert_eq!(lock.release(TaskId(2), 0.0), Err(SimError::NotOwner));
        assert_eq!(lock.holder(), Some(TaskId(1)));
    }

    #[test]
    fn test_spinning_retry() {
        let mut lock = SpinLock::new(LockId(1), LockPolicy::Spinning, LockOrder::Fifo);
        lock.acquire(TaskId(1), 0, 0.0).unwrap();
        assert_eq!(lock.acquire(TaskId(2), 0, 0.0), Ok(Acquire::Spin));
        assert!(!lock.retry(TaskId(2), 0.5));

        // Spinning release never hands off
        assert_eq!(lock.release(TaskId(1), 1.0), Ok(None));
        assert!(lock.retry(TaskId(2), 1.5));
        assert_eq!(lock.holder(), Some(TaskId(2)));
        assert_eq!(lock.contenders(), 0);
    }

    #[test]
    fn test_abandon_returns_contenders() {
        let mut lock = SpinLock::new(LockId(1), LockPolicy::Blocking, LockOrder::Fifo);
        lock.acquire(TaskId(1), 0, 0.0).unwrap();
        lock.acquire(TaskId(2), 0, 0.0).unwrap();
        lock.acquire(TaskId(3), 0, 0.0).unwrap();
        assert_eq!(lock.abandon(3.0), vec![TaskId(2), TaskId(3)]);
        assert_eq!(lock.holder(), None);
        assert_eq!(lock.stats.faults, 1);
    }
}
