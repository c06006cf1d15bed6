//! Event queue
//!
//! Design:
//! - Ordered map keyed by (time, sequence number)
//! - Sequence numbers are handed out in insertion order, so equal-time
//!   events pop in the order they were scheduled
//! - Cancellation removes the entry; an id index finds its key

use super::error::{SimError, SimResult};
use super::fabric::ResourceId;
use super::lock::LockId;
use super::port::PortId;
use super::task::TaskId;
use super::time::SimTime;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Unique identifier for a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happens when an event fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A sleeping task wakes up
    Resume { task: TaskId },
    /// A receive timeout expires
    Timeout { task: TaskId, port: PortId },
    /// A task's CPU burst ends
    ComputeDone { task: TaskId },
    /// A spinning task retries its lock
    SpinRetry { task: TaskId, lock: LockId },
    /// A bus or link transmission completes
    TransmitDone { task: TaskId },
    /// A node, bus or link goes down
    Failure(ResourceId),
    /// A node, bus or link comes back up
    Repair(ResourceId),
    /// Model-defined event
    User { tag: u64 },
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Resume { task } => write!(f, "resume      | {task}"),
            EventKind::Timeout { task, port } => write!(f, "receive t/o | {task} port {port}"),
            EventKind::ComputeDone { task } => write!(f, "end compute | {task}"),
            EventKind::SpinRetry { task, lock } => write!(f, "spin retry  | {task} lock {lock}"),
            EventKind::TransmitDone { task } => write!(f, "end transmit| {task}"),
            EventKind::Failure(res) => write!(f, "failure     | {res}"),
            EventKind::Repair(res) => write!(f, "repair      | {res}"),
            EventKind::User { tag } => write!(f, "user event  | {tag}"),
        }
    }
}

/// A scheduled event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub time: SimTime,
    pub kind: EventKind,
}

/// Position of an event in the queue
#[derive(Debug, Clone, Copy)]
struct EventKey {
    time: SimTime,
    seq: u64,
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EventKey {}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Time-ordered queue of pending events
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: BTreeMap<EventKey, Event>,
    /// Firing time of every pending event, by id
    times: HashMap<EventId, SimTime>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            times: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Hand out the next sequence number.
    ///
    /// Shared with the ready queue so that ordering among equal-time
    /// candidates follows creation order everywhere.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Schedule `kind` at absolute `time`; `now` is the current virtual time
    pub fn schedule(&mut self, now: SimTime, time: SimTime, kind: EventKind) -> SimResult<EventId> {
        if !time.is_finite() {
            return Err(SimError::InvalidArgument(format!("event time {time}")));
        }
        if time < now {
            return Err(SimError::EventInPast { at: time, now });
        }

        let seq = self.next_seq();
        let id = EventId(seq);
        if self.times.contains_key(&id) {
            return Err(SimError::KernelFault {
                time: now,
                detail: format!("duplicate event sequence {seq}"),
                queue: self.dump(),
            });
        }

        self.queue.insert(EventKey { time, seq }, Event { id, time, kind });
        self.times.insert(id, time);
        Ok(id)
    }

    /// Remove a not-yet-fired event. Unknown or fired ids are a no-op.
    pub fn cancel(&mut self, id: EventId) -> bool {
        match self.times.remove(&id) {
            Some(time) => self.queue.remove(&EventKey { time, seq: id.0 }).is_some(),
            None => false,
        }
    }

    /// Time of the earliest pending event
    pub fn peek_time(&self) -> Option<SimTime> {
        self.queue.first_key_value().map(|(key, _)| key.time)
    }

    /// Pop the earliest pending event
    pub fn pop_next(&mut self) -> Option<Event> {
        let (_, event) = self.queue.pop_first()?;
        self.times.remove(&event.id);
        Some(event)
    }

    /// Check if an event is still pending
    pub fn is_pending(&self, id: EventId) -> bool {
        self.times.contains_key(&id)
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Any pending user event. These can spawn work even with no live tasks.
    pub fn has_user_events(&self) -> bool {
        self.queue
            .values()
            .any(|e| matches!(e.kind, EventKind::User { .. }))
    }

    /// Pending events in firing order, one per line (for fault dumps)
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for event in self.queue.values() {
            out.push_str(&format!("{:12.4} | {:>6} | {}\n", event.time, event.id, event.kind));
        }
        out
    }
}
