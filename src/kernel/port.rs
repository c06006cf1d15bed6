//! Message ports
//!
//! A port is a bounded mailbox owned by one task. Private ports are
//! received from only by their owner; shared ports by any task. A port set
//! gathers the traffic of its member ports into one queue; each message
//! remembers the port it was addressed to.
//!
//! The port itself only holds queues. Blocking, waking and tracing are the
//! scheduler's job: operations here report which tasks (if any) must be woken.

use super::stats::EntityStats;
use super::task::{Priority, TaskId};
use super::time::SimTime;
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;

/// Port identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u64);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who may receive from a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Owner-only receive
    Private,
    /// Any task may receive; receivers queue FIFO
    Shared,
    /// Owner-only queue fed by its member ports
    Set,
}

/// Which queued message a receive takes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiveOrder {
    /// Oldest first
    #[default]
    Fifo,
    /// Newest first
    Last,
    /// Highest message priority, oldest among equals
    Priority,
    /// Uniformly at random
    Random,
}

/// Which tasks a cast reaches, always excluding the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastScope {
    /// Every live task
    All,
    /// Live tasks on the sender's node
    Node,
    /// Live tasks descended from the sender
    Descendants,
}

/// A message in flight
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Assigned by the kernel on send
    pub id: u64,
    /// Model-defined message type
    pub mtype: i64,
    /// Message data; its length is the transmission size on buses and links
    pub data: Vec<u8>,
    /// Virtual time of the send, stamped by the kernel
    pub sent_at: SimTime,
    /// Stamped by the kernel
    pub sender: TaskId,
    /// Port the receiver should answer on
    pub reply_to: Option<PortId>,
    /// Port the message was sent to, stamped by the kernel. Differs from
    /// the receiving port when that is a port set.
    pub port: PortId,
    /// Rank for priority receives
    pub priority: Priority,
}

impl Message {
    pub fn new(mtype: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: 0,
            mtype,
            data: data.into(),
            sent_at: 0.0,
            sender: TaskId(0),
            reply_to: None,
            port: PortId(0),
            priority: 0,
        }
    }

    /// Attach a reply port
    pub fn with_reply(mut self, port: PortId) -> Self {
        self.reply_to = Some(port);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Outcome of offering a message to a port
#[derive(Debug, PartialEq)]
pub enum Offer {
    /// A receiver was waiting; it gets the message directly
    Handoff(TaskId, Message),
    /// Appended to the queue
    Queued,
    /// Queue is at capacity; the message comes back
    Full(Message),
}

/// A bounded mailbox
#[derive(Debug)]
pub struct Port {
    pub id: PortId,
    pub kind: PortKind,
    pub owner: TaskId,
    pub capacity: usize,
    pub open: bool,
    /// Set this port has joined
    pub set: Option<PortId>,
    /// Ports that joined this set
    pub members: Vec<PortId>,
    queue: VecDeque<Message>,
    receivers: VecDeque<TaskId>,
    senders: VecDeque<(TaskId, Message)>,
    pub stats: EntityStats,
}

impl Port {
    pub fn new(id: PortId, kind: PortKind, owner: TaskId, capacity: usize) -> Self {
        Self {
            id,
            kind,
            owner,
            capacity,
            open: true,
            set: None,
            members: Vec::new(),
            queue: VecDeque::new(),
            receivers: VecDeque::new(),
            senders: VecDeque::new(),
            stats: EntityStats::default(),
        }
    }

    /// Messages waiting to be received
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Any blocked sender or receiver references this port
    pub fn has_waiters(&self) -> bool {
        !self.receivers.is_empty() || !self.senders.is_empty()
    }

    /// Blocked receivers in FIFO order
    pub fn receivers(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.receivers.iter().copied()
    }

    /// Offer a message: hand it to the longest-waiting receiver, else queue
    /// it if there is room.
    pub fn offer(&mut self, msg: Message) -> Offer {
        if let Some(receiver) = self.receivers.pop_front() {
            return Offer::Handoff(receiver, msg);
        }
        if self.is_full() {
            return Offer::Full(msg);
        }
        self.queue.push_back(msg);
        Offer::Queued
    }

    /// Index of the message a receive in `order` takes
    pub fn select(&self, order: ReceiveOrder, rng: &mut impl Rng) -> Option<usize> {
        if self.queue.is_empty() {
            return None;
        }
        let index = match order {
            ReceiveOrder::Fifo => 0,
            ReceiveOrder::Last => self.queue.len() - 1,
            ReceiveOrder::Priority => {
                let mut best = 0;
                for (i, msg) in self.queue.iter().enumerate() {
                    if msg.priority > self.queue[best].priority {
                        best = i;
                    }
                }
                best
            }
            ReceiveOrder::Random => rng.gen_range(0..self.queue.len()),
        };
        Some(index)
    }

    /// Take the message at `index`.
    ///
    /// Freeing a slot lets blocked senders' messages in, oldest first; those
    /// senders are returned so they can be woken.
    pub fn take_at(&mut self, index: usize) -> Option<(Message, Vec<TaskId>)> {
        let msg = self.queue.remove(index)?;
        Some((msg, self.admit()))
    }

    /// Move blocked senders' messages into free slots
    pub fn admit(&mut self) -> Vec<TaskId> {
        let mut woken = Vec::new();
        while !self.is_full() {
            let Some((sender, pending)) = self.senders.pop_front() else {
                break;
            };
            self.queue.push_back(pending);
            woken.push(sender);
        }
        woken
    }

    /// Append messages regardless of capacity (set membership changes)
    pub fn requeue(&mut self, msgs: impl IntoIterator<Item = Message>) {
        self.queue.extend(msgs);
    }

    /// Remove every queued message
    pub fn drain_queue(&mut self) -> Vec<Message> {
        self.queue.drain(..).collect()
    }

    /// Remove the queued messages that were sent to `origin`
    pub fn extract(&mut self, origin: PortId) -> Vec<Message> {
        let (taken, kept) = self.queue.drain(..).partition(|m| m.port == origin);
        self.queue = kept;
        taken.into()
    }

    /// Remove the blocked senders whose message was sent to `origin`
    pub fn extract_senders(&mut self, origin: PortId) -> Vec<(TaskId, Message)> {
        let (taken, kept) = self.senders.drain(..).partition(|(_, m)| m.port == origin);
        self.senders = kept;
        taken.into()
    }

    /// Park a receiver
    pub fn park_receiver(&mut self, task: TaskId) {
        self.receivers.push_back(task);
    }

    /// Park a sender together with the message it could not deliver
    pub fn park_sender(&mut self, task: TaskId, msg: Message) {
        self.senders.push_back((task, msg));
    }

    /// Park senders moved from another queue, keeping their order
    pub fn park_senders(&mut self, senders: impl IntoIterator<Item = (TaskId, Message)>) {
        self.senders.extend(senders);
    }

    /// Remove `task` from both wait queues. Returns true if it was present.
    pub fn withdraw(&mut self, task: TaskId) -> bool {
        let before = self.receivers.len() + self.senders.len();
        self.receivers.retain(|&t| t != task);
        self.senders.retain(|(t, _)| *t != task);
        before != self.receivers.len() + self.senders.len()
    }

    /// Close the port, discarding queued messages.
    ///
    /// Returns every blocked task, receivers first, each in FIFO order.
    pub fn close(&mut self) -> Vec<TaskId> {
        self.open = false;
        self.queue.clear();
        let mut blocked: Vec<TaskId> = self.receivers.drain(..).collect();
        blocked.extend(self.senders.drain(..).map(|(t, _)| t));
        blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn msg(n: i64) -> Message {
        Message::new(n, vec![0u8; 4])
    }

    fn port(capacity: usize) -> Port {
        Port::new(PortId(1), PortKind::Private, TaskId(1), capacity)
    }

    #[test]
    fn test_offer_queues_until_full() {
        let mut p = port(2);
        assert_eq!(p.offer(msg(1)), Offer::Queued);
        assert_eq!(p.offer(msg(2)), Offer::Queued);
        assert!(p.is_full());
        match p.offer(msg(3)) {
            Offer::Full(m) => assert_eq!(m.mtype, 3),
            other => panic!("expected Full, got {:?}", other),
        }
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_offer_hands_off_to_waiting_receiver() {
        let mut p = port(1);
        p.park_receiver(TaskId(5));
        match p.offer(msg(7)) {
            Offer::Handoff(task, m) => {
                assert_eq!(task, TaskId(5));
                assert_eq!(m.mtype, 7);
            }
            other => panic!("expected Handoff, got {:?}", other),
        }
        assert!(p.is_empty());
    }

    #[test]
    fn test_take_admits_blocked_sender() {
        let mut p = port(1);
        p.offer(msg(1));
        p.park_sender(TaskId(2), msg(2));
        p.park_sender(TaskId(3), msg(3));

        let (m, woken) = p.take_at(0).unwrap();
        assert_eq!(m.mtype, 1);
        assert_eq!(woken, vec![TaskId(2)]);

        let (m, woken) = p.take_at(0).unwrap();
        assert_eq!(m.mtype, 2);
        assert_eq!(woken, vec![TaskId(3)]);

        let (m, woken) = p.take_at(0).unwrap();
        assert_eq!(m.mtype, 3);
        assert!(woken.is_empty());
        assert!(p.take_at(0).is_none());
    }

    #[test]
    fn test_select_by_order() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut p = port(8);
        assert_eq!(p.select(ReceiveOrder::Fifo, &mut rng), None);
        for (mtype, priority) in [(1, 0), (2, 5), (3, 1), (4, 5)] {
            p.offer(msg(mtype).with_priority(priority));
        }
        assert_eq!(p.select(ReceiveOrder::Fifo, &mut rng), Some(0));
        assert_eq!(p.select(ReceiveOrder::Last, &mut rng), Some(3));
        // Ties go to the older message
        assert_eq!(p.select(ReceiveOrder::Priority, &mut rng), Some(1));
        for _ in 0..20 {
            let i = p.select(ReceiveOrder::Random, &mut rng).unwrap();
            assert!(i < 4);
        }
    }

    #[test]
    fn test_extract_by_origin() {
        let mut p = Port::new(PortId(3), PortKind::Set, TaskId(1), 2);
        let to = |origin: u64, mtype: i64| {
            let mut m = msg(mtype);
            m.port = PortId(origin);
            m
        };
        p.requeue([to(1, 10), to(2, 20), to(1, 11)]);
        p.park_sender(TaskId(5), to(2, 21));
        p.park_sender(TaskId(6), to(1, 12));

        let moved = p.extract(PortId(1));
        assert_eq!(moved.iter().map(|m| m.mtype).collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(p.len(), 1);

        let senders = p.extract_senders(PortId(2));
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].0, TaskId(5));

        // One slot is free again
        assert_eq!(p.admit(), vec![TaskId(6)]);
        assert!(p.is_full());
    }

    #[test]
    fn test_withdraw() {
        let mut p = port(1);
        p.park_receiver(TaskId(4));
        p.park_sender(TaskId(6), msg(1));
        assert!(p.has_waiters());
        assert!(p.withdraw(TaskId(4)));
        assert!(p.withdraw(TaskId(6)));
        assert!(!p.withdraw(TaskId(6)));
        assert!(!p.has_waiters());
    }

    #[test]
    fn test_close_returns_blocked_tasks() {
        let mut p = port(1);
        p.offer(msg(1));
        p.park_sender(TaskId(3), msg(2));
        p.park_sender(TaskId(2), msg(3));
        let blocked = p.close();
        assert_eq!(blocked, vec![TaskId(3), TaskId(2)]);
        assert!(!p.open);
        assert!(p.is_empty());
    }

    #[test]
    fn test_message_builder() {
        let m = Message::new(9, "hello").with_reply(PortId(4)).with_priority(2);
        assert_eq!(m.len(), 5);
        assert_eq!(m.reply_to, Some(PortId(4)));
        assert_eq!(m.priority, 2);
    }
}
