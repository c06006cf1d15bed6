//! Kernel state and operations
//!
//! Every kernel-state mutation goes through `Kernel`. Task bodies reach it
//! through `TaskContext`; the scheduler loop in `executor` drives the event
//! side. Operations that may block return `Ok(None)` after parking the caller,
//! or `Ok(Some(wakeup))` when they complete immediately.

use super::config::{DEFAULT_MAX_TASKS, DEFAULT_SPIN_QUANTUM, RunFlags};
use super::context::{TaskBody, TaskContext};
use super::error::{SimError, SimResult};
use super::event::{Event, EventId, EventKind, EventQueue};
use super::fabric::{Availability, Channel, NodeId, ResourceFabric, ResourceId};
use super::lock::{Acquire, LockId, LockOrder, LockPolicy, SpinLock};
use super::port::{CastScope, Message, Offer, Port, PortId, PortKind, ReceiveOrder};
use super::semaphore::{SemId, Semaphore};
use super::stats::{EntitySummary, StatId, StatKind, StatisticsCollector, StatsReport};
use super::task::{
    BlockCause, KERNEL_TASK, Priority, ReadyKey, TaskId, TaskSpec, TaskState, Tcb, Wakeup,
};
use super::time::{SimTime, VirtualClock};
use super::trace::{TraceEvent, TraceRecord, TraceSink, Tracer, fmt_g};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution as _, Exp};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::{Rc, Weak};

/// Handler for user events
pub type UserHandler = Box<dyn FnMut(&mut Kernel, u64) -> SimResult<()>>;

/// Handler called after a resource changes state
pub type ResourceHandler = Box<dyn FnMut(&mut Kernel, ResourceId, Availability) -> SimResult<()>>;

/// Number of trace lines attached to a kernel-fault dump
const FAULT_TRACE_LINES: usize = 20;

/// All simulation state
pub struct Kernel {
    me: Weak<RefCell<Kernel>>,
    pub(crate) clock: VirtualClock,
    pub(crate) events: EventQueue,
    tasks: BTreeMap<TaskId, Tcb>,
    ready: BTreeMap<ReadyKey, TaskId>,
    ports: BTreeMap<PortId, Port>,
    semaphores: Vec<Semaphore>,
    locks: Vec<SpinLock>,
    pub(crate) fabric: ResourceFabric,
    stats: StatisticsCollector,
    tracer: Tracer,
    rng: StdRng,
    next_task: u64,
    next_port: u64,
    next_message: u64,
    spin_quantum: f64,
    max_tasks: usize,
    flags: RunFlags,
    warnings: Vec<String>,
    /// Bodies created since the executor last looked
    pub(crate) pending_spawn: Vec<(TaskId, LocalBoxFuture<'static, ()>)>,
    /// Slab slots of dead tasks
    pub(crate) reaped: Vec<usize>,
    /// Receive timeouts that fired; resolved at the end of the time stratum
    deferred_timeouts: Vec<(TaskId, EventId)>,
    fatal: Option<SimError>,
    user_handler: Option<UserHandler>,
    resource_handler: Option<ResourceHandler>,
}

impl Kernel {
    /// Create a kernel that can hand out handles to itself
    pub(crate) fn new_shared() -> Rc<RefCell<Kernel>> {
        Rc::new_cyclic(|me| RefCell::new(Kernel::new(me.clone())))
    }

    fn new(me: Weak<RefCell<Kernel>>) -> Self {
        Self {
            me,
            clock: VirtualClock::new(),
            events: EventQueue::new(),
            tasks: BTreeMap::new(),
            ready: BTreeMap::new(),
            ports: BTreeMap::new(),
            semaphores: Vec::new(),
            locks: Vec::new(),
            fabric: ResourceFabric::new(),
            stats: StatisticsCollector::new(),
            tracer: Tracer::new(),
            rng: StdRng::seed_from_u64(0),
            next_task: 1,
            next_port: 1,
            next_message: 1,
            spin_quantum: DEFAULT_SPIN_QUANTUM,
            max_tasks: DEFAULT_MAX_TASKS,
            flags: RunFlags::default(),
            warnings: Vec::new(),
            pending_spawn: Vec::new(),
            reaped: Vec::new(),
            deferred_timeouts: Vec::new(),
            fatal: None,
            user_handler: None,
            resource_handler: None,
        }
    }

    // ========== CONFIGURATION ==========

    pub fn set_spin_quantum(&mut self, quantum: f64) -> SimResult<()> {
        if !(quantum.is_finite() && quantum > 0.0) {
            return Err(SimError::InvalidArgument(format!("spin quantum {quantum}")));
        }
        self.spin_quantum = quantum;
        Ok(())
    }

    pub fn set_max_tasks(&mut self, max: usize) {
        self.max_tasks = max;
    }

    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.tracer.set_sink(sink);
    }

    pub fn on_user_event(&mut self, handler: UserHandler) {
        self.user_handler = Some(handler);
    }

    pub fn on_resource_event(&mut self, handler: ResourceHandler) {
        self.resource_handler = Some(handler);
    }

    /// Mutable access to the resource tables (model setup)
    pub fn fabric_mut(&mut self) -> &mut ResourceFabric {
        &mut self.fabric
    }

    pub fn fabric(&self) -> &ResourceFabric {
        &self.fabric
    }

    /// Prepare a run: seed, flags, first stochastic failures
    pub(crate) fn start_run(&mut self, seed: u64, flags: RunFlags) -> SimResult<()> {
        self.rng = StdRng::seed_from_u64(seed);
        self.flags = flags;
        if flags.trace {
            self.tracer.enable();
        } else {
            self.tracer.disable();
        }

        // Tasks created during setup are reported once tracing is on
        let created: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in created {
            self.trace_task(id, TraceEvent::Created);
        }

        let now = self.now();
        for res in self.fabric.resources() {
            let Some(model) = self.fabric.health(res)?.failure.clone() else {
                continue;
            };
            let delay = model.time_to_failure.sample(&mut self.rng)?;
            self.events.schedule(now, now + delay, EventKind::Failure(res))?;
        }
        log::debug!("run started: seed {seed}, {} tasks, {} events", self.tasks.len(), self.events.len());
        Ok(())
    }

    // ========== QUERIES ==========

    /// Current virtual time
    pub fn now(&self) -> SimTime {
        self.clock.now()
    }

    pub fn task_state(&self, id: TaskId) -> SimResult<TaskState> {
        Ok(self.tcb(id)?.state)
    }

    pub fn task_node(&self, id: TaskId) -> SimResult<NodeId> {
        Ok(self.tcb(id)?.node)
    }

    pub fn task_priority(&self, id: TaskId) -> SimResult<Priority> {
        Ok(self.tcb(id)?.priority)
    }

    /// Tasks not yet dead
    pub fn live_tasks(&self) -> usize {
        self.tasks.values().filter(|t| t.is_alive()).count()
    }

    pub fn task_parent(&self, id: TaskId) -> SimResult<Option<TaskId>> {
        Ok(self.tcb(id)?.parent)
    }

    /// Live tasks created by `id`
    pub fn children(&self, id: TaskId) -> SimResult<Vec<TaskId>> {
        self.tcb(id)?;
        Ok(self
            .tasks
            .values()
            .filter(|t| t.is_alive() && t.parent == Some(id))
            .map(|t| t.id)
            .collect())
    }

    /// Other live tasks with the same parent as `id`
    pub fn siblings(&self, id: TaskId) -> SimResult<Vec<TaskId>> {
        let parent = self.tcb(id)?.parent;
        Ok(self
            .tasks
            .values()
            .filter(|t| t.id != id && t.is_alive() && t.parent == parent)
            .map(|t| t.id)
            .collect())
    }

    /// True if `ancestor` is `task` itself or created it, directly or not
    pub fn is_self_or_ancestor(&self, ancestor: TaskId, task: TaskId) -> bool {
        let mut current = Some(task);
        while let Some(t) = current {
            if t == ancestor {
                return true;
            }
            current = self.tasks.get(&t).and_then(|tcb| tcb.parent);
        }
        false
    }

    pub fn standard_port(&self, id: TaskId) -> SimResult<Option<PortId>> {
        Ok(self.tcb(id)?.std_port)
    }

    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state == state).count()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn semaphore_count(&self, sem: SemId) -> SimResult<u32> {
        Ok(self.sem(sem)?.count())
    }

    pub fn lock_holder(&self, lock: LockId) -> SimResult<Option<TaskId>> {
        Ok(self.lock_ref(lock)?.holder())
    }

    /// Messages waiting on a port
    pub fn port_len(&self, port: PortId) -> SimResult<usize> {
        Ok(self.port(port)?.len())
    }

    pub fn port_owner(&self, port: PortId) -> SimResult<TaskId> {
        Ok(self.port(port)?.owner)
    }

    pub fn availability(&self, res: ResourceId) -> SimResult<Availability> {
        Ok(self.fabric.health(res)?.state)
    }

    /// Warnings issued so far
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    // ========== TASKS ==========

    /// Create a task and make it ready
    pub fn spawn<F, Fut>(&mut self, spec: TaskSpec, body: F) -> SimResult<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        let id = self.create_task(spec, body)?;
        self.make_ready(id)?;
        Ok(id)
    }

    /// Create a task that waits for `resume`
    pub fn spawn_suspended<F, Fut>(&mut self, spec: TaskSpec, body: F) -> SimResult<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        self.create_task(spec, body)
    }

    fn create_task<F, Fut>(&mut self, spec: TaskSpec, body: F) -> SimResult<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        self.fabric.require_up(ResourceId::Node(spec.node))?;
        if let Some(parent) = spec.parent {
            self.tcb(parent)?;
        }
        if self.tasks.len() >= self.max_tasks {
            return Err(SimError::ResourceExhausted(format!("task table full ({})", self.max_tasks)));
        }
        let Some(kernel) = self.me.upgrade() else {
            return Err(self.kernel_fault("kernel handle dropped".into()));
        };

        let id = TaskId(self.next_task);
        self.next_task += 1;
        let mut tcb = Tcb::new(id, spec.name, spec.node, spec.priority, self.now());
        tcb.parent = spec.parent;
        tcb.stats.arrivals = 1;
        self.tasks.insert(id, tcb);

        let ctx = TaskContext::new(id, kernel.clone());
        let future = TaskBody::new(id, Rc::downgrade(&kernel), body(ctx)).boxed_local();
        self.pending_spawn.push((id, future));
        self.trace_task(id, TraceEvent::Created);
        Ok(id)
    }

    /// Make a suspended task ready; cancels a deferred suspend on a
    /// blocked one
    pub fn resume(&mut self, target: TaskId) -> SimResult<()> {
        let tcb = self.tcb_mut(target)?;
        match tcb.state {
            TaskState::Suspended => {
                // A wait that ended before the suspend keeps its result
                tcb.wakeup.get_or_insert(Wakeup::Ready);
                self.make_ready(target)
            }
            TaskState::Blocked if tcb.suspend_pending => {
                tcb.suspend_pending = false;
                Ok(())
            }
            state => Err(SimError::InvalidState(format!("task {target} is {state}, not suspended"))),
        }
    }

    /// Suspend another task. A blocked task is suspended when its wait ends.
    pub fn suspend_task(&mut self, target: TaskId) -> SimResult<()> {
        let tcb = self.tcb_mut(target)?;
        match tcb.state {
            TaskState::Ready => self.suspend_ready(target),
            TaskState::Blocked => {
                tcb.suspend_pending = true;
                Ok(())
            }
            TaskState::Suspended => Ok(()),
            TaskState::Running => Err(SimError::InvalidArgument(format!(
                "task {target} is running; it must suspend itself"
            ))),
            TaskState::Dead => Err(SimError::InvalidState(format!("task {target} is dead"))),
        }
    }

    pub(crate) fn suspend_self(&mut self, caller: TaskId) -> SimResult<Option<Wakeup>> {
        self.transition(caller, TaskState::Suspended)?;
        self.tcb_mut(caller)?.wakeup = None;
        self.trace_task(caller, TraceEvent::Suspended);
        Ok(None)
    }

    /// Terminate a task with full cleanup
    pub fn kill(&mut self, target: TaskId) -> SimResult<()> {
        if !self.tcb(target)?.is_alive() {
            return Err(SimError::InvalidState(format!("task {target} is already dead")));
        }
        self.terminate_task(target)
    }

    /// End a sleep early. Ignored unless the target is sleeping.
    pub fn awaken(&mut self, target: TaskId) -> SimResult<()> {
        let tcb = self.tcb(target)?;
        if tcb.state == TaskState::Blocked && tcb.cause == Some(BlockCause::Sleeping) {
            self.unblock(target, Wakeup::Ready)?;
        }
        Ok(())
    }

    pub fn set_priority(&mut self, target: TaskId, priority: Priority) -> SimResult<()> {
        let tcb = self.tcb_mut(target)?;
        if !tcb.is_alive() {
            return Err(SimError::InvalidState(format!("task {target} is dead")));
        }
        tcb.priority = priority;
        let node = tcb.node;
        let cause = tcb.cause;
        if let Some(old) = tcb.ready_key {
            let key = (Reverse(priority), old.1);
            tcb.ready_key = Some(key);
            self.ready.remove(&old);
            self.ready.insert(key, target);
        }
        match cause {
            Some(BlockCause::Computing) => self.fabric.node_mut(node)?.reprioritize(target, priority),
            Some(BlockCause::Lock(lock)) => self.lock_mut(lock)?.reprioritize(target, priority),
            _ => {}
        }
        self.trace_task(target, TraceEvent::PriorityAdjusted { priority });
        Ok(())
    }

    pub(crate) fn yield_now(&mut self, caller: TaskId) -> SimResult<Option<Wakeup>> {
        self.make_ready(caller)?;
        self.tcb_mut(caller)?.wakeup = Some(Wakeup::Ready);
        Ok(None)
    }

    pub(crate) fn migrate(&mut self, caller: TaskId, node: NodeId) -> SimResult<Option<Wakeup>> {
        self.fabric.require_up(ResourceId::Node(node))?;
        self.trace_task(caller, TraceEvent::Migrating { node });
        self.tcb_mut(caller)?.node = node;
        self.yield_now(caller)
    }

    pub(crate) fn sleep(&mut self, caller: TaskId, duration: SimTime) -> SimResult<Option<Wakeup>> {
        check_delay(duration, "sleep duration")?;
        let now = self.now();
        let event = self.events.schedule(now, now + duration, EventKind::Resume { task: caller })?;
        self.park(caller, BlockCause::Sleeping)?;
        self.tcb_mut(caller)?.timer = Some(event);
        self.trace_task(caller, TraceEvent::Sleeping);
        Ok(None)
    }

    /// Hold one CPU of the caller's node for `demand / speed`
    pub(crate) fn compute(&mut self, caller: TaskId, demand: f64) -> SimResult<Option<Wakeup>> {
        check_delay(demand, "compute demand")?;
        if demand == 0.0 {
            return Ok(Some(Wakeup::Ready));
        }
        let seq = self.events.next_seq();
        let (node, priority) = {
            let tcb = self.tcb(caller)?;
            (tcb.node, tcb.priority)
        };
        self.park(caller, BlockCause::Computing)?;
        self.tcb_mut(caller)?.service = demand;
        if self.fabric.node_mut(node)?.request_cpu(caller, priority, seq) {
            self.start_burst(caller)?;
        } else {
            self.trace_task(caller, TraceEvent::Ready);
        }
        Ok(None)
    }

    fn start_burst(&mut self, id: TaskId) -> SimResult<()> {
        let now = self.now();
        let tcb = self.tcb_mut(id)?;
        let waited = now - tcb.blocked_since;
        tcb.stats.wait_time += waited;
        tcb.blocked_since = now;
        let (node, service) = (tcb.node, tcb.service);
        let node = self.fabric.node_mut(node)?;
        node.stats.wait_time += waited;
        let done = now + service / node.speed;
        let event = self.events.schedule(now, done, EventKind::ComputeDone { task: id })?;
        self.tcb_mut(id)?.timer = Some(event);
        self.trace_task(id, TraceEvent::Executing);
        Ok(())
    }

    // ========== PORTS ==========

    /// Open a port owned by `owner`. The first private port a task opens
    /// becomes its standard port.
    pub fn open_port(&mut self, owner: TaskId, kind: PortKind, capacity: usize) -> SimResult<PortId> {
        if capacity == 0 {
            return Err(SimError::InvalidArgument("port capacity must be positive".into()));
        }
        if !self.tcb(owner)?.is_alive() {
            return Err(SimError::InvalidState(format!("task {owner} is dead")));
        }
        let id = PortId(self.next_port);
        self.next_port += 1;
        let tcb = self.tcb_mut(owner)?;
        tcb.ports.push(id);
        if kind == PortKind::Private && tcb.std_port.is_none() {
            tcb.std_port = Some(id);
        }
        self.ports.insert(id, Port::new(id, kind, owner, capacity));
        Ok(id)
    }

    /// Make `port` the one casts to `caller` are delivered to
    pub(crate) fn set_standard_port(&mut self, caller: TaskId, port: PortId) -> SimResult<()> {
        let p = self.port(port)?;
        if !p.open {
            return Err(SimError::PortClosed(port));
        }
        if p.owner != caller {
            return Err(SimError::NotOwner);
        }
        if p.kind == PortKind::Set {
            return Err(SimError::InvalidArgument(format!("port {port} is a port set")));
        }
        self.tcb_mut(caller)?.std_port = Some(port);
        Ok(())
    }

    fn stamp(&mut self, caller: TaskId, port: PortId, msg: &mut Message) {
        msg.id = self.next_message;
        self.next_message += 1;
        msg.sent_at = self.now();
        msg.sender = caller;
        msg.port = port;
    }

    /// Port whose queue takes the messages sent to `port`
    fn route(&self, port: PortId) -> SimResult<PortId> {
        Ok(self.port(port)?.set.unwrap_or(port))
    }

    /// Destination fields for a send trace: owner for owner-only ports
    fn send_target(&self, port: PortId) -> SimResult<Option<TaskId>> {
        let p = self.port(port)?;
        if !p.open {
            return Err(SimError::PortClosed(port));
        }
        Ok(match p.kind {
            PortKind::Private | PortKind::Set => Some(p.owner),
            PortKind::Shared => None,
        })
    }

    pub(crate) fn send(&mut self, caller: TaskId, port: PortId, msg: Message) -> SimResult<Option<Wakeup>> {
        self.post(caller, port, msg, None)
    }

    /// Send keeping the message's own `sent_at` (forwarding)
    pub(crate) fn resend(&mut self, caller: TaskId, port: PortId, msg: Message) -> SimResult<Option<Wakeup>> {
        let sent_at = msg.sent_at;
        if !(sent_at.is_finite() && sent_at <= self.now()) {
            return Err(SimError::InvalidArgument(format!("message time stamp {sent_at}")));
        }
        self.post(caller, port, msg, Some(sent_at))
    }

    fn post(
        &mut self,
        caller: TaskId,
        port: PortId,
        mut msg: Message,
        sent_at: Option<SimTime>,
    ) -> SimResult<Option<Wakeup>> {
        let to = self.send_target(port)?;
        self.stamp(caller, port, &mut msg);
        if let Some(sent_at) = sent_at {
            msg.sent_at = sent_at;
        }
        self.trace_task(
            caller,
            TraceEvent::Sending {
                message: msg.id,
                to,
                port,
                via: None,
            },
        );
        self.offer(caller, port, msg)
    }

    /// Put a stamped message into the queue `port` routes to on behalf of
    /// `sender`, parking the sender while that queue is full
    fn offer(&mut self, sender: TaskId, port: PortId, msg: Message) -> SimResult<Option<Wakeup>> {
        let Some(msg) = self.deliver(port, msg)? else {
            return Ok(Some(Wakeup::Ready));
        };
        let target = self.route(port)?;
        self.port_mut(target)?.park_sender(sender, msg);
        self.park(sender, BlockCause::Sending(target))?;
        Ok(None)
    }

    /// Hand a stamped message to a waiting receiver or queue it. A full
    /// queue gives the message back.
    fn deliver(&mut self, port: PortId, msg: Message) -> SimResult<Option<Message>> {
        let target = self.route(port)?;
        let p = self.port_mut(target)?;
        p.stats.arrivals += 1;
        match p.offer(msg) {
            Offer::Handoff(receiver, msg) => {
                self.hand_over(receiver, target, msg)?;
                Ok(None)
            }
            Offer::Queued => Ok(None),
            Offer::Full(msg) => Ok(Some(msg)),
        }
    }

    /// Deliver straight to a receiver blocked on `port`
    fn hand_over(&mut self, receiver: TaskId, port: PortId, msg: Message) -> SimResult<()> {
        let shared = self.note_delivery(port, &msg)?;
        self.trace_task(
            receiver,
            TraceEvent::Receives {
                message: msg.id,
                port: msg.port,
                shared,
            },
        );
        self.unblock(receiver, Wakeup::Message(msg))
    }

    /// Port statistics for one delivery; returns whether the port is shared
    fn note_delivery(&mut self, port: PortId, msg: &Message) -> SimResult<bool> {
        let now = self.now();
        let p = self.port_mut(port)?;
        p.stats.completions += 1;
        p.stats.wait_time += now - msg.sent_at;
        Ok(p.kind == PortKind::Shared)
    }

    /// Send through a bus or link: the caller waits for the carrier and
    /// the transmission, then the message is offered to the port
    pub(crate) fn send_via(
        &mut self,
        caller: TaskId,
        port: PortId,
        mut msg: Message,
        channel: Channel,
    ) -> SimResult<Option<Wakeup>> {
        let to = self.send_target(port)?;
        self.fabric.require_up(channel.into())?;
        let from = self.tcb(caller)?.node;
        let dest = self.tcb(self.port(port)?.owner)?.node;
        self.fabric.check_route(channel, from, dest)?;

        self.stamp(caller, port, &mut msg);
        self.trace_task(
            caller,
            TraceEvent::Sending {
                message: msg.id,
                to,
                port,
                via: Some(channel),
            },
        );

        let now = self.now();
        let bytes = msg.len();
        let (carrier, stats) = self.fabric.carrier_mut(channel)?;
        let done = carrier.reserve(caller, bytes, now, stats);
        self.park(caller, BlockCause::Transmitting)?;
        let event = self.events.schedule(now, done, EventKind::TransmitDone { task: caller })?;
        let tcb = self.tcb_mut(caller)?;
        tcb.in_transit = Some((port, msg, channel));
        tcb.timer = Some(event);
        Ok(None)
    }

    /// Copy `msg` to the standard port of every other live task in `scope`.
    ///
    /// Never blocks: a copy that meets a full port is lost with a warning.
    /// Returns the number of copies delivered.
    pub(crate) fn cast(&mut self, caller: TaskId, scope: CastScope, msg: Message) -> SimResult<usize> {
        let node = self.tcb(caller)?.node;
        let targets: Vec<(TaskId, PortId)> = self
            .tasks
            .values()
            .filter(|t| t.id != caller && t.is_alive())
            .filter(|t| match scope {
                CastScope::All => true,
                CastScope::Node => t.node == node,
                CastScope::Descendants => self.is_self_or_ancestor(caller, t.id),
            })
            .filter_map(|t| t.std_port.map(|port| (t.id, port)))
            .collect();

        let mut delivered = 0;
        for (task, port) in targets {
            let mut copy = msg.clone();
            self.stamp(caller, port, &mut copy);
            let id = copy.id;
            self.trace_task(
                caller,
                TraceEvent::Sending {
                    message: id,
                    to: Some(task),
                    port,
                    via: None,
                },
            );
            if self.deliver(port, copy)?.is_none() {
                delivered += 1;
            } else {
                let label = self.task_label(caller);
                self.warn(format!("{label} cast message {id} lost: port {port} is full"));
            }
        }
        Ok(delivered)
    }

    pub(crate) fn receive(
        &mut self,
        caller: TaskId,
        port: PortId,
        order: ReceiveOrder,
        timeout: Option<SimTime>,
    ) -> SimResult<Option<Wakeup>> {
        if let Some(t) = timeout {
            check_delay(t, "receive timeout")?;
        }
        let p = self.port(port)?;
        if !p.open {
            return Err(SimError::PortClosed(port));
        }
        if let Some(set) = p.set {
            return Err(SimError::InvalidState(format!("port {port} belongs to port set {set}")));
        }
        if p.kind != PortKind::Shared && p.owner != caller {
            return Err(SimError::NotOwner);
        }

        let p = self.ports.get_mut(&port).ok_or(SimError::UnknownPort(port))?;
        let taken = match p.select(order, &mut self.rng) {
            Some(index) => p.take_at(index),
            None => None,
        };
        if let Some((msg, woken)) = taken {
            let shared = self.note_delivery(port, &msg)?;
            self.trace_task(
                caller,
                TraceEvent::Receives {
                    message: msg.id,
                    port: msg.port,
                    shared,
                },
            );
            for sender in woken {
                self.unblock(sender, Wakeup::Ready)?;
            }
            return Ok(Some(Wakeup::Message(msg)));
        }

        if timeout == Some(0.0) {
            self.trace_task(caller, TraceEvent::TimesOut { port });
            return Ok(Some(Wakeup::TimedOut));
        }

        self.port_mut(port)?.park_receiver(caller);
        self.park(caller, BlockCause::Receiving(port))?;
        self.trace_task(caller, TraceEvent::ReceivingBlocked { port });
        if let Some(t) = timeout {
            let now = self.now();
            let event = self.events.schedule(now, now + t, EventKind::Timeout { task: caller, port })?;
            self.tcb_mut(caller)?.timer = Some(event);
        }
        Ok(None)
    }

    /// Route `member`'s traffic into `set`. Messages already queued on the
    /// member move along.
    pub(crate) fn join_port_set(&mut self, caller: TaskId, set: PortId, member: PortId) -> SimResult<()> {
        if set == member {
            return Err(SimError::InvalidArgument(format!("port {set} cannot join itself")));
        }
        let s = self.port(set)?;
        let m = self.port(member)?;
        if s.kind != PortKind::Set {
            return Err(SimError::InvalidArgument(format!("port {set} is not a port set")));
        }
        if m.kind == PortKind::Set {
            return Err(SimError::InvalidArgument(format!("port set {member} cannot join a set")));
        }
        if s.owner != caller || m.owner != caller {
            return Err(SimError::NotOwner);
        }
        for p in [s, m] {
            if !p.open {
                return Err(SimError::PortClosed(p.id));
            }
        }
        if let Some(other) = m.set {
            return Err(SimError::InvalidState(format!(
                "port {member} already belongs to port set {other}"
            )));
        }
        if m.has_waiters() {
            return Err(SimError::InvalidState(format!("port {member} has blocked tasks")));
        }

        let m = self.port_mut(member)?;
        m.set = Some(set);
        let queued = m.drain_queue();
        let s = self.port_mut(set)?;
        s.members.push(member);
        s.requeue(queued);
        Ok(())
    }

    /// Detach `member` from `set`. Its queued messages and blocked senders
    /// go back to it.
    pub(crate) fn leave_port_set(&mut self, caller: TaskId, set: PortId, member: PortId) -> SimResult<()> {
        let s = self.port(set)?;
        if s.kind != PortKind::Set {
            return Err(SimError::InvalidArgument(format!("port {set} is not a port set")));
        }
        if s.owner != caller {
            return Err(SimError::NotOwner);
        }
        if self.port(member)?.set != Some(set) {
            return Err(SimError::InvalidState(format!("port {member} is not in port set {set}")));
        }

        let s = self.port_mut(set)?;
        s.members.retain(|&m| m != member);
        let queued = s.extract(member);
        let senders = s.extract_senders(member);
        let mut woken = s.admit();
        let moved: Vec<TaskId> = senders.iter().map(|(t, _)| *t).collect();
        let m = self.port_mut(member)?;
        m.set = None;
        m.requeue(queued);
        m.park_senders(senders);
        woken.extend(m.admit());

        for task in moved {
            self.tcb_mut(task)?.cause = Some(BlockCause::Sending(member));
        }
        for task in woken {
            self.unblock(task, Wakeup::Ready)?;
        }
        Ok(())
    }

    /// Hand a port to another task. The caller must own the port or be an
    /// ancestor of its owner. Fails while any task is blocked on it.
    pub(crate) fn pass_port(&mut self, caller: TaskId, port: PortId, to: TaskId) -> SimResult<()> {
        let p = self.port(port)?;
        if !p.open {
            return Err(SimError::PortClosed(port));
        }
        let owner = p.owner;
        if !self.is_self_or_ancestor(caller, owner) {
            return Err(SimError::NotOwner);
        }
        if p.kind == PortKind::Set || p.set.is_some() {
            return Err(SimError::InvalidState(format!("port {port} is part of a port set")));
        }
        if p.has_waiters() {
            return Err(SimError::InvalidState(format!("port {port} has blocked tasks")));
        }
        if !self.tcb(to)?.is_alive() {
            return Err(SimError::InvalidState(format!("task {to} is dead")));
        }

        self.disown(owner, port)?;
        self.tcb_mut(to)?.ports.push(port);
        self.port_mut(port)?.owner = to;
        self.trace_task(caller, TraceEvent::PassesPort { port, to });
        Ok(())
    }

    /// Close an owned port; blocked tasks fail with `PortClosed`
    pub(crate) fn release_port(&mut self, caller: TaskId, port: PortId) -> SimResult<()> {
        if self.port(port)?.owner != caller {
            return Err(SimError::NotOwner);
        }
        self.disown(caller, port)?;
        self.close_port(port, SimError::PortClosed(port))
    }

    fn disown(&mut self, owner: TaskId, port: PortId) -> SimResult<()> {
        let tcb = self.tcb_mut(owner)?;
        tcb.ports.retain(|&p| p != port);
        if tcb.std_port == Some(port) {
            tcb.std_port = None;
        }
        Ok(())
    }

    /// Close `port` and fail everyone blocked on it with `err`. A closing
    /// set frees its members; a closing member leaves its set and takes its
    /// queued messages with it.
    fn close_port(&mut self, port: PortId, err: SimError) -> SimResult<()> {
        let p = self.port_mut(port)?;
        let mut failed = p.close();
        let set = p.set.take();
        let members = std::mem::take(&mut p.members);
        for member in members {
            self.port_mut(member)?.set = None;
        }

        let mut woken = Vec::new();
        if let Some(set) = set {
            let s = self.port_mut(set)?;
            s.members.retain(|&m| m != port);
            s.extract(port);
            failed.extend(s.extract_senders(port).into_iter().map(|(t, _)| t));
            woken = s.admit();
        }
        for task in failed {
            self.fault_task(task, err.clone())?;
        }
        for task in woken {
            self.unblock(task, Wakeup::Ready)?;
        }
        Ok(())
    }

    // ========== SEMAPHORES ==========

    pub fn create_semaphore(&mut self, initial: u32) -> SemId {
        let id = SemId(self.semaphores.len() as u64);
        self.semaphores.push(Semaphore::new(id, initial));
        id
    }

    pub(crate) fn wait(&mut self, caller: TaskId, sem: SemId) -> SimResult<Option<Wakeup>> {
        self.sem(sem)?;
        self.trace_task(caller, TraceEvent::WaitingOnSemaphore { sem });
        if self.sem_mut(sem)?.wait(caller) {
            return Ok(Some(Wakeup::Ready));
        }
        self.trace_task(caller, TraceEvent::BlockedOnSemaphore { sem });
        self.park(caller, BlockCause::Semaphore(sem))?;
        Ok(None)
    }

    /// Signal on behalf of `by` (a task, or `KERNEL_TASK` from a handler)
    pub fn signal(&mut self, by: TaskId, sem: SemId) -> SimResult<()> {
        self.sem(sem)?;
        self.trace_task(by, TraceEvent::SignallingSemaphore { sem });
        if let Some(waiter) = self.sem_mut(sem)?.signal() {
            let waited = self.now() - self.tcb(waiter)?.blocked_since;
            self.sem_mut(sem)?.stats.wait_time += waited;
            self.unblock(waiter, Wakeup::Ready)?;
        }
        Ok(())
    }

    pub fn reset_semaphore(&mut self, by: TaskId, sem: SemId, value: u32) -> SimResult<()> {
        self.sem_mut(sem)?.reset(value)?;
        self.trace_task(by, TraceEvent::ResettingSemaphore { sem, value });
        Ok(())
    }

    // ========== LOCKS ==========

    pub fn create_lock(&mut self, policy: LockPolicy, order: LockOrder) -> LockId {
        let id = LockId(self.locks.len() as u64);
        self.locks.push(SpinLock::new(id, policy, order));
        id
    }

    pub(crate) fn lock(&mut self, caller: TaskId, lock: LockId) -> SimResult<Option<Wakeup>> {
        let now = self.now();
        let priority = self.tcb(caller)?.priority;
        match self.lock_mut(lock)?.acquire(caller, priority, now)? {
            Acquire::Acquired => {
                self.tcb_mut(caller)?.locks.push(lock);
                self.trace_task(caller, TraceEvent::LockingLock { lock });
                Ok(Some(Wakeup::Ready))
            }
            Acquire::Queued => {
                self.park(caller, BlockCause::Lock(lock))?;
                Ok(None)
            }
            Acquire::Spin => {
                self.trace_task(caller, TraceEvent::SpinningOnLock { lock });
                self.park(caller, BlockCause::Spinning(lock))?;
                self.schedule_spin(caller, lock)?;
                Ok(None)
            }
        }
    }

    fn schedule_spin(&mut self, task: TaskId, lock: LockId) -> SimResult<()> {
        let now = self.now();
        let event = self
            .events
            .schedule(now, now + self.spin_quantum, EventKind::SpinRetry { task, lock })?;
        self.tcb_mut(task)?.timer = Some(event);
        Ok(())
    }

    /// Release `lock` for its holder. The caller must be the holder or one
    /// of its ancestors; anyone else is terminated.
    pub(crate) fn unlock(&mut self, caller: TaskId, lock: LockId) -> SimResult<()> {
        let now = self.now();
        let holder = match self.lock_holder(lock)? {
            Some(holder) if self.is_self_or_ancestor(caller, holder) => holder,
            _ => {
                self.terminate_task(caller)?;
                return Err(SimError::NotOwner);
            }
        };
        let next = self.lock_mut(lock)?.release(holder, now)?;
        self.tcb_mut(holder)?.locks.retain(|&l| l != lock);
        self.trace_task(caller, TraceEvent::UnlockingLock { lock });
        if let Some(next) = next {
            let waited = now - self.tcb(next)?.blocked_since;
            self.lock_mut(lock)?.stats.wait_time += waited;
            self.tcb_mut(next)?.locks.push(lock);
            self.trace_task(next, TraceEvent::LockingLock { lock });
            self.unblock(next, Wakeup::Ready)?;
        }
        Ok(())
    }

    // ========== RESOURCES ==========

    /// Scripted failure at absolute time `at`
    pub fn schedule_failure(&mut self, res: ResourceId, at: SimTime) -> SimResult<EventId> {
        self.fabric.health(res)?;
        self.events.schedule(self.now(), at, EventKind::Failure(res))
    }

    /// Scripted repair at absolute time `at`
    pub fn schedule_repair(&mut self, res: ResourceId, at: SimTime) -> SimResult<EventId> {
        self.fabric.health(res)?;
        self.events.schedule(self.now(), at, EventKind::Repair(res))
    }

    fn set_availability(&mut self, res: ResourceId, to: Availability) -> SimResult<()> {
        let now = self.now();
        if !self.fabric.set_state(res, to, now)? {
            log::debug!("{res} already {to:?} at {now}");
            return Ok(());
        }
        let trace_node = match res {
            ResourceId::Node(n) => n.0 as i64,
            _ => -1,
        };
        let event = match to {
            Availability::Down => TraceEvent::Failed(res),
            Availability::Up => TraceEvent::Repaired(res),
        };
        self.trace_kernel(trace_node, event);

        if to == Availability::Down {
            for task in self.victims_of(res, now)? {
                if self.tcb(task)?.state == TaskState::Blocked {
                    self.fault_task(task, SimError::ResourceDown(res))?;
                }
            }
        }

        // Stochastic resources keep cycling
        if let Some(model) = self.fabric.health(res)?.failure.clone() {
            let (dist, kind) = match to {
                Availability::Down => (model.time_to_repair, EventKind::Repair(res)),
                Availability::Up => (model.time_to_failure, EventKind::Failure(res)),
            };
            let delay = dist.sample(&mut self.rng)?;
            self.events.schedule(now, now + delay, kind)?;
        }

        if let Some(mut handler) = self.resource_handler.take() {
            let result = handler(self, res, to);
            self.resource_handler = Some(handler);
            self.absorb_handler_error(result)?;
        }
        Ok(())
    }

    /// Tasks whose current blocking call depends on `res`
    fn victims_of(&mut self, res: ResourceId, now: SimTime) -> SimResult<Vec<TaskId>> {
        let mut victims = match res {
            ResourceId::Node(n) => {
                let mut v = self.fabric.node_mut(n)?.drain();
                v.extend(
                    self.tasks
                        .values()
                        .filter(|t| t.node == n && t.state == TaskState::Blocked)
                        .map(|t| t.id),
                );
                v
            }
            ResourceId::Bus(b) => {
                let (carrier, stats) = self.fabric.carrier_mut(Channel::Bus(b))?;
                carrier.drain(now, stats)
            }
            ResourceId::Link(l) => {
                let (carrier, stats) = self.fabric.carrier_mut(Channel::Link(l))?;
                carrier.drain(now, stats)
            }
        };
        let mut seen = std::collections::HashSet::new();
        victims.retain(|t| seen.insert(*t));
        Ok(victims)
    }

    // ========== USER EVENTS ==========

    pub fn schedule_user_event(&mut self, at: SimTime, tag: u64) -> SimResult<EventId> {
        self.events.schedule(self.now(), at, EventKind::User { tag })
    }

    fn user_event(&mut self, tag: u64) -> SimResult<()> {
        self.trace_kernel(-1, TraceEvent::User { tag });
        match self.user_handler.take() {
            Some(mut handler) => {
                let result = handler(self, tag);
                self.user_handler = Some(handler);
                self.absorb_handler_error(result)
            }
            None => {
                self.warn(format!("no handler for user event {tag}"));
                Ok(())
            }
        }
    }

    /// Handler errors abort the run only when fatal
    fn absorb_handler_error(&mut self, result: SimResult<()>) -> SimResult<()> {
        match result {
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.warn(format!("event handler failed: {err}"));
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    // ========== STATISTICS ==========

    pub fn open_stat(&mut self, name: impl Into<String>, kind: StatKind) -> StatId {
        let now = self.now();
        self.stats.open(name, kind, now)
    }

    /// Add a sample. A non-finite result is fatal to the run.
    pub fn record_stat(&mut self, stat: StatId, value: f64) -> SimResult<()> {
        let now = self.now();
        let result = self.stats.record(stat, value, now);
        if let Err(err) = &result {
            self.raise(err);
        }
        result
    }

    pub fn reset_stat(&mut self, stat: StatId) -> SimResult<()> {
        let now = self.now();
        self.stats.reset(stat, now)
    }

    /// Restart every user statistic at the current time
    pub fn reset_all_stats(&mut self) {
        let now = self.now();
        self.stats.reset_all(now);
    }

    /// End-of-run figures for every entity and user statistic
    pub fn stats_report(&self) -> SimResult<StatsReport> {
        let span = self.now();
        let mut entities = Vec::new();
        for t in self.tasks.values() {
            let name = t.name.clone().unwrap_or_default();
            entities.push(EntitySummary::new("task", t.id.0, name, &t.stats, 1, span)?);
        }
        for p in self.ports.values() {
            entities.push(EntitySummary::new("port", p.id.0, "", &p.stats, 1, span)?);
        }
        for s in &self.semaphores {
            entities.push(EntitySummary::new("semaphore", s.id.0, "", &s.stats, 1, span)?);
        }
        for l in &self.locks {
            entities.push(EntitySummary::new("lock", l.id.0, "", &l.stats, 1, span)?);
        }
        for n in &self.fabric.nodes {
            let mut stats = n.stats.clone();
            stats.down_time += n.health.open_down_time(span);
            entities.push(EntitySummary::new("node", n.id.0, n.name.clone(), &stats, n.cpus, span)?);
        }
        for b in &self.fabric.buses {
            let mut stats = b.stats.clone();
            stats.down_time += b.health.open_down_time(span);
            entities.push(EntitySummary::new("bus", b.id.0, b.name.clone(), &stats, 1, span)?);
        }
        for l in &self.fabric.links {
            let mut stats = l.stats.clone();
            stats.down_time += l.health.open_down_time(span);
            entities.push(EntitySummary::new("link", l.id.0, l.name.clone(), &stats, 1, span)?);
        }
        Ok(StatsReport {
            time: span,
            entities,
            user: self.stats.summaries(span)?,
        })
    }

    // ========== RANDOM NUMBERS ==========

    /// Uniform on [0, 1)
    pub fn random(&mut self) -> f64 {
        self.rng.gen_range(0.0..1.0)
    }

    pub fn uniform(&mut self, low: f64, high: f64) -> SimResult<f64> {
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(SimError::InvalidArgument(format!("uniform range [{low}, {high})")));
        }
        Ok(self.rng.gen_range(low..high))
    }

    pub fn exponential(&mut self, mean: f64) -> SimResult<f64> {
        let exp = Exp::new(1.0 / mean)
            .map_err(|e| SimError::InvalidArgument(format!("exponential mean {mean}: {e}")))?;
        Ok(exp.sample(&mut self.rng))
    }

    /// Uniform index in 0..n
    pub fn choice(&mut self, n: usize) -> SimResult<usize> {
        if n == 0 {
            return Err(SimError::InvalidArgument("choice from empty range".into()));
        }
        Ok(self.rng.gen_range(0..n))
    }

    // ========== SCHEDULER INTERFACE ==========

    /// Caller must be the running task on an UP node
    pub(crate) fn check_caller(&self, id: TaskId) -> SimResult<()> {
        let tcb = self.tcb(id)?;
        if tcb.state != TaskState::Running {
            return Err(SimError::InvalidState(format!("task {id} is not running")));
        }
        self.fabric.require_up(ResourceId::Node(tcb.node))
    }

    pub(crate) fn pop_ready(&mut self) -> Option<TaskId> {
        let (_, id) = self.ready.pop_first()?;
        if let Some(tcb) = self.tasks.get_mut(&id) {
            tcb.ready_key = None;
        }
        Some(id)
    }

    /// Mark a ready task running; returns its body's slab slot
    pub(crate) fn begin_dispatch(&mut self, id: TaskId) -> SimResult<usize> {
        self.transition(id, TaskState::Running)?;
        match self.tcb(id)?.slot {
            Some(slot) => Ok(slot),
            None => Err(self.kernel_fault(format!("task {id} dispatched without a body"))),
        }
    }

    /// Bookkeeping after a poll. `finished` is true if the body returned.
    pub(crate) fn end_dispatch(&mut self, id: TaskId, finished: bool) -> SimResult<()> {
        let state = self.tcb(id)?.state;
        if finished {
            if state != TaskState::Dead {
                self.terminate_task(id)?;
            }
            return Ok(());
        }
        if state == TaskState::Running {
            // Pending without a kernel call: treat as a yield
            self.make_ready(id)?;
        }
        Ok(())
    }

    /// Record the slab slot of a newly integrated body. False if the task
    /// died before it ever ran.
    pub(crate) fn attach_body(&mut self, id: TaskId, slot: usize) -> bool {
        match self.tasks.get_mut(&id) {
            Some(tcb) if tcb.is_alive() => {
                tcb.slot = Some(slot);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn take_wakeup(&mut self, id: TaskId) -> Option<Wakeup> {
        self.tasks.get_mut(&id)?.wakeup.take()
    }

    #[cfg(test)]
    pub(crate) fn set_wakeup(&mut self, id: TaskId, wakeup: Wakeup) {
        if let Some(tcb) = self.tasks.get_mut(&id) {
            tcb.wakeup = Some(wakeup);
        }
    }

    pub(crate) fn take_fatal(&mut self) -> Option<SimError> {
        self.fatal.take()
    }

    /// Keep the first fatal error; the run stops before the next dispatch
    pub(crate) fn raise(&mut self, err: &SimError) {
        if err.is_fatal() && self.fatal.is_none() {
            self.fatal = Some(err.clone());
        }
    }

    /// A kernel call made by task `id` failed
    pub(crate) fn bad_call(&mut self, id: TaskId, err: &SimError) {
        if err.is_fatal() {
            self.raise(err);
            return;
        }
        if let Some(tcb) = self.tasks.get_mut(&id) {
            tcb.stats.faults += 1;
            tcb.last_fault = Some(err.clone());
        }
        let label = self.task_label(id);
        self.warn(format!("{label} bad call: {err}"));
    }

    /// A task body returned an error
    pub(crate) fn task_failed(&mut self, id: TaskId, err: SimError) {
        if err.is_fatal() {
            self.raise(&err);
            return;
        }
        if let Some(tcb) = self.tasks.get_mut(&id) {
            if !tcb.is_alive() {
                log::debug!("task {id} returned {err} after it died");
                return;
            }
            // A fault the kernel already charged is not counted twice
            if tcb.last_fault.take().as_ref() != Some(&err) {
                tcb.stats.faults += 1;
            }
        }
        let label = self.task_label(id);
        self.warn(format!("{label} terminated by fault: {err}"));
    }

    fn task_label(&self, id: TaskId) -> String {
        match self.tasks.get(&id).and_then(|t| t.name.as_ref()) {
            Some(name) => format!("task {id} ({name})"),
            None => format!("task {id}"),
        }
    }

    /// Nothing can happen any more
    pub(crate) fn is_idle(&self) -> bool {
        if !self.ready.is_empty() || !self.pending_spawn.is_empty() {
            return false;
        }
        if self.events.is_empty() {
            return true;
        }
        self.live_tasks() == 0 && !self.events.has_user_events()
    }

    /// Fire one event at the current time
    pub(crate) fn handle_event(&mut self, event: Event) -> SimResult<()> {
        let Event { id, kind, .. } = event;
        match kind {
            EventKind::Resume { task } => {
                if self.timer_matches(task, id) {
                    self.unblock(task, Wakeup::Ready)?;
                }
            }
            EventKind::Timeout { task, .. } => {
                if self.timer_matches(task, id) {
                    self.deferred_timeouts.push((task, id));
                }
            }
            EventKind::ComputeDone { task } => {
                if self.timer_matches(task, id) {
                    self.finish_burst(task)?;
                }
            }
            EventKind::SpinRetry { task, lock } => {
                if self.timer_matches(task, id) {
                    self.retry_spin(task, lock)?;
                }
            }
            EventKind::TransmitDone { task } => {
                if self.timer_matches(task, id) {
                    self.finish_transmit(task)?;
                }
            }
            EventKind::Failure(res) => self.set_availability(res, Availability::Down)?,
            EventKind::Repair(res) => self.set_availability(res, Availability::Up)?,
            EventKind::User { tag } => self.user_event(tag)?,
        }
        Ok(())
    }

    fn timer_matches(&self, task: TaskId, event: EventId) -> bool {
        self.tasks
            .get(&task)
            .is_some_and(|t| t.state == TaskState::Blocked && t.timer == Some(event))
    }

    fn finish_burst(&mut self, task: TaskId) -> SimResult<()> {
        let tcb = self.tcb_mut(task)?;
        tcb.timer = None;
        let (node, service) = (tcb.node, tcb.service);
        let speed = self.fabric.node(node)?.speed;
        let busy = service / speed;
        self.tcb_mut(task)?.stats.busy_time += busy;
        let next = self.fabric.node_mut(node)?.release_cpu(task, busy);
        self.unblock(task, Wakeup::Ready)?;
        if let Some(next) = next {
            self.start_burst(next)?;
        }
        Ok(())
    }

    fn retry_spin(&mut self, task: TaskId, lock: LockId) -> SimResult<()> {
        let now = self.now();
        self.tcb_mut(task)?.timer = None;
        if !self.lock_mut(lock)?.retry(task, now) {
            return self.schedule_spin(task, lock);
        }
        let tcb = self.tcb_mut(task)?;
        let spun = now - tcb.blocked_since;
        tcb.stats.spin_time += spun;
        tcb.locks.push(lock);
        self.lock_mut(lock)?.stats.spin_time += spun;
        self.trace_task(task, TraceEvent::LockingLock { lock });
        self.unblock(task, Wakeup::Ready)
    }

    fn finish_transmit(&mut self, task: TaskId) -> SimResult<()> {
        let tcb = self.tcb_mut(task)?;
        tcb.timer = None;
        let Some((port, msg, channel)) = tcb.in_transit.take() else {
            return Err(self.kernel_fault(format!("task {task} finished a transmission it never started")));
        };
        let (carrier, stats) = self.fabric.carrier_mut(channel)?;
        carrier.finish(task, stats);

        if !self.port(port)?.open {
            return self.fault_task(task, SimError::PortClosed(port));
        }
        let Some(msg) = self.deliver(port, msg)? else {
            return self.unblock(task, Wakeup::Ready);
        };
        // Still parked; now waiting for room in the port
        let now = self.now();
        let target = self.route(port)?;
        let tcb = self.tcb_mut(task)?;
        tcb.cause = Some(BlockCause::Sending(target));
        tcb.blocked_since = now;
        self.port_mut(target)?.park_sender(task, msg);
        Ok(())
    }

    /// Resolve receive timeouts whose message did not arrive in the same
    /// time stratum. Returns true if anything changed.
    pub(crate) fn resolve_timeouts(&mut self) -> SimResult<bool> {
        let due = std::mem::take(&mut self.deferred_timeouts);
        let mut resolved = false;
        for (task, event) in due {
            if !self.timer_matches(task, event) {
                continue;
            }
            let Some(BlockCause::Receiving(port)) = self.tcb(task)?.cause else {
                continue;
            };
            self.port_mut(port)?.withdraw(task);
            self.tcb_mut(task)?.timer = None;
            self.trace_task(task, TraceEvent::TimesOut { port });
            self.unblock(task, Wakeup::TimedOut)?;
            resolved = true;
        }
        Ok(resolved)
    }

    // ========== HELPERS ==========

    fn tcb(&self, id: TaskId) -> SimResult<&Tcb> {
        self.tasks.get(&id).ok_or(SimError::UnknownTask(id))
    }

    fn tcb_mut(&mut self, id: TaskId) -> SimResult<&mut Tcb> {
        self.tasks.get_mut(&id).ok_or(SimError::UnknownTask(id))
    }

    fn port(&self, id: PortId) -> SimResult<&Port> {
        self.ports.get(&id).ok_or(SimError::UnknownPort(id))
    }

    fn port_mut(&mut self, id: PortId) -> SimResult<&mut Port> {
        self.ports.get_mut(&id).ok_or(SimError::UnknownPort(id))
    }

    fn sem(&self, id: SemId) -> SimResult<&Semaphore> {
        self.semaphores
            .get(id.0 as usize)
            .ok_or(SimError::UnknownSemaphore(id))
    }

    fn sem_mut(&mut self, id: SemId) -> SimResult<&mut Semaphore> {
        self.semaphores
            .get_mut(id.0 as usize)
            .ok_or(SimError::UnknownSemaphore(id))
    }

    fn lock_ref(&self, id: LockId) -> SimResult<&SpinLock> {
        self.locks.get(id.0 as usize).ok_or(SimError::UnknownLock(id))
    }

    fn lock_mut(&mut self, id: LockId) -> SimResult<&mut SpinLock> {
        self.locks.get_mut(id.0 as usize).ok_or(SimError::UnknownLock(id))
    }

    /// Kernel invariant violation, with the pending events and recent
    /// trace attached
    pub(crate) fn kernel_fault(&self, detail: String) -> SimError {
        let mut queue = self.events.dump();
        let recent = self.tracer.recent(FAULT_TRACE_LINES);
        if !recent.is_empty() {
            queue.push_str("recent trace:\n");
            for line in recent {
                queue.push_str(line);
                queue.push('\n');
            }
        }
        SimError::KernelFault {
            time: self.now(),
            detail,
            queue,
        }
    }

    fn transition(&mut self, id: TaskId, to: TaskState) -> SimResult<()> {
        let result = self.tcb_mut(id)?.transition(to);
        result.map_err(|detail| self.kernel_fault(detail))
    }

    fn make_ready(&mut self, id: TaskId) -> SimResult<()> {
        self.transition(id, TaskState::Ready)?;
        let seq = self.events.next_seq();
        let tcb = self.tcb_mut(id)?;
        let key = (Reverse(tcb.priority), seq);
        tcb.ready_key = Some(key);
        self.ready.insert(key, id);
        Ok(())
    }

    fn suspend_ready(&mut self, id: TaskId) -> SimResult<()> {
        if let Some(key) = self.tcb_mut(id)?.ready_key.take() {
            self.ready.remove(&key);
        }
        self.transition(id, TaskState::Suspended)?;
        self.trace_task(id, TraceEvent::Suspended);
        Ok(())
    }

    /// Block the running task
    fn park(&mut self, id: TaskId, cause: BlockCause) -> SimResult<()> {
        let now = self.now();
        let tcb = self.tcb_mut(id)?;
        let result = tcb.block(cause, now);
        tcb.wakeup = None;
        result.map_err(|detail| self.kernel_fault(detail))
    }

    /// End a block with `wakeup`
    fn unblock(&mut self, id: TaskId, wakeup: Wakeup) -> SimResult<()> {
        let now = self.now();
        let tcb = self.tcb_mut(id)?;
        match tcb.cause.take() {
            // Service time, not queueing
            Some(
                BlockCause::Sleeping
                | BlockCause::Computing
                | BlockCause::Spinning(_)
                | BlockCause::Transmitting,
            ) => {}
            _ => tcb.stats.wait_time += now - tcb.blocked_since,
        }
        tcb.wakeup = Some(wakeup);
        let timer = tcb.timer.take();
        let suspend = std::mem::take(&mut tcb.suspend_pending);
        if let Some(timer) = timer {
            self.events.cancel(timer);
        }
        self.make_ready(id)?;
        if suspend {
            self.suspend_ready(id)?;
        }
        Ok(())
    }

    /// Fail a blocked task's current call with `err`
    fn fault_task(&mut self, id: TaskId, err: SimError) -> SimResult<()> {
        if self.tcb(id)?.state != TaskState::Blocked {
            return Ok(());
        }
        self.withdraw(id)?;
        let tcb = self.tcb_mut(id)?;
        tcb.stats.faults += 1;
        tcb.last_fault = Some(err.clone());
        self.unblock(id, Wakeup::Fault(err))
    }

    /// Remove a blocked task from whatever queue its cause names
    fn withdraw(&mut self, id: TaskId) -> SimResult<()> {
        let tcb = self.tcb_mut(id)?;
        let cause = tcb.cause;
        let node = tcb.node;
        let transit = tcb.in_transit.take();
        match cause {
            Some(BlockCause::Receiving(port) | BlockCause::Sending(port)) => {
                self.port_mut(port)?.withdraw(id);
            }
            Some(BlockCause::Semaphore(sem)) => {
                self.sem_mut(sem)?.remove_waiter(id);
            }
            Some(BlockCause::Lock(lock) | BlockCause::Spinning(lock)) => {
                self.lock_mut(lock)?.remove_contender(id);
            }
            Some(BlockCause::Computing) => {
                if let Some(promoted) = self.fabric.node_mut(node)?.remove_task(id) {
                    self.start_burst(promoted)?;
                }
            }
            Some(BlockCause::Transmitting) => {
                if let Some((_, _, channel)) = transit {
                    let now = self.now();
                    let (carrier, stats) = self.fabric.carrier_mut(channel)?;
                    for (task, done) in carrier.remove(id, now, stats) {
                        self.reschedule_transmit(task, done)?;
                    }
                }
            }
            Some(BlockCause::Sleeping) | None => {}
        }
        Ok(())
    }

    /// Move a queued transmission's completion to `done`
    fn reschedule_transmit(&mut self, task: TaskId, done: SimTime) -> SimResult<()> {
        let now = self.now();
        if let Some(old) = self.tcb_mut(task)?.timer.take() {
            self.events.cancel(old);
        }
        let event = self.events.schedule(now, done, EventKind::TransmitDone { task })?;
        self.tcb_mut(task)?.timer = Some(event);
        Ok(())
    }

    /// Death: leave every queue, release locks and ports, wake dependants
    fn terminate_task(&mut self, id: TaskId) -> SimResult<()> {
        let now = self.now();
        let tcb = self.tcb(id)?;
        if !tcb.is_alive() {
            return Err(self.kernel_fault(format!("task {id} terminated twice")));
        }
        if tcb.state == TaskState::Blocked {
            self.withdraw(id)?;
        }

        let tcb = self.tcb_mut(id)?;
        if let Some(key) = tcb.ready_key.take() {
            self.ready.remove(&key);
        }
        let tcb = self.tcb_mut(id)?;
        let timer = tcb.timer.take();
        tcb.cause = None;
        tcb.wakeup = None;
        tcb.suspend_pending = false;
        tcb.in_transit = None;
        tcb.stats.completions += 1;
        let locks = std::mem::take(&mut tcb.locks);
        let ports = std::mem::take(&mut tcb.ports);
        tcb.std_port = None;
        if let Some(slot) = tcb.slot.take() {
            self.reaped.push(slot);
        }
        if let Some(timer) = timer {
            self.events.cancel(timer);
        }
        self.transition(id, TaskState::Dead)?;
        self.trace_task(id, TraceEvent::Dead);

        for lock in locks {
            for task in self.lock_mut(lock)?.abandon(now) {
                self.fault_task(task, SimError::OwnerTerminated)?;
            }
        }
        for port in ports {
            self.close_port(port, SimError::OwnerTerminated)?;
        }
        Ok(())
    }

    fn trace_task(&mut self, id: TaskId, event: TraceEvent) {
        if !self.tracer.is_enabled() {
            return;
        }
        let (node, name) = match self.tasks.get(&id) {
            Some(tcb) => (tcb.node.0 as i64, tcb.name.clone()),
            None => (-1, Some("kernel".to_string())),
        };
        self.tracer.record(TraceRecord {
            time: self.clock.now(),
            node,
            task: id,
            name,
            event,
        });
    }

    fn trace_kernel(&mut self, node: i64, event: TraceEvent) {
        if !self.tracer.is_enabled() {
            return;
        }
        self.tracer.record(TraceRecord {
            time: self.clock.now(),
            node,
            task: KERNEL_TASK,
            name: Some("kernel".to_string()),
            event,
        });
    }

    /// Record a warning; forwarded to the log when warnings are enabled
    pub fn warn(&mut self, msg: impl Into<String>) {
        let line = format!("{} ***> {}", fmt_g(self.now(), 8), msg.into());
        if self.flags.warnings {
            log::warn!("{line}");
        }
        self.warnings.push(line);
    }

    pub(crate) fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}

fn check_delay(value: f64, what: &str) -> SimResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SimError::InvalidArgument(format!("{what} {value}")))
    }
}
