//! Simulation driver
//!
//! Owns the task bodies and runs the scheduling loop:
//! - Ready tasks run first, highest priority first, FIFO within a priority
//! - When nothing is ready, the earliest event fires and time jumps to it
//! - All events at one instant fire before time moves on
//! - Receive timeouts are settled last within an instant, so a message
//!   arriving at the same time as a timeout wins
//!
//! Everything is single-threaded and deterministic for a given seed.

use super::config::{ModelDescription, RunFlags};
use super::context::TaskContext;
use super::error::{SimError, SimResult};
use super::event::EventId;
use super::fabric::{
    Availability, BusId, FailureModel, LinkId, NodeId, ResourceId,
};
use super::lock::{LockId, LockOrder, LockPolicy};
use super::port::{PortId, PortKind};
use super::semaphore::SemId;
use super::stats::{StatId, StatKind, StatsReport};
use super::syscall::Kernel;
use super::task::{TaskId, TaskSpec};
use super::time::SimTime;
use super::trace::TraceSink;
use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use serde::Serialize;
use slab::Slab;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::task::Context;

/// Name of the node every simulation starts with when none is configured
pub const DEFAULT_NODE: &str = "node 0";

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// The clock reached the requested duration
    DurationReached,
    /// No ready task and no event that could create work
    Idle,
}

/// Outcome of `Simulation::run`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub reason: EndReason,
    pub end_time: SimTime,
    pub stats: StatsReport,
    pub warnings: Vec<String>,
}

/// State shown to the step hook before each dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct StepInfo {
    pub time: SimTime,
    /// Task about to run
    pub task: TaskId,
    /// Tasks still waiting in the ready queue
    pub ready: usize,
    pub pending_events: usize,
    pub next_event: Option<SimTime>,
}

type StepHook = Box<dyn FnMut(&StepInfo)>;

/// A model plus the task bodies that run in it
pub struct Simulation {
    kernel: Rc<RefCell<Kernel>>,
    /// Body futures, indexed by the slot recorded in each TCB
    bodies: Slab<LocalBoxFuture<'static, ()>>,
    step_hook: Option<StepHook>,
    ran: bool,
}

impl Simulation {
    /// A simulation with one single-CPU node
    pub fn new() -> Self {
        let sim = Self::empty();
        let added = sim.kernel.borrow_mut().fabric_mut().add_node(DEFAULT_NODE, 1, 1.0);
        if let Err(err) = added {
            log::error!("default node rejected: {err}");
        }
        sim
    }

    fn empty() -> Self {
        Self {
            kernel: Kernel::new_shared(),
            bodies: Slab::new(),
            step_hook: None,
            ran: false,
        }
    }

    /// Build the resource fabric and synchronization objects of a model
    pub fn from_model(model: &ModelDescription) -> SimResult<Self> {
        model.validate()?;
        let sim = Self::empty();
        {
            let mut kernel = sim.kernel.borrow_mut();
            kernel.set_spin_quantum(model.spin_quantum)?;
            kernel.set_max_tasks(model.max_tasks);

            let fabric = kernel.fabric_mut();
            if model.nodes.is_empty() {
                fabric.add_node(DEFAULT_NODE, 1, 1.0)?;
            }
            for spec in &model.nodes {
                let id = fabric.add_node(spec.name.as_str(), spec.cpus, spec.speed)?;
                if let Some(failure) = &spec.failure {
                    fabric.set_failure_model(ResourceId::Node(id), failure.clone())?;
                }
            }
            for spec in &model.buses {
                let nodes: Vec<NodeId> = spec.nodes.iter().map(|&n| NodeId(n)).collect();
                let id = fabric.add_bus(spec.name.as_str(), &nodes, spec.rate)?;
                if let Some(failure) = &spec.failure {
                    fabric.set_failure_model(ResourceId::Bus(id), failure.clone())?;
                }
            }
            for spec in &model.links {
                let id = fabric.add_link(
                    spec.name.as_str(),
                    NodeId(spec.source),
                    NodeId(spec.destination),
                    spec.rate,
                )?;
                if let Some(failure) = &spec.failure {
                    fabric.set_failure_model(ResourceId::Link(id), failure.clone())?;
                }
            }

            for spec in &model.semaphores {
                kernel.create_semaphore(spec.initial);
            }
            for spec in &model.locks {
                kernel.create_lock(spec.policy, spec.order);
            }
        }
        log::debug!(
            "model built: {} nodes, {} buses, {} links",
            model.nodes.len().max(1),
            model.buses.len(),
            model.links.len()
        );
        Ok(sim)
    }

    // ========== SETUP ==========

    pub fn add_node(&mut self, name: &str, cpus: usize, speed: f64) -> SimResult<NodeId> {
        self.kernel.borrow_mut().fabric_mut().add_node(name, cpus, speed)
    }

    pub fn add_bus(&mut self, name: &str, nodes: &[NodeId], rate: f64) -> SimResult<BusId> {
        self.kernel.borrow_mut().fabric_mut().add_bus(name, nodes, rate)
    }

    pub fn add_link(&mut self, name: &str, source: NodeId, destination: NodeId, rate: f64) -> SimResult<LinkId> {
        self.kernel
            .borrow_mut()
            .fabric_mut()
            .add_link(name, source, destination, rate)
    }

    pub fn set_failure_model(&mut self, res: ResourceId, model: FailureModel) -> SimResult<()> {
        model.validate()?;
        self.kernel.borrow_mut().fabric_mut().set_failure_model(res, model)
    }

    pub fn schedule_failure(&mut self, res: ResourceId, at: SimTime) -> SimResult<EventId> {
        self.kernel.borrow_mut().schedule_failure(res, at)
    }

    pub fn schedule_repair(&mut self, res: ResourceId, at: SimTime) -> SimResult<EventId> {
        self.kernel.borrow_mut().schedule_repair(res, at)
    }

    pub fn create_semaphore(&mut self, initial: u32) -> SemId {
        self.kernel.borrow_mut().create_semaphore(initial)
    }

    pub fn create_lock(&mut self, policy: LockPolicy, order: LockOrder) -> LockId {
        self.kernel.borrow_mut().create_lock(policy, order)
    }

    /// Open a port on behalf of `owner` before the run starts
    pub fn open_port(&mut self, owner: TaskId, kind: PortKind, capacity: usize) -> SimResult<PortId> {
        self.kernel.borrow_mut().open_port(owner, kind, capacity)
    }

    pub fn spawn<F, Fut>(&mut self, spec: TaskSpec, body: F) -> SimResult<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        self.kernel.borrow_mut().spawn(spec, body)
    }

    pub fn spawn_suspended<F, Fut>(&mut self, spec: TaskSpec, body: F) -> SimResult<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        self.kernel.borrow_mut().spawn_suspended(spec, body)
    }

    pub fn schedule_user_event(&mut self, at: SimTime, tag: u64) -> SimResult<EventId> {
        self.kernel.borrow_mut().schedule_user_event(at, tag)
    }

    pub fn open_stat(&mut self, name: &str, kind: StatKind) -> StatId {
        self.kernel.borrow_mut().open_stat(name, kind)
    }

    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.kernel.borrow_mut().set_trace_sink(sink);
    }

    pub fn on_user_event(&mut self, handler: impl FnMut(&mut Kernel, u64) -> SimResult<()> + 'static) {
        self.kernel.borrow_mut().on_user_event(Box::new(handler));
    }

    pub fn on_resource_event(
        &mut self,
        handler: impl FnMut(&mut Kernel, ResourceId, Availability) -> SimResult<()> + 'static,
    ) {
        self.kernel.borrow_mut().on_resource_event(Box::new(handler));
    }

    /// Called before every dispatch when the run has `step` set
    pub fn on_step(&mut self, hook: impl FnMut(&StepInfo) + 'static) {
        self.step_hook = Some(Box::new(hook));
    }

    /// Direct kernel access for setup and inspection
    pub fn with_kernel<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        f(&mut self.kernel.borrow_mut())
    }

    pub fn now(&self) -> SimTime {
        self.kernel.borrow().now()
    }

    #[cfg(test)]
    pub(crate) fn kernel_handle(&self) -> Rc<RefCell<Kernel>> {
        self.kernel.clone()
    }

    // ========== RUN LOOP ==========

    /// Run until `duration` or until nothing is left to do
    pub fn run(&mut self, duration: SimTime, seed: u64, flags: RunFlags) -> SimResult<RunReport> {
        if !(duration.is_finite() && duration > 0.0) {
            return Err(SimError::InvalidDuration(duration));
        }
        if self.ran {
            return Err(SimError::InvalidState("simulation has already run".into()));
        }
        self.ran = true;
        self.kernel.borrow_mut().start_run(seed, flags)?;

        let reason = loop {
            self.integrate_pending();
            if let Some(err) = self.kernel.borrow_mut().take_fatal() {
                return Err(err);
            }

            let next = self.kernel.borrow_mut().pop_ready();
            if let Some(id) = next {
                if flags.step {
                    self.step(id);
                }
                self.dispatch(id)?;
                continue;
            }

            let mut kernel = self.kernel.borrow_mut();
            let now = kernel.now();
            if kernel.events.peek_time() == Some(now) {
                if let Some(event) = kernel.events.pop_next() {
                    kernel.handle_event(event)?;
                }
                continue;
            }
            if kernel.resolve_timeouts()? {
                continue;
            }
            if kernel.is_idle() {
                break EndReason::Idle;
            }
            let Some(time) = kernel.events.peek_time() else {
                break EndReason::Idle;
            };
            if time >= duration {
                kernel.clock.advance_to(duration)?;
                break EndReason::DurationReached;
            }
            if let Some(event) = kernel.events.pop_next() {
                kernel.clock.advance_to(event.time)?;
                kernel.handle_event(event)?;
            }
        };
        self.integrate_pending();

        let mut kernel = self.kernel.borrow_mut();
        let report = RunReport {
            reason,
            end_time: kernel.now(),
            stats: kernel.stats_report()?,
            warnings: kernel.take_warnings(),
        };
        log::info!(
            "run finished at {} ({:?}), {} live tasks",
            report.end_time,
            report.reason,
            kernel.live_tasks()
        );
        Ok(report)
    }

    /// Move new bodies into the slab and drop the bodies of dead tasks
    fn integrate_pending(&mut self) {
        let spawned = std::mem::take(&mut self.kernel.borrow_mut().pending_spawn);
        for (id, body) in spawned {
            let slot = self.bodies.insert(body);
            if !self.kernel.borrow_mut().attach_body(id, slot) {
                self.bodies.remove(slot);
            }
        }

        let reaped = std::mem::take(&mut self.kernel.borrow_mut().reaped);
        for slot in reaped {
            if self.bodies.contains(slot) {
                self.bodies.remove(slot);
            }
        }
    }

    /// Poll one task's body. The kernel is not borrowed during the poll.
    fn dispatch(&mut self, id: TaskId) -> SimResult<()> {
        let slot = self.kernel.borrow_mut().begin_dispatch(id)?;
        let Some(body) = self.bodies.get_mut(slot) else {
            return Err(self
                .kernel
                .borrow()
                .kernel_fault(format!("task {id} has no body in slot {slot}")));
        };
        let mut cx = Context::from_waker(noop_waker_ref());
        let finished = body.as_mut().poll(&mut cx).is_ready();
        self.kernel.borrow_mut().end_dispatch(id, finished)
    }

    fn step(&mut self, task: TaskId) {
        let Some(hook) = self.step_hook.as_mut() else {
            return;
        };
        let info = {
            let mut kernel = self.kernel.borrow_mut();
            StepInfo {
                time: kernel.now(),
                task,
                ready: kernel.ready_count(),
                pending_events: kernel.events.len(),
                next_event: kernel.events.peek_time(),
            }
        };
        hook(&info);
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        // Unstarted bodies hold kernel handles
        let pending = std::mem::take(&mut self.kernel.borrow_mut().pending_spawn);
        drop(pending);
        self.bodies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::task::TaskState;
    use std::cell::Cell;

    fn run(sim: &mut Simulation, duration: SimTime) -> RunReport {
        sim.run(duration, 1, RunFlags::default()).unwrap()
    }

    #[test]
    fn test_task_runs_to_completion() {
        let mut sim = Simulation::new();
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();
        let id = sim
            .spawn(TaskSpec::new(), move |_ctx| async move {
                ran_clone.set(true);
                Ok(())
            })
            .unwrap();

        let report = run(&mut sim, 10.0);
        assert!(ran.get());
        assert_eq!(report.reason, EndReason::Idle);
        assert_eq!(report.end_time, 0.0);
        assert_eq!(sim.with_kernel(|k| k.task_state(id)), Ok(TaskState::Dead));
    }

    #[test]
    fn test_priority_order() {
        let mut sim = Simulation::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (name, priority) in [("background", -1), ("normal", 0), ("critical", 5)] {
            let order = order.clone();
            sim.spawn(TaskSpec::named(name).priority(priority), move |_ctx| async move {
                order.borrow_mut().push(name);
                Ok(())
            })
            .unwrap();
        }

        run(&mut sim, 1.0);
        assert_eq!(order.borrow().as_slice(), &["critical", "normal", "background"]);
    }

    #[test]
    fn test_sleep_advances_virtual_time() {
        let mut sim = Simulation::new();
        let woke = Rc::new(Cell::new(-1.0));
        let woke_clone = woke.clone();
        sim.spawn(TaskSpec::new(), move |ctx| async move {
            ctx.sleep(2.5).await?;
            woke_clone.set(ctx.now());
            Ok(())
        })
        .unwrap();

        let report = run(&mut sim, 10.0);
        assert_eq!(woke.get(), 2.5);
        assert_eq!(report.reason, EndReason::Idle);
        assert_eq!(report.end_time, 2.5);
    }

    #[test]
    fn test_duration_reached() {
        let mut sim = Simulation::new();
        let woke = Rc::new(Cell::new(false));
        let woke_clone = woke.clone();
        sim.spawn(TaskSpec::new(), move |ctx| async move {
            ctx.sleep(20.0).await?;
            woke_clone.set(true);
            Ok(())
        })
        .unwrap();

        let report = run(&mut sim, 5.0);
        assert!(!woke.get());
        assert_eq!(report.reason, EndReason::DurationReached);
        assert_eq!(report.end_time, 5.0);
    }

    #[test]
    fn test_run_validates_duration_and_runs_once() {
        let mut sim = Simulation::new();
        assert_eq!(
            sim.run(0.0, 1, RunFlags::default()),
            Err(SimError::InvalidDuration(0.0))
        );
        assert!(sim.run(f64::NAN, 1, RunFlags::default()).is_err());
        run(&mut sim, 1.0);
        assert!(matches!(
            sim.run(1.0, 1, RunFlags::default()),
            Err(SimError::InvalidState(_))
        ));
    }

    #[test]
    fn test_spawn_during_run() {
        let mut sim = Simulation::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let order_clone = order.clone();
        sim.spawn(TaskSpec::named("parent"), move |ctx| async move {
            let inner = order_clone.clone();
            ctx.spawn(TaskSpec::named("child"), move |_ctx| async move {
                inner.borrow_mut().push("child");
                Ok(())
            })?;
            order_clone.borrow_mut().push("parent");
            Ok(())
        })
        .unwrap();

        run(&mut sim, 1.0);
        assert_eq!(order.borrow().as_slice(), &["parent", "child"]);
    }

    #[test]
    fn test_implicit_yield_requeues_task() {
        let mut sim = Simulation::new();
        let counter = Rc::new(Cell::new(0));
        let counter_clone = counter.clone();
        sim.spawn(TaskSpec::new(), move |_ctx| async move {
            counter_clone.set(counter_clone.get() + 1);
            futures::pending!();
            counter_clone.set(counter_clone.get() + 1);
            Ok(())
        })
        .unwrap();

        run(&mut sim, 1.0);
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_step_hook_sees_each_dispatch() {
        let mut sim = Simulation::new();
        let steps = Rc::new(RefCell::new(Vec::new()));
        let steps_clone = steps.clone();
        sim.on_step(move |info| steps_clone.borrow_mut().push((info.task, info.time)));
        sim.spawn(TaskSpec::new(), |ctx| async move { ctx.sleep(1.0).await })
            .unwrap();

        let flags = RunFlags {
            step: true,
            ..RunFlags::default()
        };
        sim.run(5.0, 1, flags).unwrap();
        assert_eq!(
            steps.borrow().as_slice(),
            &[(TaskId(1), 0.0), (TaskId(1), 1.0)]
        );
    }

    #[test]
    fn test_task_error_becomes_warning() {
        let mut sim = Simulation::new();
        sim.spawn(TaskSpec::named("faulty"), |_ctx| async {
            Err(SimError::InvalidArgument("bad input".into()))
        })
        .unwrap();

        let report = run(&mut sim, 1.0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("task 1 (faulty) terminated by fault"));
        let task = report.stats.entity("task", 1).unwrap();
        assert_eq!(task.counters.faults, 1);
    }

    #[test]
    fn test_fatal_error_aborts_run() {
        let mut sim = Simulation::new();
        sim.spawn(TaskSpec::new(), |_ctx| async {
            Err(SimError::NumericFault("mean = NaN".into()))
        })
        .unwrap();

        assert_eq!(
            sim.run(1.0, 1, RunFlags::default()),
            Err(SimError::NumericFault("mean = NaN".into()))
        );
    }

    #[test]
    fn test_ignored_bad_call_is_reported() {
        let mut sim = Simulation::new();
        sim.spawn(TaskSpec::named("careless"), |ctx| async move {
            let _ = ctx.open_port(0);
            ctx.sleep(1.0).await
        })
        .unwrap();

        let report = run(&mut sim, 5.0);
        assert_eq!(report.end_time, 1.0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("task 1 (careless) bad call: invalid argument"));
        let task = report.stats.entity("task", 1).unwrap();
        assert_eq!(task.counters.faults, 1);
    }

    #[test]
    fn test_returned_bad_call_is_counted_once() {
        let mut sim = Simulation::new();
        sim.spawn(TaskSpec::named("strict"), |ctx| async move {
            ctx.open_port(0)?;
            Ok(())
        })
        .unwrap();

        let report = run(&mut sim, 5.0);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].contains("bad call"));
        assert!(report.warnings[1].contains("terminated by fault"));
        let task = report.stats.entity("task", 1).unwrap();
        assert_eq!(task.counters.faults, 1);
    }

    #[test]
    fn test_ignored_numeric_fault_aborts_run() {
        let mut sim = Simulation::new();
        let finished = Rc::new(Cell::new(false));
        let finished_clone = finished.clone();
        sim.spawn(TaskSpec::new(), move |ctx| async move {
            let stat = ctx.open_stat("load", StatKind::Sample)?;
            let _ = ctx.record_stat(stat, f64::NAN);
            ctx.sleep(1.0).await?;
            finished_clone.set(true);
            Ok(())
        })
        .unwrap();

        let result = sim.run(5.0, 1, RunFlags::default());
        assert!(matches!(result, Err(SimError::NumericFault(_))));
        assert!(!finished.get());
    }

    #[test]
    fn test_reset_all_stats_restarts_observation() {
        let mut sim = Simulation::new();
        sim.spawn(TaskSpec::new(), |ctx| async move {
            let latency = ctx.open_stat("latency", StatKind::Sample)?;
            ctx.record_stat(latency, 100.0)?;
            ctx.record_stat(latency, 100.0)?;
            ctx.sleep(1.0).await?;
            ctx.reset_all_stats()?;
            ctx.record_stat(latency, 2.0)?;
            ctx.record_stat(latency, 4.0)
        })
        .unwrap();

        let report = run(&mut sim, 5.0);
        let latency = report.stats.user_stat("latency").unwrap();
        assert_eq!(latency.mean, 3.0);
        assert_eq!(latency.observations, 2.0);
    }

    #[test]
    fn test_user_event_without_handler_warns() {
        let mut sim = Simulation::new();
        sim.schedule_user_event(3.0, 9).unwrap();

        let report = run(&mut sim, 10.0);
        assert_eq!(report.end_time, 3.0);
        assert_eq!(report.warnings, vec!["3 ***> no handler for user event 9".to_string()]);
    }

    #[test]
    fn test_user_event_handler_can_spawn() {
        let mut sim = Simulation::new();
        let ran_at = Rc::new(Cell::new(-1.0));
        let ran_clone = ran_at.clone();
        sim.on_user_event(move |kernel, tag| {
            assert_eq!(tag, 4);
            let ran = ran_clone.clone();
            kernel.spawn(TaskSpec::named("late"), move |ctx| async move {
                ran.set(ctx.now());
                Ok(())
            })?;
            Ok(())
        });
        sim.schedule_user_event(2.0, 4).unwrap();

        run(&mut sim, 10.0);
        assert_eq!(ran_at.get(), 2.0);
    }

    #[test]
    fn test_from_model_builds_fabric() {
        let model = ModelDescription::from_json(
            r#"{"nodes": [{"name": "a", "cpus": 2}, {"name": "b"}],
                "buses": [{"name": "bus", "nodes": [0, 1], "rate": 100.0}],
                "semaphores": [{"initial": 3}]}"#,
        )
        .unwrap();
        let sim = Simulation::from_model(&model).unwrap();
        sim.with_kernel(|k| {
            assert_eq!(k.fabric().nodes.len(), 2);
            assert_eq!(k.fabric().nodes[0].cpus, 2);
            assert_eq!(k.fabric().buses.len(), 1);
            assert_eq!(k.semaphore_count(SemId(0)), Ok(3));
        });
    }
}
