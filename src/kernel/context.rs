//! Task-side API
//!
//! A task body receives a `TaskContext` and calls kernel operations through
//! it. Blocking operations are `async`: the kernel parks the task, the body
//! future returns `Pending`, and the scheduler polls it again once the
//! kernel has stored a wakeup for it.

use super::error::{SimError, SimResult};
use super::fabric::{Channel, NodeId};
use super::lock::{LockId, LockOrder, LockPolicy};
use super::port::{CastScope, Message, PortId, PortKind, ReceiveOrder};
use super::semaphore::SemId;
use super::stats::{StatId, StatKind};
use super::syscall::Kernel;
use super::task::{Priority, TaskId, TaskSpec, Wakeup};
use super::time::SimTime;
use pin_project_lite::pin_project;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

/// Future that completes once the kernel stores a wakeup for the task
struct Suspend {
    id: TaskId,
    kernel: Rc<RefCell<Kernel>>,
    parked: bool,
}

impl Future for Suspend {
    type Output = Wakeup;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Wakeup> {
        // First poll happens right after the kernel parked us
        if !self.parked {
            self.parked = true;
            return Poll::Pending;
        }
        let wakeup = self.kernel.borrow_mut().take_wakeup(self.id);
        match wakeup {
            Some(wakeup) => Poll::Ready(wakeup),
            None => Poll::Pending,
        }
    }
}

pin_project! {
    /// A task body. Converts the body's result into kernel bookkeeping.
    pub struct TaskBody<F> {
        #[pin]
        body: F,
        id: TaskId,
        kernel: Weak<RefCell<Kernel>>,
    }
}

impl<F> TaskBody<F> {
    pub(crate) fn new(id: TaskId, kernel: Weak<RefCell<Kernel>>, body: F) -> Self {
        Self { body, id, kernel }
    }
}

impl<F> Future for TaskBody<F>
where
    F: Future<Output = SimResult<()>>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match this.body.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => Poll::Ready(()),
            Poll::Ready(Err(err)) => {
                if let Some(kernel) = this.kernel.upgrade() {
                    kernel.borrow_mut().task_failed(*this.id, err);
                }
                Poll::Ready(())
            }
        }
    }
}

/// Handle through which a task body talks to the kernel
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    kernel: Rc<RefCell<Kernel>>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, kernel: Rc<RefCell<Kernel>>) -> Self {
        Self { id, kernel }
    }

    /// Run a kernel operation as the calling task. A failed operation is
    /// charged to the task and reported right away.
    fn call<T>(&self, op: impl FnOnce(&mut Kernel) -> SimResult<T>) -> SimResult<T> {
        let mut kernel = self.kernel.borrow_mut();
        kernel.check_caller(self.id)?;
        let result = op(&mut kernel);
        if let Err(err) = &result {
            kernel.bad_call(self.id, err);
        }
        result
    }

    /// Build a kernel fault and stop the run with it
    fn kernel_fault(&self, detail: String) -> SimError {
        let mut kernel = self.kernel.borrow_mut();
        let err = kernel.kernel_fault(detail);
        kernel.raise(&err);
        err
    }

    /// Wait for the outcome of an operation that may have parked us
    async fn outcome(&self, immediate: Option<Wakeup>) -> Wakeup {
        match immediate {
            Some(wakeup) => wakeup,
            None => {
                Suspend {
                    id: self.id,
                    kernel: self.kernel.clone(),
                    parked: false,
                }
                .await
            }
        }
    }

    fn expect_ready(&self, wakeup: Wakeup) -> SimResult<()> {
        match wakeup {
            Wakeup::Ready => Ok(()),
            Wakeup::Fault(err) => Err(err),
            other => Err(self.kernel_fault(format!("task {} woke with {other:?}", self.id))),
        }
    }

    async fn blocking(&self, op: impl FnOnce(&mut Kernel) -> SimResult<Option<Wakeup>>) -> SimResult<()> {
        let immediate = self.call(op)?;
        let wakeup = self.outcome(immediate).await;
        self.expect_ready(wakeup)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn now(&self) -> SimTime {
        self.kernel.borrow().now()
    }

    pub fn node(&self) -> SimResult<NodeId> {
        self.kernel.borrow().task_node(self.id)
    }

    pub fn priority(&self) -> SimResult<Priority> {
        self.kernel.borrow().task_priority(self.id)
    }

    /// Task that created the caller
    pub fn parent(&self) -> SimResult<Option<TaskId>> {
        self.kernel.borrow().task_parent(self.id)
    }

    /// Live tasks the caller created
    pub fn children(&self) -> SimResult<Vec<TaskId>> {
        self.kernel.borrow().children(self.id)
    }

    pub fn siblings(&self) -> SimResult<Vec<TaskId>> {
        self.kernel.borrow().siblings(self.id)
    }

    pub fn standard_port(&self, task: TaskId) -> SimResult<Option<PortId>> {
        self.kernel.borrow().standard_port(task)
    }

    // ========== TASK CONTROL ==========

    /// Create a child of the calling task
    pub fn spawn<F, Fut>(&self, spec: TaskSpec, body: F) -> SimResult<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        let spec = spec.child_of(self.id);
        self.call(|k| k.spawn(spec, body))
    }

    pub fn spawn_suspended<F, Fut>(&self, spec: TaskSpec, body: F) -> SimResult<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        let spec = spec.child_of(self.id);
        self.call(|k| k.spawn_suspended(spec, body))
    }

    pub fn resume(&self, task: TaskId) -> SimResult<()> {
        self.call(|k| k.resume(task))
    }

    /// Suspend the calling task until another task resumes it
    pub async fn suspend(&self) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.suspend_self(id)).await
    }

    pub fn suspend_task(&self, task: TaskId) -> SimResult<()> {
        self.call(|k| k.suspend_task(task))
    }

    /// Kill another task. Use `terminate` to end the caller.
    pub fn kill(&self, task: TaskId) -> SimResult<()> {
        self.call(|k| k.kill(task))
    }

    /// End the calling task. Never returns.
    pub async fn terminate(&self) -> SimResult<()> {
        let id = self.id;
        self.call(|k| k.kill(id))?;
        futures::future::pending().await
    }

    pub fn awaken(&self, task: TaskId) -> SimResult<()> {
        self.call(|k| k.awaken(task))
    }

    pub fn set_priority(&self, task: TaskId, priority: Priority) -> SimResult<()> {
        self.call(|k| k.set_priority(task, priority))
    }

    pub async fn yield_now(&self) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.yield_now(id)).await
    }

    pub async fn migrate(&self, node: NodeId) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.migrate(id, node)).await
    }

    pub async fn sleep(&self, duration: SimTime) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.sleep(id, duration)).await
    }

    /// Consume `demand` units of CPU on the current node
    pub async fn compute(&self, demand: f64) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.compute(id, demand)).await
    }

    // ========== PORTS ==========

    /// Open a private port owned by the caller
    pub fn open_port(&self, capacity: usize) -> SimResult<PortId> {
        let id = self.id;
        self.call(|k| k.open_port(id, PortKind::Private, capacity))
    }

    /// Open a port any task may receive from
    pub fn open_shared_port(&self, capacity: usize) -> SimResult<PortId> {
        let id = self.id;
        self.call(|k| k.open_port(id, PortKind::Shared, capacity))
    }

    /// Open a port set: the caller receives from it on behalf of the ports
    /// that join it
    pub fn open_port_set(&self, capacity: usize) -> SimResult<PortId> {
        let id = self.id;
        self.call(|k| k.open_port(id, PortKind::Set, capacity))
    }

    pub fn join_port_set(&self, set: PortId, member: PortId) -> SimResult<()> {
        let id = self.id;
        self.call(|k| k.join_port_set(id, set, member))
    }

    pub fn leave_port_set(&self, set: PortId, member: PortId) -> SimResult<()> {
        let id = self.id;
        self.call(|k| k.leave_port_set(id, set, member))
    }

    /// Choose the port casts to the caller arrive on
    pub fn set_standard_port(&self, port: PortId) -> SimResult<()> {
        let id = self.id;
        self.call(|k| k.set_standard_port(id, port))
    }

    pub async fn send(&self, port: PortId, msg: Message) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.send(id, port, msg)).await
    }

    /// Send a received message on, keeping its `sent_at`
    pub async fn resend(&self, port: PortId, msg: Message) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.resend(id, port, msg)).await
    }

    /// Send across a bus or link; returns once the message has been carried
    pub async fn send_via(&self, channel: Channel, port: PortId, msg: Message) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.send_via(id, port, msg, channel)).await
    }

    /// Copy `msg` to the standard port of every other live task. Returns
    /// the number of copies delivered.
    pub fn broadcast(&self, msg: Message) -> SimResult<usize> {
        self.cast(CastScope::All, msg)
    }

    /// Like `broadcast`, limited to tasks on the caller's node
    pub fn localcast(&self, msg: Message) -> SimResult<usize> {
        self.cast(CastScope::Node, msg)
    }

    /// Like `broadcast`, limited to the caller's descendants
    pub fn multicast(&self, msg: Message) -> SimResult<usize> {
        self.cast(CastScope::Descendants, msg)
    }

    fn cast(&self, scope: CastScope, msg: Message) -> SimResult<usize> {
        let id = self.id;
        self.call(|k| k.cast(id, scope, msg))
    }

    pub async fn receive(&self, port: PortId) -> SimResult<Message> {
        self.receive_by(port, ReceiveOrder::Fifo).await
    }

    /// Receive, giving up after `timeout`. Zero polls without blocking.
    pub async fn receive_timeout(&self, port: PortId, timeout: SimTime) -> SimResult<Option<Message>> {
        self.receive_by_timeout(port, ReceiveOrder::Fifo, timeout).await
    }

    /// Receive the queued message `order` picks
    pub async fn receive_by(&self, port: PortId, order: ReceiveOrder) -> SimResult<Message> {
        match self.receive_inner(port, order, None).await? {
            Some(msg) => Ok(msg),
            None => Err(self.kernel_fault(format!("task {} timed out without a timeout", self.id))),
        }
    }

    pub async fn receive_by_timeout(
        &self,
        port: PortId,
        order: ReceiveOrder,
        timeout: SimTime,
    ) -> SimResult<Option<Message>> {
        self.receive_inner(port, order, Some(timeout)).await
    }

    async fn receive_inner(
        &self,
        port: PortId,
        order: ReceiveOrder,
        timeout: Option<SimTime>,
    ) -> SimResult<Option<Message>> {
        let id = self.id;
        let immediate = self.call(|k| k.receive(id, port, order, timeout))?;
        match self.outcome(immediate).await {
            Wakeup::Message(msg) => Ok(Some(msg)),
            Wakeup::TimedOut => Ok(None),
            other => self.expect_ready(other).map(|()| None),
        }
    }

    pub fn pass_port(&self, port: PortId, to: TaskId) -> SimResult<()> {
        let id = self.id;
        self.call(|k| k.pass_port(id, port, to))
    }

    pub fn release_port(&self, port: PortId) -> SimResult<()> {
        let id = self.id;
        self.call(|k| k.release_port(id, port))
    }

    // ========== SEMAPHORES AND LOCKS ==========

    pub fn create_semaphore(&self, initial: u32) -> SimResult<SemId> {
        self.call(|k| Ok(k.create_semaphore(initial)))
    }

    pub async fn wait(&self, sem: SemId) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.wait(id, sem)).await
    }

    pub fn signal(&self, sem: SemId) -> SimResult<()> {
        let id = self.id;
        self.call(|k| k.signal(id, sem))
    }

    pub fn reset_semaphore(&self, sem: SemId, value: u32) -> SimResult<()> {
        let id = self.id;
        self.call(|k| k.reset_semaphore(id, sem, value))
    }

    pub fn create_lock(&self, policy: LockPolicy, order: LockOrder) -> SimResult<LockId> {
        self.call(|k| Ok(k.create_lock(policy, order)))
    }

    pub async fn lock(&self, lock: LockId) -> SimResult<()> {
        let id = self.id;
        self.blocking(|k| k.lock(id, lock)).await
    }

    pub fn unlock(&self, lock: LockId) -> SimResult<()> {
        let id = self.id;
        self.call(|k| k.unlock(id, lock))
    }

    // ========== EVENTS, STATISTICS, RANDOM NUMBERS ==========

    pub fn schedule_user_event(&self, at: SimTime, tag: u64) -> SimResult<()> {
        self.call(|k| k.schedule_user_event(at, tag)).map(|_| ())
    }

    pub fn open_stat(&self, name: &str, kind: StatKind) -> SimResult<StatId> {
        self.call(|k| Ok(k.open_stat(name, kind)))
    }

    pub fn record_stat(&self, stat: StatId, value: f64) -> SimResult<()> {
        self.call(|k| k.record_stat(stat, value))
    }

    pub fn reset_stat(&self, stat: StatId) -> SimResult<()> {
        self.call(|k| k.reset_stat(stat))
    }

    /// Restart every user statistic now, e.g. at the end of a warm-up
    pub fn reset_all_stats(&self) -> SimResult<()> {
        self.call(|k| {
            k.reset_all_stats();
            Ok(())
        })
    }

    pub fn random(&self) -> f64 {
        self.kernel.borrow_mut().random()
    }

    pub fn uniform(&self, low: f64, high: f64) -> SimResult<f64> {
        self.call(|k| k.uniform(low, high))
    }

    pub fn exponential(&self, mean: f64) -> SimResult<f64> {
        self.call(|k| k.exponential(mean))
    }

    pub fn choice(&self, n: usize) -> SimResult<usize> {
        self.call(|k| k.choice(n))
    }

    /// Record a warning in the run report
    pub fn warn(&self, msg: impl Into<String>) {
        self.kernel.borrow_mut().warn(msg);
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::task::TaskState;
    use futures::FutureExt;
    use futures::task::noop_waker_ref;

    #[test]
    fn test_suspend_pends_until_wakeup() {
        let kernel = Kernel::new_shared();
        kernel.borrow_mut().fabric_mut().add_node("n", 1, 1.0).unwrap();
        let id = kernel
            .borrow_mut()
            .spawn(TaskSpec::new(), |_ctx| async { Ok(()) })
            .unwrap();

        let mut suspend = Suspend {
            id,
            kernel: kernel.clone(),
            parked: false,
        };
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(suspend.poll_unpin(&mut cx).is_pending());
        assert!(suspend.poll_unpin(&mut cx).is_pending());

        kernel.borrow_mut().set_wakeup(id, Wakeup::TimedOut);
        assert_eq!(suspend.poll_unpin(&mut cx), Poll::Ready(Wakeup::TimedOut));
    }

    #[test]
    fn test_task_body_reports_failure() {
        let kernel = Kernel::new_shared();
        kernel.borrow_mut().fabric_mut().add_node("n", 1, 1.0).unwrap();
        let id = kernel
            .borrow_mut()
            .spawn(TaskSpec::named("w"), |_ctx| async { Ok(()) })
            .unwrap();

        let mut body = TaskBody::new(id, Rc::downgrade(&kernel), async {
            Err(SimError::InvalidArgument("bad".into()))
        })
        .boxed_local();
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(body.poll_unpin(&mut cx).is_ready());

        let k = kernel.borrow();
        assert_eq!(k.warnings().len(), 1);
        assert!(k.warnings()[0].contains("task 1 (w) terminated by fault"));
        assert_eq!(k.task_state(id), Ok(TaskState::Ready));
    }

    #[test]
    fn test_call_rejects_task_that_is_not_running() {
        let kernel = Kernel::new_shared();
        kernel.borrow_mut().fabric_mut().add_node("n", 1, 1.0).unwrap();
        let id = kernel
            .borrow_mut()
            .spawn(TaskSpec::new(), |_ctx| async { Ok(()) })
            .unwrap();
        let ctx = TaskContext::new(id, kernel.clone());
        assert!(matches!(ctx.open_port(1), Err(SimError::InvalidState(_))));
        assert_eq!(ctx.id(), id);
        assert_eq!(ctx.node(), Ok(NodeId(0)));
    }
}
