//! Invariant Tests
//!
//! One test per kernel invariant. Each drives the public kernel surface and
//! checks the invariant holds across the transitions it guards.

mod scheduling {
    use crate::kernel::event::{EventKind, EventQueue};
    use crate::kernel::task::{TaskId, TaskSpec, TaskState};
    use crate::kernel::time::VirtualClock;
    use crate::kernel::{RunFlags, SimError, Simulation};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Events leave the queue by time, then by insertion order
    #[test]
    fn event_order_is_time_then_insertion() {
        let mut queue = EventQueue::new();
        for (i, time) in [3.0, 1.0, 3.0, 2.0, 1.0].into_iter().enumerate() {
            queue
                .schedule(0.0, time, EventKind::User { tag: i as u64 })
                .unwrap();
        }
        let mut fired = Vec::new();
        while let Some(event) = queue.pop_next() {
            if let EventKind::User { tag } = event.kind {
                fired.push((event.time, tag));
            }
        }
        assert_eq!(
            fired,
            vec![(1.0, 1), (1.0, 4), (2.0, 3), (3.0, 0), (3.0, 2)]
        );
    }

    /// Virtual time never decreases
    #[test]
    fn clock_is_monotonic() {
        let mut clock = VirtualClock::new();
        clock.advance_to(4.0).unwrap();
        clock.advance_to(4.0).unwrap();
        assert!(matches!(
            clock.advance_to(3.0),
            Err(SimError::KernelFault { .. })
        ));
        assert_eq!(clock.now(), 4.0);
    }

    /// Dead is absorbing
    #[test]
    fn dead_task_never_leaves_dead() {
        use TaskState::*;
        for to in [Ready, Running, Blocked, Suspended, Dead] {
            assert!(!Dead.can_transition(to));
        }
    }

    /// Exactly one task runs while a body executes
    #[test]
    fn single_running_task() {
        let mut sim = Simulation::new();
        let kernel = sim.kernel_handle();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..4 {
            let kernel = kernel.clone();
            let seen = seen.clone();
            sim.spawn(TaskSpec::new(), move |ctx| async move {
                for _ in 0..3 {
                    seen.borrow_mut()
                        .push(kernel.borrow().count_in_state(TaskState::Running));
                    ctx.sleep(1.0).await?;
                }
                Ok(())
            })
            .unwrap();
        }

        sim.run(10.0, 1, RunFlags::default()).unwrap();
        assert_eq!(seen.borrow().len(), 12);
        assert!(seen.borrow().iter().all(|&n| n == 1));
        assert_eq!(sim.with_kernel(|k| k.count_in_state(TaskState::Running)), 0);
    }

    /// A woken task resumes at the same virtual time, never earlier
    #[test]
    fn immediate_wake_keeps_time() {
        let mut sim = Simulation::new();
        let sem = sim.create_semaphore(0);
        let woke = Rc::new(RefCell::new(None));
        let woke_clone = woke.clone();
        sim.spawn(TaskSpec::named("waiter"), move |ctx| async move {
            ctx.wait(sem).await?;
            *woke_clone.borrow_mut() = Some(ctx.now());
            Ok(())
        })
        .unwrap();
        sim.spawn(TaskSpec::named("signaller"), move |ctx| async move {
            ctx.sleep(3.0).await?;
            ctx.signal(sem)
        })
        .unwrap();

        sim.run(10.0, 1, RunFlags::default()).unwrap();
        assert_eq!(*woke.borrow(), Some(3.0));
    }

    /// A killed task leaves no trace in any wait structure
    #[test]
    fn killed_task_leaves_no_dangling_waits() {
        let mut sim = Simulation::new();
        let sem = sim.create_semaphore(0);
        let victim = sim
            .spawn(TaskSpec::named("victim"), move |ctx| async move {
                ctx.wait(sem).await
            })
            .unwrap();
        let woke = Rc::new(RefCell::new(None));
        let woke_clone = woke.clone();
        sim.spawn(TaskSpec::named("survivor"), move |ctx| async move {
            ctx.wait(sem).await?;
            *woke_clone.borrow_mut() = Some(ctx.id());
            Ok(())
        })
        .unwrap();
        sim.spawn(TaskSpec::named("killer"), move |ctx| async move {
            ctx.sleep(1.0).await?;
            ctx.kill(victim)?;
            ctx.signal(sem)
        })
        .unwrap();

        sim.run(10.0, 1, RunFlags::default()).unwrap();
        assert_eq!(*woke.borrow(), Some(TaskId(2)));
        assert_eq!(sim.with_kernel(|k| k.task_state(victim)), Ok(TaskState::Dead));
        assert_eq!(sim.with_kernel(|k| k.semaphore_count(sem)), Ok(0));
    }
}

mod synchronization {
    use crate::kernel::lock::{LockOrder, LockPolicy};
    use crate::kernel::port::Message;
    use crate::kernel::task::{TaskId, TaskSpec, TaskState};
    use crate::kernel::{PortId, RunFlags, SimError, Simulation};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// At most one holder; recursive acquire is refused
    #[test]
    fn lock_has_single_holder() {
        let mut sim = Simulation::new();
        let lock = sim.create_lock(LockPolicy::Blocking, LockOrder::Fifo);
        let result = Rc::new(RefCell::new(None));
        let result_clone = result.clone();
        sim.spawn(TaskSpec::new(), move |ctx| async move {
            ctx.lock(lock).await?;
            let again = ctx.lock(lock).await;
            *result_clone.borrow_mut() = Some(again);
            ctx.unlock(lock)
        })
        .unwrap();

        sim.run(1.0, 1, RunFlags::default()).unwrap();
        assert_eq!(*result.borrow(), Some(Err(SimError::RecursiveLock(lock))));
        assert_eq!(sim.with_kernel(|k| k.lock_holder(lock)), Ok(None));
    }

    /// Unlock by a non-holder ends that task only, and says so even if
    /// the task ignores the error
    #[test]
    fn unlock_by_non_holder_is_task_local() {
        let mut sim = Simulation::new();
        let lock = sim.create_lock(LockPolicy::Blocking, LockOrder::Fifo);
        let result = Rc::new(RefCell::new(None));
        let result_clone = result.clone();
        let culprit = sim
            .spawn(TaskSpec::named("culprit"), move |ctx| async move {
                *result_clone.borrow_mut() = Some(ctx.unlock(lock));
                ctx.sleep(1.0).await
            })
            .unwrap();
        sim.spawn(TaskSpec::named("bystander"), |ctx| async move { ctx.sleep(2.0).await })
            .unwrap();

        let report = sim.run(10.0, 1, RunFlags::default()).unwrap();
        assert_eq!(*result.borrow(), Some(Err(SimError::NotOwner)));
        assert_eq!(sim.with_kernel(|k| k.task_state(culprit)), Ok(TaskState::Dead));
        assert_eq!(report.end_time, 2.0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("task 1 (culprit) bad call: caller is not the owner"));
        let task = report.stats.entity("task", 1).unwrap();
        assert_eq!(task.counters.faults, 1);
    }

    /// A holder's ancestor may release the lock on its behalf
    #[test]
    fn ancestor_may_unlock() {
        let mut sim = Simulation::new();
        let lock = sim.create_lock(LockPolicy::Blocking, LockOrder::Fifo);
        let result = Rc::new(RefCell::new(None));
        let result_clone = result.clone();
        sim.spawn(TaskSpec::named("parent"), move |ctx| async move {
            let child = ctx.spawn(TaskSpec::named("child"), move |child| async move {
                child.lock(lock).await?;
                child.sleep(5.0).await
            })?;
            ctx.sleep(1.0).await?;
            *result_clone.borrow_mut() = Some((ctx.unlock(lock), child));
            Ok(())
        })
        .unwrap();

        let report = sim.run(10.0, 1, RunFlags::default()).unwrap();
        assert_eq!(*result.borrow(), Some((Ok(()), TaskId(2))));
        assert_eq!(sim.with_kernel(|k| k.lock_holder(lock)), Ok(None));
        assert!(report.warnings.is_empty());
    }

    /// A port whose owner died refuses sends instead of blocking
    #[test]
    fn dead_owner_closes_port() {
        let mut sim = Simulation::new();
        let port = Rc::new(RefCell::new(None));
        let port_clone = port.clone();
        sim.spawn(TaskSpec::named("owner"), move |ctx| async move {
            *port_clone.borrow_mut() = Some(ctx.open_port(1)?);
            Ok(())
        })
        .unwrap();
        let result = Rc::new(RefCell::new(None));
        let result_clone = result.clone();
        sim.spawn(TaskSpec::named("sender"), move |ctx| async move {
            ctx.sleep(1.0).await?;
            let Some(p) = *port.borrow() else {
                return Ok(());
            };
            let sent = ctx.send(p, Message::new(1, b"x".to_vec())).await;
            *result_clone.borrow_mut() = Some(sent);
            Ok(())
        })
        .unwrap();

        sim.run(5.0, 1, RunFlags::default()).unwrap();
        let result = result.borrow();
        assert!(matches!(*result, Some(Err(SimError::PortClosed(_)))));
    }

    /// A port moves only while nobody is blocked on it
    #[test]
    fn pass_port_refused_with_waiters() {
        let mut sim = Simulation::new();
        let outcome = Rc::new(RefCell::new(Vec::new()));
        let outcome_clone = outcome.clone();
        let sink = sim
            .spawn(TaskSpec::named("sink"), |ctx| async move { ctx.sleep(100.0).await })
            .unwrap();
        sim.spawn(TaskSpec::named("owner"), move |ctx| async move {
            let port = ctx.open_shared_port(1)?;
            ctx.spawn(TaskSpec::named("reader"), move |reader| async move {
                reader.receive(port).await.map(|_| ())
            })?;
            ctx.yield_now().await?;
            outcome_clone.borrow_mut().push(ctx.pass_port(port, sink));
            ctx.send(port, Message::new(0, Vec::new())).await?;
            outcome_clone.borrow_mut().push(ctx.pass_port(port, sink));
            Ok(())
        })
        .unwrap();

        sim.run(1.0, 1, RunFlags::default()).unwrap();
        let outcome = outcome.borrow();
        assert!(matches!(outcome[0], Err(SimError::InvalidState(_))));
        assert_eq!(outcome[1], Ok(()));
        assert_eq!(sim.with_kernel(|k| k.port_owner(PortId(1))), Ok(TaskId(1)));
    }
}
