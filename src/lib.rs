//! simkernel - a process-oriented discrete-event simulation kernel
//!
//! Models distributed systems as cooperating tasks running on nodes joined
//! by buses and links, against a virtual clock.
//!
//! Design principles:
//! - Deterministic: same model, same seed, same trace
//! - Single-threaded: one task body runs at a time, switching only at
//!   blocking calls
//! - Explicit state: the whole simulation is a value, so several can run in
//!   one process
//!
//! ```no_run
//! use simkernel::{Message, RunFlags, Simulation, TaskSpec};
//!
//! let mut sim = Simulation::new();
//! sim.spawn(TaskSpec::named("server"), |ctx| async move {
//!     let port = ctx.open_port(4)?;
//!     ctx.send(port, Message::new(1, b"ping".to_vec())).await?;
//!     let msg = ctx.receive(port).await?;
//!     assert_eq!(msg.data, b"ping");
//!     ctx.sleep(1.5).await
//! })?;
//! let report = sim.run(100.0, 42, RunFlags::default())?;
//! println!("{}", report.stats);
//! # Ok::<(), simkernel::SimError>(())
//! ```

pub mod kernel;

pub use kernel::{
    Availability, Channel, EndReason, Kernel, LockOrder, LockPolicy, Message, ModelDescription,
    NodeId, PortId, ResourceId, RunFlags, RunReport, SimError, SimResult, SimTime, Simulation,
    StatKind, TaskContext, TaskId, TaskSpec, TaskState,
};
