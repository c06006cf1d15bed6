//! Simulation trace
//!
//! One line per significant transition, in a fixed textual form that
//! external trace filters match phrase by phrase:
//!
//! ```text
//! Time: 12.5; Node: 0; Task 3 (producer) sending message 7 to task 4 via port 2.
//! ```
//!
//! Design:
//! - `TraceEvent` is the closed vocabulary; its `Display` is the phrase
//! - Records go to a pluggable `TraceSink`
//! - A ring buffer keeps the most recent lines for kernel-fault dumps
//!   (bounded memory)

use super::fabric::{Channel, NodeId, ResourceId};
use super::lock::LockId;
use super::port::PortId;
use super::semaphore::SemId;
use super::task::{Priority, TaskId};
use super::time::SimTime;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

/// Maximum number of lines kept for fault dumps
const TRACE_BUFFER_SIZE: usize = 1000;

/// Format like C's `%.<precision>G`
pub fn fmt_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "NAN".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INF".into() } else { "-INF".into() };
    }
    if value == 0.0 {
        return "0".into();
    }

    let p = precision.max(1);
    let sci = format!("{:.*e}", p - 1, value);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exp >= -4 && exp < p as i32 {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        strip_zeros(&format!("{:.*}", decimals, value))
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}E{}{:02}", strip_zeros(mantissa), sign, exp.abs())
    }
}

fn strip_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

/// The trace vocabulary
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Created,
    Dead,
    Sleeping,
    Suspended,
    Executing,
    Ready,
    Migrating { node: NodeId },
    PriorityAdjusted { priority: Priority },
    PassesPort { port: PortId, to: TaskId },
    /// `to` is None for shared ports
    Sending {
        message: u64,
        to: Option<TaskId>,
        port: PortId,
        via: Option<Channel>,
    },
    Receives { message: u64, port: PortId, shared: bool },
    ReceivingBlocked { port: PortId },
    TimesOut { port: PortId },
    WaitingOnSemaphore { sem: SemId },
    BlockedOnSemaphore { sem: SemId },
    SignallingSemaphore { sem: SemId },
    ResettingSemaphore { sem: SemId, value: u32 },
    SpinningOnLock { lock: LockId },
    LockingLock { lock: LockId },
    UnlockingLock { lock: LockId },
    Failed(ResourceId),
    Repaired(ResourceId),
    User { tag: u64 },
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Created => write!(f, "created (suspended)"),
            TraceEvent::Dead => write!(f, "dead"),
            TraceEvent::Sleeping => write!(f, "sleeping"),
            TraceEvent::Suspended => write!(f, "suspended"),
            TraceEvent::Executing => write!(f, "executing"),
            TraceEvent::Ready => write!(f, "ready"),
            TraceEvent::Migrating { node } => write!(f, "migrating to node {node}"),
            TraceEvent::PriorityAdjusted { priority } => write!(f, "priority adjusted to {priority}"),
            TraceEvent::PassesPort { port, to } => write!(f, "passes port {port} to task {to}"),
            TraceEvent::Sending { message, to, port, via } => match (to, via) {
                (Some(task), None) => {
                    write!(f, "sending message {message} to task {task} via port {port}")
                }
                (Some(task), Some(Channel::Bus(b))) => write!(
                    f,
                    "sending message {message} to task {task} via port {port} and bus {b}"
                ),
                (Some(task), Some(Channel::Link(l))) => write!(
                    f,
                    "sending message {message} to task {task} via port {port} and link {l}"
                ),
                (None, None) => write!(f, "sending message {message} to shared port {port}"),
                (None, Some(Channel::Bus(b))) => {
                    write!(f, "sending message {message} to shared port {port} via bus {b}")
                }
                (None, Some(Channel::Link(l))) => {
                    write!(f, "sending message {message} to shared port {port} via link {l}")
                }
            },
            TraceEvent::Receives { message, port, shared } => {
                if *shared {
                    write!(f, "receives message {message} on shared port {port}")
                } else {
                    write!(f, "receives message {message} on port {port}")
                }
            }
            TraceEvent::ReceivingBlocked { port } => write!(f, "receiving (blocked) on port {port}"),
            TraceEvent::TimesOut { port } => write!(f, "times out on port {port}"),
            TraceEvent::WaitingOnSemaphore { sem } => write!(f, "waiting on semaphore {sem}"),
            TraceEvent::BlockedOnSemaphore { sem } => write!(f, "blocked on semaphore {sem}"),
            TraceEvent::SignallingSemaphore { sem } => write!(f, "signalling semaphore {sem}"),
            TraceEvent::ResettingSemaphore { sem, value } => {
                write!(f, "resetting semaphore {sem} to value {value}")
            }
            TraceEvent::SpinningOnLock { lock } => write!(f, "spinning on lock {lock}"),
            TraceEvent::LockingLock { lock } => write!(f, "locking lock {lock}"),
            TraceEvent::UnlockingLock { lock } => write!(f, "unlocking lock {lock}"),
            TraceEvent::Failed(res) => write!(f, "{res} failed"),
            TraceEvent::Repaired(res) => write!(f, "{res} repaired"),
            TraceEvent::User { tag } => write!(f, "user event {tag}"),
        }
    }
}

/// One trace line
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub time: SimTime,
    /// -1 when the subject is not on a node (buses, links)
    pub node: i64,
    pub task: TaskId,
    pub name: Option<String>,
    pub event: TraceEvent,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time: {}; Node: {}; Task {}", fmt_g(self.time, 8), self.node, self.task)?;
        if let Some(name) = &self.name {
            write!(f, " ({name})")?;
        }
        write!(f, " {}.", self.event)
    }
}

/// Destination for trace lines
pub trait TraceSink {
    fn emit(&mut self, line: &str);
}

/// Writes lines to any `io::Write` (stderr by default)
pub struct WriterSink<W: Write> {
    writer: W,
    failed: bool,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
        }
    }
}

impl WriterSink<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write> TraceSink for WriterSink<W> {
    fn emit(&mut self, line: &str) {
        if self.failed {
            return;
        }
        if let Err(e) = writeln!(self.writer, "{line}") {
            log::warn!("trace output disabled: {e}");
            self.failed = true;
        }
    }
}

/// Collects lines in a shared buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Rc<RefCell<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the collected lines
    pub fn lines(&self) -> Rc<RefCell<Vec<String>>> {
        self.lines.clone()
    }

    /// Copy of the collected lines
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl TraceSink for MemorySink {
    fn emit(&mut self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}

/// The kernel's tracer
pub struct Tracer {
    enabled: bool,
    sink: Box<dyn TraceSink>,
    recent: VecDeque<String>,
    emitted: u64,
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            enabled: false,
            sink: Box::new(WriterSink::stderr()),
            recent: VecDeque::with_capacity(64),
            emitted: 0,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.sink = sink;
    }

    /// Emit a record if tracing is on
    pub fn record(&mut self, record: TraceRecord) {
        if !self.enabled {
            return;
        }
        let line = record.to_string();
        self.sink.emit(&line);
        if self.recent.len() >= TRACE_BUFFER_SIZE {
            self.recent.pop_front();
        }
        self.recent.push_back(line);
        self.emitted += 1;
    }

    /// Lines emitted since the tracer was created
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// The last `n` lines, oldest first
    pub fn recent(&self, n: usize) -> Vec<&str> {
        let skip = self.recent.len().saturating_sub(n);
        self.recent.iter().skip(skip).map(String::as_str).collect()
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}
