//! Resource fabric: nodes, buses and links
//!
//! Every resource is UP or DOWN. State only changes through failure and
//! repair events handled by the scheduler; nothing here schedules events.
//!
//! Nodes own CPUs that tasks contend for in `compute`. Buses and links are
//! FIFO carriers: a transmission starts when the carrier frees up and takes
//! `bytes / rate` time units.

use super::error::{SimError, SimResult};
use super::stats::EntityStats;
use super::task::{Priority, ReadyKey, TaskId};
use super::time::SimTime;
use rand::Rng;
use rand_distr::{Distribution as _, Exp, Gamma, Uniform};
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;

/// Node identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Bus identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(pub u64);

/// Link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Any resource that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Node(NodeId),
    Bus(BusId),
    Link(LinkId),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Node(n) => write!(f, "node {n}"),
            ResourceId::Bus(b) => write!(f, "bus {b}"),
            ResourceId::Link(l) => write!(f, "link {l}"),
        }
    }
}

/// Carrier used by `send_via`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Bus(BusId),
    Link(LinkId),
}

impl From<Channel> for ResourceId {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Bus(b) => ResourceId::Bus(b),
            Channel::Link(l) => ResourceId::Link(l),
        }
    }
}

/// Availability state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Up,
    Down,
}

/// Time-to-failure / time-to-repair distribution
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Distribution {
    Constant { value: f64 },
    Exponential { mean: f64 },
    Uniform { low: f64, high: f64 },
    /// Sum of `shape` exponentials with overall mean `mean`
    Erlang { mean: f64, shape: u32 },
}

impl Distribution {
    /// Reject parameters that cannot produce a positive finite delay
    pub fn validate(&self) -> SimResult<()> {
        let ok = match *self {
            Distribution::Constant { value } => value.is_finite() && value >= 0.0,
            Distribution::Exponential { mean } => mean.is_finite() && mean > 0.0,
            Distribution::Uniform { low, high } => {
                low.is_finite() && high.is_finite() && low >= 0.0 && low < high
            }
            Distribution::Erlang { mean, shape } => mean.is_finite() && mean > 0.0 && shape > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(SimError::Config(format!("bad distribution {self:?}")))
        }
    }

    /// Draw one delay
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SimResult<f64> {
        self.validate()?;
        let bad = |e: String| SimError::Config(format!("bad distribution {self:?}: {e}"));
        let value = match *self {
            Distribution::Constant { value } => value,
            Distribution::Exponential { mean } => {
                Exp::new(1.0 / mean).map_err(|e| bad(e.to_string()))?.sample(rng)
            }
            Distribution::Uniform { low, high } => Uniform::new(low, high).sample(rng),
            Distribution::Erlang { mean, shape } => {
                let k = f64::from(shape);
                Gamma::new(k, mean / k)
                    .map_err(|e| bad(e.to_string()))?
                    .sample(rng)
            }
        };
        super::error::finite(value, "distribution sample")
    }
}

/// Stochastic failure behaviour of a resource
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FailureModel {
    pub time_to_failure: Distribution,
    pub time_to_repair: Distribution,
}

impl FailureModel {
    pub fn validate(&self) -> SimResult<()> {
        self.time_to_failure.validate()?;
        self.time_to_repair.validate()
    }
}

/// Up/down bookkeeping shared by all resource kinds
#[derive(Debug, Clone)]
pub struct Health {
    pub state: Availability,
    down_since: SimTime,
    pub failure: Option<FailureModel>,
}

impl Health {
    fn new(failure: Option<FailureModel>) -> Self {
        Self {
            state: Availability::Up,
            down_since: 0.0,
            failure,
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == Availability::Up
    }

    /// Apply a transition; returns false if already in `to`
    fn set(&mut self, to: Availability, now: SimTime, stats: &mut EntityStats) -> bool {
        if self.state == to {
            return false;
        }
        match to {
            Availability::Down => {
                self.down_since = now;
                stats.faults += 1;
            }
            Availability::Up => stats.down_time += now - self.down_since,
        }
        self.state = to;
        true
    }

    /// Down time of an interval still open at `now`
    pub fn open_down_time(&self, now: SimTime) -> f64 {
        match self.state {
            Availability::Down => now - self.down_since,
            Availability::Up => 0.0,
        }
    }
}

/// A processing element with one or more CPUs
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub cpus: usize,
    pub speed: f64,
    pub health: Health,
    running: Vec<TaskId>,
    queue: BTreeMap<ReadyKey, TaskId>,
    pub stats: EntityStats,
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>, cpus: usize, speed: f64) -> Self {
        Self {
            id,
            name: name.into(),
            cpus,
            speed,
            health: Health::new(None),
            running: Vec::new(),
            queue: BTreeMap::new(),
            stats: EntityStats::default(),
        }
    }

    /// CPUs currently held
    pub fn busy_cpus(&self) -> usize {
        self.running.len()
    }

    /// Ask for a CPU. True if granted now, else the task is queued.
    pub fn request_cpu(&mut self, task: TaskId, priority: Priority, seq: u64) -> bool {
        self.stats.arrivals += 1;
        if self.running.len() < self.cpus {
            self.running.push(task);
            true
        } else {
            self.queue.insert((Reverse(priority), seq), task);
            false
        }
    }

    /// Give back a CPU after `busy` time units; returns the queued task
    /// that gets it.
    pub fn release_cpu(&mut self, task: TaskId, busy: f64) -> Option<TaskId> {
        self.running.retain(|&t| t != task);
        self.stats.completions += 1;
        self.stats.busy_time += busy;
        let (_, next) = self.queue.pop_first()?;
        self.running.push(next);
        Some(next)
    }

    /// Drop a task from the CPU queue or the running set. Returns the
    /// queued task promoted into a freed CPU, if any.
    pub fn remove_task(&mut self, task: TaskId) -> Option<TaskId> {
        self.queue.retain(|_, t| *t != task);
        let before = self.running.len();
        self.running.retain(|&t| t != task);
        if before != self.running.len() {
            let (_, next) = self.queue.pop_first()?;
            self.running.push(next);
            return Some(next);
        }
        None
    }

    /// Re-key a queued task after a priority change
    pub fn reprioritize(&mut self, task: TaskId, priority: Priority) {
        let key = self.queue.iter().find(|(_, t)| **t == task).map(|(k, _)| *k);
        if let Some(key) = key {
            self.queue.remove(&key);
            self.queue.insert((Reverse(priority), key.1), task);
        }
    }

    /// Everything running or queued, emptying both (node failure)
    pub fn drain(&mut self) -> Vec<TaskId> {
        let mut out = std::mem::take(&mut self.running);
        out.extend(std::mem::take(&mut self.queue).into_values());
        out
    }
}

/// FIFO transmission server shared by buses and links
#[derive(Debug)]
pub struct Carrier {
    pub rate: f64,
    /// Transmissions not yet finished, in carrier order
    reservations: Vec<Reservation>,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    task: TaskId,
    arrival: SimTime,
    start: SimTime,
    done: SimTime,
}

impl Carrier {
    fn new(rate: f64) -> Self {
        Self {
            rate,
            reservations: Vec::new(),
        }
    }

    fn free_at(&self) -> SimTime {
        self.reservations.last().map_or(0.0, |r| r.done)
    }

    /// Reserve the carrier for `bytes`. Returns the completion time.
    pub fn reserve(&mut self, task: TaskId, bytes: usize, now: SimTime, stats: &mut EntityStats) -> SimTime {
        let start = self.free_at().max(now);
        let duration = bytes as f64 / self.rate;
        let done = start + duration;
        self.reservations.push(Reservation {
            task,
            arrival: now,
            start,
            done,
        });
        stats.arrivals += 1;
        stats.wait_time += start - now;
        stats.busy_time += duration;
        done
    }

    /// A transmission finished
    pub fn finish(&mut self, task: TaskId, stats: &mut EntityStats) {
        self.reservations.retain(|r| r.task != task);
        stats.completions += 1;
    }

    /// Cancel the transmission of `task` at `now`.
    ///
    /// Transmissions queued behind it move up. Returns each moved task
    /// with its new completion time.
    pub fn remove(&mut self, task: TaskId, now: SimTime, stats: &mut EntityStats) -> Vec<(TaskId, SimTime)> {
        let Some(pos) = self.reservations.iter().position(|r| r.task == task) else {
            return Vec::new();
        };
        let gone = self.reservations.remove(pos);
        give_back(&gone, now, stats);

        let mut free = match pos {
            0 => now,
            _ => self.reservations[pos - 1].done,
        };
        let mut moved = Vec::new();
        for r in &mut self.reservations[pos..] {
            let start = free.max(r.arrival);
            if start < r.start {
                stats.wait_time -= r.start - start;
                r.done = start + (r.done - r.start);
                r.start = start;
                moved.push((r.task, r.done));
            }
            free = r.done;
        }
        moved
    }

    /// Abort every transmission (carrier failure)
    pub fn drain(&mut self, now: SimTime, stats: &mut EntityStats) -> Vec<TaskId> {
        self.reservations
            .drain(..)
            .map(|r| {
                give_back(&r, now, stats);
                r.task
            })
            .collect()
    }
}

/// Take back the carrier time a cancelled reservation will not use
fn give_back(r: &Reservation, now: SimTime, stats: &mut EntityStats) {
    stats.busy_time -= r.done - r.start.max(now);
    if r.start > now {
        stats.wait_time -= r.start - now;
    }
}

/// A multi-drop bus
#[derive(Debug)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    pub nodes: Vec<NodeId>,
    pub carrier: Carrier,
    pub health: Health,
    pub stats: EntityStats,
}

/// A one-way point-to-point link
#[derive(Debug)]
pub struct Link {
    pub id: LinkId,
    pub name: String,
    pub source: NodeId,
    pub destination: NodeId,
    pub carrier: Carrier,
    pub health: Health,
    pub stats: EntityStats,
}

/// All resources of a model
#[derive(Debug, Default)]
pub struct ResourceFabric {
    pub nodes: Vec<Node>,
    pub buses: Vec<Bus>,
    pub links: Vec<Link>,
}

impl ResourceFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node
    pub fn add_node(&mut self, name: impl Into<String>, cpus: usize, speed: f64) -> SimResult<NodeId> {
        if cpus == 0 {
            return Err(SimError::InvalidArgument("node needs at least one cpu".into()));
        }
        if !(speed.is_finite() && speed > 0.0) {
            return Err(SimError::InvalidArgument(format!("node speed {speed}")));
        }
        let id = NodeId(self.nodes.len() as u64);
        self.nodes.push(Node::new(id, name, cpus, speed));
        Ok(id)
    }

    /// Add a bus connecting two or more nodes
    pub fn add_bus(&mut self, name: impl Into<String>, nodes: &[NodeId], rate: f64) -> SimResult<BusId> {
        if nodes.len() < 2 {
            return Err(SimError::InvalidArgument("bus needs at least two nodes".into()));
        }
        for &n in nodes {
            self.node(n)?;
        }
        check_rate(rate)?;
        let id = BusId(self.buses.len() as u64);
        self.buses.push(Bus {
            id,
            name: name.into(),
            nodes: nodes.to_vec(),
            carrier: Carrier::new(rate),
            health: Health::new(None),
            stats: EntityStats::default(),
        });
        Ok(id)
    }

    /// Add a one-way link
    pub fn add_link(&mut self, name: impl Into<String>, source: NodeId, destination: NodeId, rate: f64) -> SimResult<LinkId> {
        self.node(source)?;
        self.node(destination)?;
        check_rate(rate)?;
        let id = LinkId(self.links.len() as u64);
        self.links.push(Link {
            id,
            name: name.into(),
            source,
            destination,
            carrier: Carrier::new(rate),
            health: Health::new(None),
            stats: EntityStats::default(),
        });
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> SimResult<&Node> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(SimError::UnknownResource(ResourceId::Node(id)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> SimResult<&mut Node> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or(SimError::UnknownResource(ResourceId::Node(id)))
    }

    pub fn bus(&self, id: BusId) -> SimResult<&Bus> {
        self.buses
            .get(id.0 as usize)
            .ok_or(SimError::UnknownResource(ResourceId::Bus(id)))
    }

    pub fn link(&self, id: LinkId) -> SimResult<&Link> {
        self.links
            .get(id.0 as usize)
            .ok_or(SimError::UnknownResource(ResourceId::Link(id)))
    }

    fn health_mut(&mut self, res: ResourceId) -> SimResult<(&mut Health, &mut EntityStats)> {
        let unknown = SimError::UnknownResource(res);
        match res {
            ResourceId::Node(n) => self
                .nodes
                .get_mut(n.0 as usize)
                .map(|r| (&mut r.health, &mut r.stats))
                .ok_or(unknown),
            ResourceId::Bus(b) => self
                .buses
                .get_mut(b.0 as usize)
                .map(|r| (&mut r.health, &mut r.stats))
                .ok_or(unknown),
            ResourceId::Link(l) => self
                .links
                .get_mut(l.0 as usize)
                .map(|r| (&mut r.health, &mut r.stats))
                .ok_or(unknown),
        }
    }

    /// Health record of any resource
    pub fn health(&self, res: ResourceId) -> SimResult<&Health> {
        match res {
            ResourceId::Node(n) => self.node(n).map(|r| &r.health),
            ResourceId::Bus(b) => self.bus(b).map(|r| &r.health),
            ResourceId::Link(l) => self.link(l).map(|r| &r.health),
        }
    }

    pub fn is_up(&self, res: ResourceId) -> SimResult<bool> {
        Ok(self.health(res)?.is_up())
    }

    /// Fail `ResourceDown` unless `res` is up
    pub fn require_up(&self, res: ResourceId) -> SimResult<()> {
        if self.is_up(res)? {
            Ok(())
        } else {
            Err(SimError::ResourceDown(res))
        }
    }

    /// Attach a stochastic failure model
    pub fn set_failure_model(&mut self, res: ResourceId, model: FailureModel) -> SimResult<()> {
        model.validate()?;
        self.health_mut(res)?.0.failure = Some(model);
        Ok(())
    }

    /// Apply a failure or repair. Returns false if nothing changed.
    pub fn set_state(&mut self, res: ResourceId, to: Availability, now: SimTime) -> SimResult<bool> {
        let (health, stats) = self.health_mut(res)?;
        Ok(health.set(to, now, stats))
    }

    /// Carrier and stats of a bus or link
    pub fn carrier_mut(&mut self, channel: Channel) -> SimResult<(&mut Carrier, &mut EntityStats)> {
        let unknown = SimError::UnknownResource(channel.into());
        match channel {
            Channel::Bus(b) => self
                .buses
                .get_mut(b.0 as usize)
                .map(|r| (&mut r.carrier, &mut r.stats))
                .ok_or(unknown),
            Channel::Link(l) => self
                .links
                .get_mut(l.0 as usize)
                .map(|r| (&mut r.carrier, &mut r.stats))
                .ok_or(unknown),
        }
    }

    /// Check that `channel` joins `from` and `to`
    pub fn check_route(&self, channel: Channel, from: NodeId, to: NodeId) -> SimResult<()> {
        match channel {
            Channel::Bus(b) => {
                let bus = self.bus(b)?;
                if !bus.nodes.contains(&from) {
                    return Err(SimError::InvalidArgument(format!("sender not connected to bus {b}")));
                }
                if !bus.nodes.contains(&to) {
                    return Err(SimError::InvalidArgument(format!("port owner not connected to bus {b}")));
                }
            }
            Channel::Link(l) => {
                let link = self.link(l)?;
                if link.source != from {
                    return Err(SimError::InvalidArgument(format!("sender not connected to link {l}")));
                }
                if link.destination != to {
                    return Err(SimError::InvalidArgument(format!("port owner not connected to link {l}")));
                }
            }
        }
        Ok(())
    }

    /// Every resource id, nodes first
    pub fn resources(&self) -> Vec<ResourceId> {
        let nodes = self.nodes.iter().map(|n| ResourceId::Node(n.id));
        let buses = self.buses.iter().map(|b| ResourceId::Bus(b.id));
        let links = self.links.iter().map(|l| ResourceId::Link(l.id));
        nodes.chain(buses).chain(links).collect()
    }
}

fn check_rate(rate: f64) -> SimResult<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(SimError::InvalidArgument(format!("transmission rate {rate}")))
    }
}
