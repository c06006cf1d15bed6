//! Statistics collection
//!
//! Two layers:
//! - `EntityStats`: counters embedded in every task, port, semaphore, lock
//!   and resource, updated by the kernel on each transition
//! - `StatisticsCollector`: named user statistics of three kinds
//!   (sample mean, time-weighted variable, event rate)
//!
//! Every derived figure goes through `error::finite`, so a NaN or infinity
//! aborts the run instead of leaking into a report.

use super::error::{SimError, SimResult, finite};
use super::time::SimTime;
use super::trace::fmt_g;
use serde::Serialize;
use std::fmt;

/// Per-entity counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityStats {
    pub arrivals: u64,
    pub completions: u64,
    pub busy_time: f64,
    pub wait_time: f64,
    pub spin_time: f64,
    pub down_time: f64,
    pub faults: u64,
}

impl EntityStats {
    /// Fraction of `span * servers` spent busy
    pub fn utilization(&self, span: f64, servers: usize) -> f64 {
        if span <= 0.0 || servers == 0 {
            0.0
        } else {
            self.busy_time / (span * servers as f64)
        }
    }

    /// Completions per time unit
    pub fn throughput(&self, span: f64) -> f64 {
        if span <= 0.0 {
            0.0
        } else {
            self.completions as f64 / span
        }
    }

    /// Average queueing delay per completion
    pub fn mean_wait(&self) -> f64 {
        if self.completions == 0 {
            0.0
        } else {
            self.wait_time / self.completions as f64
        }
    }
}

/// User statistic identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatId(pub usize);

/// Kind of user statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatKind {
    /// Mean of recorded observations
    Sample,
    /// Time-weighted mean of a piecewise-constant value
    Variable,
    /// Recorded events per time unit
    Rate,
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatKind::Sample => write!(f, "SAMPLE"),
            StatKind::Variable => write!(f, "VAR"),
            StatKind::Rate => write!(f, "RATE"),
        }
    }
}

#[derive(Debug, Clone)]
enum StatValues {
    Sample { count: u64, sum: f64 },
    Variable { start: SimTime, last_time: SimTime, last_value: f64, integral: f64 },
    Rate { start: SimTime, count: u64 },
}

impl StatValues {
    fn open(kind: StatKind, now: SimTime) -> Self {
        match kind {
            StatKind::Sample => StatValues::Sample { count: 0, sum: 0.0 },
            StatKind::Variable => StatValues::Variable {
                start: now,
                last_time: now,
                last_value: 0.0,
                integral: 0.0,
            },
            StatKind::Rate => StatValues::Rate { start: now, count: 0 },
        }
    }
}

#[derive(Debug, Clone)]
struct UserStat {
    name: String,
    kind: StatKind,
    values: StatValues,
}

/// Summary of one user statistic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatSummary {
    pub name: String,
    pub kind: StatKind,
    pub mean: f64,
    /// Observation count (sample, rate) or observed interval (variable)
    pub observations: f64,
}

/// Named user statistics
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    stats: Vec<UserStat>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a statistic; observation starts at `now`
    pub fn open(&mut self, name: impl Into<String>, kind: StatKind, now: SimTime) -> StatId {
        let id = StatId(self.stats.len());
        self.stats.push(UserStat {
            name: name.into(),
            kind,
            values: StatValues::open(kind, now),
        });
        id
    }

    fn get_mut(&mut self, id: StatId) -> SimResult<&mut UserStat> {
        self.stats
            .get_mut(id.0)
            .ok_or_else(|| SimError::InvalidArgument(format!("unknown statistic {}", id.0)))
    }

    /// Record an observation (sample), a new value (variable) or one
    /// event (rate; `value` is ignored)
    pub fn record(&mut self, id: StatId, value: f64, now: SimTime) -> SimResult<()> {
        let stat = self.get_mut(id)?;
        let value = finite(value, &stat.name)?;
        match &mut stat.values {
            StatValues::Sample { count, sum } => {
                *count += 1;
                *sum += value;
            }
            StatValues::Variable { last_time, last_value, integral, .. } => {
                *integral += (now - *last_time) * *last_value;
                *last_time = now;
                *last_value = value;
            }
            StatValues::Rate { count, .. } => *count += 1,
        }
        Ok(())
    }

    /// Restart observation at `now`
    pub fn reset(&mut self, id: StatId, now: SimTime) -> SimResult<()> {
        let stat = self.get_mut(id)?;
        let mut values = StatValues::open(stat.kind, now);
        // A variable keeps its current level across a reset
        if let (StatValues::Variable { last_value, .. }, StatValues::Variable { last_value: old, .. }) =
            (&mut values, &stat.values)
        {
            *last_value = *old;
        }
        stat.values = values;
        Ok(())
    }

    /// Reset every statistic
    pub fn reset_all(&mut self, now: SimTime) {
        for stat in &mut self.stats {
            let keep = match stat.values {
                StatValues::Variable { last_value, .. } => last_value,
                _ => 0.0,
            };
            stat.values = StatValues::open(stat.kind, now);
            if let StatValues::Variable { last_value, .. } = &mut stat.values {
                *last_value = keep;
            }
        }
    }

    /// Mean and observation figure of one statistic at `now`
    pub fn get(&self, id: StatId, now: SimTime) -> SimResult<StatSummary> {
        let stat = self
            .stats
            .get(id.0)
            .ok_or_else(|| SimError::InvalidArgument(format!("unknown statistic {}", id.0)))?;
        summarize(stat, now)
    }

    /// All statistics, sorted by name
    pub fn summaries(&self, now: SimTime) -> SimResult<Vec<StatSummary>> {
        let mut out = self
            .stats
            .iter()
            .map(|s| summarize(s, now))
            .collect::<SimResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

fn summarize(stat: &UserStat, now: SimTime) -> SimResult<StatSummary> {
    let (mean, observations) = match stat.values {
        StatValues::Sample { count, sum } => {
            if count == 0 {
                (0.0, 0.0)
            } else {
                (sum / count as f64, count as f64)
            }
        }
        StatValues::Variable { start, last_time, last_value, integral } => {
            let interval = now - start;
            if interval > 0.0 {
                let total = integral + (now - last_time) * last_value;
                (total / interval, interval)
            } else {
                (0.0, 0.0)
            }
        }
        StatValues::Rate { start, count } => {
            let interval = now - start;
            if interval > 0.0 {
                (count as f64 / interval, count as f64)
            } else {
                (0.0, count as f64)
            }
        }
    };
    Ok(StatSummary {
        name: stat.name.clone(),
        kind: stat.kind,
        mean: finite(mean, &stat.name)?,
        observations: finite(observations, &stat.name)?,
    })
}

/// Derived figures for one kernel entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySummary {
    /// "task", "port", "semaphore", "lock", "node", "bus" or "link"
    pub kind: &'static str,
    pub id: u64,
    pub name: String,
    pub utilization: f64,
    pub throughput: f64,
    pub mean_wait: f64,
    pub counters: EntityStats,
}

impl EntitySummary {
    pub fn new(
        kind: &'static str,
        id: u64,
        name: impl Into<String>,
        counters: &EntityStats,
        servers: usize,
        span: f64,
    ) -> SimResult<Self> {
        let name = name.into();
        let label = format!("{kind} {id}");
        Ok(Self {
            kind,
            id,
            utilization: finite(counters.utilization(span, servers), &format!("{label} utilization"))?,
            throughput: finite(counters.throughput(span), &format!("{label} throughput"))?,
            mean_wait: finite(counters.mean_wait(), &format!("{label} mean wait"))?,
            counters: counters.clone(),
            name,
        })
    }
}

/// End-of-run statistics handed to the reporting side
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub time: SimTime,
    pub entities: Vec<EntitySummary>,
    pub user: Vec<StatSummary>,
}

impl StatsReport {
    /// Look up an entity row
    pub fn entity(&self, kind: &str, id: u64) -> Option<&EntitySummary> {
        self.entities.iter().find(|e| e.kind == kind && e.id == id)
    }

    /// Look up a user statistic by name
    pub fn user_stat(&self, name: &str) -> Option<&StatSummary> {
        self.user.iter().find(|s| s.name == name)
    }

    pub fn to_json(&self) -> SimResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SimError::Config(e.to_string()))
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Simulation statistics for time = {}.", fmt_g(self.time, 6))?;
        writeln!(f)?;
        if !self.user.is_empty() {
            writeln!(f, " {:<38}\tType\t    Mean\tObs(#|interval)", "Name")?;
            writeln!(f)?;
            for stat in &self.user {
                writeln!(
                    f,
                    " {:<38}\t{}\t{:>8}\t{}",
                    stat.name,
                    stat.kind,
                    fmt_g(stat.mean, 6),
                    fmt_g(stat.observations, 6)
                )?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            " {:<10} {:>4} {:<20} {:>10} {:>10} {:>10} {:>8}",
            "Entity", "Id", "Name", "Util", "Thruput", "MeanWait", "Faults"
        )?;
        for e in &self.entities {
            writeln!(
                f,
                " {:<10} {:>4} {:<20} {:>10} {:>10} {:>10} {:>8}",
                e.kind,
                e.id,
                e.name,
                fmt_g(e.utilization, 6),
                fmt_g(e.throughput, 6),
                fmt_g(e.mean_wait, 6),
                e.counters.faults
            )?;
        }
        Ok(())
    }
}
