//! Model description and run flags
//!
//! The model builder hands the kernel a static description of the resource
//! topology and synchronization objects. It is read once, before the run.

use super::error::{SimError, SimResult};
use super::fabric::FailureModel;
use super::lock::{LockOrder, LockPolicy};
use serde::Deserialize;

/// Default virtual-time step between spin retries
pub const DEFAULT_SPIN_QUANTUM: f64 = 0.01;

/// Default cap on the number of tasks ever created
pub const DEFAULT_MAX_TASKS: usize = 100_000;

fn one() -> usize {
    1
}

fn unit_speed() -> f64 {
    1.0
}

fn default_spin_quantum() -> f64 {
    DEFAULT_SPIN_QUANTUM
}

fn default_max_tasks() -> usize {
    DEFAULT_MAX_TASKS
}

/// A processing node
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default = "one")]
    pub cpus: usize,
    #[serde(default = "unit_speed")]
    pub speed: f64,
    #[serde(default)]
    pub failure: Option<FailureModel>,
}

/// A bus joining two or more nodes (by index)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BusSpec {
    pub name: String,
    pub nodes: Vec<u64>,
    /// Bytes per time unit
    pub rate: f64,
    #[serde(default)]
    pub failure: Option<FailureModel>,
}

/// A one-way link between two nodes
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinkSpec {
    pub name: String,
    pub source: u64,
    pub destination: u64,
    pub rate: f64,
    #[serde(default)]
    pub failure: Option<FailureModel>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SemaphoreSpec {
    #[serde(default)]
    pub initial: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct LockSpec {
    #[serde(default)]
    pub policy: LockPolicy,
    #[serde(default)]
    pub order: LockOrder,
}

/// Static model configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelDescription {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub buses: Vec<BusSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub semaphores: Vec<SemaphoreSpec>,
    #[serde(default)]
    pub locks: Vec<LockSpec>,
    #[serde(default = "default_spin_quantum")]
    pub spin_quantum: f64,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

impl Default for ModelDescription {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            buses: Vec::new(),
            links: Vec::new(),
            semaphores: Vec::new(),
            locks: Vec::new(),
            spin_quantum: DEFAULT_SPIN_QUANTUM,
            max_tasks: DEFAULT_MAX_TASKS,
        }
    }
}

impl ModelDescription {
    /// Parse and validate a JSON description
    pub fn from_json(text: &str) -> SimResult<Self> {
        let model: ModelDescription =
            serde_json::from_str(text).map_err(|e| SimError::Config(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    /// Structural checks that do not need a built fabric
    pub fn validate(&self) -> SimResult<()> {
        if !(self.spin_quantum.is_finite() && self.spin_quantum > 0.0) {
            return Err(SimError::Config(format!("spin quantum {}", self.spin_quantum)));
        }
        if self.max_tasks == 0 {
            return Err(SimError::Config("max_tasks must be positive".into()));
        }
        let nodes = self.nodes.len() as u64;
        for bus in &self.buses {
            if let Some(n) = bus.nodes.iter().find(|&&n| n >= nodes) {
                return Err(SimError::Config(format!("bus {} names unknown node {n}", bus.name)));
            }
        }
        for link in &self.links {
            if link.source >= nodes || link.destination >= nodes {
                return Err(SimError::Config(format!("link {} names unknown node", link.name)));
            }
        }
        let failures = self
            .nodes
            .iter()
            .filter_map(|n| n.failure.as_ref())
            .chain(self.buses.iter().filter_map(|b| b.failure.as_ref()))
            .chain(self.links.iter().filter_map(|l| l.failure.as_ref()));
        for model in failures {
            model.validate()?;
        }
        Ok(())
    }
}

/// Optional run behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct RunFlags {
    /// Emit trace lines to the trace sink
    #[serde(default)]
    pub trace: bool,
    /// Call the step hook before every dispatch
    #[serde(default)]
    pub step: bool,
    /// Forward warnings to the log
    #[serde(default)]
    pub warnings: bool,
}

impl RunFlags {
    pub fn traced() -> Self {
        Self {
            trace: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fabric::Distribution;

    #[test]
    fn test_parse_full_description() {
        let model = ModelDescription::from_json(
            r#"{
                "nodes": [
                    {"name": "cpu0", "cpus": 2, "speed": 2.0},
                    {"name": "cpu1", "failure": {
                        "time_to_failure": {"type": "exponential", "mean": 100.0},
                        "time_to_repair": {"type": "constant", "value": 5.0}
                    }}
                ],
                "buses": [{"name": "ether", "nodes": [0, 1], "rate": 1000.0}],
                "links": [{"name": "l01", "source": 0, "destination": 1, "rate": 10.0}],
                "semaphores": [{"initial": 2}, {}],
                "locks": [{"policy": "spinning", "order": "priority"}],
                "spin_quantum": 0.5
            }"#,
        )
        .unwrap();

        assert_eq!(model.nodes.len(), 2);
        assert_eq!(model.nodes[1].cpus, 1);
        assert_eq!(model.nodes[1].speed, 1.0);
        assert_eq!(
            model.nodes[1].failure.as_ref().unwrap().time_to_repair,
            Distribution::Constant { value: 5.0 }
        );
        assert_eq!(model.semaphores[1].initial, 0);
        assert_eq!(model.locks[0].policy, LockPolicy::Spinning);
        assert_eq!(model.locks[0].order, LockOrder::Priority);
        assert_eq!(model.spin_quantum, 0.5);
        assert_eq!(model.max_tasks, DEFAULT_MAX_TASKS);
    }

    #[test]
    fn test_empty_description_uses_defaults() {
        let model = ModelDescription::from_json("{}").unwrap();
        assert_eq!(model, ModelDescription::default());
    }

    #[test]
    fn test_bad_references_rejected() {
        let err = ModelDescription::from_json(
            r#"{"nodes": [{"name": "a"}], "links": [{"name": "l", "source": 0, "destination": 3, "rate": 1.0}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SimError::Config(_)));

        assert!(ModelDescription::from_json(r#"{"spin_quantum": 0.0}"#).is_err());
        assert!(ModelDescription::from_json("not json").is_err());
    }

    #[test]
    fn test_run_flags() {
        let flags: RunFlags = serde_json::from_str(r#"{"trace": true}"#).unwrap();
        assert!(flags.trace);
        assert!(!flags.step);
        assert_eq!(RunFlags::traced(), flags);
    }
}
