use crate::algorithm::ChainSummary;
use crate::request::{Outcome, RequestState};
use serde::Serialize;
use std::fmt;

/// Instrumentation counters of one dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub submitted: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_busy: usize,
    pub workers_spawned: usize,
    pub spawn_failures: usize,
    pub worker_failures: usize,
}

impl EngineStats {
    pub fn resolved(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "submitted: {}", self.submitted)?;
        writeln!(f, "completed: {}", self.completed)?;
        writeln!(f, "failed: {}", self.failed)?;
        writeln!(f, "cancelled: {}", self.cancelled)?;
        writeln!(f, "max busy workers: {}", self.max_busy)?;
        writeln!(f, "workers spawned: {}", self.workers_spawned)?;
        writeln!(f, "spawn failures: {}", self.spawn_failures)?;
        write!(f, "worker failures: {}", self.worker_failures)
    }
}

/// Serializable view of one `Outcome`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Outcome> for OutcomeRecord {
    fn from(outcome: &Outcome) -> Self {
        Self {
            state: outcome.state().to_string(),
            values: outcome.values().map(<[f64]>::to_vec),
            error: match outcome {
                Outcome::Failed(err) => Some(err.to_string()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalReport {
    pub outcomes: Vec<OutcomeRecord>,
    pub stats: EngineStats,
}

impl EvalReport {
    pub fn new(outcomes: &[Outcome], stats: EngineStats) -> Self {
        Self {
            outcomes: outcomes.iter().map(OutcomeRecord::from).collect(),
            stats,
        }
    }

    pub fn num_in_state(&self, state: RequestState) -> usize {
        let state = state.to_string();
        self.outcomes
            .iter()
            .filter(|record| record.state == state)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BestSeen {
    pub fitness: f64,
    pub point: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    pub best_seen: Option<BestSeen>,
    pub num_generations: usize,
    pub stats: EngineStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleReport {
    pub chains: Vec<ChainSummary>,
    pub stats: EngineStats,
}
