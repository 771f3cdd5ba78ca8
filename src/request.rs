use crate::error::EvalError;
use enum_display_derive::Display;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RequestState {
    Pending,
    Assigned,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// Terminal result of one sample request, as seen by the algorithm.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Vec<f64>),
    Failed(EvalError),
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> RequestState {
        match self {
            Outcome::Completed(_) => RequestState::Completed,
            Outcome::Failed(_) => RequestState::Failed,
            Outcome::Cancelled => RequestState::Cancelled,
        }
    }

    /// First returned value, the scalar fitness for single-objective models.
    pub fn fitness(&self) -> Option<f64> {
        match self {
            Outcome::Completed(values) => values.first().copied(),
            _ => None,
        }
    }

    pub fn values(&self) -> Option<&[f64]> {
        match self {
            Outcome::Completed(values) => Some(values),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }
}

#[derive(Debug)]
pub(crate) struct SampleRequest {
    pub id: RequestId,
    pub payload: Vec<f64>,
    pub state: RequestState,
}

impl SampleRequest {
    pub fn new(id: RequestId, payload: Vec<f64>) -> Self {
        Self {
            id,
            payload,
            state: RequestState::Pending,
        }
    }

    pub fn advance(&mut self, next: RequestState) {
        debug_assert!(
            !self.state.is_terminal(),
            "request {} already terminal ({})",
            self.id,
            self.state
        );
        self.state = next;
    }
}
