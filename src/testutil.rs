use crate::error::{Error, EvalError};
use crate::protocol::ResultFrame;
use crate::request::RequestId;
use crate::worker::{Doorbell, Worker, WorkerId, WorkerLauncher, WorkerPoll};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

enum Completion {
    Values(Vec<f64>),
    ModelError,
    Crash,
}

#[derive(Default)]
struct Script {
    sent: Vec<(WorkerId, RequestId, Vec<f64>)>,
    completions: FxHashMap<RequestId, Completion>,
    dead_workers: Vec<WorkerId>,
    terminated: Vec<WorkerId>,
    auto_double: bool,
    linger_after_terminate: bool,
}

/// Test-side control over scripted workers: decides when and how each
/// in-flight request finishes.
#[derive(Clone, Default)]
pub struct ScriptHandle(Rc<RefCell<Script>>);

impl ScriptHandle {
    pub fn complete(&self, request_id: RequestId, values: Vec<f64>) {
        self.0
            .borrow_mut()
            .completions
            .insert(request_id, Completion::Values(values));
    }

    pub fn model_error(&self, request_id: RequestId) {
        self.0
            .borrow_mut()
            .completions
            .insert(request_id, Completion::ModelError);
    }

    pub fn crash(&self, request_id: RequestId) {
        self.0
            .borrow_mut()
            .completions
            .insert(request_id, Completion::Crash);
    }

    pub fn kill_idle(&self, worker_id: WorkerId) {
        self.0.borrow_mut().dead_workers.push(worker_id);
    }

    pub fn auto_double(&self) {
        self.0.borrow_mut().auto_double = true;
    }

    /// While set, terminated workers report that they are still running.
    pub fn linger_after_terminate(&self, linger: bool) {
        self.0.borrow_mut().linger_after_terminate = linger;
    }

    pub fn sent_requests(&self) -> Vec<RequestId> {
        self.0
            .borrow()
            .sent
            .iter()
            .map(|(_, request_id, _)| *request_id)
            .collect()
    }

    pub fn sent_payload(&self, request_id: RequestId) -> Option<Vec<f64>> {
        self.0
            .borrow()
            .sent
            .iter()
            .find(|(_, id, _)| *id == request_id)
            .map(|(_, _, payload)| payload.clone())
    }

    pub fn num_terminated(&self) -> usize {
        self.0.borrow().terminated.len()
    }
}

pub struct ScriptedLauncher {
    script: ScriptHandle,
    spawn_budget: Option<usize>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            script: ScriptHandle::default(),
            spawn_budget: None,
        }
    }

    pub fn fail_spawns_after(mut self, num_spawns: usize) -> Self {
        self.spawn_budget = Some(num_spawns);
        self
    }

    pub fn script(&self) -> ScriptHandle {
        self.script.clone()
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn spawn(&mut self, worker_id: WorkerId, _: Doorbell) -> Result<Box<dyn Worker>, Error> {
        if let Some(budget) = self.spawn_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::UnableToStartWorkerThread(io::Error::new(
                    io::ErrorKind::Other,
                    "scripted spawn failure",
                )));
            }
            *budget -= 1;
        }

        Ok(Box::new(ScriptedWorker {
            id: worker_id,
            script: self.script.clone(),
            in_flight: None,
            terminated: false,
        }))
    }
}

struct ScriptedWorker {
    id: WorkerId,
    script: ScriptHandle,
    in_flight: Option<(RequestId, Vec<f64>)>,
    terminated: bool,
}

impl Worker for ScriptedWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn send(&mut self, request_id: RequestId, payload: &[f64]) -> Result<(), EvalError> {
        if self.terminated {
            return Err(EvalError::SendFailed {
                worker_id: self.id,
                reason: "terminated".to_string(),
            });
        }
        self.script
            .0
            .borrow_mut()
            .sent
            .push((self.id, request_id, payload.to_vec()));
        self.in_flight = Some((request_id, payload.to_vec()));
        Ok(())
    }

    fn poll(&mut self) -> WorkerPoll {
        let mut script = self.script.0.borrow_mut();

        let (request_id, payload) = match &self.in_flight {
            Some(in_flight) => in_flight.clone(),
            None if script.dead_workers.contains(&self.id) => {
                return WorkerPoll::Failed(EvalError::WorkerLost {
                    worker_id: self.id,
                    reason: "scripted idle death".to_string(),
                })
            }
            None => return WorkerPoll::Pending,
        };

        let completion = match script.completions.remove(&request_id) {
            Some(completion) => completion,
            None if script.auto_double => {
                Completion::Values(payload.iter().map(|x| x * 2.0).collect())
            }
            None => return WorkerPoll::Pending,
        };

        self.in_flight = None;
        match completion {
            Completion::Values(values) => {
                WorkerPoll::Ready(ResultFrame::from_model_output(request_id, Some(values)))
            }
            Completion::ModelError => {
                WorkerPoll::Ready(ResultFrame::from_model_output(request_id, None))
            }
            Completion::Crash => WorkerPoll::Failed(EvalError::WorkerLost {
                worker_id: self.id,
                reason: "scripted crash".to_string(),
            }),
        }
    }

    fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.script.0.borrow_mut().terminated.push(self.id);
        }
    }

    fn has_stopped(&self) -> bool {
        !(self.terminated && self.script.0.borrow().linger_after_terminate)
    }
}
