use crate::error::{Error, EvalError};
use crate::protocol::ResultFrame;
use crate::request::RequestId;
use crossbeam_channel::Sender;
use std::fmt;

/// Identity of one worker incarnation: the pool slot it occupies and how many
/// times that slot has been (re)spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    pub slot: usize,
    pub incarnation: u32,
}

impl WorkerId {
    pub fn new(slot: usize, incarnation: u32) -> Self {
        Self { slot, incarnation }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}.{}", self.slot, self.incarnation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy(RequestId),
}

#[derive(Debug)]
pub enum WorkerPoll {
    Pending,
    Ready(ResultFrame),
    Failed(EvalError),
}

/// Readiness notification shared by all workers of a pool. A worker rings it
/// whenever something may have changed (result written, stream closed, thread
/// gone) so the dispatcher can sleep instead of spinning.
#[derive(Debug, Clone)]
pub struct Doorbell {
    worker_id: WorkerId,
    sender: Sender<WorkerId>,
}

impl Doorbell {
    pub fn new(worker_id: WorkerId, sender: Sender<WorkerId>) -> Self {
        Self { worker_id, sender }
    }

    pub fn ring(&self) {
        self.sender.send(self.worker_id).ok();
    }
}

pub trait Worker {
    fn id(&self) -> WorkerId;

    fn pid(&self) -> Option<u32> {
        None
    }

    /// Hands one parameter vector to an idle worker.
    fn send(&mut self, request_id: RequestId, payload: &[f64]) -> Result<(), EvalError>;

    /// Non-blocking check for the in-flight evaluation. On an idle worker,
    /// `Failed` reports that the worker is no longer alive.
    fn poll(&mut self) -> WorkerPoll;

    /// Forcibly ends the worker and releases its resources. Idempotent.
    fn terminate(&mut self);

    /// Whether a terminated worker has nothing left running. The pool does
    /// not refill a slot before its previous worker has stopped.
    fn has_stopped(&self) -> bool {
        true
    }
}

/// Creates workers for pool slots.
pub trait WorkerLauncher {
    fn spawn(&mut self, worker_id: WorkerId, doorbell: Doorbell)
        -> Result<Box<dyn Worker>, Error>;
}

impl<L: WorkerLauncher + ?Sized> WorkerLauncher for Box<L> {
    fn spawn(&mut self, worker_id: WorkerId, doorbell: Doorbell) -> Result<Box<dyn Worker>, Error> {
        (**self).spawn(worker_id, doorbell)
    }
}
