use crate::error::{Error, EvalError, ProtocolError};
use crate::protocol::ResultFrame;
use crate::request::RequestId;
use crate::worker::{Doorbell, Worker, WorkerId, WorkerLauncher, WorkerPoll};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use derivative::Derivative;
use log::{debug, trace};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Model = dyn Fn(&[f64]) -> Option<Vec<f64>> + Send + Sync;

/// Runs the model in-process, one dedicated thread per worker. A model that
/// returns `None` reports an error for that sample; a model that panics takes
/// its worker down like a crashed process would. A thread released while busy
/// keeps its pool slot until the model returns.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct ThreadWorkerDef {
    #[derivative(Debug = "ignore")]
    model: Arc<Model>,
}

impl ThreadWorkerDef {
    pub fn new<F>(model: F) -> Self
    where
        F: Fn(&[f64]) -> Option<Vec<f64>> + Send + Sync + 'static,
    {
        Self {
            model: Arc::new(model),
        }
    }
}

impl WorkerLauncher for ThreadWorkerDef {
    fn spawn(
        &mut self,
        worker_id: WorkerId,
        doorbell: Doorbell,
    ) -> Result<Box<dyn Worker>, Error> {
        Ok(Box::new(ThreadWorker::spawn(
            self.model.clone(),
            worker_id,
            doorbell,
        )?))
    }
}

struct Job {
    request_id: RequestId,
    payload: Vec<f64>,
}

struct ExitNotifier {
    results: Option<Sender<ResultFrame>>,
    doorbell: Doorbell,
}

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        self.results.take();
        self.doorbell.ring();
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct ThreadWorker {
    id: WorkerId,
    #[derivative(Debug = "ignore")]
    jobs: Option<Sender<Job>>,
    #[derivative(Debug = "ignore")]
    results: Receiver<ResultFrame>,
    thread: Option<JoinHandle<()>>,
    in_flight: Option<RequestId>,
}

impl ThreadWorker {
    fn spawn(model: Arc<Model>, worker_id: WorkerId, doorbell: Doorbell) -> Result<Self, Error> {
        let (jobs, job_recv) = crossbeam_channel::bounded::<Job>(1);
        let (result_sender, results) = crossbeam_channel::unbounded::<ResultFrame>();

        let thread = thread::Builder::new()
            .name(format!("conduit-worker-{}", worker_id))
            .spawn(move || {
                let notifier = ExitNotifier {
                    results: Some(result_sender),
                    doorbell,
                };

                for job in job_recv.iter() {
                    let output = model(&job.payload);
                    let frame = ResultFrame::from_model_output(job.request_id, output);
                    let sent = notifier
                        .results
                        .as_ref()
                        .map(|results| results.send(frame).is_ok())
                        .unwrap_or(false);
                    if !sent {
                        break;
                    }
                    notifier.doorbell.ring();
                }
            })
            .map_err(Error::UnableToStartWorkerThread)?;

        debug!("Started worker thread {}", worker_id);

        Ok(Self {
            id: worker_id,
            jobs: Some(jobs),
            results,
            thread: Some(thread),
            in_flight: None,
        })
    }
}

impl Worker for ThreadWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn send(&mut self, request_id: RequestId, payload: &[f64]) -> Result<(), EvalError> {
        let job = Job {
            request_id,
            payload: payload.to_vec(),
        };

        let sent = self
            .jobs
            .as_ref()
            .map(|jobs| jobs.try_send(job).is_ok())
            .unwrap_or(false);

        if !sent {
            return Err(EvalError::SendFailed {
                worker_id: self.id,
                reason: "worker thread not accepting jobs".to_string(),
            });
        }

        trace!("Sent request {} to worker {}", request_id, self.id);
        self.in_flight = Some(request_id);
        Ok(())
    }

    fn poll(&mut self) -> WorkerPoll {
        match self.results.try_recv() {
            Ok(frame) => {
                let source = match self.in_flight.take() {
                    Some(expected) if expected == frame.request_id => {
                        return WorkerPoll::Ready(frame)
                    }
                    Some(expected) => ProtocolError::UnexpectedRequestId {
                        expected,
                        got: frame.request_id,
                    },
                    None => ProtocolError::UnsolicitedResult,
                };
                WorkerPoll::Failed(EvalError::Protocol {
                    worker_id: self.id,
                    source,
                })
            }
            Err(TryRecvError::Empty) => WorkerPoll::Pending,
            Err(TryRecvError::Disconnected) => {
                let reason = match self.thread.take().map(JoinHandle::join) {
                    Some(Err(_)) => "model panicked",
                    _ => "worker thread terminated",
                };
                WorkerPoll::Failed(EvalError::WorkerLost {
                    worker_id: self.id,
                    reason: reason.to_string(),
                })
            }
        }
    }

    fn terminate(&mut self) {
        // threads cannot be killed: a busy one finishes its sample and the
        // result is discarded
        if self.jobs.take().is_some() {
            self.in_flight = None;
            debug!("Released worker thread {}", self.id);
        }
    }

    fn has_stopped(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}
