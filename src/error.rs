use crate::request::RequestId;
use crate::worker::WorkerId;
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io;
use std::process::ExitStatus;
use thiserror;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("invalid JSON")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },
    #[error("number of concurrent evaluations must be strictly positive")]
    ZeroNumConcurrent,
    #[error("maximum number of spawn attempts must be strictly positive")]
    ZeroSpawnAttempts,
    #[error("poll interval must be strictly positive")]
    ZeroPollInterval,
    #[error("unable to launch worker process {program:?}: {source}")]
    UnableToLaunchWorkerProcess { program: OsString, source: io::Error },
    #[error("unable to start worker thread: {}", .0)]
    UnableToStartWorkerThread(io::Error),
    #[error("worker process {program:?} spawned without {stream} pipe")]
    MissingWorkerPipe {
        program: OsString,
        stream: &'static str,
    },
    #[error("no worker could be spawned, pool exhausted")]
    PoolExhausted,
    #[error("dispatcher has been shut down")]
    ShutDown,
    #[error("execution contexts stalled with no evaluation outstanding")]
    Stalled,
    #[error("lower and upper bounds must have equal, nonzero length and lower <= upper")]
    InvalidBounds,
    #[error("proposal standard deviation must be finite and positive, got {}", .0)]
    InvalidProposalScale(f64),
    #[error("unable to spawn execution context")]
    UnableToSpawnContext(#[from] futures::task::SpawnError),
    #[error("failed to kill worker process group. PID: {}", .0)]
    FailedToKillWorkerProcessGroup(Pid),
    #[error("failed to reap worker process. PID: {}", .0)]
    FailedToReapWorkerProcess(Pid),
    #[error("failed to set signal handler")]
    FailedToSetSignalHandler(#[from] ctrlc::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure of a single evaluation. Carried back to the issuing algorithm in
/// `Outcome::Failed`; never aborts the run.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("worker {worker_id} exited before returning a result ({status})")]
    WorkerExited {
        worker_id: WorkerId,
        status: ExitStatus,
    },
    #[error("worker {worker_id} died before returning a result: {reason}")]
    WorkerLost { worker_id: WorkerId, reason: String },
    #[error("protocol error on worker {worker_id}: {source}")]
    Protocol {
        worker_id: WorkerId,
        source: ProtocolError,
    },
    #[error("model reported an error for request {}", .0)]
    Model(RequestId),
    #[error("evaluation on worker {worker_id} exceeded the time limit")]
    TimedOut { worker_id: WorkerId },
    #[error("unable to hand request to worker {worker_id}: {reason}")]
    SendFailed { worker_id: WorkerId, reason: String },
    #[error("unknown or already claimed request {}", .0)]
    UnknownRequest(RequestId),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("unknown result status {}", .0)]
    UnknownStatus(u8),
    #[error("frame announces {} values, limit is {}", .count, .limit)]
    TooManyValues { count: u32, limit: u32 },
    #[error("result tagged with request {got}, expected {expected}")]
    UnexpectedRequestId { expected: RequestId, got: RequestId },
    #[error("result received while no request was in flight")]
    UnsolicitedResult,
    #[error("output stream closed")]
    OutputClosed,
    #[error("I/O error: {}", .0)]
    Io(String),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
