use crate::error::{Error, EvalError, ProtocolError};
use crate::protocol::{self, ResultFrame};
use crate::request::RequestId;
use crate::worker::{Doorbell, Worker, WorkerId, WorkerLauncher, WorkerPoll};
use bytes::Bytes;
use command_group::{CommandGroup, GroupChild};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use derivative::Derivative;
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io::{BufReader, Write};
use std::process::{ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// how long an exit or closed output may wait for its counterpart
const EXIT_GRACE: Duration = Duration::from_millis(100);

/// How to start a worker process. The process must speak the frame protocol
/// on stdin/stdout and may serve any number of requests.
#[derive(Debug, Clone)]
pub struct ProcessWorkerDef {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl ProcessWorkerDef {
    pub fn new(program: OsString, args: Vec<OsString>) -> Self {
        Self {
            program,
            args,
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ProcessWorkerDef {
    fn spawn(
        &mut self,
        worker_id: WorkerId,
        doorbell: Doorbell,
    ) -> Result<Box<dyn Worker>, Error> {
        Ok(Box::new(ProcessWorker::spawn(self, worker_id, doorbell)?))
    }
}

#[derive(Debug)]
enum ReaderMessage {
    Frame(ResultFrame),
    Malformed(ProtocolError),
    Closed,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct ProcessWorker {
    id: WorkerId,
    pid: u32,
    #[derivative(Debug = "ignore")]
    child: Option<GroupChild>,
    #[derivative(Debug = "ignore")]
    frames: Option<Sender<Bytes>>,
    #[derivative(Debug = "ignore")]
    messages: Receiver<ReaderMessage>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    in_flight: Option<RequestId>,
    exit_status: Option<ExitStatus>,
    output_closed: bool,
    grace_started: Option<Instant>,
}

impl ProcessWorker {
    pub fn spawn(
        def: &ProcessWorkerDef,
        worker_id: WorkerId,
        doorbell: Doorbell,
    ) -> Result<Self, Error> {
        let mut child = Command::new(&def.program)
            .args(&def.args)
            .envs(def.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .group_spawn()
            .map_err(|source| Error::UnableToLaunchWorkerProcess {
                program: def.program.clone(),
                source,
            })?;

        let pid = child.id();
        let stdin = child.inner().stdin.take();
        let stdout = child.inner().stdout.take();
        let (sender, messages) = crossbeam_channel::unbounded();

        let mut worker = Self {
            id: worker_id,
            pid,
            child: Some(child),
            frames: None,
            messages,
            reader: None,
            writer: None,
            in_flight: None,
            exit_status: None,
            output_closed: false,
            grace_started: None,
        };

        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            (stdin, _) => {
                worker.terminate();
                return Err(Error::MissingWorkerPipe {
                    program: def.program.clone(),
                    stream: if stdin.is_none() { "stdin" } else { "stdout" },
                });
            }
        };

        let (frames, frame_recv) = crossbeam_channel::unbounded();
        let threads = thread::Builder::new()
            .name(format!("conduit-reader-{}", worker_id))
            .spawn(move || read_results(stdout, sender, doorbell))
            .and_then(|reader| {
                let writer = thread::Builder::new()
                    .name(format!("conduit-writer-{}", worker_id))
                    .spawn(move || write_requests(stdin, frame_recv, worker_id))?;
                Ok((reader, writer))
            });

        match threads {
            Ok((reader, writer)) => {
                worker.reader = Some(reader);
                worker.writer = Some(writer);
                worker.frames = Some(frames);
                debug!("Spawned worker process {}, PID: {}", worker_id, pid);
                Ok(worker)
            }
            Err(err) => {
                worker.terminate();
                Err(Error::UnableToStartWorkerThread(err))
            }
        }
    }

    fn accept(&mut self, frame: ResultFrame) -> WorkerPoll {
        let source = match self.in_flight.take() {
            Some(expected) if expected == frame.request_id => return WorkerPoll::Ready(frame),
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

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, EvalError> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }

        let child = match self.child.as_mut() {
            Some(child) => child,
            None => {
                return Err(EvalError::WorkerLost {
                    worker_id: self.id,
                    reason: "worker terminated".to_string(),
                })
            }
        };

        let status = child.try_wait().map_err(|err| EvalError::WorkerLost {
            worker_id: self.id,
            reason: err.to_string(),
        })?;

        if let Some(status) = status {
            trace!("Worker {} exited, status: {}", self.id, status);
            self.exit_status = Some(status);
        }
        Ok(status)
    }

    fn exited(&self, status: ExitStatus) -> WorkerPoll {
        WorkerPoll::Failed(EvalError::WorkerExited {
            worker_id: self.id,
            status,
        })
    }
}

impl Worker for ProcessWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    /// Queues the frame for the writer thread; never waits for the worker
    /// to read it.
    fn send(&mut self, request_id: RequestId, payload: &[f64]) -> Result<(), EvalError> {
        let worker_id = self.id;
        let send_failed = |reason: String| EvalError::SendFailed { worker_id, reason };

        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| send_failed("worker terminated".to_string()))?;
        let frame = protocol::encode_request(request_id, payload)
            .map_err(|err| send_failed(err.to_string()))?;
        frames
            .send(frame)
            .map_err(|_| send_failed("worker stopped reading requests".to_string()))?;

        trace!("Sent request {} to worker {}", request_id, worker_id);
        self.in_flight = Some(request_id);
        Ok(())
    }

    fn poll(&mut self) -> WorkerPoll {
        match self.messages.try_recv() {
            Ok(ReaderMessage::Frame(frame)) => return self.accept(frame),
            Ok(ReaderMessage::Malformed(source)) => {
                return WorkerPoll::Failed(EvalError::Protocol {
                    worker_id: self.id,
                    source,
                })
            }
            Ok(ReaderMessage::Closed) | Err(TryRecvError::Disconnected) => {
                self.output_closed = true
            }
            Err(TryRecvError::Empty) => {}
        }

        let status = match self.try_wait() {
            Ok(status) => status,
            Err(err) => return WorkerPoll::Failed(err),
        };

        match (status, self.output_closed) {
            (None, false) => WorkerPoll::Pending,
            (Some(status), true) => self.exited(status),
            // exited with a result possibly still in the reader, or output
            // closed by a process that is still running
            (status, _) => {
                let grace_started = *self.grace_started.get_or_insert_with(Instant::now);
                if grace_started.elapsed() < EXIT_GRACE {
                    return WorkerPoll::Pending;
                }
                match status {
                    Some(status) => self.exited(status),
                    None => WorkerPoll::Failed(EvalError::Protocol {
                        worker_id: self.id,
                        source: ProtocolError::OutputClosed,
                    }),
                }
            }
        }
    }

    fn terminate(&mut self) {
        self.frames.take();
        self.in_flight = None;

        let mut child = match self.child.take() {
            Some(child) => child,
            None => return,
        };

        let pid = Pid::from_raw(self.pid as i32);
        match killpg(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => warn!(
                "{}: {}",
                Error::FailedToKillWorkerProcessGroup(pid),
                errno
            ),
        }

        if self.exit_status.is_none() {
            match child.wait() {
                Ok(status) => self.exit_status = Some(status),
                Err(err) => warn!("{}: {}", Error::FailedToReapWorkerProcess(pid), err),
            }
        }

        // reader and writer end on their own once the pipes close
        self.reader.take();
        self.writer.take();
        debug!("Terminated worker process {}, PID: {}", self.id, self.pid);
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn write_requests(mut stdin: ChildStdin, frames: Receiver<Bytes>, worker_id: WorkerId) {
    for frame in frames.iter() {
        if let Err(err) = stdin.write_all(&frame).and_then(|()| stdin.flush()) {
            // exit or closed output surfaces through poll
            debug!("Writing to worker {} failed: {}", worker_id, err);
            return;
        }
    }
}

fn read_results(stdout: ChildStdout, sender: Sender<ReaderMessage>, doorbell: Doorbell) {
    let mut stdout = BufReader::new(stdout);
    loop {
        let message = match protocol::read_result(&mut stdout) {
            Ok(Some(frame)) => ReaderMessage::Frame(frame),
            Ok(None) => ReaderMessage::Closed,
            Err(err) => ReaderMessage::Malformed(err),
        };

        let is_last = !matches!(message, ReaderMessage::Frame(_));
        if sender.send(message).is_err() {
            return;
        }
        doorbell.ring();

        if is_last {
            return;
        }
    }
}
