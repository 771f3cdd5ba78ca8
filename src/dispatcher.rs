use crate::config::EngineConfig;
use crate::error::{Error, EvalError};
use crate::message::Command;
use crate::pool::WorkerPool;
use crate::protocol::Status;
use crate::request::{Outcome, RequestId, RequestState, SampleRequest};
use crate::result::EngineStats;
use crate::worker::{WorkerId, WorkerLauncher, WorkerPoll};
use crossbeam_channel::Receiver;
use futures::channel::oneshot;
use itertools::Itertools;
use log::{debug, info, trace, warn};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Result of registering interest in a request's outcome.
pub enum Suspension {
    Ready(Outcome),
    Waiting(oneshot::Receiver<Outcome>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cancelled_pending: Vec<RequestId>,
    pub cancelled_assigned: Vec<RequestId>,
}

/// The engine loop: routes sample requests to pool workers and hands results
/// back, either to a suspended execution context or to `take_outcome`.
pub struct Dispatcher {
    config: EngineConfig,
    pool: WorkerPool,
    pending: VecDeque<RequestId>,
    requests: FxHashMap<RequestId, SampleRequest>,
    waiters: FxHashMap<RequestId, oneshot::Sender<Outcome>>,
    resolved: FxHashMap<RequestId, Outcome>,
    commands: Option<Receiver<Command>>,
    next_request_id: u64,
    stats: EngineStats,
    is_shut_down: bool,
}

impl Dispatcher {
    pub fn new<L>(config: EngineConfig, launcher: L) -> Result<Self, Error>
    where
        L: WorkerLauncher + 'static,
    {
        let pool = WorkerPool::new(&config, Box::new(launcher));
        if pool.live_count() == 0 {
            return Err(Error::PoolExhausted);
        }

        info!(
            "Dispatcher started with {} of {} workers",
            pool.live_count(),
            pool.limit()
        );

        Ok(Self {
            config,
            pool,
            pending: VecDeque::new(),
            requests: FxHashMap::default(),
            waiters: FxHashMap::default(),
            resolved: FxHashMap::default(),
            commands: None,
            next_request_id: 0,
            stats: EngineStats::default(),
            is_shut_down: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shuts the dispatcher down at the next `wait` after a
    /// `Command::Terminate` arrives on `commands`.
    pub fn attach_commands(&mut self, commands: Receiver<Command>) {
        self.commands = Some(commands);
    }

    /// Queues one sample and assigns it right away if a worker is idle.
    ///
    /// The outcome is held until claimed through `take_outcome` or
    /// `suspend`. Callers that drop request ids must clear what they leave
    /// behind with `take_unclaimed`.
    pub fn submit(&mut self, payload: Vec<f64>) -> Result<RequestId, Error> {
        if self.is_shut_down {
            return Err(Error::ShutDown);
        }

        let request_id = RequestId(self.next_request_id);
        self.next_request_id += 1;

        trace!(
            "Submitted request {}: [{}]",
            request_id,
            payload.iter().join(", ")
        );

        self.requests
            .insert(request_id, SampleRequest::new(request_id, payload));
        self.pending.push_back(request_id);
        self.stats.submitted += 1;

        self.assign_pending();
        Ok(request_id)
    }

    pub fn state(&self, request_id: RequestId) -> Option<RequestState> {
        self.requests
            .get(&request_id)
            .map(|request| request.state)
            .or_else(|| self.resolved.get(&request_id).map(Outcome::state))
    }

    pub fn is_resolved(&self, request_id: RequestId) -> bool {
        self.resolved.contains_key(&request_id)
    }

    /// Removes and returns the outcome of a resolved request that no
    /// execution context is waiting for.
    pub fn take_outcome(&mut self, request_id: RequestId) -> Option<Outcome> {
        self.resolved.remove(&request_id)
    }

    pub fn num_unclaimed(&self) -> usize {
        self.resolved.len()
    }

    /// Removes every outcome nobody has claimed, ordered by request id.
    pub fn take_unclaimed(&mut self) -> Vec<(RequestId, Outcome)> {
        self.resolved
            .drain()
            .sorted_by_key(|(request_id, _)| *request_id)
            .collect()
    }

    /// Registers the caller as the single waiter of `request_id`.
    pub fn suspend(&mut self, request_id: RequestId) -> Suspension {
        if let Some(outcome) = self.resolved.remove(&request_id) {
            return Suspension::Ready(outcome);
        }

        if !self.requests.contains_key(&request_id) || self.waiters.contains_key(&request_id) {
            return Suspension::Ready(Outcome::Failed(EvalError::UnknownRequest(request_id)));
        }

        let (sender, receiver) = oneshot::channel();
        self.waiters.insert(request_id, sender);
        Suspension::Waiting(receiver)
    }

    pub fn num_outstanding(&self) -> usize {
        self.requests.len()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn busy_count(&self) -> usize {
        self.pool.busy_count()
    }

    pub fn live_workers(&self) -> usize {
        self.pool.live_count()
    }

    pub fn busy_workers(&self) -> Vec<(WorkerId, RequestId)> {
        self.pool.busy_workers()
    }

    pub fn worker_for_request(&self, request_id: RequestId) -> Option<WorkerId> {
        self.pool.worker_for_request(request_id)
    }

    pub fn worker_for_pid(&self, pid: u32) -> Option<WorkerId> {
        self.pool.worker_for_pid(pid)
    }

    pub fn pid_of(&self, worker_id: WorkerId) -> Option<u32> {
        self.pool.pid_of(worker_id)
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            workers_spawned: self.pool.num_spawned(),
            spawn_failures: self.pool.num_spawn_failures(),
            ..self.stats.clone()
        }
    }

    /// One non-blocking iteration of the engine loop. Returns how many
    /// requests reached a terminal state.
    pub fn pump(&mut self) -> Result<usize, Error> {
        if self.is_shut_down {
            return Ok(0);
        }

        let resolved_before = self.stats.resolved();
        self.pool.reap_draining();
        self.assign_pending();

        let busy = self
            .pool
            .busy_workers()
            .into_iter()
            .map(|(worker_id, _)| worker_id);
        let poll_order: Vec<WorkerId> = self
            .pool
            .take_rung()
            .into_iter()
            .chain(busy)
            .unique()
            .collect();

        for worker_id in poll_order {
            self.poll_worker(worker_id);
        }

        self.check_idle_workers();
        self.pool.reap_draining();
        self.assign_pending();

        if self.pool.live_count() == 0 {
            return Err(Error::PoolExhausted);
        }

        Ok(self.stats.resolved() - resolved_before)
    }

    /// Sleeps until a worker signals readiness (bounded by the poll interval)
    /// and pumps once.
    pub fn wait(&mut self) -> Result<usize, Error> {
        if self.terminate_requested() {
            info!("Received terminate command, shutting down");
            let report = self.shutdown();
            return Ok(report.cancelled_pending.len() + report.cancelled_assigned.len());
        }

        if self.pool.busy_count() > 0 || self.pool.draining_count() > 0 {
            self.pool.wait_ready(self.config.poll_interval);
        }
        self.pump()
    }

    /// Submits a whole generation and blocks until every request in it is
    /// resolved. Outcomes are returned in submission order.
    pub fn evaluate_generation<I>(&mut self, points: I) -> Result<Vec<Outcome>, Error>
    where
        I: IntoIterator<Item = Vec<f64>>,
    {
        let request_ids = points
            .into_iter()
            .map(|point| self.submit(point))
            .collect::<Result<Vec<_>, _>>()?;

        while request_ids.iter().any(|id| !self.is_resolved(*id)) {
            self.wait()?;
        }

        Ok(request_ids
            .into_iter()
            .map(|id| self.take_outcome(id).unwrap_or(Outcome::Cancelled))
            .collect())
    }

    /// Terminates every worker and cancels all pending and assigned requests.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.is_shut_down {
            return ShutdownReport::default();
        }
        self.is_shut_down = true;

        let cancelled_pending: Vec<RequestId> = self.pending.drain(..).collect();
        let cancelled_assigned: Vec<RequestId> = self
            .pool
            .busy_workers()
            .into_iter()
            .map(|(_, request_id)| request_id)
            .sorted()
            .collect();

        self.pool.terminate_all();

        for request_id in cancelled_pending.iter().chain(&cancelled_assigned) {
            self.resolve(*request_id, Outcome::Cancelled);
        }

        info!(
            "Dispatcher shut down, cancelled {} pending and {} assigned requests",
            cancelled_pending.len(),
            cancelled_assigned.len()
        );

        ShutdownReport {
            cancelled_pending,
            cancelled_assigned,
        }
    }

    fn terminate_requested(&self) -> bool {
        self.commands
            .as_ref()
            .map(|commands| {
                commands
                    .try_iter()
                    .any(|command| command == Command::Terminate)
            })
            .unwrap_or(false)
    }

    fn assign_pending(&mut self) {
        while !self.pending.is_empty() {
            let worker_id = match self.pool.acquire_idle() {
                Some(worker_id) => worker_id,
                None => break,
            };

            let request_id = match self.pending.pop_front() {
                Some(request_id) => request_id,
                None => break,
            };

            let payload = match self.requests.get_mut(&request_id) {
                Some(request) => std::mem::take(&mut request.payload),
                None => continue,
            };

            match self.pool.assign(worker_id, request_id, &payload) {
                Ok(()) => {
                    if let Some(request) = self.requests.get_mut(&request_id) {
                        request.advance(RequestState::Assigned);
                    }
                    self.stats.dispatched += 1;
                    self.stats.max_busy = self.stats.max_busy.max(self.pool.busy_count());
                    debug_assert!(self.pool.busy_count() <= self.config.num_concurrent);
                    trace!("Assigned request {} to worker {}", request_id, worker_id);
                }
                Err(err) => {
                    warn!("Request {} could not be dispatched: {}", request_id, err);
                    self.stats.worker_failures += 1;
                    self.resolve(request_id, Outcome::Failed(err));
                }
            }
        }
    }

    fn poll_worker(&mut self, worker_id: WorkerId) {
        let request_id = match self.pool.request_of(worker_id) {
            Some(request_id) => request_id,
            None => return,
        };

        match self.pool.poll(worker_id) {
            WorkerPoll::Pending => self.check_timeout(worker_id, request_id),
            WorkerPoll::Ready(frame) => {
                self.pool.release(worker_id);
                let outcome = match frame.status {
                    Status::Ok => Outcome::Completed(frame.values),
                    Status::Error => Outcome::Failed(EvalError::Model(request_id)),
                };
                self.resolve(request_id, outcome);
            }
            WorkerPoll::Failed(err) => {
                warn!("Request {} failed: {}", request_id, err);
                self.stats.worker_failures += 1;
                self.pool.fail(worker_id);
                self.resolve(request_id, Outcome::Failed(err));
            }
        }
    }

    fn check_timeout(&mut self, worker_id: WorkerId, request_id: RequestId) {
        let kill_after = match self.config.kill_after {
            Some(kill_after) => kill_after,
            None => return,
        };

        let timed_out = self
            .pool
            .busy_for(worker_id)
            .map(|busy_for| busy_for >= kill_after)
            .unwrap_or(false);

        if timed_out {
            warn!(
                "Request {} on worker {} exceeded {:?}, killing worker",
                request_id, worker_id, kill_after
            );
            self.pool.fail(worker_id);
            self.resolve(
                request_id,
                Outcome::Failed(EvalError::TimedOut { worker_id }),
            );
        }
    }

    fn check_idle_workers(&mut self) {
        for worker_id in self.pool.idle_workers() {
            if let WorkerPoll::Failed(err) = self.pool.poll(worker_id) {
                warn!("Idle worker {} lost: {}", worker_id, err);
                self.stats.worker_failures += 1;
                self.pool.fail(worker_id);
            }
        }
    }

    fn resolve(&mut self, request_id: RequestId, outcome: Outcome) {
        let mut request = match self.requests.remove(&request_id) {
            Some(request) => request,
            None => {
                warn!("Ignoring second resolution of request {}", request_id);
                return;
            }
        };

        request.advance(outcome.state());
        match request.state {
            RequestState::Completed => self.stats.completed += 1,
            RequestState::Failed => self.stats.failed += 1,
            RequestState::Cancelled => self.stats.cancelled += 1,
            RequestState::Pending | RequestState::Assigned => {}
        }
        debug!("Request {} resolved: {}", request_id, request.state);

        match self.waiters.remove(&request_id) {
            Some(waiter) => {
                if waiter.send(outcome).is_err() {
                    trace!("Context of request {} is gone, outcome dropped", request_id);
                }
            }
            None => {
                self.resolved.insert(request_id, outcome);
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
