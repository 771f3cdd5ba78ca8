use crate::config::{EngineConfig, Recycle};
use crate::error::EvalError;
use crate::request::RequestId;
use crate::worker::{Doorbell, Worker, WorkerId, WorkerLauncher, WorkerPoll, WorkerState};
use crossbeam_channel::{Receiver, Sender};
use derivative::Derivative;
use itertools::Itertools;
use log::{debug, error, warn};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Slot {
    incarnation: u32,
    worker: Option<Box<dyn Worker>>,
    state: WorkerState,
    busy_since: Option<Instant>,
    // terminated worker still running; the slot is refilled once it stops
    draining: Option<Box<dyn Worker>>,
}

impl Slot {
    fn worker_id(&self, slot: usize) -> WorkerId {
        WorkerId::new(slot, self.incarnation)
    }
}

/// Bounded set of workers. Idle workers are handed out in the order they
/// became idle; a slot whose worker cannot be (re)spawned is retired.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct WorkerPool {
    #[derivative(Debug = "ignore")]
    slots: Vec<Slot>,
    idle: VecDeque<usize>,
    by_request: FxHashMap<RequestId, WorkerId>,
    by_pid: FxHashMap<u32, WorkerId>,
    #[derivative(Debug = "ignore")]
    launcher: Box<dyn WorkerLauncher>,
    doorbell_sender: Sender<WorkerId>,
    doorbell: Receiver<WorkerId>,
    rung: Vec<WorkerId>,
    recycle: Recycle,
    max_spawn_attempts: usize,
    respawn_failed_workers: bool,
    num_spawned: usize,
    num_spawn_failures: usize,
}

impl WorkerPool {
    pub fn new(config: &EngineConfig, launcher: Box<dyn WorkerLauncher>) -> Self {
        let (doorbell_sender, doorbell) = crossbeam_channel::unbounded();

        let mut pool = Self {
            slots: Vec::with_capacity(config.num_concurrent),
            idle: VecDeque::with_capacity(config.num_concurrent),
            by_request: FxHashMap::default(),
            by_pid: FxHashMap::default(),
            launcher,
            doorbell_sender,
            doorbell,
            rung: Vec::new(),
            recycle: config.recycle,
            max_spawn_attempts: config.max_spawn_attempts,
            respawn_failed_workers: config.respawn_failed_workers,
            num_spawned: 0,
            num_spawn_failures: 0,
        };

        for slot in 0..config.num_concurrent {
            pool.slots.push(Slot {
                incarnation: 0,
                worker: None,
                state: WorkerState::Idle,
                busy_since: None,
                draining: None,
            });
            pool.spawn_into(slot);
        }

        pool
    }

    pub fn limit(&self) -> usize {
        self.slots.len()
    }

    /// Slots that hold a worker or wait for their terminated worker to stop.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.worker.is_some() || slot.draining.is_some())
            .count()
    }

    pub fn draining_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.draining.is_some())
            .count()
    }

    pub fn busy_count(&self) -> usize {
        self.by_request.len()
    }

    pub fn num_spawned(&self) -> usize {
        self.num_spawned
    }

    pub fn num_spawn_failures(&self) -> usize {
        self.num_spawn_failures
    }

    pub fn acquire_idle(&mut self) -> Option<WorkerId> {
        if self.busy_count() >= self.limit() {
            return None;
        }

        while let Some(slot_index) = self.idle.pop_front() {
            let slot = &self.slots[slot_index];
            if slot.worker.is_some() && slot.state == WorkerState::Idle {
                return Some(slot.worker_id(slot_index));
            }
        }

        None
    }

    /// Sends the payload to an idle worker acquired via `acquire_idle`. A
    /// worker that refuses the request is treated as failed.
    pub fn assign(
        &mut self,
        worker_id: WorkerId,
        request_id: RequestId,
        payload: &[f64],
    ) -> Result<(), EvalError> {
        let sent = match self.live_worker_mut(worker_id) {
            Some(worker) => worker.send(request_id, payload),
            None => Err(EvalError::SendFailed {
                worker_id,
                reason: "worker no longer in pool".to_string(),
            }),
        };

        match sent {
            Ok(()) => {
                let slot = &mut self.slots[worker_id.slot];
                slot.state = WorkerState::Busy(request_id);
                slot.busy_since = Some(Instant::now());
                self.by_request.insert(request_id, worker_id);
                Ok(())
            }
            Err(err) => {
                self.fail(worker_id);
                Err(err)
            }
        }
    }

    pub fn poll(&mut self, worker_id: WorkerId) -> WorkerPoll {
        match self.live_worker_mut(worker_id) {
            Some(worker) => worker.poll(),
            None => WorkerPoll::Pending,
        }
    }

    /// Returns a worker that delivered its result to the idle queue, or
    /// replaces it when workers are single-use.
    pub fn release(&mut self, worker_id: WorkerId) {
        if !self.is_current(worker_id) {
            return;
        }
        self.clear_busy(worker_id);

        match self.recycle {
            Recycle::Reuse => self.idle.push_back(worker_id.slot),
            Recycle::Respawn => self.replace(worker_id.slot),
        }
    }

    /// Terminates a worker after a crash, protocol violation or timeout, then
    /// respawns or retires its slot.
    pub fn fail(&mut self, worker_id: WorkerId) {
        if !self.is_current(worker_id) {
            return;
        }
        self.clear_busy(worker_id);

        if self.respawn_failed_workers {
            self.replace(worker_id.slot);
        } else {
            self.retire(worker_id.slot);
        }
    }

    pub fn request_of(&self, worker_id: WorkerId) -> Option<RequestId> {
        if !self.is_current(worker_id) {
            return None;
        }
        match self.slots[worker_id.slot].state {
            WorkerState::Busy(request_id) => Some(request_id),
            WorkerState::Idle => None,
        }
    }

    pub fn worker_for_request(&self, request_id: RequestId) -> Option<WorkerId> {
        self.by_request.get(&request_id).copied()
    }

    pub fn worker_for_pid(&self, pid: u32) -> Option<WorkerId> {
        self.by_pid.get(&pid).copied()
    }

    pub fn pid_of(&self, worker_id: WorkerId) -> Option<u32> {
        self.slots
            .get(worker_id.slot)
            .filter(|slot| slot.incarnation == worker_id.incarnation)
            .and_then(|slot| slot.worker.as_ref())
            .and_then(|worker| worker.pid())
    }

    pub fn busy_for(&self, worker_id: WorkerId) -> Option<Duration> {
        self.slots
            .get(worker_id.slot)
            .filter(|slot| slot.incarnation == worker_id.incarnation)
            .and_then(|slot| slot.busy_since)
            .map(|since| since.elapsed())
    }

    pub fn busy_workers(&self) -> Vec<(WorkerId, RequestId)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot.state {
                WorkerState::Busy(request_id) if slot.worker.is_some() => {
                    Some((slot.worker_id(index), request_id))
                }
                _ => None,
            })
            .collect()
    }

    pub fn idle_workers(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.worker.is_some() && slot.state == WorkerState::Idle)
            .map(|(index, slot)| slot.worker_id(index))
            .collect()
    }

    /// Workers that signalled readiness since the last call, in signal order,
    /// without duplicates.
    pub fn take_rung(&mut self) -> Vec<WorkerId> {
        let mut rung = std::mem::take(&mut self.rung);
        rung.extend(self.doorbell.try_iter());
        rung.into_iter().unique().collect()
    }

    /// Refills slots whose terminated worker has stopped in the meantime.
    /// Returns the number of slots refilled.
    pub fn reap_draining(&mut self) -> usize {
        let stopped: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.draining
                    .as_ref()
                    .map_or(false, |worker| worker.has_stopped())
            })
            .map(|(index, _)| index)
            .collect();

        for slot_index in &stopped {
            if let Some(worker) = self.slots[*slot_index].draining.take() {
                debug!("Worker {} stopped, refilling slot {}", worker.id(), slot_index);
            }
            self.spawn_into(*slot_index);
        }

        stopped.len()
    }

    /// Blocks until some worker signals readiness or the timeout elapses.
    pub fn wait_ready(&mut self, timeout: Duration) -> bool {
        match self.doorbell.recv_timeout(timeout) {
            Ok(worker_id) => {
                self.rung.push(worker_id);
                true
            }
            Err(_) => false,
        }
    }

    pub fn terminate_all(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(mut worker) = slot.worker.take() {
                debug!("Terminating worker {}", slot.worker_id(index));
                worker.terminate();
            }
            slot.draining.take();
            slot.state = WorkerState::Idle;
            slot.busy_since = None;
        }
        self.idle.clear();
        self.by_request.clear();
        self.by_pid.clear();
    }

    fn is_current(&self, worker_id: WorkerId) -> bool {
        self.slots
            .get(worker_id.slot)
            .map(|slot| slot.incarnation == worker_id.incarnation && slot.worker.is_some())
            .unwrap_or(false)
    }

    fn live_worker_mut(&mut self, worker_id: WorkerId) -> Option<&mut Box<dyn Worker>> {
        self.slots
            .get_mut(worker_id.slot)
            .filter(|slot| slot.incarnation == worker_id.incarnation)
            .and_then(|slot| slot.worker.as_mut())
    }

    fn clear_busy(&mut self, worker_id: WorkerId) {
        let slot = &mut self.slots[worker_id.slot];
        if let WorkerState::Busy(request_id) = slot.state {
            self.by_request.remove(&request_id);
        }
        slot.state = WorkerState::Idle;
        slot.busy_since = None;
    }

    fn take_worker(&mut self, slot_index: usize) -> Option<Box<dyn Worker>> {
        self.idle.retain(|idle_index| *idle_index != slot_index);
        let mut worker = self.slots[slot_index].worker.take()?;
        if let Some(pid) = worker.pid() {
            self.by_pid.remove(&pid);
        }
        worker.terminate();
        Some(worker)
    }

    fn replace(&mut self, slot_index: usize) {
        let old_worker = self.take_worker(slot_index);
        let slot = &mut self.slots[slot_index];
        slot.incarnation += 1;

        match old_worker {
            Some(worker) if !worker.has_stopped() => {
                debug!(
                    "Slot {} waits for worker {} to stop before respawning",
                    slot_index,
                    worker.id()
                );
                slot.draining = Some(worker);
            }
            _ => self.spawn_into(slot_index),
        }
    }

    fn retire(&mut self, slot_index: usize) {
        self.take_worker(slot_index);
        self.slots[slot_index].incarnation += 1;
        warn!(
            "Retired worker slot {}, {} of {} slots remain",
            slot_index,
            self.live_count(),
            self.limit()
        );
    }

    fn spawn_into(&mut self, slot_index: usize) {
        for attempt in 1..=self.max_spawn_attempts {
            let worker_id = self.slots[slot_index].worker_id(slot_index);
            let doorbell = Doorbell::new(worker_id, self.doorbell_sender.clone());

            match self.launcher.spawn(worker_id, doorbell) {
                Ok(worker) => {
                    if let Some(pid) = worker.pid() {
                        self.by_pid.insert(pid, worker_id);
                    }
                    let slot = &mut self.slots[slot_index];
                    slot.worker = Some(worker);
                    slot.state = WorkerState::Idle;
                    slot.busy_since = None;
                    self.idle.push_back(slot_index);
                    self.num_spawned += 1;
                    return;
                }
                Err(err) => {
                    self.num_spawn_failures += 1;
                    warn!(
                        "Spawning worker {} failed (attempt {} of {}): {}",
                        worker_id, attempt, self.max_spawn_attempts, err
                    );
                    self.slots[slot_index].incarnation += 1;
                }
            }
        }

        error!(
            "Giving up on worker slot {} after {} spawn attempts",
            slot_index, self.max_spawn_attempts
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate_all();
    }
}
