//! Execution contexts: sequential algorithm code that awaits evaluations.
//!
//! Every context is a future on a single-threaded local executor. Awaiting an
//! evaluation parks the context in the dispatcher's scheduling table; the
//! engine loop resumes it once the worker result arrives. Only one context
//! runs at a time, so contexts never need locks among themselves.

use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, ShutdownReport, Suspension};
use crate::error::Error;
use crate::message::Command;
use crate::request::{Outcome, RequestId};
use crate::result::EngineStats;
use crate::worker::WorkerLauncher;
use crossbeam_channel::Receiver;
use futures::executor::LocalPool;
use futures::future::{self, RemoteHandle};
use futures::task::LocalSpawnExt;
use futures::FutureExt;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

/// Algorithm-side handle to the dispatcher, cheap to clone into contexts.
#[derive(Clone)]
pub struct EvalHandle {
    dispatcher: Rc<RefCell<Dispatcher>>,
}

impl EvalHandle {
    pub fn submit(&self, payload: Vec<f64>) -> Result<RequestId, Error> {
        self.dispatcher.borrow_mut().submit(payload)
    }

    /// Parks the calling context until `request_id` reaches a terminal state.
    pub async fn suspend_until_result(&self, request_id: RequestId) -> Outcome {
        let suspension = self.dispatcher.borrow_mut().suspend(request_id);
        match suspension {
            Suspension::Ready(outcome) => outcome,
            Suspension::Waiting(receiver) => receiver.await.unwrap_or(Outcome::Cancelled),
        }
    }

    pub async fn evaluate(&self, payload: Vec<f64>) -> Outcome {
        match self.submit(payload) {
            Ok(request_id) => self.suspend_until_result(request_id).await,
            Err(_) => Outcome::Cancelled,
        }
    }

    /// Submits all points before waiting, so they are evaluated concurrently.
    /// Outcomes come back in submission order.
    pub async fn evaluate_all(&self, payloads: Vec<Vec<f64>>) -> Vec<Outcome> {
        let request_ids: Vec<Result<RequestId, Error>> =
            payloads.into_iter().map(|payload| self.submit(payload)).collect();

        future::join_all(request_ids.into_iter().map(|request_id| async move {
            match request_id {
                Ok(request_id) => self.suspend_until_result(request_id).await,
                Err(_) => Outcome::Cancelled,
            }
        }))
        .await
    }
}

pub struct Engine {
    dispatcher: Rc<RefCell<Dispatcher>>,
    executor: LocalPool,
}

impl Engine {
    pub fn new<L>(config: EngineConfig, launcher: L) -> Result<Self, Error>
    where
        L: WorkerLauncher + 'static,
    {
        Ok(Self::from_dispatcher(Dispatcher::new(config, launcher)?))
    }

    pub fn from_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Rc::new(RefCell::new(dispatcher)),
            executor: LocalPool::new(),
        }
    }

    pub fn handle(&self) -> EvalHandle {
        EvalHandle {
            dispatcher: self.dispatcher.clone(),
        }
    }

    pub fn attach_commands(&self, commands: Receiver<Command>) {
        self.dispatcher.borrow_mut().attach_commands(commands);
    }

    /// Starts a new execution context. It first runs on the next `pump` or
    /// `run_until_complete`.
    pub fn spawn<F>(&self, context: F) -> Result<RemoteHandle<F::Output>, Error>
    where
        F: Future + 'static,
    {
        Ok(self.executor.spawner().spawn_local_with_handle(context)?)
    }

    /// Runs ready contexts, pumps the dispatcher once and runs the contexts
    /// it resumed.
    pub fn pump(&mut self) -> Result<usize, Error> {
        self.executor.run_until_stalled();
        let num_resolved = self.dispatcher.borrow_mut().pump()?;
        self.executor.run_until_stalled();
        Ok(num_resolved)
    }

    /// Drives contexts and workers until `future` completes.
    pub fn run_until_complete<F>(&mut self, future: F) -> Result<F::Output, Error>
    where
        F: Future + 'static,
    {
        let mut handle = self.spawn(future)?;

        loop {
            self.executor.run_until_stalled();

            if let Some(output) = (&mut handle).now_or_never() {
                return Ok(output);
            }

            if self.dispatcher.borrow().num_outstanding() == 0 {
                return Err(Error::Stalled);
            }

            self.dispatcher.borrow_mut().wait()?;
        }
    }

    pub fn shutdown(&mut self) -> ShutdownReport {
        let report = self.dispatcher.borrow_mut().shutdown();
        self.executor.run_until_stalled();
        report
    }

    pub fn stats(&self) -> EngineStats {
        self.dispatcher.borrow().stats()
    }

    pub fn busy_count(&self) -> usize {
        self.dispatcher.borrow().busy_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfigBuilder;
    use crate::error::EvalError;
    use crate::testutil::{ScriptHandle, ScriptedLauncher};
    use std::cell::Cell;

    fn make_engine(num_concurrent: usize) -> (Engine, ScriptHandle) {
        let launcher = ScriptedLauncher::new();
        let script = launcher.script();
        let config = EngineConfigBuilder::new()
            .num_concurrent(num_concurrent)
            .build()
            .unwrap();
        (Engine::new(config, launcher).unwrap(), script)
    }

    #[test]
    fn context_resumes_after_its_evaluation() {
        let (mut engine, script) = make_engine(1);
        let handle = engine.handle();
        let progress = Rc::new(Cell::new(0));

        let context_progress = progress.clone();
        let result = engine
            .spawn(async move {
                context_progress.set(1);
                let outcome = handle.evaluate(vec![3.0]).await;
                context_progress.set(2);
                outcome
            })
            .unwrap();

        engine.pump().unwrap();
        assert_eq!(progress.get(), 1);
        assert_eq!(engine.busy_count(), 1);

        engine.pump().unwrap();
        assert_eq!(progress.get(), 1);

        script.complete(RequestId(0), vec![9.0]);
        engine.pump().unwrap();
        assert_eq!(progress.get(), 2);
        assert_eq!(result.now_or_never(), Some(Outcome::Completed(vec![9.0])));
    }

    #[test]
    fn contexts_resume_in_completion_order() {
        let (mut engine, script) = make_engine(3);
        let resumed = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let handle = engine.handle();
            let resumed = resumed.clone();
            engine
                .spawn(async move {
                    handle.evaluate(vec![i as f64]).await;
                    resumed.borrow_mut().push(i);
                })
                .unwrap()
                .forget();
        }

        engine.pump().unwrap();
        script.complete(RequestId(2), vec![0.0]);
        engine.pump().unwrap();
        script.complete(RequestId(0), vec![0.0]);
        engine.pump().unwrap();
        script.complete(RequestId(1), vec![0.0]);
        engine.pump().unwrap();

        assert_eq!(*resumed.borrow(), vec![2, 0, 1]);
    }

    #[test]
    fn run_until_complete_drives_batch() {
        let (mut engine, script) = make_engine(2);
        script.auto_double();
        let handle = engine.handle();

        let outcomes = engine
            .run_until_complete(async move {
                handle
                    .evaluate_all((1..=5).map(|i| vec![i as f64]).collect())
                    .await
            })
            .unwrap();

        let values: Vec<f64> = outcomes.iter().filter_map(Outcome::fitness).collect();
        assert_eq!(values, vec![2.0, 4.0, 6.0, 8.0, 10.0]);
        assert!(engine.stats().max_busy <= 2);
    }

    #[test]
    fn shutdown_resumes_waiting_contexts_with_cancellation() {
        let (mut engine, _script) = make_engine(1);
        let handle = engine.handle();

        let first_handle = handle.clone();
        let first = engine
            .spawn(async move { first_handle.evaluate(vec![1.0]).await })
            .unwrap();
        let second = engine
            .spawn(async move { handle.evaluate(vec![2.0]).await })
            .unwrap();
        engine.pump().unwrap();

        let report = engine.shutdown();
        assert_eq!(report.cancelled_assigned.len(), 1);
        assert_eq!(report.cancelled_pending.len(), 1);
        assert_eq!(first.now_or_never(), Some(Outcome::Cancelled));
        assert_eq!(second.now_or_never(), Some(Outcome::Cancelled));
    }

    #[test]
    fn waiting_on_unknown_request() {
        let (mut engine, _script) = make_engine(1);
        let handle = engine.handle();

        let outcome = engine
            .run_until_complete(async move { handle.suspend_until_result(RequestId(42)).await })
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Failed(EvalError::UnknownRequest(RequestId(42)))
        );
    }

    #[test]
    fn stalled_contexts_are_reported() {
        let (mut engine, _script) = make_engine(1);
        let (_sender, receiver) = futures::channel::oneshot::channel::<()>();

        let result = engine.run_until_complete(receiver);
        assert!(matches!(result, Err(Error::Stalled)));
    }
}
