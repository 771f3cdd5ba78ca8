#![cfg(target_os = "linux")]

use conduit::config::{EngineConfig, EngineConfigBuilder, Recycle};
use conduit::error::{Error, EvalError, ProtocolError};
use conduit::process::ProcessWorkerDef;
use conduit::{Dispatcher, Outcome, RequestId, RequestState};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::thread;
use std::time::{Duration, Instant};

fn serve(model: &str) -> ProcessWorkerDef {
    ProcessWorkerDef::new(
        env!("CARGO_BIN_EXE_conduit").into(),
        vec!["serve".into(), "--model".into(), model.into()],
    )
}

fn script(script_name: &str) -> ProcessWorkerDef {
    let script_path = format!("{}/scripts/{}", env!("CARGO_MANIFEST_DIR"), script_name);
    ProcessWorkerDef::new("sh".into(), vec![script_path.into()])
}

fn config_builder(num_concurrent: usize) -> EngineConfigBuilder {
    let mut builder = EngineConfigBuilder::new();
    builder
        .num_concurrent(num_concurrent)
        .poll_interval(Duration::from_millis(10));
    builder
}

fn make_config(num_concurrent: usize) -> EngineConfig {
    config_builder(num_concurrent).build().unwrap()
}

fn wait_for(dispatcher: &mut Dispatcher, request_id: RequestId) -> Outcome {
    while !dispatcher.is_resolved(request_id) {
        dispatcher.wait().unwrap();
    }
    dispatcher.take_outcome(request_id).unwrap()
}

fn is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[test]
fn echo_double_in_processes() {
    let mut dispatcher = Dispatcher::new(make_config(2), serve("echo-double")).unwrap();

    let outcomes = dispatcher
        .evaluate_generation((1..=5).map(|i| vec![i as f64]))
        .unwrap();

    let values: Vec<f64> = outcomes.iter().filter_map(Outcome::fitness).collect();
    assert_eq!(values, vec![2.0, 4.0, 6.0, 8.0, 10.0]);

    let stats = dispatcher.stats();
    assert!(stats.max_busy <= 2);
    assert_eq!(stats.workers_spawned, 2);
}

#[test]
fn multi_value_payloads() {
    let mut dispatcher = Dispatcher::new(make_config(1), serve("echo-double")).unwrap();

    let payload: Vec<f64> = (0..1000).map(|i| i as f64 * 0.5).collect();
    let expected: Vec<f64> = payload.iter().map(|x| x * 2.0).collect();
    let outcomes = dispatcher
        .evaluate_generation(vec![payload, vec![]])
        .unwrap();

    assert_eq!(outcomes[0], Outcome::Completed(expected));
    assert_eq!(outcomes[1], Outcome::Completed(vec![]));
}

#[test]
fn killed_worker_fails_only_its_request() {
    let mut dispatcher = Dispatcher::new(make_config(3), serve("sleep-echo")).unwrap();

    let request_ids: Vec<RequestId> = (0..3)
        .map(|_| dispatcher.submit(vec![300.0]).unwrap())
        .collect();
    assert_eq!(dispatcher.busy_count(), 3);

    let victim = dispatcher.worker_for_request(request_ids[1]).unwrap();
    let victim_pid = dispatcher.pid_of(victim).unwrap();
    assert_eq!(dispatcher.worker_for_pid(victim_pid), Some(victim));
    signal::kill(Pid::from_raw(victim_pid as i32), Signal::SIGKILL).unwrap();

    let outcomes: Vec<Outcome> = request_ids
        .iter()
        .map(|request_id| wait_for(&mut dispatcher, *request_id))
        .collect();

    assert_eq!(outcomes[0], Outcome::Completed(vec![300.0]));
    match &outcomes[1] {
        Outcome::Failed(EvalError::WorkerExited { worker_id, status }) => {
            assert_eq!(*worker_id, victim);
            assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(outcomes[2], Outcome::Completed(vec![300.0]));

    assert_eq!(dispatcher.live_workers(), 3);
    assert_eq!(dispatcher.stats().worker_failures, 1);
}

#[test]
fn shutdown_leaves_no_processes() {
    let mut dispatcher = Dispatcher::new(make_config(2), serve("sleep-echo")).unwrap();

    for _ in 0..5 {
        dispatcher.submit(vec![10_000.0]).unwrap();
    }
    let pids: Vec<u32> = dispatcher
        .busy_workers()
        .into_iter()
        .filter_map(|(worker_id, _)| dispatcher.pid_of(worker_id))
        .collect();
    assert_eq!(pids.len(), 2);
    assert!(pids.iter().all(|pid| is_alive(*pid)));

    let started = Instant::now();
    let report = dispatcher.shutdown();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.cancelled_assigned.len(), 2);
    assert_eq!(report.cancelled_pending.len(), 3);
    assert_eq!(dispatcher.stats().cancelled, 5);
    assert!(pids.iter().all(|pid| !is_alive(*pid)));
}

#[test]
fn model_error_in_process() {
    let mut dispatcher = Dispatcher::new(make_config(1), serve("reject-negative")).unwrap();

    let outcomes = dispatcher
        .evaluate_generation(vec![vec![1.0, -1.0], vec![1.0, 1.0]])
        .unwrap();

    assert!(matches!(outcomes[0], Outcome::Failed(EvalError::Model(_))));
    assert_eq!(outcomes[1], Outcome::Completed(vec![1.0, 1.0]));
    assert_eq!(dispatcher.stats().workers_spawned, 1);
}

#[test]
fn worker_exit_without_result() {
    let mut dispatcher = Dispatcher::new(make_config(1), serve("abort-on-negative")).unwrap();

    let outcomes = dispatcher
        .evaluate_generation(vec![vec![-1.0], vec![1.0]])
        .unwrap();

    match &outcomes[0] {
        Outcome::Failed(EvalError::WorkerExited { status, .. }) => {
            assert_eq!(status.code(), Some(conduit::model::ABORT_EXIT_CODE));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(outcomes[1], Outcome::Completed(vec![1.0]));
    assert_eq!(dispatcher.stats().workers_spawned, 2);
}

#[test]
fn script_exit_mid_request() {
    let config = config_builder(1)
        .respawn_failed_workers(false)
        .build()
        .unwrap();
    let mut dispatcher = Dispatcher::new(config, script("exit_worker.sh")).unwrap();

    let request_id = dispatcher.submit(vec![1.0]).unwrap();
    let err = loop {
        if let Err(err) = dispatcher.wait() {
            break err;
        }
    };

    assert!(matches!(err, Error::PoolExhausted));
    match dispatcher.take_outcome(request_id) {
        Some(Outcome::Failed(EvalError::WorkerExited { status, .. })) => {
            assert_eq!(status.code(), Some(7))
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn malformed_result_is_protocol_error() {
    let mut dispatcher = Dispatcher::new(make_config(1), script("garbage_worker.sh")).unwrap();

    let request_id = dispatcher.submit(vec![1.0]).unwrap();
    let outcome = wait_for(&mut dispatcher, request_id);

    assert!(matches!(
        outcome,
        Outcome::Failed(EvalError::Protocol {
            source: ProtocolError::UnknownStatus(7),
            ..
        })
    ));
    dispatcher.shutdown();
}

#[test]
fn nonexistent_program_exhausts_pool() {
    let launcher = ProcessWorkerDef::new("/nonexistent/conduit-worker".into(), vec![]);
    let result = Dispatcher::new(make_config(2), launcher);

    assert!(matches!(result, Err(Error::PoolExhausted)));
}

#[test]
fn kill_after_times_out_hung_evaluation() {
    let config = config_builder(1)
        .kill_after(Duration::from_millis(200))
        .build()
        .unwrap();
    let mut dispatcher = Dispatcher::new(config, serve("sleep-echo")).unwrap();

    let started = Instant::now();
    let outcomes = dispatcher
        .evaluate_generation(vec![vec![10_000.0], vec![0.0]])
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        outcomes[0],
        Outcome::Failed(EvalError::TimedOut { .. })
    ));
    assert_eq!(outcomes[1], Outcome::Completed(vec![0.0]));
    assert_eq!(dispatcher.stats().workers_spawned, 2);
}

#[test]
fn large_request_to_worker_that_never_reads() {
    let config = config_builder(1)
        .kill_after(Duration::from_millis(100))
        .build()
        .unwrap();
    let mut dispatcher = Dispatcher::new(config, script("deaf_worker.sh")).unwrap();

    // several times the capacity of a pipe buffer
    let started = Instant::now();
    let request_id = dispatcher.submit(vec![1.0; 20_000]).unwrap();

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(dispatcher.state(request_id), Some(RequestState::Assigned));

    let outcome = wait_for(&mut dispatcher, request_id);

    assert!(matches!(outcome, Outcome::Failed(EvalError::TimedOut { .. })));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn closed_output_does_not_stall_pump() {
    let mut dispatcher = Dispatcher::new(make_config(1), script("mute_worker.sh")).unwrap();

    let request_id = dispatcher.submit(vec![1.0]).unwrap();
    let started = Instant::now();
    let mut num_pumps = 0;

    while !dispatcher.is_resolved(request_id) {
        let pump_started = Instant::now();
        dispatcher.pump().unwrap();
        num_pumps += 1;

        assert!(pump_started.elapsed() < Duration::from_millis(80));
        assert!(started.elapsed() < Duration::from_secs(2));
        thread::sleep(Duration::from_millis(5));
    }

    assert!(num_pumps > 1);
    assert!(matches!(
        dispatcher.take_outcome(request_id),
        Some(Outcome::Failed(EvalError::Protocol {
            source: ProtocolError::OutputClosed,
            ..
        }))
    ));
}

#[test]
fn respawn_recycle_uses_fresh_process_per_sample() {
    let config = config_builder(1).recycle(Recycle::Respawn).build().unwrap();
    let mut dispatcher = Dispatcher::new(config, serve("echo-double")).unwrap();

    let mut pids = Vec::new();
    for i in 0..3 {
        let request_id = dispatcher.submit(vec![i as f64]).unwrap();
        let worker_id = dispatcher.worker_for_request(request_id).unwrap();
        pids.push(dispatcher.pid_of(worker_id).unwrap());
        assert_eq!(
            wait_for(&mut dispatcher, request_id),
            Outcome::Completed(vec![2.0 * i as f64])
        );
    }

    pids.dedup();
    assert_eq!(pids.len(), 3);
    assert_eq!(dispatcher.stats().workers_spawned, 4);
}

#[test]
fn environment_reaches_worker() {
    let launcher = serve("echo-double").env("RUST_LOG", "off");
    let mut dispatcher = Dispatcher::new(make_config(1), launcher).unwrap();

    let outcomes = dispatcher.evaluate_generation(vec![vec![4.0]]).unwrap();
    assert_eq!(outcomes[0], Outcome::Completed(vec![8.0]));
}
