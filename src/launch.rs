use crate::adapter;
use crate::algorithm::{self, MetropolisParams, RandomSearch};
use crate::config::EngineConfig;
use crate::context::Engine;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::message::Command;
use crate::result::{BestSeen, EvalReport, OptimizeReport, SampleReport};
use crate::worker::WorkerLauncher;
use crossbeam_channel::Receiver;
use futures::future;
use log::info;

/// Installs a Ctrl-C handler that asks the run to terminate.
pub fn terminate_on_signal() -> Result<Receiver<Command>, Error> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    ctrlc::set_handler(move || {
        info!("Received signal, will terminate after cancelling outstanding evaluations");
        sender.send(Command::Terminate).ok();
    })?;
    Ok(receiver)
}

fn make_dispatcher<L>(
    config: EngineConfig,
    launcher: L,
    commands: Option<Receiver<Command>>,
) -> Result<Dispatcher, Error>
where
    L: WorkerLauncher + 'static,
{
    let mut dispatcher = Dispatcher::new(config, launcher)?;
    if let Some(commands) = commands {
        dispatcher.attach_commands(commands);
    }
    Ok(dispatcher)
}

/// Evaluates every point once; outcomes are reported in input order.
pub fn eval_points<L>(
    config: EngineConfig,
    launcher: L,
    points: Vec<Vec<f64>>,
    commands: Option<Receiver<Command>>,
) -> Result<EvalReport, Error>
where
    L: WorkerLauncher + 'static,
{
    let mut dispatcher = make_dispatcher(config, launcher, commands)?;
    info!("Evaluating {} points", points.len());

    let outcomes = dispatcher.evaluate_generation(points)?;
    dispatcher.shutdown();

    Ok(EvalReport::new(&outcomes, dispatcher.stats()))
}

pub fn optimize<L>(
    config: EngineConfig,
    launcher: L,
    mut search: RandomSearch,
    commands: Option<Receiver<Command>>,
) -> Result<OptimizeReport, Error>
where
    L: WorkerLauncher + 'static,
{
    let mut dispatcher = make_dispatcher(config, launcher, commands)?;

    let num_generations = adapter::run_generations(&mut dispatcher, &mut search)?;
    dispatcher.shutdown();

    Ok(OptimizeReport {
        best_seen: search
            .best_seen()
            .map(|(fitness, point)| BestSeen { fitness, point }),
        num_generations,
        stats: dispatcher.stats(),
    })
}

/// Runs one Metropolis chain per start point, each in its own execution
/// context, so that chains share the worker pool.
pub fn sample<L>(
    config: EngineConfig,
    launcher: L,
    starts: Vec<Vec<f64>>,
    params: MetropolisParams,
    commands: Option<Receiver<Command>>,
) -> Result<SampleReport, Error>
where
    L: WorkerLauncher + 'static,
{
    let mut engine = Engine::from_dispatcher(make_dispatcher(config, launcher, commands)?);
    info!("Running {} chains of {} steps", starts.len(), params.num_steps);

    let chains = starts
        .into_iter()
        .enumerate()
        .map(|(index, start)| {
            let chain_params = MetropolisParams {
                seed: params.seed.wrapping_add(index as u64),
                ..params
            };
            engine.spawn(algorithm::metropolis_chain(engine.handle(), start, chain_params))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let chains = engine
        .run_until_complete(future::join_all(chains))?
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    engine.shutdown();

    Ok(SampleReport {
        chains,
        stats: engine.stats(),
    })
}
