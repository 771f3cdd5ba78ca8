use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::Verbosity;
use conduit::algorithm::{MetropolisParams, RandomSearch};
use conduit::config::{parse_duration_str, EngineConfig, EngineConfigBuilder, Recycle};
use conduit::launch;
use conduit::model::BuiltinModel;
use conduit::process::ProcessWorkerDef;
use conduit::protocol;
use conduit::thread_worker::ThreadWorkerDef;
use conduit::worker::WorkerLauncher;
use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::{env, ffi::OsString, fs, io};

#[derive(Parser, Debug)]
#[command(author, version, about = "Evaluate samples concurrently on a pool of workers", long_about = None)]
struct Args {
    #[clap(flatten)]
    verbose: Option<Verbosity>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Act as a worker: answer request frames on stdin with a built-in model
    Serve {
        #[arg(short, long, value_enum)]
        model: BuiltinModel,
    },
    /// Evaluate a JSON array of points
    Eval {
        #[command(flatten)]
        pool: PoolArgs,

        #[arg(short, long)]
        input_file: PathBuf,
    },
    /// Minimize the first model output by random search over a box
    Optimize {
        #[command(flatten)]
        pool: PoolArgs,

        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        lower: Vec<f64>,

        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        upper: Vec<f64>,

        #[arg(short, long, default_value_t = 16)]
        batch_size: usize,

        #[arg(short, long, default_value_t = 10)]
        generations: usize,

        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Run Metropolis chains whose log-density is the first model output
    Sample {
        #[command(flatten)]
        pool: PoolArgs,

        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        start: Vec<f64>,

        #[arg(short = 'n', long, default_value_t = 4)]
        chains: usize,

        #[arg(short, long, default_value_t = 1000)]
        steps: usize,

        #[arg(long, default_value_t = 1.0)]
        proposal_sd: f64,

        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(ClapArgs, Debug)]
struct PoolArgs {
    #[arg(short = 'c', long)]
    config_file: Option<PathBuf>,

    #[arg(short = 'p', long)]
    num_parallel: Option<usize>,

    #[arg(short = 'k', long)]
    kill_after: Option<String>,

    #[arg(short, long, value_enum)]
    recycle: Option<Recycle>,

    #[arg(short, long)]
    out_file: Option<PathBuf>,

    /// Serve this built-in model from child processes of this binary
    #[arg(short, long, value_enum)]
    model: Option<BuiltinModel>,

    /// Run the built-in model on in-process threads instead of processes
    #[arg(long, requires = "model")]
    threads: bool,

    worker_program: Option<OsString>,
    worker_program_args: Vec<OsString>,
}

fn init_logger(args: &Args) {
    env_logger::Builder::new()
        .filter_level(
            args.verbose
                .as_ref()
                .map(|v| v.log_level_filter())
                .unwrap_or_else(|| log::LevelFilter::Error),
        )
        .format_module_path(false)
        .format_target(false)
        .init();
}

fn make_config(pool: &PoolArgs) -> Result<EngineConfig> {
    let mut config = match &pool.config_file {
        Some(config_file) => {
            let config_ctx = |op| format!("Unable to {} config_file: {}", op, config_file.display());
            info!("Reading config file: {}", config_file.display());
            let config_str = fs::read_to_string(config_file).with_context(|| config_ctx("read"))?;
            EngineConfig::from_yaml_str(&config_str).with_context(|| config_ctx("parse"))?
        }
        None => EngineConfigBuilder::new().build()?,
    };

    if let Some(num_parallel) = pool.num_parallel {
        config.num_concurrent = num_parallel;
    }

    if let Some(kill_after) = &pool.kill_after {
        config.kill_after = Some(
            parse_duration_str(kill_after)
                .with_context(|| format!("Unable to parse duration from value \"{}\"", kill_after))?,
        );
    }

    if let Some(recycle) = pool.recycle {
        config.recycle = recycle;
    }

    if config.num_concurrent == 0 {
        bail!("Number of parallel workers must be strictly positive");
    }

    Ok(config)
}

fn make_launcher(pool: &PoolArgs) -> Result<Box<dyn WorkerLauncher>> {
    if let Some(program) = &pool.worker_program {
        if pool.model.is_some() {
            bail!("Either a worker program or a built-in model can be given, not both");
        }
        info!("Using worker program: {:?}", program);
        return Ok(Box::new(ProcessWorkerDef::new(
            program.clone(),
            pool.worker_program_args.clone(),
        )));
    }

    let model = match pool.model {
        Some(model) => model,
        None => bail!("Either a worker program or a built-in model is required"),
    };

    if pool.threads {
        info!("Using built-in model {:?} on threads", model);
        return Ok(Box::new(ThreadWorkerDef::new(move |params: &[f64]| {
            model.evaluate(params)
        })));
    }

    let model_name = model
        .to_possible_value()
        .map(|value| value.get_name().to_string())
        .context("Built-in model has no name")?;
    let current_exe = env::current_exe().context("Unable to locate own executable")?;

    info!("Using built-in model {} in worker processes", model_name);
    Ok(Box::new(ProcessWorkerDef::new(
        current_exe.into_os_string(),
        vec!["serve".into(), "--model".into(), model_name.into()],
    )))
}

fn write_report<T: Serialize>(pool: &PoolArgs, report: &T) -> Result<()> {
    let report_json = serde_json::to_string_pretty(report).context("Unable to serialize report")?;

    if let Some(out_file) = &pool.out_file {
        info!("Writing report to output file: {}", out_file.display());
        fs::write(out_file, report_json)
            .with_context(|| format!("Unable to write output file: {}", out_file.display()))?;
    } else {
        println!("{}", report_json);
    }

    Ok(())
}

fn load_points(input_file: &Path) -> Result<Vec<Vec<f64>>> {
    let input_ctx = |op| format!("Unable to {} input_file: {}", op, input_file.display());
    let input_str = fs::read_to_string(input_file).with_context(|| input_ctx("read"))?;
    serde_json::from_str(&input_str).with_context(|| input_ctx("parse"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args);

    match args.command {
        Commands::Serve { model } => {
            let num_served = protocol::serve(io::stdin().lock(), io::stdout().lock(), |params| {
                model.evaluate(params)
            })
            .context("Worker protocol failed")?;
            info!("Served {} requests", num_served);
        }
        Commands::Eval { pool, input_file } => {
            let points = load_points(&input_file)?;
            let commands = launch::terminate_on_signal()?;
            let report = launch::eval_points(
                make_config(&pool)?,
                make_launcher(&pool)?,
                points,
                Some(commands),
            )
            .context("Evaluation run failed")?;
            write_report(&pool, &report)?;
        }
        Commands::Optimize {
            pool,
            lower,
            upper,
            batch_size,
            generations,
            seed,
        } => {
            let search = RandomSearch::new(&lower, &upper, batch_size, generations, seed)
                .context("Invalid search box")?;
            let commands = launch::terminate_on_signal()?;
            let report = launch::optimize(
                make_config(&pool)?,
                make_launcher(&pool)?,
                search,
                Some(commands),
            )
            .context("Optimization run failed")?;
            write_report(&pool, &report)?;
        }
        Commands::Sample {
            pool,
            start,
            chains,
            steps,
            proposal_sd,
            seed,
        } => {
            let params = MetropolisParams {
                num_steps: steps,
                proposal_sd,
                seed,
            };
            let commands = launch::terminate_on_signal()?;
            let report = launch::sample(
                make_config(&pool)?,
                make_launcher(&pool)?,
                vec![start; chains],
                params,
                Some(commands),
            )
            .context("Sampling run failed")?;
            write_report(&pool, &report)?;
        }
    }

    info!("Done");

    Ok(())
}
