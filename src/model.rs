use clap::ValueEnum;
use std::process;
use std::thread;
use std::time::Duration;

pub const ABORT_EXIT_CODE: i32 = 3;

/// Models that ship with the crate, served by `conduit serve` and used as
/// thread-worker models in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BuiltinModel {
    /// Returns every parameter doubled.
    EchoDouble,
    /// Sum of squares, minimal at the origin.
    Sphere,
    /// Unnormalized standard normal log-density.
    Gaussian,
    /// Sleeps for `params[0]` milliseconds, then echoes the parameters.
    SleepEcho,
    /// Reports a model error if any parameter is negative.
    RejectNegative,
    /// Exits the whole process if the first parameter is negative.
    AbortOnNegative,
}

impl BuiltinModel {
    pub fn evaluate(&self, params: &[f64]) -> Option<Vec<f64>> {
        match self {
            BuiltinModel::EchoDouble => Some(params.iter().map(|x| x * 2.0).collect()),
            BuiltinModel::Sphere => Some(vec![params.iter().map(|x| x * x).sum()]),
            BuiltinModel::Gaussian => Some(vec![-0.5 * params.iter().map(|x| x * x).sum::<f64>()]),
            BuiltinModel::SleepEcho => {
                let millis = params.first().copied().unwrap_or(0.0).max(0.0);
                thread::sleep(Duration::from_secs_f64(millis / 1000.0));
                Some(params.to_vec())
            }
            BuiltinModel::RejectNegative => {
                if params.iter().any(|x| *x < 0.0) {
                    None
                } else {
                    Some(params.to_vec())
                }
            }
            BuiltinModel::AbortOnNegative => {
                if params.first().map_or(false, |x| *x < 0.0) {
                    process::exit(ABORT_EXIT_CODE);
                }
                Some(params.to_vec())
            }
        }
    }
}
