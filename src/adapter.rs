use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::request::Outcome;
use log::{debug, info};

/// Batch-style algorithm: proposes a generation of points, then digests all of
/// their outcomes at once.
pub trait GenerationAlgorithm {
    /// Next batch of points to evaluate, or `None` once the algorithm is done.
    fn next_generation(&mut self) -> Option<Vec<Vec<f64>>>;

    /// Outcomes of the last generation, in the order its points were proposed.
    fn process_generation(&mut self, outcomes: Vec<Outcome>);
}

/// Drives `algorithm` until it stops proposing points or the dispatcher is
/// shut down. Returns the number of generations processed.
pub fn run_generations<A>(dispatcher: &mut Dispatcher, algorithm: &mut A) -> Result<usize, Error>
where
    A: GenerationAlgorithm + ?Sized,
{
    let mut num_generations = 0;

    while !dispatcher.is_shut_down() {
        let generation = match algorithm.next_generation() {
            Some(generation) => generation,
            None => break,
        };

        debug!(
            "Evaluating generation {} with {} points",
            num_generations,
            generation.len()
        );

        let outcomes = dispatcher.evaluate_generation(generation)?;
        algorithm.process_generation(outcomes);
        num_generations += 1;
    }

    info!("Processed {} generations", num_generations);
    Ok(num_generations)
}
