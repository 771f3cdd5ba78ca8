use crate::adapter::GenerationAlgorithm;
use crate::context::EvalHandle;
use crate::error::Error;
use crate::request::Outcome;
use log::{debug, info, trace};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use serde::Serialize;
use std::collections::BTreeMap;
use tangram_finite::FiniteF64;

#[derive(Ord, Eq, PartialEq, PartialOrd, Clone, Debug)]
struct CandidateOrderingKey {
    fitness: FiniteF64,
    id: usize,
}

/// Uniform random search over a box, minimizing the first returned value.
pub struct RandomSearch {
    bounds: Vec<Uniform<f64>>,
    batch_size: usize,
    remaining_generations: usize,
    max_kept: usize,
    candidates_evaled: BTreeMap<CandidateOrderingKey, Vec<f64>>,
    in_flight: Vec<Vec<f64>>,
    rng: StdRng,
    next_id: usize,
    num_failed: usize,
}

impl RandomSearch {
    pub fn new(
        lower: &[f64],
        upper: &[f64],
        batch_size: usize,
        num_generations: usize,
        seed: u64,
    ) -> Result<Self, Error> {
        let is_valid = !lower.is_empty()
            && lower.len() == upper.len()
            && lower
                .iter()
                .zip(upper)
                .all(|(lo, hi)| lo.is_finite() && hi.is_finite() && lo <= hi);

        if !is_valid {
            return Err(Error::InvalidBounds);
        }

        Ok(Self {
            bounds: lower
                .iter()
                .zip(upper)
                .map(|(lo, hi)| Uniform::new_inclusive(*lo, *hi))
                .collect(),
            batch_size,
            remaining_generations: num_generations,
            max_kept: batch_size.max(1),
            candidates_evaled: BTreeMap::new(),
            in_flight: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            next_id: 0,
            num_failed: 0,
        })
    }

    fn make_id(&mut self) -> usize {
        let result = self.next_id;
        self.next_id += 1;
        result
    }

    fn sample_point(&mut self) -> Vec<f64> {
        let rng = &mut self.rng;
        self.bounds.iter().map(|bound| rng.sample(bound)).collect()
    }

    fn process_candidate(&mut self, point: Vec<f64>, outcome: &Outcome) {
        let fitness = match outcome.fitness().map(FiniteF64::new) {
            Some(Ok(fitness)) => fitness,
            _ => {
                trace!("Discarding candidate without finite fitness: {:?}", outcome);
                self.num_failed += 1;
                return;
            }
        };

        let new_best = self
            .candidates_evaled
            .keys()
            .next()
            .map(|ordering_key| fitness < ordering_key.fitness)
            .unwrap_or(true);

        if new_best {
            info!("New best fitness: {}", fitness);
        }

        let id = self.make_id();
        self.candidates_evaled
            .insert(CandidateOrderingKey { fitness, id }, point);

        while self.candidates_evaled.len() > self.max_kept {
            self.candidates_evaled.pop_last();
        }
    }

    pub fn peek_best_seen_value(&self) -> Option<f64> {
        self.candidates_evaled
            .keys()
            .next()
            .map(|ordering_key| ordering_key.fitness.get())
    }

    pub fn best_seen(&self) -> Option<(f64, Vec<f64>)> {
        self.candidates_evaled
            .iter()
            .next()
            .map(|(ordering_key, point)| (ordering_key.fitness.get(), point.clone()))
    }

    pub fn num_failed(&self) -> usize {
        self.num_failed
    }
}

impl GenerationAlgorithm for RandomSearch {
    fn next_generation(&mut self) -> Option<Vec<Vec<f64>>> {
        if self.remaining_generations == 0 || self.batch_size == 0 {
            return None;
        }
        self.remaining_generations -= 1;

        self.in_flight = (0..self.batch_size).map(|_| self.sample_point()).collect();
        Some(self.in_flight.clone())
    }

    fn process_generation(&mut self, outcomes: Vec<Outcome>) {
        let points = std::mem::take(&mut self.in_flight);
        for (point, outcome) in points.into_iter().zip(&outcomes) {
            self.process_candidate(point, outcome);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetropolisParams {
    pub num_steps: usize,
    pub proposal_sd: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSummary {
    pub num_steps: usize,
    pub num_accepted: usize,
    pub num_failed: usize,
    pub acceptance_rate: f64,
    pub mean: Vec<f64>,
    pub final_state: Vec<f64>,
    pub final_log_density: f64,
    pub was_cancelled: bool,
}

/// Random-walk Metropolis chain whose target log-density is the first value
/// returned by the model. Each step is one evaluation; the chain stops early
/// if an evaluation is cancelled.
pub async fn metropolis_chain(
    handle: EvalHandle,
    start: Vec<f64>,
    params: MetropolisParams,
) -> Result<ChainSummary, Error> {
    if !(params.proposal_sd.is_finite() && params.proposal_sd > 0.0) {
        return Err(Error::InvalidProposalScale(params.proposal_sd));
    }

    let proposal = Normal::new(0.0, params.proposal_sd)
        .map_err(|_| Error::InvalidProposalScale(params.proposal_sd))?;
    let mut rng = StdRng::seed_from_u64(params.seed);

    let mut state = start;
    let mut sum = vec![0.0; state.len()];
    let mut num_steps = 0;
    let mut num_accepted = 0;
    let mut num_failed = 0;
    let mut was_cancelled = false;

    let mut log_density = match handle.evaluate(state.clone()).await {
        Outcome::Completed(values) => values.first().copied().unwrap_or(f64::NEG_INFINITY),
        Outcome::Failed(err) => {
            debug!("Initial state could not be evaluated: {}", err);
            num_failed += 1;
            f64::NEG_INFINITY
        }
        Outcome::Cancelled => {
            was_cancelled = true;
            f64::NEG_INFINITY
        }
    };

    while !was_cancelled && num_steps < params.num_steps {
        let candidate: Vec<f64> = state.iter().map(|x| x + rng.sample(proposal)).collect();

        match handle.evaluate(candidate.clone()).await {
            Outcome::Completed(values) => {
                let candidate_log_density = values.first().copied().unwrap_or(f64::NEG_INFINITY);
                let log_u: f64 = rng.gen::<f64>().ln();
                if log_u < candidate_log_density - log_density {
                    state = candidate;
                    log_density = candidate_log_density;
                    num_accepted += 1;
                }
            }
            Outcome::Failed(err) => {
                trace!("Rejecting proposal after failed evaluation: {}", err);
                num_failed += 1;
            }
            Outcome::Cancelled => {
                was_cancelled = true;
                break;
            }
        }

        num_steps += 1;
        for (acc, x) in sum.iter_mut().zip(&state) {
            *acc += x;
        }
    }

    let mean = if num_steps == 0 {
        state.clone()
    } else {
        sum.iter().map(|acc| acc / num_steps as f64).collect()
    };

    Ok(ChainSummary {
        num_steps,
        num_accepted,
        num_failed,
        acceptance_rate: if num_steps == 0 {
            0.0
        } else {
            num_accepted as f64 / num_steps as f64
        },
        mean,
        final_state: state,
        final_log_density: log_density,
        was_cancelled,
    })
}
