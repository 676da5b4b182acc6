//! Single-chain Metropolis-Hastings sampler with adaptive covariance.

use crate::config::InversionConfig;
use crate::ensemble::{EnsembleRecord, EnsembleStore};
use crate::linalg::covariance::RunningCovariance;
use crate::linalg::faer_ndarray::FaerLinalgError;
use crate::model::{Evaluation, Evaluator, ModelState, ParameterLayout};
use crate::proposal::{AcceptanceCounters, FlatPriors, Proposal, ProposalEngine};
use ndarray::ArrayView1;
use rand::rngs::StdRng;
use rand::{Rng, RngExt, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Log-likelihood became non-finite ({value}) at iteration {iteration}.")]
    NonFiniteLikelihood { iteration: usize, value: f64 },

    #[error("Adaptive proposal covariance is not positive definite at iteration {iteration}: {source}")]
    CovarianceNotPositiveDefinite {
        iteration: usize,
        #[source]
        source: FaerLinalgError,
    },
}

impl SamplerError {
    pub fn iteration(&self) -> usize {
        match self {
            SamplerError::NonFiniteLikelihood { iteration, .. }
            | SamplerError::CovarianceNotPositiveDefinite { iteration, .. } => *iteration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerPhase {
    Initializing,
    Sampling,
    Terminated,
}

/// Metropolis rule with a pre-drawn uniform `u` in `[0, 1)`.
#[inline]
pub fn metropolis_accept(delta: f64, u: f64) -> bool {
    delta >= 0.0 || u < delta.exp()
}

/// Derives the seed of chain `chain` from the run seed.
pub fn chain_seed(seed: u64, chain: usize) -> u64 {
    seed ^ 0x9E37_79B9_7F4A_7C15u64.wrapping_mul(chain as u64 + 1)
}

/// `start + scale · N(0, 1) · sqrt(variance)` per scalar, clamped into the priors.
pub fn perturbed_start<R: Rng + ?Sized>(
    layout: &ParameterLayout,
    start: &ModelState,
    maxlik_variance: ArrayView1<'_, f64>,
    priors: &FlatPriors,
    scale: f64,
    rng: &mut R,
) -> ModelState {
    let mut flat = layout.flatten(start);
    for (i, v) in flat.iter_mut().enumerate() {
        let z: f64 = StandardNormal.sample(rng);
        let sd = maxlik_variance[i].max(0.0).sqrt();
        if sd.is_finite() {
            *v += scale * z * sd;
        }
    }
    priors.clamp_flat(&mut flat);
    layout.unflatten(flat.view())
}

/// Everything a terminated chain hands back.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain: usize,
    pub seed: u64,
    pub store: EnsembleStore,
    /// Current state at termination, i.e. the last accepted model.
    pub final_state: ModelState,
    pub final_log_likelihood: f64,
    /// Visited state with the smallest weighted misfit.
    pub best_state: ModelState,
    pub best_misfit: f64,
    /// Iteration of the last accepted move; `None` if nothing was accepted.
    pub last_accepted_iteration: Option<usize>,
    pub acceptance: AcceptanceCounters,
    /// Number of adaptive covariance refreshes.
    pub adaptations: usize,
}

/// One Markov chain. Owns its state, proposal scales, RNG and store.
pub struct Chain<'a> {
    evaluator: &'a Evaluator<'a>,
    layout: &'a ParameterLayout,
    config: &'a InversionConfig,
    chain: usize,
    seed: u64,
    rng: StdRng,
    phase: SamplerPhase,
    engine: ProposalEngine,
    current: ModelState,
    current_eval: Evaluation,
    candidate: ModelState,
    candidate_eval: Evaluation,
    best_state: ModelState,
    best_misfit: f64,
    history: RunningCovariance,
    store: EnsembleStore,
    iteration: usize,
    last_accepted_iteration: Option<usize>,
    adaptations: usize,
}

impl<'a> Chain<'a> {
    pub fn new(
        evaluator: &'a Evaluator<'a>,
        layout: &'a ParameterLayout,
        config: &'a InversionConfig,
        engine: ProposalEngine,
        start: ModelState,
        chain: usize,
        seed: u64,
    ) -> Result<Self, SamplerError> {
        let current_eval = evaluator.evaluate(&start);
        let ll = current_eval.log_likelihood();
        if !ll.is_finite() {
            return Err(SamplerError::NonFiniteLikelihood {
                iteration: 0,
                value: ll,
            });
        }
        Ok(Self {
            candidate: start.clone(),
            candidate_eval: current_eval.clone(),
            best_state: start.clone(),
            best_misfit: current_eval.score.weighted_misfit,
            evaluator,
            layout,
            config,
            chain,
            seed,
            rng: StdRng::seed_from_u64(seed),
            phase: SamplerPhase::Initializing,
            engine,
            current: start,
            current_eval,
            history: RunningCovariance::new(layout.len()),
            store: EnsembleStore::with_capacity(config.saved_per_chain()),
            iteration: 0,
            last_accepted_iteration: None,
            adaptations: 0,
        })
    }

    pub fn phase(&self) -> SamplerPhase {
        self.phase
    }

    pub fn current(&self) -> &ModelState {
        &self.current
    }

    pub fn current_log_likelihood(&self) -> f64 {
        self.current_eval.log_likelihood()
    }

    pub fn store(&self) -> &EnsembleStore {
        &self.store
    }

    pub fn best_misfit(&self) -> f64 {
        self.best_misfit
    }

    /// Performs one Metropolis-Hastings iteration. Returns whether the
    /// candidate was accepted.
    pub fn step(&mut self) -> Result<bool, SamplerError> {
        if self.phase == SamplerPhase::Initializing {
            self.phase = SamplerPhase::Sampling;
        }
        self.iteration += 1;
        let iteration = self.iteration;

        self.candidate.assign_from(&self.current);
        let proposal = self.engine.propose(
            self.layout,
            &self.current,
            &mut self.candidate,
            &mut self.rng,
        );
        let accepted = match proposal {
            Proposal::OutOfPrior(_) => false,
            Proposal::Ready(_) => {
                self.evaluator.evaluate_into(&self.candidate, &mut self.candidate_eval);
                let ll = self.candidate_eval.log_likelihood();
                if !ll.is_finite() {
                    return Err(SamplerError::NonFiniteLikelihood {
                        iteration,
                        value: ll,
                    });
                }
                let delta = ll - self.current_eval.log_likelihood();
                let u = self.rng.random::<f64>();
                if metropolis_accept(delta, u) {
                    std::mem::swap(&mut self.current, &mut self.candidate);
                    std::mem::swap(&mut self.current_eval, &mut self.candidate_eval);
                    self.last_accepted_iteration = Some(iteration);
                    let misfit = self.current_eval.score.weighted_misfit;
                    if misfit < self.best_misfit {
                        self.best_misfit = misfit;
                        self.best_state.assign_from(&self.current);
                    }
                    true
                } else {
                    false
                }
            }
        };
        self.engine.record(proposal.kind(), accepted);

        if iteration % self.config.thinning == 0 {
            self.save(iteration)?;
        }
        Ok(accepted)
    }

    fn save(&mut self, iteration: usize) -> Result<(), SamplerError> {
        self.store.push(EnsembleRecord::capture(
            iteration,
            &self.current,
            self.evaluator.table(),
            &self.current_eval.score,
        ));
        self.history.push(self.layout.flatten(&self.current).view());

        let adaptation = &self.config.adaptation;
        let saved = self.store.len();
        if saved < adaptation.start_after_saves
            || (saved - adaptation.start_after_saves) % adaptation.refresh_interval != 0
        {
            return Ok(());
        }
        let Some(covariance) = self.history.covariance() else {
            return Ok(());
        };
        self.engine
            .adapt(&covariance, adaptation.blend_weight)
            .map_err(|source| SamplerError::CovarianceNotPositiveDefinite { iteration, source })?;
        self.adaptations += 1;
        log::debug!(
            "Chain {}: adaptive covariance refreshed at iteration {} from {} saved models",
            self.chain,
            iteration,
            saved
        );
        Ok(())
    }

    /// Runs the configured number of iterations and hands back the results.
    pub fn run(mut self) -> Result<ChainOutput, SamplerError> {
        while self.iteration < self.config.trial_count {
            self.step()?;
        }
        self.phase = SamplerPhase::Terminated;
        Ok(self.into_output())
    }

    fn into_output(self) -> ChainOutput {
        ChainOutput {
            chain: self.chain,
            seed: self.seed,
            store: self.store,
            final_log_likelihood: self.current_eval.log_likelihood(),
            final_state: self.current,
            best_state: self.best_state,
            best_misfit: self.best_misfit,
            last_accepted_iteration: self.last_accepted_iteration,
            acceptance: self.engine.counters().clone(),
            adaptations: self.adaptations,
        }
    }
}
