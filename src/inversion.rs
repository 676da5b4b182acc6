//! Multi-chain coordinator and the top-level entry point.

use crate::basis::BasisError;
use crate::config::{ConfigError, InversionConfig};
use crate::data::{MeasurementTable, TableError};
use crate::diagnostics::{ConvergenceDiagnostics, split_rhat_and_ess};
use crate::ensemble::{EnsembleError, EnsembleStore, EnsembleSummary};
use crate::linalg::faer_ndarray::FaerLinalgError;
use crate::model::{Evaluator, ParameterLayout};
use crate::proposal::{FlatPriors, ProposalEngine};
use crate::sampler::{Chain, ChainOutput, SamplerError, chain_seed, perturbed_start};
use crate::seeding::{RoughStart, rough_start};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use thiserror::Error;

/// Errors that stop a run before or after the chains execute.
#[derive(Error, Debug)]
pub enum InversionError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Basis(#[from] BasisError),

    #[error("Rough start could not be computed: {0}")]
    Seeding(#[from] FaerLinalgError),

    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
}

/// A chain that stopped on a numerical failure.
#[derive(Error, Debug)]
#[error("Chain {chain} (seed {seed}) failed: {error}")]
pub struct ChainFailure {
    pub chain: usize,
    pub seed: u64,
    #[source]
    pub error: SamplerError,
}

#[derive(Debug)]
pub struct InversionOutput {
    /// Outcome of each chain, in chain order.
    pub chains: Vec<Result<ChainOutput, ChainFailure>>,
    pub rough_start: RoughStart,
    /// Statistics over the post-burn-in records of all successful chains;
    /// `None` when every chain failed.
    pub summary: Option<EnsembleSummary>,
    /// `None` when every chain failed or too few models were kept.
    pub diagnostics: Option<ConvergenceDiagnostics>,
}

impl InversionOutput {
    pub fn successful(&self) -> impl Iterator<Item = &ChainOutput> {
        self.chains.iter().filter_map(|c| c.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChainFailure> {
        self.chains.iter().filter_map(|c| c.as_ref().err())
    }

    /// Successful chain whose best visited state has the smallest weighted
    /// misfit. Its `best_state` is the default model for overlays.
    pub fn best_fit(&self) -> Option<&ChainOutput> {
        self.successful().min_by(|a, b| a.best_misfit.total_cmp(&b.best_misfit))
    }
}

/// Validates the configuration, seeds a starting model and runs every chain
/// on the rayon pool.
pub fn run_inversion(
    table: &MeasurementTable,
    config: &InversionConfig,
) -> Result<InversionOutput, InversionError> {
    config.validate(table)?;
    let layout = ParameterLayout::new(table, &config.spline)?;
    let priors = FlatPriors::resolve(&layout, table, &config.priors);
    let evaluator = Evaluator::new(table, &layout);
    let start = rough_start(&evaluator, &layout, &priors, &config.proposal_scales)?;
    let initial_sd = start.proposal_sd(&layout, &config.proposal_scales);

    log::info!(
        "Starting {} chain(s) of {} trials over {} rows and {} parameters",
        config.chain_count,
        config.trial_count,
        table.len(),
        layout.len()
    );

    let chains: Vec<Result<ChainOutput, ChainFailure>> = (0..config.chain_count)
        .into_par_iter()
        .map(|chain| {
            let seed = chain_seed(config.seed, chain);
            run_chain(
                &evaluator,
                &layout,
                config,
                &priors,
                &start,
                &initial_sd,
                chain,
                seed,
            )
            .map_err(|error| ChainFailure { chain, seed, error })
        })
        .collect();

    for failure in chains.iter().filter_map(|c| c.as_ref().err()) {
        log::warn!("{failure}");
    }

    let outputs: Vec<&ChainOutput> = chains.iter().filter_map(|c| c.as_ref().ok()).collect();
    let (summary, diagnostics) = if outputs.is_empty() {
        (None, None)
    } else {
        let merged = EnsembleStore::merged(outputs.iter().map(|o| &o.store), config.burn_in)?;
        let samples = outputs
            .iter()
            .map(|o| o.store.flat_samples(config.burn_in))
            .collect::<Result<Vec<_>, _>>()?;
        (Some(merged.summarize(0)?), split_rhat_and_ess(&samples))
    };

    Ok(InversionOutput {
        chains,
        rough_start: start,
        summary,
        diagnostics,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_chain(
    evaluator: &Evaluator<'_>,
    layout: &ParameterLayout,
    config: &InversionConfig,
    priors: &FlatPriors,
    start: &RoughStart,
    initial_sd: &Array1<f64>,
    chain: usize,
    seed: u64,
) -> Result<ChainOutput, SamplerError> {
    let state = if config.chain_count > 1 {
        let mut rng = StdRng::seed_from_u64(!seed);
        perturbed_start(
            layout,
            &start.state,
            start.maxlik_variance.view(),
            priors,
            config.perturbation_scale,
            &mut rng,
        )
    } else {
        start.state.clone()
    };
    let engine = ProposalEngine::new(
        layout,
        priors.clone(),
        initial_sd.clone(),
        config.adaptation.joint_fraction,
    );
    log::info!("Chain {chain} starting with seed {seed}");
    let output = Chain::new(evaluator, layout, config, engine, state, chain, seed)?.run()?;
    log::info!(
        "Chain {} finished: acceptance {:.3}, {} covariance refreshes, final log-likelihood {:.4}",
        chain,
        output.acceptance.acceptance_rate(),
        output.adaptations,
        output.final_log_likelihood
    );
    Ok(output)
}
