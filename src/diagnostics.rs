//! Split-chain convergence diagnostics over post-burn-in samples.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

const RHAT_THRESHOLD: f64 = 1.1;
const MIN_ESS: f64 = 100.0;
const MAX_AUTOCORRELATION_LAG: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceDiagnostics {
    /// Potential scale reduction per parameter.
    pub rhat: Array1<f64>,
    /// Effective sample size per parameter.
    pub ess: Array1<f64>,
    pub max_rhat: f64,
    pub min_ess: f64,
    pub converged: bool,
}

/// Splits every chain in half and computes R-hat and ESS per column.
///
/// Each chain is a `samples × parameters` matrix. Chains are truncated to the
/// shortest one. Returns `None` when fewer than four samples per chain are
/// available or the chains disagree on the parameter count.
pub fn split_rhat_and_ess(chains: &[Array2<f64>]) -> Option<ConvergenceDiagnostics> {
    let dim = chains.first()?.ncols();
    if chains.iter().any(|c| c.ncols() != dim) {
        return None;
    }
    let n = chains.iter().map(|c| c.nrows()).min()?;
    if n < 4 {
        return None;
    }
    let half = n / 2;

    let mut rhat = Array1::<f64>::ones(dim);
    let mut ess = Array1::<f64>::zeros(dim);
    for d in 0..dim {
        let halves: Vec<ArrayView1<'_, f64>> = chains
            .iter()
            .flat_map(|c| {
                let col = c.column(d);
                [
                    col.slice_move(ndarray::s![..half]),
                    col.slice_move(ndarray::s![half..2 * half]),
                ]
            })
            .collect();
        rhat[d] = split_rhat(&halves);
        ess[d] = split_ess(&halves);
    }

    let max_rhat = rhat.iter().copied().fold(1.0f64, f64::max);
    let min_ess = ess.iter().copied().fold(f64::INFINITY, f64::min);
    Some(ConvergenceDiagnostics {
        converged: max_rhat < RHAT_THRESHOLD && min_ess > MIN_ESS,
        rhat,
        ess,
        max_rhat,
        min_ess,
    })
}

fn split_rhat(halves: &[ArrayView1<'_, f64>]) -> f64 {
    let m = halves.len();
    let n = halves[0].len();
    let means: Vec<f64> = halves.iter().map(|h| h.mean().unwrap_or(0.0)).collect();
    let vars: Vec<f64> = halves
        .iter()
        .map(|h| h.var_axis(Axis(0), 1.0).into_scalar())
        .collect();

    let w = vars.iter().sum::<f64>() / m as f64;
    let overall = means.iter().sum::<f64>() / m as f64;
    let b = means.iter().map(|mu| (mu - overall).powi(2)).sum::<f64>() * n as f64
        / (m - 1) as f64;
    let var_hat = (n as f64 - 1.0) / n as f64 * w + b / n as f64;
    if w > 1e-10 {
        (var_hat / w).sqrt()
    } else {
        1.0
    }
}

/// ESS with Geyer's initial positive sequence truncation.
fn split_ess(halves: &[ArrayView1<'_, f64>]) -> f64 {
    let m = halves.len();
    let n = halves[0].len();
    let total = (m * n) as f64;

    let means: Vec<f64> = halves.iter().map(|h| h.mean().unwrap_or(0.0)).collect();
    let gamma0: Vec<f64> = halves
        .iter()
        .zip(&means)
        .map(|(h, &mu)| (h.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / n as f64).max(1e-16))
        .collect();

    let autocorrelation = |lag: usize| -> f64 {
        let mut rho = 0.0;
        for ((h, &mu), &g0) in halves.iter().zip(&means).zip(&gamma0) {
            let cov = (0..n - lag)
                .map(|t| (h[t] - mu) * (h[t + lag] - mu))
                .sum::<f64>()
                / (n - lag) as f64;
            rho += cov / g0;
        }
        rho / m as f64
    };

    let max_lag = (n - 1).min(MAX_AUTOCORRELATION_LAG);
    let mut tau = 1.0;
    let mut lag = 1;
    while lag < max_lag {
        let pair = autocorrelation(lag) + autocorrelation(lag + 1);
        if !pair.is_finite() || pair <= 0.0 {
            break;
        }
        tau += 2.0 * pair;
        lag += 2;
    }
    if !tau.is_finite() || tau <= 0.0 {
        return 1.0;
    }
    (total / tau).clamp(1.0, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn iid_chain(seed: u64, mean: f64, n: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(mean, 1.0).unwrap();
        Array2::from_shape_fn((n, 2), |_| normal.sample(&mut rng))
    }

    #[test]
    fn well_mixed_chains_converge() {
        let chains = vec![iid_chain(1, 0.0, 1000), iid_chain(2, 0.0, 1000)];
        let diag = split_rhat_and_ess(&chains).unwrap();
        assert!(diag.max_rhat < 1.05, "rhat {}", diag.max_rhat);
        assert!(diag.min_ess > 500.0, "ess {}", diag.min_ess);
        assert!(diag.converged);
    }

    #[test]
    fn separated_chains_are_flagged() {
        let chains = vec![iid_chain(1, 0.0, 500), iid_chain(2, 5.0, 500)];
        let diag = split_rhat_and_ess(&chains).unwrap();
        assert!(diag.max_rhat > 1.5);
        assert!(!diag.converged);
    }

    #[test]
    fn single_chain_drift_is_detected_by_splitting() {
        let drift = Array2::from_shape_fn((400, 1), |(i, _)| i as f64);
        let diag = split_rhat_and_ess(&[drift]).unwrap();
        assert!(diag.max_rhat > 1.5);
    }

    #[test]
    fn too_short_chains_yield_nothing() {
        assert!(split_rhat_and_ess(&[Array2::zeros((3, 2))]).is_none());
        assert!(split_rhat_and_ess(&[]).is_none());
    }
}
