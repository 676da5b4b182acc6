//! Gaussian log-likelihood of the observed counts.

use crate::linalg::utils::KahanSum;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodEvaluation {
    pub log_likelihood: f64,
    /// Σ r²/σ²
    pub weighted_misfit: f64,
    /// Σ r²
    pub unweighted_misfit: f64,
}

/// `-½ Σ r²/v − ½ Σ ln v` together with both misfit sums, in one pass.
pub fn log_likelihood(
    observed: ArrayView1<'_, f64>,
    predicted: ArrayView1<'_, f64>,
    variance: ArrayView1<'_, f64>,
) -> LikelihoodEvaluation {
    let mut weighted = KahanSum::default();
    let mut unweighted = KahanSum::default();
    let mut log_det = KahanSum::default();
    for ((&y, &mu), &v) in observed.iter().zip(predicted.iter()).zip(variance.iter()) {
        let r = y - mu;
        let r2 = r * r;
        unweighted.add(r2);
        weighted.add(r2 / v);
        log_det.add(v.ln());
    }
    let weighted_misfit = weighted.sum();
    LikelihoodEvaluation {
        log_likelihood: -0.5 * weighted_misfit - 0.5 * log_det.sum(),
        weighted_misfit,
        unweighted_misfit: unweighted.sum(),
    }
}
