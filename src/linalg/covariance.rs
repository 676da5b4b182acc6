//! Sample covariance of the saved chain history and the adaptive proposal
//! covariance built from it.

use super::utils::symmetrize_in_place;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Haario scaling for random-walk proposals in `d` dimensions.
pub const ADAPTIVE_SCALE: f64 = 2.38 * 2.38;

/// Welford accumulator for the mean and covariance of flattened states.
#[derive(Debug, Clone)]
pub struct RunningCovariance {
    count: usize,
    mean: Array1<f64>,
    // Sum of outer products of deviations from the running mean.
    comoment: Array2<f64>,
}

impl RunningCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: Array1::zeros(dim),
            comoment: Array2::zeros((dim, dim)),
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> ArrayView1<'_, f64> {
        self.mean.view()
    }

    pub fn push(&mut self, x: ArrayView1<'_, f64>) {
        debug_assert_eq!(x.len(), self.dim());
        self.count += 1;
        let n = self.count as f64;
        let delta_old = &x - &self.mean;
        self.mean.scaled_add(1.0 / n, &delta_old);
        let delta_new = &x - &self.mean;
        let dim = self.dim();
        for i in 0..dim {
            let di = delta_old[i];
            if di == 0.0 {
                continue;
            }
            for j in 0..dim {
                self.comoment[[i, j]] += di * delta_new[j];
            }
        }
    }

    /// Unbiased sample covariance; `None` until two states have been pushed.
    pub fn covariance(&self) -> Option<Array2<f64>> {
        if self.count < 2 {
            return None;
        }
        let mut cov = &self.comoment / (self.count as f64 - 1.0);
        symmetrize_in_place(&mut cov);
        Some(cov)
    }
}

/// Unbiased covariance of the rows of `samples`.
pub fn sample_covariance(samples: ArrayView2<'_, f64>) -> Option<Array2<f64>> {
    let n = samples.nrows();
    if n < 2 {
        return None;
    }
    let mean = samples.mean_axis(Axis(0))?;
    let centered = &samples - &mean.insert_axis(Axis(0));
    Some(centered.t().dot(&centered) / (n as f64 - 1.0))
}

/// `β·diag(sd0²) + (1 − β)·2.38²/d·Σ`, symmetrized.
pub fn blended_proposal_covariance(
    initial_sd: ArrayView1<'_, f64>,
    covariance: &Array2<f64>,
    blend_weight: f64,
) -> Array2<f64> {
    let d = initial_sd.len();
    let scale = (1.0 - blend_weight) * ADAPTIVE_SCALE / d.max(1) as f64;
    let mut cov = covariance * scale;
    for i in 0..d {
        cov[[i, i]] += blend_weight * initial_sd[i] * initial_sd[i];
    }
    symmetrize_in_place(&mut cov);
    cov
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn welford_matches_batch_covariance() {
        let samples = array![
            [1.0, 2.0, -1.0],
            [0.5, 2.5, 0.0],
            [2.0, 1.0, 1.5],
            [1.5, 3.0, 0.2],
            [-0.3, 2.2, 0.9]
        ];
        let mut running = RunningCovariance::new(3);
        for row in samples.rows() {
            running.push(row);
        }
        let batch = sample_covariance(samples.view()).unwrap();
        let streamed = running.covariance().unwrap();
        for (a, b) in streamed.iter().zip(batch.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        let mean = samples.mean_axis(Axis(0)).unwrap();
        for (a, b) in running.mean().iter().zip(mean.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn covariance_needs_two_states() {
        let mut running = RunningCovariance::new(2);
        assert!(running.covariance().is_none());
        running.push(array![1.0, 1.0].view());
        assert!(running.covariance().is_none());
    }

    #[test]
    fn blend_weights_initial_and_history_terms() {
        let sd0 = array![2.0, 1.0];
        let history = array![[1.0, 0.5], [0.5, 4.0]];
        let c = blended_proposal_covariance(sd0.view(), &history, 0.05);
        let s = 0.95 * ADAPTIVE_SCALE / 2.0;
        assert_abs_diff_eq!(c[[0, 0]], 0.05 * 4.0 + s, epsilon = 1e-12);
        assert_abs_diff_eq!(c[[1, 1]], 0.05 * 1.0 + s * 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c[[0, 1]], s * 0.5, epsilon = 1e-12);
        assert_eq!(c[[0, 1]], c[[1, 0]]);
    }
}
