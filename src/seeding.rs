//! Rough starting model for the sampler.
//!
//! Baselines, gain and ratios come from simple averages of the raw counts. The
//! block intensities are a least-squares spline fit of the reference-equivalent
//! signal, and the noise terms are matched to the residual moments. A Laplace
//! approximation around this point gives a per-parameter variance used for
//! cold-start proposal scales and for dispersing multi-chain starts.

use crate::config::ProposalScales;
use crate::linalg::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::linalg::utils::add_ridge;
use crate::model::{Evaluator, ModelState, ParameterGroup, ParameterLayout};
use crate::proposal::FlatPriors;
use faer::Side;
use ndarray::{Array1, Array2};

const RIDGE_RELATIVE: f64 = 1e-8;

/// Starting state plus its Laplace variance, one entry per flat position.
#[derive(Debug, Clone)]
pub struct RoughStart {
    pub state: ModelState,
    pub maxlik_variance: Array1<f64>,
}

impl RoughStart {
    /// Cold-start step per flat position: the configured group scale, or the
    /// Laplace standard deviation when none is configured.
    pub fn proposal_sd(&self, layout: &ParameterLayout, scales: &ProposalScales) -> Array1<f64> {
        Array1::from_shape_fn(layout.len(), |i| {
            let fixed = match layout.slot(i).group() {
                ParameterGroup::LogRatio => scales.log_ratio,
                ParameterGroup::Intensity => scales.intensity,
                ParameterGroup::Baseline => scales.baseline,
                ParameterGroup::Gain => scales.gain,
                ParameterGroup::Noise => scales.noise,
            };
            fixed.unwrap_or_else(|| self.maxlik_variance[i].sqrt())
        })
    }
}

#[derive(Default, Clone, Copy)]
struct Moments {
    n: usize,
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    fn push(&mut self, x: f64) {
        self.n += 1;
        self.sum += x;
        self.sum_sq += x * x;
    }

    fn mean(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }

    fn sample_sd(&self) -> Option<f64> {
        if self.n < 2 {
            return None;
        }
        let mean = self.sum / self.n as f64;
        let var = (self.sum_sq - self.n as f64 * mean * mean) / (self.n as f64 - 1.0);
        Some(var.max(0.0).sqrt())
    }
}

pub fn rough_start(
    evaluator: &Evaluator<'_>,
    layout: &ParameterLayout,
    priors: &FlatPriors,
    scales: &ProposalScales,
) -> Result<RoughStart, FaerLinalgError> {
    let table = evaluator.table();
    let observed = table.observed();
    let n_faraday = table.faraday_count();
    let n_iso = table.isotope_count();
    let mut state = layout.zero_state();

    let mut baseline_moments = vec![Moments::default(); n_faraday];
    for row in 0..table.len() {
        if !table.is_on_peak(row)
            && let Some(d) = table.faraday_of_row(row)
        {
            baseline_moments[d].push(observed[row]);
        }
    }
    for (d, m) in baseline_moments.iter().enumerate() {
        state.baselines[d] = m.mean().unwrap_or(0.0);
    }

    // Per isotope: baseline-corrected Faraday mean and ion-counter mean.
    let mut faraday_iso = vec![Moments::default(); n_iso];
    let mut counter_iso = vec![Moments::default(); n_iso];
    for row in 0..table.len() {
        if !table.is_on_peak(row) {
            continue;
        }
        let iso = table.isotope_of_row(row);
        match table.faraday_of_row(row) {
            Some(d) => faraday_iso[iso].push(observed[row] - state.baselines[d]),
            None => counter_iso[iso].push(observed[row]),
        }
    }
    let gains: Vec<f64> = faraday_iso
        .iter()
        .zip(&counter_iso)
        .filter_map(|(f, c)| {
            let g = f.mean()? / c.mean()?;
            (g.is_finite() && g > 0.0).then_some(g)
        })
        .collect();
    state.gain = if gains.is_empty() {
        1.0
    } else {
        gains.iter().sum::<f64>() / gains.len() as f64
    };

    // Signal of each on-peak row expressed in Faraday units.
    let faraday_units = |row: usize, gain: f64, baselines: &Array1<f64>| -> f64 {
        match table.faraday_of_row(row) {
            Some(d) => observed[row] - baselines[d],
            None => observed[row] * gain,
        }
    };

    let n_blocks = table.blocks().len();
    let mut block_iso = vec![vec![Moments::default(); n_iso]; n_blocks];
    for row in 0..table.len() {
        if table.is_on_peak(row) {
            block_iso[table.block_of_row(row)][table.isotope_of_row(row)]
                .push(faraday_units(row, state.gain, &state.baselines));
        }
    }
    for iso in 1..n_iso {
        let logs: Vec<f64> = block_iso
            .iter()
            .filter_map(|b| {
                let r = b[iso].mean()? / b[0].mean()?;
                (r.is_finite() && r > 0.0).then(|| r.ln())
            })
            .collect();
        if !logs.is_empty() {
            state.log_ratios[iso - 1] = logs.iter().sum::<f64>() / logs.len() as f64;
        }
    }

    for (b, span) in table.blocks().iter().enumerate() {
        let rows: Vec<usize> = span.rows.clone().filter(|&r| table.is_on_peak(r)).collect();
        let times = Array1::from_iter(rows.iter().map(|&r| table.times()[r]));
        let target = Array1::from_iter(rows.iter().map(|&r| {
            let ratio = state.log_ratio_of(table.isotope_of_row(r)).exp();
            faraday_units(r, state.gain, &state.baselines) / ratio
        }));
        state.intensities[b] = least_squares_knots(&layout.bases()[b].design_matrix(times.view()), &target)?;
    }

    for (d, m) in baseline_moments.iter().enumerate() {
        let floor_sd = table
            .detectors()
            .iter()
            .filter(|det| det.is_faraday())
            .nth(d)
            .map_or(0.0, |det| det.baseline_variance().sqrt());
        state.detector_noise[d] = m.sample_sd().unwrap_or(floor_sd);
    }

    let fit = evaluator.evaluate(&state);
    let mut excess = 0.0;
    let mut signal = 0.0;
    for row in 0..table.len() {
        if !table.is_on_peak(row) {
            continue;
        }
        let r = observed[row] - fit.prediction.predicted[row];
        let electronic = table
            .faraday_of_row(row)
            .map_or(0.0, |d| state.detector_noise[d].powi(2));
        excess += r * r - electronic;
        signal += fit.prediction.signal[row].max(0.0);
    }
    state.global_noise = if signal > 0.0 {
        (excess / signal).max(0.0)
    } else {
        0.0
    };

    priors.clamp_state(layout, &mut state);
    log::debug!(
        "Rough start: gain {:.5}, log-ratios {:?}, baselines {:?}, global noise {:.4e}",
        state.gain,
        state.log_ratios.as_slice().unwrap_or(&[]),
        state.baselines.as_slice().unwrap_or(&[]),
        state.global_noise
    );

    let maxlik_variance = laplace_variance(evaluator, layout, &state, scales);
    Ok(RoughStart {
        state,
        maxlik_variance,
    })
}

/// Ridge-stabilized least squares through the normal equations.
fn least_squares_knots(design: &Array2<f64>, target: &Array1<f64>) -> Result<Array1<f64>, FaerLinalgError> {
    let gram = design.t().dot(design);
    let p = gram.nrows();
    let scale = (gram.diag().sum() / p.max(1) as f64).max(1.0);
    let gram = add_ridge(&gram, RIDGE_RELATIVE * scale);
    let rhs = design.t().dot(target);
    Ok(gram.cholesky(Side::Lower)?.solve_vec(&rhs))
}

/// `1 / -∂²ll/∂xᵢ²` by central differences, falling back to `h²` where the
/// curvature is not negative.
fn laplace_variance(
    evaluator: &Evaluator<'_>,
    layout: &ParameterLayout,
    state: &ModelState,
    scales: &ProposalScales,
) -> Array1<f64> {
    let ll0 = evaluator.log_likelihood(state);
    let mut probe = state.clone();
    Array1::from_shape_fn(layout.len(), |i| {
        let slot = layout.slot(i);
        let x = state.get(slot);
        let fixed = match slot.group() {
            ParameterGroup::LogRatio => scales.log_ratio,
            ParameterGroup::Intensity => scales.intensity,
            ParameterGroup::Baseline => scales.baseline,
            ParameterGroup::Gain => scales.gain,
            ParameterGroup::Noise => scales.noise,
        };
        let h = fixed.unwrap_or_else(|| (1e-4 * x.abs()).max(1e-6));
        probe.set(slot, x + h);
        let up = evaluator.log_likelihood(&probe);
        probe.set(slot, x - h);
        let down = evaluator.log_likelihood(&probe);
        probe.set(slot, x);
        let curvature = (up - 2.0 * ll0 + down) / (h * h);
        if curvature.is_finite() && curvature < 0.0 && ll0.is_finite() {
            -1.0 / curvature
        } else {
            h * h
        }
    })
}
