//! Forward model: predicted detector counts for every row of the table.

use super::state::{ModelState, ParameterLayout};
use crate::basis::BsplineScratch;
use crate::data::MeasurementTable;
use ndarray::{Array1, Array2};

/// Model output for one parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Predicted count per row, baseline included.
    pub predicted: Array1<f64>,
    /// Beam signal per row without the baseline; zero on baseline rows.
    pub signal: Array1<f64>,
}

impl Prediction {
    pub fn zeros(rows: usize) -> Self {
        Self {
            predicted: Array1::zeros(rows),
            signal: Array1::zeros(rows),
        }
    }
}

/// Row kernel with the spline weights evaluated once.
///
/// `basis_start[r]` is the first knot supporting row `r` and `weights.row(r)`
/// holds the `degree + 1` basis values there. Baseline rows keep zeros.
#[derive(Debug, Clone)]
pub struct ForwardModel<'a> {
    table: &'a MeasurementTable,
    basis_start: Vec<usize>,
    weights: Array2<f64>,
}

impl<'a> ForwardModel<'a> {
    pub fn new(table: &'a MeasurementTable, layout: &ParameterLayout) -> Self {
        let n = table.len();
        let width = layout
            .bases()
            .iter()
            .map(|b| b.degree() + 1)
            .max()
            .unwrap_or(1);
        let mut basis_start = vec![0usize; n];
        let mut weights = Array2::<f64>::zeros((n, width));
        let mut scratch = BsplineScratch::new(width - 1);
        let times = table.times();

        for row in 0..n {
            if !table.is_on_peak(row) {
                continue;
            }
            let basis = &layout.bases()[table.block_of_row(row)];
            let k = basis.degree() + 1;
            let mut w = vec![0.0; k];
            basis_start[row] = basis.evaluate_into(times[row], &mut w, &mut scratch);
            for (j, v) in w.into_iter().enumerate() {
                weights[[row, j]] = v;
            }
        }

        Self {
            table,
            basis_start,
            weights,
        }
    }

    pub fn table(&self) -> &'a MeasurementTable {
        self.table
    }

    /// Beam intensity of the row's block at the row's time, in reference units.
    #[inline]
    pub fn intensity_at(&self, state: &ModelState, row: usize) -> f64 {
        let knots = &state.intensities[self.table.block_of_row(row)];
        let start = self.basis_start[row];
        self.weights
            .row(row)
            .iter()
            .enumerate()
            .filter(|&(_, &w)| w != 0.0)
            .map(|(j, &w)| w * knots[start + j])
            .sum()
    }

    pub fn predict(&self, state: &ModelState) -> Prediction {
        let mut out = Prediction::zeros(self.table.len());
        self.predict_into(state, &mut out);
        out
    }

    pub fn predict_into(&self, state: &ModelState, out: &mut Prediction) {
        let table = self.table;
        for row in 0..table.len() {
            let faraday = table.faraday_of_row(row);
            if !table.is_on_peak(row) {
                // Baseline rows only exist on Faradays.
                let baseline = faraday.map_or(0.0, |d| state.baselines[d]);
                out.signal[row] = 0.0;
                out.predicted[row] = baseline;
                continue;
            }
            let ratio = state.log_ratio_of(table.isotope_of_row(row)).exp();
            let intensity = self.intensity_at(state, row);
            match faraday {
                Some(d) => {
                    let signal = ratio * intensity;
                    out.signal[row] = signal;
                    out.predicted[row] = signal + state.baselines[d];
                }
                None => {
                    let signal = ratio / state.gain * intensity;
                    out.signal[row] = signal;
                    out.predicted[row] = signal;
                }
            }
        }
    }
}
