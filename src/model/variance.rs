//! Per-row variance of the predicted counts.

use super::forward::Prediction;
use super::state::ModelState;
use crate::data::MeasurementTable;
use ndarray::Array1;

/// Lower bound applied to every variance so a zero-noise candidate stays finite.
pub const VARIANCE_FLOOR: f64 = 1e-12;

/// Baseline rows: the detector's noise floor over its integration time.
/// On-peak rows: electronic noise squared (Faradays only) plus the global
/// noise term times the beam signal. NaN is kept as is.
pub fn row_variances_into(
    table: &MeasurementTable,
    state: &ModelState,
    prediction: &Prediction,
    out: &mut Array1<f64>,
) {
    for row in 0..table.len() {
        let v = if table.is_on_peak(row) {
            let electronic = table
                .faraday_of_row(row)
                .map_or(0.0, |d| state.detector_noise[d].powi(2));
            electronic + state.global_noise * prediction.signal[row]
        } else {
            table.detector_of_row(row).baseline_variance()
        };
        out[row] = if v < VARIANCE_FLOOR { VARIANCE_FLOOR } else { v };
    }
}

pub fn row_variances(
    table: &MeasurementTable,
    state: &ModelState,
    prediction: &Prediction,
) -> Array1<f64> {
    let mut out = Array1::zeros(table.len());
    row_variances_into(table, state, prediction, &mut out);
    out
}
