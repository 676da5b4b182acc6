//! Data-versus-model comparison for a single parameter vector.

use crate::model::{Evaluator, ModelState};
use crate::types::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayRow {
    pub time: f64,
    pub block: BlockId,
    pub cycle: u32,
    pub detector: usize,
    pub isotope: usize,
    pub on_peak: bool,
    pub observed: f64,
    pub modeled: f64,
    pub residual: f64,
    /// One-sigma uncertainty of the modeled count.
    pub sigma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOverlay {
    pub rows: Vec<OverlayRow>,
}

impl ModelOverlay {
    pub fn new(evaluator: &Evaluator<'_>, state: &ModelState) -> Self {
        let table = evaluator.table();
        let eval = evaluator.evaluate(state);
        let rows = table
            .rows()
            .enumerate()
            .map(|(r, raw)| {
                let modeled = eval.prediction.predicted[r];
                OverlayRow {
                    time: raw.time,
                    block: raw.block,
                    cycle: raw.cycle,
                    detector: raw.detector,
                    isotope: raw.isotope,
                    on_peak: raw.on_peak,
                    observed: raw.observed,
                    modeled,
                    residual: raw.observed - modeled,
                    sigma: eval.variance[r].sqrt(),
                }
            })
            .collect();
        Self { rows }
    }
}

/// Ratio estimate of one isotope within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleRatio {
    pub isotope: usize,
    pub block: BlockId,
    pub cycle: u32,
    pub mean: f64,
    pub std_error: f64,
    pub count: usize,
}

/// Per-cycle ratios of every non-reference isotope: each on-peak reading,
/// corrected for baseline or gain, divided by the modeled reference intensity.
pub fn cycle_ratios(evaluator: &Evaluator<'_>, state: &ModelState) -> Vec<CycleRatio> {
    let table = evaluator.table();
    let forward = evaluator.forward();
    let observed = table.observed();
    let mut groups: BTreeMap<(usize, BlockId, u32), Vec<f64>> = BTreeMap::new();

    for row in 0..table.len() {
        let isotope = table.isotope_of_row(row);
        if !table.is_on_peak(row) || isotope == 0 {
            continue;
        }
        let corrected = match table.faraday_of_row(row) {
            Some(d) => observed[row] - state.baselines[d],
            None => observed[row] * state.gain,
        };
        let reference = forward.intensity_at(state, row);
        if reference == 0.0 {
            continue;
        }
        let block = table.blocks()[table.block_of_row(row)].id;
        groups
            .entry((isotope, block, table.cycle_of_row(row)))
            .or_default()
            .push(corrected / reference);
    }

    groups
        .into_iter()
        .map(|((isotope, block, cycle), values)| {
            let n = values.len();
            let mean = values.iter().sum::<f64>() / n as f64;
            let std_error = if n > 1 {
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
                (var / n as f64).sqrt()
            } else {
                0.0
            };
            CycleRatio {
                isotope,
                block,
                cycle,
                mean,
                std_error,
                count: n,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SplineConfig;
    use crate::data::{MeasurementRow, MeasurementTableBuilder};
    use crate::model::ParameterLayout;
    use crate::types::Detector;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn overlay_and_cycle_ratios_match_exact_model() {
        let mut builder = MeasurementTableBuilder::new(2)
            .detector(Detector::faraday(0))
            .detector(Detector::ion_counter(1));
        for cycle in 0..3u32 {
            let t = cycle as f64;
            builder.push(MeasurementRow::baseline(t, BlockId(5), cycle, 0, 10.0));
            builder.push(MeasurementRow::on_peak(t, BlockId(5), cycle, 0, 0, 210.0));
            builder.push(MeasurementRow::on_peak(t + 0.2, BlockId(5), cycle, 0, 1, 60.0));
            builder.push(MeasurementRow::on_peak(t + 0.4, BlockId(5), cycle, 1, 1, 100.0));
        }
        let table = builder.build().unwrap();
        let layout = ParameterLayout::new(&table, &SplineConfig::default()).unwrap();
        let evaluator = Evaluator::new(&table, &layout);
        let mut state = layout.zero_state();
        state.intensities[0].fill(200.0);
        state.log_ratios = array![0.25f64.ln()];
        state.baselines = array![10.0];
        state.gain = 0.5;
        state.detector_noise = array![2.0];
        state.global_noise = 0.0;

        let overlay = ModelOverlay::new(&evaluator, &state);
        assert_eq!(overlay.rows.len(), 12);
        let first_peak = overlay.rows[1];
        assert_abs_diff_eq!(first_peak.modeled, 210.0, epsilon = 1e-9);
        assert_abs_diff_eq!(first_peak.residual, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(first_peak.sigma, 2.0, epsilon = 1e-9);

        let ratios = cycle_ratios(&evaluator, &state);
        assert_eq!(ratios.len(), 3);
        for r in &ratios {
            assert_eq!(r.isotope, 1);
            assert_eq!(r.count, 2);
            assert_abs_diff_eq!(r.mean, 0.25, epsilon = 1e-9);
            assert_abs_diff_eq!(r.std_error, 0.0, epsilon = 1e-9);
        }
    }
}
