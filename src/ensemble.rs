//! Saved models of a chain and the posterior statistics computed from them.

use crate::data::MeasurementTable;
use crate::model::{LikelihoodEvaluation, ModelState};
use crate::types::BlockId;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnsembleError {
    #[error("Burn-in of {burn_in} discards every one of the {records} saved models.")]
    BurnInExceedsEnsemble { burn_in: usize, records: usize },

    #[error("The ensemble holds no saved models.")]
    Empty,

    #[error("Saved models have different parameter counts and cannot be stacked into one matrix.")]
    HeterogeneousRecords,
}

/// Snapshot of the chain state at one save point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleRecord {
    /// Sampler iteration at which the model was saved.
    pub iteration: usize,
    pub log_ratios: Array1<f64>,
    pub intensities: BTreeMap<BlockId, Array1<f64>>,
    pub baselines: Array1<f64>,
    pub gain: f64,
    /// Detector noise terms followed by the global noise term.
    pub noise: Array1<f64>,
    pub weighted_misfit: f64,
    pub unweighted_misfit: f64,
    pub log_likelihood: f64,
}

impl EnsembleRecord {
    pub fn capture(
        iteration: usize,
        state: &ModelState,
        table: &MeasurementTable,
        score: &LikelihoodEvaluation,
    ) -> Self {
        let intensities = table
            .blocks()
            .iter()
            .zip(&state.intensities)
            .map(|(span, knots)| (span.id, knots.clone()))
            .collect();
        let mut noise = Vec::with_capacity(state.detector_noise.len() + 1);
        noise.extend(state.detector_noise.iter().copied());
        noise.push(state.global_noise);
        Self {
            iteration,
            log_ratios: state.log_ratios.clone(),
            intensities,
            baselines: state.baselines.clone(),
            gain: state.gain,
            noise: Array1::from_vec(noise),
            weighted_misfit: score.weighted_misfit,
            unweighted_misfit: score.unweighted_misfit,
            log_likelihood: score.log_likelihood,
        }
    }

    pub fn detector_noise(&self) -> &[f64] {
        let n = self.noise.len();
        &self.noise.as_slice().unwrap_or(&[])[..n.saturating_sub(1)]
    }

    pub fn global_noise(&self) -> f64 {
        self.noise.last().copied().unwrap_or(f64::NAN)
    }

    /// Parameters in layout order: log-ratios, knots by block id, baselines,
    /// gain, noise.
    pub fn flatten(&self) -> Vec<f64> {
        let mut out = Vec::new();
        out.extend(self.log_ratios.iter().copied());
        for knots in self.intensities.values() {
            out.extend(knots.iter().copied());
        }
        out.extend(self.baselines.iter().copied());
        out.push(self.gain);
        out.extend(self.noise.iter().copied());
        out
    }
}

/// Posterior statistics of one scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub mean: f64,
    pub std_dev: f64,
    /// 2.5th percentile.
    pub lower: f64,
    /// 97.5th percentile.
    pub upper: f64,
    pub count: usize,
}

impl ParameterSummary {
    pub fn from_values(mut values: Vec<f64>) -> Self {
        let n = values.len();
        if n == 0 {
            return Self {
                mean: f64::NAN,
                std_dev: f64::NAN,
                lower: f64::NAN,
                upper: f64::NAN,
                count: 0,
            };
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let std_dev = if n > 1 {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0)).sqrt()
        } else {
            0.0
        };
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let lower_idx = (0.025 * n as f64).floor() as usize;
        let upper_idx = (0.975 * n as f64).ceil() as usize;
        Self {
            mean,
            std_dev,
            lower: values[lower_idx.min(n - 1)],
            upper: values[upper_idx.min(n - 1)],
            count: n,
        }
    }
}

/// Statistics over the post-burn-in records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSummary {
    pub record_count: usize,
    /// Linear ratios `exp(log_ratio)`, one per non-reference isotope.
    pub ratios: Vec<ParameterSummary>,
    pub log_ratios: Vec<ParameterSummary>,
    pub intensities: BTreeMap<BlockId, Vec<ParameterSummary>>,
    pub baselines: Vec<ParameterSummary>,
    pub gain: ParameterSummary,
    pub detector_noise: Vec<ParameterSummary>,
    pub global_noise: ParameterSummary,
}

fn column_summaries<'r, F>(records: &'r [EnsembleRecord], column: F) -> Vec<ParameterSummary>
where
    F: Fn(&'r EnsembleRecord) -> Option<&'r [f64]>,
{
    let width = records
        .iter()
        .filter_map(|r| column(r).map(<[f64]>::len))
        .max()
        .unwrap_or(0);
    (0..width)
        .map(|j| {
            let values = records
                .iter()
                .filter_map(|r| column(r).and_then(|c| c.get(j).copied()))
                .collect();
            ParameterSummary::from_values(values)
        })
        .collect()
}

/// Append-only store of saved models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleStore {
    records: Vec<EnsembleRecord>,
}

impl EnsembleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: EnsembleRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EnsembleRecord] {
        &self.records
    }

    /// Records from save index `burn_in` onwards.
    pub fn after_burn_in(&self, burn_in: usize) -> Result<&[EnsembleRecord], EnsembleError> {
        if self.records.is_empty() {
            return Err(EnsembleError::Empty);
        }
        if burn_in >= self.records.len() {
            return Err(EnsembleError::BurnInExceedsEnsemble {
                burn_in,
                records: self.records.len(),
            });
        }
        Ok(&self.records[burn_in..])
    }

    pub fn summarize(&self, burn_in: usize) -> Result<EnsembleSummary, EnsembleError> {
        let records = self.after_burn_in(burn_in)?;
        let log_ratios = column_summaries(records, |r| r.log_ratios.as_slice());
        let ratio_count = log_ratios.len();
        let ratios = (0..ratio_count)
            .map(|j| {
                ParameterSummary::from_values(
                    records
                        .iter()
                        .filter_map(|r| r.log_ratios.get(j).map(|v| v.exp()))
                        .collect(),
                )
            })
            .collect();

        let mut block_ids: Vec<BlockId> = records
            .iter()
            .flat_map(|r| r.intensities.keys().copied())
            .collect();
        block_ids.sort_unstable();
        block_ids.dedup();
        let intensities = block_ids
            .into_iter()
            .map(|id| {
                let stats = column_summaries(records, |r| {
                    r.intensities.get(&id).and_then(|k| k.as_slice())
                });
                (id, stats)
            })
            .collect();

        Ok(EnsembleSummary {
            record_count: records.len(),
            ratios,
            log_ratios,
            intensities,
            baselines: column_summaries(records, |r| r.baselines.as_slice()),
            gain: ParameterSummary::from_values(records.iter().map(|r| r.gain).collect()),
            detector_noise: column_summaries(records, |r| Some(r.detector_noise())),
            global_noise: ParameterSummary::from_values(
                records.iter().map(EnsembleRecord::global_noise).collect(),
            ),
        })
    }

    /// Weighted misfit per saved model.
    pub fn misfit_trace(&self) -> Array1<f64> {
        self.records.iter().map(|r| r.weighted_misfit).collect()
    }

    pub fn log_likelihood_trace(&self) -> Array1<f64> {
        self.records.iter().map(|r| r.log_likelihood).collect()
    }

    /// Log-ratio of non-reference isotope `index + 1` per saved model.
    pub fn log_ratio_trace(&self, index: usize) -> Array1<f64> {
        self.records
            .iter()
            .map(|r| r.log_ratios.get(index).copied().unwrap_or(f64::NAN))
            .collect()
    }

    /// Post-burn-in records of every store, concatenated in order.
    pub fn merged<'s, I>(stores: I, burn_in: usize) -> Result<EnsembleStore, EnsembleError>
    where
        I: IntoIterator<Item = &'s EnsembleStore>,
    {
        let mut merged = EnsembleStore::new();
        for store in stores {
            merged.records.extend_from_slice(store.after_burn_in(burn_in)?);
        }
        if merged.is_empty() {
            return Err(EnsembleError::Empty);
        }
        Ok(merged)
    }

    /// Post-burn-in samples as a `records × parameters` matrix.
    pub fn flat_samples(&self, burn_in: usize) -> Result<Array2<f64>, EnsembleError> {
        let records = self.after_burn_in(burn_in)?;
        let rows: Vec<Vec<f64>> = records.iter().map(EnsembleRecord::flatten).collect();
        let width = rows[0].len();
        if rows.iter().any(|r| r.len() != width) {
            return Err(EnsembleError::HeterogeneousRecords);
        }
        Ok(Array2::from_shape_fn((rows.len(), width), |(i, j)| rows[i][j]))
    }
}
