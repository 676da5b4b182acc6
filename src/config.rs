//! Run configuration for an inversion.
//!
//! Everything is plain serde data so callers can load it from whatever format
//! their session layer uses. Missing fields take the defaults below.

use crate::data::MeasurementTable;
use crate::types::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Trial count must be positive.")]
    ZeroTrials,

    #[error("Thinning interval must be positive.")]
    ZeroThinning,

    #[error("Chain count must be positive.")]
    ZeroChains,

    #[error("Prior for {name} is invalid: min {min} exceeds max {max} or is NaN.")]
    InvalidPrior { name: String, min: f64, max: f64 },

    #[error("Proposal standard deviation for {group} must be finite and positive, got {value}.")]
    InvalidProposalScale { group: &'static str, value: f64 },

    #[error(
        "Burn-in of {burn_in} saved models leaves nothing to summarize: only {saved} models will be saved."
    )]
    BurnInTooLarge { burn_in: usize, saved: usize },

    #[error("Baseline prior override names detector {0}, which is not a Faraday detector in the table.")]
    UnknownBaselineDetector(usize),

    #[error("Knot count override names block {0}, which is not in the table.")]
    UnknownBlock(BlockId),

    #[error("Knot count override for block {block} is {count}; a degree {degree} spline needs at least {required}.")]
    TooFewKnots {
        block: BlockId,
        count: usize,
        degree: usize,
        required: usize,
    },

    #[error("Spline degree must be at least 1.")]
    InvalidSplineDegree,

    #[error("Cycles per knot must be positive.")]
    ZeroCyclesPerKnot,

    #[error("Adaptation setting {name} is {value}; it must lie in [0, 1].")]
    InvalidAdaptationWeight { name: &'static str, value: f64 },

    #[error("Blend weight is {0}; it must lie in (0, 1].")]
    InvalidBlendWeight(f64),

    #[error("Adaptation refresh interval must be positive.")]
    ZeroRefreshInterval,

    #[error("Adaptation needs at least two saved models before it starts, got {0}.")]
    AdaptationStartTooEarly(usize),

    #[error("Perturbation scale must be finite and non-negative, got {0}.")]
    InvalidPerturbation(f64),
}

/// Closed interval `[min, max]`. A point prior has `min == max`.
///
/// Unbounded ends serialize as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    #[serde(with = "open_bound::lower")]
    pub min: f64,
    #[serde(with = "open_bound::upper")]
    pub max: f64,
}

mod open_bound {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    fn serialize_finite<S: Serializer>(value: f64, serializer: S) -> Result<S::Ok, S::Error> {
        value.is_finite().then_some(value).serialize(serializer)
    }

    pub mod lower {
        use super::*;

        pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
            serialize_finite(*value, serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
            Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
        }
    }

    pub mod upper {
        use super::*;

        pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
            serialize_finite(*value, serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
            Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
        }
    }
}

impl Interval {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub const fn point(value: f64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    #[inline]
    pub fn contains(&self, x: f64) -> bool {
        x >= self.min && x <= self.max
    }

    #[inline]
    pub fn clamp(&self, x: f64) -> f64 {
        x.max(self.min).min(self.max)
    }

    fn validate(&self, name: impl Into<String>) -> Result<(), ConfigError> {
        // NaN bounds fail this comparison too.
        if self.min <= self.max {
            Ok(())
        } else {
            Err(ConfigError::InvalidPrior {
                name: name.into(),
                min: self.min,
                max: self.max,
            })
        }
    }
}

fn default_log_ratio_prior() -> Interval {
    Interval::new(-20.0, 20.0)
}

fn default_intensity_prior() -> Interval {
    Interval::new(0.0, f64::INFINITY)
}

fn default_baseline_prior() -> Interval {
    Interval::new(f64::NEG_INFINITY, f64::INFINITY)
}

/// Ion-counter predictions divide by the gain, so zero is excluded.
fn default_gain_prior() -> Interval {
    Interval::new(1.0e-6, f64::INFINITY)
}

fn default_detector_noise_prior() -> Interval {
    Interval::new(0.0, 1.0e6)
}

fn default_global_noise_prior() -> Interval {
    Interval::new(0.0, 10.0)
}

/// Flat prior intervals per parameter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorBounds {
    #[serde(default = "default_log_ratio_prior")]
    pub log_ratio: Interval,
    #[serde(default = "default_intensity_prior")]
    pub intensity: Interval,
    #[serde(default = "default_baseline_prior")]
    pub baseline: Interval,
    #[serde(default = "default_gain_prior")]
    pub gain: Interval,
    #[serde(default = "default_detector_noise_prior")]
    pub detector_noise: Interval,
    #[serde(default = "default_global_noise_prior")]
    pub global_noise: Interval,
    /// Baseline priors for individual detectors, keyed by detector ordinal.
    #[serde(default)]
    pub baseline_overrides: BTreeMap<usize, Interval>,
}

impl Default for PriorBounds {
    fn default() -> Self {
        Self {
            log_ratio: default_log_ratio_prior(),
            intensity: default_intensity_prior(),
            baseline: default_baseline_prior(),
            gain: default_gain_prior(),
            detector_noise: default_detector_noise_prior(),
            global_noise: default_global_noise_prior(),
            baseline_overrides: BTreeMap::new(),
        }
    }
}

/// Cold-start proposal standard deviations per group. `None` derives the
/// scale from the rough start's maximum-likelihood variance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposalScales {
    #[serde(default)]
    pub log_ratio: Option<f64>,
    #[serde(default)]
    pub intensity: Option<f64>,
    #[serde(default)]
    pub baseline: Option<f64>,
    #[serde(default)]
    pub gain: Option<f64>,
    #[serde(default)]
    pub noise: Option<f64>,
}

fn default_start_after_saves() -> usize {
    50
}

fn default_refresh_interval() -> usize {
    50
}

fn default_joint_fraction() -> f64 {
    0.5
}

fn default_blend_weight() -> f64 {
    0.05
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationConfig {
    /// Saved models required before the first covariance estimate.
    #[serde(default = "default_start_after_saves")]
    pub start_after_saves: usize,
    /// Saved models between covariance refreshes.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: usize,
    /// Probability of a joint proposal once adapted.
    #[serde(default = "default_joint_fraction")]
    pub joint_fraction: f64,
    /// Weight of the cold-start diagonal in the blended covariance. Must be
    /// positive so the blend stays positive definite when a coordinate never
    /// moves.
    #[serde(default = "default_blend_weight")]
    pub blend_weight: f64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            start_after_saves: default_start_after_saves(),
            refresh_interval: default_refresh_interval(),
            joint_fraction: default_joint_fraction(),
            blend_weight: default_blend_weight(),
        }
    }
}

fn default_degree() -> usize {
    3
}

fn default_cycles_per_knot() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineConfig {
    #[serde(default = "default_degree")]
    pub degree: usize,
    #[serde(default = "default_cycles_per_knot")]
    pub cycles_per_knot: usize,
    /// Knot counts for individual blocks.
    #[serde(default)]
    pub knot_overrides: BTreeMap<BlockId, usize>,
}

impl Default for SplineConfig {
    fn default() -> Self {
        Self {
            degree: default_degree(),
            cycles_per_knot: default_cycles_per_knot(),
            knot_overrides: BTreeMap::new(),
        }
    }
}

impl SplineConfig {
    pub fn knot_count(&self, block: BlockId, cycle_count: usize) -> usize {
        self.knot_overrides.get(&block).copied().unwrap_or_else(|| {
            crate::basis::coefficient_count(cycle_count, self.cycles_per_knot, self.degree)
        })
    }
}

fn default_trial_count() -> usize {
    100_000
}

fn default_thinning() -> usize {
    20
}

fn default_burn_in() -> usize {
    0
}

fn default_chain_count() -> usize {
    1
}

fn default_perturbation_scale() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    42
}

/// Configuration of one inversion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InversionConfig {
    /// Sampler iterations per chain.
    #[serde(default = "default_trial_count")]
    pub trial_count: usize,
    /// Iterations between saved models.
    #[serde(default = "default_thinning")]
    pub thinning: usize,
    /// Saved models discarded before summarizing.
    #[serde(default = "default_burn_in")]
    pub burn_in: usize,
    #[serde(default)]
    pub priors: PriorBounds,
    #[serde(default)]
    pub proposal_scales: ProposalScales,
    #[serde(default = "default_chain_count")]
    pub chain_count: usize,
    /// Multiplier on the maximum-likelihood sd when dispersing chain starts.
    #[serde(default = "default_perturbation_scale")]
    pub perturbation_scale: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub adaptation: AdaptationConfig,
    #[serde(default)]
    pub spline: SplineConfig,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            trial_count: default_trial_count(),
            thinning: default_thinning(),
            burn_in: default_burn_in(),
            priors: PriorBounds::default(),
            proposal_scales: ProposalScales::default(),
            chain_count: default_chain_count(),
            perturbation_scale: default_perturbation_scale(),
            seed: default_seed(),
            adaptation: AdaptationConfig::default(),
            spline: SplineConfig::default(),
        }
    }
}

impl InversionConfig {
    /// Models saved per chain: one every `thinning` iterations.
    pub fn saved_per_chain(&self) -> usize {
        if self.thinning == 0 {
            0
        } else {
            self.trial_count / self.thinning
        }
    }

    pub fn validate(&self, table: &MeasurementTable) -> Result<(), ConfigError> {
        if self.trial_count == 0 {
            return Err(ConfigError::ZeroTrials);
        }
        if self.thinning == 0 {
            return Err(ConfigError::ZeroThinning);
        }
        if self.chain_count == 0 {
            return Err(ConfigError::ZeroChains);
        }
        let saved = self.saved_per_chain();
        if self.burn_in >= saved {
            return Err(ConfigError::BurnInTooLarge {
                burn_in: self.burn_in,
                saved,
            });
        }
        if !(self.perturbation_scale.is_finite() && self.perturbation_scale >= 0.0) {
            return Err(ConfigError::InvalidPerturbation(self.perturbation_scale));
        }

        let p = &self.priors;
        p.log_ratio.validate("log_ratio")?;
        p.intensity.validate("intensity")?;
        p.baseline.validate("baseline")?;
        p.gain.validate("gain")?;
        p.detector_noise.validate("detector_noise")?;
        p.global_noise.validate("global_noise")?;
        for (&ordinal, interval) in &p.baseline_overrides {
            if table.faraday_index_of_ordinal(ordinal).is_none() {
                return Err(ConfigError::UnknownBaselineDetector(ordinal));
            }
            interval.validate(format!("baseline of detector {ordinal}"))?;
        }

        let s = &self.proposal_scales;
        for (group, value) in [
            ("log_ratio", s.log_ratio),
            ("intensity", s.intensity),
            ("baseline", s.baseline),
            ("gain", s.gain),
            ("noise", s.noise),
        ] {
            if let Some(value) = value
                && !(value.is_finite() && value > 0.0)
            {
                return Err(ConfigError::InvalidProposalScale { group, value });
            }
        }

        let a = &self.adaptation;
        if a.refresh_interval == 0 {
            return Err(ConfigError::ZeroRefreshInterval);
        }
        if a.start_after_saves < 2 {
            return Err(ConfigError::AdaptationStartTooEarly(a.start_after_saves));
        }
        if !(0.0..=1.0).contains(&a.joint_fraction) {
            return Err(ConfigError::InvalidAdaptationWeight {
                name: "joint_fraction",
                value: a.joint_fraction,
            });
        }
        if !(a.blend_weight > 0.0 && a.blend_weight <= 1.0) {
            return Err(ConfigError::InvalidBlendWeight(a.blend_weight));
        }

        let sp = &self.spline;
        if sp.degree < 1 {
            return Err(ConfigError::InvalidSplineDegree);
        }
        if sp.cycles_per_knot == 0 {
            return Err(ConfigError::ZeroCyclesPerKnot);
        }
        for (&block, &count) in &sp.knot_overrides {
            if table.block_position(block).is_none() {
                return Err(ConfigError::UnknownBlock(block));
            }
            if count < sp.degree + 1 {
                return Err(ConfigError::TooFewKnots {
                    block,
                    count,
                    degree: sp.degree,
                    required: sp.degree + 1,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MeasurementRow, MeasurementTableBuilder};
    use crate::types::Detector;

    fn small_table() -> MeasurementTable {
        let mut builder = MeasurementTableBuilder::new(2)
            .detector(Detector::faraday(0))
            .detector(Detector::ion_counter(1));
        builder.push(MeasurementRow::on_peak(0.0, BlockId(1), 0, 0, 0, 10.0));
        builder.push(MeasurementRow::on_peak(1.0, BlockId(1), 0, 1, 1, 9.0));
        builder.build().unwrap()
    }

    #[test]
    fn defaults_validate() {
        let config = InversionConfig::default();
        assert_eq!(config.saved_per_chain(), 5000);
        config.validate(&small_table()).unwrap();
    }

    #[test]
    fn inverted_prior_is_rejected() {
        let mut config = InversionConfig::default();
        config.priors.gain = Interval::new(2.0, 1.0);
        assert!(matches!(
            config.validate(&small_table()),
            Err(ConfigError::InvalidPrior { ref name, .. }) if name == "gain"
        ));
    }

    #[test]
    fn point_prior_is_valid() {
        let mut config = InversionConfig::default();
        config.priors.log_ratio = Interval::point(0.0);
        config.validate(&small_table()).unwrap();
        assert!(Interval::point(0.0).contains(0.0));
        assert_eq!(Interval::point(0.0).clamp(3.0), 0.0);
    }

    #[test]
    fn burn_in_must_leave_saved_models() {
        let config = InversionConfig {
            trial_count: 100,
            thinning: 10,
            burn_in: 10,
            ..InversionConfig::default()
        };
        assert_eq!(
            config.validate(&small_table()),
            Err(ConfigError::BurnInTooLarge {
                burn_in: 10,
                saved: 10
            })
        );
    }

    #[test]
    fn overrides_must_name_known_entities() {
        let table = small_table();
        let mut config = InversionConfig::default();
        config
            .priors
            .baseline_overrides
            .insert(1, Interval::new(0.0, 1.0));
        assert_eq!(
            config.validate(&table),
            Err(ConfigError::UnknownBaselineDetector(1))
        );

        let mut config = InversionConfig::default();
        config.spline.knot_overrides.insert(BlockId(9), 6);
        assert_eq!(
            config.validate(&table),
            Err(ConfigError::UnknownBlock(BlockId(9)))
        );

        let mut config = InversionConfig::default();
        config.spline.knot_overrides.insert(BlockId(1), 2);
        assert!(matches!(
            config.validate(&table),
            Err(ConfigError::TooFewKnots { required: 4, .. })
        ));
    }

    #[test]
    fn non_positive_proposal_scale_is_rejected() {
        let mut config = InversionConfig::default();
        config.proposal_scales.baseline = Some(0.0);
        assert_eq!(
            config.validate(&small_table()),
            Err(ConfigError::InvalidProposalScale {
                group: "baseline",
                value: 0.0
            })
        );
    }

    #[test]
    fn blend_weight_must_be_positive() {
        let table = small_table();
        let mut config = InversionConfig::default();
        config.adaptation.blend_weight = 0.0;
        assert_eq!(
            config.validate(&table),
            Err(ConfigError::InvalidBlendWeight(0.0))
        );
        config.adaptation.blend_weight = 1.5;
        assert_eq!(
            config.validate(&table),
            Err(ConfigError::InvalidBlendWeight(1.5))
        );
        config.adaptation.blend_weight = 1.0;
        config.validate(&table).unwrap();
    }

    #[test]
    fn default_gain_prior_excludes_zero() {
        let gain = PriorBounds::default().gain;
        assert!(!gain.contains(0.0));
        assert!(gain.clamp(0.0) > 0.0);
    }

    #[test]
    fn knot_count_uses_override_then_density() {
        let mut spline = SplineConfig::default();
        spline.knot_overrides.insert(BlockId(2), 9);
        assert_eq!(spline.knot_count(BlockId(2), 100), 9);
        assert_eq!(spline.knot_count(BlockId(3), 10), 5);
    }
}
