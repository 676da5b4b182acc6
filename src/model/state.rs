//! Parameter vector of the intensity model and its flat index map.

use crate::basis::{BasisError, BlockBasis};
use crate::config::SplineConfig;
use crate::data::MeasurementTable;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Parameter groups; each has its own proposal operation and prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParameterGroup {
    LogRatio,
    Intensity,
    Baseline,
    Gain,
    Noise,
}

impl ParameterGroup {
    pub const ALL: [ParameterGroup; 5] = [
        ParameterGroup::LogRatio,
        ParameterGroup::Intensity,
        ParameterGroup::Baseline,
        ParameterGroup::Gain,
        ParameterGroup::Noise,
    ];

    /// Name of the single-group proposal operation.
    pub fn operation(self) -> &'static str {
        match self {
            ParameterGroup::LogRatio => "change-ratio",
            ParameterGroup::Intensity => "change-intensity",
            ParameterGroup::Baseline => "change-baseline",
            ParameterGroup::Gain => "change-gain",
            ParameterGroup::Noise => "change-noise",
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Address of one scalar parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterSlot {
    /// Log-ratio of non-reference isotope `i + 1`.
    LogRatio(usize),
    /// Knot coefficient of the block at position `block` in the table.
    Intensity { block: usize, knot: usize },
    /// Baseline of Faraday index `i`.
    Baseline(usize),
    Gain,
    /// Electronic noise of Faraday index `i`.
    DetectorNoise(usize),
    GlobalNoise,
}

impl ParameterSlot {
    pub fn group(self) -> ParameterGroup {
        match self {
            ParameterSlot::LogRatio(_) => ParameterGroup::LogRatio,
            ParameterSlot::Intensity { .. } => ParameterGroup::Intensity,
            ParameterSlot::Baseline(_) => ParameterGroup::Baseline,
            ParameterSlot::Gain => ParameterGroup::Gain,
            ParameterSlot::DetectorNoise(_) | ParameterSlot::GlobalNoise => ParameterGroup::Noise,
        }
    }
}

/// Tagged parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// One per non-reference isotope; the reference is implicitly 0.
    pub log_ratios: Array1<f64>,
    /// Knot coefficients per block, in table block order.
    pub intensities: Vec<Array1<f64>>,
    /// One per Faraday detector.
    pub baselines: Array1<f64>,
    pub gain: f64,
    /// One per Faraday detector.
    pub detector_noise: Array1<f64>,
    pub global_noise: f64,
}

impl ModelState {
    /// Log-ratio of `isotope`, with the reference at 0.
    #[inline]
    pub fn log_ratio_of(&self, isotope: usize) -> f64 {
        if isotope == 0 {
            0.0
        } else {
            self.log_ratios[isotope - 1]
        }
    }

    pub fn get(&self, slot: ParameterSlot) -> f64 {
        match slot {
            ParameterSlot::LogRatio(i) => self.log_ratios[i],
            ParameterSlot::Intensity { block, knot } => self.intensities[block][knot],
            ParameterSlot::Baseline(i) => self.baselines[i],
            ParameterSlot::Gain => self.gain,
            ParameterSlot::DetectorNoise(i) => self.detector_noise[i],
            ParameterSlot::GlobalNoise => self.global_noise,
        }
    }

    /// Copies `other` into `self` without reallocating. Both states must
    /// come from the same layout.
    pub fn assign_from(&mut self, other: &ModelState) {
        self.log_ratios.assign(&other.log_ratios);
        for (dst, src) in self.intensities.iter_mut().zip(&other.intensities) {
            dst.assign(src);
        }
        self.baselines.assign(&other.baselines);
        self.gain = other.gain;
        self.detector_noise.assign(&other.detector_noise);
        self.global_noise = other.global_noise;
    }

    pub fn set(&mut self, slot: ParameterSlot, value: f64) {
        match slot {
            ParameterSlot::LogRatio(i) => self.log_ratios[i] = value,
            ParameterSlot::Intensity { block, knot } => self.intensities[block][knot] = value,
            ParameterSlot::Baseline(i) => self.baselines[i] = value,
            ParameterSlot::Gain => self.gain = value,
            ParameterSlot::DetectorNoise(i) => self.detector_noise[i] = value,
            ParameterSlot::GlobalNoise => self.global_noise = value,
        }
    }
}

/// Bijection between flat positions and parameter slots, fixed for a run.
///
/// Flat order: log-ratios, block-major knot coefficients, baselines, gain,
/// detector noise, global noise.
#[derive(Debug, Clone)]
pub struct ParameterLayout {
    slots: Vec<ParameterSlot>,
    groups: [Range<usize>; 5],
    knot_offsets: Vec<usize>,
    bases: Vec<BlockBasis>,
    ratio_count: usize,
    faraday_count: usize,
}

impl ParameterLayout {
    pub fn new(table: &MeasurementTable, spline: &SplineConfig) -> Result<Self, BasisError> {
        let ratio_count = table.ratio_count();
        let faraday_count = table.faraday_count();

        let bases = table
            .blocks()
            .iter()
            .map(|block| {
                let count = spline.knot_count(block.id, block.cycle_count);
                BlockBasis::new(block.time_range, count, spline.degree)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut slots = Vec::new();
        let mut groups: [Range<usize>; 5] = Default::default();

        let start = slots.len();
        slots.extend((0..ratio_count).map(ParameterSlot::LogRatio));
        groups[ParameterGroup::LogRatio.index()] = start..slots.len();

        let start = slots.len();
        let mut knot_offsets = Vec::with_capacity(bases.len());
        for (block, basis) in bases.iter().enumerate() {
            knot_offsets.push(slots.len());
            slots.extend((0..basis.num_basis()).map(|knot| ParameterSlot::Intensity { block, knot }));
        }
        groups[ParameterGroup::Intensity.index()] = start..slots.len();

        let start = slots.len();
        slots.extend((0..faraday_count).map(ParameterSlot::Baseline));
        groups[ParameterGroup::Baseline.index()] = start..slots.len();

        let start = slots.len();
        slots.push(ParameterSlot::Gain);
        groups[ParameterGroup::Gain.index()] = start..slots.len();

        let start = slots.len();
        slots.extend((0..faraday_count).map(ParameterSlot::DetectorNoise));
        slots.push(ParameterSlot::GlobalNoise);
        groups[ParameterGroup::Noise.index()] = start..slots.len();

        Ok(Self {
            slots,
            groups,
            knot_offsets,
            bases,
            ratio_count,
            faraday_count,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[ParameterSlot] {
        &self.slots
    }

    #[inline]
    pub fn slot(&self, index: usize) -> ParameterSlot {
        self.slots[index]
    }

    pub fn group_range(&self, group: ParameterGroup) -> Range<usize> {
        self.groups[group.index()].clone()
    }

    pub fn index_of(&self, slot: ParameterSlot) -> usize {
        let base = |g: ParameterGroup| self.groups[g.index()].start;
        match slot {
            ParameterSlot::LogRatio(i) => base(ParameterGroup::LogRatio) + i,
            ParameterSlot::Intensity { block, knot } => self.knot_offsets[block] + knot,
            ParameterSlot::Baseline(i) => base(ParameterGroup::Baseline) + i,
            ParameterSlot::Gain => base(ParameterGroup::Gain),
            ParameterSlot::DetectorNoise(i) => base(ParameterGroup::Noise) + i,
            ParameterSlot::GlobalNoise => base(ParameterGroup::Noise) + self.faraday_count,
        }
    }

    /// Spline basis of each block, in table block order.
    pub fn bases(&self) -> &[BlockBasis] {
        &self.bases
    }

    pub fn ratio_count(&self) -> usize {
        self.ratio_count
    }

    pub fn faraday_count(&self) -> usize {
        self.faraday_count
    }

    /// State with every parameter at zero, shaped for this layout.
    pub fn zero_state(&self) -> ModelState {
        ModelState {
            log_ratios: Array1::zeros(self.ratio_count),
            intensities: self
                .bases
                .iter()
                .map(|b| Array1::zeros(b.num_basis()))
                .collect(),
            baselines: Array1::zeros(self.faraday_count),
            gain: 0.0,
            detector_noise: Array1::zeros(self.faraday_count),
            global_noise: 0.0,
        }
    }

    pub fn flatten(&self, state: &ModelState) -> Array1<f64> {
        Array1::from_iter(self.slots.iter().map(|&slot| state.get(slot)))
    }

    pub fn unflatten(&self, flat: ArrayView1<'_, f64>) -> ModelState {
        let mut state = self.zero_state();
        self.write_flat(flat, &mut state);
        state
    }

    /// Overwrites `state` with the values in `flat`.
    pub fn write_flat(&self, flat: ArrayView1<'_, f64>, state: &mut ModelState) {
        debug_assert_eq!(flat.len(), self.len());
        for (&slot, &value) in self.slots.iter().zip(flat.iter()) {
            state.set(slot, value);
        }
    }
}
