//! Candidate generation for the Metropolis-Hastings sampler.
//!
//! Before the chain has an adaptive covariance every step perturbs one scalar
//! of one parameter group. After adaptation a fraction of steps perturbs the
//! whole vector through the Cholesky factor of the blended covariance.

use crate::config::{Interval, PriorBounds};
use crate::data::MeasurementTable;
use crate::linalg::covariance::{ADAPTIVE_SCALE, blended_proposal_covariance};
use crate::linalg::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::model::{ModelState, ParameterGroup, ParameterLayout, ParameterSlot};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::{Rng, RngExt};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Smallest cold-start step; keeps the blended covariance positive definite
/// along coordinates whose history never moves.
const MIN_PROPOSAL_SD: f64 = 1e-10;

/// Flat prior bounds resolved per scalar of the layout.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatPriors {
    lower: Array1<f64>,
    upper: Array1<f64>,
}

impl FlatPriors {
    pub fn resolve(layout: &ParameterLayout, table: &MeasurementTable, bounds: &PriorBounds) -> Self {
        let faraday_ordinals: Vec<usize> = table
            .detectors()
            .iter()
            .filter(|d| d.is_faraday())
            .map(|d| d.ordinal)
            .collect();
        let interval = |slot: ParameterSlot| -> Interval {
            match slot {
                ParameterSlot::LogRatio(_) => bounds.log_ratio,
                ParameterSlot::Intensity { .. } => bounds.intensity,
                ParameterSlot::Baseline(i) => bounds
                    .baseline_overrides
                    .get(&faraday_ordinals[i])
                    .copied()
                    .unwrap_or(bounds.baseline),
                ParameterSlot::Gain => bounds.gain,
                ParameterSlot::DetectorNoise(_) => bounds.detector_noise,
                ParameterSlot::GlobalNoise => bounds.global_noise,
            }
        };
        let (lower, upper): (Vec<f64>, Vec<f64>) = layout
            .slots()
            .iter()
            .map(|&s| {
                let iv = interval(s);
                (iv.min, iv.max)
            })
            .unzip();
        Self {
            lower: Array1::from_vec(lower),
            upper: Array1::from_vec(upper),
        }
    }

    #[inline]
    pub fn contains(&self, index: usize, value: f64) -> bool {
        value >= self.lower[index] && value <= self.upper[index]
    }

    #[inline]
    pub fn clamp(&self, index: usize, value: f64) -> f64 {
        value.max(self.lower[index]).min(self.upper[index])
    }

    pub fn contains_flat(&self, flat: ArrayView1<'_, f64>) -> bool {
        flat.iter().enumerate().all(|(i, &v)| self.contains(i, v))
    }

    pub fn clamp_flat(&self, flat: &mut Array1<f64>) {
        for (i, v) in flat.iter_mut().enumerate() {
            *v = self.clamp(i, *v);
        }
    }

    pub fn contains_state(&self, layout: &ParameterLayout, state: &ModelState) -> bool {
        self.contains_flat(layout.flatten(state).view())
    }

    pub fn clamp_state(&self, layout: &ParameterLayout, state: &mut ModelState) {
        for (i, &slot) in layout.slots().iter().enumerate() {
            state.set(slot, self.clamp(i, state.get(slot)));
        }
    }
}

/// Kind of move, for bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalKind {
    Single(ParameterGroup),
    Joint,
}

impl ProposalKind {
    fn counter_index(self) -> usize {
        match self {
            ProposalKind::Single(g) => g.index(),
            ProposalKind::Joint => ParameterGroup::ALL.len(),
        }
    }

    pub fn operation(self) -> &'static str {
        match self {
            ProposalKind::Single(g) => g.operation(),
            ProposalKind::Joint => "change-all",
        }
    }
}

/// Result of asking the engine for a candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposal {
    /// `candidate` holds a state inside the priors that must be scored.
    Ready(ProposalKind),
    /// The move left the prior; the candidate was not touched.
    OutOfPrior(ProposalKind),
}

impl Proposal {
    pub fn kind(self) -> ProposalKind {
        match self {
            Proposal::Ready(k) | Proposal::OutOfPrior(k) => k,
        }
    }
}

/// Proposed and accepted counts for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperationStats {
    pub operation: &'static str,
    pub proposed: u64,
    pub accepted: u64,
}

impl OperationStats {
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

/// Proposal and acceptance counts per operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCounters {
    proposed: [u64; 6],
    accepted: [u64; 6],
}

impl AcceptanceCounters {
    pub fn record(&mut self, kind: ProposalKind, accepted: bool) {
        let i = kind.counter_index();
        self.proposed[i] += 1;
        if accepted {
            self.accepted[i] += 1;
        }
    }

    pub fn get(&self, kind: ProposalKind) -> OperationStats {
        let i = kind.counter_index();
        OperationStats {
            operation: kind.operation(),
            proposed: self.proposed[i],
            accepted: self.accepted[i],
        }
    }

    pub fn total_proposed(&self) -> u64 {
        self.proposed.iter().sum()
    }

    pub fn total_accepted(&self) -> u64 {
        self.accepted.iter().sum()
    }

    pub fn acceptance_rate(&self) -> f64 {
        let proposed = self.total_proposed();
        if proposed == 0 {
            0.0
        } else {
            self.total_accepted() as f64 / proposed as f64
        }
    }

    pub fn operations(&self) -> Vec<OperationStats> {
        ParameterGroup::ALL
            .iter()
            .map(|&g| ProposalKind::Single(g))
            .chain(std::iter::once(ProposalKind::Joint))
            .map(|k| self.get(k))
            .collect()
    }
}

/// Per-chain proposal state.
#[derive(Debug, Clone)]
pub struct ProposalEngine {
    priors: FlatPriors,
    group_ranges: Vec<(ParameterGroup, std::ops::Range<usize>)>,
    initial_sd: Array1<f64>,
    sd: Array1<f64>,
    joint_factor: Option<Array2<f64>>,
    joint_fraction: f64,
    counters: AcceptanceCounters,
}

impl ProposalEngine {
    /// `initial_sd` holds one cold-start step per flat layout position.
    pub fn new(
        layout: &ParameterLayout,
        priors: FlatPriors,
        initial_sd: Array1<f64>,
        joint_fraction: f64,
    ) -> Self {
        let initial_sd = initial_sd.mapv(|s| {
            if s.is_finite() {
                s.max(MIN_PROPOSAL_SD)
            } else {
                MIN_PROPOSAL_SD
            }
        });
        let group_ranges = ParameterGroup::ALL
            .iter()
            .map(|&g| (g, layout.group_range(g)))
            .filter(|(_, r)| !r.is_empty())
            .collect();
        Self {
            priors,
            group_ranges,
            sd: initial_sd.clone(),
            initial_sd,
            joint_factor: None,
            joint_fraction,
            counters: AcceptanceCounters::default(),
        }
    }

    pub fn priors(&self) -> &FlatPriors {
        &self.priors
    }

    /// Current single-group step per flat position.
    pub fn step_sizes(&self) -> ArrayView1<'_, f64> {
        self.sd.view()
    }

    pub fn initial_step_sizes(&self) -> ArrayView1<'_, f64> {
        self.initial_sd.view()
    }

    /// Lower Cholesky factor driving joint moves, once adapted.
    pub fn joint_factor(&self) -> Option<ArrayView2<'_, f64>> {
        self.joint_factor.as_ref().map(Array2::view)
    }

    pub fn is_adapted(&self) -> bool {
        self.joint_factor.is_some()
    }

    pub fn counters(&self) -> &AcceptanceCounters {
        &self.counters
    }

    pub fn record(&mut self, kind: ProposalKind, accepted: bool) {
        self.counters.record(kind, accepted);
    }

    /// Writes a candidate derived from `current` into `candidate`.
    ///
    /// `candidate` must equal `current` on entry.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        layout: &ParameterLayout,
        current: &ModelState,
        candidate: &mut ModelState,
        rng: &mut R,
    ) -> Proposal {
        if let Some(factor) = &self.joint_factor
            && rng.random::<f64>() < self.joint_fraction
        {
            self.propose_joint(layout, factor, current, candidate, rng);
            return Proposal::Ready(ProposalKind::Joint);
        }
        self.propose_single(layout, current, candidate, rng)
    }

    fn propose_single<R: Rng + ?Sized>(
        &self,
        layout: &ParameterLayout,
        current: &ModelState,
        candidate: &mut ModelState,
        rng: &mut R,
    ) -> Proposal {
        let (group, range) = &self.group_ranges[rng.random_range(0..self.group_ranges.len())];
        let kind = ProposalKind::Single(*group);
        let index = rng.random_range(range.clone());
        let slot = layout.slot(index);
        let z: f64 = StandardNormal.sample(rng);
        let value = current.get(slot) + self.sd[index] * z;
        if !self.priors.contains(index, value) {
            return Proposal::OutOfPrior(kind);
        }
        candidate.set(slot, value);
        Proposal::Ready(kind)
    }

    fn propose_joint<R: Rng + ?Sized>(
        &self,
        layout: &ParameterLayout,
        factor: &Array2<f64>,
        current: &ModelState,
        candidate: &mut ModelState,
        rng: &mut R,
    ) {
        let x = layout.flatten(current);
        let z: Array1<f64> = Array1::from_iter((0..x.len()).map(|_| StandardNormal.sample(rng)));
        let step = factor.dot(&z);
        let mut proposed = &x + &step;
        for (i, v) in proposed.iter_mut().enumerate() {
            if !self.priors.contains(i, *v) {
                *v = x[i];
            }
        }
        layout.write_flat(proposed.view(), candidate);
    }

    /// Replaces the proposal scales with ones derived from the sample
    /// covariance of the chain history.
    ///
    /// On failure the previous scales stay in place.
    pub fn adapt(&mut self, covariance: &Array2<f64>, blend_weight: f64) -> Result<(), FaerLinalgError> {
        let blended = blended_proposal_covariance(self.initial_sd.view(), covariance, blend_weight);
        let factor = blended.cholesky(Side::Lower)?.lower_triangular();
        self.sd = Array1::from_shape_fn(self.initial_sd.len(), |i| {
            let s0 = self.initial_sd[i];
            (blend_weight * s0 * s0 + (1.0 - blend_weight) * ADAPTIVE_SCALE * covariance[[i, i]]).sqrt()
        });
        self.joint_factor = Some(factor);
        Ok(())
    }
}
