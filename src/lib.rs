//! Adaptive Metropolis-Hastings inversion of isotope-ratio mass spectrometer
//! intensity data.
//!
//! The engine takes a validated [`MeasurementTable`] and an [`InversionConfig`]
//! and returns posterior ensembles of isotope ratios, beam intensities,
//! baselines, detector gain and noise terms. Parsing instrument files,
//! persisting sessions and plotting are left to the caller.

pub mod basis;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod ensemble;
pub mod inversion;
pub mod linalg;
pub mod model;
pub mod overlay;
pub mod proposal;
pub mod sampler;
pub mod seeding;
pub mod types;

pub use config::{
    AdaptationConfig, ConfigError, Interval, InversionConfig, PriorBounds, ProposalScales,
    SplineConfig,
};
pub use data::{BlockSpan, MeasurementRow, MeasurementTable, MeasurementTableBuilder, TableError};
pub use diagnostics::{ConvergenceDiagnostics, split_rhat_and_ess};
pub use ensemble::{
    EnsembleError, EnsembleRecord, EnsembleStore, EnsembleSummary, ParameterSummary,
};
pub use inversion::{ChainFailure, InversionError, InversionOutput, run_inversion};
pub use model::{
    Evaluation, Evaluator, ForwardModel, LikelihoodEvaluation, ModelState, ParameterGroup,
    ParameterLayout, ParameterSlot,
};
pub use overlay::{CycleRatio, ModelOverlay, cycle_ratios};
pub use proposal::{AcceptanceCounters, FlatPriors, OperationStats, ProposalEngine, ProposalKind};
pub use sampler::{Chain, ChainOutput, SamplerError, SamplerPhase};
pub use seeding::{RoughStart, rough_start};
pub use types::{BlockId, Detector, DetectorKind};
