//! Dense linear algebra used at the numeric kernel boundary.

pub mod covariance;
pub mod faer_ndarray;
pub(crate) mod utils;
