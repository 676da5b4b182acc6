use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one contiguous measurement block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BlockId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Collector technology behind a detector channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorKind {
    /// Resistor-amplified collector with an additive baseline and electronic noise.
    Faraday,
    /// Pulse-counting collector cross-calibrated to the Faradays through the gain.
    IonCounter,
}

/// Static description of one detector channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub ordinal: usize,
    pub kind: DetectorKind,
    /// Integration time of a single reading, in seconds.
    pub integration_time: f64,
    /// Zero-beam noise density; the baseline variance is `noise_floor / integration_time`.
    pub noise_floor: f64,
}

impl Detector {
    pub fn faraday(ordinal: usize) -> Self {
        Self {
            ordinal,
            kind: DetectorKind::Faraday,
            integration_time: 1.0,
            noise_floor: 1.0,
        }
    }

    pub fn ion_counter(ordinal: usize) -> Self {
        Self {
            ordinal,
            kind: DetectorKind::IonCounter,
            integration_time: 1.0,
            noise_floor: 1.0,
        }
    }

    pub fn with_integration_time(mut self, seconds: f64) -> Self {
        self.integration_time = seconds;
        self
    }

    pub fn with_noise_floor(mut self, noise_floor: f64) -> Self {
        self.noise_floor = noise_floor;
        self
    }

    #[inline]
    pub fn is_faraday(&self) -> bool {
        self.kind == DetectorKind::Faraday
    }

    /// Shot-noise floor of a baseline reading on this detector.
    #[inline]
    pub fn baseline_variance(&self) -> f64 {
        self.noise_floor / self.integration_time
    }
}
