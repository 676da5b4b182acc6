//! Immutable, column-oriented store of raw detector readings.
//!
//! The importer that parses instrument files lives outside this crate; it hands
//! rows to [`MeasurementTableBuilder`], which validates them and groups them by
//! block so that every block occupies one contiguous row range.

use crate::types::{BlockId, Detector, DetectorKind};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("Measurement table has no rows.")]
    Empty,

    #[error("At least two isotopes are required (a reference plus one ratio), but {0} were declared.")]
    TooFewIsotopes(usize),

    #[error("Detector ordinal {0} appears more than once in the detector roster.")]
    DuplicateDetector(usize),

    #[error(
        "Detector {ordinal} has integration time {integration_time}; it must be finite and positive."
    )]
    InvalidIntegrationTime { ordinal: usize, integration_time: f64 },

    #[error("Detector {ordinal} has noise floor {noise_floor}; it must be finite and non-negative.")]
    InvalidNoiseFloor { ordinal: usize, noise_floor: f64 },

    #[error("Row {row} references detector ordinal {detector}, which is not in the detector roster.")]
    UnknownDetector { row: usize, detector: usize },

    #[error("Row {row} references isotope {isotope}, but only {isotope_count} isotopes were declared.")]
    IsotopeOutOfRange {
        row: usize,
        isotope: usize,
        isotope_count: usize,
    },

    #[error(
        "Row {row} is a baseline reading on ion-counting detector {detector}; ion counters carry no baseline."
    )]
    BaselineOnIonCounter { row: usize, detector: usize },

    #[error("Row {row} has a non-finite {field}.")]
    NonFiniteValue { row: usize, field: &'static str },

    #[error("Block {0} contains no on-peak readings.")]
    BlockWithoutOnPeak(BlockId),
}

/// One raw detector reading as delivered by the importer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub time: f64,
    pub block: BlockId,
    pub cycle: u32,
    /// Detector ordinal as declared in the roster.
    pub detector: usize,
    /// Isotope ordinal; 0 is the reference isotope. Ignored for baseline rows.
    pub isotope: usize,
    pub on_peak: bool,
    pub observed: f64,
}

impl MeasurementRow {
    pub fn baseline(time: f64, block: BlockId, cycle: u32, detector: usize, observed: f64) -> Self {
        Self {
            time,
            block,
            cycle,
            detector,
            isotope: 0,
            on_peak: false,
            observed,
        }
    }

    pub fn on_peak(
        time: f64,
        block: BlockId,
        cycle: u32,
        detector: usize,
        isotope: usize,
        observed: f64,
    ) -> Self {
        Self {
            time,
            block,
            cycle,
            detector,
            isotope,
            on_peak: true,
            observed,
        }
    }
}

/// Row range and time extent of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpan {
    pub id: BlockId,
    pub rows: Range<usize>,
    /// Earliest and latest on-peak reading time in the block.
    pub time_range: (f64, f64),
    pub cycle_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MeasurementTableBuilder {
    isotope_count: usize,
    detectors: Vec<Detector>,
    rows: Vec<MeasurementRow>,
}

impl MeasurementTableBuilder {
    pub fn new(isotope_count: usize) -> Self {
        Self {
            isotope_count,
            detectors: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn detector(mut self, detector: Detector) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn push(&mut self, row: MeasurementRow) {
        self.rows.push(row);
    }

    pub fn extend<I: IntoIterator<Item = MeasurementRow>>(&mut self, rows: I) {
        self.rows.extend(rows);
    }

    pub fn build(self) -> Result<MeasurementTable, TableError> {
        let Self {
            isotope_count,
            mut detectors,
            mut rows,
        } = self;

        if isotope_count < 2 {
            return Err(TableError::TooFewIsotopes(isotope_count));
        }
        if rows.is_empty() {
            return Err(TableError::Empty);
        }

        detectors.sort_by_key(|d| d.ordinal);
        let mut detector_position = BTreeMap::new();
        for (pos, det) in detectors.iter().enumerate() {
            if detector_position.insert(det.ordinal, pos).is_some() {
                return Err(TableError::DuplicateDetector(det.ordinal));
            }
            if !(det.integration_time.is_finite() && det.integration_time > 0.0) {
                return Err(TableError::InvalidIntegrationTime {
                    ordinal: det.ordinal,
                    integration_time: det.integration_time,
                });
            }
            if !(det.noise_floor.is_finite() && det.noise_floor >= 0.0) {
                return Err(TableError::InvalidNoiseFloor {
                    ordinal: det.ordinal,
                    noise_floor: det.noise_floor,
                });
            }
        }

        let mut faraday_index = Vec::with_capacity(detectors.len());
        let mut faraday_count = 0usize;
        for det in &detectors {
            if det.is_faraday() {
                faraday_index.push(Some(faraday_count));
                faraday_count += 1;
            } else {
                faraday_index.push(None);
            }
        }

        for (idx, row) in rows.iter().enumerate() {
            if !row.time.is_finite() {
                return Err(TableError::NonFiniteValue {
                    row: idx,
                    field: "time",
                });
            }
            if !row.observed.is_finite() {
                return Err(TableError::NonFiniteValue {
                    row: idx,
                    field: "observed count",
                });
            }
            let pos = *detector_position
                .get(&row.detector)
                .ok_or(TableError::UnknownDetector {
                    row: idx,
                    detector: row.detector,
                })?;
            if row.on_peak {
                if row.isotope >= isotope_count {
                    return Err(TableError::IsotopeOutOfRange {
                        row: idx,
                        isotope: row.isotope,
                        isotope_count,
                    });
                }
            } else if detectors[pos].kind == DetectorKind::IonCounter {
                return Err(TableError::BaselineOnIonCounter {
                    row: idx,
                    detector: row.detector,
                });
            }
        }

        // Stable: rows keep their import order inside each block.
        rows.sort_by_key(|r| r.block);

        let n = rows.len();
        let mut time = Array1::<f64>::zeros(n);
        let mut observed = Array1::<f64>::zeros(n);
        let mut block_position = Vec::with_capacity(n);
        let mut cycle = Vec::with_capacity(n);
        let mut detector = Vec::with_capacity(n);
        let mut isotope = Vec::with_capacity(n);
        let mut on_peak = Vec::with_capacity(n);
        let mut blocks: Vec<BlockSpan> = Vec::new();
        let mut block_cycles: BTreeSet<u32> = BTreeSet::new();

        for (idx, row) in rows.iter().enumerate() {
            let starts_block = blocks.last().is_none_or(|b| b.id != row.block);
            if starts_block {
                if let Some(prev) = blocks.last_mut() {
                    finish_block(prev, idx, &mut block_cycles)?;
                }
                blocks.push(BlockSpan {
                    id: row.block,
                    rows: idx..idx,
                    time_range: (f64::INFINITY, f64::NEG_INFINITY),
                    cycle_count: 0,
                });
            }
            let span = blocks.len() - 1;
            if row.on_peak {
                let range = &mut blocks[span].time_range;
                range.0 = range.0.min(row.time);
                range.1 = range.1.max(row.time);
            }
            block_cycles.insert(row.cycle);

            time[idx] = row.time;
            observed[idx] = row.observed;
            block_position.push(span);
            cycle.push(row.cycle);
            detector.push(detector_position[&row.detector]);
            isotope.push(if row.on_peak { row.isotope } else { 0 });
            on_peak.push(row.on_peak);
        }
        if let Some(last) = blocks.last_mut() {
            finish_block(last, n, &mut block_cycles)?;
        }

        Ok(MeasurementTable {
            isotope_count,
            detectors,
            faraday_index,
            faraday_count,
            time,
            observed,
            block_position,
            cycle,
            detector,
            isotope,
            on_peak,
            blocks,
        })
    }
}

fn finish_block(
    span: &mut BlockSpan,
    end: usize,
    cycles: &mut BTreeSet<u32>,
) -> Result<(), TableError> {
    span.rows.end = end;
    span.cycle_count = cycles.len();
    cycles.clear();
    if !span.time_range.0.is_finite() {
        return Err(TableError::BlockWithoutOnPeak(span.id));
    }
    Ok(())
}

/// Validated measurement table. Rows are ordered by block; within a block they
/// keep the importer's order.
#[derive(Debug, Clone)]
pub struct MeasurementTable {
    isotope_count: usize,
    detectors: Vec<Detector>,
    faraday_index: Vec<Option<usize>>,
    faraday_count: usize,
    time: Array1<f64>,
    observed: Array1<f64>,
    block_position: Vec<usize>,
    cycle: Vec<u32>,
    detector: Vec<usize>,
    isotope: Vec<usize>,
    on_peak: Vec<bool>,
    blocks: Vec<BlockSpan>,
}

impl MeasurementTable {
    #[inline]
    pub fn len(&self) -> usize {
        self.observed.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    pub fn isotope_count(&self) -> usize {
        self.isotope_count
    }

    /// Number of sampled log-ratios: every isotope except the reference.
    pub fn ratio_count(&self) -> usize {
        self.isotope_count - 1
    }

    /// Detector roster sorted by ordinal.
    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    pub fn faraday_count(&self) -> usize {
        self.faraday_count
    }

    pub fn ion_counter_count(&self) -> usize {
        self.detectors.len() - self.faraday_count
    }

    /// Faraday index (baseline / noise slot) of the detector with this ordinal.
    pub fn faraday_index_of_ordinal(&self, ordinal: usize) -> Option<usize> {
        self.detectors
            .iter()
            .position(|d| d.ordinal == ordinal)
            .and_then(|pos| self.faraday_index[pos])
    }

    pub fn blocks(&self) -> &[BlockSpan] {
        &self.blocks
    }

    pub fn block_position(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    pub fn observed(&self) -> ArrayView1<'_, f64> {
        self.observed.view()
    }

    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.time.view()
    }

    /// Position of the row's block in [`MeasurementTable::blocks`].
    #[inline]
    pub fn block_of_row(&self, row: usize) -> usize {
        self.block_position[row]
    }

    #[inline]
    pub fn cycle_of_row(&self, row: usize) -> u32 {
        self.cycle[row]
    }

    #[inline]
    pub fn isotope_of_row(&self, row: usize) -> usize {
        self.isotope[row]
    }

    #[inline]
    pub fn is_on_peak(&self, row: usize) -> bool {
        self.on_peak[row]
    }

    #[inline]
    pub fn detector_of_row(&self, row: usize) -> &Detector {
        &self.detectors[self.detector[row]]
    }

    /// Faraday index of the row's detector, `None` for ion counters.
    #[inline]
    pub fn faraday_of_row(&self, row: usize) -> Option<usize> {
        self.faraday_index[self.detector[row]]
    }

    /// Reconstructs the row as it was imported.
    pub fn row(&self, row: usize) -> MeasurementRow {
        MeasurementRow {
            time: self.time[row],
            block: self.blocks[self.block_position[row]].id,
            cycle: self.cycle[row],
            detector: self.detectors[self.detector[row]].ordinal,
            isotope: self.isotope[row],
            on_peak: self.on_peak[row],
            observed: self.observed[row],
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = MeasurementRow> + '_ {
        (0..self.len()).map(|r| self.row(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_detector_builder() -> MeasurementTableBuilder {
        MeasurementTableBuilder::new(2)
            .detector(Detector::faraday(3))
            .detector(Detector::ion_counter(7))
    }

    #[test]
    fn groups_rows_by_block_and_tracks_spans() {
        let mut builder = two_detector_builder();
        builder.push(MeasurementRow::on_peak(10.0, BlockId(2), 1, 3, 1, 5.0));
        builder.push(MeasurementRow::on_peak(0.0, BlockId(1), 1, 3, 0, 4.0));
        builder.push(MeasurementRow::baseline(-1.0, BlockId(1), 1, 3, 0.1));
        builder.push(MeasurementRow::on_peak(12.0, BlockId(2), 2, 7, 0, 6.0));
        builder.push(MeasurementRow::on_peak(3.0, BlockId(1), 2, 7, 1, 2.0));

        let table = builder.build().expect("table should build");
        assert_eq!(table.len(), 5);
        assert_eq!(table.blocks().len(), 2);

        let first = &table.blocks()[0];
        assert_eq!(first.id, BlockId(1));
        assert_eq!(first.rows, 0..3);
        // Baseline readings do not widen the on-peak time span.
        assert_eq!(first.time_range, (0.0, 3.0));
        assert_eq!(first.cycle_count, 2);

        let second = &table.blocks()[1];
        assert_eq!(second.rows, 3..5);
        assert_eq!(second.time_range, (10.0, 12.0));

        assert_eq!(table.faraday_count(), 1);
        assert_eq!(table.ion_counter_count(), 1);
        assert_eq!(table.faraday_index_of_ordinal(3), Some(0));
        assert_eq!(table.faraday_index_of_ordinal(7), None);
        assert_eq!(table.row(1).detector, 3);
        assert!(!table.row(1).on_peak);
    }

    #[test]
    fn rejects_baseline_on_ion_counter() {
        let mut builder = two_detector_builder();
        builder.push(MeasurementRow::on_peak(0.0, BlockId(0), 0, 3, 0, 1.0));
        builder.push(MeasurementRow::baseline(0.0, BlockId(0), 0, 7, 1.0));
        assert_eq!(
            builder.build().unwrap_err(),
            TableError::BaselineOnIonCounter { row: 1, detector: 7 }
        );
    }

    #[test]
    fn rejects_unknown_detector_and_isotope() {
        let mut builder = two_detector_builder();
        builder.push(MeasurementRow::on_peak(0.0, BlockId(0), 0, 4, 0, 1.0));
        assert!(matches!(
            builder.build(),
            Err(TableError::UnknownDetector { detector: 4, .. })
        ));

        let mut builder = two_detector_builder();
        builder.push(MeasurementRow::on_peak(0.0, BlockId(0), 0, 3, 2, 1.0));
        assert!(matches!(
            builder.build(),
            Err(TableError::IsotopeOutOfRange { isotope: 2, .. })
        ));
    }

    #[test]
    fn rejects_block_without_on_peak_rows() {
        let mut builder = two_detector_builder();
        builder.push(MeasurementRow::on_peak(0.0, BlockId(0), 0, 3, 0, 1.0));
        builder.push(MeasurementRow::baseline(1.0, BlockId(1), 0, 3, 1.0));
        assert_eq!(
            builder.build().unwrap_err(),
            TableError::BlockWithoutOnPeak(BlockId(1))
        );
    }

    #[test]
    fn rejects_non_finite_readings() {
        let mut builder = two_detector_builder();
        builder.push(MeasurementRow::on_peak(0.0, BlockId(0), 0, 3, 0, f64::NAN));
        assert!(matches!(
            builder.build(),
            Err(TableError::NonFiniteValue { row: 0, .. })
        ));
    }
}
