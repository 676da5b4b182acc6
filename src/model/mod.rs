//! Intensity model: parameter layout, forward model, variance model and
//! likelihood, combined by [`Evaluator`].

pub mod forward;
pub mod likelihood;
pub mod state;
pub mod variance;

pub use forward::{ForwardModel, Prediction};
pub use likelihood::{LikelihoodEvaluation, log_likelihood};
pub use state::{ModelState, ParameterGroup, ParameterLayout, ParameterSlot};
pub use variance::{VARIANCE_FLOOR, row_variances};

use crate::data::MeasurementTable;
use ndarray::Array1;

/// Cached model output for one state.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub prediction: Prediction,
    pub variance: Array1<f64>,
    pub score: LikelihoodEvaluation,
}

impl Evaluation {
    #[inline]
    pub fn log_likelihood(&self) -> f64 {
        self.score.log_likelihood
    }
}

/// Runs forward, variance and likelihood for a state against one table.
#[derive(Debug, Clone)]
pub struct Evaluator<'a> {
    forward: ForwardModel<'a>,
}

impl<'a> Evaluator<'a> {
    pub fn new(table: &'a MeasurementTable, layout: &ParameterLayout) -> Self {
        Self {
            forward: ForwardModel::new(table, layout),
        }
    }

    pub fn table(&self) -> &'a MeasurementTable {
        self.forward.table()
    }

    pub fn forward(&self) -> &ForwardModel<'a> {
        &self.forward
    }

    pub fn evaluate(&self, state: &ModelState) -> Evaluation {
        let table = self.table();
        let prediction = self.forward.predict(state);
        let variance = row_variances(table, state, &prediction);
        let score = log_likelihood(
            table.observed(),
            prediction.predicted.view(),
            variance.view(),
        );
        Evaluation {
            prediction,
            variance,
            score,
        }
    }

    /// Reuses the buffers of `out`.
    pub fn evaluate_into(&self, state: &ModelState, out: &mut Evaluation) {
        let table = self.table();
        self.forward.predict_into(state, &mut out.prediction);
        variance::row_variances_into(table, state, &out.prediction, &mut out.variance);
        out.score = log_likelihood(
            table.observed(),
            out.prediction.predicted.view(),
            out.variance.view(),
        );
    }

    pub fn log_likelihood(&self, state: &ModelState) -> f64 {
        self.evaluate(state).log_likelihood()
    }
}
