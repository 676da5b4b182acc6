//! Clamped B-spline bases describing the beam intensity inside each block.
//!
//! Each block gets its own basis on the on-peak time span of that block. The
//! basis is fixed for a run, so the forward model evaluates it once per row and
//! keeps only the `degree + 1` non-zero weights together with the index of the
//! first supporting knot coefficient.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while constructing a block basis.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Time range is invalid: start ({0}) must be finite and not exceed end ({1}).")]
    InvalidRange(f64, f64),

    #[error(
        "A degree {degree} spline needs at least {required} coefficients, but {requested} were requested."
    )]
    TooFewCoefficients {
        degree: usize,
        required: usize,
        requested: usize,
    },
}

/// Scratch buffers for the Cox-de Boor recursion, reused across rows.
#[derive(Clone, Debug)]
pub struct BsplineScratch {
    left: Vec<f64>,
    right: Vec<f64>,
    n: Vec<f64>,
}

impl BsplineScratch {
    #[inline]
    pub fn new(degree: usize) -> Self {
        let len = degree + 1;
        Self {
            left: vec![0.0; len],
            right: vec![0.0; len],
            n: vec![0.0; len],
        }
    }

    #[inline]
    fn ensure_degree(&mut self, degree: usize) {
        let len = degree + 1;
        if self.left.len() != len {
            self.left.resize(len, 0.0);
            self.right.resize(len, 0.0);
            self.n.resize(len, 0.0);
        }
    }
}

/// Knot vector with `degree + 1` repeated boundary knots and uniformly spaced
/// interior knots.
pub fn clamped_knot_vector(
    range: (f64, f64),
    num_internal_knots: usize,
    degree: usize,
) -> Array1<f64> {
    let (lo, hi) = range;
    let h = (hi - lo) / (num_internal_knots as f64 + 1.0);
    let mut knots = Vec::with_capacity(num_internal_knots + 2 * (degree + 1));
    knots.extend(std::iter::repeat_n(lo, degree + 1));
    knots.extend((1..=num_internal_knots).map(|i| lo + i as f64 * h));
    knots.extend(std::iter::repeat_n(hi, degree + 1));
    Array1::from_vec(knots)
}

/// Evaluates the `degree + 1` basis functions that are non-zero at `x`.
///
/// Writes them into `out` and returns the index of the first one. Points
/// outside the knot domain use the boundary span, so evaluation extrapolates
/// the end polynomial rather than returning zeros.
pub fn evaluate_splines_sparse_into(
    x: f64,
    degree: usize,
    knots: ArrayView1<'_, f64>,
    out: &mut [f64],
    scratch: &mut BsplineScratch,
) -> usize {
    let num_basis = knots.len() - degree - 1;
    debug_assert_eq!(out.len(), degree + 1);

    scratch.ensure_degree(degree);
    scratch.n.fill(0.0);
    scratch.left.fill(0.0);
    scratch.right.fill(0.0);

    let mu = if x >= knots[num_basis] {
        num_basis - 1
    } else if x < knots[degree] {
        degree
    } else {
        let mut span = degree;
        while span < num_basis && x >= knots[span + 1] {
            span += 1;
        }
        span
    };

    let left = &mut scratch.left;
    let right = &mut scratch.right;
    let n = &mut scratch.n;
    n[0] = 1.0;

    for d in 1..=degree {
        left[d] = x - knots[mu + 1 - d];
        right[d] = knots[mu + d] - x;
        let mut saved = 0.0;
        for r in 0..d {
            let den = right[r + 1] + left[d - r];
            let temp = if den.abs() > 1e-12 { n[r] / den } else { 0.0 };
            n[r] = saved + right[r + 1] * temp;
            saved = left[d - r] * temp;
        }
        n[d] = saved;
    }

    out.copy_from_slice(&n[..=degree]);
    mu - degree
}

/// Number of knot coefficients for a block spanning `cycle_count` cycles.
pub fn coefficient_count(cycle_count: usize, cycles_per_knot: usize, degree: usize) -> usize {
    let internal = cycle_count
        .div_ceil(cycles_per_knot.max(1))
        .saturating_sub(1);
    internal + degree + 1
}

/// Fixed spline basis of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockBasis {
    degree: usize,
    knots: Array1<f64>,
}

impl BlockBasis {
    pub fn new(
        time_range: (f64, f64),
        num_basis: usize,
        degree: usize,
    ) -> Result<Self, BasisError> {
        if degree < 1 {
            return Err(BasisError::InvalidDegree(degree));
        }
        let (lo, hi) = time_range;
        if !(lo.is_finite() && hi.is_finite()) || lo > hi {
            return Err(BasisError::InvalidRange(lo, hi));
        }
        if num_basis < degree + 1 {
            return Err(BasisError::TooFewCoefficients {
                degree,
                required: degree + 1,
                requested: num_basis,
            });
        }
        // A single-instant block still needs a non-degenerate domain.
        let range = if lo == hi { (lo - 0.5, hi + 0.5) } else { (lo, hi) };
        let knots = clamped_knot_vector(range, num_basis - degree - 1, degree);
        Ok(Self { degree, knots })
    }

    #[inline]
    pub fn degree(&self) -> usize {
        self.degree
    }

    #[inline]
    pub fn num_basis(&self) -> usize {
        self.knots.len() - self.degree - 1
    }

    pub fn knots(&self) -> ArrayView1<'_, f64> {
        self.knots.view()
    }

    /// Returns the first supporting coefficient index and writes the weights.
    pub fn evaluate_into(&self, x: f64, out: &mut [f64], scratch: &mut BsplineScratch) -> usize {
        evaluate_splines_sparse_into(x, self.degree, self.knots.view(), out, scratch)
    }

    /// Dense design matrix, one row per time point.
    pub fn design_matrix(&self, times: ArrayView1<'_, f64>) -> Array2<f64> {
        let mut design = Array2::<f64>::zeros((times.len(), self.num_basis()));
        let mut scratch = BsplineScratch::new(self.degree);
        let mut weights = vec![0.0; self.degree + 1];
        for (row, &t) in times.iter().enumerate() {
            let start = self.evaluate_into(t, &mut weights, &mut scratch);
            for (k, &w) in weights.iter().enumerate() {
                design[[row, start + k]] = w;
            }
        }
        design
    }
}
