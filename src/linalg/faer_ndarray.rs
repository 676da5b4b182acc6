//! Zero-copy bridge between `ndarray` containers and `faer` factorizations.

use faer::linalg::solvers::{self, Solve};
use faer::{MatMut, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Matrix must be square, but has shape {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },
    #[error("Matrix contains non-finite entries.")]
    NonFinite,
}

/// Borrowed `faer` view of an `ndarray` matrix.
///
/// Layouts with non-positive strides are copied into an owned buffer first.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = match &self.owned {
            Some(owned) => {
                let strides = owned.strides();
                (
                    owned.as_ptr(),
                    owned.nrows(),
                    owned.ncols(),
                    strides[0],
                    strides[1],
                )
            }
            None => (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            ),
        };
        // SAFETY: pointer, shape and strides come either from a live ndarray
        // borrowed for 'a with positive strides, or from the owned copy held by
        // `self`, so the view stays valid for the returned lifetime.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

#[inline]
fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: the view covers exactly the elements of `array`, which stays
    // mutably borrowed for the lifetime of the returned matrix.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

pub(crate) fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    /// Solves `A x = rhs` for the factored `A`.
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut out = rhs.as_standard_layout().into_owned();
        let mut view = array1_to_col_mat_mut(&mut out);
        self.factor.solve_in_place(view.as_mut());
        out
    }

    /// Lower-triangular factor `L` with `L Lᵀ = A`.
    pub fn lower_triangular(&self) -> Array2<f64> {
        let mut l = mat_to_array(self.factor.L());
        // faer leaves the strict upper triangle unspecified.
        let n = l.nrows();
        for i in 0..n {
            for j in i + 1..n {
                l[[i, j]] = 0.0;
            }
        }
        l
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let (rows, cols) = self.dim();
        if rows != cols {
            return Err(FaerLinalgError::NotSquare { rows, cols });
        }
        if !self.iter().all(|v| v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn cholesky_factor_reconstructs_matrix() {
        let a = array![[4.0, 2.0, 0.4], [2.0, 5.0, 1.0], [0.4, 1.0, 3.0]];
        let l = a.cholesky(Side::Lower).unwrap().lower_triangular();
        assert_eq!(l[[0, 1]], 0.0);
        let rebuilt = l.dot(&l.t());
        for (x, y) in rebuilt.iter().zip(a.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn solve_matches_direct_product() {
        let a = array![[2.0, 0.5], [0.5, 1.0]];
        let x = array![1.5, -2.0];
        let b = a.dot(&x);
        let solved = a.cholesky(Side::Lower).unwrap().solve_vec(&b);
        assert_abs_diff_eq!(solved[0], x[0], epsilon = 1e-12);
        assert_abs_diff_eq!(solved[1], x[1], epsilon = 1e-12);
    }

    #[test]
    fn indefinite_matrix_is_rejected() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(
            a.cholesky(Side::Lower),
            Err(FaerLinalgError::Cholesky(_))
        ));
        let rect = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            rect.cholesky(Side::Lower),
            Err(FaerLinalgError::NotSquare { rows: 2, cols: 3 })
        ));
    }
}
