use ndarray::Array2;

/// Compensated summation for long likelihood sums over many rows.
#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

pub(crate) fn add_ridge(matrix: &Array2<f64>, ridge: f64) -> Array2<f64> {
    let mut regularized = matrix.clone();
    if ridge > 0.0 {
        regularized.diag_mut().mapv_inplace(|d| d + ridge);
    }
    regularized
}

/// Replaces `m` by `(m + mᵀ) / 2`.
pub(crate) fn symmetrize_in_place(m: &mut Array2<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in i + 1..n {
            let avg = 0.5 * (m[[i, j]] + m[[j, i]]);
            m[[i, j]] = avg;
            m[[j, i]] = avg;
        }
    }
}
