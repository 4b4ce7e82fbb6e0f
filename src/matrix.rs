//! Sparse matrices: a [`Sparsity`] plus one value per structural nonzero.

use crate::error::{Error, Result};
use crate::sparse::Sparsity;
use crate::sx::Sx;

/// Matrix of `T` stored by its nonzeros in row-major order.
#[derive(Clone, Debug)]
pub struct Matrix<T> {
    sparsity: Sparsity,
    data: Vec<T>,
}

/// Symbolic matrix.
pub type SxMatrix = Matrix<Sx>;
/// Numeric matrix.
pub type DMatrix = Matrix<f64>;

impl<T> Matrix<T> {
    pub fn new(sparsity: Sparsity, data: Vec<T>) -> Result<Self> {
        if data.len() != sparsity.nnz() {
            return Err(Error::InvalidSparsity(format!(
                "{} values for a pattern with {} nonzeros",
                data.len(),
                sparsity.nnz()
            )));
        }
        Ok(Matrix { sparsity, data })
    }

    pub(crate) fn from_parts(sparsity: Sparsity, data: Vec<T>) -> Self {
        debug_assert_eq!(sparsity.nnz(), data.len());
        Matrix { sparsity, data }
    }

    pub fn sparsity(&self) -> &Sparsity {
        &self.sparsity
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn nrow(&self) -> usize {
        self.sparsity.nrow()
    }

    pub fn ncol(&self) -> usize {
        self.sparsity.ncol()
    }

    pub fn is_scalar(&self) -> bool {
        self.sparsity.is_scalar()
    }

    /// Value at `(r, c)` if structurally present.
    pub fn get(&self, r: usize, c: usize) -> Option<&T> {
        self.sparsity.get_nz(r, c).map(|k| &self.data[k])
    }

    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Matrix<U> {
        Matrix {
            sparsity: self.sparsity.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }
}

impl<T: Clone> Matrix<T> {
    pub fn filled(sparsity: Sparsity, value: T) -> Self {
        let data = vec![value; sparsity.nnz()];
        Matrix { sparsity, data }
    }

    /// Transposed matrix.
    pub fn transpose(&self) -> Self {
        let (sparsity, mapping) = self.sparsity.transpose_with_mapping();
        let data = mapping.iter().map(|&k| self.data[k].clone()).collect();
        Matrix { sparsity, data }
    }
}

impl Matrix<Sx> {
    /// Dense `nrow x ncol` matrix of fresh symbols `name_0, name_1, ...`
    /// (a plain `name` when scalar).
    pub fn sym(name: &str, nrow: usize, ncol: usize) -> Self {
        Self::sym_with(name, Sparsity::dense(nrow, ncol))
    }

    /// Fresh symbols on the nonzeros of `sparsity`.
    pub fn sym_with(name: &str, sparsity: Sparsity) -> Self {
        let n = sparsity.nnz();
        let data = if n == 1 && sparsity.is_scalar() {
            vec![Sx::sym(name)]
        } else {
            (0..n).map(|k| Sx::sym(format!("{name}_{k}"))).collect()
        };
        Matrix { sparsity, data }
    }

    /// Dense column of the given expressions.
    pub fn column(entries: Vec<Sx>) -> Self {
        let sparsity = Sparsity::column(entries.len());
        Matrix {
            sparsity,
            data: entries,
        }
    }

    /// Nonzero expressions in storage order.
    pub fn elements(&self) -> &[Sx] {
        &self.data
    }
}

impl From<Sx> for Matrix<Sx> {
    fn from(value: Sx) -> Self {
        Matrix {
            sparsity: Sparsity::scalar(),
            data: vec![value],
        }
    }
}

impl Matrix<f64> {
    /// Dense matrix from row-major values.
    pub fn dense(nrow: usize, ncol: usize, values: Vec<f64>) -> Result<Self> {
        Matrix::new(Sparsity::dense(nrow, ncol), values)
    }

    /// Dense row-major copy, zeros filled in.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut out = vec![vec![0.0; self.ncol()]; self.nrow()];
        for (k, (r, c)) in self.sparsity.triplets().into_iter().enumerate() {
            out[r][c] = self.data[k];
        }
        out
    }
}
