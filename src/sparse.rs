//! Sparsity patterns in compressed row storage.

use std::fmt;

use crate::error::{Error, Result};

/// Structural nonzero pattern of a 2-D array.
///
/// Compressed row storage: the column indices of row `r` are
/// `col[rowind[r]..rowind[r + 1]]`, strictly increasing within a row.
/// Nonzeros are numbered row-major in that order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sparsity {
    nrow: usize,
    ncol: usize,
    rowind: Vec<usize>,
    col: Vec<usize>,
}

impl Sparsity {
    /// Build a pattern from raw compressed-row arrays, validating them.
    pub fn new(nrow: usize, ncol: usize, rowind: Vec<usize>, col: Vec<usize>) -> Result<Self> {
        if rowind.len() != nrow + 1 {
            return Err(Error::InvalidSparsity(format!(
                "rowind has length {}, expected {}",
                rowind.len(),
                nrow + 1
            )));
        }
        if rowind[0] != 0 || rowind[nrow] != col.len() {
            return Err(Error::InvalidSparsity(
                "rowind must start at 0 and end at the number of nonzeros".into(),
            ));
        }
        for r in 0..nrow {
            if rowind[r] > rowind[r + 1] {
                return Err(Error::InvalidSparsity(format!("rowind decreases at row {r}")));
            }
            let row = &col[rowind[r]..rowind[r + 1]];
            if row.iter().any(|&c| c >= ncol) {
                return Err(Error::InvalidSparsity(format!("column out of range in row {r}")));
            }
            if row.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::InvalidSparsity(format!(
                    "columns of row {r} are not strictly increasing"
                )));
            }
        }
        Ok(Sparsity {
            nrow,
            ncol,
            rowind,
            col,
        })
    }

    /// Pattern with every entry present.
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        let rowind = (0..=nrow).map(|r| r * ncol).collect();
        let col = (0..nrow).flat_map(|_| 0..ncol).collect();
        Sparsity {
            nrow,
            ncol,
            rowind,
            col,
        }
    }

    /// Pattern with no entries.
    pub fn empty(nrow: usize, ncol: usize) -> Self {
        Sparsity {
            nrow,
            ncol,
            rowind: vec![0; nrow + 1],
            col: Vec::new(),
        }
    }

    /// Dense 1x1 pattern.
    pub fn scalar() -> Self {
        Sparsity::dense(1, 1)
    }

    /// Dense column vector.
    pub fn column(n: usize) -> Self {
        Sparsity::dense(n, 1)
    }

    /// Square pattern with the diagonal present.
    pub fn diagonal(n: usize) -> Self {
        Sparsity {
            nrow: n,
            ncol: n,
            rowind: (0..=n).collect(),
            col: (0..n).collect(),
        }
    }

    /// Build from (row, col) pairs. Duplicates are merged; order is free.
    ///
    /// # Panics
    ///
    /// Panics if a pair lies outside the `nrow x ncol` shape.
    pub fn from_triplets(nrow: usize, ncol: usize, entries: &[(usize, usize)]) -> Self {
        let mut counts = vec![0usize; nrow + 1];
        for &(r, c) in entries {
            assert!(r < nrow && c < ncol, "entry ({r}, {c}) outside {nrow}x{ncol}");
            counts[r + 1] += 1;
        }
        for r in 0..nrow {
            counts[r + 1] += counts[r];
        }
        let mut col = vec![0usize; entries.len()];
        let mut next = counts.clone();
        for &(r, c) in entries {
            col[next[r]] = c;
            next[r] += 1;
        }

        // Sort and dedup each row in place, compacting as we go.
        let mut rowind = vec![0usize; nrow + 1];
        let mut write = 0;
        for r in 0..nrow {
            let row = &mut col[counts[r]..counts[r + 1]];
            row.sort_unstable();
            let mut last = None;
            for k in counts[r]..counts[r + 1] {
                let c = col[k];
                if last != Some(c) {
                    col[write] = c;
                    write += 1;
                    last = Some(c);
                }
            }
            rowind[r + 1] = write;
        }
        col.truncate(write);
        Sparsity {
            nrow,
            ncol,
            rowind,
            col,
        }
    }

    pub fn nrow(&self) -> usize {
        self.nrow
    }

    pub fn ncol(&self) -> usize {
        self.ncol
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    /// Number of structural nonzeros.
    pub fn nnz(&self) -> usize {
        self.col.len()
    }

    /// Number of elements, `nrow * ncol`.
    pub fn numel(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn rowind(&self) -> &[usize] {
        &self.rowind
    }

    pub fn col(&self) -> &[usize] {
        &self.col
    }

    /// Column indices of row `r`.
    pub fn row(&self, r: usize) -> &[usize] {
        &self.col[self.rowind[r]..self.rowind[r + 1]]
    }

    /// Nonzero index range of row `r`.
    pub fn row_range(&self, r: usize) -> std::ops::Range<usize> {
        self.rowind[r]..self.rowind[r + 1]
    }

    pub fn is_dense(&self) -> bool {
        self.nnz() == self.numel()
    }

    pub fn is_empty(&self) -> bool {
        self.col.is_empty()
    }

    /// A single element (`1x1`), whether or not it is structurally present.
    pub fn is_scalar(&self) -> bool {
        self.nrow == 1 && self.ncol == 1
    }

    pub fn is_square(&self) -> bool {
        self.nrow == self.ncol
    }

    /// Position of entry `(r, c)` among the nonzeros.
    pub fn get_nz(&self, r: usize, c: usize) -> Option<usize> {
        if r >= self.nrow {
            return None;
        }
        let row = self.row(r);
        row.binary_search(&c).ok().map(|k| self.rowind[r] + k)
    }

    pub fn contains(&self, r: usize, c: usize) -> bool {
        self.get_nz(r, c).is_some()
    }

    /// Row index of every nonzero.
    pub fn row_indices(&self) -> Vec<usize> {
        let mut rows = Vec::with_capacity(self.nnz());
        for r in 0..self.nrow {
            rows.extend(std::iter::repeat(r).take(self.rowind[r + 1] - self.rowind[r]));
        }
        rows
    }

    /// `(row, col)` of every nonzero, in storage order.
    pub fn triplets(&self) -> Vec<(usize, usize)> {
        self.row_indices().into_iter().zip(self.col.iter().copied()).collect()
    }

    /// Row-major linear index `r * ncol + c` of every nonzero.
    pub fn elements(&self) -> Vec<usize> {
        self.triplets()
            .into_iter()
            .map(|(r, c)| r * self.ncol + c)
            .collect()
    }

    /// Transposed pattern.
    pub fn transpose(&self) -> Sparsity {
        self.transpose_with_mapping().0
    }

    /// Transposed pattern plus, for every nonzero of the transpose, the
    /// index of the corresponding nonzero of `self`.
    pub fn transpose_with_mapping(&self) -> (Sparsity, Vec<usize>) {
        let mut rowind = vec![0usize; self.ncol + 1];
        for &c in &self.col {
            rowind[c + 1] += 1;
        }
        for c in 0..self.ncol {
            rowind[c + 1] += rowind[c];
        }
        let mut next = rowind.clone();
        let mut col = vec![0usize; self.nnz()];
        let mut mapping = vec![0usize; self.nnz()];
        for r in 0..self.nrow {
            for k in self.row_range(r) {
                let c = self.col[k];
                col[next[c]] = r;
                mapping[next[c]] = k;
                next[c] += 1;
            }
        }
        let t = Sparsity {
            nrow: self.ncol,
            ncol: self.nrow,
            rowind,
            col,
        };
        (t, mapping)
    }

    /// Union of two patterns of the same shape.
    pub fn union(&self, other: &Sparsity) -> Sparsity {
        assert_eq!(self.shape(), other.shape(), "union of differently shaped patterns");
        let mut entries = self.triplets();
        entries.extend(other.triplets());
        Sparsity::from_triplets(self.nrow, self.ncol, &entries)
    }

    /// Smallest symmetric pattern containing a square `self`.
    pub fn symmetrize(&self) -> Sparsity {
        self.union(&self.transpose())
    }

    /// Structural symmetry: `(r, c)` present iff `(c, r)` is.
    pub fn is_symmetric(&self) -> bool {
        self.is_square() && *self == self.transpose()
    }

    /// Embed into a larger `nrow x ncol` shape, sending row `r` to
    /// `row_map[r]` and column `c` to `col_map[c]`. Both maps must be
    /// strictly increasing, so nonzero order is preserved.
    pub fn enlarge(&self, nrow: usize, ncol: usize, row_map: &[usize], col_map: &[usize]) -> Sparsity {
        assert_eq!(row_map.len(), self.nrow, "row map length");
        assert_eq!(col_map.len(), self.ncol, "column map length");
        let entries: Vec<(usize, usize)> = self
            .triplets()
            .into_iter()
            .map(|(r, c)| (row_map[r], col_map[c]))
            .collect();
        Sparsity::from_triplets(nrow, ncol, &entries)
    }
}

impl fmt::Display for Sparsity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}x{}, {} nnz", self.nrow, self.ncol, self.nnz())?;
        for r in 0..self.nrow {
            let mut line = vec!['.'; self.ncol];
            for &c in self.row(r) {
                line[c] = '*';
            }
            writeln!(f, "{}", line.into_iter().collect::<String>())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triplets_are_sorted_and_deduplicated() {
        let sp = Sparsity::from_triplets(3, 3, &[(2, 1), (0, 2), (0, 0), (2, 1), (1, 1)]);
        assert_eq!(sp.nnz(), 4);
        assert_eq!(sp.rowind(), &[0, 2, 3, 4]);
        assert_eq!(sp.col(), &[0, 2, 1, 1]);
    }

    #[test]
    fn transpose_mapping_points_back() {
        let sp = Sparsity::from_triplets(2, 3, &[(0, 1), (0, 2), (1, 0), (1, 2)]);
        let (t, map) = sp.transpose_with_mapping();
        assert_eq!(t.shape(), (3, 2));
        let orig = sp.triplets();
        for (k, (r, c)) in t.triplets().into_iter().enumerate() {
            assert_eq!(orig[map[k]], (c, r));
        }
    }

    #[test]
    fn symmetrize_adds_missing_mirrors() {
        let sp = Sparsity::from_triplets(3, 3, &[(1, 0), (1, 1), (2, 2)]);
        assert!(!sp.is_symmetric());
        let sym = sp.symmetrize();
        assert!(sym.is_symmetric());
        assert_eq!(sym.triplets(), vec![(0, 1), (1, 0), (1, 1), (2, 2)]);
        assert_eq!(sym.symmetrize(), sym);
    }

    #[test]
    fn get_nz_and_contains() {
        let sp = Sparsity::diagonal(3);
        assert_eq!(sp.get_nz(1, 1), Some(1));
        assert!(!sp.contains(0, 1));
        assert!(sp.is_symmetric());
    }

    #[test]
    fn new_rejects_unsorted_rows() {
        let err = Sparsity::new(1, 3, vec![0, 2], vec![2, 1]).unwrap_err();
        assert!(matches!(err, Error::InvalidSparsity(_)));
    }

    #[test]
    fn enlarge_keeps_nonzero_order() {
        let sp = Sparsity::dense(2, 2);
        let big = sp.enlarge(3, 4, &[0, 2], &[1, 3]);
        assert_eq!(big.triplets(), vec![(0, 1), (0, 3), (2, 1), (2, 3)]);
    }
}
