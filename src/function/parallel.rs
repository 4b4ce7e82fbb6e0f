use rayon::prelude::*;

use crate::error::Result;
use crate::matrix::DMatrix;

use super::Function;

impl Function {
    /// Parallel [`call_batch`](Function::call_batch).
    ///
    /// Takes `&self`: every rayon worker evaluates on its own clone of this
    /// Function, so no buffers are shared between threads. Results keep the
    /// order of `batch`.
    pub fn call_batch_par(&self, batch: &[Vec<Vec<f64>>]) -> Result<Vec<Vec<Vec<f64>>>> {
        batch
            .par_iter()
            .map_init(
                || self.clone(),
                |f, args| {
                    let refs: Vec<&[f64]> = args.iter().map(Vec::as_slice).collect();
                    f.call(&refs)
                },
            )
            .collect()
    }

    /// Parallel [`sparse_jacobian_values`](Function::sparse_jacobian_values)
    /// at every point of `points` (one argument list per point).
    pub fn sparse_jacobian_values_par(
        &self,
        iind: usize,
        oind: usize,
        points: &[Vec<Vec<f64>>],
    ) -> Result<Vec<DMatrix>> {
        self.partition(iind, oind, true, false)?;
        points
            .par_iter()
            .map_init(
                || self.clone(),
                |f, args| {
                    for (k, x) in args.iter().enumerate() {
                        f.set_input(k, x)?;
                    }
                    f.sparse_jacobian_values(iind, oind, false)
                },
            )
            .collect()
    }
}
