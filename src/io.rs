//! Input/output, seed and sensitivity buffers of one Function instance.

use crate::scalar::Scalar;

/// Buffers a tape reads from and writes to.
///
/// Forward seeds are indexed `[dir][input][nz]` and produce forward
/// sensitivities `[dir][output][nz]`; adjoint seeds `[dir][output][nz]`
/// produce adjoint sensitivities `[dir][input][nz]`. The number of
/// allocated directions is the capacity; a call may use fewer.
#[derive(Clone, Debug)]
pub(crate) struct IoBuffers<T> {
    pub input: Vec<Vec<T>>,
    pub output: Vec<Vec<T>>,
    pub fwd_seed: Vec<Vec<Vec<T>>>,
    pub fwd_sens: Vec<Vec<Vec<T>>>,
    pub adj_seed: Vec<Vec<Vec<T>>>,
    pub adj_sens: Vec<Vec<Vec<T>>>,
}

fn slots<T: Clone>(nnz: &[usize], value: &T) -> Vec<Vec<T>> {
    nnz.iter().map(|&n| vec![value.clone(); n]).collect()
}

impl<T: Clone> IoBuffers<T> {
    pub fn new(input_nnz: &[usize], output_nnz: &[usize], nfwd: usize, nadj: usize, zero: T) -> Self {
        IoBuffers {
            input: slots(input_nnz, &zero),
            output: slots(output_nnz, &zero),
            fwd_seed: vec![slots(input_nnz, &zero); nfwd],
            fwd_sens: vec![slots(output_nnz, &zero); nfwd],
            adj_seed: vec![slots(output_nnz, &zero); nadj],
            adj_sens: vec![slots(input_nnz, &zero); nadj],
        }
    }

    pub fn nfwd(&self) -> usize {
        self.fwd_seed.len()
    }

    pub fn nadj(&self) -> usize {
        self.adj_seed.len()
    }

    /// Grow or shrink the direction capacity. New directions are zero.
    pub fn resize_directions(&mut self, nfwd: usize, nadj: usize, zero: T) {
        let input_nnz: Vec<usize> = self.input.iter().map(Vec::len).collect();
        let output_nnz: Vec<usize> = self.output.iter().map(Vec::len).collect();
        self.fwd_seed.resize(nfwd, slots(&input_nnz, &zero));
        self.fwd_sens.resize(nfwd, slots(&output_nnz, &zero));
        self.adj_seed.resize(nadj, slots(&output_nnz, &zero));
        self.adj_sens.resize(nadj, slots(&input_nnz, &zero));
    }
}

/// Where each direction went during compression: its compacted slot, or
/// `None` when the seed was all zero and the direction was skipped.
pub(crate) type Compaction = Vec<Option<usize>>;

fn is_zero_direction<T: Scalar>(seed: &[Vec<T>]) -> bool {
    seed.iter().all(|v| v.iter().all(T::is_zero))
}

/// Move the nonzero seeds among the first `n` to the front, by swapping.
fn compact<T: Scalar>(seeds: &mut [Vec<Vec<T>>], n: usize) -> (Compaction, usize) {
    let mut map = Vec::with_capacity(n);
    let mut count = 0;
    for dir in 0..n {
        if is_zero_direction(&seeds[dir]) {
            map.push(None);
        } else {
            seeds.swap(count, dir);
            map.push(Some(count));
            count += 1;
        }
    }
    (map, count)
}

/// Undo [`compact`] on both seeds and sensitivities, then zero the
/// sensitivities of the skipped directions. Swaps are undone in reverse
/// order so no slot is read after being overwritten.
fn expand<T: Scalar>(seeds: &mut [Vec<Vec<T>>], sens: &mut [Vec<Vec<T>>], map: &Compaction) {
    for dir in (0..map.len()).rev() {
        if let Some(slot) = map[dir] {
            seeds.swap(slot, dir);
            sens.swap(slot, dir);
        }
    }
    for (dir, slot) in map.iter().enumerate() {
        if slot.is_none() {
            for v in sens[dir].iter_mut() {
                v.iter_mut().for_each(|x| *x = T::zero());
            }
        }
    }
}

impl<T: Scalar> IoBuffers<T> {
    /// Compact the first `nfwd` forward and `nadj` adjoint directions.
    /// Returns the maps and the compacted counts.
    pub fn compress(&mut self, nfwd: usize, nadj: usize) -> (Compaction, usize, Compaction, usize) {
        let (fmap, nf) = compact(&mut self.fwd_seed, nfwd);
        let (amap, na) = compact(&mut self.adj_seed, nadj);
        (fmap, nf, amap, na)
    }

    pub fn decompress(&mut self, fmap: &Compaction, amap: &Compaction) {
        expand(&mut self.fwd_seed, &mut self.fwd_sens, fmap);
        expand(&mut self.adj_seed, &mut self.adj_sens, amap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_round_trip_restores_seeds() {
        let mut io = IoBuffers::new(&[3], &[3], 3, 0, 0.0);
        io.fwd_seed[0][0] = vec![1.0, 0.0, 0.0];
        io.fwd_seed[2][0] = vec![0.0, 0.0, 1.0];
        let (fmap, nf, amap, na) = io.compress(3, 0);
        assert_eq!((nf, na), (2, 0));
        assert_eq!(fmap, vec![Some(0), None, Some(1)]);
        assert_eq!(io.fwd_seed[1][0], vec![0.0, 0.0, 1.0]);

        // pretend a sweep copied seeds to sensitivities
        for d in 0..nf {
            io.fwd_sens[d] = io.fwd_seed[d].clone();
        }
        io.fwd_sens[2][0] = vec![9.0, 9.0, 9.0];
        io.decompress(&fmap, &amap);
        assert_eq!(io.fwd_seed[0][0], vec![1.0, 0.0, 0.0]);
        assert_eq!(io.fwd_seed[1][0], vec![0.0, 0.0, 0.0]);
        assert_eq!(io.fwd_seed[2][0], vec![0.0, 0.0, 1.0]);
        assert_eq!(io.fwd_sens[1][0], vec![0.0, 0.0, 0.0]);
        assert_eq!(io.fwd_sens[2][0], vec![0.0, 0.0, 1.0]);
    }
}
