//! Jacobian sparsity detection.
//!
//! Detection drives a [`DependencySweep`], anything that can push dependency
//! bit-words from input nonzeros to output nonzeros (forward) or back
//! (reverse), and decodes the resulting words into a pattern with one row
//! per output nonzero and one column per input nonzero.
//!
//! Three detectors are provided:
//!
//! - [`jac_sparsity_plain`]: one bit per input (or output) nonzero,
//!   [`BVEC_SIZE`] of them per sweep.
//! - [`jac_sparsity_hierarchical`]: starts from a single dense block and
//!   repeatedly splits every block into up to [`BVEC_SIZE`] sub-blocks,
//!   coloring the current block pattern so unrelated blocks share bits.
//!   Structured patterns need far fewer sweeps than the plain detector.
//! - [`jac_sparsity_hierarchical_symmetric`]: the same refinement for a
//!   pattern known to be symmetric, seeded by a star coloring.
//!
//! All three are sound: every true dependency is reported.

use std::collections::HashMap;

use crate::coloring::{column_coloring, row_coloring, star_coloring};
use crate::function::AdMode;
use crate::sparse::Sparsity;
use crate::tape::{Bvec, BVEC_SIZE};

/// Bit-word propagation through one (input, output) block of a function.
pub trait DependencySweep {
    /// Number of input nonzeros (columns of the Jacobian block).
    fn nnz_in(&self) -> usize;

    /// Number of output nonzeros (rows of the Jacobian block).
    fn nnz_out(&self) -> usize;

    /// Whether sweeps in this direction are available.
    fn can_propagate(&self, forward: bool) -> bool;

    /// Forward: `seed` has one word per input nonzero and every word of
    /// `sens` (one per output nonzero) is overwritten. Reverse: the other
    /// way round.
    fn sweep(&mut self, forward: bool, seed: &[Bvec], sens: &mut [Bvec]);
}

/// Knobs for [`jac_sparsity`].
#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
    pub ad_mode: AdMode,
    pub adjoint_penalty: usize,
    pub hierarchical: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        DetectOptions {
            ad_mode: AdMode::Automatic,
            adjoint_penalty: 2,
            hierarchical: true,
        }
    }
}

/// Set bit positions of a word, lowest first.
fn bits(mut w: Bvec) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if w == 0 {
            return None;
        }
        let b = w.trailing_zeros() as usize;
        w &= w - 1;
        Some(b)
    })
}

/// Detect the sparsity of a Jacobian block, picking the detector.
///
/// Falls back to a dense pattern when the sweep supports neither direction.
/// With `symmetric` and a square block the result is symmetric: bit
/// propagation over-approximates each side differently, and star coloring
/// recovers an entry from its mirror only when both are in the pattern.
pub fn jac_sparsity<S: DependencySweep + ?Sized>(s: &mut S, opts: &DetectOptions, symmetric: bool) -> Sparsity {
    let (nz_in, nz_out) = (s.nnz_in(), s.nnz_out());
    if !s.can_propagate(true) && !s.can_propagate(false) {
        log::debug!("no dependency propagation available, assuming a dense {nz_out}x{nz_in} block");
        return Sparsity::dense(nz_out, nz_in);
    }
    let square = nz_in == nz_out;
    if opts.hierarchical && symmetric && square && nz_in > 1 && s.can_propagate(true) {
        return jac_sparsity_hierarchical_symmetric(s);
    }
    let sp = if opts.hierarchical && nz_in > 1 && nz_out > 1 {
        jac_sparsity_hierarchical(s, opts.ad_mode, opts.adjoint_penalty)
    } else {
        jac_sparsity_plain(s, opts.ad_mode)
    };
    if symmetric && square {
        sp.symmetrize()
    } else {
        sp
    }
}

fn plain_uses_forward<S: DependencySweep + ?Sized>(s: &S, ad_mode: AdMode) -> bool {
    let (can_fwd, can_adj) = (s.can_propagate(true), s.can_propagate(false));
    match ad_mode {
        AdMode::Forward if can_fwd => true,
        AdMode::Reverse if can_adj => false,
        _ if !can_adj => true,
        _ if !can_fwd => false,
        _ => s.nnz_in().div_ceil(BVEC_SIZE) <= s.nnz_out().div_ceil(BVEC_SIZE),
    }
}

/// One bit per seed nonzero, packed [`BVEC_SIZE`] per sweep.
pub fn jac_sparsity_plain<S: DependencySweep + ?Sized>(s: &mut S, ad_mode: AdMode) -> Sparsity {
    let (nz_in, nz_out) = (s.nnz_in(), s.nnz_out());
    let forward = plain_uses_forward(s, ad_mode);
    let (nseed, nsens) = if forward { (nz_in, nz_out) } else { (nz_out, nz_in) };
    let nsweep = nseed.div_ceil(BVEC_SIZE);

    let mut seed = vec![0 as Bvec; nseed];
    let mut sens = vec![0 as Bvec; nsens];
    let mut entries = Vec::new();

    for sweep in 0..nsweep {
        let offset = sweep * BVEC_SIZE;
        let ndir = BVEC_SIZE.min(nseed - offset);
        seed.iter_mut().for_each(|w| *w = 0);
        for j in 0..ndir {
            seed[offset + j] = 1 << j;
        }
        s.sweep(forward, &seed, &mut sens);
        for (el, &word) in sens.iter().enumerate() {
            for j in bits(word) {
                let d = offset + j;
                entries.push(if forward { (el, d) } else { (d, el) });
            }
        }
    }

    log::debug!(
        "plain sparsity detection: {} {} sweep(s) for {nz_out}x{nz_in}, {} nonzeros",
        nsweep,
        if forward { "forward" } else { "adjoint" },
        entries.len()
    );
    Sparsity::from_triplets(nz_out, nz_in, &entries)
}

/// Split every block `[lo, hi)` into sub-blocks of `ceil((hi - lo) / BVEC_SIZE)`.
fn subdivide(coarse: &[usize]) -> Vec<usize> {
    let mut fine = vec![coarse[0]];
    for w in coarse.windows(2) {
        let (lo, hi) = (w[0], w[1]);
        let step = (hi - lo).div_ceil(BVEC_SIZE).max(1);
        let mut k = lo + step;
        while k < hi {
            fine.push(k);
            k += step;
        }
        fine.push(hi);
    }
    fine
}

/// Index of every coarse boundary within the fine boundaries.
fn first_fine(coarse: &[usize], fine: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(coarse.len());
    let mut j = 0;
    for &c in coarse {
        while fine[j] != c {
            j += 1;
        }
        out.push(j);
    }
    out
}

fn max_block(boundaries: &[usize]) -> usize {
    boundaries.windows(2).map(|w| w[1] - w[0]).max().unwrap_or(0)
}

/// Result of one refinement step.
struct Refinement {
    fine_seed: Vec<usize>,
    fine_sens: Vec<usize>,
    /// `(fine sensitivity block, fine seed block)` pairs found dependent.
    entries: Vec<(usize, usize)>,
    sweeps: usize,
}

/// Accumulates fine seed blocks into bit lanes and decodes full words.
struct LanePacker<'a> {
    fine_sens: &'a [usize],
    sens_first: &'a [usize],
    symmetric: bool,
    seed: Vec<Bvec>,
    sens: Vec<Bvec>,
    /// `(coarse sensitivity block, lane)` to the fine seed block owning
    /// that lane there; `None` once two fine blocks claim it.
    lookup: HashMap<(usize, usize), Option<usize>>,
    bit: usize,
    entries: Vec<(usize, usize)>,
    sweeps: usize,
}

impl LanePacker<'_> {
    fn claim(&mut self, coarse_sens: usize, lane: usize, fine_seed: usize) {
        self.lookup
            .entry((coarse_sens, lane))
            .and_modify(|owner| {
                if *owner != Some(fine_seed) {
                    *owner = None;
                }
            })
            .or_insert(Some(fine_seed));
    }

    fn flush<S: DependencySweep + ?Sized>(&mut self, s: &mut S, forward: bool) {
        if self.bit == 0 {
            return;
        }
        s.sweep(forward, &self.seed, &mut self.sens);
        self.sweeps += 1;

        let ncoarse = self.sens_first.len() - 1;
        for cs in 0..ncoarse {
            for fs in self.sens_first[cs]..self.sens_first[cs + 1] {
                let range = self.fine_sens[fs]..self.fine_sens[fs + 1];
                let word = self.sens[range].iter().fold(0 as Bvec, |acc, w| acc | w);
                for lane in bits(word) {
                    match self.lookup.get(&(cs, lane)) {
                        Some(Some(fine)) => {
                            self.entries.push((fs, *fine));
                            if self.symmetric {
                                self.entries.push((*fine, fs));
                            }
                        }
                        // Shared lane: the symmetric counterpart is
                        // unambiguous under a star coloring and supplies
                        // the entry.
                        Some(None) => debug_assert!(self.symmetric, "column coloring collision"),
                        None => {}
                    }
                }
            }
        }

        self.seed.iter_mut().for_each(|w| *w = 0);
        self.lookup.clear();
        self.bit = 0;
    }
}

/// One refinement step over the coarse block pattern `pat` (rows: coarse
/// sensitivity blocks, columns: coarse seed blocks) seeded by the coloring
/// `seeds` of its columns.
fn refine<S: DependencySweep + ?Sized>(
    s: &mut S,
    forward: bool,
    symmetric: bool,
    pat: &Sparsity,
    seeds: &Sparsity,
    seed_blocks: &[usize],
    sens_blocks: &[usize],
) -> Refinement {
    let fine_seed = subdivide(seed_blocks);
    let fine_sens = subdivide(sens_blocks);
    let seed_first = first_fine(seed_blocks, &fine_seed);
    let sens_first = first_fine(sens_blocks, &fine_sens);
    let pat_t = pat.transpose();

    let nseed = *seed_blocks.last().unwrap_or(&0);
    let nsens = *sens_blocks.last().unwrap_or(&0);
    let mut packer = LanePacker {
        fine_sens: &fine_sens,
        sens_first: &sens_first,
        symmetric,
        seed: vec![0; nseed],
        sens: vec![0; nsens],
        lookup: HashMap::new(),
        bit: 0,
        entries: Vec::new(),
        sweeps: 0,
    };

    for color in 0..seeds.nrow() {
        let members = seeds.row(color);
        let widest = members
            .iter()
            .map(|&m| seed_first[m + 1] - seed_first[m])
            .max()
            .unwrap_or(0);
        let mut offset = 0;
        while offset < widest {
            if packer.bit == BVEC_SIZE {
                packer.flush(s, forward);
            }
            let take = (widest - offset).min(BVEC_SIZE - packer.bit);
            for &m in members {
                let nfine = seed_first[m + 1] - seed_first[m];
                for j in offset..nfine.min(offset + take) {
                    let lane = packer.bit + j - offset;
                    let fine = seed_first[m] + j;
                    for nz in fine_seed[fine]..fine_seed[fine + 1] {
                        packer.seed[nz] |= 1 << lane;
                    }
                    for &cs in pat_t.row(m) {
                        packer.claim(cs, lane, fine);
                    }
                }
            }
            packer.bit += take;
            offset += take;
        }
    }
    packer.flush(s, forward);

    let entries = packer.entries;
    let sweeps = packer.sweeps;
    Refinement {
        fine_seed,
        fine_sens,
        entries,
        sweeps,
    }
}

/// Hierarchical block refinement for a general Jacobian block.
///
/// Each iteration colors the current block pattern both ways and sweeps in
/// the direction with the lower estimated cost, forward winning unless an
/// adjoint sweep is more than `adjoint_penalty` times cheaper.
pub fn jac_sparsity_hierarchical<S: DependencySweep + ?Sized>(
    s: &mut S,
    ad_mode: AdMode,
    adjoint_penalty: usize,
) -> Sparsity {
    let (nz_in, nz_out) = (s.nnz_in(), s.nnz_out());
    if nz_in == 0 || nz_out == 0 {
        return Sparsity::empty(nz_out, nz_in);
    }
    let (can_fwd, can_adj) = (s.can_propagate(true), s.can_propagate(false));

    let mut coarse_row = vec![0, nz_out];
    let mut coarse_col = vec![0, nz_in];
    let mut r = Sparsity::dense(1, 1);
    let mut iterations = 0;
    let mut sweeps = 0;

    loop {
        let (forward, seeds) = match ad_mode {
            AdMode::Forward if can_fwd => (true, column_coloring(&r)),
            AdMode::Reverse if can_adj => (false, row_coloring(&r)),
            _ if !can_adj => (true, column_coloring(&r)),
            _ if !can_fwd => (false, row_coloring(&r)),
            _ => {
                let fwd = column_coloring(&r);
                let adj = row_coloring(&r);
                let fwd_cost = fwd.nrow() * max_block(&coarse_col).min(BVEC_SIZE);
                let adj_cost = adj.nrow() * max_block(&coarse_row).min(BVEC_SIZE);
                if fwd_cost <= adjoint_penalty * adj_cost {
                    (true, fwd)
                } else {
                    (false, adj)
                }
            }
        };

        let step = if forward {
            refine(s, true, false, &r, &seeds, &coarse_col, &coarse_row)
        } else {
            refine(s, false, false, &r.transpose(), &seeds, &coarse_row, &coarse_col)
        };
        sweeps += step.sweeps;
        iterations += 1;

        if forward {
            let (nr, nc) = (step.fine_sens.len() - 1, step.fine_seed.len() - 1);
            r = Sparsity::from_triplets(nr, nc, &step.entries);
            coarse_row = step.fine_sens;
            coarse_col = step.fine_seed;
        } else {
            let (nr, nc) = (step.fine_seed.len() - 1, step.fine_sens.len() - 1);
            let flipped: Vec<(usize, usize)> = step.entries.iter().map(|&(a, b)| (b, a)).collect();
            r = Sparsity::from_triplets(nr, nc, &flipped);
            coarse_row = step.fine_seed;
            coarse_col = step.fine_sens;
        }

        log::trace!(
            "refinement {iterations}: {}x{} blocks, {} nonzero blocks",
            coarse_row.len() - 1,
            coarse_col.len() - 1,
            r.nnz()
        );
        if coarse_row.len() == nz_out + 1 && coarse_col.len() == nz_in + 1 {
            break;
        }
    }

    log::debug!(
        "hierarchical sparsity detection: {iterations} refinement(s), {sweeps} sweep(s) for {nz_out}x{nz_in}, {} nonzeros",
        r.nnz()
    );
    r
}

/// Hierarchical block refinement for a block known to be symmetric.
///
/// Forward sweeps only, seeded by a star coloring of the current block
/// pattern; every decoded entry is recorded together with its mirror.
pub fn jac_sparsity_hierarchical_symmetric<S: DependencySweep + ?Sized>(s: &mut S) -> Sparsity {
    let n = s.nnz_in();
    assert_eq!(n, s.nnz_out(), "symmetric detection needs a square block");
    if n == 0 {
        return Sparsity::empty(0, 0);
    }

    let mut coarse = vec![0, n];
    let mut r = Sparsity::dense(1, 1);
    let mut iterations = 0;
    let mut sweeps = 0;

    loop {
        // a distance-2 coloring is also a star coloring
        let seeds = star_coloring(&r).unwrap_or_else(|_| column_coloring(&r));
        let step = refine(s, true, true, &r, &seeds, &coarse, &coarse);
        sweeps += step.sweeps;
        iterations += 1;
        let nb = step.fine_seed.len() - 1;
        r = Sparsity::from_triplets(nb, nb, &step.entries);
        coarse = step.fine_seed;
        if coarse.len() == n + 1 {
            break;
        }
    }

    log::debug!(
        "symmetric hierarchical sparsity detection: {iterations} refinement(s), {sweeps} sweep(s) for {n}x{n}, {} nonzeros",
        r.nnz()
    );
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Propagates bits through a known pattern and counts sweeps.
    struct Oracle {
        pattern: Sparsity,
        pattern_t: Sparsity,
        forward: bool,
        reverse: bool,
        sweeps: usize,
    }

    impl Oracle {
        fn new(pattern: Sparsity) -> Self {
            let pattern_t = pattern.transpose();
            Oracle {
                pattern,
                pattern_t,
                forward: true,
                reverse: true,
                sweeps: 0,
            }
        }
    }

    impl DependencySweep for Oracle {
        fn nnz_in(&self) -> usize {
            self.pattern.ncol()
        }
        fn nnz_out(&self) -> usize {
            self.pattern.nrow()
        }
        fn can_propagate(&self, forward: bool) -> bool {
            if forward {
                self.forward
            } else {
                self.reverse
            }
        }
        fn sweep(&mut self, forward: bool, seed: &[Bvec], sens: &mut [Bvec]) {
            self.sweeps += 1;
            let p = if forward { &self.pattern } else { &self.pattern_t };
            for (r, out) in sens.iter_mut().enumerate() {
                *out = p.row(r).iter().fold(0 as Bvec, |acc, &c| acc | seed[c]);
            }
        }
    }

    /// Deterministic pseudo-random pattern.
    fn scattered(nrow: usize, ncol: usize, per_row: usize, seed: u64) -> Sparsity {
        let mut state = seed;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as usize
        };
        let mut e = Vec::new();
        for r in 0..nrow {
            for _ in 0..per_row {
                e.push((r, next() % ncol));
            }
        }
        Sparsity::from_triplets(nrow, ncol, &e)
    }

    fn banded(n: usize, half: usize) -> Sparsity {
        let mut e = Vec::new();
        for r in 0..n {
            for c in r.saturating_sub(half)..(r + half + 1).min(n) {
                e.push((r, c));
            }
        }
        Sparsity::from_triplets(n, n, &e)
    }

    #[test]
    fn subdivision_keeps_coarse_boundaries() {
        let fine = subdivide(&[0, 200, 201, 330]);
        assert_eq!(fine.first(), Some(&0));
        assert_eq!(fine.last(), Some(&330));
        assert!(fine.windows(2).all(|w| w[0] < w[1]));
        let first = first_fine(&[0, 200, 201, 330], &fine);
        assert_eq!(fine[first[1]], 200);
        assert_eq!(fine[first[2]], 201);
    }

    #[test]
    fn plain_recovers_pattern_both_ways() {
        let p = scattered(90, 150, 3, 7);
        for mode in [AdMode::Forward, AdMode::Reverse, AdMode::Automatic] {
            let mut o = Oracle::new(p.clone());
            assert_eq!(jac_sparsity_plain(&mut o, mode), p, "{mode}");
        }
    }

    #[test]
    fn plain_sweep_count_follows_the_smaller_side() {
        let p = scattered(10, 300, 2, 3);
        let mut o = Oracle::new(p);
        jac_sparsity_plain(&mut o, AdMode::Automatic);
        assert_eq!(o.sweeps, 1);
    }

    #[test]
    fn hierarchical_recovers_scattered_pattern() {
        let p = scattered(300, 170, 4, 11);
        for mode in [AdMode::Forward, AdMode::Reverse, AdMode::Automatic] {
            let mut o = Oracle::new(p.clone());
            assert_eq!(jac_sparsity_hierarchical(&mut o, mode, 2), p, "{mode}");
        }
    }

    #[test]
    fn hierarchical_needs_few_sweeps_for_a_diagonal() {
        let p = Sparsity::diagonal(1000);
        let mut o = Oracle::new(p.clone());
        assert_eq!(jac_sparsity_hierarchical(&mut o, AdMode::Automatic, 2), p);
        // plain detection needs ceil(1000 / 64) = 16
        assert!(o.sweeps < 16, "{} sweeps", o.sweeps);
    }

    #[test]
    fn symmetric_recovers_banded_and_arrow_patterns() {
        let mut arrow = Vec::new();
        for i in 0..260 {
            arrow.extend([(i, i), (0, i), (i, 0)]);
        }
        for p in [banded(500, 2), Sparsity::from_triplets(260, 260, &arrow)] {
            let mut o = Oracle::new(p.clone());
            assert_eq!(jac_sparsity_hierarchical_symmetric(&mut o), p);
        }
    }

    #[test]
    fn symmetric_requests_are_symmetrized_without_refinement() {
        // what a gradient tape of sign(x0) * x1^2 propagates: row 0 empty
        let p = Sparsity::from_triplets(2, 2, &[(1, 0), (1, 1)]);
        let opts = DetectOptions {
            hierarchical: false,
            ..DetectOptions::default()
        };
        let mut o = Oracle::new(p.clone());
        assert_eq!(jac_sparsity(&mut o, &opts, false), p);
        let sym = jac_sparsity(&mut o, &opts, true);
        assert_eq!(sym.triplets(), vec![(0, 1), (1, 0), (1, 1)]);

        // reverse-only sweeps take the general hierarchical path
        let mut o = Oracle::new(p);
        o.forward = false;
        assert!(jac_sparsity(&mut o, &DetectOptions::default(), true).is_symmetric());
    }

    #[test]
    fn dispatcher_falls_back_to_dense() {
        let mut o = Oracle::new(Sparsity::diagonal(3));
        o.forward = false;
        o.reverse = false;
        assert_eq!(jac_sparsity(&mut o, &DetectOptions::default(), false), Sparsity::dense(3, 3));
        assert_eq!(o.sweeps, 0);
    }

    #[test]
    fn reverse_only_sweeps_are_respected() {
        let p = scattered(40, 120, 3, 5);
        let mut o = Oracle::new(p.clone());
        o.forward = false;
        assert_eq!(jac_sparsity(&mut o, &DetectOptions::default(), false), p);
    }
}
