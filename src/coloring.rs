//! Graph coloring for Jacobian and Hessian compression.
//!
//! A coloring is returned as a seed matrix: a [`Sparsity`] with one row per
//! color whose row `k` lists the indices sharing color `k`. Row `k` is the
//! seed direction of sweep `k`.

use crate::error::{Error, Result};
use crate::sparse::Sparsity;

const UNCOLORED: usize = usize::MAX;

/// Vertices in decreasing-degree order, ties by index.
fn largest_first(degree: impl Fn(usize) -> usize, n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| degree(b).cmp(&degree(a)).then(a.cmp(&b)));
    order
}

/// Turn a color-per-index vector into a seed matrix.
fn seed_matrix(colors: &[usize], ncolors: usize) -> Sparsity {
    let entries: Vec<(usize, usize)> = colors.iter().enumerate().map(|(i, &k)| (k, i)).collect();
    Sparsity::from_triplets(ncolors, colors.len(), &entries)
}

/// Color of every index from a seed matrix.
pub fn colors_of(seeds: &Sparsity) -> Vec<usize> {
    let mut colors = vec![UNCOLORED; seeds.ncol()];
    for k in 0..seeds.nrow() {
        for &i in seeds.row(k) {
            colors[i] = k;
        }
    }
    colors
}

/// Unidirectional column coloring of `a`.
///
/// Two columns sharing a nonzero row never get the same color, so one
/// forward sweep per color recovers every nonzero of `a` without collision.
/// Greedy distance-2 coloring of the bipartite column graph, visiting
/// columns in decreasing-degree order.
pub fn column_coloring(a: &Sparsity) -> Sparsity {
    let at = a.transpose();
    let n = a.ncol();
    let order = largest_first(|c| at.row(c).len(), n);

    let mut colors = vec![UNCOLORED; n];
    // forbidden[k] == c marks color k as taken while coloring column c
    let mut forbidden: Vec<usize> = Vec::new();
    let mut ncolors = 0;

    for &c in &order {
        for &r in at.row(c) {
            for &c2 in a.row(r) {
                let k = colors[c2];
                if k != UNCOLORED {
                    forbidden[k] = c;
                }
            }
        }
        let k = (0..ncolors).find(|&k| forbidden[k] != c).unwrap_or(ncolors);
        if k == ncolors {
            ncolors += 1;
            forbidden.push(UNCOLORED);
        }
        colors[c] = k;
    }

    seed_matrix(&colors, ncolors)
}

/// Unidirectional row coloring of `a`: a column coloring of the transpose.
pub fn row_coloring(a: &Sparsity) -> Sparsity {
    column_coloring(&a.transpose())
}

/// Star coloring of a square, structurally symmetric pattern.
///
/// A distance-1 coloring in which every path on four vertices uses at least
/// three colors. This is what symmetric recovery needs: for every nonzero
/// `(r, c)`, either `r` is the only neighbour of color `color(c)` in row
/// `r`, or `c` is the only neighbour of color `color(r)` in row `c`.
///
/// Gebremedhin, Manne & Pothen (2005), algorithm 4.1. Diagonal entries are
/// ignored.
pub fn star_coloring(a: &Sparsity) -> Result<Sparsity> {
    if !a.is_square() {
        return Err(Error::InvalidSparsity(format!(
            "star coloring needs a square pattern, got {}x{}",
            a.nrow(),
            a.ncol()
        )));
    }
    let n = a.nrow();
    let adj = |v: usize| a.row(v).iter().copied().filter(move |&w| w != v);
    let order = largest_first(|v| adj(v).count(), n);

    let mut colors = vec![UNCOLORED; n];
    let mut forbidden: Vec<usize> = Vec::new();
    let mut ncolors = 0;

    for &v in &order {
        for w in adj(v) {
            let cw = colors[w];
            if cw != UNCOLORED {
                forbidden[cw] = v;
            }
            for x in adj(w) {
                if x == v {
                    continue;
                }
                let cx = colors[x];
                if cx == UNCOLORED {
                    continue;
                }
                if cw == UNCOLORED {
                    forbidden[cx] = v;
                } else if adj(x).any(|y| y != w && colors[y] == cw) {
                    forbidden[cx] = v;
                }
            }
        }
        let k = (0..ncolors).find(|&k| forbidden[k] != v).unwrap_or(ncolors);
        if k == ncolors {
            ncolors += 1;
            forbidden.push(UNCOLORED);
        }
        colors[v] = k;
    }

    log::trace!("star coloring of {n}x{n} pattern: {ncolors} colors");
    Ok(seed_matrix(&colors, ncolors))
}

/// True if `seeds` is a valid column coloring of `a`: every column has one
/// color and same-colored columns have disjoint row sets.
pub fn is_column_coloring(a: &Sparsity, seeds: &Sparsity) -> bool {
    if seeds.ncol() != a.ncol() || seeds.nnz() != a.ncol() {
        return false;
    }
    let colors = colors_of(seeds);
    if colors.iter().any(|&k| k == UNCOLORED) {
        return false;
    }
    (0..a.nrow()).all(|r| {
        let mut seen = vec![false; seeds.nrow()];
        a.row(r)
            .iter()
            .all(|&c| !std::mem::replace(&mut seen[colors[c]], true))
    })
}

/// True if `seeds` is a star coloring of the symmetric pattern `a`.
pub fn is_star_coloring(a: &Sparsity, seeds: &Sparsity) -> bool {
    if !a.is_square() || seeds.ncol() != a.ncol() || seeds.nnz() != a.ncol() {
        return false;
    }
    let colors = colors_of(seeds);
    let adj = |v: usize| a.row(v).iter().copied().filter(move |&w| w != v);
    for b in 0..a.nrow() {
        for x in adj(b) {
            if colors[x] == colors[b] {
                return false;
            }
        }
        // A bicolored path a - b - c - d with color(a) == color(c) and
        // color(b) == color(d).
        for a_ in adj(b) {
            for c in adj(b) {
                if a_ == c || colors[a_] != colors[c] {
                    continue;
                }
                if adj(c).any(|d| d != b && colors[d] == colors[b]) {
                    return false;
                }
            }
        }
    }
    true
}
