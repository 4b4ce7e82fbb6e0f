//! Source-transformation derivatives: the tape is replayed over [`Sx`]
//! with symbolic or unit seeds, and the resulting sensitivity expressions
//! are sorted into a new Function.

use crate::error::Result;
use crate::io::IoBuffers;
use crate::matrix::SxMatrix;
use crate::sparse::Sparsity;
use crate::sx::Sx;
use crate::tape::Tape;

use super::numeric::{recover_adjoint, recover_forward};
use super::{Function, FunctionOptions, Layout, Shared};

fn sx_buffers(shared: &Shared, inputs: &[SxMatrix], nfwd: usize, nadj: usize) -> IoBuffers<Sx> {
    let mut io = IoBuffers::new(&shared.input_nnz(), &shared.output_nnz(), nfwd, nadj, Sx::zero());
    for (k, m) in inputs.iter().enumerate() {
        io.input[k] = m.data().to_vec();
    }
    io
}

fn matrices(sparsity: &[Sparsity], data: Vec<Vec<Sx>>) -> impl Iterator<Item = SxMatrix> + '_ {
    sparsity
        .iter()
        .zip(data)
        .map(|(sp, d)| SxMatrix::from_parts(sp.clone(), d))
}

/// Symbolic Jacobian (or gradient) Function: outputs `[J, outputs...]`.
///
/// The Jacobian block is compressed with the cached partition: one
/// symbolic sweep per color with 0/1 seeds, then each sensitivity
/// expression is scattered to the nonzero it determines.
#[allow(clippy::too_many_arguments)]
pub(super) fn jacobian_function(
    f: &Function,
    tape: &Tape,
    inputs: &[SxMatrix],
    iind: usize,
    oind: usize,
    compact: bool,
    symmetric: bool,
    layout: Layout,
    options: FunctionOptions,
) -> Result<Function> {
    let sh = &f.shared;
    let mut work = Vec::new();
    let mut partials = Vec::new();

    let (first, outputs) = match layout {
        Layout::Gradient => {
            let mut io = sx_buffers(sh, inputs, 0, 1);
            io.adj_seed[0][oind].fill(Sx::one());
            tape.evaluate(&mut work, &mut partials, &mut io, 0, 1)?;
            let grad = std::mem::take(&mut io.adj_sens[0][iind]);
            (SxMatrix::from_parts(sh.input_sparsity[iind].clone(), grad), io.output)
        }
        Layout::Jacobian => {
            let pattern = f.jac_sparsity(iind, oind, true, symmetric)?;
            let partition = f.partition(iind, oind, true, symmetric)?;
            let seeds = partition.seeds();
            let ncolors = seeds.nrow();
            let forward = partition.is_forward();
            let (nf, na) = if forward { (ncolors, 0) } else { (0, ncolors) };

            let mut io = sx_buffers(sh, inputs, nf, na);
            for c in 0..ncolors {
                for &i in seeds.row(c) {
                    if forward {
                        io.fwd_seed[c][iind][i] = Sx::one();
                    } else {
                        io.adj_seed[c][oind][i] = Sx::one();
                    }
                }
            }
            tape.evaluate(&mut work, &mut partials, &mut io, nf, na)?;

            let mut values = vec![Sx::zero(); pattern.nnz()];
            let (pattern_t, map) = pattern.transpose_with_mapping();
            let mut hits = vec![0usize; pattern.nrow()];
            for c in 0..ncolors {
                let members = seeds.row(c);
                if forward {
                    let sens = &io.fwd_sens[c][oind];
                    recover_forward(&pattern, &pattern_t, &map, members, symmetric, &mut hits, sens, &mut values);
                } else {
                    recover_adjoint(&pattern, members, &io.adj_sens[c][iind], &mut values);
                }
            }
            log::debug!(
                "\"{}\": symbolic jacobian with {} {} sweep(s)",
                sh.name(),
                ncolors,
                if forward { "forward" } else { "adjoint" }
            );

            let sparsity = if compact { pattern } else { f.enlarge(&pattern, iind, oind) };
            (SxMatrix::from_parts(sparsity, values), io.output)
        }
    };

    let mut outs = vec![first];
    outs.extend(matrices(&sh.output_sparsity, outputs));
    Function::with_options(inputs.to_vec(), outs, options)
}

/// Symbolic derivative Function with fresh seed symbols as extra inputs.
pub(super) fn derivative_function(
    f: &Function,
    tape: &Tape,
    inputs: &[SxMatrix],
    nfwd: usize,
    nadj: usize,
    options: FunctionOptions,
) -> Result<Function> {
    let sh = &f.shared;
    let fwd_seeds: Vec<SxMatrix> = (0..nfwd)
        .flat_map(|d| {
            sh.input_sparsity
                .iter()
                .enumerate()
                .map(move |(k, sp)| SxMatrix::sym_with(&format!("fwd{d}_i{k}"), sp.clone()))
        })
        .collect();
    let adj_seeds: Vec<SxMatrix> = (0..nadj)
        .flat_map(|d| {
            sh.output_sparsity
                .iter()
                .enumerate()
                .map(move |(k, sp)| SxMatrix::sym_with(&format!("adj{d}_o{k}"), sp.clone()))
        })
        .collect();

    let mut io = sx_buffers(sh, inputs, nfwd, nadj);
    let (n_in, n_out) = (f.n_in(), f.n_out());
    for (j, m) in fwd_seeds.iter().enumerate() {
        io.fwd_seed[j / n_in][j % n_in] = m.data().to_vec();
    }
    for (j, m) in adj_seeds.iter().enumerate() {
        io.adj_seed[j / n_out][j % n_out] = m.data().to_vec();
    }
    tape.evaluate(&mut Vec::new(), &mut Vec::new(), &mut io, nfwd, nadj)?;

    let mut outs: Vec<SxMatrix> = matrices(&sh.output_sparsity, io.output).collect();
    for sens in io.fwd_sens {
        outs.extend(matrices(&sh.output_sparsity, sens));
    }
    for sens in io.adj_sens {
        outs.extend(matrices(&sh.input_sparsity, sens));
    }

    let mut all_inputs = inputs.to_vec();
    all_inputs.extend(fwd_seeds);
    all_inputs.extend(adj_seeds);
    Function::with_options(all_inputs, outs, options)
}
