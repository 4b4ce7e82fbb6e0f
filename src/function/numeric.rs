//! Numeric Jacobian assembly and the numeric derivative bodies.
//!
//! A compressed Jacobian is assembled from one directional derivative per
//! color of a [`Partition`], batched into as many directions as the
//! evaluating instance has allocated. The recovery routines are generic so
//! the symbolic path reuses them.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sparse::Sparsity;

use super::external::{call_external_jacobian, ExternalCallable};
use super::{AdMode, Body, Function, FunctionOptions, Layout, Opaque, Partition, Shared};

/// Jacobian (or gradient) of a parent definition, evaluated by sweeping an
/// instance of the parent.
pub(crate) struct JacobianBody {
    pub parent: Arc<Shared>,
    pub iind: usize,
    pub oind: usize,
    pub layout: Layout,
    /// Compact pattern, `nnz_out x nnz_in` of the parent block.
    pub pattern: Sparsity,
    pub source: JacobianSource,
}

/// Where the values of a numeric Jacobian come from.
pub(crate) enum JacobianSource {
    /// One sweep of the parent per color.
    Sweeps(Partition),
    /// The external callable's own Jacobian.
    External(Arc<dyn ExternalCallable>),
}

/// Directional derivatives of a parent definition, see
/// [`Function::derivative`].
pub(crate) struct DerivativeBody {
    pub parent: Arc<Shared>,
    pub nfwd: usize,
    pub nadj: usize,
}

/// Scatter the forward sensitivities `sens` of one color into the nonzeros
/// of `pattern`.
///
/// `pattern_t` and `map` come from [`Sparsity::transpose_with_mapping`].
/// In the symmetric case a nonzero `(r, j)` is only taken from row `r`
/// when `j` is the sole member of the color touching that row; it is then
/// written together with its mirror `(j, r)`. A star coloring guarantees
/// every nonzero is reached from one side. `hits` must be all zero on
/// entry and is left all zero.
#[allow(clippy::too_many_arguments)]
pub(crate) fn recover_forward<T: Clone>(
    pattern: &Sparsity,
    pattern_t: &Sparsity,
    map: &[usize],
    members: &[usize],
    symmetric: bool,
    hits: &mut [usize],
    sens: &[T],
    values: &mut [T],
) {
    if !symmetric {
        for &j in members {
            for k in pattern_t.row_range(j) {
                values[map[k]] = sens[pattern_t.col()[k]].clone();
            }
        }
        return;
    }

    for &j in members {
        for &r in pattern_t.row(j) {
            hits[r] += 1;
        }
    }
    for &j in members {
        for k in pattern_t.row_range(j) {
            let r = pattern_t.col()[k];
            if hits[r] != 1 {
                continue;
            }
            values[map[k]] = sens[r].clone();
            if let Some(m) = pattern.get_nz(j, r) {
                values[m] = sens[r].clone();
            }
        }
    }
    for &j in members {
        for &r in pattern_t.row(j) {
            hits[r] = 0;
        }
    }
}

/// Scatter the adjoint sensitivities of one color (a set of rows) into
/// the nonzeros of `pattern`.
pub(crate) fn recover_adjoint<T: Clone>(pattern: &Sparsity, members: &[usize], sens: &[T], values: &mut [T]) {
    for &r in members {
        for k in pattern.row_range(r) {
            values[k] = sens[pattern.col()[k]].clone();
        }
    }
}

impl Function {
    /// Jacobian block values at the current inputs, in the nonzero order of
    /// `pattern`. Also leaves the outputs evaluated.
    pub(crate) fn assemble(
        &mut self,
        iind: usize,
        oind: usize,
        pattern: &Sparsity,
        partition: &Partition,
        symmetric: bool,
    ) -> Result<Vec<f64>> {
        let mut values = vec![0.0; pattern.nnz()];
        let seeds = partition.seeds();
        let ncolors = seeds.nrow();
        if ncolors == 0 {
            self.evaluate()?;
            return Ok(values);
        }

        let forward = partition.is_forward();
        let mut batch = if forward { self.io.nfwd() } else { self.io.nadj() };
        if batch == 0 {
            let (nf, na) = self.request_directions(usize::from(forward), usize::from(!forward));
            batch = if forward { nf } else { na };
        }
        if batch == 0 {
            return Err(Error::Unsupported {
                function: self.name().to_string(),
                what: if forward {
                    "forward directions (max_number_of_fwd_dir is 0)"
                } else {
                    "adjoint directions (max_number_of_adj_dir is 0)"
                },
            });
        }

        let (pattern_t, map) = pattern.transpose_with_mapping();
        let mut hits = vec![0usize; pattern.nrow()];

        for start in (0..ncolors).step_by(batch) {
            let nb = batch.min(ncolors - start);
            for d in 0..nb {
                let members = seeds.row(start + d);
                let seed = if forward {
                    &mut self.io.fwd_seed[d]
                } else {
                    &mut self.io.adj_seed[d]
                };
                for v in seed.iter_mut() {
                    v.fill(0.0);
                }
                let slot = if forward { iind } else { oind };
                for &i in members {
                    seed[slot][i] = 1.0;
                }
            }

            if forward {
                self.evaluate_with(nb, 0)?;
            } else {
                self.evaluate_with(0, nb)?;
            }

            for d in 0..nb {
                let members = seeds.row(start + d);
                if forward {
                    let sens = &self.io.fwd_sens[d][oind];
                    recover_forward(pattern, &pattern_t, &map, members, symmetric, &mut hits, sens, &mut values);
                } else {
                    recover_adjoint(pattern, members, &self.io.adj_sens[d][iind], &mut values);
                }
            }
        }
        Ok(values)
    }
}

/// Outputs `[J or g, parent outputs...]` of a numeric Jacobian body.
pub(super) fn eval_jacobian(inner: &mut Function, body: &JacobianBody, input: &[Vec<f64>], output: &mut [Vec<f64>]) -> Result<()> {
    for (k, x) in input.iter().enumerate() {
        inner.set_input(k, x)?;
    }
    let values = match &body.source {
        JacobianSource::Sweeps(partition) => inner.assemble(body.iind, body.oind, &body.pattern, partition, false)?,
        JacobianSource::External(callable) => {
            inner.evaluate()?;
            let mut values = vec![0.0; body.pattern.nnz()];
            call_external_jacobian(callable.as_ref(), inner.name(), body.iind, body.oind, input, &mut values)?;
            values
        }
    };
    match body.layout {
        Layout::Jacobian => output[0].copy_from_slice(&values),
        Layout::Gradient => {
            output[0].fill(0.0);
            if body.pattern.nrow() == 1 {
                for (k, &j) in body.pattern.row(0).iter().enumerate() {
                    output[0][j] = values[k];
                }
            }
        }
    }
    for (k, y) in inner.io.output.iter().enumerate() {
        output[k + 1].copy_from_slice(y);
    }
    Ok(())
}

/// Outputs of a numeric derivative body, in batches of the directions the
/// parent instance can hold.
pub(super) fn eval_derivative(inner: &mut Function, body: &DerivativeBody, input: &[Vec<f64>], output: &mut [Vec<f64>]) -> Result<()> {
    let (n_in, n_out) = (inner.n_in(), inner.n_out());
    let (nfwd, nadj) = (body.nfwd, body.nadj);
    for (k, x) in input[..n_in].iter().enumerate() {
        inner.set_input(k, x)?;
    }
    let (cap_f, cap_a) = inner.request_directions(nfwd, nadj);
    if (nfwd > 0 && cap_f == 0) || (nadj > 0 && cap_a == 0) {
        return Err(Error::Unsupported {
            function: inner.name().to_string(),
            what: "directional derivatives with zero direction capacity",
        });
    }
    let rounds = nfwd.div_ceil(cap_f.max(1)).max(nadj.div_ceil(cap_a.max(1))).max(1);

    let fwd_seed_at = n_in;
    let adj_seed_at = n_in + nfwd * n_in;
    let fwd_sens_at = n_out;
    let adj_sens_at = n_out + nfwd * n_out;

    for round in 0..rounds {
        let (f0, a0) = (round * cap_f, round * cap_a);
        let nf = cap_f.min(nfwd.saturating_sub(f0));
        let na = cap_a.min(nadj.saturating_sub(a0));
        for d in 0..nf {
            for k in 0..n_in {
                inner.io.fwd_seed[d][k].copy_from_slice(&input[fwd_seed_at + (f0 + d) * n_in + k]);
            }
        }
        for d in 0..na {
            for k in 0..n_out {
                inner.io.adj_seed[d][k].copy_from_slice(&input[adj_seed_at + (a0 + d) * n_out + k]);
            }
        }
        inner.evaluate_with(nf, na)?;
        for d in 0..nf {
            for k in 0..n_out {
                output[fwd_sens_at + (f0 + d) * n_out + k].copy_from_slice(&inner.io.fwd_sens[d][k]);
            }
        }
        for d in 0..na {
            for k in 0..n_in {
                output[adj_sens_at + (a0 + d) * n_in + k].copy_from_slice(&inner.io.adj_sens[d][k]);
            }
        }
    }
    for k in 0..n_out {
        output[k].copy_from_slice(&inner.io.output[k]);
    }
    Ok(())
}

/// Numeric Jacobian of an opaque definition.
///
/// An external callable with its own Jacobian is asked for the values
/// directly. One that only reports a pattern is differenced along the
/// colors of that pattern. Anything else is a brute-force dense block, one
/// direction per input nonzero (per output nonzero with
/// `ad_mode = reverse`).
pub(super) fn jacobian_function(
    f: &Function,
    iind: usize,
    oind: usize,
    compact: bool,
    layout: Layout,
    options: FunctionOptions,
) -> Result<Function> {
    let sh = &f.shared;
    let nz_in = sh.input_sparsity[iind].nnz();
    let nz_out = sh.output_sparsity[oind].nnz();
    let (pattern, source) = match &sh.body {
        Body::Opaque(Opaque::External(callable)) if callable.has_jacobian(iind, oind) => {
            let pattern = f.jac_sparsity(iind, oind, true, false)?;
            log::debug!(
                "\"{}\": {nz_out}x{nz_in} jacobian with {} nonzeros from the callable",
                sh.name(),
                pattern.nnz()
            );
            (pattern, JacobianSource::External(Arc::clone(callable)))
        }
        Body::Opaque(Opaque::External(callable)) if callable.jac_sparsity(iind, oind).is_some() => {
            let pattern = f.jac_sparsity(iind, oind, true, false)?;
            let partition = f.partition(iind, oind, true, false)?;
            log::debug!(
                "\"{}\": numeric {nz_out}x{nz_in} jacobian, {} sweeps per evaluation",
                sh.name(),
                partition.ncolors()
            );
            (pattern, JacobianSource::Sweeps(partition))
        }
        _ => {
            let partition = match sh.options.ad_mode {
                AdMode::Reverse => Partition::Adjoint(Sparsity::diagonal(nz_out)),
                AdMode::Forward | AdMode::Automatic => Partition::Forward(Sparsity::diagonal(nz_in)),
            };
            log::debug!(
                "\"{}\": numeric {nz_out}x{nz_in} jacobian, {} sweeps per evaluation",
                sh.name(),
                partition.ncolors()
            );
            (Sparsity::dense(nz_out, nz_in), JacobianSource::Sweeps(partition))
        }
    };

    let first = match layout {
        Layout::Gradient => sh.input_sparsity[iind].clone(),
        Layout::Jacobian if compact => pattern.clone(),
        Layout::Jacobian => f.enlarge(&pattern, iind, oind),
    };
    let mut output_sparsity = vec![first];
    output_sparsity.extend(sh.output_sparsity.iter().cloned());

    let body = JacobianBody {
        parent: Arc::clone(sh),
        iind,
        oind,
        layout,
        pattern,
        source,
    };
    Ok(Function::from_shared(Arc::new(Shared::new(
        options,
        sh.input_sparsity.clone(),
        output_sparsity,
        Body::Opaque(Opaque::Jacobian(body)),
    ))))
}

/// Derivative Function of an opaque definition.
pub(super) fn derivative_function(f: &Function, nfwd: usize, nadj: usize, options: FunctionOptions) -> Function {
    let sh = &f.shared;
    let mut input_sparsity = sh.input_sparsity.clone();
    let mut output_sparsity = sh.output_sparsity.clone();
    for _ in 0..nfwd {
        input_sparsity.extend(sh.input_sparsity.iter().cloned());
        output_sparsity.extend(sh.output_sparsity.iter().cloned());
    }
    for _ in 0..nadj {
        input_sparsity.extend(sh.output_sparsity.iter().cloned());
        output_sparsity.extend(sh.input_sparsity.iter().cloned());
    }
    let body = DerivativeBody {
        parent: Arc::clone(sh),
        nfwd,
        nadj,
    };
    Function::from_shared(Arc::new(Shared::new(
        options,
        input_sparsity,
        output_sparsity,
        Body::Opaque(Opaque::Derivative(body)),
    )))
}
