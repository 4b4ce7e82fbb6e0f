//! Functions wrapping opaque numeric evaluators.
//!
//! An external callable exposes only its input/output shapes and an
//! evaluation entry point. Directional derivatives of such a Function are
//! central finite differences, and its Jacobian sparsity is assumed dense
//! unless the callable reports a pattern. A callable may also supply
//! Jacobian values itself, which Jacobian Functions then use instead of
//! differencing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::IoBuffers;
use crate::sparse::Sparsity;

use super::{Body, Function, FunctionOptions, Opaque, Shared};

/// An opaque numeric evaluator.
pub trait ExternalCallable: Send + Sync {
    fn n_in(&self) -> usize;

    fn n_out(&self) -> usize;

    fn sparsity_in(&self, index: usize) -> Sparsity;

    fn sparsity_out(&self, index: usize) -> Sparsity;

    /// Compute all output nonzeros from all input nonzeros.
    fn evaluate(&self, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) -> std::result::Result<(), String>;

    /// Pattern of the Jacobian block of output `oind` with respect to input
    /// `iind`, over nonzeros (`nnz_out x nnz_in`). `None` means dense.
    fn jac_sparsity(&self, _iind: usize, _oind: usize) -> Option<Sparsity> {
        None
    }

    /// Whether [`jacobian`](Self::jacobian) computes this block.
    fn has_jacobian(&self, _iind: usize, _oind: usize) -> bool {
        false
    }

    /// Values of the Jacobian block at `inputs`, in the nonzero order of
    /// its pattern ([`jac_sparsity`](Self::jac_sparsity), or dense).
    fn jacobian(
        &self,
        iind: usize,
        oind: usize,
        _inputs: &[&[f64]],
        _values: &mut [f64],
    ) -> std::result::Result<(), String> {
        Err(format!("no jacobian for output {oind} wrt input {iind}"))
    }
}

type JacobianFn =
    Box<dyn Fn(usize, usize, &[&[f64]], &mut [f64]) -> std::result::Result<(), String> + Send + Sync>;

/// [`ExternalCallable`] from a closure and fixed shapes.
///
/// ```
/// use symad::{ExternalFn, Function, FunctionOptions, Sparsity};
///
/// let square = ExternalFn::new(
///     vec![Sparsity::column(2)],
///     vec![Sparsity::column(2)],
///     |x: &[&[f64]], y: &mut [&mut [f64]]| -> Result<(), String> {
///         y[0][0] = x[0][0] * x[0][0];
///         y[0][1] = x[0][1] * x[0][1];
///         Ok(())
///     },
/// );
/// let mut f = Function::external(square, FunctionOptions::named("square")).unwrap();
/// let out = f.call(&[&[3.0, 4.0]]).unwrap();
/// assert_eq!(out[0], vec![9.0, 16.0]);
/// ```
///
/// A known Jacobian pattern and values can be attached:
///
/// ```
/// use symad::{ExternalFn, Function, FunctionOptions, Sparsity};
///
/// let square = ExternalFn::new(
///     vec![Sparsity::column(2)],
///     vec![Sparsity::column(2)],
///     |x: &[&[f64]], y: &mut [&mut [f64]]| -> Result<(), String> {
///         y[0][0] = x[0][0] * x[0][0];
///         y[0][1] = x[0][1] * x[0][1];
///         Ok(())
///     },
/// )
/// .with_jac_sparsity(0, 0, Sparsity::diagonal(2))
/// .with_jacobian(|_, _, x: &[&[f64]], jac: &mut [f64]| -> Result<(), String> {
///     jac[0] = 2.0 * x[0][0];
///     jac[1] = 2.0 * x[0][1];
///     Ok(())
/// });
/// let f = Function::external(square, FunctionOptions::named("square")).unwrap();
/// let mut jac = f.jacobian(0, 0).unwrap();
/// jac.call(&[&[3.0, 4.0]]).unwrap();
/// assert_eq!(jac.output(0).unwrap(), &[6.0, 8.0]);
/// ```
pub struct ExternalFn<F> {
    input_sparsity: Vec<Sparsity>,
    output_sparsity: Vec<Sparsity>,
    f: F,
    jac_sparsity: HashMap<(usize, usize), Sparsity>,
    jacobian: Option<JacobianFn>,
}

impl<F> ExternalFn<F>
where
    F: Fn(&[&[f64]], &mut [&mut [f64]]) -> std::result::Result<(), String> + Send + Sync,
{
    pub fn new(input_sparsity: Vec<Sparsity>, output_sparsity: Vec<Sparsity>, f: F) -> Self {
        ExternalFn {
            input_sparsity,
            output_sparsity,
            f,
            jac_sparsity: HashMap::new(),
            jacobian: None,
        }
    }

    /// Declare the pattern of one Jacobian block, over nonzeros.
    pub fn with_jac_sparsity(mut self, iind: usize, oind: usize, pattern: Sparsity) -> Self {
        self.jac_sparsity.insert((iind, oind), pattern);
        self
    }

    /// Supply Jacobian values for every block: `jac(iind, oind, inputs,
    /// values)` fills the nonzeros of the block pattern.
    pub fn with_jacobian<J>(mut self, jac: J) -> Self
    where
        J: Fn(usize, usize, &[&[f64]], &mut [f64]) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.jacobian = Some(Box::new(jac));
        self
    }
}

impl<F> ExternalCallable for ExternalFn<F>
where
    F: Fn(&[&[f64]], &mut [&mut [f64]]) -> std::result::Result<(), String> + Send + Sync,
{
    fn n_in(&self) -> usize {
        self.input_sparsity.len()
    }

    fn n_out(&self) -> usize {
        self.output_sparsity.len()
    }

    fn sparsity_in(&self, index: usize) -> Sparsity {
        self.input_sparsity[index].clone()
    }

    fn sparsity_out(&self, index: usize) -> Sparsity {
        self.output_sparsity[index].clone()
    }

    fn evaluate(&self, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) -> std::result::Result<(), String> {
        (self.f)(inputs, outputs)
    }

    fn jac_sparsity(&self, iind: usize, oind: usize) -> Option<Sparsity> {
        self.jac_sparsity.get(&(iind, oind)).cloned()
    }

    fn has_jacobian(&self, _iind: usize, _oind: usize) -> bool {
        self.jacobian.is_some()
    }

    fn jacobian(
        &self,
        iind: usize,
        oind: usize,
        inputs: &[&[f64]],
        values: &mut [f64],
    ) -> std::result::Result<(), String> {
        match &self.jacobian {
            Some(jac) => jac(iind, oind, inputs, values),
            None => Err(format!("no jacobian for output {oind} wrt input {iind}")),
        }
    }
}

impl Function {
    /// Wrap an opaque evaluator.
    pub fn external(callable: impl ExternalCallable + 'static, options: FunctionOptions) -> Result<Function> {
        let input_sparsity: Vec<Sparsity> = (0..callable.n_in()).map(|k| callable.sparsity_in(k)).collect();
        let output_sparsity: Vec<Sparsity> = (0..callable.n_out()).map(|k| callable.sparsity_out(k)).collect();
        if options.fd_step <= 0.0 || !options.fd_step.is_finite() {
            return Err(Error::OptionType {
                key: "fd_step".to_string(),
                expected: "positive finite",
            });
        }
        log::debug!(
            "external function \"{}\": {} input(s), {} output(s)",
            options.name,
            input_sparsity.len(),
            output_sparsity.len()
        );
        let body = Body::Opaque(Opaque::External(Arc::new(callable)));
        Ok(Function::from_shared(Arc::new(Shared::new(
            options,
            input_sparsity,
            output_sparsity,
            body,
        ))))
    }
}

pub(super) fn call_external(
    callable: &dyn ExternalCallable,
    name: &str,
    input: &[Vec<f64>],
    output: &mut [Vec<f64>],
) -> Result<()> {
    let ins: Vec<&[f64]> = input.iter().map(Vec::as_slice).collect();
    let mut outs: Vec<&mut [f64]> = output.iter_mut().map(Vec::as_mut_slice).collect();
    callable.evaluate(&ins, &mut outs).map_err(|message| Error::External {
        function: name.to_string(),
        message,
    })
}

/// Jacobian block values supplied by the callable itself.
pub(super) fn call_external_jacobian(
    callable: &dyn ExternalCallable,
    name: &str,
    iind: usize,
    oind: usize,
    input: &[Vec<f64>],
    values: &mut [f64],
) -> Result<()> {
    let ins: Vec<&[f64]> = input.iter().map(Vec::as_slice).collect();
    callable.jacobian(iind, oind, &ins, values).map_err(|message| Error::External {
        function: name.to_string(),
        message,
    })
}

fn max_abs(v: &[Vec<f64>]) -> f64 {
    v.iter().flatten().fold(0.0, |m: f64, x| m.max(x.abs()))
}

/// `x = base + h * dir`
fn perturb(x: &mut [Vec<f64>], base: &[Vec<f64>], dir: &[Vec<f64>], h: f64) {
    for ((xi, bi), di) in x.iter_mut().zip(base).zip(dir) {
        for ((x, b), d) in xi.iter_mut().zip(bi).zip(di) {
            *x = b + h * d;
        }
    }
}

/// Central-difference directional derivatives of `eval` at `io.input`.
///
/// Forward direction `d` perturbs the inputs along its seed. Adjoint
/// directions are `Jᵀ seed` with the Jacobian built column by column, so
/// they cost two evaluations per input nonzero regardless of `nadj`.
pub(super) fn fd_directions(
    io: &mut IoBuffers<f64>,
    nfwd: usize,
    nadj: usize,
    step: f64,
    mut eval: impl FnMut(&[Vec<f64>], &mut [Vec<f64>]) -> Result<()>,
) -> Result<()> {
    if nfwd == 0 && nadj == 0 {
        return Ok(());
    }
    let scale = 1.0 + max_abs(&io.input);
    let mut x = io.input.clone();
    let mut plus = io.output.clone();
    let mut minus = io.output.clone();

    for d in 0..nfwd {
        let norm = max_abs(&io.fwd_seed[d]);
        if norm == 0.0 {
            for v in io.fwd_sens[d].iter_mut() {
                v.fill(0.0);
            }
            continue;
        }
        let h = step * scale / norm;
        perturb(&mut x, &io.input, &io.fwd_seed[d], h);
        eval(&x, &mut plus)?;
        perturb(&mut x, &io.input, &io.fwd_seed[d], -h);
        eval(&x, &mut minus)?;
        for ((s, p), m) in io.fwd_sens[d].iter_mut().zip(&plus).zip(&minus) {
            for ((s, p), m) in s.iter_mut().zip(p).zip(m) {
                *s = (p - m) / (2.0 * h);
            }
        }
    }

    if nadj == 0 {
        return Ok(());
    }
    log::trace!("finite-difference jacobian for {nadj} adjoint direction(s)");
    for sens in io.adj_sens[..nadj].iter_mut() {
        for v in sens.iter_mut() {
            v.fill(0.0);
        }
    }
    x.clone_from(&io.input);
    let h = step * scale;
    for i in 0..io.input.len() {
        for k in 0..io.input[i].len() {
            x[i][k] = io.input[i][k] + h;
            eval(&x, &mut plus)?;
            x[i][k] = io.input[i][k] - h;
            eval(&x, &mut minus)?;
            x[i][k] = io.input[i][k];
            for d in 0..nadj {
                let mut acc = 0.0;
                for ((seed, p), m) in io.adj_seed[d].iter().zip(&plus).zip(&minus) {
                    for ((s, p), m) in seed.iter().zip(p).zip(m) {
                        acc += s * (p - m) / (2.0 * h);
                    }
                }
                io.adj_sens[d][i][k] = acc;
            }
        }
    }
    Ok(())
}
