//! Expression-level conveniences built on [`Function`].
//!
//! These wrap the expressions in a throwaway Function that tolerates free
//! variables, so other symbols may appear in `f` and survive into the
//! result.

use crate::error::Result;
use crate::function::{Function, FunctionOptions};
use crate::matrix::SxMatrix;
use crate::sx::Sx;

fn wrap(name: &str, inputs: &[SxMatrix], outputs: &[SxMatrix]) -> Result<Function> {
    let options = FunctionOptions {
        allow_free: true,
        ..FunctionOptions::named(name)
    };
    Function::with_options(inputs.to_vec(), outputs.to_vec(), options)
}

fn first_output(f: &Function, x: &SxMatrix) -> Result<SxMatrix> {
    let mut out = f.eval_sx(std::slice::from_ref(x))?;
    Ok(out.swap_remove(0))
}

/// Symbolic Jacobian of `f` with respect to `x`, `numel(f) x numel(x)`.
///
/// ```
/// use symad::{api, Sx, SxMatrix};
///
/// let x = SxMatrix::sym("x", 2, 1);
/// let (x0, x1) = (&x.data()[0], &x.data()[1]);
/// let f = SxMatrix::column(vec![x0 * x1, x1.sin()]);
/// let j = api::jacobian(&f, &x).unwrap();
/// assert_eq!(j.nnz(), 3);
/// assert!(j.get(1, 0).is_none());
/// ```
pub fn jacobian(f: &SxMatrix, x: &SxMatrix) -> Result<SxMatrix> {
    let fun = wrap("jacobian", std::slice::from_ref(x), std::slice::from_ref(f))?;
    first_output(&fun.jacobian(0, 0)?, x)
}

/// Gradient of scalar `f` with respect to `x`, on the sparsity of `x`.
pub fn gradient(f: &Sx, x: &SxMatrix) -> Result<SxMatrix> {
    let fun = wrap("gradient", std::slice::from_ref(x), &[f.clone().into()])?;
    first_output(&fun.gradient(0, 0)?, x)
}

/// Hessian and gradient of scalar `f` with respect to `x`.
pub fn hessian(f: &Sx, x: &SxMatrix) -> Result<(SxMatrix, SxMatrix)> {
    let fun = wrap("hessian", std::slice::from_ref(x), &[f.clone().into()])?;
    let mut out = fun.hessian(0, 0)?.eval_sx(std::slice::from_ref(x))?;
    let g = out.swap_remove(1);
    let h = out.swap_remove(0);
    Ok((h, g))
}

/// Replace `vars[k]` by `values[k]` in every expression of `exprs`.
///
/// Each `values[k]` must have the nonzero count of `vars[k]`.
pub fn substitute(exprs: &[SxMatrix], vars: &[SxMatrix], values: &[SxMatrix]) -> Result<Vec<SxMatrix>> {
    wrap("substitute", vars, exprs)?.eval_sx(values)
}

/// Central finite difference of output `oind` along `dir` on input `iind`,
/// at the current inputs of `f`. The inputs are restored afterwards.
pub fn central_difference(f: &mut Function, iind: usize, oind: usize, dir: &[f64], h: f64) -> Result<Vec<f64>> {
    let x0 = f.input(iind)?.to_vec();
    let shifted = |s: f64| -> Vec<f64> { x0.iter().zip(dir).map(|(x, d)| x + s * d).collect() };

    f.set_input(iind, &shifted(h))?;
    let plus = f.evaluate().and_then(|_| f.output(oind).map(<[f64]>::to_vec));
    f.set_input(iind, &shifted(-h))?;
    let minus = f.evaluate().and_then(|_| f.output(oind).map(<[f64]>::to_vec));
    f.set_input(iind, &x0)?;
    let (plus, minus) = (plus?, minus?);

    Ok(plus.iter().zip(&minus).map(|(p, m)| (p - m) / (2.0 * h)).collect())
}
