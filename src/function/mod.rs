//! Function objects.
//!
//! A [`Function`] puts named, sparsity-shaped inputs and outputs around an
//! evaluator: a [`Tape`] sorted from symbolic expressions, an
//! [`ExternalCallable`], or a numeric derivative of another Function.
//!
//! The definition (evaluator, options, sparsity patterns, caches) is shared
//! behind an `Arc`; every `Function` value owns its own work array and
//! seed/sensitivity buffers. Cloning a Function is the way to get a second
//! instance for another thread.
//!
//! Derivative Functions ([`Function::jacobian`], [`Function::gradient`],
//! [`Function::hessian`], [`Function::derivative`]) are cached per request
//! signature by weak reference: a request returns the cached definition
//! while some instance of it is alive and derives a fresh one otherwise.
//! Jacobian sparsity patterns and colorings are cached for the lifetime of
//! the definition.

mod external;
mod numeric;
mod options;
#[cfg(feature = "parallel")]
mod parallel;
mod symbolic;

pub use self::external::{ExternalCallable, ExternalFn};
pub use self::options::{AdMode, FunctionOptions, OptionValue, TopologicalSorting};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::coloring::{column_coloring, row_coloring, star_coloring};
use crate::detect::{self, DependencySweep, DetectOptions};
use crate::error::{Error, EvalReport, Location, Result};
use crate::io::IoBuffers;
use crate::matrix::{DMatrix, SxMatrix};
use crate::sparse::Sparsity;
use crate::sx::Sx;
use crate::tape::{Bvec, Tape};

use self::numeric::{DerivativeBody, JacobianBody};

/// How the first output of a Jacobian-type Function is laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Layout {
    /// The Jacobian block, rows output nonzeros, columns input nonzeros.
    Jacobian,
    /// The gradient of a scalar output, on the sparsity of the input.
    Gradient,
}

/// Evaluators without a tape, driven numerically.
pub(crate) enum Opaque {
    External(Arc<dyn ExternalCallable>),
    Jacobian(JacobianBody),
    Derivative(DerivativeBody),
}

pub(crate) enum Body {
    Sx { tape: Tape, inputs: Vec<SxMatrix> },
    Opaque(Opaque),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum DerivedKey {
    Jacobian {
        iind: usize,
        oind: usize,
        compact: bool,
        symmetric: bool,
    },
    Gradient {
        iind: usize,
        oind: usize,
    },
    Hessian {
        iind: usize,
        oind: usize,
    },
    Derivative {
        nfwd: usize,
        nadj: usize,
    },
}

/// `(iind, oind, compact, symmetric)`
type BlockKey = (usize, usize, bool, bool);

#[derive(Default)]
struct Cache {
    derived: HashMap<DerivedKey, Weak<Shared>>,
    sparsity: HashMap<BlockKey, Sparsity>,
    partition: HashMap<BlockKey, Partition>,
}

/// The immutable definition every instance of a Function shares.
pub(crate) struct Shared {
    options: FunctionOptions,
    input_sparsity: Vec<Sparsity>,
    output_sparsity: Vec<Sparsity>,
    body: Body,
    cache: Mutex<Cache>,
}

impl Shared {
    fn new(options: FunctionOptions, input_sparsity: Vec<Sparsity>, output_sparsity: Vec<Sparsity>, body: Body) -> Self {
        Shared {
            options,
            input_sparsity,
            output_sparsity,
            body,
            cache: Mutex::new(Cache::default()),
        }
    }

    fn name(&self) -> &str {
        &self.options.name
    }

    fn input_nnz(&self) -> Vec<usize> {
        self.input_sparsity.iter().map(Sparsity::nnz).collect()
    }

    fn output_nnz(&self) -> Vec<usize> {
        self.output_sparsity.iter().map(Sparsity::nnz).collect()
    }
}

/// Coloring of a Jacobian block, as the seed matrix of the chosen sweep
/// direction (one row per color).
#[derive(Clone, Debug, PartialEq)]
pub enum Partition {
    /// Colors the columns (input nonzeros); one forward sweep per color.
    Forward(Sparsity),
    /// Colors the rows (output nonzeros); one adjoint sweep per color.
    Adjoint(Sparsity),
}

impl Partition {
    pub fn is_forward(&self) -> bool {
        matches!(self, Partition::Forward(_))
    }

    pub fn seeds(&self) -> &Sparsity {
        match self {
            Partition::Forward(s) | Partition::Adjoint(s) => s,
        }
    }

    /// Number of sweeps needed.
    pub fn ncolors(&self) -> usize {
        self.seeds().nrow()
    }
}

/// Counters of one Function instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvalStats {
    /// Calls to [`Function::evaluate_with`], including internal ones.
    pub evaluations: usize,
    /// Forward directions actually swept (after compression).
    pub fwd_sweeps: usize,
    /// Adjoint directions actually swept (after compression).
    pub adj_sweeps: usize,
}

/// Dependency propagation through one (input, output) block.
struct BlockSweep<'a> {
    tape: Option<&'a Tape>,
    iind: usize,
    oind: usize,
    work: Vec<Bvec>,
    input: Vec<Vec<Bvec>>,
    output: Vec<Vec<Bvec>>,
}

impl<'a> BlockSweep<'a> {
    fn new(shared: &'a Shared, iind: usize, oind: usize) -> Self {
        let tape = match &shared.body {
            Body::Sx { tape, .. } => Some(tape),
            Body::Opaque(_) => None,
        };
        BlockSweep {
            tape,
            iind,
            oind,
            work: Vec::new(),
            input: shared.input_nnz().into_iter().map(|n| vec![0; n]).collect(),
            output: shared.output_nnz().into_iter().map(|n| vec![0; n]).collect(),
        }
    }
}

impl DependencySweep for BlockSweep<'_> {
    fn nnz_in(&self) -> usize {
        self.input[self.iind].len()
    }

    fn nnz_out(&self) -> usize {
        self.output[self.oind].len()
    }

    fn can_propagate(&self, _forward: bool) -> bool {
        self.tape.is_some()
    }

    fn sweep(&mut self, forward: bool, seed: &[Bvec], sens: &mut [Bvec]) {
        let Some(tape) = self.tape else {
            return;
        };
        log::trace!("{} dependency sweep", if forward { "forward" } else { "reverse" });
        if forward {
            for v in self.input.iter_mut() {
                v.fill(0);
            }
            self.input[self.iind].copy_from_slice(seed);
            tape.propagate_forward(&mut self.work, &self.input, &mut self.output);
            sens.copy_from_slice(&self.output[self.oind]);
        } else {
            for v in self.output.iter_mut() {
                v.fill(0);
            }
            self.output[self.oind].copy_from_slice(seed);
            tape.propagate_reverse(&mut self.work, &mut self.input, &self.output);
            sens.copy_from_slice(&self.input[self.iind]);
        }
    }
}

/// A differentiable multi-input, multi-output function.
///
/// ```
/// use symad::{Function, Sx, SxMatrix};
///
/// let x = Sx::sym("x");
/// let y = Sx::sym("y");
/// let f = &x * &y + x.sin();
/// let mut fun = Function::new("f", vec![x.into(), y.into()], vec![f.into()]).unwrap();
///
/// fun.set_input(0, &[2.0]).unwrap();
/// fun.set_input(1, &[3.0]).unwrap();
/// fun.evaluate().unwrap();
/// assert!((fun.output(0).unwrap()[0] - (6.0 + 2f64.sin())).abs() < 1e-12);
/// ```
#[derive(Clone)]
pub struct Function {
    shared: Arc<Shared>,
    io: IoBuffers<f64>,
    work: Vec<f64>,
    partials: Vec<[f64; 2]>,
    /// Instance of the parent definition, for numeric derivative bodies.
    inner: Option<Box<Function>>,
    stats: EvalStats,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.shared.body {
            Body::Sx { .. } => "sx",
            Body::Opaque(Opaque::External(_)) => "external",
            Body::Opaque(Opaque::Jacobian(_)) => "numeric jacobian",
            Body::Opaque(Opaque::Derivative(_)) => "numeric derivative",
        };
        f.debug_struct("Function")
            .field("name", &self.name())
            .field("kind", &kind)
            .field("n_in", &self.n_in())
            .field("n_out", &self.n_out())
            .finish()
    }
}

impl Function {
    /// Sort `outputs` into a tape over `inputs`, with default options.
    pub fn new(name: &str, inputs: Vec<SxMatrix>, outputs: Vec<SxMatrix>) -> Result<Function> {
        Self::with_options(inputs, outputs, FunctionOptions::named(name))
    }

    /// Sort `outputs` into a tape over `inputs`.
    ///
    /// Every input nonzero must be a distinct symbol. Other symbols reached
    /// from the outputs are free variables and make construction fail with
    /// [`Error::UnresolvedSymbols`] unless `options.allow_free` is set.
    pub fn with_options(inputs: Vec<SxMatrix>, outputs: Vec<SxMatrix>, options: FunctionOptions) -> Result<Function> {
        let tape = Tape::from_graph_with(&inputs, &outputs, options.live_variables, options.topological_sorting)?;
        if !tape.free_variables().is_empty() && !options.allow_free {
            return Err(tape.unresolved(&options.name));
        }
        let input_sparsity = inputs.iter().map(|m| m.sparsity().clone()).collect();
        let output_sparsity = outputs.iter().map(|m| m.sparsity().clone()).collect();
        log::debug!(
            "function \"{}\": {} input(s), {} output(s), {} tape elements",
            options.name,
            inputs.len(),
            outputs.len(),
            tape.len()
        );
        let body = Body::Sx { tape, inputs };
        Ok(Self::from_shared(Arc::new(Shared::new(
            options,
            input_sparsity,
            output_sparsity,
            body,
        ))))
    }

    fn from_shared(shared: Arc<Shared>) -> Function {
        let io = IoBuffers::new(
            &shared.input_nnz(),
            &shared.output_nnz(),
            shared.options.initial_fwd(),
            shared.options.initial_adj(),
            0.0,
        );
        Function {
            shared,
            io,
            work: Vec::new(),
            partials: Vec::new(),
            inner: None,
            stats: EvalStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn options(&self) -> &FunctionOptions {
        &self.shared.options
    }

    pub fn n_in(&self) -> usize {
        self.shared.input_sparsity.len()
    }

    pub fn n_out(&self) -> usize {
        self.shared.output_sparsity.len()
    }

    pub fn sparsity_in(&self, index: usize) -> Result<&Sparsity> {
        self.check_in(index)?;
        Ok(&self.shared.input_sparsity[index])
    }

    pub fn sparsity_out(&self, index: usize) -> Result<&Sparsity> {
        self.check_out(index)?;
        Ok(&self.shared.output_sparsity[index])
    }

    /// The tape, unless the Function wraps an opaque evaluator.
    pub fn tape(&self) -> Option<&Tape> {
        match &self.shared.body {
            Body::Sx { tape, .. } => Some(tape),
            Body::Opaque(_) => None,
        }
    }

    /// Symbols the outputs depend on that are not inputs.
    pub fn free_variables(&self) -> &[Sx] {
        match self.tape() {
            Some(tape) => tape.free_variables(),
            None => &[],
        }
    }

    /// Whether both values are instances of the same definition.
    pub fn same_definition(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = EvalStats::default();
    }

    fn out_of_range(&self, kind: &'static str, index: usize, len: usize) -> Error {
        Error::IndexOutOfRange {
            function: self.name().to_string(),
            kind,
            index,
            len,
        }
    }

    fn check_in(&self, index: usize) -> Result<()> {
        if index < self.n_in() {
            Ok(())
        } else {
            Err(self.out_of_range("input", index, self.n_in()))
        }
    }

    fn check_out(&self, index: usize) -> Result<()> {
        if index < self.n_out() {
            Ok(())
        } else {
            Err(self.out_of_range("output", index, self.n_out()))
        }
    }

    fn check_len(&self, kind: &'static str, index: usize, expected: usize, got: usize) -> Result<()> {
        if expected == got {
            Ok(())
        } else {
            Err(Error::DimensionMismatch {
                function: self.name().to_string(),
                kind,
                index,
                expected,
                got,
            })
        }
    }

    fn check_scalar_output(&self, what: &'static str, oind: usize) -> Result<()> {
        self.check_out(oind)?;
        let sp = &self.shared.output_sparsity[oind];
        if sp.is_scalar() {
            Ok(())
        } else {
            Err(Error::NonScalarOutput {
                what,
                index: oind,
                nrow: sp.nrow(),
                ncol: sp.ncol(),
            })
        }
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.shared.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- inputs, outputs, seeds, sensitivities ---

    /// Set the nonzeros of input `index`.
    pub fn set_input(&mut self, index: usize, values: &[f64]) -> Result<()> {
        self.check_in(index)?;
        self.check_len("input", index, self.io.input[index].len(), values.len())?;
        self.io.input[index].copy_from_slice(values);
        Ok(())
    }

    pub fn input(&self, index: usize) -> Result<&[f64]> {
        self.check_in(index)?;
        Ok(&self.io.input[index])
    }

    /// Nonzeros of output `index` from the last evaluation.
    pub fn output(&self, index: usize) -> Result<&[f64]> {
        self.check_out(index)?;
        Ok(&self.io.output[index])
    }

    /// Output `index` with its sparsity pattern.
    pub fn output_matrix(&self, index: usize) -> Result<DMatrix> {
        self.check_out(index)?;
        Ok(DMatrix::from_parts(
            self.shared.output_sparsity[index].clone(),
            self.io.output[index].clone(),
        ))
    }

    fn check_fwd_dir(&self, dir: usize) -> Result<()> {
        if dir < self.io.nfwd() {
            Ok(())
        } else {
            Err(self.out_of_range("forward direction", dir, self.io.nfwd()))
        }
    }

    fn check_adj_dir(&self, dir: usize) -> Result<()> {
        if dir < self.io.nadj() {
            Ok(())
        } else {
            Err(self.out_of_range("adjoint direction", dir, self.io.nadj()))
        }
    }

    /// Seed of forward direction `dir` on input `index`.
    pub fn set_fwd_seed(&mut self, dir: usize, index: usize, values: &[f64]) -> Result<()> {
        self.check_fwd_dir(dir)?;
        self.check_in(index)?;
        self.check_len("forward seed", index, self.io.input[index].len(), values.len())?;
        self.io.fwd_seed[dir][index].copy_from_slice(values);
        Ok(())
    }

    /// Sensitivity of output `index` in forward direction `dir`.
    pub fn fwd_sens(&self, dir: usize, index: usize) -> Result<&[f64]> {
        self.check_fwd_dir(dir)?;
        self.check_out(index)?;
        Ok(&self.io.fwd_sens[dir][index])
    }

    /// Seed of adjoint direction `dir` on output `index`.
    pub fn set_adj_seed(&mut self, dir: usize, index: usize, values: &[f64]) -> Result<()> {
        self.check_adj_dir(dir)?;
        self.check_out(index)?;
        self.check_len("adjoint seed", index, self.io.output[index].len(), values.len())?;
        self.io.adj_seed[dir][index].copy_from_slice(values);
        Ok(())
    }

    /// Sensitivity of input `index` in adjoint direction `dir`.
    pub fn adj_sens(&self, dir: usize, index: usize) -> Result<&[f64]> {
        self.check_adj_dir(dir)?;
        self.check_in(index)?;
        Ok(&self.io.adj_sens[dir][index])
    }

    /// Allocated (forward, adjoint) directions.
    pub fn directions(&self) -> (usize, usize) {
        (self.io.nfwd(), self.io.nadj())
    }

    /// Make room for at least `nfwd` forward and `nadj` adjoint directions,
    /// capped at `max_number_of_fwd_dir` / `max_number_of_adj_dir`.
    /// Returns the resulting capacity.
    pub fn request_directions(&mut self, nfwd: usize, nadj: usize) -> (usize, usize) {
        let opts = &self.shared.options;
        if nfwd > opts.max_number_of_fwd_dir {
            log::warn!(
                "\"{}\": {} forward directions requested, capped at {}",
                opts.name,
                nfwd,
                opts.max_number_of_fwd_dir
            );
        }
        if nadj > opts.max_number_of_adj_dir {
            log::warn!(
                "\"{}\": {} adjoint directions requested, capped at {}",
                opts.name,
                nadj,
                opts.max_number_of_adj_dir
            );
        }
        let nf = self.io.nfwd().max(nfwd.min(opts.max_number_of_fwd_dir));
        let na = self.io.nadj().max(nadj.min(opts.max_number_of_adj_dir));
        if (nf, na) != self.directions() {
            self.io.resize_directions(nf, na, 0.0);
        }
        (nf, na)
    }

    // --- evaluation ---

    /// Evaluate the outputs at the current inputs.
    pub fn evaluate(&mut self) -> Result<EvalReport> {
        self.evaluate_with(0, 0)
    }

    /// Evaluate the outputs and the first `nfwd` forward and `nadj` adjoint
    /// directions.
    ///
    /// With `compress_directions`, directions whose seed is all zero are
    /// not swept and get all-zero sensitivities. NaN or Inf in the outputs
    /// or sensitivities is an [`Error::Irregular`] with
    /// `regularity_check`, otherwise a warning and a non-empty report.
    pub fn evaluate_with(&mut self, nfwd: usize, nadj: usize) -> Result<EvalReport> {
        if nfwd > self.io.nfwd() {
            return Err(self.out_of_range("forward direction", nfwd - 1, self.io.nfwd()));
        }
        if nadj > self.io.nadj() {
            return Err(self.out_of_range("adjoint direction", nadj - 1, self.io.nadj()));
        }

        let (nf, na) = if self.shared.options.compress_directions && (nfwd > 0 || nadj > 0) {
            let (fmap, nf, amap, na) = self.io.compress(nfwd, nadj);
            if nf < nfwd || na < nadj {
                log::trace!(
                    "\"{}\": compressed {nfwd}+{nadj} directions to {nf}+{na}",
                    self.name()
                );
            }
            let res = self.dispatch(nf, na);
            self.io.decompress(&fmap, &amap);
            res?;
            (nf, na)
        } else {
            self.dispatch(nfwd, nadj)?;
            (nfwd, nadj)
        };

        self.stats.evaluations += 1;
        self.stats.fwd_sweeps += nf;
        self.stats.adj_sweeps += na;
        self.regularity(nfwd, nadj)
    }

    fn dispatch(&mut self, nfwd: usize, nadj: usize) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        match &shared.body {
            Body::Sx { tape, .. } => {
                if !tape.free_variables().is_empty() {
                    return Err(tape.unresolved(shared.name()));
                }
                tape.evaluate(&mut self.work, &mut self.partials, &mut self.io, nfwd, nadj)
            }
            Body::Opaque(body) => {
                let name = shared.name();
                let inner = &mut self.inner;
                let mut eval = |x: &[Vec<f64>], y: &mut [Vec<f64>]| match body {
                    Opaque::External(callable) => external::call_external(callable.as_ref(), name, x, y),
                    Opaque::Jacobian(b) => {
                        let f = inner.get_or_insert_with(|| Box::new(Function::from_shared(Arc::clone(&b.parent))));
                        numeric::eval_jacobian(f, b, x, y)
                    }
                    Opaque::Derivative(b) => {
                        let f = inner.get_or_insert_with(|| Box::new(Function::from_shared(Arc::clone(&b.parent))));
                        numeric::eval_derivative(f, b, x, y)
                    }
                };
                let input = self.io.input.clone();
                eval(&input, &mut self.io.output)?;
                external::fd_directions(&mut self.io, nfwd, nadj, shared.options.fd_step, eval)
            }
        }
    }

    fn regularity(&self, nfwd: usize, nadj: usize) -> Result<EvalReport> {
        let mut report = EvalReport::default();
        for (index, v) in self.io.output.iter().enumerate() {
            report.scan(v, |nz| Location::Output { index, nz });
        }
        for dir in 0..nfwd {
            for (index, v) in self.io.fwd_sens[dir].iter().enumerate() {
                report.scan(v, |nz| Location::FwdSens { dir, index, nz });
            }
        }
        for dir in 0..nadj {
            for (index, v) in self.io.adj_sens[dir].iter().enumerate() {
                report.scan(v, |nz| Location::AdjSens { dir, index, nz });
            }
        }
        if report.is_regular() {
            Ok(report)
        } else if self.shared.options.regularity_check {
            Err(Error::Irregular {
                function: self.name().to_string(),
                report,
            })
        } else {
            log::warn!("\"{}\": {}", self.name(), report);
            Ok(report)
        }
    }

    /// Set all inputs, evaluate, and return copies of all outputs.
    pub fn call(&mut self, args: &[&[f64]]) -> Result<Vec<Vec<f64>>> {
        if args.len() != self.n_in() {
            return Err(Error::ArityMismatch {
                function: self.name().to_string(),
                kind: "inputs",
                expected: self.n_in(),
                got: args.len(),
            });
        }
        for (k, a) in args.iter().enumerate() {
            self.set_input(k, a)?;
        }
        self.evaluate()?;
        Ok(self.io.output.clone())
    }

    /// [`call`](Self::call) for every argument list in turn.
    pub fn call_batch(&mut self, batch: &[Vec<Vec<f64>>]) -> Result<Vec<Vec<Vec<f64>>>> {
        batch
            .iter()
            .map(|args| {
                let refs: Vec<&[f64]> = args.iter().map(Vec::as_slice).collect();
                self.call(&refs)
            })
            .collect()
    }

    /// Replay the tape over symbolic arguments.
    ///
    /// Each argument must have the nonzero count of the matching input.
    /// Free variables stay themselves.
    pub fn eval_sx(&self, args: &[SxMatrix]) -> Result<Vec<SxMatrix>> {
        let Body::Sx { tape, .. } = &self.shared.body else {
            return Err(Error::Unsupported {
                function: self.name().to_string(),
                what: "symbolic evaluation",
            });
        };
        if args.len() != self.n_in() {
            return Err(Error::ArityMismatch {
                function: self.name().to_string(),
                kind: "inputs",
                expected: self.n_in(),
                got: args.len(),
            });
        }
        let mut io = IoBuffers::new(&self.shared.input_nnz(), &self.shared.output_nnz(), 0, 0, Sx::zero());
        for (k, a) in args.iter().enumerate() {
            self.check_len("input", k, io.input[k].len(), a.nnz())?;
            io.input[k] = a.data().to_vec();
        }
        tape.evaluate(&mut Vec::new(), &mut Vec::new(), &mut io, 0, 0)?;
        Ok(self
            .shared
            .output_sparsity
            .iter()
            .zip(io.output)
            .map(|(sp, data)| SxMatrix::from_parts(sp.clone(), data))
            .collect())
    }

    // --- sparsity and coloring ---

    /// Jacobian sparsity of output `oind` with respect to input `iind`.
    ///
    /// Compact patterns are over nonzeros (`nnz_out x nnz_in`); otherwise
    /// the pattern is placed in the full `numel_out x numel_in` space by
    /// the row-major element index of every nonzero.
    pub fn jac_sparsity(&self, iind: usize, oind: usize, compact: bool, symmetric: bool) -> Result<Sparsity> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        let key = (iind, oind, compact, symmetric);
        if let Some(sp) = self.cache().sparsity.get(&key).cloned() {
            log::debug!("\"{}\": jacobian sparsity {key:?} cached", self.name());
            return Ok(sp);
        }

        let sp = if compact {
            self.detect_sparsity(iind, oind, symmetric)?
        } else {
            let pattern = self.jac_sparsity(iind, oind, true, symmetric)?;
            self.enlarge(&pattern, iind, oind)
        };
        self.cache().sparsity.insert(key, sp.clone());
        Ok(sp)
    }

    fn enlarge(&self, pattern: &Sparsity, iind: usize, oind: usize) -> Sparsity {
        let si = &self.shared.input_sparsity[iind];
        let so = &self.shared.output_sparsity[oind];
        pattern.enlarge(so.numel(), si.numel(), &so.elements(), &si.elements())
    }

    fn detect_sparsity(&self, iind: usize, oind: usize, symmetric: bool) -> Result<Sparsity> {
        let nz_in = self.shared.input_sparsity[iind].nnz();
        let nz_out = self.shared.output_sparsity[oind].nnz();
        if symmetric && nz_in != nz_out {
            return Err(Error::InvalidSparsity(format!(
                "symmetric Jacobian block of \"{}\" must be square, got {nz_out}x{nz_in}",
                self.name()
            )));
        }
        if let Body::Opaque(Opaque::External(callable)) = &self.shared.body {
            if let Some(sp) = callable.jac_sparsity(iind, oind) {
                if sp.shape() != (nz_out, nz_in) {
                    return Err(Error::InvalidSparsity(format!(
                        "external \"{}\" reports a {}x{} pattern for a {nz_out}x{nz_in} jacobian block",
                        self.name(),
                        sp.nrow(),
                        sp.ncol()
                    )));
                }
                log::debug!("\"{}\": jacobian sparsity of output {oind} wrt input {iind} from the callable", self.name());
                return Ok(if symmetric { sp.symmetrize() } else { sp });
            }
        }
        let opts = &self.shared.options;
        let detect_opts = DetectOptions {
            ad_mode: opts.ad_mode,
            adjoint_penalty: opts.adjoint_penalty,
            hierarchical: opts.hierarchical_sparsity,
        };
        let mut sweep = BlockSweep::new(&self.shared, iind, oind);
        let sp = detect::jac_sparsity(&mut sweep, &detect_opts, symmetric);
        log::debug!(
            "\"{}\": jacobian sparsity of output {oind} wrt input {iind}: {}x{}, {} nonzeros",
            self.name(),
            sp.nrow(),
            sp.ncol(),
            sp.nnz()
        );
        Ok(sp)
    }

    /// Coloring of the Jacobian block, picking the sweep direction.
    ///
    /// Symmetric blocks get a star coloring swept forward. Otherwise
    /// `ad_mode` forces a direction, or both unidirectional colorings are
    /// computed and forward wins unless it needs more than
    /// `adjoint_penalty` times the adjoint colors.
    pub fn partition(&self, iind: usize, oind: usize, compact: bool, symmetric: bool) -> Result<Partition> {
        let key = (iind, oind, compact, symmetric);
        let pattern = self.jac_sparsity(iind, oind, compact, symmetric)?;
        if let Some(p) = self.cache().partition.get(&key).cloned() {
            return Ok(p);
        }

        let opts = &self.shared.options;
        let partition = if symmetric {
            Partition::Forward(star_coloring(&pattern)?)
        } else {
            match opts.ad_mode {
                AdMode::Forward => Partition::Forward(column_coloring(&pattern)),
                AdMode::Reverse => Partition::Adjoint(row_coloring(&pattern)),
                AdMode::Automatic => {
                    let fwd = column_coloring(&pattern);
                    let adj = row_coloring(&pattern);
                    log::debug!(
                        "\"{}\": {} forward colors, {} adjoint colors",
                        self.name(),
                        fwd.nrow(),
                        adj.nrow()
                    );
                    if fwd.nrow() <= opts.adjoint_penalty * adj.nrow() {
                        Partition::Forward(fwd)
                    } else {
                        Partition::Adjoint(adj)
                    }
                }
            }
        };
        log::debug!(
            "\"{}\": {} partition with {} colors for block {key:?}",
            self.name(),
            if partition.is_forward() { "forward" } else { "adjoint" },
            partition.ncolors()
        );
        self.cache().partition.insert(key, partition.clone());
        Ok(partition)
    }

    /// Jacobian block values at the current inputs, one sweep per color.
    ///
    /// Overwrites the seed and sensitivity buffers of this instance.
    pub fn sparse_jacobian_values(&mut self, iind: usize, oind: usize, symmetric: bool) -> Result<DMatrix> {
        let pattern = self.jac_sparsity(iind, oind, true, symmetric)?;
        let partition = self.partition(iind, oind, true, symmetric)?;
        let values = self.assemble(iind, oind, &pattern, &partition, symmetric)?;
        Ok(DMatrix::from_parts(pattern, values))
    }

    // --- derivative Functions ---

    fn derived(&self, key: DerivedKey, build: impl FnOnce(&Function) -> Result<Function>) -> Result<Function> {
        let hit = self.cache().derived.get(&key).and_then(Weak::upgrade);
        if let Some(shared) = hit {
            log::debug!("\"{}\": {key:?} cached", self.name());
            return Ok(Function::from_shared(shared));
        }
        log::debug!("\"{}\": building {key:?}", self.name());
        let f = build(self)?;
        let mut cache = self.cache();
        cache.derived.retain(|_, w| w.strong_count() > 0);
        cache.derived.insert(key, Arc::downgrade(&f.shared));
        Ok(f)
    }

    fn derived_options(&self, prefix: &str) -> FunctionOptions {
        let mut opts = self.shared.options.clone();
        opts.name = format!("{prefix}_{}", self.name());
        opts
    }

    /// Function with outputs `[J, outputs...]` where `J` is the Jacobian of
    /// output `oind` with respect to input `iind`.
    pub fn jacobian(&self, iind: usize, oind: usize) -> Result<Function> {
        self.jacobian_with(iind, oind, false, false)
    }

    /// [`jacobian`](Self::jacobian) with `J` over nonzeros when `compact`,
    /// and assembled from a star coloring when `symmetric`.
    pub fn jacobian_with(&self, iind: usize, oind: usize, compact: bool, symmetric: bool) -> Result<Function> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        let key = DerivedKey::Jacobian {
            iind,
            oind,
            compact,
            symmetric,
        };
        self.derived(key, |f| {
            f.build_jacobian(iind, oind, compact, symmetric, Layout::Jacobian, f.derived_options("jac"))
        })
    }

    /// Function with outputs `[g, outputs...]` where `g` is the gradient of
    /// scalar output `oind` on the sparsity of input `iind`.
    pub fn gradient(&self, iind: usize, oind: usize) -> Result<Function> {
        self.check_in(iind)?;
        self.check_scalar_output("gradients", oind)?;
        self.derived(DerivedKey::Gradient { iind, oind }, |f| {
            f.build_jacobian(iind, oind, true, false, Layout::Gradient, f.derived_options("grad"))
        })
    }

    /// Function with outputs `[H, g, outputs...]`: the Hessian of scalar
    /// output `oind` with respect to input `iind`, the gradient, and the
    /// original outputs.
    ///
    /// `H` is the symmetric Jacobian of the gradient. The gradient Function
    /// is built with `numeric_jacobian = numeric_hessian`.
    pub fn hessian(&self, iind: usize, oind: usize) -> Result<Function> {
        self.check_in(iind)?;
        self.check_scalar_output("hessians", oind)?;
        self.derived(DerivedKey::Hessian { iind, oind }, |f| {
            let mut grad_opts = f.derived_options("grad");
            grad_opts.numeric_jacobian = f.shared.options.numeric_hessian;
            let g = f.build_jacobian(iind, oind, true, false, Layout::Gradient, grad_opts)?;
            g.build_jacobian(iind, 0, false, true, Layout::Jacobian, f.derived_options("hess"))
        })
    }

    /// Function computing the outputs together with `nfwd` forward and
    /// `nadj` adjoint directional derivatives.
    ///
    /// Inputs: `[inputs..., fwd seeds (nfwd x n_in)..., adj seeds (nadj x
    /// n_out)...]`. Outputs: `[outputs..., fwd sens (nfwd x n_out)..., adj
    /// sens (nadj x n_in)...]`.
    pub fn derivative(&self, nfwd: usize, nadj: usize) -> Result<Function> {
        self.derived(DerivedKey::Derivative { nfwd, nadj }, |f| {
            let opts = f.derived_options(&format!("fwd{nfwd}_adj{nadj}"));
            match &f.shared.body {
                Body::Sx { tape, inputs } => symbolic::derivative_function(f, tape, inputs, nfwd, nadj, opts),
                Body::Opaque(_) => Ok(numeric::derivative_function(f, nfwd, nadj, opts)),
            }
        })
    }

    fn build_jacobian(
        &self,
        iind: usize,
        oind: usize,
        compact: bool,
        symmetric: bool,
        layout: Layout,
        options: FunctionOptions,
    ) -> Result<Function> {
        match &self.shared.body {
            Body::Sx { tape, inputs } if !self.shared.options.numeric_jacobian => symbolic::jacobian_function(
                self, tape, inputs, iind, oind, compact, symmetric, layout, options,
            ),
            _ => numeric::jacobian_function(self, iind, oind, compact, layout, options),
        }
    }
}
