//! The linear tape a Function replays.
//!
//! A [`Tape`] is the topologically sorted form of an expression DAG
//! (see [`Tape::from_graph`]). Each element reads operand slots of a work
//! array and writes one result slot. Three opcodes mark the boundaries:
//! [`OpCode::Input`] loads a function input nonzero, [`OpCode::Output`]
//! stores one, [`OpCode::Const`] loads a constant.
//!
//! The tape is built once and never changes afterwards. The same tape is
//! replayed numerically, symbolically and over dependency bit-words by the
//! submodules.

use crate::error::{Error, Result};
use crate::io::IoBuffers;
use crate::opcode::{self, OpCode};
use crate::sx::Sx;

// Submodules, each adds impl blocks to Tape
mod eval;
mod propagate;
mod sort;

#[cfg(feature = "serde")]
mod serde_support;

pub use self::propagate::{Bvec, BVEC_SIZE};

/// One tape element, as seen from outside.
///
/// | op          | `res`              | `arg`                      |
/// |-------------|--------------------|----------------------------|
/// | `Input`     | slot               | `[input index, nonzero]`   |
/// | `Output`    | output index       | `[slot, nonzero]`          |
/// | `Const`     | slot               | unused, see `value`        |
/// | `Parameter` | slot               | `[free variable index, 0]` |
/// | operation   | slot               | `[slot a, slot b]`         |
///
/// Unary operations have `arg[0] == arg[1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlgEl {
    pub op: OpCode,
    pub res: u32,
    pub arg: [u32; 2],
    pub value: f64,
}

/// Topologically ordered algorithm over a reusable work array.
#[derive(Clone, Debug)]
pub struct Tape {
    pub(crate) opcodes: Vec<OpCode>,
    pub(crate) arg_indices: Vec<[u32; 2]>,
    pub(crate) results: Vec<u32>,
    /// Value of each `Const` element, zero elsewhere.
    pub(crate) constants: Vec<f64>,
    pub(crate) worksize: usize,
    /// Elements that record partial derivatives when taping.
    pub(crate) num_operations: usize,
    pub(crate) input_nnz: Vec<usize>,
    pub(crate) output_nnz: Vec<usize>,
    pub(crate) free_vars: Vec<Sx>,
}

impl Tape {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.opcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }

    pub fn element(&self, i: usize) -> AlgEl {
        AlgEl {
            op: self.opcodes[i],
            res: self.results[i],
            arg: self.arg_indices[i],
            value: self.constants[i],
        }
    }

    pub fn elements(&self) -> impl Iterator<Item = AlgEl> + '_ {
        (0..self.len()).map(move |i| self.element(i))
    }

    pub fn opcodes(&self) -> &[OpCode] {
        &self.opcodes
    }

    /// Size of the work array.
    pub fn worksize(&self) -> usize {
        self.worksize
    }

    /// Number of elements that are operations (not inputs, outputs,
    /// constants or free variables).
    pub fn num_operations(&self) -> usize {
        self.num_operations
    }

    /// Symbolic leaves that are not function inputs.
    pub fn free_variables(&self) -> &[Sx] {
        &self.free_vars
    }

    pub fn input_nnz(&self) -> &[usize] {
        &self.input_nnz
    }

    pub fn output_nnz(&self) -> &[usize] {
        &self.output_nnz
    }

    pub(crate) fn unresolved(&self, function: &str) -> Error {
        Error::UnresolvedSymbols {
            function: function.to_string(),
            names: self
                .free_vars
                .iter()
                .map(|s| s.name().unwrap_or("?").to_string())
                .collect(),
        }
    }

    /// Every operand slot is written by an earlier element before it is
    /// read, and every output nonzero is stored exactly once.
    pub fn is_topologically_ordered(&self) -> bool {
        let mut written = vec![false; self.worksize];
        let mut stored: Vec<Vec<bool>> = self.output_nnz.iter().map(|&n| vec![false; n]).collect();
        for el in self.elements() {
            let res = el.res as usize;
            match el.op {
                OpCode::Output => {
                    let [a, nz] = el.arg;
                    let slot = stored.get_mut(res).and_then(|o| o.get_mut(nz as usize));
                    let ready = written.get(a as usize).copied().unwrap_or(false);
                    match slot {
                        Some(s) if ready && !*s => *s = true,
                        _ => return false,
                    }
                }
                OpCode::Input | OpCode::Const | OpCode::Parameter => match written.get_mut(res) {
                    Some(w) => *w = true,
                    None => return false,
                },
                op => {
                    let nd = opcode::ndeps(op);
                    let ok = el.arg[..nd]
                        .iter()
                        .all(|&s| written.get(s as usize).copied().unwrap_or(false));
                    if !ok || res >= self.worksize {
                        return false;
                    }
                    written[res] = true;
                }
            }
        }
        stored.iter().all(|o| o.iter().all(|&s| s))
    }

    /// Evaluate the tape at the given input nonzeros.
    pub fn eval_numeric(&self, inputs: &[&[f64]]) -> Result<Vec<Vec<f64>>> {
        if !self.free_vars.is_empty() {
            return Err(self.unresolved("tape"));
        }
        if inputs.len() != self.input_nnz.len() {
            return Err(Error::ArityMismatch {
                function: "tape".into(),
                kind: "inputs",
                expected: self.input_nnz.len(),
                got: inputs.len(),
            });
        }
        let mut io = IoBuffers::new(&self.input_nnz, &self.output_nnz, 0, 0, 0.0);
        for (i, x) in inputs.iter().enumerate() {
            if x.len() != self.input_nnz[i] {
                return Err(Error::DimensionMismatch {
                    function: "tape".into(),
                    kind: "input",
                    index: i,
                    expected: self.input_nnz[i],
                    got: x.len(),
                });
            }
            io.input[i].copy_from_slice(x);
        }
        let mut work = Vec::new();
        let mut partials = Vec::new();
        self.evaluate(&mut work, &mut partials, &mut io, 0, 0)?;
        Ok(io.output)
    }
}
