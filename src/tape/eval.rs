//! Forward evaluation with optional taping, then forward and adjoint
//! sweeps over the recorded partial derivatives.

use crate::error::{Error, Result};
use crate::io::IoBuffers;
use crate::opcode::{self, OpCode};
use crate::scalar::Scalar;

use super::Tape;

impl Tape {
    /// Replay the tape over `T`.
    ///
    /// Without directions this is a single forward pass. With `nfwd` or
    /// `nadj` directions the forward pass also records `[∂r/∂a, ∂r/∂b]` for
    /// every operation into `partials`, after which one forward sweep runs
    /// per forward direction and one reverse sweep per adjoint direction.
    ///
    /// A result slot may alias one of its own operand slots (the operand's
    /// last use frees the slot the result then takes). Every element reads
    /// its operands before writing its result, and the adjoint sweep reads
    /// and clears the result slot before accumulating into the operands.
    pub(crate) fn evaluate<T: Scalar>(
        &self,
        work: &mut Vec<T>,
        partials: &mut Vec<[T; 2]>,
        io: &mut IoBuffers<T>,
        nfwd: usize,
        nadj: usize,
    ) -> Result<()> {
        assert!(nfwd <= io.nfwd() && nadj <= io.nadj(), "direction buffers too small");
        work.clear();
        work.resize(self.worksize, T::zero());
        let taping = nfwd > 0 || nadj > 0;
        partials.clear();
        if taping {
            partials.reserve(self.num_operations);
        }

        for i in 0..self.len() {
            let op = self.opcodes[i];
            let [a, b] = self.arg_indices[i];
            let (a, b) = (a as usize, b as usize);
            let res = self.results[i] as usize;
            match op {
                OpCode::Input => work[res] = io.input[a][b].clone(),
                OpCode::Output => io.output[res][b] = work[a].clone(),
                OpCode::Const => work[res] = T::from_f64(self.constants[i]),
                OpCode::Parameter => {
                    work[res] = T::free_variable(&self.free_vars[a])
                        .ok_or_else(|| self.unresolved("tape"))?;
                }
                _ => {
                    let r = T::apply(op, &work[a], &work[b]);
                    if taping {
                        let p = opcode::partials(op, &work[a], &work[b], &r)
                            .ok_or(Error::MissingDerivative(op))?;
                        partials.push(p);
                    }
                    work[res] = r;
                }
            }
        }

        for dir in 0..nfwd {
            self.forward_sweep(work, partials, io, dir);
        }

        if nadj > 0 {
            work.iter_mut().for_each(|w| *w = T::zero());
            for dir in 0..nadj {
                self.adjoint_sweep(work, partials, io, dir);
            }
        }
        Ok(())
    }

    fn forward_sweep<T: Scalar>(&self, work: &mut [T], partials: &[[T; 2]], io: &mut IoBuffers<T>, dir: usize) {
        let mut k = 0;
        for i in 0..self.len() {
            let op = self.opcodes[i];
            let [a, b] = self.arg_indices[i];
            let (a, b) = (a as usize, b as usize);
            let res = self.results[i] as usize;
            match op {
                OpCode::Input => work[res] = io.fwd_seed[dir][a][b].clone(),
                OpCode::Output => io.fwd_sens[dir][res][b] = work[a].clone(),
                OpCode::Const | OpCode::Parameter => work[res] = T::zero(),
                _ => {
                    let [p0, p1] = &partials[k];
                    k += 1;
                    work[res] = if a == b {
                        (p0.clone() + p1.clone()) * work[a].clone()
                    } else {
                        p0.clone() * work[a].clone() + p1.clone() * work[b].clone()
                    };
                }
            }
        }
        debug_assert_eq!(k, partials.len());
    }

    /// Reverse sweep. Expects `work` to be all zero and leaves it all zero.
    fn adjoint_sweep<T: Scalar>(&self, work: &mut [T], partials: &[[T; 2]], io: &mut IoBuffers<T>, dir: usize) {
        // inputs the outputs do not depend on have no Input element
        for v in io.adj_sens[dir].iter_mut() {
            v.iter_mut().for_each(|x| *x = T::zero());
        }
        let mut k = partials.len();
        for i in (0..self.len()).rev() {
            let op = self.opcodes[i];
            let [a, b] = self.arg_indices[i];
            let (a, b) = (a as usize, b as usize);
            let res = self.results[i] as usize;
            match op {
                OpCode::Input => {
                    io.adj_sens[dir][a][b] = std::mem::replace(&mut work[res], T::zero());
                }
                OpCode::Output => {
                    let seed = io.adj_seed[dir][res][b].clone();
                    if !seed.is_zero() {
                        work[a] = work[a].clone() + seed;
                    }
                }
                OpCode::Const | OpCode::Parameter => work[res] = T::zero(),
                _ => {
                    k -= 1;
                    let seed = std::mem::replace(&mut work[res], T::zero());
                    if seed.is_zero() {
                        continue;
                    }
                    let [p0, p1] = &partials[k];
                    if a == b {
                        work[a] = work[a].clone() + (p0.clone() + p1.clone()) * seed;
                    } else {
                        work[a] = work[a].clone() + p0.clone() * seed.clone();
                        work[b] = work[b].clone() + p1.clone() * seed;
                    }
                }
            }
        }
        debug_assert_eq!(k, 0);
    }
}
