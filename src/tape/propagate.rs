//! Dependency propagation over bit-words.
//!
//! Every work-array value becomes a machine word whose bit `j` means "may
//! depend on seed direction `j`". Operations OR their operands together,
//! so up to [`BVEC_SIZE`] directions are propagated in one pass. The
//! result over-approximates true dependency (`x - x` depends on `x`),
//! which is all sparsity detection needs.

use crate::opcode::OpCode;

use super::Tape;

/// One bit per simultaneous direction.
pub type Bvec = u64;

/// Number of directions propagated per pass.
pub const BVEC_SIZE: usize = Bvec::BITS as usize;

impl Tape {
    /// Forward propagation: output bits are the union of the input bits
    /// they may depend on.
    pub(crate) fn propagate_forward(&self, work: &mut Vec<Bvec>, input: &[Vec<Bvec>], output: &mut [Vec<Bvec>]) {
        work.clear();
        work.resize(self.worksize, 0);
        for i in 0..self.len() {
            let [a, b] = self.arg_indices[i];
            let (a, b) = (a as usize, b as usize);
            let res = self.results[i] as usize;
            match self.opcodes[i] {
                OpCode::Input => work[res] = input[a][b],
                OpCode::Output => output[res][b] = work[a],
                OpCode::Const | OpCode::Parameter => work[res] = 0,
                _ => work[res] = work[a] | work[b],
            }
        }
    }

    /// Reverse propagation: input bits are the union of the output bits
    /// that may depend on them.
    pub(crate) fn propagate_reverse(&self, work: &mut Vec<Bvec>, input: &mut [Vec<Bvec>], output: &[Vec<Bvec>]) {
        work.clear();
        work.resize(self.worksize, 0);
        for v in input.iter_mut() {
            v.iter_mut().for_each(|w| *w = 0);
        }
        for i in (0..self.len()).rev() {
            let [a, b] = self.arg_indices[i];
            let (a, b) = (a as usize, b as usize);
            let res = self.results[i] as usize;
            match self.opcodes[i] {
                OpCode::Input => input[a][b] = std::mem::take(&mut work[res]),
                OpCode::Output => work[a] |= output[res][b],
                OpCode::Const | OpCode::Parameter => work[res] = 0,
                _ => {
                    let seed = std::mem::take(&mut work[res]);
                    work[a] |= seed;
                    work[b] |= seed;
                }
            }
        }
    }
}
