//! The [`Scalar`] trait: the value type a tape is replayed over.
//!
//! The evaluation engine is written once, generic over `T: Scalar`, and
//! instantiated with `f64` for numeric evaluation and with [`Sx`] for
//! symbolic evaluation (source-transformation AD).

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::opcode::{self, OpCode};
use crate::sx::Sx;

/// A value a tape can be evaluated over.
pub trait Scalar:
    Clone
    + Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    /// Lift a numeric constant.
    fn from_f64(val: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }

    /// Exact zero: `0.0` for numbers, the zero constant for expressions.
    fn is_zero(&self) -> bool;

    /// Apply an elementary operation.
    fn apply(op: OpCode, a: &Self, b: &Self) -> Self;

    /// Apply a unary operation.
    fn unary(op: OpCode, a: &Self) -> Self {
        Self::apply(op, a, a)
    }

    /// Value substituted for a free variable, if this scalar type can
    /// represent one.
    fn free_variable(sym: &Sx) -> Option<Self>;
}

impl Scalar for f64 {
    #[inline]
    fn from_f64(val: f64) -> Self {
        val
    }

    #[inline]
    fn is_zero(&self) -> bool {
        *self == 0.0
    }

    #[inline]
    fn apply(op: OpCode, a: &Self, b: &Self) -> Self {
        opcode::eval_forward(op, *a, *b)
    }

    #[inline]
    fn free_variable(_sym: &Sx) -> Option<Self> {
        None
    }
}

impl Scalar for Sx {
    fn from_f64(val: f64) -> Self {
        Sx::constant(val)
    }

    fn is_zero(&self) -> bool {
        Sx::is_zero(self)
    }

    fn apply(op: OpCode, a: &Self, b: &Self) -> Self {
        Sx::apply(op, a, b)
    }

    fn free_variable(sym: &Sx) -> Option<Self> {
        Some(sym.clone())
    }
}
