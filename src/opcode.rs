//! Elementary operation codes and their dispatch tables.
//!
//! Every tape element carries one [`OpCode`]. The free functions in this
//! module give, per opcode, the arity ([`ndeps`]), the value function
//! ([`eval_forward`]) and the local partial derivatives ([`partials`]).
//! The evaluator is a flat loop over tape elements that calls into these
//! tables; there is no per-node virtual dispatch.

use std::fmt;

use num_traits::Float;

use crate::scalar::Scalar;

/// Elementary operation codes.
///
/// Unary operations are stored on the tape with both operand slots equal,
/// so every evaluator can treat them as binary operations whose second
/// partial derivative is zero.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OpCode {
    // ── Structural ──
    /// Load nonzero `arg[1]` of function input `arg[0]`.
    Input,
    /// Store slot `arg[0]` into nonzero `arg[1]` of function output `res`.
    Output,
    /// Numeric constant.
    Const,
    /// Symbolic leaf that is not a function input (a free variable).
    Parameter,

    // ── Binary ──
    Add,
    Sub,
    Mul,
    Div,
    /// `a^b` with a variable exponent.
    Pow,
    /// `a^b` where `b` is a constant. Avoids `ln(a)` in the derivative.
    ConstPow,
    Atan2,
    Fmin,
    Fmax,
    /// Floating-point remainder. Has no derivative rule.
    Rem,

    // ── Unary ──
    Neg,
    Recip,
    Sq,
    Sqrt,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Abs,
    /// Zero derivative.
    Sign,
    /// Zero derivative.
    Floor,
    /// Zero derivative.
    Ceil,
}

impl OpCode {
    /// Short lowercase name, used for printing expressions.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Input => "input",
            OpCode::Output => "output",
            OpCode::Const => "const",
            OpCode::Parameter => "parameter",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Pow => "pow",
            OpCode::ConstPow => "constpow",
            OpCode::Atan2 => "atan2",
            OpCode::Fmin => "fmin",
            OpCode::Fmax => "fmax",
            OpCode::Rem => "rem",
            OpCode::Neg => "neg",
            OpCode::Recip => "recip",
            OpCode::Sq => "sq",
            OpCode::Sqrt => "sqrt",
            OpCode::Exp => "exp",
            OpCode::Ln => "log",
            OpCode::Sin => "sin",
            OpCode::Cos => "cos",
            OpCode::Tan => "tan",
            OpCode::Asin => "asin",
            OpCode::Acos => "acos",
            OpCode::Atan => "atan",
            OpCode::Sinh => "sinh",
            OpCode::Cosh => "cosh",
            OpCode::Tanh => "tanh",
            OpCode::Abs => "fabs",
            OpCode::Sign => "sign",
            OpCode::Floor => "floor",
            OpCode::Ceil => "ceil",
        }
    }

    /// True for the tape-boundary and leaf opcodes, which carry no
    /// partial-derivative record.
    #[inline]
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            OpCode::Input | OpCode::Output | OpCode::Const | OpCode::Parameter
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of operand nodes an opcode consumes.
#[inline]
pub fn ndeps(op: OpCode) -> usize {
    match op {
        OpCode::Input | OpCode::Const | OpCode::Parameter => 0,
        OpCode::Output => 1,
        OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Div
        | OpCode::Pow
        | OpCode::ConstPow
        | OpCode::Atan2
        | OpCode::Fmin
        | OpCode::Fmax
        | OpCode::Rem => 2,
        _ => 1,
    }
}

/// `sign(a)` with `sign(0) = 0` and `sign(NaN) = NaN`.
#[inline]
pub fn sign<T: Float>(a: T) -> T {
    if a > T::zero() {
        T::one()
    } else if a < T::zero() {
        -T::one()
    } else if a == T::zero() {
        T::zero()
    } else {
        a
    }
}

/// Evaluate a single opcode numerically.
///
/// For unary ops `b` is ignored (it equals `a` on the tape).
#[inline]
pub fn eval_forward<T: Float>(op: OpCode, a: T, b: T) -> T {
    match op {
        OpCode::Input | OpCode::Output | OpCode::Const | OpCode::Parameter => {
            unreachable!("structural opcodes are handled by the evaluator")
        }

        // Binary
        OpCode::Add => a + b,
        OpCode::Sub => a - b,
        OpCode::Mul => a * b,
        OpCode::Div => a / b,
        OpCode::Pow | OpCode::ConstPow => a.powf(b),
        OpCode::Atan2 => a.atan2(b),
        OpCode::Fmin => {
            if a <= b {
                a
            } else {
                b
            }
        }
        OpCode::Fmax => {
            if a >= b {
                a
            } else {
                b
            }
        }
        OpCode::Rem => a % b,

        // Unary
        OpCode::Neg => -a,
        OpCode::Recip => a.recip(),
        OpCode::Sq => a * a,
        OpCode::Sqrt => a.sqrt(),
        OpCode::Exp => a.exp(),
        OpCode::Ln => a.ln(),
        OpCode::Sin => a.sin(),
        OpCode::Cos => a.cos(),
        OpCode::Tan => a.tan(),
        OpCode::Asin => a.asin(),
        OpCode::Acos => a.acos(),
        OpCode::Atan => a.atan(),
        OpCode::Sinh => a.sinh(),
        OpCode::Cosh => a.cosh(),
        OpCode::Tanh => a.tanh(),
        OpCode::Abs => a.abs(),
        OpCode::Sign => sign(a),
        OpCode::Floor => a.floor(),
        OpCode::Ceil => a.ceil(),
    }
}

/// Local partial derivatives `[∂r/∂a, ∂r/∂b]` of `r = op(a, b)`.
///
/// Written once over [`Scalar`] so the same rules serve numeric taping
/// (`f64`) and source-transformation AD (`Sx`). Returns `None` for an
/// opcode without a derivative rule.
pub fn partials<T: Scalar>(op: OpCode, a: &T, b: &T, r: &T) -> Option<[T; 2]> {
    let zero = T::zero;
    let one = T::one;
    let half = || T::from_f64(0.5);
    let p = match op {
        OpCode::Input | OpCode::Output | OpCode::Const | OpCode::Parameter => return None,
        OpCode::Rem => return None,

        // Binary
        OpCode::Add => [one(), one()],
        OpCode::Sub => [one(), -one()],
        OpCode::Mul => [b.clone(), a.clone()],
        OpCode::Div => {
            // d/da a/b = 1/b, d/db a/b = -a/b² = -r/b
            [one() / b.clone(), -(r.clone() / b.clone())]
        }
        OpCode::Pow => {
            let bm1 = b.clone() - one();
            let da = b.clone() * T::apply(OpCode::Pow, a, &bm1);
            let db = r.clone() * T::unary(OpCode::Ln, a);
            [da, db]
        }
        OpCode::ConstPow => {
            let bm1 = b.clone() - one();
            [b.clone() * T::apply(OpCode::ConstPow, a, &bm1), zero()]
        }
        OpCode::Atan2 => {
            let denom = a.clone() * a.clone() + b.clone() * b.clone();
            [b.clone() / denom.clone(), -(a.clone() / denom)]
        }
        OpCode::Fmin => {
            let s = T::unary(OpCode::Sign, &(a.clone() - b.clone()));
            [half() * (one() - s.clone()), half() * (one() + s)]
        }
        OpCode::Fmax => {
            let s = T::unary(OpCode::Sign, &(a.clone() - b.clone()));
            [half() * (one() + s.clone()), half() * (one() - s)]
        }

        // Unary
        OpCode::Neg => [-one(), zero()],
        OpCode::Recip => [-(r.clone() * r.clone()), zero()],
        OpCode::Sq => [T::from_f64(2.0) * a.clone(), zero()],
        OpCode::Sqrt => [half() / r.clone(), zero()],
        OpCode::Exp => [r.clone(), zero()],
        OpCode::Ln => [one() / a.clone(), zero()],
        OpCode::Sin => [T::unary(OpCode::Cos, a), zero()],
        OpCode::Cos => [-T::unary(OpCode::Sin, a), zero()],
        OpCode::Tan => [one() + r.clone() * r.clone(), zero()],
        OpCode::Asin => {
            let root = T::unary(OpCode::Sqrt, &(one() - a.clone() * a.clone()));
            [one() / root, zero()]
        }
        OpCode::Acos => {
            let root = T::unary(OpCode::Sqrt, &(one() - a.clone() * a.clone()));
            [-(one() / root), zero()]
        }
        OpCode::Atan => [one() / (one() + a.clone() * a.clone()), zero()],
        OpCode::Sinh => [T::unary(OpCode::Cosh, a), zero()],
        OpCode::Cosh => [T::unary(OpCode::Sinh, a), zero()],
        OpCode::Tanh => [one() - r.clone() * r.clone(), zero()],
        OpCode::Abs => [T::unary(OpCode::Sign, a), zero()],
        OpCode::Sign | OpCode::Floor | OpCode::Ceil => [zero(), zero()],
    };
    Some(p)
}
