//! Symbolic scalar expressions.
//!
//! An [`Sx`] is a reference-counted handle to an immutable node of an
//! expression DAG: a named symbol, a numeric constant, or an elementary
//! operation over one or two operand nodes. A node may be shared by any
//! number of parents; it lives as long as its longest holder.
//!
//! Nodes carry no traversal state. Graph algorithms identify a node by
//! the address of its shared allocation ([`Sx::id`]) and keep their visited
//! markers in per-traversal maps, so the same node can take part in any
//! number of functions.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};
use std::sync::Arc;

use crate::opcode::{self, OpCode};

/// Handle to a node of a symbolic expression graph.
#[derive(Clone)]
pub struct Sx(Arc<SxNode>);

struct SxNode {
    kind: Kind,
    deps: Vec<Sx>,
}

enum Kind {
    Symbol(String),
    Constant(f64),
    Operation(OpCode),
}

// Deep chains (long sums, recurrences) would otherwise drop recursively,
// one stack frame per node.
impl Drop for SxNode {
    fn drop(&mut self) {
        if self.deps.is_empty() {
            return;
        }
        let mut stack = std::mem::take(&mut self.deps);
        while let Some(sx) = stack.pop() {
            if let Ok(mut node) = Arc::try_unwrap(sx.0) {
                stack.append(&mut node.deps);
            }
        }
    }
}

impl Sx {
    /// A fresh symbolic variable.
    pub fn sym(name: impl Into<String>) -> Sx {
        Sx::leaf(Kind::Symbol(name.into()))
    }

    /// A numeric constant.
    pub fn constant(value: f64) -> Sx {
        Sx::leaf(Kind::Constant(value))
    }

    pub fn zero() -> Sx {
        Sx::constant(0.0)
    }

    pub fn one() -> Sx {
        Sx::constant(1.0)
    }

    fn leaf(kind: Kind) -> Sx {
        Sx(Arc::new(SxNode {
            kind,
            deps: Vec::new(),
        }))
    }

    fn node(op: OpCode, deps: Vec<Sx>) -> Sx {
        Sx(Arc::new(SxNode {
            kind: Kind::Operation(op),
            deps,
        }))
    }

    /// The opcode of this node. Symbols report [`OpCode::Parameter`],
    /// constants [`OpCode::Const`].
    pub fn op(&self) -> OpCode {
        match self.0.kind {
            Kind::Symbol(_) => OpCode::Parameter,
            Kind::Constant(_) => OpCode::Const,
            Kind::Operation(op) => op,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self.0.kind, Kind::Symbol(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.0.kind, Kind::Constant(_))
    }

    /// Numeric value of a constant node.
    pub fn value(&self) -> Option<f64> {
        match self.0.kind {
            Kind::Constant(v) => Some(v),
            _ => None,
        }
    }

    /// Name of a symbol node.
    pub fn name(&self) -> Option<&str> {
        match &self.0.kind {
            Kind::Symbol(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value() == Some(0.0)
    }

    pub fn is_one(&self) -> bool {
        self.value() == Some(1.0)
    }

    /// Operand nodes (empty for leaves).
    pub fn deps(&self) -> &[Sx] {
        &self.0.deps
    }

    pub fn ndeps(&self) -> usize {
        self.0.deps.len()
    }

    /// Stable identity of the node for the lifetime of its allocation.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// True if both handles point at the same node.
    pub fn is_same(&self, other: &Sx) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Build `op(a, b)`, folding constants and trivial identities.
    ///
    /// For unary opcodes `b` is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `op` is structural (`Input`, `Output`, `Const` or
    /// `Parameter`); use [`Sx::sym`] and [`Sx::constant`] for leaves.
    pub fn apply(op: OpCode, a: &Sx, b: &Sx) -> Sx {
        assert!(!op.is_structural(), "cannot build a {op} node");
        let unary = opcode::ndeps(op) == 1;
        let b = if unary { a } else { b };

        if let (Some(x), Some(y)) = (a.value(), b.value()) {
            return Sx::constant(opcode::eval_forward(op, x, y));
        }

        match op {
            OpCode::Add if a.is_zero() => return b.clone(),
            OpCode::Add | OpCode::Sub if b.is_zero() => return a.clone(),
            OpCode::Sub if a.is_zero() => return Sx::apply(OpCode::Neg, b, b),
            OpCode::Mul if a.is_zero() || b.is_zero() => return Sx::zero(),
            OpCode::Mul if a.is_one() => return b.clone(),
            OpCode::Mul if b.is_one() => return a.clone(),
            OpCode::Mul if a.value() == Some(-1.0) => return Sx::apply(OpCode::Neg, b, b),
            OpCode::Div if b.is_one() => return a.clone(),
            OpCode::Div if a.is_zero() => return Sx::zero(),
            OpCode::Neg if a.op() == OpCode::Neg => return a.deps()[0].clone(),
            OpCode::Pow if b.is_constant() => return Sx::apply(OpCode::ConstPow, a, b),
            OpCode::ConstPow => match b.value() {
                Some(v) if v == 1.0 => return a.clone(),
                Some(v) if v == 0.0 => return Sx::one(),
                Some(v) if v == 2.0 => return Sx::apply(OpCode::Sq, a, a),
                _ => {}
            },
            _ => {}
        }

        if unary {
            Sx::node(op, vec![a.clone()])
        } else {
            Sx::node(op, vec![a.clone(), b.clone()])
        }
    }

    fn unop(&self, op: OpCode) -> Sx {
        Sx::apply(op, self, self)
    }

    pub fn sq(&self) -> Sx {
        self.unop(OpCode::Sq)
    }
    pub fn sqrt(&self) -> Sx {
        self.unop(OpCode::Sqrt)
    }
    pub fn recip(&self) -> Sx {
        self.unop(OpCode::Recip)
    }
    pub fn exp(&self) -> Sx {
        self.unop(OpCode::Exp)
    }
    pub fn ln(&self) -> Sx {
        self.unop(OpCode::Ln)
    }
    pub fn sin(&self) -> Sx {
        self.unop(OpCode::Sin)
    }
    pub fn cos(&self) -> Sx {
        self.unop(OpCode::Cos)
    }
    pub fn tan(&self) -> Sx {
        self.unop(OpCode::Tan)
    }
    pub fn asin(&self) -> Sx {
        self.unop(OpCode::Asin)
    }
    pub fn acos(&self) -> Sx {
        self.unop(OpCode::Acos)
    }
    pub fn atan(&self) -> Sx {
        self.unop(OpCode::Atan)
    }
    pub fn sinh(&self) -> Sx {
        self.unop(OpCode::Sinh)
    }
    pub fn cosh(&self) -> Sx {
        self.unop(OpCode::Cosh)
    }
    pub fn tanh(&self) -> Sx {
        self.unop(OpCode::Tanh)
    }
    pub fn abs(&self) -> Sx {
        self.unop(OpCode::Abs)
    }
    pub fn sign(&self) -> Sx {
        self.unop(OpCode::Sign)
    }
    pub fn floor(&self) -> Sx {
        self.unop(OpCode::Floor)
    }
    pub fn ceil(&self) -> Sx {
        self.unop(OpCode::Ceil)
    }

    pub fn powf(&self, exponent: impl Into<Sx>) -> Sx {
        Sx::apply(OpCode::Pow, self, &exponent.into())
    }
    pub fn atan2(&self, other: impl Into<Sx>) -> Sx {
        Sx::apply(OpCode::Atan2, self, &other.into())
    }
    pub fn fmin(&self, other: impl Into<Sx>) -> Sx {
        Sx::apply(OpCode::Fmin, self, &other.into())
    }
    pub fn fmax(&self, other: impl Into<Sx>) -> Sx {
        Sx::apply(OpCode::Fmax, self, &other.into())
    }
    pub fn rem(&self, other: impl Into<Sx>) -> Sx {
        Sx::apply(OpCode::Rem, self, &other.into())
    }
}

impl From<f64> for Sx {
    fn from(value: f64) -> Sx {
        Sx::constant(value)
    }
}

impl From<&Sx> for Sx {
    fn from(value: &Sx) -> Sx {
        value.clone()
    }
}

impl fmt::Display for Sx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            Kind::Symbol(name) => f.write_str(name),
            Kind::Constant(v) => write!(f, "{v}"),
            Kind::Operation(op) => {
                let deps = &self.0.deps;
                let infix = match op {
                    OpCode::Add => Some('+'),
                    OpCode::Sub => Some('-'),
                    OpCode::Mul => Some('*'),
                    OpCode::Div => Some('/'),
                    _ => None,
                };
                match (infix, deps.as_slice()) {
                    (Some(c), [a, b]) => write!(f, "({a}{c}{b})"),
                    (_, [a]) if *op == OpCode::Neg => write!(f, "(-{a})"),
                    (_, [a]) => write!(f, "{}({a})", op.name()),
                    (_, [a, b]) => write!(f, "{}({a},{b})", op.name()),
                    _ => write!(f, "{}()", op.name()),
                }
            }
        }
    }
}

impl fmt::Debug for Sx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ──────────────────────────────────────────────
//  Operators
// ──────────────────────────────────────────────

macro_rules! sx_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for Sx {
            type Output = Sx;
            #[inline]
            fn $method(self, rhs: Sx) -> Sx {
                Sx::apply($op, &self, &rhs)
            }
        }

        impl $trait<&Sx> for Sx {
            type Output = Sx;
            #[inline]
            fn $method(self, rhs: &Sx) -> Sx {
                Sx::apply($op, &self, rhs)
            }
        }

        impl $trait<Sx> for &Sx {
            type Output = Sx;
            #[inline]
            fn $method(self, rhs: Sx) -> Sx {
                Sx::apply($op, self, &rhs)
            }
        }

        impl $trait<&Sx> for &Sx {
            type Output = Sx;
            #[inline]
            fn $method(self, rhs: &Sx) -> Sx {
                Sx::apply($op, self, rhs)
            }
        }

        impl $trait<f64> for Sx {
            type Output = Sx;
            #[inline]
            fn $method(self, rhs: f64) -> Sx {
                Sx::apply($op, &self, &Sx::constant(rhs))
            }
        }

        impl $trait<f64> for &Sx {
            type Output = Sx;
            #[inline]
            fn $method(self, rhs: f64) -> Sx {
                Sx::apply($op, self, &Sx::constant(rhs))
            }
        }

        impl $trait<Sx> for f64 {
            type Output = Sx;
            #[inline]
            fn $method(self, rhs: Sx) -> Sx {
                Sx::apply($op, &Sx::constant(self), &rhs)
            }
        }

        impl $trait<&Sx> for f64 {
            type Output = Sx;
            #[inline]
            fn $method(self, rhs: &Sx) -> Sx {
                Sx::apply($op, &Sx::constant(self), rhs)
            }
        }
    };
}

sx_binop!(Add, add, OpCode::Add);
sx_binop!(Sub, sub, OpCode::Sub);
sx_binop!(Mul, mul, OpCode::Mul);
sx_binop!(Div, div, OpCode::Div);

impl Neg for Sx {
    type Output = Sx;
    fn neg(self) -> Sx {
        self.unop(OpCode::Neg)
    }
}

impl Neg for &Sx {
    type Output = Sx;
    fn neg(self) -> Sx {
        self.unop(OpCode::Neg)
    }
}

impl AddAssign for Sx {
    fn add_assign(&mut self, rhs: Sx) {
        *self = Sx::apply(OpCode::Add, self, &rhs);
    }
}

impl SubAssign for Sx {
    fn sub_assign(&mut self, rhs: Sx) {
        *self = Sx::apply(OpCode::Sub, self, &rhs);
    }
}

impl MulAssign for Sx {
    fn mul_assign(&mut self, rhs: Sx) {
        *self = Sx::apply(OpCode::Mul, self, &rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_fold() {
        let e = Sx::constant(2.0) * Sx::constant(3.0) + 1.0;
        assert_eq!(e.value(), Some(7.0));
    }

    #[test]
    fn trivial_identities_do_not_create_nodes() {
        let x = Sx::sym("x");
        assert!((&x + 0.0).is_same(&x));
        assert!((1.0 * &x).is_same(&x));
        assert!((&x * 0.0).is_zero());
        assert!((-(-&x)).is_same(&x));
        assert_eq!(x.powf(2.0).op(), OpCode::Sq);
    }

    #[test]
    #[should_panic(expected = "cannot build")]
    fn structural_opcodes_are_not_operations() {
        let x = Sx::sym("x");
        Sx::apply(OpCode::Output, &x, &x);
    }

    #[test]
    fn unary_nodes_have_one_dependency() {
        let x = Sx::sym("x");
        let s = x.sin();
        assert_eq!(s.op(), OpCode::Sin);
        assert_eq!(s.ndeps(), 1);
        assert!(s.deps()[0].is_same(&x));
    }

    #[test]
    fn display_is_readable() {
        let x = Sx::sym("x");
        let y = Sx::sym("y");
        assert_eq!((&x * &y + x.sin()).to_string(), "((x*y)+sin(x))");
    }

    #[test]
    fn dropping_a_long_chain_does_not_recurse() {
        let x = Sx::sym("x");
        let mut acc = x.clone();
        for _ in 0..200_000 {
            acc = acc.sin();
        }
        drop(acc);
    }
}
