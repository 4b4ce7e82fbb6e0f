//! Symbolic expression graphs with tape-based algorithmic differentiation.
//!
//! Build expressions from [`Sx`] symbols, sort them into a [`Function`],
//! and evaluate values, forward and adjoint directional derivatives, and
//! sparse Jacobians, gradients and Hessians compressed by graph coloring.
//!
//! ```
//! use symad::{Function, SxMatrix};
//!
//! let x = SxMatrix::sym("x", 2, 1);
//! let (x0, x1) = (&x.data()[0], &x.data()[1]);
//! let f = x0 * x0 * x1;
//! let fun = Function::new("f", vec![x.clone()], vec![f.into()]).unwrap();
//!
//! let mut hess = fun.hessian(0, 0).unwrap();
//! hess.set_input(0, &[1.0, 1.0]).unwrap();
//! hess.evaluate().unwrap();
//! let h = hess.output_matrix(0).unwrap().to_dense();
//! assert_eq!(h, vec![vec![2.0, 2.0], vec![2.0, 0.0]]);
//! ```

pub mod api;
pub mod coloring;
pub mod detect;
pub mod error;
pub mod function;
mod io;
pub mod matrix;
pub mod opcode;
pub mod scalar;
pub mod sparse;
pub mod sx;
pub mod tape;

pub use error::{Error, EvalReport, Location, Result};
pub use function::{
    AdMode, EvalStats, ExternalCallable, ExternalFn, Function, FunctionOptions, OptionValue, Partition,
    TopologicalSorting,
};
pub use matrix::{DMatrix, Matrix, SxMatrix};
pub use opcode::OpCode;
pub use scalar::Scalar;
pub use sparse::Sparsity;
pub use sx::Sx;
pub use tape::{AlgEl, Tape};
