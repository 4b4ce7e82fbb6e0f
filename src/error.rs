//! Error types and the numerical-regularity report.

use std::fmt;

use thiserror::Error;

use crate::opcode::OpCode;

/// Errors raised while building, evaluating or differentiating a
/// [`Function`](crate::Function).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("cannot evaluate \"{function}\": free variables [{}]", .names.join(", "))]
    UnresolvedSymbols { function: String, names: Vec<String> },

    #[error("only {what} of scalar outputs allowed, output {index} is {nrow}x{ncol}")]
    NonScalarOutput {
        what: &'static str,
        index: usize,
        nrow: usize,
        ncol: usize,
    },

    #[error("\"{function}\" has {expected} {kind}, got {got}")]
    ArityMismatch {
        function: String,
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{kind} {index} of \"{function}\" has {expected} nonzeros, got {got}")]
    DimensionMismatch {
        function: String,
        kind: &'static str,
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("{kind} index {index} out of range for \"{function}\" ({len} available)")]
    IndexOutOfRange {
        function: String,
        kind: &'static str,
        index: usize,
        len: usize,
    },

    #[error("unknown ad_mode \"{0}\", expected \"forward\", \"reverse\" or \"automatic\"")]
    UnknownAdMode(String),

    #[error("unknown option \"{0}\"")]
    UnknownOption(String),

    #[error("option \"{key}\" expects a {expected} value")]
    OptionType { key: String, expected: &'static str },

    #[error("input {index}, nonzero {nz} is not a distinct symbolic variable")]
    InvalidInput { index: usize, nz: usize },

    #[error("invalid sparsity pattern: {0}")]
    InvalidSparsity(String),

    #[error("no derivative rule for {0}")]
    MissingDerivative(OpCode),

    #[error("\"{function}\" does not support {what}")]
    Unsupported {
        function: String,
        what: &'static str,
    },

    #[error("numerical irregularity in \"{function}\": {report}")]
    Irregular { function: String, report: EvalReport },

    #[error("external function \"{function}\" failed: {message}")]
    External { function: String, message: String },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Where a non-finite value showed up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Output { index: usize, nz: usize },
    FwdSens { dir: usize, index: usize, nz: usize },
    AdjSens { dir: usize, index: usize, nz: usize },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Output { index, nz } => write!(f, "output {index}[{nz}]"),
            Location::FwdSens { dir, index, nz } => {
                write!(f, "forward sensitivity {dir} of output {index}[{nz}]")
            }
            Location::AdjSens { dir, index, nz } => {
                write!(f, "adjoint sensitivity {dir} of input {index}[{nz}]")
            }
        }
    }
}

/// Outcome of a numeric evaluation: the list of NaN/Inf entries produced.
///
/// An empty report means the evaluation was regular. Whether an irregular
/// report is fatal is decided by the `regularity_check` option.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvalReport {
    pub non_finite: Vec<Location>,
}

impl EvalReport {
    pub fn is_regular(&self) -> bool {
        self.non_finite.is_empty()
    }

    pub(crate) fn scan(&mut self, values: &[f64], mut loc: impl FnMut(usize) -> Location) {
        for (k, v) in values.iter().enumerate() {
            if !v.is_finite() {
                self.non_finite.push(loc(k));
            }
        }
    }
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.non_finite.is_empty() {
            return write!(f, "regular");
        }
        write!(f, "{} non-finite value(s)", self.non_finite.len())?;
        for (i, loc) in self.non_finite.iter().take(4).enumerate() {
            let sep = if i == 0 { ": " } else { ", " };
            write!(f, "{sep}{loc}")?;
        }
        if self.non_finite.len() > 4 {
            write!(f, ", ...")?;
        }
        Ok(())
    }
}
