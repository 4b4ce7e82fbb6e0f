//! Function options and their string-keyed setter.
//!
//! [`FunctionOptions`] is a plain struct; [`FunctionOptions::set`] accepts
//! the recognized keys by name for callers that configure from text.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Sweep direction used for sparsity detection and Jacobian assembly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum AdMode {
    /// Forward sweeps only, when the function can do them.
    Forward,
    /// Adjoint sweeps only, when the function can do them.
    Reverse,
    /// Pick whichever needs fewer sweeps.
    #[default]
    Automatic,
}

impl FromStr for AdMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward" => Ok(AdMode::Forward),
            "reverse" | "adjoint" => Ok(AdMode::Reverse),
            "automatic" => Ok(AdMode::Automatic),
            other => Err(Error::UnknownAdMode(other.to_string())),
        }
    }
}

impl fmt::Display for AdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdMode::Forward => write!(f, "forward"),
            AdMode::Reverse => write!(f, "reverse"),
            AdMode::Automatic => write!(f, "automatic"),
        }
    }
}

/// Order in which the graph sorter emits operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum TopologicalSorting {
    /// Each operation as late as possible, close to its consumers.
    #[default]
    DepthFirst,
    /// Level by level: every operation right after the deepest of its
    /// operands' levels, so one level can be evaluated independently.
    BreadthFirst,
}

impl FromStr for TopologicalSorting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "depth-first" => Ok(TopologicalSorting::DepthFirst),
            "breadth-first" => Ok(TopologicalSorting::BreadthFirst),
            _ => Err(Error::OptionType {
                key: "topological_sorting".to_string(),
                expected: "\"depth-first\" or \"breadth-first\"",
            }),
        }
    }
}

impl fmt::Display for TopologicalSorting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologicalSorting::DepthFirst => write!(f, "depth-first"),
            TopologicalSorting::BreadthFirst => write!(f, "breadth-first"),
        }
    }
}

/// Options of a [`Function`](crate::Function).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FunctionOptions {
    pub name: String,
    /// Forces or auto-selects the sweep direction.
    pub ad_mode: AdMode,
    /// Build Jacobians by brute-force numeric directional derivatives, one
    /// per input nonzero, instead of symbolically with coloring.
    pub numeric_jacobian: bool,
    /// `numeric_jacobian` for the gradient Function a Hessian is built from.
    pub numeric_hessian: bool,
    /// Forward directions allocated up front.
    pub number_of_fwd_dir: usize,
    /// Adjoint directions allocated up front.
    pub number_of_adj_dir: usize,
    pub max_number_of_fwd_dir: usize,
    pub max_number_of_adj_dir: usize,
    /// Reuse work-array slots once a value is dead.
    pub live_variables: bool,
    pub topological_sorting: TopologicalSorting,
    /// Treat NaN/Inf results as an error rather than a warning.
    pub regularity_check: bool,
    /// Skip all-zero seed directions.
    pub compress_directions: bool,
    /// Use block refinement for sparsity detection of non-trivial blocks.
    pub hierarchical_sparsity: bool,
    /// Accept symbols that are not inputs.
    pub allow_free: bool,
    /// Weight of an adjoint sweep relative to a forward sweep.
    pub adjoint_penalty: usize,
    /// Relative finite-difference step for external callables.
    pub fd_step: f64,
}

impl Default for FunctionOptions {
    fn default() -> Self {
        FunctionOptions {
            name: "unnamed_function".to_string(),
            ad_mode: AdMode::Automatic,
            numeric_jacobian: false,
            numeric_hessian: false,
            number_of_fwd_dir: 1,
            number_of_adj_dir: 1,
            max_number_of_fwd_dir: 64,
            max_number_of_adj_dir: 64,
            live_variables: true,
            topological_sorting: TopologicalSorting::DepthFirst,
            regularity_check: true,
            compress_directions: true,
            hierarchical_sparsity: true,
            allow_free: false,
            adjoint_penalty: 2,
            fd_step: 1e-6,
        }
    }
}

/// Value for [`FunctionOptions::set`].
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(usize),
    Float(f64),
    Str(String),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<usize> for OptionValue {
    fn from(v: usize) -> Self {
        OptionValue::Int(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Str(v)
    }
}

fn expect_bool(key: &str, value: OptionValue) -> Result<bool> {
    match value {
        OptionValue::Bool(b) => Ok(b),
        _ => Err(Error::OptionType {
            key: key.to_string(),
            expected: "boolean",
        }),
    }
}

fn expect_int(key: &str, value: OptionValue) -> Result<usize> {
    match value {
        OptionValue::Int(n) => Ok(n),
        _ => Err(Error::OptionType {
            key: key.to_string(),
            expected: "integer",
        }),
    }
}

impl FunctionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        FunctionOptions {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set an option by its string key.
    ///
    /// ```
    /// use symad::{AdMode, FunctionOptions};
    ///
    /// let mut opts = FunctionOptions::default();
    /// opts.set("ad_mode", "reverse").unwrap();
    /// opts.set("number_of_fwd_dir", 8usize).unwrap();
    /// assert_eq!(opts.ad_mode, AdMode::Reverse);
    /// assert!(opts.set("ad_mode", "sideways").is_err());
    /// ```
    pub fn set(&mut self, key: &str, value: impl Into<OptionValue>) -> Result<()> {
        let value = value.into();
        match key {
            "name" => match value {
                OptionValue::Str(s) => self.name = s,
                _ => {
                    return Err(Error::OptionType {
                        key: key.to_string(),
                        expected: "string",
                    })
                }
            },
            "ad_mode" => match value {
                OptionValue::Str(s) => self.ad_mode = s.parse()?,
                _ => {
                    return Err(Error::OptionType {
                        key: key.to_string(),
                        expected: "string",
                    })
                }
            },
            "numeric_jacobian" => self.numeric_jacobian = expect_bool(key, value)?,
            "numeric_hessian" => self.numeric_hessian = expect_bool(key, value)?,
            "number_of_fwd_dir" => self.number_of_fwd_dir = expect_int(key, value)?,
            "number_of_adj_dir" => self.number_of_adj_dir = expect_int(key, value)?,
            "max_number_of_fwd_dir" => self.max_number_of_fwd_dir = expect_int(key, value)?,
            "max_number_of_adj_dir" => self.max_number_of_adj_dir = expect_int(key, value)?,
            "live_variables" => self.live_variables = expect_bool(key, value)?,
            "topological_sorting" => match value {
                OptionValue::Str(s) => self.topological_sorting = s.parse()?,
                _ => {
                    return Err(Error::OptionType {
                        key: key.to_string(),
                        expected: "string",
                    })
                }
            },
            "regularity_check" => self.regularity_check = expect_bool(key, value)?,
            "compress_directions" => self.compress_directions = expect_bool(key, value)?,
            "hierarchical_sparsity" => self.hierarchical_sparsity = expect_bool(key, value)?,
            "allow_free" => self.allow_free = expect_bool(key, value)?,
            "adjoint_penalty" => self.adjoint_penalty = expect_int(key, value)?,
            "fd_step" => match value {
                OptionValue::Float(h) => self.fd_step = h,
                _ => {
                    return Err(Error::OptionType {
                        key: key.to_string(),
                        expected: "float",
                    })
                }
            },
            _ => return Err(Error::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    /// Number of forward directions allocated at construction, capped.
    pub(crate) fn initial_fwd(&self) -> usize {
        self.number_of_fwd_dir.min(self.max_number_of_fwd_dir)
    }

    pub(crate) fn initial_adj(&self) -> usize {
        self.number_of_adj_dir.min(self.max_number_of_adj_dir)
    }
}
