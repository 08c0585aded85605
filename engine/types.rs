// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// Only configuration values read by more than one subsystem belong here. Types used by a
// single module live next to their owner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Names a linear-system strategy. Solver instances are built from this value per call,
/// so no solver object is ever shared as a mutable default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    Inverse,
    #[default]
    Cholesky,
    Qr,
}

/// Names an execution mode for batched prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccelerationKind {
    #[default]
    Single,
    #[serde(alias = "pmap")]
    Parallel,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigNameError {
    #[error("Unknown solver strategy '{0}'. Expected one of: inverse, cholesky, qr.")]
    UnknownSolver(String),
    #[error("{0} acceleration is not supported. Expected 'single' or 'parallel'.")]
    UnknownAcceleration(String),
}

impl FromStr for SolverKind {
    type Err = ConfigNameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "inverse" | "inv" => Ok(Self::Inverse),
            "cholesky" | "chol" => Ok(Self::Cholesky),
            "qr" => Ok(Self::Qr),
            other => Err(ConfigNameError::UnknownSolver(other.to_string())),
        }
    }
}

impl FromStr for AccelerationKind {
    type Err = ConfigNameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "parallel" | "pmap" => Ok(Self::Parallel),
            other => Err(ConfigNameError::UnknownAcceleration(other.to_string())),
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Inverse => "inverse",
            Self::Cholesky => "cholesky",
            Self::Qr => "qr",
        };
        f.write_str(label)
    }
}

impl fmt::Display for AccelerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => f.write_str("single"),
            Self::Parallel => f.write_str("parallel"),
        }
    }
}

/// Fit-time configuration shared by the CLI and library callers.
///
/// Persisted as TOML; every field has a default so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FitConfig {
    pub solver: SolverKind,
    /// Execution mode for site-side batched prediction (`SiteResiduals::compute`). The
    /// `fedgwas` binary only combines and solves, so library callers resolve this with
    /// `Accelerator::from_kind`.
    pub acceleration: AccelerationKind,
    /// Counts an intercept that is not part of the coefficient vector when computing
    /// degrees of freedom.
    pub include_bias: bool,
    /// Worker count for parallel acceleration. `None` sizes the pool to the available cores.
    /// Read by library callers together with `acceleration`.
    pub workers: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl FitConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = toml::from_str(&text)?;
        Ok(config)
    }
}
