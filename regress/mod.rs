// regress/mod.rs

//! # Regression Model Family
//!
//! Four model shapes built on the same solver strategies:
//!
//! - [`LinearRegression`]: one coefficient vector, solved from `(XtX, Xty)` or from rows.
//! - [`BatchedLinearRegression`]: one independent coefficient vector per unit (variant),
//!   fit from a `batch × samples × features` stack.
//! - [`BlockedLinearRegression`]: one flat coefficient vector split into `nmodels`
//!   equal segments, fit from a block-diagonal design in a single solve.
//! - [`LogisticRegression`] and [`BatchedLogisticRegression`]: binary response, one Newton
//!   step per `fit` call.
//!
//! Every model owns its coefficients exclusively; fitting replaces them and nothing else.

pub mod batched;
pub mod blocked;
pub mod linear;
pub mod logistic;

pub use batched::BatchedLinearRegression;
pub use blocked::BlockedLinearRegression;
pub use linear::LinearRegression;
pub use logistic::{BatchedLogisticRegression, LogisticRegression};

use crate::accel::AccelerationError;
use crate::linalg::SolverError;
use ndarray_linalg::error::LinalgError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegressionError {
    #[error("Must provide XtX and Xty, since beta is not provided.")]
    MissingStatistics,

    #[error("The {solver} solver is not supported {context}.")]
    UnsupportedSolver {
        solver: &'static str,
        context: &'static str,
    },

    #[error("Dimension of {what} ({dimension}) is not divisible by number of models ({nmodels}).")]
    IndivisibleBlocks {
        what: &'static str,
        dimension: usize,
        nmodels: usize,
    },

    #[error("Dimension mismatch for {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Per-block sample counts sum to {total}, but the residual has {found} rows.")]
    BlockSampleCounts { total: usize, found: usize },

    #[error("Degrees of freedom must be positive to compute t-statistics, found {0}.")]
    NonPositiveDof(i64),

    #[error("Linear system solve failed: {0}")]
    Solver(#[from] SolverError),

    #[error("Inverting XtX for standard errors failed: {0}")]
    Inversion(#[from] LinalgError),

    #[error("Acceleration failed: {0}")]
    Acceleration(#[from] AccelerationError),
}

pub(crate) fn check_dim(
    context: &'static str,
    expected: usize,
    found: usize,
) -> Result<(), RegressionError> {
    if expected == found {
        Ok(())
    } else {
        Err(RegressionError::DimensionMismatch {
            context,
            expected,
            found,
        })
    }
}

/// Degrees of freedom as a signed count, so an over-parameterized fit is visible as such.
pub(crate) fn degrees_of_freedom(nobs: usize, parameters: usize) -> i64 {
    nobs as i64 - parameters as i64
}

pub(crate) fn residual_variance(sse: f64, dof: i64) -> Result<f64, RegressionError> {
    if dof <= 0 {
        return Err(RegressionError::NonPositiveDof(dof));
    }
    Ok(sse / dof as f64)
}
