use super::{RegressionError, check_dim, degrees_of_freedom, residual_variance};
use crate::linalg::LinearSolver;
use crate::matrix::DesignMatrix;
use crate::stats::{unnorm_autocovariance, unnorm_covariance};
use ndarray::{Array1, ArrayView1, ArrayView2};
use ndarray_linalg::Inverse;

/// Ordinary least squares with a single coefficient vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearRegression {
    beta: Array1<f64>,
    include_bias: bool,
}

impl LinearRegression {
    /// Builds a model from known coefficients, or solves them from `(xtx, xty)`.
    ///
    /// A supplied `beta` wins. Without one, both statistics are required and the
    /// solver must accept aggregated statistics.
    pub fn new(
        beta: Option<Array1<f64>>,
        xtx: Option<ArrayView2<f64>>,
        xty: Option<ArrayView1<f64>>,
        solver: &dyn LinearSolver,
        include_bias: bool,
    ) -> Result<Self, RegressionError> {
        let beta = match (beta, xtx, xty) {
            (Some(beta), _, _) => beta,
            (None, Some(xtx), Some(xty)) => {
                if !solver.supports_statistics() {
                    return Err(RegressionError::UnsupportedSolver {
                        solver: solver.name(),
                        context: "in constructor",
                    });
                }
                solver.solve(xtx, xty)?
            }
            (None, _, _) => return Err(RegressionError::MissingStatistics),
        };
        Ok(Self { beta, include_bias })
    }

    pub fn from_coefficients(beta: Array1<f64>, include_bias: bool) -> Self {
        Self { beta, include_bias }
    }

    pub fn from_statistics(
        xtx: ArrayView2<f64>,
        xty: ArrayView1<f64>,
        solver: &dyn LinearSolver,
        include_bias: bool,
    ) -> Result<Self, RegressionError> {
        Self::new(None, Some(xtx), Some(xty), solver, include_bias)
    }

    /// Fits from row-level data. QR factors the design directly; every other strategy
    /// goes through the sufficient statistics.
    pub fn fit(
        x: &DesignMatrix,
        y: ArrayView1<f64>,
        solver: &dyn LinearSolver,
        include_bias: bool,
    ) -> Result<Self, RegressionError> {
        check_dim("response length", x.nrows(), y.len())?;
        let beta = if solver.supports_statistics() {
            solver.solve(unnorm_autocovariance(x).view(), unnorm_covariance(x, y).view())?
        } else {
            solver.solve_least_squares(x, y)?
        };
        log::debug!(
            "Fit linear regression with {} coefficients on {} rows using {}",
            beta.len(),
            x.nrows(),
            solver.name()
        );
        Ok(Self { beta, include_bias })
    }

    pub fn coef(&self) -> &Array1<f64> {
        &self.beta
    }

    pub fn include_bias(&self) -> bool {
        self.include_bias
    }

    /// `nobs − p`, minus one more when an intercept outside `beta` is modeled.
    pub fn dof(&self, nobs: usize) -> i64 {
        degrees_of_freedom(nobs, self.beta.len() + usize::from(self.include_bias))
    }

    pub fn predict(&self, x: &DesignMatrix) -> Result<Array1<f64>, RegressionError> {
        check_dim("design columns", self.beta.len(), x.ncols())?;
        Ok(x.matrix_vector_multiply(self.beta.view()))
    }

    pub fn residual(&self, x: &DesignMatrix, y: ArrayView1<f64>) -> Result<Array1<f64>, RegressionError> {
        check_dim("response length", x.nrows(), y.len())?;
        Ok(&y - &self.predict(x)?)
    }

    pub fn sse(&self, x: &DesignMatrix, y: ArrayView1<f64>) -> Result<f64, RegressionError> {
        let residual = self.residual(x, y)?;
        Ok(residual.dot(&residual))
    }

    /// Classical OLS t-statistics: `β / sqrt(diag(XtX⁻¹) · sse / dof)`.
    pub fn t_stats(
        &self,
        sse: f64,
        xtx: ArrayView2<f64>,
        dof: i64,
    ) -> Result<Array1<f64>, RegressionError> {
        check_dim("XtX dimension", self.beta.len(), xtx.nrows())?;
        let sigma_squared = residual_variance(sse, dof)?;
        let xtx_inv = xtx.inv()?;
        let std = xtx_inv.diag().mapv(|v| (v * sigma_squared).sqrt());
        Ok(&self.beta / &std)
    }
}
