use super::{RegressionError, check_dim, degrees_of_freedom};
use crate::accel::Accelerator;
use crate::linalg::{BatchedSolver, batched_diagonal, batched_inv, batched_mvmul, batched_vdot};
use crate::stats::{batched_unnorm_autocovariance, batched_unnorm_covariance};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis, s};

/// Independent linear regressions, one coefficient vector per unit.
///
/// Coefficients are stored `batch × features`; designs are `batch × samples × features`
/// and responses `batch × samples`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedLinearRegression {
    beta: Array2<f64>,
    include_bias: bool,
}

impl BatchedLinearRegression {
    pub fn new(
        beta: Option<Array2<f64>>,
        xtx: Option<ArrayView3<f64>>,
        xty: Option<ArrayView2<f64>>,
        solver: &dyn BatchedSolver,
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
                solver.solve_batch(xtx, xty)?
            }
            (None, _, _) => return Err(RegressionError::MissingStatistics),
        };
        Ok(Self { beta, include_bias })
    }

    pub fn from_coefficients(beta: Array2<f64>, include_bias: bool) -> Self {
        Self { beta, include_bias }
    }

    pub fn from_statistics(
        xtx: ArrayView3<f64>,
        xty: ArrayView2<f64>,
        solver: &dyn BatchedSolver,
        include_bias: bool,
    ) -> Result<Self, RegressionError> {
        Self::new(None, Some(xtx), Some(xty), solver, include_bias)
    }

    pub fn fit(
        x: ArrayView3<f64>,
        y: ArrayView2<f64>,
        solver: &dyn BatchedSolver,
        include_bias: bool,
    ) -> Result<Self, RegressionError> {
        check_dim("batched response units", x.len_of(Axis(0)), y.nrows())?;
        check_dim("batched response samples", x.len_of(Axis(1)), y.ncols())?;
        let beta = if solver.supports_statistics() {
            solver.solve_batch(
                batched_unnorm_autocovariance(x).view(),
                batched_unnorm_covariance(x, y).view(),
            )?
        } else {
            solver.solve_least_squares_batch(x, y)?
        };
        log::debug!(
            "Fit {} batched regressions of width {} using {}",
            beta.nrows(),
            beta.ncols(),
            solver.name()
        );
        Ok(Self { beta, include_bias })
    }

    pub fn coef(&self) -> &Array2<f64> {
        &self.beta
    }

    pub fn include_bias(&self) -> bool {
        self.include_bias
    }

    pub fn batch_size(&self) -> usize {
        self.beta.nrows()
    }

    /// Per-unit degrees of freedom from per-unit observation counts.
    pub fn dof(&self, nobs: ArrayView1<usize>) -> Array1<i64> {
        let k = self.beta.ncols() + usize::from(self.include_bias);
        nobs.mapv(|n| degrees_of_freedom(n, k))
    }

    /// Predicted responses, `batch × samples`, identical under either acceleration mode.
    pub fn predict(
        &self,
        x: ArrayView3<f64>,
        acceleration: &Accelerator,
    ) -> Result<Array2<f64>, RegressionError> {
        let (batch, _, ndims) = x.dim();
        check_dim("design units", self.beta.nrows(), batch)?;
        check_dim("design columns", self.beta.ncols(), ndims)?;

        let beta = self.beta.view();
        let predicted = acceleration.map_batch(batch, |units| {
            batched_mvmul(
                x.slice(s![units.clone(), .., ..]),
                beta.slice(s![units, ..]),
            )
        })?;
        Ok(predicted)
    }

    pub fn residual(
        &self,
        x: ArrayView3<f64>,
        y: ArrayView2<f64>,
        acceleration: &Accelerator,
    ) -> Result<Array2<f64>, RegressionError> {
        check_dim("batched response units", x.len_of(Axis(0)), y.nrows())?;
        check_dim("batched response samples", x.len_of(Axis(1)), y.ncols())?;
        Ok(&y - &self.predict(x, acceleration)?)
    }

    /// Sum of squared residuals for every unit.
    pub fn sse(
        &self,
        x: ArrayView3<f64>,
        y: ArrayView2<f64>,
        acceleration: &Accelerator,
    ) -> Result<Array1<f64>, RegressionError> {
        let residual = self.residual(x, y, acceleration)?;
        Ok(batched_vdot(residual.view(), residual.view()))
    }

    /// Per-unit OLS t-statistics, `batch × features`.
    pub fn t_stats(
        &self,
        sse: ArrayView1<f64>,
        xtx: ArrayView3<f64>,
        dof: ArrayView1<i64>,
    ) -> Result<Array2<f64>, RegressionError> {
        let std = self.standard_errors(sse, xtx, dof)?;
        Ok(&self.beta / &std)
    }

    /// Per-unit coefficient standard errors, `sqrt(diag(XtX⁻¹) · sse / dof)`.
    pub fn standard_errors(
        &self,
        sse: ArrayView1<f64>,
        xtx: ArrayView3<f64>,
        dof: ArrayView1<i64>,
    ) -> Result<Array2<f64>, RegressionError> {
        let batch = self.beta.nrows();
        check_dim("sse units", batch, sse.len())?;
        check_dim("dof units", batch, dof.len())?;
        check_dim("XtX units", batch, xtx.len_of(Axis(0)))?;
        check_dim("XtX dimension", self.beta.ncols(), xtx.len_of(Axis(1)))?;

        let mut sigma_squared = Array1::<f64>::zeros(batch);
        for (unit, (&unit_sse, &unit_dof)) in sse.iter().zip(dof.iter()).enumerate() {
            sigma_squared[unit] = super::residual_variance(unit_sse, unit_dof)?;
        }

        let variances = batched_diagonal(batched_inv(xtx)?.view());
        Ok((&variances * &sigma_squared.insert_axis(Axis(1))).mapv(f64::sqrt))
    }
}
