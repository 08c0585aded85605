use super::{RegressionError, check_dim, degrees_of_freedom, residual_variance};
use crate::linalg::LinearSolver;
use crate::matrix::DesignMatrix;
use crate::stats::{unnorm_autocovariance, unnorm_covariance};
use ndarray::{Array1, ArrayView1, ArrayView2, s};
use ndarray_linalg::Inverse;

/// Several independent linear models solved as one block-diagonal system.
///
/// The flat coefficient vector holds `nmodels` contiguous segments of `coef_dim`
/// coefficients. The design stacks every model's rows and places its columns in its
/// own diagonal block, so one global solve yields every model.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedLinearRegression {
    beta: Array1<f64>,
    nmodels: usize,
}

impl BlockedLinearRegression {
    pub fn new(
        beta: Option<Array1<f64>>,
        xtx: Option<ArrayView2<f64>>,
        xty: Option<ArrayView1<f64>>,
        nmodels: usize,
        solver: &dyn LinearSolver,
    ) -> Result<Self, RegressionError> {
        let beta = match (beta, xtx, xty) {
            (Some(beta), _, _) => {
                check_divisible("beta", beta.len(), nmodels)?;
                beta
            }
            (None, Some(xtx), Some(xty)) => {
                if !solver.supports_statistics() {
                    return Err(RegressionError::UnsupportedSolver {
                        solver: solver.name(),
                        context: "in constructor",
                    });
                }
                check_divisible("XtX", xtx.nrows(), nmodels)?;
                solver.solve(xtx, xty)?
            }
            (None, _, _) => return Err(RegressionError::MissingStatistics),
        };
        Ok(Self { beta, nmodels })
    }

    pub fn from_coefficients(beta: Array1<f64>, nmodels: usize) -> Result<Self, RegressionError> {
        check_divisible("beta", beta.len(), nmodels)?;
        Ok(Self { beta, nmodels })
    }

    /// Fits every block with one solve of the stacked normal equations.
    ///
    /// QR is refused here: factoring the full stacked design would densify the
    /// block-diagonal matrix.
    pub fn fit(
        x: &DesignMatrix,
        y: ArrayView1<f64>,
        nmodels: usize,
        solver: &dyn LinearSolver,
    ) -> Result<Self, RegressionError> {
        if !solver.supports_statistics() {
            return Err(RegressionError::UnsupportedSolver {
                solver: solver.name(),
                context: "for blocked regression",
            });
        }
        check_dim("response length", x.nrows(), y.len())?;
        check_divisible("design width", x.ncols(), nmodels)?;

        let beta = solver.solve(unnorm_autocovariance(x).view(), unnorm_covariance(x, y).view())?;
        log::debug!(
            "Fit {} blocked models of width {} on {} stacked rows",
            nmodels,
            beta.len() / nmodels,
            x.nrows()
        );
        Ok(Self { beta, nmodels })
    }

    pub fn nmodels(&self) -> usize {
        self.nmodels
    }

    pub fn coef(&self) -> &Array1<f64> {
        &self.beta
    }

    /// Number of coefficients per block.
    pub fn coef_dim(&self) -> usize {
        self.beta.len() / self.nmodels
    }

    /// Coefficients of block `index`, or `None` past the last block.
    pub fn block_coef(&self, index: usize) -> Option<ArrayView1<'_, f64>> {
        if index >= self.nmodels {
            return None;
        }
        let width = self.coef_dim();
        Some(self.beta.slice(s![index * width..(index + 1) * width]))
    }

    /// Per-block degrees of freedom, `nobs[k] − coef_dim`.
    pub fn dof(&self, nobss: &[usize]) -> Array1<i64> {
        let k = self.coef_dim();
        nobss.iter().map(|&n| degrees_of_freedom(n, k)).collect()
    }

    pub fn predict(&self, x: &DesignMatrix) -> Result<Array1<f64>, RegressionError> {
        check_dim("design columns", self.beta.len(), x.ncols())?;
        Ok(x.matrix_vector_multiply(self.beta.view()))
    }

    pub fn residual(&self, x: &DesignMatrix, y: ArrayView1<f64>) -> Result<Array1<f64>, RegressionError> {
        check_dim("response length", x.nrows(), y.len())?;
        Ok(&y - &self.predict(x)?)
    }

    /// Sum of squared residuals of each block.
    ///
    /// Block `k` owns rows `[Σ_{i<k} nobss[i], Σ_{i≤k} nobss[i])` of the stacked response.
    pub fn sse(
        &self,
        x: &DesignMatrix,
        y: ArrayView1<f64>,
        nobss: &[usize],
    ) -> Result<Array1<f64>, RegressionError> {
        check_dim("per-block sample counts", self.nmodels, nobss.len())?;
        let residual = self.residual(x, y)?;
        let total: usize = nobss.iter().sum();
        if total != residual.len() {
            return Err(RegressionError::BlockSampleCounts {
                total,
                found: residual.len(),
            });
        }

        let mut start = 0;
        let mut sse = Array1::<f64>::zeros(nobss.len());
        for (block, &count) in nobss.iter().enumerate() {
            let segment = residual.slice(s![start..start + count]);
            sse[block] = segment.dot(&segment);
            start += count;
        }
        Ok(sse)
    }

    /// t-statistics of every coefficient, each scaled by its own block's residual variance.
    pub fn t_stats(
        &self,
        sse: ArrayView1<f64>,
        xtx: ArrayView2<f64>,
        dof: ArrayView1<i64>,
    ) -> Result<Array1<f64>, RegressionError> {
        check_dim("sse blocks", self.nmodels, sse.len())?;
        check_dim("dof blocks", self.nmodels, dof.len())?;
        check_dim("XtX dimension", self.beta.len(), xtx.nrows())?;

        let width = self.coef_dim();
        let xtx_inv = xtx.inv()?;
        let mut t = Array1::<f64>::zeros(self.beta.len());
        for block in 0..self.nmodels {
            let sigma_squared = residual_variance(sse[block], dof[block])?;
            for j in block * width..(block + 1) * width {
                t[j] = self.beta[j] / (xtx_inv[(j, j)] * sigma_squared).sqrt();
            }
        }
        Ok(t)
    }
}

fn check_divisible(what: &'static str, dimension: usize, nmodels: usize) -> Result<(), RegressionError> {
    if nmodels == 0 || dimension % nmodels != 0 {
        return Err(RegressionError::IndivisibleBlocks {
            what,
            dimension,
            nmodels,
        });
    }
    Ok(())
}
