//! # Linear-System Solver Strategies
//!
//! Every regression in this crate reduces to the normal equations `XᵗX β = Xᵗy`. The
//! strategies here solve that system from pre-aggregated statistics (inverse, Cholesky)
//! or, for QR, from the row-level design itself. All strategies share the
//! [`LinearSolver`] interface; whether a strategy can work from statistics alone is a
//! capability reported at call time by [`LinearSolver::supports_statistics`], because the
//! federated code path only ever holds `(XtX, Xty)`.
//!
//! [`Batched`] lifts any single-system strategy to a stack of independent systems, one
//! per leading-axis slice.

use crate::matrix::DesignMatrix;
use crate::types::SolverKind;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Diag, Inverse, QR, SolveC, SolveTriangular, UPLO};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "The {solver} strategy needs row-level data (X, y); it cannot solve from aggregated XtX/Xty."
    )]
    RequiresRowData { solver: &'static str },

    #[error("The {solver} factorization failed: {source}")]
    Factorization {
        solver: &'static str,
        #[source]
        source: LinalgError,
    },

    #[error("The {solver} strategy produced non-finite coefficients.")]
    NonFinite { solver: &'static str },

    #[error("Unit {unit} of the batch could not be solved: {source}")]
    Batch {
        unit: usize,
        #[source]
        source: Box<SolverError>,
    },
}

impl SolverError {
    /// True for failures of the numerical method itself (singular or indefinite systems,
    /// overflow). Contract violations such as shape mismatches are never numeric.
    pub fn is_numeric_failure(&self) -> bool {
        match self {
            Self::Factorization { .. } | Self::NonFinite { .. } => true,
            Self::Batch { source, .. } => source.is_numeric_failure(),
            Self::DimensionMismatch { .. } | Self::RequiresRowData { .. } => false,
        }
    }
}

/// A strategy for solving `A x = b` in the least-squares sense.
pub trait LinearSolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether [`LinearSolver::solve`] accepts pre-aggregated statistics.
    fn supports_statistics(&self) -> bool {
        true
    }

    /// Solves `xtx · β = xty`.
    fn solve(&self, xtx: ArrayView2<f64>, xty: ArrayView1<f64>) -> Result<Array1<f64>, SolverError>;

    /// Solves `min ‖y − Xβ‖²` from row-level data. Statistics-based strategies form the
    /// normal equations first.
    fn solve_least_squares(
        &self,
        x: &DesignMatrix,
        y: ArrayView1<f64>,
    ) -> Result<Array1<f64>, SolverError> {
        check_len("least-squares response", x.nrows(), y.len())?;
        self.solve(x.gram().view(), x.transpose_vector_multiply(y).view())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InverseSolver;

#[derive(Debug, Clone, Copy, Default)]
pub struct CholeskySolver;

#[derive(Debug, Clone, Copy, Default)]
pub struct QrSolver;

impl LinearSolver for InverseSolver {
    fn name(&self) -> &'static str {
        "inverse"
    }

    fn solve(&self, xtx: ArrayView2<f64>, xty: ArrayView1<f64>) -> Result<Array1<f64>, SolverError> {
        check_system(xtx, xty)?;
        let inverse = xtx.inv().map_err(|source| SolverError::Factorization {
            solver: self.name(),
            source,
        })?;
        finite_or_err(inverse.dot(&xty), self.name())
    }
}

impl LinearSolver for CholeskySolver {
    fn name(&self) -> &'static str {
        "cholesky"
    }

    fn solve(&self, xtx: ArrayView2<f64>, xty: ArrayView1<f64>) -> Result<Array1<f64>, SolverError> {
        check_system(xtx, xty)?;
        let beta = xtx.solvec(&xty).map_err(|source| SolverError::Factorization {
            solver: self.name(),
            source,
        })?;
        finite_or_err(beta, self.name())
    }
}

impl LinearSolver for QrSolver {
    fn name(&self) -> &'static str {
        "qr"
    }

    fn supports_statistics(&self) -> bool {
        false
    }

    fn solve(&self, _: ArrayView2<f64>, _: ArrayView1<f64>) -> Result<Array1<f64>, SolverError> {
        Err(SolverError::RequiresRowData {
            solver: self.name(),
        })
    }

    fn solve_least_squares(
        &self,
        x: &DesignMatrix,
        y: ArrayView1<f64>,
    ) -> Result<Array1<f64>, SolverError> {
        check_len("least-squares response", x.nrows(), y.len())?;
        if x.nrows() < x.ncols() {
            return Err(SolverError::DimensionMismatch {
                context: "QR design rows (must be at least the column count)",
                expected: x.ncols(),
                found: x.nrows(),
            });
        }

        // Reduced factorization X = QR with R square upper-triangular, then R β = Qᵗy.
        let dense = x.to_dense();
        let (q, r) = dense.qr().map_err(|source| SolverError::Factorization {
            solver: self.name(),
            source,
        })?;
        let qty = q.t().dot(&y);
        let beta = r
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &qty)
            .map_err(|source| SolverError::Factorization {
                solver: self.name(),
                source,
            })?;
        finite_or_err(beta, self.name())
    }
}

impl SolverKind {
    /// Builds a fresh solver instance for one call site.
    pub fn solver(self) -> Box<dyn LinearSolver> {
        match self {
            SolverKind::Inverse => Box::new(InverseSolver),
            SolverKind::Cholesky => Box::new(CholeskySolver),
            SolverKind::Qr => Box::new(QrSolver),
        }
    }

    /// Builds the batched counterpart of [`SolverKind::solver`].
    pub fn batched(self) -> Box<dyn BatchedSolver> {
        match self {
            SolverKind::Inverse => Box::new(BatchedInverseSolver::default()),
            SolverKind::Cholesky => Box::new(BatchedCholeskySolver::default()),
            SolverKind::Qr => Box::new(BatchedQrSolver::default()),
        }
    }
}

// ========================================================================================
//                                  Batched strategies
// ========================================================================================

/// Solves a stack of independent systems, one per leading-axis slice.
pub trait BatchedSolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_statistics(&self) -> bool {
        true
    }

    /// Solves `xtx[k] · β[k] = xty[k]` for every unit `k`.
    fn solve_batch(
        &self,
        xtx: ArrayView3<f64>,
        xty: ArrayView2<f64>,
    ) -> Result<Array2<f64>, SolverError>;

    /// Solves the least-squares problem of every `(x[k], y[k])` pair.
    fn solve_least_squares_batch(
        &self,
        x: ArrayView3<f64>,
        y: ArrayView2<f64>,
    ) -> Result<Array2<f64>, SolverError>;
}

/// Lifts a single-system strategy to a stack of systems.
#[derive(Debug, Clone, Copy, Default)]
pub struct Batched<S>(pub S);

pub type BatchedInverseSolver = Batched<InverseSolver>;
pub type BatchedCholeskySolver = Batched<CholeskySolver>;
pub type BatchedQrSolver = Batched<QrSolver>;

impl<S: LinearSolver> BatchedSolver for Batched<S> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn supports_statistics(&self) -> bool {
        self.0.supports_statistics()
    }

    fn solve_batch(
        &self,
        xtx: ArrayView3<f64>,
        xty: ArrayView2<f64>,
    ) -> Result<Array2<f64>, SolverError> {
        check_len("batched XtX/Xty units", xtx.len_of(Axis(0)), xty.nrows())?;
        check_len("batched XtX/Xty width", xtx.len_of(Axis(2)), xty.ncols())?;

        let mut beta = Array2::<f64>::zeros(xty.dim());
        for (unit, ((a, b), mut out)) in xtx
            .outer_iter()
            .zip(xty.outer_iter())
            .zip(beta.outer_iter_mut())
            .enumerate()
        {
            let solved = self.0.solve(a, b).map_err(|source| batch_error(unit, source))?;
            out.assign(&solved);
        }
        Ok(beta)
    }

    fn solve_least_squares_batch(
        &self,
        x: ArrayView3<f64>,
        y: ArrayView2<f64>,
    ) -> Result<Array2<f64>, SolverError> {
        let (batch, nsample, ndims) = x.dim();
        check_len("batched response units", batch, y.nrows())?;
        check_len("batched response samples", nsample, y.ncols())?;

        let mut beta = Array2::<f64>::zeros((batch, ndims));
        for (unit, ((xs, ys), mut out)) in x
            .outer_iter()
            .zip(y.outer_iter())
            .zip(beta.outer_iter_mut())
            .enumerate()
        {
            let design = DesignMatrix::Dense(xs.to_owned());
            let solved = self
                .0
                .solve_least_squares(&design, ys)
                .map_err(|source| batch_error(unit, source))?;
            out.assign(&solved);
        }
        Ok(beta)
    }
}

// A strategy that refuses statistics does so for the whole batch, not for unit 0.
fn batch_error(unit: usize, source: SolverError) -> SolverError {
    match source {
        SolverError::RequiresRowData { .. } => source,
        other => SolverError::Batch {
            unit,
            source: Box::new(other),
        },
    }
}

// ========================================================================================
//                                   Batched kernels
// ========================================================================================

/// Per-slice matrix-vector product: `out[k] = x[k] · beta[k]`.
///
/// Shapes: `x` is `batch × samples × features`, `beta` is `batch × features`.
pub fn batched_mvmul(x: ArrayView3<f64>, beta: ArrayView2<f64>) -> Array2<f64> {
    let (batch, nsample, _) = x.dim();
    let mut out = Array2::<f64>::zeros((batch, nsample));
    for ((xs, b), mut row) in x.outer_iter().zip(beta.outer_iter()).zip(out.outer_iter_mut()) {
        row.assign(&xs.dot(&b));
    }
    out
}

/// Row-wise dot product of two `batch × n` stacks.
pub fn batched_vdot(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array1<f64> {
    (&a * &b).sum_axis(Axis(1))
}

/// Inverts every slice of a `batch × p × p` stack.
pub fn batched_inv(a: ArrayView3<f64>) -> Result<Array3<f64>, SolverError> {
    let mut out = Array3::<f64>::zeros(a.dim());
    for (unit, (slice, mut target)) in a.outer_iter().zip(out.outer_iter_mut()).enumerate() {
        let inverse = slice.inv().map_err(|source| SolverError::Batch {
            unit,
            source: Box::new(SolverError::Factorization {
                solver: "inverse",
                source,
            }),
        })?;
        target.assign(&inverse);
    }
    Ok(out)
}

/// Extracts the diagonal of every slice of a `batch × p × p` stack.
pub fn batched_diagonal(a: ArrayView3<f64>) -> Array2<f64> {
    let (batch, p, _) = a.dim();
    Array2::from_shape_fn((batch, p), |(k, j)| a[(k, j, j)])
}

fn check_system(xtx: ArrayView2<f64>, xty: ArrayView1<f64>) -> Result<(), SolverError> {
    check_len("XtX columns", xtx.nrows(), xtx.ncols())?;
    check_len("Xty length", xtx.nrows(), xty.len())
}

fn check_len(context: &'static str, expected: usize, found: usize) -> Result<(), SolverError> {
    if expected == found {
        Ok(())
    } else {
        Err(SolverError::DimensionMismatch {
            context,
            expected,
            found,
        })
    }
}

fn finite_or_err(beta: Array1<f64>, solver: &'static str) -> Result<Array1<f64>, SolverError> {
    if beta.iter().all(|v| v.is_finite()) {
        Ok(beta)
    } else {
        Err(SolverError::NonFinite { solver })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, stack};

    fn well_conditioned() -> (Array2<f64>, Array1<f64>) {
        let x = array![
            [1.0, 0.3, -1.2],
            [1.0, 1.1, 0.4],
            [1.0, -0.7, 2.0],
            [1.0, 2.2, 0.1],
            [1.0, 0.0, -0.5],
            [1.0, 1.5, 1.3]
        ];
        let y = array![0.4, 2.1, -0.3, 3.9, 0.2, 2.8];
        (x.t().dot(&x), x.t().dot(&y))
    }

    #[test]
    fn inverse_and_cholesky_agree_on_a_well_conditioned_system() {
        let (xtx, xty) = well_conditioned();
        let by_inverse = InverseSolver.solve(xtx.view(), xty.view()).unwrap();
        let by_cholesky = CholeskySolver.solve(xtx.view(), xty.view()).unwrap();
        for (a, b) in by_inverse.iter().zip(by_cholesky.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        let residual = xtx.dot(&by_cholesky) - &xty;
        assert!(residual.iter().all(|r| r.abs() < 1e-10));
    }

    #[test]
    fn qr_refuses_statistics_but_matches_on_rows() {
        let x = array![[1.0, 0.5], [1.0, 1.5], [1.0, 2.5], [1.0, 4.0]];
        let y = array![1.1, 2.9, 5.2, 8.1];
        let design = DesignMatrix::from(x.clone());

        let err = QrSolver
            .solve(x.t().dot(&x).view(), x.t().dot(&y).view())
            .unwrap_err();
        assert!(matches!(err, SolverError::RequiresRowData { solver: "qr" }));
        assert!(!err.is_numeric_failure());
        assert!(!QrSolver.supports_statistics());

        let by_qr = QrSolver.solve_least_squares(&design, y.view()).unwrap();
        let by_cholesky = CholeskySolver.solve_least_squares(&design, y.view()).unwrap();
        for (a, b) in by_qr.iter().zip(by_cholesky.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn indefinite_systems_fail_cholesky_with_a_numeric_error() {
        let indefinite = array![[0.0, 1.0], [1.0, 0.0]];
        let rhs = array![1.0, 2.0];
        let err = CholeskySolver.solve(indefinite.view(), rhs.view()).unwrap_err();
        assert!(err.is_numeric_failure());

        let solved = InverseSolver.solve(indefinite.view(), rhs.view()).unwrap();
        assert_abs_diff_eq!(solved[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(solved[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn shape_errors_are_not_numeric() {
        let xtx = Array2::<f64>::eye(3);
        let xty = array![1.0, 2.0];
        let err = CholeskySolver.solve(xtx.view(), xty.view()).unwrap_err();
        assert!(matches!(err, SolverError::DimensionMismatch { .. }));
        assert!(!err.is_numeric_failure());
    }

    #[test]
    fn batched_solver_reports_the_failing_unit() {
        let good = Array2::<f64>::eye(2) * 2.0;
        let bad = array![[1.0, 2.0], [2.0, 1.0]];
        let xtx = stack![Axis(0), good, bad, good];
        let xty = array![[2.0, 4.0], [1.0, 1.0], [6.0, 8.0]];

        let err = BatchedCholeskySolver::default()
            .solve_batch(xtx.view(), xty.view())
            .unwrap_err();
        assert!(matches!(err, SolverError::Batch { unit: 1, .. }));
        assert!(err.is_numeric_failure());

        let beta = BatchedInverseSolver::default()
            .solve_batch(xtx.view(), xty.view())
            .unwrap();
        assert_abs_diff_eq!(beta[(0, 1)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(beta[(1, 0)], 1.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(beta[(2, 0)], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn batched_qr_refuses_statistics_for_the_whole_batch() {
        let xtx = Array3::<f64>::zeros((2, 2, 2));
        let xty = Array2::<f64>::zeros((2, 2));
        let err = BatchedQrSolver::default()
            .solve_batch(xtx.view(), xty.view())
            .unwrap_err();
        assert!(matches!(err, SolverError::RequiresRowData { .. }));
    }

    #[test]
    fn kernels_operate_per_slice() {
        let x = Array3::from_shape_fn((2, 3, 2), |(b, i, j)| (b + i + j) as f64);
        let beta = array![[1.0, 0.0], [0.0, 1.0]];
        let y = batched_mvmul(x.view(), beta.view());
        assert_eq!(y, array![[0.0, 1.0, 2.0], [2.0, 3.0, 4.0]]);

        let dots = batched_vdot(y.view(), y.view());
        assert_eq!(dots, array![5.0, 29.0]);

        let a = stack![Axis(0), Array2::<f64>::eye(2) * 4.0, array![[2.0, 0.0], [0.0, 5.0]]];
        let inv = batched_inv(a.view()).unwrap();
        let diagonal = batched_diagonal(inv.view());
        for (got, want) in diagonal.iter().zip([0.25, 0.25, 0.5, 0.2]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-14);
        }
    }
}
