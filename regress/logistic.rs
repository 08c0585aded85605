//! Logistic regression fit by Newton's method.
//!
//! `fit` performs exactly one Newton step, `β ← β + H⁻¹ ∇ℓ`, with the gradient
//! `Xᵗ(y − p)` and Hessian `Xᵗ diag(p(1 − p)) X` taken at the current coefficients.
//! Callers iterate `fit` themselves. The gradient and Hessian are additive over sample
//! partitions, so a coordinator can sum them across sites and finish the step with
//! [`LogisticRegression::apply_newton_step`] without seeing any rows.

use super::{RegressionError, check_dim, degrees_of_freedom};
use crate::accel::Accelerator;
use crate::linalg::{BatchedInverseSolver, BatchedSolver, LinearSolver, batched_mvmul};
use crate::matrix::DesignMatrix;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s};

/// Linear predictors beyond this magnitude saturate the logistic function in `f64`.
const ETA_LIMIT: f64 = 700.0;

fn logistic(eta: f64) -> f64 {
    let eta = eta.clamp(-ETA_LIMIT, ETA_LIMIT);
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

// log(1 + e^eta) without overflow.
fn softplus(eta: f64) -> f64 {
    eta.max(0.0) + (-eta.abs()).exp().ln_1p()
}

fn bernoulli_loglikelihood(eta: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    eta.iter().zip(y.iter()).map(|(&e, &yi)| yi * e - softplus(e)).sum()
}

fn require_statistics_solver(name: &'static str, supports: bool) -> Result<(), RegressionError> {
    if supports {
        Ok(())
    } else {
        Err(RegressionError::UnsupportedSolver {
            solver: name,
            context: "for Newton steps",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogisticRegression {
    beta: Array1<f64>,
}

impl LogisticRegression {
    pub fn new(beta: Array1<f64>) -> Self {
        Self { beta }
    }

    /// Starting point for Newton iteration.
    pub fn zeros(ndims: usize) -> Self {
        Self::new(Array1::zeros(ndims))
    }

    pub fn coef(&self) -> &Array1<f64> {
        &self.beta
    }

    pub fn dof(&self, nobs: usize) -> i64 {
        degrees_of_freedom(nobs, self.beta.len())
    }

    fn linear_predictor(&self, x: &DesignMatrix) -> Result<Array1<f64>, RegressionError> {
        check_dim("design columns", self.beta.len(), x.ncols())?;
        Ok(x.matrix_vector_multiply(self.beta.view()))
    }

    /// Fitted probabilities `σ(Xβ)`.
    pub fn predict(&self, x: &DesignMatrix) -> Result<Array1<f64>, RegressionError> {
        Ok(self.linear_predictor(x)?.mapv(logistic))
    }

    pub fn residual(&self, x: &DesignMatrix, y: ArrayView1<f64>) -> Result<Array1<f64>, RegressionError> {
        check_dim("response length", x.nrows(), y.len())?;
        Ok(&y - &self.predict(x)?)
    }

    /// Score vector `Xᵗ(y − p)`.
    pub fn gradient(&self, x: &DesignMatrix, y: ArrayView1<f64>) -> Result<Array1<f64>, RegressionError> {
        let residual = self.residual(x, y)?;
        Ok(x.transpose_vector_multiply(residual.view()))
    }

    /// Observed information `Xᵗ diag(p(1 − p)) X`.
    pub fn hessian(&self, x: &DesignMatrix) -> Result<Array2<f64>, RegressionError> {
        let weights = self.predict(x)?.mapv(|p| p * (1.0 - p));
        Ok(x.weighted_gram(weights.view()))
    }

    pub fn loglikelihood(&self, x: &DesignMatrix, y: ArrayView1<f64>) -> Result<f64, RegressionError> {
        check_dim("response length", x.nrows(), y.len())?;
        let eta = self.linear_predictor(x)?;
        Ok(bernoulli_loglikelihood(eta.view(), y))
    }

    /// One Newton step from row-level data.
    pub fn fit(
        &mut self,
        x: &DesignMatrix,
        y: ArrayView1<f64>,
        solver: &dyn LinearSolver,
    ) -> Result<(), RegressionError> {
        require_statistics_solver(solver.name(), solver.supports_statistics())?;
        let gradient = self.gradient(x, y)?;
        let hessian = self.hessian(x)?;
        self.apply_newton_step(gradient.view(), hessian.view(), solver)
    }

    /// Applies `β ← β + H⁻¹ g` from an already aggregated gradient and Hessian.
    pub fn apply_newton_step(
        &mut self,
        gradient: ArrayView1<f64>,
        hessian: ArrayView2<f64>,
        solver: &dyn LinearSolver,
    ) -> Result<(), RegressionError> {
        require_statistics_solver(solver.name(), solver.supports_statistics())?;
        check_dim("gradient length", self.beta.len(), gradient.len())?;
        let step = solver.solve(hessian, gradient)?;
        self.beta += &step;
        Ok(())
    }
}

/// Independent logistic regressions, one coefficient vector per unit.
///
/// The acceleration mode is part of the model and governs `predict`.
#[derive(Debug)]
pub struct BatchedLogisticRegression {
    beta: Array2<f64>,
    acceleration: Accelerator,
}

impl BatchedLogisticRegression {
    pub fn new(beta: Array2<f64>, acceleration: Accelerator) -> Self {
        Self { beta, acceleration }
    }

    pub fn zeros(batch: usize, ndims: usize, acceleration: Accelerator) -> Self {
        Self::new(Array2::zeros((batch, ndims)), acceleration)
    }

    pub fn coef(&self) -> &Array2<f64> {
        &self.beta
    }

    pub fn acceleration(&self) -> &Accelerator {
        &self.acceleration
    }

    pub fn dof(&self, nobs: ArrayView1<usize>) -> Array1<i64> {
        let k = self.beta.ncols();
        nobs.mapv(|n| degrees_of_freedom(n, k))
    }

    fn check_design(&self, x: ArrayView3<f64>) -> Result<(), RegressionError> {
        let (batch, _, ndims) = x.dim();
        check_dim("design units", self.beta.nrows(), batch)?;
        check_dim("design columns", self.beta.ncols(), ndims)
    }

    fn check_response(x: ArrayView3<f64>, y: ArrayView2<f64>) -> Result<(), RegressionError> {
        check_dim("batched response units", x.len_of(Axis(0)), y.nrows())?;
        check_dim("batched response samples", x.len_of(Axis(1)), y.ncols())
    }

    fn linear_predictor(&self, x: ArrayView3<f64>) -> Result<Array2<f64>, RegressionError> {
        self.check_design(x)?;
        let beta = self.beta.view();
        let eta = self.acceleration.map_batch(x.len_of(Axis(0)), |units| {
            batched_mvmul(x.slice(s![units.clone(), .., ..]), beta.slice(s![units, ..]))
        })?;
        Ok(eta)
    }

    /// Fitted probabilities, `batch × samples`.
    pub fn predict(&self, x: ArrayView3<f64>) -> Result<Array2<f64>, RegressionError> {
        Ok(self.linear_predictor(x)?.mapv(logistic))
    }

    pub fn residual(&self, x: ArrayView3<f64>, y: ArrayView2<f64>) -> Result<Array2<f64>, RegressionError> {
        Self::check_response(x, y)?;
        Ok(&y - &self.predict(x)?)
    }

    /// Per-unit score vectors, `batch × features`.
    pub fn gradient(&self, x: ArrayView3<f64>, y: ArrayView2<f64>) -> Result<Array2<f64>, RegressionError> {
        let residual = self.residual(x, y)?;
        let mut gradient = Array2::<f64>::zeros(self.beta.dim());
        for ((xs, r), mut out) in x
            .outer_iter()
            .zip(residual.outer_iter())
            .zip(gradient.outer_iter_mut())
        {
            out.assign(&xs.t().dot(&r));
        }
        Ok(gradient)
    }

    /// Per-unit observed information, `batch × features × features`.
    pub fn hessian(&self, x: ArrayView3<f64>) -> Result<Array3<f64>, RegressionError> {
        let probabilities = self.predict(x)?;
        let ndims = self.beta.ncols();
        let mut hessian = Array3::<f64>::zeros((self.beta.nrows(), ndims, ndims));
        for ((xs, p), mut out) in x
            .outer_iter()
            .zip(probabilities.outer_iter())
            .zip(hessian.outer_iter_mut())
        {
            let weights = p.mapv(|pi| pi * (1.0 - pi));
            let weighted = &xs * &weights.insert_axis(Axis(1));
            out.assign(&xs.t().dot(&weighted));
        }
        Ok(hessian)
    }

    /// Per-unit Bernoulli log-likelihood.
    pub fn loglikelihood(&self, x: ArrayView3<f64>, y: ArrayView2<f64>) -> Result<Array1<f64>, RegressionError> {
        Self::check_response(x, y)?;
        let eta = self.linear_predictor(x)?;
        Ok(eta
            .outer_iter()
            .zip(y.outer_iter())
            .map(|(e, yi)| bernoulli_loglikelihood(e, yi))
            .collect())
    }

    /// One Newton step for every unit, using `solver` with the inverse fallback of
    /// [`newton_update`].
    pub fn fit(
        &mut self,
        x: ArrayView3<f64>,
        y: ArrayView2<f64>,
        solver: &dyn BatchedSolver,
    ) -> Result<(), RegressionError> {
        require_statistics_solver(solver.name(), solver.supports_statistics())?;
        let gradient = self.gradient(x, y)?;
        let hessian = self.hessian(x)?;
        self.apply_newton_step(gradient.view(), hessian.view(), solver)
    }

    pub fn apply_newton_step(
        &mut self,
        gradient: ArrayView2<f64>,
        hessian: ArrayView3<f64>,
        solver: &dyn BatchedSolver,
    ) -> Result<(), RegressionError> {
        self.beta = newton_update(self.beta.view(), gradient, hessian, solver)?;
        Ok(())
    }
}

/// Computes `β + H⁻¹ g` for every unit.
///
/// When `solver` fails numerically on any unit (an indefinite or singular Hessian), the
/// whole step is retried once with the batched inverse strategy. Contract violations such
/// as mismatched shapes are returned as they are, and so is a failure of the retry.
pub fn newton_update(
    beta: ArrayView2<f64>,
    gradient: ArrayView2<f64>,
    hessian: ArrayView3<f64>,
    solver: &dyn BatchedSolver,
) -> Result<Array2<f64>, RegressionError> {
    require_statistics_solver(solver.name(), solver.supports_statistics())?;
    check_dim("gradient units", beta.nrows(), gradient.nrows())?;
    check_dim("gradient width", beta.ncols(), gradient.ncols())?;

    let fallback = BatchedInverseSolver::default();
    let step = match solver.solve_batch(hessian, gradient) {
        Ok(step) => step,
        Err(err) if err.is_numeric_failure() && solver.name() != fallback.name() => {
            log::warn!(
                "{} Newton update failed ({}); retrying this step with the {} solver",
                solver.name(),
                err,
                fallback.name()
            );
            fallback.solve_batch(hessian, gradient)?
        }
        Err(err) => return Err(err.into()),
    };
    Ok(&beta + &step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::WorkerPool;
    use crate::linalg::{BatchedCholeskySolver, BatchedQrSolver, CholeskySolver, QrSolver, SolverError};
    use crate::matrix::add_bias;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, stack};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    // Non-separable case/control cohort with a true slope of about 0.9.
    fn cohort(seed: u64, nsample: usize) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let genotype = Array2::from_shape_fn((nsample, 1), |_| rng.gen_range(0..3) as f64);
        let x = add_bias(genotype.view());
        let y = Array1::from_shape_fn(nsample, |i| {
            let p = logistic(-0.8 + 0.9 * x[(i, 1)]);
            if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 }
        });
        (x, y)
    }

    #[test]
    fn logistic_is_stable_at_extremes() {
        assert_eq!(logistic(0.0), 0.5);
        assert!(logistic(1e6) <= 1.0 && logistic(1e6) > 0.999);
        assert!(logistic(-1e6) >= 0.0 && logistic(-1e6) < 1e-300);
        assert_abs_diff_eq!(softplus(800.0), 800.0, epsilon = 1e-9);
        assert_abs_diff_eq!(softplus(0.0), std::f64::consts::LN_2, epsilon = 1e-15);
    }

    #[test]
    fn repeated_newton_steps_reach_the_score_root() {
        let (x, y) = cohort(11, 400);
        let design = DesignMatrix::from(x);
        let mut model = LogisticRegression::zeros(2);

        let mut previous = model.loglikelihood(&design, y.view()).unwrap();
        for _ in 0..8 {
            model.fit(&design, y.view(), &CholeskySolver).unwrap();
            let current = model.loglikelihood(&design, y.view()).unwrap();
            assert!(current >= previous - 1e-9);
            previous = current;
        }

        let gradient = model.gradient(&design, y.view()).unwrap();
        assert!(gradient.iter().all(|g| g.abs() < 1e-8));
        assert!(model.coef()[1] > 0.3);
        assert_eq!(model.dof(400), 398);
    }

    #[test]
    fn summed_site_scores_reproduce_the_pooled_step() {
        let (x, y) = cohort(5, 120);
        let pooled_design = DesignMatrix::from(x.clone());
        let mut pooled = LogisticRegression::zeros(2);
        pooled.fit(&pooled_design, y.view(), &CholeskySolver).unwrap();

        let mut federated = LogisticRegression::zeros(2);
        let mut gradient = Array1::<f64>::zeros(2);
        let mut hessian = Array2::<f64>::zeros((2, 2));
        for (start, end) in [(0, 50), (50, 120)] {
            let site = DesignMatrix::from(x.slice(s![start..end, ..]).to_owned());
            gradient += &federated.gradient(&site, y.slice(s![start..end])).unwrap();
            hessian += &federated.hessian(&site).unwrap();
        }
        federated
            .apply_newton_step(gradient.view(), hessian.view(), &CholeskySolver)
            .unwrap();

        for (a, b) in pooled.coef().iter().zip(federated.coef().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn qr_cannot_take_a_newton_step() {
        let (x, y) = cohort(3, 20);
        let mut model = LogisticRegression::zeros(2);
        let err = model.fit(&DesignMatrix::from(x), y.view(), &QrSolver).unwrap_err();
        assert!(matches!(err, RegressionError::UnsupportedSolver { solver: "qr", .. }));
        assert_eq!(model.coef(), &Array1::<f64>::zeros(2));
    }

    #[test]
    fn batched_units_match_their_plain_fits() {
        let units: Vec<_> = (0..5).map(|seed| cohort(20 + seed, 60)).collect();
        let xs: Vec<_> = units.iter().map(|(x, _)| x.view()).collect();
        let ys: Vec<_> = units.iter().map(|(_, y)| y.view()).collect();
        let x = stack(Axis(0), &xs).unwrap();
        let y = stack(Axis(0), &ys).unwrap();

        let mut batched = BatchedLogisticRegression::zeros(
            5,
            2,
            Accelerator::Parallel(WorkerPool::new(2).unwrap()),
        );
        let solver = BatchedCholeskySolver::default();
        batched.fit(x.view(), y.view(), &solver).unwrap();
        batched.fit(x.view(), y.view(), &solver).unwrap();
        let loglik = batched.loglikelihood(x.view(), y.view()).unwrap();

        for (unit, (xu, yu)) in units.iter().enumerate() {
            let design = DesignMatrix::from(xu.clone());
            let mut plain = LogisticRegression::zeros(2);
            plain.fit(&design, yu.view(), &CholeskySolver).unwrap();
            plain.fit(&design, yu.view(), &CholeskySolver).unwrap();
            for j in 0..2 {
                assert_abs_diff_eq!(batched.coef()[(unit, j)], plain.coef()[j], epsilon = 1e-10);
            }
            assert_abs_diff_eq!(
                loglik[unit],
                plain.loglikelihood(&design, yu.view()).unwrap(),
                epsilon = 1e-9
            );
        }

        let single = BatchedLogisticRegression::new(batched.coef().clone(), Accelerator::Single);
        let a = single.predict(x.view()).unwrap();
        let b = batched.predict(x.view()).unwrap();
        for (p, q) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(p, q, epsilon = 1e-14);
        }
        assert_eq!(batched.dof(array![60, 60, 60, 55, 60].view())[3], 53);
    }

    #[test]
    fn indefinite_hessian_falls_back_to_the_inverse() {
        let hessian = stack![Axis(0), Array2::<f64>::eye(2) * 2.0, array![[0.0, 1.0], [1.0, 0.0]]];
        let gradient = array![[1.0, 2.0], [1.0, 2.0]];
        let mut model = BatchedLogisticRegression::zeros(2, 2, Accelerator::Single);

        model
            .apply_newton_step(gradient.view(), hessian.view(), &BatchedCholeskySolver::default())
            .unwrap();
        assert_abs_diff_eq!(model.coef()[(0, 0)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(model.coef()[(0, 1)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(model.coef()[(1, 0)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(model.coef()[(1, 1)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn contract_violations_and_failed_fallbacks_are_surfaced() {
        let beta = Array2::<f64>::zeros((2, 2));
        let hessian = Array3::<f64>::zeros((2, 2, 2));
        let wide = Array2::<f64>::ones((2, 3));
        let solver = BatchedCholeskySolver::default();

        let err = newton_update(beta.view(), wide.view(), hessian.view(), &solver).unwrap_err();
        assert!(matches!(err, RegressionError::DimensionMismatch { .. }));

        let mismatched = Array3::<f64>::zeros((2, 3, 3));
        let gradient = Array2::<f64>::ones((2, 2));
        let err = newton_update(beta.view(), gradient.view(), mismatched.view(), &solver).unwrap_err();
        assert!(matches!(
            err,
            RegressionError::Solver(SolverError::DimensionMismatch { .. })
        ));

        // Singular everywhere: both the primary and the inverse fail.
        let err = newton_update(beta.view(), gradient.view(), hessian.view(), &solver).unwrap_err();
        assert!(matches!(err, RegressionError::Solver(ref inner) if inner.is_numeric_failure()));

        let err = newton_update(
            beta.view(),
            gradient.view(),
            hessian.view(),
            &BatchedQrSolver::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RegressionError::UnsupportedSolver { .. }));
    }
}
