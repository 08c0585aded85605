use super::aggregate::{Aggregation, Contribution, SumUp, intersect_ordered};
use super::{FederationError, check_dim};
use crate::accel::Accelerator;
use crate::linalg::{BatchedSolver, LinearSolver};
use crate::matrix::{DesignMatrix, complete_rows};
use crate::regress::{BatchedLinearRegression, LinearRegression};
use crate::stats::{
    batched_unnorm_autocovariance, batched_unnorm_covariance, unnorm_autocovariance,
    unnorm_covariance,
};
use ahash::AHashMap;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, Ix1, Ix2, Ix3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

// --- Artifact persistence ---
// Every site artifact is a human-readable TOML file. Scalars and lists come first in each
// struct so the arrays serialize as trailing tables.

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), FederationError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    Ok(())
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, FederationError> {
    let toml_string = fs::read_to_string(path)?;
    Ok(toml::from_str(&toml_string)?)
}

fn all_finite(x: ArrayView3<f64>, y: ArrayView2<f64>) -> bool {
    x.iter().chain(y.iter()).all(|v| v.is_finite())
}

fn variant_positions(available: &[String], wanted: &[String]) -> Result<Vec<usize>, FederationError> {
    // First occurrence wins, matching `intersect_ordered`.
    let mut index: AHashMap<&str, usize> = AHashMap::with_capacity(available.len());
    for (position, id) in available.iter().enumerate() {
        index.entry(id.as_str()).or_insert(position);
    }
    wanted
        .iter()
        .map(|id| {
            index
                .get(id.as_str())
                .copied()
                .ok_or_else(|| FederationError::UnknownVariant(id.clone()))
        })
        .collect()
}

fn into_parts<const N: usize>(total: Contribution) -> Result<[Contribution; N], FederationError> {
    let parts = total.into_list()?;
    let found = parts.len();
    parts.try_into().map_err(|_| FederationError::DimensionMismatch {
        context: "combined statistics parts",
        expected: N,
        found,
    })
}

/// Sufficient statistics of one site for a single model: `(nobs, XtX, Xty)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteStatistics {
    pub nobs: usize,
    pub xtx: Array2<f64>,
    pub xty: Array1<f64>,
}

impl SiteStatistics {
    /// Computes the statistics over the complete rows of the local design.
    pub fn compute(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<Self, FederationError> {
        check_dim("response length", x.nrows(), y.len())?;
        let (kept_x, kept_y) = complete_rows(x, y);
        let design = DesignMatrix::from(kept_x);
        Ok(Self {
            nobs: design.nrows(),
            xtx: unnorm_autocovariance(&design),
            xty: unnorm_covariance(&design, kept_y.view()),
        })
    }

    fn to_contribution(&self) -> Contribution {
        Contribution::List(vec![
            Contribution::Scalar(self.nobs as f64),
            self.xtx.clone().into(),
            self.xty.clone().into(),
        ])
    }

    /// Sums every site's statistics.
    pub fn combine(sites: &[Self]) -> Result<Self, FederationError> {
        if sites.is_empty() {
            return Err(FederationError::NoSites);
        }
        let contributions: Vec<Contribution> = sites.iter().map(Self::to_contribution).collect();
        let [nobs, xtx, xty] = into_parts(SumUp.aggregate(&contributions)?)?;
        let combined = Self {
            nobs: nobs.as_scalar()?.round() as usize,
            xtx: xtx.into_array()?.into_dimensionality::<Ix2>()?,
            xty: xty.into_array()?.into_dimensionality::<Ix1>()?,
        };
        log::info!(
            "Combined statistics of {} sites covering {} samples",
            sites.len(),
            combined.nobs
        );
        Ok(combined)
    }

    pub fn solve(
        &self,
        solver: &dyn LinearSolver,
        include_bias: bool,
    ) -> Result<LinearRegression, FederationError> {
        Ok(LinearRegression::from_statistics(
            self.xtx.view(),
            self.xty.view(),
            solver,
            include_bias,
        )?)
    }

    pub fn save(&self, path: &Path) -> Result<(), FederationError> {
        save_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, FederationError> {
        load_toml(path)
    }
}

/// Per-variant sufficient statistics of one site.
///
/// Unit `k` of `xtx`/`xty` belongs to `variant_ids[k]`; `terms` names the design columns
/// shared by every unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedSiteStatistics {
    pub variant_ids: Vec<String>,
    pub terms: Vec<String>,
    pub nobs: Vec<usize>,
    pub xtx: Array3<f64>,
    pub xty: Array2<f64>,
}

impl BatchedSiteStatistics {
    /// Computes per-variant statistics. A sample with a missing value for some variant is
    /// dropped for that variant only.
    pub fn compute(
        variant_ids: Vec<String>,
        terms: Vec<String>,
        x: ArrayView3<f64>,
        y: ArrayView2<f64>,
    ) -> Result<Self, FederationError> {
        let (batch, nsample, ndims) = x.dim();
        check_dim("variant IDs", batch, variant_ids.len())?;
        check_dim("term names", ndims, terms.len())?;
        check_dim("batched response units", batch, y.nrows())?;
        check_dim("batched response samples", nsample, y.ncols())?;

        if all_finite(x, y) {
            return Ok(Self {
                variant_ids,
                terms,
                nobs: vec![nsample; batch],
                xtx: batched_unnorm_autocovariance(x),
                xty: batched_unnorm_covariance(x, y),
            });
        }

        let mut nobs = Vec::with_capacity(batch);
        let mut xtx = Array3::<f64>::zeros((batch, ndims, ndims));
        let mut xty = Array2::<f64>::zeros((batch, ndims));
        for (unit, (xs, ys)) in x.outer_iter().zip(y.outer_iter()).enumerate() {
            let (kept_x, kept_y) = complete_rows(xs, ys);
            nobs.push(kept_x.nrows());
            xtx.index_axis_mut(Axis(0), unit).assign(&kept_x.t().dot(&kept_x));
            xty.row_mut(unit).assign(&kept_x.t().dot(&kept_y));
        }
        log::debug!(
            "Computed statistics for {} variants with per-variant missingness",
            batch
        );
        Ok(Self {
            variant_ids,
            terms,
            nobs,
            xtx,
            xty,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.variant_ids.len()
    }

    /// Restricts the statistics to `variant_ids`, in that order.
    pub fn select_variants(&self, variant_ids: &[String]) -> Result<Self, FederationError> {
        let positions = variant_positions(&self.variant_ids, variant_ids)?;
        Ok(Self {
            variant_ids: variant_ids.to_vec(),
            terms: self.terms.clone(),
            nobs: positions.iter().map(|&p| self.nobs[p]).collect(),
            xtx: self.xtx.select(Axis(0), &positions),
            xty: self.xty.select(Axis(0), &positions),
        })
    }

    fn to_contribution(&self) -> Contribution {
        let nobs: Array1<f64> = self.nobs.iter().map(|&n| n as f64).collect();
        Contribution::List(vec![
            nobs.into(),
            self.xtx.clone().into(),
            self.xty.clone().into(),
        ])
    }

    /// Sums statistics across sites that list the same variants in the same order.
    pub fn combine(sites: &[Self]) -> Result<Self, FederationError> {
        let (first, rest) = sites.split_first().ok_or(FederationError::NoSites)?;
        for (offset, site) in rest.iter().enumerate() {
            if site.variant_ids != first.variant_ids {
                return Err(FederationError::VariantMismatch { site: offset + 1 });
            }
            if site.terms != first.terms {
                return Err(FederationError::TermMismatch { site: offset + 1 });
            }
        }

        let contributions: Vec<Contribution> = sites.iter().map(Self::to_contribution).collect();
        let [nobs, xtx, xty] = into_parts(SumUp.aggregate(&contributions)?)?;
        let nobs = nobs.into_array()?.into_dimensionality::<Ix1>()?;
        log::info!(
            "Combined statistics of {} sites for {} variants",
            sites.len(),
            first.batch_size()
        );
        Ok(Self {
            variant_ids: first.variant_ids.clone(),
            terms: first.terms.clone(),
            nobs: nobs.iter().map(|n| n.round() as usize).collect(),
            xtx: xtx.into_array()?.into_dimensionality::<Ix3>()?,
            xty: xty.into_array()?.into_dimensionality::<Ix2>()?,
        })
    }

    pub fn solve(
        &self,
        solver: &dyn BatchedSolver,
        include_bias: bool,
    ) -> Result<BatchedCoefficients, FederationError> {
        let model = BatchedLinearRegression::from_statistics(
            self.xtx.view(),
            self.xty.view(),
            solver,
            include_bias,
        )?;
        Ok(BatchedCoefficients {
            variant_ids: self.variant_ids.clone(),
            terms: self.terms.clone(),
            include_bias,
            beta: model.coef().clone(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), FederationError> {
        save_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, FederationError> {
        load_toml(path)
    }
}

/// Variants present at every site, in the first site's order.
pub fn reconcile_variants(sites: &[BatchedSiteStatistics]) -> Result<Vec<String>, FederationError> {
    if sites.is_empty() {
        return Err(FederationError::NoSites);
    }
    let lists: Vec<&[String]> = sites.iter().map(|site| site.variant_ids.as_slice()).collect();
    let shared = intersect_ordered(&lists);
    log::info!(
        "{} of {} variants at the first site are shared by all {} sites",
        shared.len(),
        sites[0].batch_size(),
        sites.len()
    );
    Ok(shared)
}

/// Round one of the coordinator protocol: reconcile, sum and solve.
pub fn federated_fit(
    sites: &[BatchedSiteStatistics],
    solver: &dyn BatchedSolver,
    include_bias: bool,
) -> Result<(BatchedSiteStatistics, BatchedCoefficients), FederationError> {
    let shared = reconcile_variants(sites)?;
    let aligned = sites
        .iter()
        .map(|site| site.select_variants(&shared))
        .collect::<Result<Vec<_>, _>>()?;
    let combined = BatchedSiteStatistics::combine(&aligned)?;
    let coefficients = combined.solve(solver, include_bias)?;
    Ok((combined, coefficients))
}

/// Globally fitted per-variant coefficients, as broadcast back to every site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedCoefficients {
    pub variant_ids: Vec<String>,
    pub terms: Vec<String>,
    pub include_bias: bool,
    pub beta: Array2<f64>,
}

impl BatchedCoefficients {
    pub fn model(&self) -> BatchedLinearRegression {
        BatchedLinearRegression::from_coefficients(self.beta.clone(), self.include_bias)
    }

    pub fn save(&self, path: &Path) -> Result<(), FederationError> {
        save_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, FederationError> {
        load_toml(path)
    }
}

/// Per-variant residual sums of squares of one site under the global coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteResiduals {
    pub variant_ids: Vec<String>,
    pub sse: Vec<f64>,
}

impl SiteResiduals {
    /// Round two of the coordinator protocol, run at a site.
    ///
    /// `variant_ids` labels the units of the local `x`/`y`; the result follows the order
    /// of `coefficients.variant_ids`. Rows are filtered exactly as in
    /// [`BatchedSiteStatistics::compute`].
    pub fn compute(
        coefficients: &BatchedCoefficients,
        variant_ids: &[String],
        x: ArrayView3<f64>,
        y: ArrayView2<f64>,
        acceleration: &Accelerator,
    ) -> Result<Self, FederationError> {
        check_dim("variant IDs", x.len_of(Axis(0)), variant_ids.len())?;
        check_dim("batched response units", x.len_of(Axis(0)), y.nrows())?;
        check_dim("batched response samples", x.len_of(Axis(1)), y.ncols())?;
        let positions = variant_positions(variant_ids, &coefficients.variant_ids)?;
        let x = x.select(Axis(0), &positions);
        let y = y.select(Axis(0), &positions);

        let sse = if all_finite(x.view(), y.view()) {
            coefficients
                .model()
                .sse(x.view(), y.view(), acceleration)?
                .to_vec()
        } else {
            let mut sse = Vec::with_capacity(positions.len());
            for ((xs, ys), beta) in x
                .outer_iter()
                .zip(y.outer_iter())
                .zip(coefficients.beta.outer_iter())
            {
                let (kept_x, kept_y) = complete_rows(xs, ys);
                let model = LinearRegression::from_coefficients(beta.to_owned(), coefficients.include_bias);
                sse.push(model.sse(&DesignMatrix::from(kept_x), kept_y.view())?);
            }
            sse
        };

        Ok(Self {
            variant_ids: coefficients.variant_ids.clone(),
            sse,
        })
    }

    /// Sums the residual sums of squares reported by every site.
    pub fn combine(sites: &[Self]) -> Result<Self, FederationError> {
        let (first, rest) = sites.split_first().ok_or(FederationError::NoSites)?;
        for (offset, site) in rest.iter().enumerate() {
            if site.variant_ids != first.variant_ids {
                return Err(FederationError::VariantMismatch { site: offset + 1 });
            }
        }
        let contributions: Vec<Contribution> = sites
            .iter()
            .map(|site| Array1::from(site.sse.clone()).into())
            .collect();
        let total = SumUp.aggregate(&contributions)?.into_array()?;
        Ok(Self {
            variant_ids: first.variant_ids.clone(),
            sse: total.iter().copied().collect(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), FederationError> {
        save_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, FederationError> {
        load_toml(path)
    }
}
