//! # Federation Layer
//!
//! Everything that crosses a site boundary lives here. Sites compute sufficient
//! statistics over their own samples ([`SiteStatistics`], [`BatchedSiteStatistics`]) and
//! hand only those to a coordinator. The coordinator reconciles variant lists with an
//! ordered intersection, sums statistics with [`SumUp`], solves the global model, and
//! collects per-site residual sums of squares in a second round so that standard errors
//! can be reported without any individual-level row leaving its site.

pub mod aggregate;
pub mod report;
pub mod site;

pub use aggregate::{AggregationError, Aggregation, Contribution, Intersect, SumUp, intersect_ordered};
pub use report::{AssociationReport, AssociationRow};
pub use site::{
    BatchedCoefficients, BatchedSiteStatistics, SiteResiduals, SiteStatistics, federated_fit,
    reconcile_variants,
};

use crate::regress::RegressionError;
use ndarray::ShapeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("No site contributions were supplied.")]
    NoSites,

    #[error("Site {site} lists different variants than site 0; reconcile variant IDs before combining.")]
    VariantMismatch { site: usize },

    #[error("Statistics, coefficients and residuals must list the same variants in the same order.")]
    MisalignedArtifacts,

    #[error("Site {site} models different terms than site 0.")]
    TermMismatch { site: usize },

    #[error("Variant '{0}' is not present in this site's data.")]
    UnknownVariant(String),

    #[error("Dimension mismatch for {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Regression failed: {0}")]
    Regression(#[from] RegressionError),

    #[error("Aggregated statistics have an unexpected shape: {0}")]
    Shape(#[from] ShapeError),

    #[error("Failed to read or write artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML artifact: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize artifact to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Failed to read or write the report table: {0}")]
    Csv(#[from] csv::Error),
}

pub(crate) fn check_dim(
    context: &'static str,
    expected: usize,
    found: usize,
) -> Result<(), FederationError> {
    if expected == found {
        Ok(())
    } else {
        Err(FederationError::DimensionMismatch {
            context,
            expected,
            found,
        })
    }
}
