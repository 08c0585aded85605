use super::site::{BatchedCoefficients, BatchedSiteStatistics, SiteResiduals};
use super::{FederationError, check_dim};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One coefficient of one variant's model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationRow {
    pub variant_id: String,
    pub term: String,
    pub beta: f64,
    pub standard_error: f64,
    pub t_stat: f64,
    pub dof: i64,
}

/// Flat association table keyed by variant ID, one row per `(variant, term)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssociationReport {
    pub rows: Vec<AssociationRow>,
}

impl AssociationReport {
    /// Builds the table from the combined statistics, the global coefficients and the
    /// summed per-variant residual sums of squares.
    pub fn build(
        statistics: &BatchedSiteStatistics,
        coefficients: &BatchedCoefficients,
        residuals: &SiteResiduals,
    ) -> Result<Self, FederationError> {
        if statistics.variant_ids != coefficients.variant_ids
            || residuals.variant_ids != coefficients.variant_ids
        {
            return Err(FederationError::MisalignedArtifacts);
        }
        check_dim("term names", coefficients.beta.ncols(), coefficients.terms.len())?;

        let model = coefficients.model();
        let nobs: Array1<usize> = statistics.nobs.iter().copied().collect();
        let sse = Array1::from(residuals.sse.clone());
        let dof = model.dof(nobs.view());
        let standard_errors = model.standard_errors(sse.view(), statistics.xtx.view(), dof.view())?;

        let mut rows = Vec::with_capacity(coefficients.variant_ids.len() * coefficients.terms.len());
        for (unit, variant_id) in coefficients.variant_ids.iter().enumerate() {
            for (j, term) in coefficients.terms.iter().enumerate() {
                let beta = coefficients.beta[(unit, j)];
                let standard_error = standard_errors[(unit, j)];
                rows.push(AssociationRow {
                    variant_id: variant_id.clone(),
                    term: term.clone(),
                    beta,
                    standard_error,
                    t_stat: beta / standard_error,
                    dof: dof[unit],
                });
            }
        }
        log::info!("Built association report with {} rows", rows.len());
        Ok(Self { rows })
    }

    /// Writes the table as tab-separated values with a header line.
    pub fn write_tsv(&self, path: &Path) -> Result<(), FederationError> {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_tsv(path: &Path) -> Result<Self, FederationError> {
        let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
        let rows = reader
            .deserialize()
            .collect::<Result<Vec<AssociationRow>, csv::Error>>()?;
        Ok(Self { rows })
    }
}
