use ndarray::Array2;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::cluster::Cluster;
use crate::covariate::CovariateTable;
use crate::error::{DmrError, Result};
use crate::formula::Formula;
use crate::method::{fit_sites, DmrMethod, FitOptions, ScoreResult};
use crate::utils::pearson;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Combination {
    /// Stouffer's sum of z-scores assuming independent sites
    ZScore,
    /// Stouffer-Liptak sum corrected for the correlation between sites
    StoufferLiptak,
}

/// Tests every site on its own, then combines the per-site p-values into one region
/// p-value through their normal quantiles.
pub struct CombinedPValue {
    combination: Combination,
    robust: bool,
    options: FitOptions,
}

impl CombinedPValue {
    pub fn new(combination: Combination, robust: bool, options: FitOptions) -> CombinedPValue {
        CombinedPValue { combination, robust, options }
    }
}

impl DmrMethod for CombinedPValue {
    fn name(&self) -> String {
        let base = match self.combination {
            Combination::ZScore => "zscore",
            Combination::StoufferLiptak => "liptak",
        };
        if self.robust { format!("{}_robust", base) } else { base.to_string() }
    }

    fn evaluate(
        &self,
        cluster: &Cluster,
        covariates: &CovariateTable,
        formula: &Formula,
        term: &str,
        _rng: &mut ChaCha8Rng,
    ) -> Result<ScoreResult> {
        let design = formula.design(covariates)?;
        let j = design.term_column(term)?;
        let sites = fit_sites(cluster, &design, j, self.robust, &self.options)?;

        let p_values: Vec<f64> = sites.iter().map(|s| s.p_value).collect();
        let correlation = match self.combination {
            Combination::ZScore => None,
            Combination::StoufferLiptak => {
                let residuals: Vec<Vec<f64>> = sites.iter().map(|s| s.residuals.clone()).collect();
                Some(residual_correlation(&residuals))
            }
        };
        let z = stouffer(&p_values, correlation.as_ref())?;

        let coefficient = sites.iter().map(|s| s.coefficient).sum::<f64>() / sites.len() as f64;
        ScoreResult::fitted(normal_sf(z), z, coefficient)
    }
}

/// Normal quantile of `1 - p`, with `p` kept away from 0 and 1
pub fn p_to_z(p: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).unwrap();
    let p = p.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);
    -normal.inverse_cdf(p)
}

fn normal_sf(z: f64) -> f64 {
    Normal::new(0.0, 1.0).unwrap().sf(z)
}

/// Pearson correlation between the residual vectors of each pair of sites.
/// Negative or undefined correlations count as zero.
pub fn residual_correlation(residuals: &[Vec<f64>]) -> Array2<f64> {
    let k = residuals.len();
    Array2::from_shape_fn((k, k), |(a, b)| {
        if a == b {
            1.0
        } else {
            let r = pearson(&residuals[a], &residuals[b]);
            if r.is_nan() { 0.0 } else { r.clamp(0.0, 1.0) }
        }
    })
}

/// Combined z-score `sum(z) / sqrt(sum(R))`; without a correlation matrix the sites are
/// taken as independent and the denominator is `sqrt(k)`.
pub fn stouffer(p_values: &[f64], correlation: Option<&Array2<f64>>) -> Result<f64> {
    if p_values.is_empty() {
        return Err(DmrError::ModelFit("no site p-value to combine".to_string()));
    }
    if p_values.iter().any(|p| !p.is_finite()) {
        return Err(DmrError::ModelFit("non-finite site p-value".to_string()));
    }

    let sum_z: f64 = p_values.iter().map(|&p| p_to_z(p)).sum();
    let denominator = match correlation {
        Some(r) => r.sum(),
        None => p_values.len() as f64,
    };
    Ok(sum_z / denominator.sqrt())
}
