//! Region-level statistical methods.
//!
//! Every method consumes one cluster, the covariates, the formula and the term of interest,
//! and produces one region p-value. The evaluator only sees the `DmrMethod` trait.

pub mod bumphunt;
pub mod combined;
pub mod gee;
pub mod mixed;

use std::time::Duration;

use ndarray::{Array1, Array2};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;
use crate::covariate::CovariateTable;
use crate::error::{DmrError, Result};
use crate::formula::{Design, Formula};
use crate::param::{BumpMetricKind, MethodKind, Param};
use crate::regression::{huber, ols};

pub use bumphunt::{BumpHunt, BumpMetric};
pub use combined::{Combination, CombinedPValue};
pub use gee::Gee;
pub use mixed::MixedModel;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScoreResult {
    Fitted {
        p_value: f64,
        statistic: f64,
        coefficient: f64,
    },
    NonConvergent {
        reason: String,
    },
}

impl ScoreResult {
    /// A fitted score; the p-value must be finite and is clamped into [0, 1]
    pub fn fitted(p_value: f64, statistic: f64, coefficient: f64) -> Result<ScoreResult> {
        if !p_value.is_finite() {
            return Err(DmrError::ModelFit(format!("non-finite p-value {}", p_value)));
        }
        Ok(ScoreResult::Fitted {
            p_value: p_value.clamp(0.0, 1.0),
            statistic,
            coefficient,
        })
    }

    pub fn p_value(&self) -> Option<f64> {
        match self {
            ScoreResult::Fitted { p_value, .. } => Some(*p_value),
            ScoreResult::NonConvergent { .. } => None,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, ScoreResult::Fitted { .. })
    }
}

pub trait DmrMethod: Send + Sync {
    fn name(&self) -> String;

    /// Scores one cluster. Fit failures are returned as `DmrError::ModelFit`; any other error
    /// is fatal for the run. `rng` is only drawn from by resampling-based methods.
    fn evaluate(
        &self,
        cluster: &Cluster,
        covariates: &CovariateTable,
        formula: &Formula,
        term: &str,
        rng: &mut ChaCha8Rng,
    ) -> Result<ScoreResult>;
}

/// Iteration and time limits shared by the iterative fits.
///
/// `timeout` bounds the whole fit of one cluster: the REML search, the GEE iterations and
/// the bump resampling. Huber IRLS runs inside those loops and is bounded by `max_iter`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitOptions {
    pub max_iter: usize,
    pub tolerance: f64,
    pub timeout: Duration,
}

impl FitOptions {
    pub fn from_param(param: &Param) -> FitOptions {
        FitOptions {
            max_iter: param.evaluation.max_iter,
            tolerance: param.evaluation.tolerance,
            timeout: Duration::from_secs_f64(param.evaluation.fit_timeout_secs),
        }
    }
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            max_iter: 100,
            tolerance: 1e-6,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Instantiates the configured method
pub fn build_method(kind: MethodKind, param: &Param) -> Box<dyn DmrMethod> {
    let options = FitOptions::from_param(param);
    match kind {
        MethodKind::gee => Box::new(Gee::new(false, options)),
        MethodKind::gee_robust => Box::new(Gee::new(true, options)),
        MethodKind::mixed_model => Box::new(MixedModel::new(false, options)),
        MethodKind::mixed_model_robust => Box::new(MixedModel::new(true, options)),
        MethodKind::liptak => Box::new(CombinedPValue::new(Combination::StoufferLiptak, false, options)),
        MethodKind::liptak_robust => Box::new(CombinedPValue::new(Combination::StoufferLiptak, true, options)),
        MethodKind::zscore => Box::new(CombinedPValue::new(Combination::ZScore, false, options)),
        MethodKind::zscore_robust => Box::new(CombinedPValue::new(Combination::ZScore, true, options)),
        MethodKind::bumphunt => {
            let metric = match param.bumphunt.metric {
                BumpMetricKind::area => BumpMetric::Area,
                BumpMetricKind::sum => BumpMetric::Sum,
                BumpMetricKind::max => BumpMetric::Max,
                BumpMetricKind::mean => BumpMetric::Mean,
            };
            Box::new(BumpHunt::new(
                param.bumphunt.bandwidth,
                metric,
                param.bumphunt.n_resamples,
                options.timeout,
            ))
        }
    }
}

/// Fails fatally when the cluster and the covariates disagree on the number of samples
pub(crate) fn check_alignment(cluster: &Cluster, design: &Design) -> Result<()> {
    if cluster.sample_len() != design.nrows() {
        return Err(DmrError::Alignment {
            sample: format!("{}:{}", cluster.chrom(), cluster.start()),
            message: format!(
                "cluster has {} sample values but covariates describe {} samples",
                cluster.sample_len(),
                design.nrows()
            ),
        });
    }
    Ok(())
}

/// All (sample, site) observations of a cluster, grouped by sample.
///
/// Predictors are the sample design followed by one indicator per site except the first,
/// so per-site baselines are absorbed and the term coefficient is shared across sites.
pub(crate) struct LongData {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    /// observations per group (the number of sites)
    pub m: usize,
    /// number of groups (samples)
    pub groups: usize,
}

impl LongData {
    pub fn build(cluster: &Cluster, design: &Design) -> Result<LongData> {
        check_alignment(cluster, design)?;
        let n = design.nrows();
        let p = design.ncols();
        let m = cluster.len();
        let features = cluster.features();

        let y = Array1::from_shape_fn(n * m, |r| features[r % m].values[r / m]);
        let x = Array2::from_shape_fn((n * m, p + m - 1), |(r, c)| {
            let (sample, site) = (r / m, r % m);
            if c < p {
                design.matrix[[sample, c]]
            } else if c - p + 1 == site {
                1.0
            } else {
                0.0
            }
        });

        Ok(LongData { x, y, m, groups: n })
    }

    pub fn nobs(&self) -> usize {
        self.y.len()
    }

    pub fn ncoef(&self) -> usize {
        self.x.ncols()
    }
}

/// Per-site fit of the sample design on one site's values
pub(crate) struct SiteFit {
    pub coefficient: f64,
    pub p_value: f64,
    pub residuals: Vec<f64>,
}

pub(crate) fn fit_sites(
    cluster: &Cluster,
    design: &Design,
    term: usize,
    robust: bool,
    options: &FitOptions,
) -> Result<Vec<SiteFit>> {
    check_alignment(cluster, design)?;
    cluster
        .features()
        .iter()
        .map(|feature| {
            let y = Array1::from(feature.values.clone());
            let fit = if robust {
                huber(&design.matrix, &y, options.max_iter, options.tolerance)?
            } else {
                ols(&design.matrix, &y)?
            };
            let (_, p_value) = fit.t_test(term)?;
            Ok(SiteFit {
                coefficient: fit.coefficients[term],
                p_value,
                residuals: fit.residuals.to_vec(),
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::covariate::CovariateColumn;
    use crate::feature::Feature;

    /// 8 samples, half cases; `effect` is added to cases at every site
    pub fn create_test_cluster(effect: f64, n_sites: usize) -> (Cluster, CovariateTable) {
        let disease = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let age = vec![31.0, 45.0, 52.0, 38.0, 60.0, 29.0, 47.0, 55.0];
        let noise = [0.013, -0.021, 0.008, 0.017, -0.011, 0.004, -0.016, 0.009];
        let sample_shift = [0.02, -0.01, 0.015, 0.0, -0.02, 0.01, -0.005, 0.012];

        let features = (0..n_sites)
            .map(|j| {
                let values = (0..8)
                    .map(|i| {
                        0.4 + 0.03 * j as f64
                            + sample_shift[i]
                            + effect * disease[i]
                            + noise[(i + 3 * j) % 8]
                    })
                    .collect();
                Feature::new("chr1", 1000 + 50 * j as u64, values)
            })
            .collect();

        let covariates = CovariateTable::new(
            (1..=8).map(|i| format!("s{}", i)).collect(),
            vec![
                ("disease".to_string(), CovariateColumn::Numeric(disease)),
                ("age".to_string(), CovariateColumn::Numeric(age)),
            ],
        )
        .unwrap();

        (Cluster::new(features).unwrap(), covariates)
    }

    #[test]
    fn test_score_result() {
        let s = ScoreResult::fitted(1.0000000001, 2.0, 0.1).unwrap();
        assert_eq!(s.p_value(), Some(1.0), "p-values are clamped into [0, 1]");
        assert!(s.is_converged());
        assert!(ScoreResult::fitted(f64::NAN, 0.0, 0.0).is_err());
        let nc = ScoreResult::NonConvergent { reason: "x".to_string() };
        assert_eq!(nc.p_value(), None);
    }

    #[test]
    fn test_long_data_layout() {
        let (cluster, covariates) = create_test_cluster(0.1, 3);
        let design = Formula::parse("y ~ disease").unwrap().design(&covariates).unwrap();
        let long = LongData::build(&cluster, &design).unwrap();

        assert_eq!(long.nobs(), 24, "8 samples x 3 sites");
        assert_eq!(long.ncoef(), 4, "intercept, disease and two site indicators");
        assert_eq!(long.y[4], cluster.features()[1].values[1], "row 4 is sample 1, site 1");
        assert_eq!(long.x.row(4).to_vec(), vec![1.0, 0.0, 1.0, 0.0]);
        assert_eq!(long.x.row(5).to_vec(), vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_alignment_mismatch_is_fatal() {
        let (cluster, covariates) = create_test_cluster(0.1, 3);
        let fewer = covariates.align(&covariates.samples()[..6]).unwrap();
        let design = Formula::parse("y ~ disease").unwrap().design(&fewer).unwrap();
        assert!(matches!(LongData::build(&cluster, &design), Err(DmrError::Alignment { .. })));
        assert!(matches!(fit_sites(&cluster, &design, 1, false, &FitOptions::default()), Err(DmrError::Alignment { .. })));
    }

    #[test]
    fn test_fit_sites_detects_effect() {
        let (cluster, covariates) = create_test_cluster(0.2, 4);
        let design = Formula::parse("y ~ disease").unwrap().design(&covariates).unwrap();
        let fits = fit_sites(&cluster, &design, 1, false, &FitOptions::default()).unwrap();
        assert_eq!(fits.len(), 4);
        for fit in fits.iter() {
            assert!((fit.coefficient - 0.2).abs() < 0.05, "per-site effect close to 0.2, got {}", fit.coefficient);
            assert!(fit.p_value < 1e-3);
            assert_eq!(fit.residuals.len(), 8);
        }
    }
}
