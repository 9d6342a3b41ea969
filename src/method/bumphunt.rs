use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{Array1, Array2};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::cluster::Cluster;
use crate::covariate::CovariateTable;
use crate::error::{DmrError, Result};
use crate::formula::Formula;
use crate::method::{check_alignment, DmrMethod, ScoreResult};
use crate::regression::invert_spd;
use crate::utils::tricube;

/// Summary of the smoothed per-site coefficients of a region
#[derive(Clone)]
pub enum BumpMetric {
    /// sum of absolute smoothed coefficients
    Area,
    Sum,
    /// largest absolute smoothed coefficient
    Max,
    Mean,
    Custom(Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>),
}

impl BumpMetric {
    pub fn apply(&self, smoothed: &[f64]) -> f64 {
        match self {
            BumpMetric::Area => smoothed.iter().map(|v| v.abs()).sum(),
            BumpMetric::Sum => smoothed.iter().sum(),
            BumpMetric::Max => smoothed.iter().fold(0.0_f64, |m, v| m.max(v.abs())),
            BumpMetric::Mean => smoothed.iter().sum::<f64>() / smoothed.len().max(1) as f64,
            BumpMetric::Custom(f) => f(smoothed),
        }
    }
}

impl fmt::Debug for BumpMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BumpMetric::Area => write!(f, "Area"),
            BumpMetric::Sum => write!(f, "Sum"),
            BumpMetric::Max => write!(f, "Max"),
            BumpMetric::Mean => write!(f, "Mean"),
            BumpMetric::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Bump hunting: per-site coefficients of the term, smoothed along the genome, summarised
/// into one statistic whose significance comes from permutations of the term.
pub struct BumpHunt {
    bandwidth: f64,
    metric: BumpMetric,
    n_resamples: usize,
    timeout: Duration,
}

impl BumpHunt {
    /// # Arguments
    ///
    /// * `bandwidth` - half-width in bp of the tricube smoothing window
    /// * `metric` - summary of the smoothed coefficients
    /// * `n_resamples` - permutations of the term drawn for the null distribution
    /// * `timeout` - time allowed to the resampling of one cluster
    pub fn new(bandwidth: f64, metric: BumpMetric, n_resamples: usize, timeout: Duration) -> BumpHunt {
        BumpHunt { bandwidth, metric, n_resamples, timeout }
    }

    /// Region statistic for one design matrix
    fn statistic(&self, design: &Array2<f64>, term: usize, values: &Array2<f64>, positions: &[u64]) -> Result<(f64, f64)> {
        let coefficients = term_coefficients(design, term, values)?;
        let smoothed = smooth(&coefficients, positions, self.bandwidth);
        let statistic = self.metric.apply(&smoothed);
        if !statistic.is_finite() {
            return Err(DmrError::ModelFit(format!("non-finite bump statistic {}", statistic)));
        }
        Ok((statistic, coefficients.mean().unwrap_or(0.0)))
    }
}

impl DmrMethod for BumpHunt {
    fn name(&self) -> String {
        "bumphunt".to_string()
    }

    fn evaluate(
        &self,
        cluster: &Cluster,
        covariates: &CovariateTable,
        formula: &Formula,
        term: &str,
        rng: &mut ChaCha8Rng,
    ) -> Result<ScoreResult> {
        let design = formula.design(covariates)?;
        let j = design.term_column(term)?;
        check_alignment(cluster, &design)?;

        // samples x sites
        let features = cluster.features();
        let values = Array2::from_shape_fn((design.nrows(), cluster.len()), |(i, k)| features[k].values[i]);
        let positions = cluster.positions();

        let (observed, coefficient) = self.statistic(&design.matrix, j, &values, &positions)?;

        let mut permuted = design.matrix.clone();
        let original = design.matrix.column(j).to_vec();
        let mut order: Vec<usize> = (0..design.nrows()).collect();
        let mut exceed = 0;
        let start = Instant::now();
        for resample in 0..self.n_resamples {
            if start.elapsed() >= self.timeout {
                return Err(DmrError::ModelFit(format!(
                    "bump resampling exceeded {:?} after {} of {} permutations",
                    self.timeout, resample, self.n_resamples
                )));
            }
            order.shuffle(rng);
            for (i, &src) in order.iter().enumerate() {
                permuted[[i, j]] = original[src];
            }
            // a permutation may leave the term collinear with the other predictors
            match self.statistic(&permuted, j, &values, &positions) {
                Ok((null, _)) if null.abs() >= observed.abs() => exceed += 1,
                Ok(_) => {}
                Err(DmrError::ModelFit(_)) => exceed += 1,
                Err(e) => return Err(e),
            }
        }

        let p_value = (1 + exceed) as f64 / (1 + self.n_resamples) as f64;
        ScoreResult::fitted(p_value, observed, coefficient)
    }
}

/// Least squares coefficient of column `term` for every site (column of `values`)
fn term_coefficients(design: &Array2<f64>, term: usize, values: &Array2<f64>) -> Result<Array1<f64>> {
    if design.nrows() <= design.ncols() {
        return Err(DmrError::ModelFit(format!(
            "{} samples cannot fit {} coefficients",
            design.nrows(),
            design.ncols()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DmrError::ModelFit("non-finite methylation value".to_string()));
    }
    let hat = invert_spd(&design.t().dot(design))?.dot(&design.t());
    Ok(hat.row(term).dot(values))
}

/// Tricube-weighted running average over genomic positions
pub fn smooth(values: &Array1<f64>, positions: &[u64], bandwidth: f64) -> Vec<f64> {
    positions
        .iter()
        .map(|&center| {
            let (weighted, total) = positions.iter().zip(values.iter()).fold((0.0, 0.0), |(s, t), (&pos, &v)| {
                let distance = (pos as f64 - center as f64).abs();
                let w = if bandwidth > 0.0 { tricube(distance / bandwidth) } else if distance == 0.0 { 1.0 } else { 0.0 };
                (s + w * v, t + w)
            });
            weighted / total
        })
        .collect()
}
