use std::time::Instant;

use log::trace;
use ndarray::{s, Array1, Array2, Axis};
use rand_chacha::ChaCha8Rng;

use crate::cluster::Cluster;
use crate::covariate::CovariateTable;
use crate::error::{DmrError, Result};
use crate::formula::Formula;
use crate::method::{DmrMethod, FitOptions, LongData, ScoreResult};
use crate::regression::{huber, invert_spd, ols, two_sided_normal_p_value, whiten, Exchangeable, LinearFit};

/// Generalized estimating equations with an exchangeable working correlation between the
/// sites of a sample. Inference on the term uses the sandwich variance.
pub struct Gee {
    robust: bool,
    options: FitOptions,
}

#[derive(Clone, Debug)]
pub struct GeeFit {
    pub coefficients: Array1<f64>,
    /// sandwich covariance of the coefficients
    pub covariance: Array2<f64>,
    pub rho: f64,
    pub iterations: usize,
}

impl Gee {
    pub fn new(robust: bool, options: FitOptions) -> Gee {
        Gee { robust, options }
    }

    fn whitened_fit(&self, xw: &Array2<f64>, yw: &Array1<f64>) -> Result<LinearFit> {
        if self.robust {
            huber(xw, yw, self.options.max_iter, self.options.tolerance)
        } else {
            ols(xw, yw)
        }
    }

    /// Alternates between the coefficients given the working correlation and the moment
    /// estimate of the correlation given the coefficients, within `max_iter` iterations and
    /// the `timeout` of the fit options.
    pub(crate) fn fit(&self, long: &LongData) -> Result<GeeFit> {
        let tolerance = self.options.tolerance;
        let start = Instant::now();
        let mut rho = 0.0;
        let mut previous: Option<Array1<f64>> = None;

        for iteration in 1..=self.options.max_iter {
            if start.elapsed() >= self.options.timeout {
                return Err(DmrError::ModelFit(format!(
                    "GEE exceeded {:?} after {} iterations",
                    self.options.timeout,
                    iteration - 1
                )));
            }
            let (xw, yw) = whiten(&long.x, &long.y, Exchangeable::new(rho, long.m));
            let fit = self.whitened_fit(&xw, &yw)?;
            let raw = &long.y - &long.x.dot(&fit.coefficients);
            let next_rho = moment_rho(&raw, long.m, long.groups, long.ncoef());

            let converged = previous.as_ref().map_or(false, |prev| {
                let delta = (prev - &fit.coefficients).iter().fold(0.0_f64, |m, d| m.max(d.abs()));
                let size = fit.coefficients.iter().fold(0.0_f64, |m, b| m.max(b.abs()));
                delta <= tolerance * (1.0 + size) && (next_rho - rho).abs() <= tolerance
            });

            if converged {
                trace!("GEE converged after {} iterations, rho={:.4}", iteration, rho);
                let weights = fit.weights.clone().unwrap_or_else(|| Array1::ones(yw.len()));
                let covariance = sandwich(&xw, &fit.residuals, &weights, long.m, long.groups)?;
                return Ok(GeeFit {
                    coefficients: fit.coefficients,
                    covariance,
                    rho,
                    iterations: iteration,
                });
            }

            previous = Some(fit.coefficients);
            rho = next_rho;
        }

        Err(DmrError::ModelFit(format!(
            "GEE did not converge in {} iterations",
            self.options.max_iter
        )))
    }
}

impl DmrMethod for Gee {
    fn name(&self) -> String {
        if self.robust { "gee_robust".to_string() } else { "gee".to_string() }
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
        let long = LongData::build(cluster, &design)?;
        let fit = self.fit(&long)?;

        let se = fit.covariance[[j, j]].max(0.0).sqrt();
        if !(se > 0.0) || !se.is_finite() {
            return Err(DmrError::ModelFit(format!("zero sandwich variance for '{}'", term)));
        }
        let coefficient = fit.coefficients[j];
        let z = coefficient / se;
        ScoreResult::fitted(two_sided_normal_p_value(z), z, coefficient)
    }
}

/// Moment estimate of the exchangeable correlation from raw residuals, kept inside the
/// positive definite range
pub(crate) fn moment_rho(residuals: &Array1<f64>, m: usize, groups: usize, p: usize) -> f64 {
    if m < 2 {
        return 0.0;
    }
    let n = residuals.len();
    let phi = residuals.dot(residuals) / n.saturating_sub(p).max(1) as f64;
    if !(phi > 0.0) {
        return 0.0;
    }

    let mut cross = 0.0;
    for g in 0..groups {
        let block = residuals.slice(s![g * m..(g + 1) * m]);
        let sum = block.sum();
        let squares = block.dot(&block);
        cross += (sum * sum - squares) / 2.0;
    }
    let pairs = (groups * m * (m - 1) / 2) as f64;
    let rho = cross / (phi * (pairs - p as f64).max(1.0));

    let (lower, upper) = Exchangeable::bounds(m);
    rho.clamp(lower + 1e-6, upper - 1e-6)
}

/// Bread-meat-bread covariance computed on whitened data, one score contribution per group
fn sandwich(xw: &Array2<f64>, rw: &Array1<f64>, w: &Array1<f64>, m: usize, groups: usize) -> Result<Array2<f64>> {
    let xtwx = xw.t().dot(&(xw * &w.view().insert_axis(Axis(1))));
    let bread = invert_spd(&xtwx)?;

    let p = xw.ncols();
    let mut meat = Array2::<f64>::zeros((p, p));
    for g in 0..groups {
        let rows = g * m..(g + 1) * m;
        let xg = xw.slice(s![rows.clone(), ..]);
        let score: Array1<f64> = xg.t().dot(&(&rw.slice(s![rows.clone()]) * &w.slice(s![rows])));
        let u = score.view().insert_axis(Axis(1));
        meat += &u.dot(&u.t());
    }

    Ok(bread.dot(&meat).dot(&bread))
}
