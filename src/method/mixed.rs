use argmin::{
    core::{CostFunction, Error as ArgminError, Executor, State, TerminationReason},
    solver::brent::BrentOpt,
};
use log::trace;
use rand_chacha::ChaCha8Rng;

use crate::cluster::Cluster;
use crate::covariate::CovariateTable;
use crate::error::{DmrError, Result};
use crate::formula::Formula;
use crate::method::{DmrMethod, FitOptions, LongData, ScoreResult};
use crate::regression::{cholesky, huber, log_det_cholesky, ols, two_sided_t_p_value, whiten, Exchangeable, LinearFit};

/// upper end of the intra-sample correlation search
const RHO_MAX: f64 = 1.0 - 1e-6;

/// Linear mixed model with a random intercept per sample.
///
/// The random intercept makes the sites of a sample exchangeably correlated with
/// `rho = var(intercept) / (var(intercept) + var(error))`; `rho` is estimated by REML and the
/// term is tested with a t-test on the between-sample degrees of freedom.
pub struct MixedModel {
    robust: bool,
    options: FitOptions,
}

#[derive(Clone, Debug)]
pub struct MixedFit {
    pub rho: f64,
    pub fit: LinearFit,
    /// -2 REML log-likelihood, up to a constant
    pub objective: f64,
}

// Profiled REML criterion as a function of the intra-sample correlation
struct RemlProfile<'a> {
    long: &'a LongData,
}

impl RemlProfile<'_> {
    fn evaluate(&self, rho: f64) -> Result<f64> {
        let long = self.long;
        let block = Exchangeable::new(rho, long.m);
        let (xw, yw) = whiten(&long.x, &long.y, block);
        let fit = ols(&xw, &yw)?;

        let df = fit.df_residual as f64;
        let rss = fit.residuals.dot(&fit.residuals);
        let l = cholesky(&xw.t().dot(&xw))
            .ok_or_else(|| DmrError::ModelFit("singular design matrix".to_string()))?;

        Ok(df * (rss / df).ln() + long.groups as f64 * block.log_det() + log_det_cholesky(&l))
    }
}

impl CostFunction for RemlProfile<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, rho: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        Ok(self.evaluate(*rho)?)
    }
}

impl MixedModel {
    pub fn new(robust: bool, options: FitOptions) -> MixedModel {
        MixedModel { robust, options }
    }

    pub(crate) fn fit(&self, long: &LongData) -> Result<MixedFit> {
        let profile = RemlProfile { long };

        let rho = if long.m < 2 {
            0.0
        } else {
            let solver = BrentOpt::new(0.0, RHO_MAX);
            let res = Executor::new(RemlProfile { long }, solver)
                .configure(|state| state.max_iters(self.options.max_iter as u64))
                .timeout(self.options.timeout)
                .run()
                .map_err(|e| DmrError::ModelFit(format!("REML optimisation failed: {}", e)))?;

            match res.state.get_termination_reason() {
                Some(TerminationReason::SolverConverged) => {}
                Some(reason) => {
                    return Err(DmrError::ModelFit(format!("REML optimisation stopped: {:?}", reason)))
                }
                None => return Err(DmrError::ModelFit("REML optimisation did not terminate".to_string())),
            }
            res.state
                .param
                .ok_or_else(|| DmrError::ModelFit("REML optimisation returned no estimate".to_string()))?
        };

        let objective = profile.evaluate(rho)?;
        let (xw, yw) = whiten(&long.x, &long.y, Exchangeable::new(rho, long.m));
        let fit = if self.robust {
            huber(&xw, &yw, self.options.max_iter, self.options.tolerance)?
        } else {
            ols(&xw, &yw)?
        };
        trace!("mixed model rho={:.4} objective={:.4}", rho, objective);

        Ok(MixedFit { rho, fit, objective })
    }
}

impl DmrMethod for MixedModel {
    fn name(&self) -> String {
        if self.robust { "mixed_model_robust".to_string() } else { "mixed_model".to_string() }
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

        // a sample-level term is only replicated across samples
        let df = design.nrows().saturating_sub(design.ncols());
        if df == 0 {
            return Err(DmrError::ModelFit(format!(
                "{} samples leave no degrees of freedom for {} sample-level coefficients",
                design.nrows(),
                design.ncols()
            )));
        }

        let mixed = self.fit(&long)?;
        let se = mixed.fit.std_error(j);
        if !(se > 0.0) || !se.is_finite() {
            return Err(DmrError::ModelFit(format!("zero standard error for '{}'", term)));
        }
        let coefficient: f64 = mixed.fit.coefficients[j];
        let t = coefficient / se;
        ScoreResult::fitted(two_sided_t_p_value(t, df as f64), t, coefficient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Feature;
    use crate::covariate::CovariateColumn;
    use crate::method::tests::create_test_cluster;
    use rand::SeedableRng;

    fn create_random_intercept_cluster() -> (Cluster, CovariateTable) {
        // large per-sample offsets, small within-sample noise
        let offsets = [0.30, -0.25, 0.10, -0.05, 0.20, -0.30, 0.05, -0.15, 0.25, -0.10];
        let noise = [0.01, -0.02, 0.015, -0.005, 0.0];
        let features = (0..5)
            .map(|j| {
                let values = (0..10).map(|i| 0.5 + offsets[i] + noise[(i + 2 * j) % 5]).collect();
                Feature::new("chr2", 500 + 20 * j as u64, values)
            })
            .collect();
        let covariates = CovariateTable::new(
            (0..10).map(|i| format!("s{}", i)).collect(),
            vec![("disease".to_string(), CovariateColumn::Numeric((0..10).map(|i| (i % 2) as f64).collect()))],
        )
        .unwrap();
        (Cluster::new(features).unwrap(), covariates)
    }

    #[test]
    fn test_reml_finds_strong_intra_sample_correlation() {
        let (cluster, covariates) = create_random_intercept_cluster();
        let design = Formula::parse("y ~ disease").unwrap().design(&covariates).unwrap();
        let long = LongData::build(&cluster, &design).unwrap();

        let mixed = MixedModel::new(false, FitOptions::default()).fit(&long).unwrap();
        assert!(mixed.rho > 0.8, "per-sample offsets dominate the noise, got rho={}", mixed.rho);
        assert!(mixed.rho <= RHO_MAX);

        let profile = RemlProfile { long: &long };
        assert!(mixed.objective <= profile.evaluate(0.0).unwrap() + 1e-9, "the estimate must not be worse than independence");
    }

    #[test]
    fn test_mixed_model_detects_shift() {
        let (cluster, covariates) = create_test_cluster(0.2, 4);
        let formula = Formula::parse("methylation ~ disease + age").unwrap();
        for robust in [false, true] {
            let method = MixedModel::new(robust, FitOptions::default());
            let p = method
                .evaluate(&cluster, &covariates, &formula, "disease", &mut ChaCha8Rng::seed_from_u64(1))
                .unwrap()
                .p_value()
                .unwrap();
            assert!(p < 1e-3, "{} must detect a 0.2 shift, got p={}", method.name(), p);
        }
    }

    #[test]
    fn test_mixed_model_iteration_limit_is_model_fit_error() {
        let (cluster, covariates) = create_test_cluster(0.2, 4);
        let formula = Formula::parse("methylation ~ disease").unwrap();
        let method = MixedModel::new(false, FitOptions { max_iter: 1, ..FitOptions::default() });
        let result = method.evaluate(&cluster, &covariates, &formula, "disease", &mut ChaCha8Rng::seed_from_u64(1));
        assert!(matches!(result, Err(DmrError::ModelFit(_))), "an unfinished search must not produce a p-value");
    }

    #[test]
    fn test_mixed_model_names() {
        assert_eq!(MixedModel::new(false, FitOptions::default()).name(), "mixed_model");
        assert_eq!(MixedModel::new(true, FitOptions::default()).name(), "mixed_model_robust");
    }
}
