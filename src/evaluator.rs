use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;
use crate::covariate::CovariateTable;
use crate::error::{DmrError, Result};
use crate::formula::Formula;
use crate::method::{DmrMethod, ScoreResult};
use crate::param::Param;
use crate::utils::generate_seeds;

/// Label assignment a cluster is evaluated under
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// covariates as supplied
    True,
    /// term of interest permuted across samples
    False,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::True => write!(f, "true"),
            Condition::False => write!(f, "false"),
        }
    }
}

/// Threshold counts of one method under one condition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub method: String,
    pub condition: Condition,
    pub alphas: Vec<f64>,
    /// `counts[i]` clusters have a p-value below `alphas[i]`
    pub counts: Vec<usize>,
    /// one entry per evaluated cluster in stream order, `None` for non-convergent fits
    pub p_values: Vec<Option<f64>>,
    pub n_clusters: usize,
    pub n_failed: usize,
}

impl EvaluationResult {
    pub fn new(method: &str, condition: Condition, alphas: &[f64], p_values: Vec<Option<f64>>) -> EvaluationResult {
        let counts = alphas.iter().map(|&alpha| count_below(&p_values, alpha)).collect();
        let n_failed = p_values.iter().filter(|p| !matches!(p, Some(v) if v.is_finite())).count();
        EvaluationResult {
            method: method.to_string(),
            condition,
            alphas: alphas.to_vec(),
            counts,
            n_clusters: p_values.len(),
            n_failed,
            p_values,
        }
    }

    pub fn count_at(&self, alpha: f64) -> Option<usize> {
        self.alphas.iter().position(|&a| a == alpha).map(|i| self.counts[i])
    }
}

/// Number of p-values strictly below `alpha`; missing and NaN p-values never count
pub fn count_below(p_values: &[Option<f64>], alpha: f64) -> usize {
    p_values
        .iter()
        .filter(|p| matches!(p, Some(v) if v.is_finite() && *v < alpha))
        .count()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodEvaluation {
    pub method: String,
    pub true_condition: EvaluationResult,
    pub false_condition: EvaluationResult,
}

impl MethodEvaluation {
    pub fn into_results(self) -> Vec<EvaluationResult> {
        vec![self.true_condition, self.false_condition]
    }
}

/// Evaluates a method on real and on label-permuted covariates over the same cluster stream.
///
/// The first `n_true` clusters of the stream form the true set, the next `n_false` the false
/// set. Clusters with fewer than `min_size` sites are skipped whatever builder produced them.
/// Every cluster gets its own generator, seeded from a master generator in stream
/// order, so results do not depend on the number of threads.
#[derive(Clone, Debug, PartialEq)]
pub struct PermutationEvaluator {
    pub alphas: Vec<f64>,
    pub n_true: usize,
    pub n_false: usize,
    pub min_size: usize,
    pub seed: u64,
    pub thread_number: usize,
}

impl PermutationEvaluator {
    pub fn new(alphas: Vec<f64>, n_true: usize, n_false: usize, min_size: usize, seed: u64, thread_number: usize) -> Self {
        PermutationEvaluator { alphas, n_true, n_false, min_size, seed, thread_number }
    }

    pub fn from_param(param: &Param) -> Self {
        Self::new(
            param.evaluation.alphas.clone(),
            param.evaluation.n_true,
            param.evaluation.n_false,
            param.cluster.min_size,
            param.general.seed,
            param.general.thread_number,
        )
    }

    /// Scores `method` on the true and the false set drawn from `clusters`.
    ///
    /// # Arguments
    ///
    /// * `clusters` - cluster stream, consumed up to `n_true + n_false` eligible clusters
    /// * `covariates` - covariates aligned on the sample order of the clusters
    /// * `formula` - model fitted by the method
    /// * `term` - term of interest, permuted for the false set
    /// * `method` - method under evaluation
    /// * `running` - cleared to stop the evaluation
    ///
    /// # Returns
    ///
    /// The threshold counts of both conditions. A fit failure becomes a non-convergent score
    /// counted in `n_failed`; any other error, or a cleared `running` flag, aborts.
    pub fn evaluate_method<I>(
        &self,
        clusters: I,
        covariates: &CovariateTable,
        formula: &Formula,
        term: &str,
        method: &dyn DmrMethod,
        running: Arc<AtomicBool>,
    ) -> Result<MethodEvaluation>
    where
        I: IntoIterator<Item = Result<Cluster>>,
    {
        let name = method.name();
        let mut clusters = clusters.into_iter();

        let true_set = take_clusters(&mut clusters, self.n_true, self.min_size, &running)?;
        let false_set = take_clusters(&mut clusters, self.n_false, self.min_size, &running)?;
        if true_set.len() < self.n_true || false_set.len() < self.n_false {
            info!(
                "{}: cluster stream exhausted, evaluating {} true and {} false clusters",
                name,
                true_set.len(),
                false_set.len()
            );
        }

        let mut master = ChaCha8Rng::seed_from_u64(self.seed);
        let seeds = generate_seeds(true_set.len() + false_set.len(), &mut master);

        let tasks: Vec<(Condition, &Cluster, u64)> = true_set
            .iter()
            .map(|c| (Condition::True, c))
            .chain(false_set.iter().map(|c| (Condition::False, c)))
            .zip(seeds)
            .map(|((condition, cluster), seed)| (condition, cluster, seed))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.thread_number)
            .build()
            .map_err(|e| DmrError::Config(format!("cannot build a pool of {} threads: {}", self.thread_number, e)))?;

        let scores: Vec<ScoreResult> = pool.install(|| {
            tasks
                .par_iter()
                .map(|&(condition, cluster, seed)| {
                    if !running.load(Ordering::Relaxed) {
                        return Err(DmrError::Interrupted);
                    }
                    score_cluster(method, cluster, covariates, formula, term, condition, seed)
                })
                .collect::<Result<Vec<ScoreResult>>>()
        })?;

        let (true_scores, false_scores) = scores.split_at(true_set.len());
        let p_values = |scores: &[ScoreResult]| scores.iter().map(|s| s.p_value()).collect::<Vec<_>>();

        let evaluation = MethodEvaluation {
            method: name.clone(),
            true_condition: EvaluationResult::new(&name, Condition::True, &self.alphas, p_values(true_scores)),
            false_condition: EvaluationResult::new(&name, Condition::False, &self.alphas, p_values(false_scores)),
        };

        for result in [&evaluation.true_condition, &evaluation.false_condition] {
            if result.n_failed > 0 {
                warn!(
                    "{}: {}/{} {} clusters did not converge and are excluded from the counts",
                    name, result.n_failed, result.n_clusters, result.condition
                );
            }
        }

        Ok(evaluation)
    }
}

fn take_clusters<I>(clusters: &mut I, n: usize, min_size: usize, running: &AtomicBool) -> Result<Vec<Cluster>>
where
    I: Iterator<Item = Result<Cluster>>,
{
    let mut taken = Vec::with_capacity(n);
    while taken.len() < n {
        let Some(cluster) = clusters.next() else { break };
        if !running.load(Ordering::Relaxed) {
            return Err(DmrError::Interrupted);
        }
        let cluster = cluster?;
        if cluster.len() < min_size {
            debug!(
                "Skipping {}:{}-{}, {} site(s) below min_size={}",
                cluster.chrom(),
                cluster.start(),
                cluster.end(),
                cluster.len(),
                min_size
            );
            continue;
        }
        taken.push(cluster);
    }
    Ok(taken)
}

fn score_cluster(
    method: &dyn DmrMethod,
    cluster: &Cluster,
    covariates: &CovariateTable,
    formula: &Formula,
    term: &str,
    condition: Condition,
    seed: u64,
) -> Result<ScoreResult> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let covariates = match condition {
        Condition::True => Cow::Borrowed(covariates),
        Condition::False => Cow::Owned(covariates.permute(term, &mut rng)?),
    };

    match method.evaluate(cluster, &covariates, formula, term, &mut rng) {
        Ok(score) => Ok(score),
        Err(e) if e.is_recoverable() => {
            debug!("{} {}:{}-{} ({}): {}", method.name(), cluster.chrom(), cluster.start(), cluster.end(), condition, e);
            Ok(ScoreResult::NonConvergent { reason: e.to_string() })
        }
        Err(e) => Err(e),
    }
}
