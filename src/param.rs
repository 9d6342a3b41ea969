use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;

use crate::error::{DmrError, Result};
use crate::formula::Formula;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum MethodKind {
    gee,
    gee_robust,
    mixed_model,
    mixed_model_robust,
    liptak,
    liptak_robust,
    zscore,
    zscore_robust,
    bumphunt,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[allow(non_camel_case_types)]
pub enum BumpMetricKind {
    area,
    sum,
    max,
    mean,
}

// Field definitions and associated default values

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Param {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub cluster: ClusterParam,
    #[serde(default)]
    pub evaluation: Evaluation,
    #[serde(default)]
    pub bumphunt: BumpHuntParam,
    #[serde(default)]
    pub output: Output,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct General {
    #[serde(default = "seed_default")]
    pub seed: u64,
    #[serde(default = "one_default")]
    pub thread_number: usize,
    #[serde(default = "empty_string")]
    pub log_base: String,
    #[serde(default = "log_suffix_default")]
    pub log_suffix: String,
    #[serde(default = "log_level_default")]
    pub log_level: String,
    #[serde(default = "true_default")]
    pub display_colorful: bool,
    #[serde(default = "empty_string")]
    pub save_report: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Data {
    #[serde(default = "empty_string")]
    pub methylation: String,
    #[serde(default = "empty_string")]
    pub covariates: String,
    #[serde(default = "sample_column_default")]
    pub sample_column: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClusterParam {
    #[serde(default = "max_dist_default")]
    pub max_dist: u64,
    #[serde(default = "max_skip_default")]
    pub max_skip: usize,
    #[serde(default = "rho_min_default")]
    pub rho_min: f64,
    #[serde(default = "min_size_default")]
    pub min_size: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Evaluation {
    #[serde(default = "formula_default")]
    pub formula: String,
    #[serde(default = "term_default")]
    pub term: String,
    #[serde(default = "methods_default")]
    pub methods: Vec<MethodKind>,
    #[serde(default = "n_clusters_default")]
    pub n_true: usize,
    #[serde(default = "n_clusters_default")]
    pub n_false: usize,
    #[serde(default = "alphas_default")]
    pub alphas: Vec<f64>,
    #[serde(default = "max_iter_default")]
    pub max_iter: usize,
    #[serde(default = "tolerance_default")]
    pub tolerance: f64,
    #[serde(default = "fit_timeout_secs_default")]
    pub fit_timeout_secs: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BumpHuntParam {
    #[serde(default = "bandwidth_default")]
    pub bandwidth: f64,
    #[serde(default = "metric_default")]
    pub metric: BumpMetricKind,
    #[serde(default = "n_resamples_default")]
    pub n_resamples: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Output {
    #[serde(default = "empty_string")]
    pub long_table: String,
    #[serde(default = "empty_string")]
    pub comparison_table: String,
}

// Default section definitions

impl Default for General {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Data {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for ClusterParam {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Evaluation {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for BumpHuntParam {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Output {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Param {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Param {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn get(param_file: String) -> Result<Param> {
    let param_file_reader = File::open(&param_file)?;
    let param_reader = BufReader::new(param_file_reader);

    let mut config: Param = serde_yaml::from_reader(param_reader)?;

    validate(&mut config)?;

    Ok(config)
}

pub fn validate(param: &mut Param) -> Result<()> {
    if !param.general.log_base.is_empty() {
        param.general.display_colorful = false;
    }

    if param.general.thread_number == 0 {
        return Err(DmrError::Config("general.thread_number must be >= 1".to_string()));
    }

    if param.data.methylation.is_empty() || param.data.covariates.is_empty() {
        return Err(DmrError::Config(
            "data.methylation and data.covariates must both be provided".to_string(),
        ));
    }

    validate_evaluation(&param.evaluation)?;

    if param.cluster.min_size < 1 {
        return Err(DmrError::Config("cluster.min_size must be >= 1".to_string()));
    }
    if param.cluster.rho_min > 1.0 {
        return Err(DmrError::Config(format!(
            "Invalid cluster.rho_min={:.3}. Must be <= 1 (values <= -1 disable the correlation gate).",
            param.cluster.rho_min
        )));
    }

    if param.evaluation.methods.contains(&MethodKind::bumphunt) {
        if !(param.bumphunt.bandwidth > 0.0) {
            return Err(DmrError::Config(format!(
                "Invalid bumphunt.bandwidth={}. Must be > 0.",
                param.bumphunt.bandwidth
            )));
        }
        let smallest = param.evaluation.alphas.iter().cloned().fold(f64::INFINITY, f64::min);
        let resolution = 1.0 / (1.0 + param.bumphunt.n_resamples as f64);
        if resolution > smallest {
            warn!(
                "bumphunt.n_resamples={} cannot produce p-values below {:.2e}: \
                the smallest alphas will always count zero bumphunt clusters",
                param.bumphunt.n_resamples, resolution
            );
        }
    }

    Ok(())
}

fn validate_evaluation(evaluation: &Evaluation) -> Result<()> {
    let formula = Formula::parse(&evaluation.formula)?;
    formula.check_term(&evaluation.term)?;

    if evaluation.methods.is_empty() {
        return Err(DmrError::Config("evaluation.methods must name at least one method".to_string()));
    }

    if evaluation.alphas.is_empty() {
        return Err(DmrError::Config("evaluation.alphas must not be empty".to_string()));
    }
    if let Some(alpha) = evaluation.alphas.iter().find(|a| !(**a > 0.0 && **a < 1.0)) {
        return Err(DmrError::Config(format!(
            "Invalid alpha={}. Each alpha must be in range (0, 1).",
            alpha
        )));
    }
    if evaluation.alphas.windows(2).any(|w| w[1] >= w[0]) {
        return Err(DmrError::Config(format!(
            "evaluation.alphas must be strictly descending, got {:?}",
            evaluation.alphas
        )));
    }

    if evaluation.max_iter == 0 {
        return Err(DmrError::Config("evaluation.max_iter must be >= 1".to_string()));
    }
    if !(evaluation.tolerance > 0.0) {
        return Err(DmrError::Config(format!(
            "Invalid evaluation.tolerance={}. Must be > 0.",
            evaluation.tolerance
        )));
    }
    if !(evaluation.fit_timeout_secs > 0.0) || !evaluation.fit_timeout_secs.is_finite() {
        return Err(DmrError::Config(format!(
            "Invalid evaluation.fit_timeout_secs={}. Must be a positive number of seconds.",
            evaluation.fit_timeout_secs
        )));
    }

    Ok(())
}

// Default value definitions

fn seed_default() -> u64 {
    4815162342
}
fn empty_string() -> String {
    "".to_string()
}
fn one_default() -> usize {
    1
}
fn true_default() -> bool {
    true
}
fn log_suffix_default() -> String {
    "log".to_string()
}
fn log_level_default() -> String {
    "info".to_string()
}
fn sample_column_default() -> String {
    "id".to_string()
}
fn max_dist_default() -> u64 {
    200
}
fn max_skip_default() -> usize {
    2
}
fn rho_min_default() -> f64 {
    0.5
}
fn min_size_default() -> usize {
    3
}
fn formula_default() -> String {
    "methylation ~ disease".to_string()
}
fn term_default() -> String {
    "disease".to_string()
}
fn methods_default() -> Vec<MethodKind> {
    vec![MethodKind::zscore]
}
fn n_clusters_default() -> usize {
    100
}
fn alphas_default() -> Vec<f64> {
    vec![1e-1, 1e-2, 1e-3, 1e-4, 1e-5, 1e-6]
}
fn max_iter_default() -> usize {
    100
}
fn tolerance_default() -> f64 {
    1e-6
}
fn fit_timeout_secs_default() -> f64 {
    30.0
}
fn bandwidth_default() -> f64 {
    100.0
}
fn metric_default() -> BumpMetricKind {
    BumpMetricKind::area
}
fn n_resamples_default() -> usize {
    200
}
