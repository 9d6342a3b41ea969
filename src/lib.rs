pub mod aggregate;
pub mod cluster;
pub mod covariate;
pub mod error;
pub mod evaluator;
pub mod feature;
pub mod formula;
pub mod method;
pub mod param;
pub mod regression;
pub mod utils;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::Local;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::aggregate::{display_comparison, pivot, to_long, write_tsv, ComparisonRow, CountRow};
use crate::cluster::{ClusterSource, CorrelatedClusterBuilder, FileClusterSource};
use crate::covariate::CovariateTable;
use crate::error::Result;
use crate::evaluator::{EvaluationResult, PermutationEvaluator};
use crate::formula::Formula;
use crate::method::build_method;
use crate::param::Param;

/// Outcome of a run: the per-condition counts of every method and their comparison
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
    /// Run ID, i.e. timestamp
    pub id: String,
    /// dmreval version and git hash used
    pub version: String,
    pub timestamp: String,
    /// seconds
    pub execution_time: f64,
    pub parameters: Param,
    pub results: Vec<EvaluationResult>,
    pub comparison: Vec<ComparisonRow>,
}

impl Report {
    pub fn long_rows(&self) -> Vec<CountRow> {
        to_long(&self.results)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, self)?;
        info!("Report saved to {}", path.as_ref().display());
        Ok(())
    }

    /// Writes the tables requested in the `output` section
    pub fn write_tables(&self) -> Result<()> {
        let output = &self.parameters.output;
        if !output.long_table.is_empty() {
            write_tsv(&self.long_rows(), &output.long_table)?;
        }
        if !output.comparison_table.is_empty() {
            write_tsv(&self.comparison, &output.comparison_table)?;
        }
        Ok(())
    }

    pub fn display(&self, colorful: bool) -> String {
        format!(
            "Report {} ({}), {:.2}s\n{}",
            self.id,
            self.version,
            self.execution_time,
            display_comparison(&self.comparison, colorful)
        )
    }
}

pub fn version() -> String {
    format!("{}#{}", env!("CARGO_PKG_VERSION"), option_env!("DMREVAL_GIT_SHA").unwrap_or("unknown"))
}

/// Runs the whole evaluation described by `param`.
///
/// Loads the covariates, builds clusters from the methylation matrix, evaluates every
/// configured method on the true and the false sets and pairs the counts.
///
/// # Arguments
///
/// * `param` - validated parameters, see [`param::get`]
/// * `running` - flag checked between clusters, cleared by the signal handler of the binary
///
/// # Returns
///
/// A [`Report`] with the per-condition results and the comparison rows. Input, alignment,
/// formula and aggregation errors are fatal, as is an interruption; fit failures are not.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::atomic::AtomicBool;
/// # use std::sync::Arc;
/// let param = dmreval::param::get("param.yaml".to_string()).unwrap();
/// let report = dmreval::run(&param, Arc::new(AtomicBool::new(true))).unwrap();
/// println!("{}", report.display(false));
/// ```
pub fn run(param: &Param, running: Arc<AtomicBool>) -> Result<Report> {
    let start = std::time::Instant::now();
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    let covariates = CovariateTable::load(&param.data.covariates, &param.data.sample_column)?;

    let builder = CorrelatedClusterBuilder::new(
        param.cluster.max_dist,
        param.cluster.max_skip,
        param.cluster.rho_min,
        param.cluster.min_size,
    );
    let source = FileClusterSource::new(&param.data.methylation, builder)?;
    debug!("Methylation matrix {} with {} samples", param.data.methylation, source.samples().len());

    let results = evaluate_source(param, &source, &covariates, running)?;
    let comparison = pivot(&to_long(&results))?;

    Ok(Report {
        id: format!("dmreval_{}", timestamp),
        version: version(),
        timestamp,
        execution_time: start.elapsed().as_secs_f64(),
        parameters: param.clone(),
        results,
        comparison,
    })
}

/// Evaluates every configured method on a fresh cluster stream of `source`.
///
/// `covariates` are aligned on the samples of `source` first; the formula and the term of
/// interest are checked once before any cluster is read.
pub fn evaluate_source(
    param: &Param,
    source: &dyn ClusterSource,
    covariates: &CovariateTable,
    running: Arc<AtomicBool>,
) -> Result<Vec<EvaluationResult>> {
    let covariates = covariates.align(source.samples())?;
    cinfo!(param.general.display_colorful, "\x1b[2;97m{:?}\x1b[0m", covariates);

    let term = param.evaluation.term.as_str();
    let formula = Formula::parse(&param.evaluation.formula)?;
    formula.check_term(term)?;
    formula.design(&covariates)?.term_column(term)?;

    let evaluator = PermutationEvaluator::from_param(param);
    let mut results = Vec::new();
    for &kind in param.evaluation.methods.iter() {
        let method = build_method(kind, param);
        cinfo!(
            param.general.display_colorful,
            "\x1b[1;96mEvaluating {}\x1b[0m on {} true and {} false clusters...",
            method.name(),
            evaluator.n_true,
            evaluator.n_false
        );

        let evaluation = evaluator.evaluate_method(
            source.clusters()?,
            &covariates,
            &formula,
            term,
            method.as_ref(),
            Arc::clone(&running),
        )?;
        debug!(
            "{}: true counts {:?}, false counts {:?}",
            evaluation.method, evaluation.true_condition.counts, evaluation.false_condition.counts
        );
        results.extend(evaluation.into_results());
    }

    Ok(results)
}
