/// End-to-end tests of the evaluation workflow on generated files:
/// 1. Reading the methylation matrix and building clusters
/// 2. Aligning the covariates on the matrix samples
/// 3. Evaluating methods on true and permuted labels
/// 4. Aggregating counts into the long and comparison tables
///
/// Run with: cargo test --test test_evaluation_e2e -- --nocapture
use dmreval::cluster::{ClusterSource, CorrelatedClusterBuilder, FileClusterSource};
use dmreval::error::DmrError;
use dmreval::evaluator::Condition;
use dmreval::param::{MethodKind, Param};
use dmreval::run;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

const SAMPLES: [&str; 5] = ["s1", "s2", "s3", "s4", "s5"];
const DISEASE: [f64; 5] = [1.0, 1.0, 0.0, 0.0, 1.0];

/// One region of 4 sites spaced 50bp apart per chromosome, cases shifted by `effect`
fn write_methylation(dir: &Path, chroms: &[&str], effect: f64) -> String {
    let mut text = format!("probe\t{}\n", SAMPLES.join("\t"));
    for (c, chrom) in chroms.iter().enumerate() {
        for site in 0..4 {
            let values: Vec<String> = (0..5)
                .map(|i| {
                    let noise = 0.01 * (((i * 3 + site * 5 + c * 7) % 7) as f64 - 3.0);
                    format!("{:.4}", 0.3 + 0.05 * site as f64 + effect * DISEASE[i] + noise)
                })
                .collect();
            text.push_str(&format!("{}:{}\t{}\n", chrom, 1000 + 50 * site, values.join("\t")));
        }
        text.push('\n');
    }
    let path = dir.join("methylation.tsv");
    fs::write(&path, text).unwrap();
    path.to_string_lossy().to_string()
}

/// Covariates in another order than the matrix, with one extra sample
fn write_covariates(dir: &Path, samples: &[&str]) -> String {
    let mut text = "id\tdisease\tage\tgender\n".to_string();
    let rows = [
        ("s6", "0", "70", "F"),
        ("s5", "1", "44", "M"),
        ("s4", "0", "61", "F"),
        ("s3", "0", "39", "M"),
        ("s2", "1", "58", "F"),
        ("s1", "1", "35", "M"),
    ];
    for (id, disease, age, gender) in rows.iter().filter(|r| samples.contains(&r.0)) {
        text.push_str(&format!("{}\t{}\t{}\t{}\n", id, disease, age, gender));
    }
    let path = dir.join("covariates.tsv");
    fs::write(&path, text).unwrap();
    path.to_string_lossy().to_string()
}

fn create_test_params(dir: &TempDir, chroms: &[&str], methods: Vec<MethodKind>) -> Param {
    let mut param = Param::default();

    param.general.seed = 42;
    param.general.thread_number = 2;
    param.general.display_colorful = false;

    param.data.methylation = write_methylation(dir.path(), chroms, 0.2);
    param.data.covariates = write_covariates(dir.path(), &["s1", "s2", "s3", "s4", "s5", "s6"]);
    param.data.sample_column = "id".to_string();

    param.cluster.max_dist = 400;
    param.cluster.max_skip = 2;
    param.cluster.rho_min = -1.0;
    param.cluster.min_size = 3;

    param.evaluation.formula = "methylation ~ disease".to_string();
    param.evaluation.term = "disease".to_string();
    param.evaluation.methods = methods;
    param.evaluation.n_true = 1;
    param.evaluation.n_false = 1;

    param.bumphunt.n_resamples = 20;

    param.output.long_table = dir.path().join("long.tsv").to_string_lossy().to_string();
    param.output.comparison_table = dir.path().join("comparison.tsv").to_string_lossy().to_string();

    param
}

fn running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

#[test]
fn test_four_sites_form_one_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_methylation(dir.path(), &["chr1"], 0.2);
    let source = FileClusterSource::new(path, CorrelatedClusterBuilder::new(400, 2, -1.0, 3)).unwrap();

    assert_eq!(source.samples(), &SAMPLES.map(String::from));
    let clusters: Vec<_> = source.clusters().unwrap().collect::<Result<_, _>>().unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].len(), 4);
    assert_eq!(clusters[0].positions(), vec![1000, 1050, 1100, 1150]);

    let again: Vec<_> = source.clusters().unwrap().collect::<Result<_, _>>().unwrap();
    assert_eq!(again, clusters, "every request restarts the stream");
}

#[test]
fn test_end_to_end_zscore() {
    let dir = tempfile::tempdir().unwrap();
    let param = create_test_params(&dir, &["chr1", "chr2"], vec![MethodKind::zscore]);

    let report = run(&param, running()).unwrap();

    assert_eq!(report.results.len(), 2, "one true and one false result");
    let true_result = report.results.iter().find(|r| r.condition == Condition::True).unwrap();
    let false_result = report.results.iter().find(|r| r.condition == Condition::False).unwrap();
    for result in [true_result, false_result] {
        assert_eq!(result.method, "zscore");
        assert_eq!(result.p_values.len(), 1, "exactly one p-value per condition");
        let p = result.p_values[0].expect("a 4-site cluster must be scored");
        assert!((0.0..=1.0).contains(&p), "p-value {} outside [0, 1]", p);
    }
    assert!(true_result.p_values[0].unwrap() < 0.01, "the simulated shift must be detected");

    let long = report.long_rows();
    assert_eq!(long.len(), 12, "six alphas under two conditions");
    assert_eq!(report.comparison.len(), 6);
    let alphas: Vec<f64> = report.comparison.iter().map(|r| r.alpha).collect();
    assert_eq!(alphas, vec![1e-1, 1e-2, 1e-3, 1e-4, 1e-5, 1e-6]);

    report.write_tables().unwrap();
    let long_text = fs::read_to_string(&param.output.long_table).unwrap();
    assert_eq!(long_text.lines().next(), Some("method\talpha\tcondition\tcount\tn_clusters"));
    assert_eq!(long_text.lines().count(), 13);
    let comparison_text = fs::read_to_string(&param.output.comparison_table).unwrap();
    assert_eq!(comparison_text.lines().count(), 7);

    let report_path = dir.path().join("report.json");
    report.save(&report_path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(json["comparison"].as_array().map(|a| a.len()), Some(6));
    assert_eq!(json["results"][0]["condition"], "true");
}

#[test]
fn test_short_stream_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut param = create_test_params(&dir, &["chr1", "chr2", "chr3"], vec![MethodKind::liptak]);
    param.evaluation.n_true = 2;
    param.evaluation.n_false = 100;

    let report = run(&param, running()).unwrap();
    let true_result = report.results.iter().find(|r| r.condition == Condition::True).unwrap();
    let false_result = report.results.iter().find(|r| r.condition == Condition::False).unwrap();
    assert_eq!(true_result.n_clusters, 2, "the first clusters go to the true set");
    assert_eq!(false_result.n_clusters, 1, "the rest of the stream goes to the false set");
    assert_eq!(report.comparison.len(), 6);
}

#[test]
fn test_every_method_scores_or_reports_non_convergence() {
    let dir = tempfile::tempdir().unwrap();
    let methods = vec![
        MethodKind::gee,
        MethodKind::gee_robust,
        MethodKind::mixed_model,
        MethodKind::mixed_model_robust,
        MethodKind::liptak,
        MethodKind::liptak_robust,
        MethodKind::zscore,
        MethodKind::zscore_robust,
        MethodKind::bumphunt,
    ];
    let mut param = create_test_params(&dir, &["chr1", "chr2", "chr3", "chr4"], methods.clone());
    param.evaluation.n_true = 2;
    param.evaluation.n_false = 2;

    let report = run(&param, running()).unwrap();
    assert_eq!(report.results.len(), 2 * methods.len());
    assert_eq!(report.comparison.len(), 6 * methods.len());

    for result in report.results.iter() {
        assert_eq!(result.n_clusters, 2);
        for p in result.p_values.iter().flatten() {
            assert!(p.is_finite() && (0.0..=1.0).contains(p), "{}: invalid p-value {}", result.method, p);
        }
        assert_eq!(result.n_failed, result.p_values.iter().filter(|p| p.is_none()).count());
    }
}

#[test]
fn test_fixed_seed_reproduces_results() {
    let dir = tempfile::tempdir().unwrap();
    let mut param = create_test_params(&dir, &["chr1", "chr2", "chr3", "chr4"], vec![MethodKind::zscore, MethodKind::bumphunt]);
    param.evaluation.n_true = 1;
    param.evaluation.n_false = 3;

    let first = run(&param, running()).unwrap();
    param.general.thread_number = 1;
    let second = run(&param, running()).unwrap();
    assert_eq!(first.results, second.results, "same seed, same p-values whatever the thread count");
}

#[test]
fn test_missing_covariate_sample_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut param = create_test_params(&dir, &["chr1", "chr2"], vec![MethodKind::zscore]);
    param.data.covariates = write_covariates(dir.path(), &["s1", "s2", "s4", "s5"]);

    match run(&param, running()) {
        Err(DmrError::Alignment { sample, .. }) => assert_eq!(sample, "s3", "the diagnostic must name the missing sample"),
        other => panic!("expected an alignment error, got {:?}", other.map(|r| r.id)),
    }
}

#[test]
fn test_malformed_row_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut param = create_test_params(&dir, &["chr1"], vec![MethodKind::zscore]);
    let mut text = fs::read_to_string(&param.data.methylation).unwrap();
    text.push_str("chr9-2000\t0.1\t0.2\t0.3\t0.4\t0.5\n");
    let path = dir.path().join("bad.tsv");
    fs::write(&path, text).unwrap();
    param.data.methylation = path.to_string_lossy().to_string();
    param.evaluation.n_true = 5;

    assert!(matches!(run(&param, running()), Err(DmrError::Parse { .. })));
}

#[test]
fn test_interrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let param = create_test_params(&dir, &["chr1", "chr2"], vec![MethodKind::zscore]);
    let result = run(&param, Arc::new(AtomicBool::new(false)));
    assert!(matches!(result, Err(DmrError::Interrupted)));
}
