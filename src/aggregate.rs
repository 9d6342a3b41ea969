use std::collections::BTreeMap;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{DmrError, Result};
use crate::evaluator::{Condition, EvaluationResult};

/// One (method, alpha, condition) count of the long table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CountRow {
    pub method: String,
    pub alpha: f64,
    pub condition: Condition,
    pub count: usize,
    pub n_clusters: usize,
}

/// True and false counts of one method at one alpha
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub method: String,
    pub alpha: f64,
    pub true_count: usize,
    pub false_count: usize,
    /// empirical sensitivity, `true_count` over the true clusters evaluated
    pub true_rate: f64,
    pub false_rate: f64,
    pub specificity: f64,
}

pub fn to_long(results: &[EvaluationResult]) -> Vec<CountRow> {
    results
        .iter()
        .flat_map(|r| {
            r.alphas.iter().zip(r.counts.iter()).map(move |(&alpha, &count)| CountRow {
                method: r.method.clone(),
                alpha,
                condition: r.condition,
                count,
                n_clusters: r.n_clusters,
            })
        })
        .collect()
}

/// Pairs the true and false counts of every (method, alpha).
///
/// Rows come out in order of first appearance of the method, then of the alpha.
///
/// # Arguments
///
/// * `rows` - long table, as produced by [`to_long`]
///
/// # Returns
///
/// One [`ComparisonRow`] per (method, alpha) with both counts and the derived rates.
/// A pair seen under one condition only is a [`DmrError::AggregationMismatch`] naming the
/// missing condition; a pair seen twice under the same condition is a [`DmrError::Config`].
pub fn pivot(rows: &[CountRow]) -> Result<Vec<ComparisonRow>> {
    let mut order: Vec<(String, u64)> = Vec::new();
    let mut pairs: BTreeMap<(String, u64), (Option<&CountRow>, Option<&CountRow>)> = BTreeMap::new();

    for row in rows.iter() {
        let key = (row.method.clone(), row.alpha.to_bits());
        let entry = pairs.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            (None, None)
        });
        let slot = match row.condition {
            Condition::True => &mut entry.0,
            Condition::False => &mut entry.1,
        };
        if slot.is_some() {
            return Err(DmrError::Config(format!(
                "duplicated {} count for method {} at alpha={:e}",
                row.condition, row.method, row.alpha
            )));
        }
        *slot = Some(row);
    }

    order
        .iter()
        .map(|key| match pairs[key] {
            (Some(t), Some(f)) => Ok(comparison(t, f)),
            (Some(t), None) => Err(DmrError::AggregationMismatch {
                method: t.method.clone(),
                alpha: t.alpha,
                missing: Condition::False,
            }),
            (None, Some(f)) => Err(DmrError::AggregationMismatch {
                method: f.method.clone(),
                alpha: f.alpha,
                missing: Condition::True,
            }),
            (None, None) => unreachable!("every key is created with a row"),
        })
        .collect()
}

fn comparison(t: &CountRow, f: &CountRow) -> ComparisonRow {
    let rate = |count: usize, n: usize| if n == 0 { f64::NAN } else { count as f64 / n as f64 };
    let false_rate = rate(f.count, f.n_clusters);
    ComparisonRow {
        method: t.method.clone(),
        alpha: t.alpha,
        true_count: t.count,
        false_count: f.count,
        true_rate: rate(t.count, t.n_clusters),
        false_rate,
        specificity: 1.0 - false_rate,
    }
}

/// Writes serialisable rows as a tab-separated table with a header
pub fn write_tsv<T: Serialize, P: AsRef<Path>>(rows: &[T], path: P) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path.as_ref())?;
    for row in rows.iter() {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!("Table written to {}", path.as_ref().display());
    Ok(())
}

/// Terminal summary of the comparison table
pub fn display_comparison(rows: &[ComparisonRow], colorful: bool) -> String {
    let mut text = String::new();
    let mut current = "";
    for row in rows.iter() {
        if row.method != current {
            current = &row.method;
            if colorful {
                text.push_str(&format!("\x1b[1;93m{}\x1b[0m\n", row.method));
            } else {
                text.push_str(&format!("{}\n", row.method));
            }
            text.push_str("  alpha      true   false  sensitivity  specificity\n");
        }
        text.push_str(&format!(
            "  {:<9.0e}  {:>5}  {:>5}  {:>11.3}  {:>11.3}\n",
            row.alpha, row.true_count, row.false_count, row.true_rate, row.specificity
        ));
    }
    text
}
