use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use log::{debug, info};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DmrError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CovariateColumn {
    Numeric(Vec<f64>),
    Categorical(Vec<String>),
}

impl CovariateColumn {
    /// Numeric when every value parses as a float, categorical otherwise
    pub fn from_raw(values: Vec<String>) -> CovariateColumn {
        let parsed: Option<Vec<f64>> = values.iter().map(|v| v.trim().parse::<f64>().ok()).collect();
        match parsed {
            Some(numbers) => CovariateColumn::Numeric(numbers),
            None => CovariateColumn::Categorical(values),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CovariateColumn::Numeric(v) => v.len(),
            CovariateColumn::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// New column whose i-th value is the `order[i]`-th value of this one
    pub fn reorder(&self, order: &[usize]) -> CovariateColumn {
        match self {
            CovariateColumn::Numeric(v) => CovariateColumn::Numeric(order.iter().map(|&i| v[i]).collect()),
            CovariateColumn::Categorical(v) => {
                CovariateColumn::Categorical(order.iter().map(|&i| v[i].clone()).collect())
            }
        }
    }
}

/// Per-sample covariates, rows in a fixed sample order.
///
/// Tables are never modified in place: alignment and permutation return new tables so a
/// loaded table can be shared read-only between evaluation threads.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateTable {
    samples: Vec<String>,
    names: Vec<String>,
    columns: Vec<CovariateColumn>,
}

impl CovariateTable {
    pub fn new(samples: Vec<String>, columns: Vec<(String, CovariateColumn)>) -> Result<CovariateTable> {
        let mut seen = HashSet::new();
        for sample in samples.iter() {
            if !seen.insert(sample) {
                return Err(DmrError::Alignment {
                    sample: sample.clone(),
                    message: "duplicated sample identifier in covariates".to_string(),
                });
            }
        }

        for (name, column) in columns.iter() {
            if column.len() != samples.len() {
                return Err(DmrError::Config(format!(
                    "covariate '{}' has {} values for {} samples",
                    name,
                    column.len(),
                    samples.len()
                )));
            }
        }

        let (names, columns) = columns.into_iter().unzip();
        Ok(CovariateTable { samples, names, columns })
    }

    /// Load a tab-separated covariate file; `sample_column` names the identifier column
    pub fn load<P: AsRef<Path>>(path: P, sample_column: &str) -> Result<CovariateTable> {
        info!("Loading covariates {}...", path.as_ref().display());
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path.as_ref())?;

        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let id_idx = headers.iter().position(|h| h == sample_column).ok_or_else(|| {
            DmrError::Config(format!(
                "sample column '{}' not found in covariate header {:?}",
                sample_column, headers
            ))
        })?;

        let mut samples = Vec::new();
        let mut raw: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() != headers.len() {
                return Err(DmrError::Parse {
                    line: row + 2,
                    message: format!("{} fields for {} header columns", record.len(), headers.len()),
                });
            }
            for (j, field) in record.iter().enumerate() {
                if j == id_idx {
                    samples.push(field.trim().to_string());
                } else {
                    raw[j].push(field.trim().to_string());
                }
            }
        }

        let columns: Vec<(String, CovariateColumn)> = headers
            .into_iter()
            .zip(raw)
            .enumerate()
            .filter(|(j, _)| *j != id_idx)
            .map(|(_, (name, values))| (name, CovariateColumn::from_raw(values)))
            .collect();

        debug!("{} samples and {} covariates loaded", samples.len(), columns.len());
        CovariateTable::new(samples, columns)
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn sample_len(&self) -> usize {
        self.samples.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&CovariateColumn> {
        self.names.iter().position(|n| n == name).map(|j| &self.columns[j])
    }

    /// Restrict and reorder rows to `order`, the sample order of the methylation matrix.
    /// Every sample of `order` must be present; extra covariate rows are dropped.
    pub fn align(&self, order: &[String]) -> Result<CovariateTable> {
        let index: HashMap<&String, usize> = self.samples.iter().enumerate().map(|(i, s)| (s, i)).collect();

        let rows = order
            .iter()
            .map(|sample| {
                index.get(sample).copied().ok_or_else(|| DmrError::Alignment {
                    sample: sample.clone(),
                    message: "sample of the methylation matrix missing from covariates".to_string(),
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        if rows.len() < self.samples.len() {
            debug!("{} covariate rows unused after alignment", self.samples.len() - rows.len());
        }

        Ok(CovariateTable {
            samples: order.to_vec(),
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.reorder(&rows)).collect(),
        })
    }

    /// Copy of the table where the values of `term` are randomly reassigned across samples.
    ///
    /// Only the `term` column moves; the other covariates keep their sample, so the null
    /// breaks the association of the term with methylation and nothing else.
    ///
    /// # Arguments
    ///
    /// * `term` - name of the covariate to shuffle
    /// * `rng` - generator of the cluster being evaluated, so that a seed reproduces the permutation
    ///
    /// # Returns
    ///
    /// The permuted copy, or [`DmrError::Formula`] when `term` is not a covariate.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use dmreval::covariate::CovariateTable;
    /// # use rand::SeedableRng;
    /// # use rand_chacha::ChaCha8Rng;
    /// # let covariates = CovariateTable::load("covariates.tsv", "id").unwrap();
    /// let mut rng = ChaCha8Rng::seed_from_u64(42);
    /// let null = covariates.permute("disease", &mut rng).unwrap();
    /// ```
    pub fn permute(&self, term: &str, rng: &mut ChaCha8Rng) -> Result<CovariateTable> {
        let j = self
            .names
            .iter()
            .position(|n| n == term)
            .ok_or_else(|| DmrError::Formula(format!("covariate '{}' not found", term)))?;

        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        order.shuffle(rng);

        let mut permuted = self.clone();
        permuted.columns[j] = self.columns[j].reorder(&order);
        Ok(permuted)
    }
}

impl fmt::Display for CovariateTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Samples: {}   Covariates: {}", self.samples.len(), self.names.join(", "))?;
        for (i, sample) in self.samples.iter().take(10).enumerate() {
            let row: Vec<String> = self
                .columns
                .iter()
                .map(|c| match c {
                    CovariateColumn::Numeric(v) => format!("{:.3}", v[i]),
                    CovariateColumn::Categorical(v) => v[i].clone(),
                })
                .collect();
            writeln!(f, "{:<20} {}", sample, row.join("\t"))?;
        }
        Ok(())
    }
}

impl fmt::Debug for CovariateTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
