use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::covariate::{CovariateColumn, CovariateTable};
use crate::error::{DmrError, Result};

/// A model description such as `methylation ~ disease + age + gender`.
///
/// The response is a label only: its values always come from the methylation data. An
/// intercept is always included.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub response: String,
    pub terms: Vec<String>,
}

impl Formula {
    pub fn parse(text: &str) -> Result<Formula> {
        let (lhs, rhs) = text
            .split_once('~')
            .ok_or_else(|| DmrError::Formula(format!("'{}' has no '~'", text)))?;

        let response = lhs.trim().to_string();
        if response.is_empty() {
            return Err(DmrError::Formula(format!("'{}' has no response", text)));
        }

        let mut terms: Vec<String> = Vec::new();
        for raw in rhs.split('+') {
            let term = raw.trim();
            if term.is_empty() {
                return Err(DmrError::Formula(format!("'{}' has an empty term", text)));
            }
            if term == "1" {
                continue;
            }
            if term.contains(|c: char| c.is_whitespace() || "*:-()".contains(c)) {
                return Err(DmrError::Formula(format!("unsupported term '{}'", term)));
            }
            if !terms.iter().any(|t| t == term) {
                terms.push(term.to_string());
            }
        }

        Ok(Formula { response, terms })
    }

    /// Fails unless `term` is one of the predictors
    pub fn check_term(&self, term: &str) -> Result<()> {
        if self.terms.iter().any(|t| t == term) {
            Ok(())
        } else {
            Err(DmrError::Formula(format!(
                "term of interest '{}' is not a predictor of {}",
                term, self
            )))
        }
    }

    /// Sample-level design matrix: intercept, numeric terms as-is, categorical terms as
    /// treatment dummies against their first level in sorted order.
    pub fn design(&self, covariates: &CovariateTable) -> Result<Design> {
        let n = covariates.sample_len();
        let mut columns: Vec<(String, Vec<f64>)> = vec![("Intercept".to_string(), vec![1.0; n])];
        let mut term_columns: Vec<(String, Vec<usize>)> = Vec::new();

        for term in self.terms.iter() {
            let column = covariates
                .column(term)
                .ok_or_else(|| DmrError::Formula(format!("covariate '{}' not found", term)))?;

            let start = columns.len();
            match column {
                CovariateColumn::Numeric(values) => columns.push((term.clone(), values.clone())),
                CovariateColumn::Categorical(values) => {
                    let mut levels: Vec<&String> = values.iter().collect();
                    levels.sort();
                    levels.dedup();
                    for level in levels.iter().skip(1) {
                        let dummy = values.iter().map(|v| if v == *level { 1.0 } else { 0.0 }).collect();
                        columns.push((format!("{}[T.{}]", term, level), dummy));
                    }
                }
            }
            term_columns.push((term.clone(), (start..columns.len()).collect()));
        }

        let p = columns.len();
        let matrix = Array2::from_shape_fn((n, p), |(i, j)| columns[j].1[i]);

        Ok(Design {
            matrix,
            columns: columns.into_iter().map(|(name, _)| name).collect(),
            term_columns,
        })
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ {}", self.response, self.terms.join(" + "))
    }
}

#[derive(Clone, Debug)]
pub struct Design {
    /// samples x columns
    pub matrix: Array2<f64>,
    pub columns: Vec<String>,
    term_columns: Vec<(String, Vec<usize>)>,
}

impl Design {
    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    /// Index of the single design column carrying `term`.
    /// Categorical terms with more than two levels have no single coefficient to test.
    pub fn term_column(&self, term: &str) -> Result<usize> {
        let indices = self
            .term_columns
            .iter()
            .find(|(name, _)| name == term)
            .map(|(_, idx)| idx)
            .ok_or_else(|| DmrError::Formula(format!("term '{}' is not in the design", term)))?;

        match indices.as_slice() {
            [j] => Ok(*j),
            [] => Err(DmrError::ModelFit(format!("term '{}' has a single level", term))),
            _ => Err(DmrError::Formula(format!(
                "term '{}' expands to {} columns, a binary or numeric term is required",
                term,
                indices.len()
            ))),
        }
    }
}
