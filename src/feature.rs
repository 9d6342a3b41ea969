use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{DmrError, Result};

/// One genomic site: its coordinates and one value per sample, in the matrix header order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub chrom: String,
    pub position: u64,
    pub values: Vec<f64>,
}

impl Feature {
    pub fn new(chrom: &str, position: u64, values: Vec<f64>) -> Feature {
        Feature {
            chrom: chrom.to_string(),
            position,
            values,
        }
    }

    pub fn sample_len(&self) -> usize {
        self.values.len()
    }
}

/// Lazy, forward-only reader of a methylation matrix.
///
/// Every row after the header looks like `chrom:pos<TAB>v1<TAB>...<TAB>vk`. The header names
/// the samples and comes in three shapes, told apart by the width `k` of the first data row:
/// - `k + 1` fields: a leading row label followed by the sample names;
/// - `k` fields: the sample names only;
/// - a single field with `k > 1`: no names, samples are numbered `1..=k`.
///
/// Any other header width keeps the fields after the first as names, and rows of a different
/// width are reported as parse errors. Rows are parsed one at a time, nothing is buffered
/// beyond the first data row. To read the input again, build a new stream.
pub struct FeatureStream<R: BufRead> {
    reader: R,
    samples: Vec<String>,
    line_number: usize,
    buffer: String,
    /// first data row, read ahead to size the header
    pending: Option<String>,
}

impl FeatureStream<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening methylation matrix {}...", path.as_ref().display());
        let file = File::open(path)?;
        FeatureStream::new(BufReader::new(file))
    }
}

impl<R: BufRead> FeatureStream<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 {
            return Err(DmrError::Parse {
                line: 1,
                message: "empty input, a header row is required".to_string(),
            });
        }
        let fields: Vec<String> = trim_line_end(&header).split('\t').map(String::from).collect();

        let mut stream = FeatureStream {
            reader,
            samples: Vec::new(),
            line_number: 1,
            buffer: String::new(),
            pending: None,
        };
        stream.pending = stream.read_data_line()?;

        let width = stream.pending.as_ref().map(|line| line.split('\t').count() - 1);
        stream.samples = sample_names(fields, width);
        debug!("Matrix header lists {} samples", stream.samples.len());

        Ok(stream)
    }

    /// Sample identifiers in the order of every `Feature::values`
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    fn parse_line(&self, line: &str) -> Result<Feature> {
        let mut fields = line.split('\t');
        let locus = fields.next().unwrap_or("");

        let tokens: Vec<&str> = locus.split(':').collect();
        if tokens.len() != 2 {
            return Err(DmrError::Parse {
                line: self.line_number,
                message: format!("expected 'chrom:pos' in first column, found '{}'", locus),
            });
        }
        let position: u64 = tokens[1].parse().map_err(|_| DmrError::Parse {
            line: self.line_number,
            message: format!("invalid position '{}'", tokens[1]),
        })?;

        let values = fields
            .map(|value| {
                value.trim().parse::<f64>().map_err(|_| DmrError::Parse {
                    line: self.line_number,
                    message: format!("non-numeric value '{}' at {}", value, locus),
                })
            })
            .collect::<Result<Vec<f64>>>()?;

        if values.len() != self.samples.len() {
            return Err(DmrError::Parse {
                line: self.line_number,
                message: format!(
                    "{} values found for {} but the header lists {} samples",
                    values.len(),
                    locus,
                    self.samples.len()
                ),
            });
        }

        Ok(Feature::new(tokens[0], position, values))
    }

    // next non-blank line, without its line ending
    fn read_data_line(&mut self) -> Result<Option<String>> {
        loop {
            self.buffer.clear();
            if self.reader.read_line(&mut self.buffer)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            let line = trim_line_end(&self.buffer);
            if !line.trim().is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }
}

/// Sample names from the header fields, given the number of values of the first data row
fn sample_names(mut fields: Vec<String>, width: Option<usize>) -> Vec<String> {
    match width {
        Some(k) if fields.len() == k => fields,
        Some(k) if fields.len() == 1 && k > 1 => (1..=k).map(|i| i.to_string()).collect(),
        _ => {
            fields.remove(0);
            fields
        }
    }
}

impl<R: BufRead> Iterator for FeatureStream<R> {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.pending.take() {
            Some(line) => line,
            None => match self.read_data_line() {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            },
        };
        Some(self.parse_line(&line))
    }
}

fn trim_line_end(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
}
