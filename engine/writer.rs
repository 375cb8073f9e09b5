// ========================================================================================
//
//                         Sample output: one row per retained iteration
//
// ========================================================================================

use std::fmt::Write as FmtWrite;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write samples to '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sample row has {found} values but the layout has {expected} columns")]
    Width { expected: usize, found: usize },
    #[error("a sample was written before the column layout was declared")]
    NotStarted,
}

/// Column names of a sample row, excluding the leading `iteration` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleLayout {
    names: Vec<String>,
}

fn indexed(prefix: &str, count: usize) -> impl Iterator<Item = String> + '_ {
    (1..=count).map(move |i| format!("{prefix}[{i}]"))
}

impl SampleLayout {
    /// `mu, theta[..], beta[..], sigmaE, sigmaG, comp[..]`, followed by
    /// `epsilon[..]` when `individuals` is given.
    pub fn gaussian(markers: usize, covariates: usize, individuals: Option<usize>) -> Self {
        let mut names = vec!["mu".to_string()];
        names.extend(indexed("theta", covariates));
        names.extend(indexed("beta", markers));
        names.push("sigmaE".to_string());
        names.push("sigmaG".to_string());
        names.extend(indexed("comp", markers));
        if let Some(n) = individuals {
            names.extend(indexed("epsilon", n));
        }
        Self { names }
    }

    /// `alpha, mu, theta[..], beta[..], comp[..], sigmaB`.
    pub fn weibull(markers: usize, covariates: usize) -> Self {
        let mut names = vec!["alpha".to_string(), "mu".to_string()];
        names.extend(indexed("theta", covariates));
        names.extend(indexed("beta", markers));
        names.extend(indexed("comp", markers));
        names.push("sigmaB".to_string());
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn width(&self) -> usize {
        self.names.len()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    pub iteration: usize,
    pub values: Vec<f64>,
}

/// Receives the retained samples of a run, in iteration order.
pub trait SampleSink {
    fn begin(&mut self, layout: &SampleLayout) -> Result<(), SinkError>;
    fn write_sample(&mut self, row: &SampleRow) -> Result<(), SinkError>;
    fn finish(&mut self) -> Result<(), SinkError>;
}

// ========================================================================================
//                                    CSV file sink
// ========================================================================================

/// Comma-separated samples with a header row. Every row is flushed as it is written
/// so an interrupted chain keeps the samples it produced.
pub struct SampleWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    width: Option<usize>,
    line: String,
    ryu: ryu::Buffer,
}

impl SampleWriter {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            width: None,
            line: String::new(),
            ryu: ryu::Buffer::new(),
        })
    }

    fn io(&self) -> impl FnOnce(io::Error) -> SinkError + '_ {
        move |source| SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SampleSink for SampleWriter {
    fn begin(&mut self, layout: &SampleLayout) -> Result<(), SinkError> {
        self.line.clear();
        self.line.push_str("iteration");
        for name in layout.names() {
            self.line.push(',');
            self.line.push_str(name);
        }
        self.line.push('\n');
        let result = self.writer.write_all(self.line.as_bytes());
        result.map_err(self.io())?;
        self.width = Some(layout.width());
        Ok(())
    }

    fn write_sample(&mut self, row: &SampleRow) -> Result<(), SinkError> {
        let expected = self.width.ok_or(SinkError::NotStarted)?;
        if row.values.len() != expected {
            return Err(SinkError::Width {
                expected,
                found: row.values.len(),
            });
        }
        self.line.clear();
        // Writing into a String cannot fail.
        let _ = write!(self.line, "{}", row.iteration);
        for &value in &row.values {
            self.line.push(',');
            if value.is_finite() {
                self.line.push_str(self.ryu.format_finite(value));
            } else {
                let _ = write!(self.line, "{value}");
            }
        }
        self.line.push('\n');
        let result = self
            .writer
            .write_all(self.line.as_bytes())
            .and_then(|()| self.writer.flush());
        result.map_err(self.io())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let result = self
            .writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_all());
        result.map_err(self.io())
    }
}

// ========================================================================================
//                                   In-memory sink
// ========================================================================================

/// Keeps every sample in memory. Used by tests and by callers that summarise a short
/// chain directly.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    layout: Option<SampleLayout>,
    rows: Vec<SampleRow>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[SampleRow] {
        &self.rows
    }

    pub fn layout(&self) -> Option<&SampleLayout> {
        self.layout.as_ref()
    }

    /// The trace of one named column across the retained samples.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let at = self.layout.as_ref()?.position(name)?;
        Some(self.rows.iter().map(|r| r.values[at]).collect())
    }

    /// Posterior mean of a named column.
    pub fn column_mean(&self, name: &str) -> Option<f64> {
        let trace = self.column(name)?;
        if trace.is_empty() {
            return None;
        }
        Some(trace.iter().sum::<f64>() / trace.len() as f64)
    }
}

impl SampleSink for SampleBuffer {
    fn begin(&mut self, layout: &SampleLayout) -> Result<(), SinkError> {
        self.layout = Some(layout.clone());
        self.rows.clear();
        Ok(())
    }

    fn write_sample(&mut self, row: &SampleRow) -> Result<(), SinkError> {
        let expected = self.layout.as_ref().ok_or(SinkError::NotStarted)?.width();
        if row.values.len() != expected {
            return Err(SinkError::Width {
                expected,
                found: row.values.len(),
            });
        }
        self.rows.push(row.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn gaussian_layout_orders_the_columns() {
        let layout = SampleLayout::gaussian(2, 1, Some(3));
        assert_eq!(
            layout.names(),
            [
                "mu",
                "theta[1]",
                "beta[1]",
                "beta[2]",
                "sigmaE",
                "sigmaG",
                "comp[1]",
                "comp[2]",
                "epsilon[1]",
                "epsilon[2]",
                "epsilon[3]"
            ]
        );
        assert_eq!(SampleLayout::gaussian(2, 0, None).width(), 7);
    }

    #[test]
    fn weibull_layout_ends_with_sigma_b() {
        let layout = SampleLayout::weibull(2, 0);
        assert_eq!(
            layout.names(),
            ["alpha", "mu", "beta[1]", "beta[2]", "comp[1]", "comp[2]", "sigmaB"]
        );
    }

    #[test]
    fn csv_writer_emits_header_and_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples.csv");
        let mut writer = SampleWriter::create(&path).unwrap();
        writer.begin(&SampleLayout::weibull(1, 0)).unwrap();
        writer
            .write_sample(&SampleRow {
                iteration: 10,
                values: vec![1.5, -0.25, 0.125, 1.0, 0.001],
            })
            .unwrap();
        writer.finish().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "iteration,alpha,mu,beta[1],comp[1],sigmaB");
        assert_eq!(lines[1], "10,1.5,-0.25,0.125,1.0,0.001");
    }

    #[test]
    fn rows_of_the_wrong_width_are_refused() {
        let mut buffer = SampleBuffer::new();
        let row = SampleRow {
            iteration: 0,
            values: vec![0.0; 3],
        };
        assert!(matches!(buffer.write_sample(&row), Err(SinkError::NotStarted)));
        buffer.begin(&SampleLayout::weibull(1, 0)).unwrap();
        assert!(matches!(
            buffer.write_sample(&row),
            Err(SinkError::Width {
                expected: 5,
                found: 3
            })
        ));
    }

    #[test]
    fn buffer_summarises_columns() {
        let mut buffer = SampleBuffer::new();
        buffer.begin(&SampleLayout::gaussian(1, 0, None)).unwrap();
        for (iteration, beta) in [(0, 0.5), (5, 1.5)] {
            buffer
                .write_sample(&SampleRow {
                    iteration,
                    values: vec![0.0, beta, 1.0, 0.1, 1.0],
                })
                .unwrap();
        }
        assert_eq!(buffer.column("beta[1]"), Some(vec![0.5, 1.5]));
        assert_eq!(buffer.column_mean("beta[1]"), Some(1.0));
        assert_eq!(buffer.column("beta[2]"), None);
    }
}
