// ========================================================================================
//
//                     Preprocessing: from dosages to marker blocks
//
// ========================================================================================
//
// Turns an individuals x markers dosage table into the binary stores read by
// `io::MarkerStore`. Every marker is standardized to mean zero and unit sample
// variance; missing calls are imputed to the marker mean and therefore standardize
// to exactly zero.

use flate2::Compression;
use flate2::write::ZlibEncoder;
use log::{info, warn};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::io::StorePaths;
use crate::marker::SPARSE_HEADER_LEN;
use crate::types::{ColumnStats, IndexEntry, MarkerKind};

/// Markers encoded in parallel before a batch is written out.
const ENCODE_BATCH: usize = 1024;

#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read the dosage table: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {row}, column '{column}': '{value}' is not a dosage in {{0, 1, 2, NA}}")]
    InvalidGenotype {
        row: usize,
        column: String,
        value: String,
    },
    #[error("expected {expected} genotypes per marker, marker {marker} has {found}")]
    RaggedColumns {
        marker: usize,
        expected: usize,
        found: usize,
    },
    #[error("the dosage table has no {0}")]
    Empty(&'static str),
    #[error("{0} individuals do not fit in a 32-bit individual index")]
    TooManyIndividuals(usize),
    #[error("block compression failed: {0}")]
    Compress(#[source] std::io::Error),
}

/// Raw genotype calls in column-major order: `columns[j][i]` is individual `i` at
/// marker `j`, `None` for a missing call.
#[derive(Debug, Clone)]
pub struct GenotypeMatrix {
    individuals: usize,
    columns: Vec<Vec<Option<u8>>>,
}

impl GenotypeMatrix {
    pub fn from_columns(
        individuals: usize,
        columns: Vec<Vec<Option<u8>>>,
    ) -> Result<Self, PrepareError> {
        if individuals == 0 {
            return Err(PrepareError::Empty("individuals"));
        }
        if columns.is_empty() {
            return Err(PrepareError::Empty("markers"));
        }
        if u32::try_from(individuals).is_err() {
            return Err(PrepareError::TooManyIndividuals(individuals));
        }
        for (j, column) in columns.iter().enumerate() {
            if column.len() != individuals {
                return Err(PrepareError::RaggedColumns {
                    marker: j,
                    expected: individuals,
                    found: column.len(),
                });
            }
        }
        Ok(Self {
            individuals,
            columns,
        })
    }

    /// Reads a comma-separated table with a header of marker names and one row of
    /// dosages per individual. `NA` or an empty field marks a missing call.
    pub fn read_csv(path: &Path) -> Result<Self, PrepareError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let names: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut columns: Vec<Vec<Option<u8>>> = vec![Vec::new(); names.len()];
        let mut individuals = 0usize;
        for record in reader.records() {
            let record = record?;
            for (j, field) in record.iter().enumerate() {
                let call = match field {
                    "" | "NA" | "na" => None,
                    "0" => Some(0),
                    "1" => Some(1),
                    "2" => Some(2),
                    other => {
                        return Err(PrepareError::InvalidGenotype {
                            row: individuals + 1,
                            column: names[j].clone(),
                            value: other.to_string(),
                        });
                    }
                };
                columns[j].push(call);
            }
            individuals += 1;
        }
        Self::from_columns(individuals, columns)
    }

    pub fn individuals(&self) -> usize {
        self.individuals
    }

    pub fn markers(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Vec<Option<u8>>] {
        &self.columns
    }
}

/// A marker after standardization, in both the dense and the sparse views.
#[derive(Debug, Clone)]
pub struct StandardizedMarker {
    pub stats: ColumnStats,
    pub values: Vec<f64>,
    pub ones: Vec<u32>,
    pub twos: Vec<u32>,
    pub missing: Vec<u32>,
}

impl StandardizedMarker {
    pub fn is_monomorphic(&self) -> bool {
        self.stats.inv_sd == 0.0
    }
}

/// Centres on the mean of the observed calls and scales by the sample standard
/// deviation, so a polymorphic column has squared norm `N - 1`.
pub fn standardize(genotypes: &[Option<u8>]) -> StandardizedMarker {
    let n = genotypes.len();
    let (observed, total) = genotypes
        .iter()
        .flatten()
        .fold((0usize, 0.0f64), |(c, s), &g| (c + 1, s + f64::from(g)));
    let mean = if observed > 0 {
        total / observed as f64
    } else {
        0.0
    };
    let centred_ss: f64 = genotypes
        .iter()
        .flatten()
        .map(|&g| (f64::from(g) - mean).powi(2))
        .sum();
    let variance = if n > 1 {
        centred_ss / (n - 1) as f64
    } else {
        0.0
    };
    let inv_sd = if variance > 0.0 {
        1.0 / variance.sqrt()
    } else {
        0.0
    };

    let mut values = Vec::with_capacity(n);
    let mut ones = Vec::new();
    let mut twos = Vec::new();
    let mut missing = Vec::new();
    for (i, call) in genotypes.iter().enumerate() {
        let idx = i as u32;
        match call {
            None => {
                missing.push(idx);
                values.push(0.0);
            }
            Some(g) => {
                match g {
                    1 => ones.push(idx),
                    2 => twos.push(idx),
                    _ => {}
                }
                values.push((f64::from(*g) - mean) * inv_sd);
            }
        }
    }
    let squared_norm = values.iter().map(|x| x * x).sum();
    let column_sum = values.iter().sum();
    StandardizedMarker {
        stats: ColumnStats {
            mean,
            inv_sd,
            squared_norm,
            column_sum,
        },
        values,
        ones,
        twos,
        missing,
    }
}

fn compress(payload: &[u8]) -> Result<Vec<u8>, PrepareError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder.write_all(payload).map_err(PrepareError::Compress)?;
    encoder.finish().map_err(PrepareError::Compress)
}

/// The dense payload: N little-endian doubles, optionally zlib-compressed.
pub fn encode_dense_block(values: &[f64], compressed: bool) -> Result<Vec<u8>, PrepareError> {
    let mut payload = Vec::with_capacity(values.len() * 8);
    for v in values {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    if compressed {
        compress(&payload)
    } else {
        Ok(payload)
    }
}

/// The sparse payload: statistics header, list lengths, then the three lists.
pub fn encode_sparse_block(
    marker: &StandardizedMarker,
    compressed: bool,
) -> Result<Vec<u8>, PrepareError> {
    let listed = marker.ones.len() + marker.twos.len() + marker.missing.len();
    let mut payload = Vec::with_capacity(SPARSE_HEADER_LEN + 4 * listed);
    let ColumnStats {
        mean,
        inv_sd,
        squared_norm,
        column_sum,
    } = marker.stats;
    for v in [mean, inv_sd, squared_norm, column_sum] {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    for list in [&marker.ones, &marker.twos, &marker.missing] {
        payload.extend_from_slice(&(list.len() as u64).to_le_bytes());
    }
    for list in [&marker.ones, &marker.twos, &marker.missing] {
        for i in list.iter() {
            payload.extend_from_slice(&i.to_le_bytes());
        }
    }
    if compressed {
        compress(&payload)
    } else {
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreprocessOptions {
    /// zlib-compress every block (dense blocks then get an index file).
    pub compressed: bool,
    /// Also write the sparse store.
    pub sparse: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PreprocessSummary {
    pub markers: usize,
    pub individuals: usize,
    pub monomorphic: usize,
    pub written: Vec<PathBuf>,
}

/// Writes the dense store, and the sparse store when asked, for `<prefix>`.
pub fn write_store(
    genotypes: &GenotypeMatrix,
    prefix: &Path,
    options: PreprocessOptions,
) -> Result<PreprocessSummary, PrepareError> {
    let mut summary = PreprocessSummary {
        markers: genotypes.markers(),
        individuals: genotypes.individuals(),
        ..Default::default()
    };

    let dense_paths = StorePaths::for_kind(prefix, MarkerKind::Dense);
    let sparse_paths = StorePaths::for_kind(prefix, MarkerKind::SparseRagged);

    let mut dense = BlockWriter::create(&dense_paths, options.compressed)?;
    let mut sparse = if options.sparse {
        Some(BlockWriter::create(&sparse_paths, true)?)
    } else {
        None
    };

    for (batch_no, batch) in genotypes.columns().chunks(ENCODE_BATCH).enumerate() {
        let encoded: Vec<(bool, Vec<u8>, Option<Vec<u8>>)> = batch
            .par_iter()
            .map(|column| {
                let standardized = standardize(column);
                let dense_block = encode_dense_block(&standardized.values, options.compressed)?;
                let sparse_block = if options.sparse {
                    Some(encode_sparse_block(&standardized, options.compressed)?)
                } else {
                    None
                };
                Ok((standardized.is_monomorphic(), dense_block, sparse_block))
            })
            .collect::<Result<_, PrepareError>>()?;

        for (offset, (monomorphic, dense_block, sparse_block)) in encoded.into_iter().enumerate() {
            if monomorphic {
                summary.monomorphic += 1;
                warn!(
                    "Marker {} is monomorphic; its standardized column is all zeros",
                    batch_no * ENCODE_BATCH + offset
                );
            }
            dense.push(&dense_block)?;
            if let (Some(writer), Some(block)) = (sparse.as_mut(), sparse_block) {
                writer.push(&block)?;
            }
        }
    }

    summary.written.extend(dense.finish()?);
    if let Some(writer) = sparse {
        summary.written.extend(writer.finish()?);
    }
    info!(
        "Preprocessed {} markers x {} individuals ({} monomorphic)",
        summary.markers, summary.individuals, summary.monomorphic
    );
    Ok(summary)
}

/// Reads the dosage table at `genotypes` and writes the stores for `<prefix>`.
pub fn preprocess(
    genotypes: &Path,
    prefix: &Path,
    options: PreprocessOptions,
) -> Result<PreprocessSummary, PrepareError> {
    let matrix = GenotypeMatrix::read_csv(genotypes)?;
    write_store(&matrix, prefix, options)
}

/// Appends blocks to a data file and, when indexed, records their extents.
struct BlockWriter {
    data_path: PathBuf,
    data: BufWriter<File>,
    index_path: PathBuf,
    index: Option<BufWriter<File>>,
    cursor: u64,
}

impl BlockWriter {
    fn create(paths: &StorePaths, indexed: bool) -> Result<Self, PrepareError> {
        let open = |path: &Path| {
            File::create(path)
                .map(BufWriter::new)
                .map_err(|source| PrepareError::Io {
                    path: path.to_path_buf(),
                    source,
                })
        };
        Ok(Self {
            data: open(&paths.data)?,
            index: if indexed { Some(open(&paths.index)?) } else { None },
            data_path: paths.data.clone(),
            index_path: paths.index.clone(),
            cursor: 0,
        })
    }

    fn push(&mut self, block: &[u8]) -> Result<(), PrepareError> {
        self.data
            .write_all(block)
            .map_err(|source| PrepareError::Io {
                path: self.data_path.clone(),
                source,
            })?;
        if let Some(index) = self.index.as_mut() {
            let entry = IndexEntry {
                pos: self.cursor,
                size: block.len() as u64,
            };
            index
                .write_all(&entry.to_le_bytes())
                .map_err(|source| PrepareError::Io {
                    path: self.index_path.clone(),
                    source,
                })?;
        }
        self.cursor += block.len() as u64;
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<PathBuf>, PrepareError> {
        self.data.flush().map_err(|source| PrepareError::Io {
            path: self.data_path.clone(),
            source,
        })?;
        let mut written = vec![self.data_path.clone()];
        if let Some(mut index) = self.index.take() {
            index.flush().map_err(|source| PrepareError::Io {
                path: self.index_path.clone(),
                source,
            })?;
            written.push(self.index_path.clone());
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn standardized_column_has_unit_sample_variance() {
        let g = vec![Some(0), Some(1), Some(2), Some(2), None, Some(0)];
        let s = standardize(&g);
        assert_relative_eq!(s.stats.mean, 1.0);
        assert_relative_eq!(s.stats.squared_norm, 5.0, epsilon = 1e-12);
        assert_relative_eq!(s.stats.column_sum, 0.0, epsilon = 1e-12);
        assert_eq!(s.values[4], 0.0);
        assert_eq!(s.ones, vec![1]);
        assert_eq!(s.twos, vec![2, 3]);
        assert_eq!(s.missing, vec![4]);
    }

    #[test]
    fn monomorphic_marker_becomes_a_zero_column() {
        let s = standardize(&[Some(1), Some(1), None, Some(1)]);
        assert!(s.is_monomorphic());
        assert!(s.values.iter().all(|&x| x == 0.0));
        assert_eq!(s.stats.squared_norm, 0.0);
    }

    #[test]
    fn dosage_table_rejects_out_of_range_calls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.csv");
        fs::write(&path, "rs1,rs2\n0,1\n3,NA\n").unwrap();
        let err = GenotypeMatrix::read_csv(&path).unwrap_err();
        assert!(matches!(err, PrepareError::InvalidGenotype { row: 2, .. }));
    }

    #[test]
    fn compressed_store_writes_a_contiguous_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.csv");
        fs::write(&path, "a,b,c\n0,1,2\n1,1,NA\n2,0,0\n0,2,1\n").unwrap();
        let prefix = dir.path().join("geno");
        let summary = preprocess(
            &path,
            &prefix,
            PreprocessOptions {
                compressed: true,
                sparse: true,
            },
        )
        .unwrap();
        assert_eq!(summary.markers, 3);
        assert_eq!(summary.individuals, 4);
        assert_eq!(summary.written.len(), 4);
        let data_len = fs::metadata(dir.path().join("geno.ppbed")).unwrap().len();
        let index = crate::io::read_index(&dir.path().join("geno.ppbedindex"), data_len).unwrap();
        assert_eq!(index.len(), 3);
    }
}
