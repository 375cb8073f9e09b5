// ========================================================================================
//
//                       Marker stores and auxiliary input readers
//
// ========================================================================================
//
// ### Purpose ###
//
// A marker store answers one question for the build workers: "give me marker j". The
// file-backed store memory-maps the preprocessed data once and slices it through the
// index; the in-memory store serves blocks encoded on the fly and exists for tests and
// benchmarks. Both decode through the same `MarkerBuilder`.

use csv::ReaderBuilder;
use log::{debug, info};
use memmap2::{Mmap, MmapOptions};
use ndarray::Array2;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::marker::{Marker, MarkerBuilder};
use crate::pipeline::BufferPool;
use crate::prepare::{self, GenotypeMatrix, PrepareError};
use crate::types::{IndexEntry, MarkerIndex, MarkerKind};

/// Number of idle column buffers kept for dense builds.
const DEFAULT_POOL_CAPACITY: usize = 32;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{path}', {marker}: decoded {found} bytes but expected {expected}")]
    SizeMismatch {
        path: PathBuf,
        marker: MarkerIndex,
        expected: usize,
        found: usize,
    },
    #[error("'{path}' is malformed: {reason}")]
    Format { path: PathBuf, reason: String },
    #[error("'{path}', {marker}: {reason}")]
    Corrupt {
        path: PathBuf,
        marker: MarkerIndex,
        reason: String,
    },
    #[error("{marker} is out of range for a store of {markers} markers")]
    OutOfRange { marker: MarkerIndex, markers: usize },
    #[error("'{path}' line {line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("failed to encode marker blocks: {0}")]
    Encode(#[from] PrepareError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A read-only source of markers, shared by every build worker of a sweep.
pub trait MarkerSource: Sync {
    fn individuals(&self) -> usize;
    fn markers(&self) -> usize;
    fn kind(&self) -> MarkerKind;
    fn build(&self, marker: MarkerIndex) -> Result<Marker, StoreError>;
}

/// File names used for one preprocessed data set.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub data: PathBuf,
    pub index: PathBuf,
}

impl StorePaths {
    pub fn for_kind(prefix: &Path, kind: MarkerKind) -> Self {
        let (data_ext, index_ext) = if kind.is_sparse() {
            ("sparsebed", "sparsebedindex")
        } else {
            ("ppbed", "ppbedindex")
        };
        Self {
            data: with_extension(prefix, data_ext),
            index: with_extension(prefix, index_ext),
        }
    }
}

fn with_extension(prefix: &Path, ext: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

// ========================================================================================
//                                The file-backed store
// ========================================================================================

/// Preprocessed markers on disk, memory-mapped once and sliced per build.
pub struct MarkerStore {
    kind: MarkerKind,
    compressed: bool,
    individuals: usize,
    data_path: PathBuf,
    data: Mmap,
    layout: BlockLayout,
    pool: Arc<BufferPool>,
}

enum BlockLayout {
    /// Uncompressed dense data: marker j starts at `j * stride`.
    Strided { stride: usize, markers: usize },
    /// Anything with an index file.
    Indexed(Vec<IndexEntry>),
}

impl MarkerStore {
    /// Opens `<prefix>.ppbed` (plus `.ppbedindex` when compressed) for dense markers,
    /// or `<prefix>.sparsebed` + `.sparsebedindex` for the sparse kinds.
    pub fn open(
        prefix: &Path,
        individuals: usize,
        kind: MarkerKind,
        compressed: bool,
    ) -> Result<Self, StoreError> {
        let paths = StorePaths::for_kind(prefix, kind);
        if individuals == 0 {
            return Err(StoreError::Format {
                path: paths.data,
                reason: "the phenotype has no individuals".into(),
            });
        }
        let file = File::open(&paths.data).map_err(io_error(&paths.data))?;
        let data_len = file.metadata().map_err(io_error(&paths.data))?.len();
        if data_len == 0 {
            return Err(StoreError::Format {
                path: paths.data,
                reason: "file contains no markers".into(),
            });
        }
        // Safety: the store is opened read-only and the file is not modified while mapped.
        let data = unsafe { MmapOptions::new().map(&file) }.map_err(io_error(&paths.data))?;

        let layout = if kind == MarkerKind::Dense && !compressed {
            let stride = individuals * 8;
            if data_len % stride as u64 != 0 {
                return Err(StoreError::Format {
                    path: paths.data,
                    reason: format!(
                        "length {data_len} is not a multiple of {stride} bytes ({individuals} individuals)"
                    ),
                });
            }
            BlockLayout::Strided {
                stride,
                markers: (data_len / stride as u64) as usize,
            }
        } else {
            BlockLayout::Indexed(read_index(&paths.index, data_len)?)
        };

        let markers = match &layout {
            BlockLayout::Strided { markers, .. } => *markers,
            BlockLayout::Indexed(entries) => entries.len(),
        };
        info!(
            "Opened {} store '{}': {} markers x {} individuals{}",
            kind,
            paths.data.display(),
            markers,
            individuals,
            if compressed { " (compressed)" } else { "" }
        );

        Ok(Self {
            kind,
            compressed,
            individuals,
            data_path: paths.data,
            data,
            layout,
            pool: BufferPool::new(DEFAULT_POOL_CAPACITY, individuals),
        })
    }

    fn block(&self, marker: MarkerIndex) -> Result<&[u8], StoreError> {
        let out_of_range = StoreError::OutOfRange {
            marker,
            markers: self.markers(),
        };
        match &self.layout {
            BlockLayout::Strided { stride, markers } => {
                if marker.get() >= *markers {
                    return Err(out_of_range);
                }
                let start = marker.get() * stride;
                Ok(&self.data[start..start + stride])
            }
            BlockLayout::Indexed(entries) => {
                let entry = entries.get(marker.get()).ok_or(out_of_range)?;
                entry
                    .end()
                    .and_then(|end| {
                        let start = usize::try_from(entry.pos).ok()?;
                        let end = usize::try_from(end).ok()?;
                        self.data.get(start..end)
                    })
                    .ok_or_else(|| StoreError::Corrupt {
                        path: self.data_path.clone(),
                        marker,
                        reason: format!(
                            "block [{}, +{}) lies outside the {}-byte data file",
                            entry.pos,
                            entry.size,
                            self.data.len()
                        ),
                    })
            }
        }
    }
}

impl MarkerSource for MarkerStore {
    fn individuals(&self) -> usize {
        self.individuals
    }

    fn markers(&self) -> usize {
        match &self.layout {
            BlockLayout::Strided { markers, .. } => *markers,
            BlockLayout::Indexed(entries) => entries.len(),
        }
    }

    fn kind(&self) -> MarkerKind {
        self.kind
    }

    fn build(&self, marker: MarkerIndex) -> Result<Marker, StoreError> {
        let block = self.block(marker)?;
        MarkerBuilder::new(
            self.individuals,
            self.kind,
            self.compressed,
            &self.pool,
            &self.data_path,
        )
        .build(marker, block)
    }
}

/// Reads and validates an index table: two little-endian `u64` per marker, no header,
/// blocks contiguous from offset zero to the end of the data file.
pub fn read_index(path: &Path, data_len: u64) -> Result<Vec<IndexEntry>, StoreError> {
    let raw = fs::read(path).map_err(io_error(path))?;
    let format = |reason: String| StoreError::Format {
        path: path.to_path_buf(),
        reason,
    };
    if raw.is_empty() || raw.len() % IndexEntry::ENCODED_LEN != 0 {
        return Err(format(format!(
            "length {} is not a positive multiple of {} bytes",
            raw.len(),
            IndexEntry::ENCODED_LEN
        )));
    }
    let entries: Vec<IndexEntry> = raw
        .chunks_exact(IndexEntry::ENCODED_LEN)
        .map(|c| {
            let mut pos = [0u8; 8];
            let mut size = [0u8; 8];
            pos.copy_from_slice(&c[..8]);
            size.copy_from_slice(&c[8..]);
            IndexEntry {
                pos: u64::from_le_bytes(pos),
                size: u64::from_le_bytes(size),
            }
        })
        .collect();

    let mut expected_pos = 0u64;
    for (j, entry) in entries.iter().enumerate() {
        if entry.pos != expected_pos {
            return Err(format(format!(
                "entry {j} starts at {} but the previous block ended at {expected_pos}",
                entry.pos
            )));
        }
        expected_pos = entry.end().ok_or_else(|| {
            format(format!(
                "entry {j} spans {} bytes from {}, past the largest addressable offset",
                entry.size, entry.pos
            ))
        })?;
    }
    if expected_pos != data_len {
        return Err(format(format!(
            "blocks cover {expected_pos} bytes but the data file has {data_len}"
        )));
    }
    debug!("Read {} index entries from '{}'", entries.len(), path.display());
    Ok(entries)
}

// ========================================================================================
//                                The in-memory store
// ========================================================================================

/// Markers encoded in memory with the on-disk block format.
pub struct InMemoryStore {
    kind: MarkerKind,
    compressed: bool,
    individuals: usize,
    blocks: Vec<Vec<u8>>,
    pool: Arc<BufferPool>,
    label: PathBuf,
}

impl InMemoryStore {
    pub fn new(
        genotypes: &GenotypeMatrix,
        kind: MarkerKind,
        compressed: bool,
    ) -> Result<Self, StoreError> {
        let blocks = genotypes
            .columns()
            .iter()
            .map(|column| {
                let standardized = prepare::standardize(column);
                if kind.is_sparse() {
                    prepare::encode_sparse_block(&standardized, compressed)
                } else {
                    prepare::encode_dense_block(&standardized.values, compressed)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            kind,
            compressed,
            individuals: genotypes.individuals(),
            blocks,
            pool: BufferPool::new(DEFAULT_POOL_CAPACITY, genotypes.individuals()),
            label: PathBuf::from("<memory>"),
        })
    }
}

impl MarkerSource for InMemoryStore {
    fn individuals(&self) -> usize {
        self.individuals
    }

    fn markers(&self) -> usize {
        self.blocks.len()
    }

    fn kind(&self) -> MarkerKind {
        self.kind
    }

    fn build(&self, marker: MarkerIndex) -> Result<Marker, StoreError> {
        let block = self
            .blocks
            .get(marker.get())
            .ok_or(StoreError::OutOfRange {
                marker,
                markers: self.blocks.len(),
            })?;
        MarkerBuilder::new(
            self.individuals,
            self.kind,
            self.compressed,
            &self.pool,
            &self.label,
        )
        .build(marker, block)
    }
}

// ========================================================================================
//                              Phenotypes and covariates
// ========================================================================================

/// Reads one value per individual. Each non-empty line holds either the value alone
/// or PLINK-style `FID IID value` columns; the last field is used.
pub fn load_vector(path: &Path) -> Result<Vec<f64>, StoreError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut values = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_error(path))?;
        let Some(field) = line.split_whitespace().last() else {
            continue;
        };
        let value: f64 = field.parse().map_err(|_| StoreError::Parse {
            path: path.to_path_buf(),
            line: n + 1,
            reason: format!("'{field}' is not a number"),
        })?;
        if !value.is_finite() {
            return Err(StoreError::Parse {
                path: path.to_path_buf(),
                line: n + 1,
                reason: format!("'{field}' is not a finite value"),
            });
        }
        values.push(value);
    }
    if values.is_empty() {
        return Err(StoreError::Format {
            path: path.to_path_buf(),
            reason: "no values found".into(),
        });
    }
    Ok(values)
}

/// Reads a comma-separated covariate table with a header row: one row per
/// individual, one numeric column per covariate.
pub fn load_covariates(path: &Path) -> Result<(Vec<String>, Array2<f64>), StoreError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| csv_error(path, 0, e))?;
    let names: Vec<String> = reader
        .headers()
        .map_err(|e| csv_error(path, 1, e))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut data = Vec::new();
    let mut rows = 0usize;
    for (n, record) in reader.records().enumerate() {
        let line = n + 2;
        let record = record.map_err(|e| csv_error(path, line, e))?;
        for field in record.iter() {
            let value: f64 = field.parse().map_err(|_| StoreError::Parse {
                path: path.to_path_buf(),
                line,
                reason: format!("'{field}' is not a number"),
            })?;
            data.push(value);
        }
        rows += 1;
    }
    let matrix = Array2::from_shape_vec((rows, names.len()), data).map_err(|e| {
        StoreError::Format {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    Ok((names, matrix))
}

fn csv_error(path: &Path, line: usize, e: csv::Error) -> StoreError {
    StoreError::Parse {
        path: path.to_path_buf(),
        line,
        reason: e.to_string(),
    }
}
