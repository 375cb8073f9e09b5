// ========================================================================================
//
//                     Markers: decoded genotype columns, one per build
//
// ========================================================================================
//
// A marker is decoded by a build worker, handed to the consumer, used for exactly one
// update and dropped. Nothing decoded here outlives its marker update.

use flate2::read::ZlibDecoder;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::io::StoreError;
use crate::pipeline::{BufferPool, PooledBuffer};
use crate::types::{ColumnStats, MarkerIndex, MarkerKind};

/// Byte width of the fixed header at the start of every sparse block:
/// four `f64` statistics followed by three `u64` list lengths.
pub const SPARSE_HEADER_LEN: usize = 4 * 8 + 3 * 8;

/// A decoded marker in one of the supported representations.
#[derive(Debug)]
pub enum Marker {
    Dense(DenseMarker),
    SparseEigen(SparseEigenMarker),
    SparseRagged(SparseRaggedMarker),
}

impl Marker {
    pub fn index(&self) -> MarkerIndex {
        match self {
            Marker::Dense(m) => m.index,
            Marker::SparseEigen(m) => m.index,
            Marker::SparseRagged(m) => m.index,
        }
    }

    pub fn kind(&self) -> MarkerKind {
        match self {
            Marker::Dense(_) => MarkerKind::Dense,
            Marker::SparseEigen(_) => MarkerKind::SparseEigen,
            Marker::SparseRagged(_) => MarkerKind::SparseRagged,
        }
    }

    /// Materialises the standardized column. Used by diagnostics and tests; the
    /// sampler never needs it for sparse markers.
    pub fn to_dense(&self) -> Vec<f64> {
        match self {
            Marker::Dense(m) => m.values.to_vec(),
            Marker::SparseEigen(m) => {
                let base = -m.stats.mean * m.stats.inv_sd;
                let mut out = vec![base; m.individuals];
                for &(i, g) in &m.entries {
                    out[i as usize] = (g - m.stats.mean) * m.stats.inv_sd;
                }
                out
            }
            Marker::SparseRagged(m) => {
                let x = m.class_values();
                let mut out = vec![x.zero; m.individuals];
                m.ones.iter().for_each(|&i| out[i as usize] = x.one);
                m.twos.iter().for_each(|&i| out[i as usize] = x.two);
                m.missing.iter().for_each(|&i| out[i as usize] = 0.0);
                out
            }
        }
    }
}

/// A standardized column of length N held in a pooled buffer.
#[derive(Debug)]
pub struct DenseMarker {
    pub index: MarkerIndex,
    pub values: PooledBuffer,
    pub squared_norm: f64,
    pub column_sum: f64,
}

/// Non-zero raw genotypes as sorted `(individual, value)` pairs. Missing calls are
/// stored with the marker mean as their value, so they standardize to zero.
#[derive(Debug)]
pub struct SparseEigenMarker {
    pub index: MarkerIndex,
    pub individuals: usize,
    pub stats: ColumnStats,
    pub entries: Vec<(u32, f64)>,
}

/// Individuals carrying one copy, two copies, or a missing call.
#[derive(Debug)]
pub struct SparseRaggedMarker {
    pub index: MarkerIndex,
    pub individuals: usize,
    pub stats: ColumnStats,
    pub ones: Vec<u32>,
    pub twos: Vec<u32>,
    pub missing: Vec<u32>,
}

/// Standardized values taken by the genotype classes of a sparse marker.
#[derive(Debug, Clone, Copy)]
pub struct ClassValues {
    pub zero: f64,
    pub one: f64,
    pub two: f64,
}

impl SparseRaggedMarker {
    pub fn class_values(&self) -> ClassValues {
        let ColumnStats { mean, inv_sd, .. } = self.stats;
        ClassValues {
            zero: -mean * inv_sd,
            one: (1.0 - mean) * inv_sd,
            two: (2.0 - mean) * inv_sd,
        }
    }
}

// ========================================================================================
//                                  The marker builder
// ========================================================================================

/// Decodes raw or compressed blocks into markers of the configured kind.
///
/// One builder is shared read-only by every build worker. `source` names the data
/// file in error messages.
pub struct MarkerBuilder<'a> {
    individuals: usize,
    kind: MarkerKind,
    compressed: bool,
    pool: &'a Arc<BufferPool>,
    source: &'a Path,
}

impl<'a> MarkerBuilder<'a> {
    pub fn new(
        individuals: usize,
        kind: MarkerKind,
        compressed: bool,
        pool: &'a Arc<BufferPool>,
        source: &'a Path,
    ) -> Self {
        Self {
            individuals,
            kind,
            compressed,
            pool,
            source,
        }
    }

    /// Builds a marker from the bytes the index points at.
    pub fn build(&self, index: MarkerIndex, block: &[u8]) -> Result<Marker, StoreError> {
        match self.kind {
            MarkerKind::Dense if self.compressed => {
                let payload = self.inflate(index, block, Some(self.individuals * 8))?;
                self.dense(index, &payload)
            }
            MarkerKind::Dense => self.dense(index, block),
            MarkerKind::SparseEigen | MarkerKind::SparseRagged if self.compressed => {
                let payload = self.inflate(index, block, None)?;
                self.sparse(index, &payload)
            }
            MarkerKind::SparseEigen | MarkerKind::SparseRagged => self.sparse(index, block),
        }
    }

    fn inflate(
        &self,
        index: MarkerIndex,
        block: &[u8],
        expected: Option<usize>,
    ) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::with_capacity(expected.unwrap_or(block.len() * 4));
        ZlibDecoder::new(block)
            .read_to_end(&mut out)
            .map_err(|e| self.corrupt(index, format!("decompression failed: {e}")))?;
        if let Some(expected) = expected {
            if out.len() != expected {
                return Err(StoreError::SizeMismatch {
                    path: self.source.to_path_buf(),
                    marker: index,
                    expected,
                    found: out.len(),
                });
            }
        }
        Ok(out)
    }

    fn dense(&self, index: MarkerIndex, payload: &[u8]) -> Result<Marker, StoreError> {
        let expected = self.individuals * 8;
        if payload.len() != expected {
            return Err(StoreError::SizeMismatch {
                path: self.source.to_path_buf(),
                marker: index,
                expected,
                found: payload.len(),
            });
        }
        let mut values = self.pool.take();
        let mut squared_norm = 0.0;
        let mut column_sum = 0.0;
        for (dst, chunk) in values.iter_mut().zip(payload.chunks_exact(8)) {
            let x = read_f64(chunk);
            squared_norm += x * x;
            column_sum += x;
            *dst = x;
        }
        if !squared_norm.is_finite() {
            return Err(self.corrupt(index, "column contains non-finite values".into()));
        }
        Ok(Marker::Dense(DenseMarker {
            index,
            values,
            squared_norm,
            column_sum,
        }))
    }

    fn sparse(&self, index: MarkerIndex, payload: &[u8]) -> Result<Marker, StoreError> {
        if payload.len() < SPARSE_HEADER_LEN {
            return Err(StoreError::SizeMismatch {
                path: self.source.to_path_buf(),
                marker: index,
                expected: SPARSE_HEADER_LEN,
                found: payload.len(),
            });
        }
        let stats = ColumnStats {
            mean: read_f64(&payload[0..8]),
            inv_sd: read_f64(&payload[8..16]),
            squared_norm: read_f64(&payload[16..24]),
            column_sum: read_f64(&payload[24..32]),
        };
        let counts = [
            read_u64(&payload[32..40]) as usize,
            read_u64(&payload[40..48]) as usize,
            read_u64(&payload[48..56]) as usize,
        ];
        let listed: usize = counts.iter().sum();
        if listed > self.individuals {
            return Err(self.corrupt(
                index,
                format!(
                    "block lists {listed} individuals but the store has {}",
                    self.individuals
                ),
            ));
        }
        let expected = SPARSE_HEADER_LEN + 4 * listed;
        if payload.len() != expected {
            return Err(StoreError::SizeMismatch {
                path: self.source.to_path_buf(),
                marker: index,
                expected,
                found: payload.len(),
            });
        }
        if ![stats.mean, stats.inv_sd, stats.squared_norm, stats.column_sum]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(self.corrupt(index, "non-finite column statistics".into()));
        }

        let mut cursor = SPARSE_HEADER_LEN;
        let mut lists: [Vec<u32>; 3] = Default::default();
        for (list, &count) in lists.iter_mut().zip(&counts) {
            let bytes = &payload[cursor..cursor + 4 * count];
            cursor += 4 * count;
            *list = bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            self.check_sorted(index, list)?;
        }
        let [ones, twos, missing] = lists;

        Ok(match self.kind {
            MarkerKind::SparseEigen => {
                let mut entries: Vec<(u32, f64)> = Vec::with_capacity(listed);
                entries.extend(ones.iter().map(|&i| (i, 1.0)));
                entries.extend(twos.iter().map(|&i| (i, 2.0)));
                entries.extend(missing.iter().map(|&i| (i, stats.mean)));
                entries.sort_unstable_by_key(|&(i, _)| i);
                if entries.windows(2).any(|w| w[0].0 == w[1].0) {
                    return Err(self.corrupt(index, "individual listed in two classes".into()));
                }
                Marker::SparseEigen(SparseEigenMarker {
                    index,
                    individuals: self.individuals,
                    stats,
                    entries,
                })
            }
            _ => Marker::SparseRagged(SparseRaggedMarker {
                index,
                individuals: self.individuals,
                stats,
                ones,
                twos,
                missing,
            }),
        })
    }

    fn check_sorted(&self, index: MarkerIndex, list: &[u32]) -> Result<(), StoreError> {
        let bad_order = list.windows(2).any(|w| w[0] >= w[1]);
        let out_of_range = list.last().is_some_and(|&i| i as usize >= self.individuals);
        if bad_order || out_of_range {
            return Err(self.corrupt(
                index,
                "individual list is unsorted or out of range".into(),
            ));
        }
        Ok(())
    }

    fn corrupt(&self, index: MarkerIndex, reason: String) -> StoreError {
        StoreError::Corrupt {
            path: self.source.to_path_buf(),
            marker: index,
            reason,
        }
    }
}

#[inline(always)]
fn read_f64(bytes: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    f64::from_le_bytes(raw)
}

#[inline(always)]
fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}
