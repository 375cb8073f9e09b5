// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Residual vectors at or above this length are reduced in parallel chunks.
pub const PARALLEL_THRESHOLD: usize = 1 << 15;
/// Chunk width for the parallel reductions. Fixed so results do not depend on the
/// size of the thread pool.
pub const PARALLEL_CHUNK: usize = 1 << 13;

/// The position of a marker (a genotype column) in the preprocessed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MarkerIndex(pub u32);

impl MarkerIndex {
    #[inline(always)]
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MarkerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "marker {}", self.0)
    }
}

/// One entry of a `.ppbedindex` / `.sparsebedindex` table: where a marker's block
/// starts in the data file and how many bytes it spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub pos: u64,
    pub size: u64,
}

impl IndexEntry {
    /// Encoded width of one entry on disk.
    pub const ENCODED_LEN: usize = 16;

    pub fn to_le_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.pos.to_le_bytes());
        out[8..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// One past the last byte of the block, or `None` when the entry overflows.
    pub fn end(self) -> Option<u64> {
        self.pos.checked_add(self.size)
    }
}

/// The in-memory representation a marker is decoded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerKind {
    /// A standardized vector of length N.
    Dense,
    /// A list of (individual, raw genotype) pairs for every non-zero genotype.
    SparseEigen,
    /// Separate individual lists for genotype 1, genotype 2 and missing calls.
    SparseRagged,
}

impl MarkerKind {
    pub fn is_sparse(self) -> bool {
        !matches!(self, MarkerKind::Dense)
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MarkerKind::Dense => "dense",
            MarkerKind::SparseEigen => "sparse-eigen",
            MarkerKind::SparseRagged => "sparse-ragged",
        })
    }
}

/// Summary statistics of a standardized marker, stored alongside sparse blocks so
/// that the dense column never has to be materialised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnStats {
    /// Mean raw genotype over the non-missing calls.
    pub mean: f64,
    /// Reciprocal of the sample standard deviation. Zero for a monomorphic marker.
    pub inv_sd: f64,
    /// Sum of squares of the standardized column.
    pub squared_norm: f64,
    /// Sum of the standardized column.
    pub column_sum: f64,
}

// ========================================================================================
//                                The residual vector
// ========================================================================================

/// The working residual `epsilon` together with its running sum.
///
/// Sparse kernels need `sum(epsilon)` for their mean correction, so every
/// mutation goes through methods that keep `sum` in step with `values`. Incremental
/// updates accumulate rounding, which `resync` discards once per sweep.
#[derive(Debug, Clone)]
pub struct Residual {
    values: Vec<f64>,
    sum: f64,
}

impl Residual {
    pub fn new(values: Vec<f64>) -> Self {
        let sum = sum_slice(&values);
        Self { values, sum }
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    pub fn squared_norm(&self) -> f64 {
        dot_slices(&self.values, &self.values)
    }

    /// Adds `delta` to every element.
    pub fn shift(&mut self, delta: f64) {
        if self.values.len() >= PARALLEL_THRESHOLD {
            self.values.par_iter_mut().for_each(|e| *e += delta);
        } else {
            self.values.iter_mut().for_each(|e| *e += delta);
        }
        self.sum += delta * self.values.len() as f64;
    }

    /// `epsilon += scale * column`, for a dense column of the same length.
    pub fn add_scaled(&mut self, column: &[f64], scale: f64) {
        debug_assert_eq!(column.len(), self.values.len());
        if self.values.len() >= PARALLEL_THRESHOLD {
            self.values
                .par_chunks_mut(PARALLEL_CHUNK)
                .zip(column.par_chunks(PARALLEL_CHUNK))
                .for_each(|(e, x)| e.iter_mut().zip(x).for_each(|(e, x)| *e += scale * x));
        } else {
            self.values
                .iter_mut()
                .zip(column)
                .for_each(|(e, x)| *e += scale * x);
        }
        self.sum = sum_slice(&self.values);
    }

    /// Adds `delta` to the listed individuals only.
    #[inline]
    pub fn add_at(&mut self, individuals: &[u32], delta: f64) {
        for &i in individuals {
            self.values[i as usize] += delta;
        }
        self.sum += delta * individuals.len() as f64;
    }

    /// `epsilon[i] += scale * value` for each `(i, value)` pair.
    #[inline]
    pub fn add_entries(&mut self, entries: &[(u32, f64)], scale: f64) {
        let mut moved = 0.0;
        for &(i, value) in entries {
            self.values[i as usize] += scale * value;
            moved += value;
        }
        self.sum += scale * moved;
    }

    /// Recomputes the running sum from scratch, discarding accumulated rounding.
    pub fn resync(&mut self) {
        self.sum = sum_slice(&self.values);
    }
}

/// Dot product with a deterministic summation order: fixed-width chunks are summed
/// in parallel, then combined left to right.
pub fn dot_slices(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    if a.len() >= PARALLEL_THRESHOLD {
        let partials: Vec<f64> = a
            .par_chunks(PARALLEL_CHUNK)
            .zip(b.par_chunks(PARALLEL_CHUNK))
            .map(|(x, y)| x.iter().zip(y).map(|(x, y)| x * y).sum::<f64>())
            .collect();
        partials.iter().sum()
    } else {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }
}

pub fn sum_slice(a: &[f64]) -> f64 {
    if a.len() >= PARALLEL_THRESHOLD {
        let partials: Vec<f64> = a
            .par_chunks(PARALLEL_CHUNK)
            .map(|x| x.iter().sum::<f64>())
            .collect();
        partials.iter().sum()
    } else {
        a.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn residual_tracks_its_sum_through_mutations() {
        let mut r = Residual::new(vec![1.0, -2.0, 3.5, 0.5]);
        assert_relative_eq!(r.sum(), 3.0);
        r.shift(0.25);
        assert_relative_eq!(r.sum(), 4.0);
        r.add_scaled(&[1.0, 1.0, -1.0, 0.0], 2.0);
        assert_relative_eq!(r.sum(), r.values().iter().sum::<f64>());
        r.add_at(&[0, 3], 1.0);
        r.add_entries(&[(1, 2.0), (2, 0.5)], -1.5);
        assert_relative_eq!(r.sum(), r.values().iter().sum::<f64>(), epsilon = 1e-12);
    }

    #[test]
    fn chunked_dot_matches_sequential_dot() {
        let n = PARALLEL_THRESHOLD + 17;
        let a: Vec<f64> = (0..n).map(|i| ((i % 13) as f64 - 6.0) * 0.1).collect();
        let b: Vec<f64> = (0..n).map(|i| ((i % 7) as f64 - 3.0) * 0.3).collect();
        let sequential: f64 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert_relative_eq!(dot_slices(&a, &b), sequential, max_relative = 1e-10);
    }

    #[test]
    fn index_entry_encodes_little_endian_pairs() {
        let entry = IndexEntry { pos: 1, size: 258 };
        let bytes = entry.to_le_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[9], 1);
        assert_eq!(entry.end(), Some(259));
    }

    #[test]
    fn overflowing_entry_has_no_end() {
        let entry = IndexEntry {
            pos: u64::MAX,
            size: 65,
        };
        assert_eq!(entry.end(), None);
    }
}
