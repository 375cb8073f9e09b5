use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use approx::assert_abs_diff_eq;
use tempfile::tempdir;

use bayesrr::io::{MarkerSource, MarkerStore, StoreError, StorePaths};
use bayesrr::prepare::{GenotypeMatrix, PreprocessOptions, preprocess, standardize};
use bayesrr::types::{IndexEntry, MarkerIndex, MarkerKind};

const CSV: &str = "\
rs1,rs2,rs3,rs4,rs5
0,1,2,0,1
1,1,NA,0,2
2,0,1,0,0
0,2,1,0,1
1,,0,0,2
0,1,1,0,0
2,0,2,0,1
";

fn write_csv(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("genotypes.csv");
    fs::write(&path, CSV).unwrap();
    path
}

fn expected_columns(csv: &Path) -> Vec<Vec<f64>> {
    let matrix = GenotypeMatrix::read_csv(csv).unwrap();
    matrix
        .columns()
        .iter()
        .map(|c| standardize(c).values)
        .collect()
}

#[test]
fn every_store_kind_round_trips_through_files() {
    for compressed in [false, true] {
        let dir = tempdir().unwrap();
        let csv = write_csv(dir.path());
        let prefix = dir.path().join("cohort");
        let summary = preprocess(
            &csv,
            &prefix,
            PreprocessOptions {
                compressed,
                sparse: true,
            },
        )
        .unwrap();
        assert_eq!(summary.markers, 5);
        assert_eq!(summary.individuals, 7);
        // rs4 never varies.
        assert_eq!(summary.monomorphic, 1);

        let expected = expected_columns(&csv);
        for kind in [
            MarkerKind::Dense,
            MarkerKind::SparseEigen,
            MarkerKind::SparseRagged,
        ] {
            let store = MarkerStore::open(&prefix, 7, kind, compressed).unwrap();
            assert_eq!(store.markers(), 5);
            assert_eq!(store.kind(), kind);
            for (j, column) in expected.iter().enumerate() {
                let marker = store.build(MarkerIndex(j as u32)).unwrap();
                assert_eq!(marker.kind(), kind);
                let decoded = marker.to_dense();
                if kind == MarkerKind::Dense {
                    // Dense blocks hold the standardized doubles themselves.
                    let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
                    assert_eq!(bits(decoded.as_slice()), bits(column.as_slice()));
                } else {
                    for (a, b) in decoded.iter().zip(column) {
                        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
                    }
                }
            }
        }
    }
}

#[test]
fn uncompressed_dense_store_has_no_index() {
    let dir = tempdir().unwrap();
    let csv = write_csv(dir.path());
    let prefix = dir.path().join("plain");
    preprocess(&csv, &prefix, PreprocessOptions::default()).unwrap();
    let paths = StorePaths::for_kind(&prefix, MarkerKind::Dense);
    assert_eq!(fs::metadata(&paths.data).unwrap().len(), 5 * 7 * 8);
    assert!(!paths.index.exists());
}

#[test]
fn index_that_disagrees_with_the_data_is_a_format_error() {
    let dir = tempdir().unwrap();
    let csv = write_csv(dir.path());
    let prefix = dir.path().join("damaged");
    preprocess(
        &csv,
        &prefix,
        PreprocessOptions {
            compressed: true,
            sparse: false,
        },
    )
    .unwrap();
    let paths = StorePaths::for_kind(&prefix, MarkerKind::Dense);
    let mut data = OpenOptions::new().append(true).open(&paths.data).unwrap();
    data.write_all(&[0u8; 3]).unwrap();
    drop(data);

    let err = MarkerStore::open(&prefix, 7, MarkerKind::Dense, true)
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::Format { .. }));
}

#[test]
fn wrong_individual_count_is_a_size_mismatch() {
    let dir = tempdir().unwrap();
    let csv = write_csv(dir.path());
    let prefix = dir.path().join("sized");
    preprocess(
        &csv,
        &prefix,
        PreprocessOptions {
            compressed: true,
            sparse: false,
        },
    )
    .unwrap();
    let store = MarkerStore::open(&prefix, 6, MarkerKind::Dense, true).unwrap();
    let err = store.build(MarkerIndex(2)).unwrap_err();
    match err {
        StoreError::SizeMismatch {
            marker,
            expected,
            found,
            ..
        } => {
            assert_eq!(marker, MarkerIndex(2));
            assert_eq!(expected, 48);
            assert_eq!(found, 56);
        }
        other => panic!("expected a size mismatch, got {other}"),
    }
}

#[test]
fn overflowing_index_entries_are_a_format_error() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("crafted");
    let paths = StorePaths::for_kind(&prefix, MarkerKind::Dense);
    fs::write(&paths.data, [0u8; 64]).unwrap();
    let entries = [
        IndexEntry {
            pos: 0,
            size: u64::MAX,
        },
        IndexEntry {
            pos: u64::MAX,
            size: 65,
        },
    ];
    let index: Vec<u8> = entries.iter().flat_map(|e| e.to_le_bytes()).collect();
    fs::write(&paths.index, index).unwrap();

    let err = MarkerStore::open(&prefix, 8, MarkerKind::Dense, true)
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::Format { .. }), "got {err}");

    // A single entry running past the data is caught by the coverage check.
    fs::write(&paths.index, entries[0].to_le_bytes()).unwrap();
    let err = MarkerStore::open(&prefix, 8, MarkerKind::Dense, true)
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::Format { .. }), "got {err}");
}
