// ========================================================================================
//
//                      Dense versus sparse marker kernel benchmark
//
// ========================================================================================
//
// Measures the per-marker cost of the two operations every Gibbs update performs, the
// residual dot product and the residual update, for each marker representation across
// a range of allele frequencies. Rare markers are where the sparse layouts pay off.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::hint::black_box;

use bayesrr::io::{InMemoryStore, MarkerSource};
use bayesrr::kernel::Kernel;
use bayesrr::marker::Marker;
use bayesrr::prepare::GenotypeMatrix;
use bayesrr::types::{MarkerIndex, MarkerKind, Residual};

const INDIVIDUALS: usize = 20_000;
const ALLELE_FREQUENCIES: [f64; 6] = [0.001, 0.01, 0.05, 0.1, 0.25, 0.5];
const KINDS: [MarkerKind; 3] = [MarkerKind::Dense, MarkerKind::SparseEigen, MarkerKind::SparseRagged];

/// One marker per allele frequency, Hardy-Weinberg dosages with 1% missing calls.
fn cohort() -> GenotypeMatrix {
    let mut rng = Pcg64::seed_from_u64(2024);
    let columns = ALLELE_FREQUENCIES
        .iter()
        .map(|&p| {
            (0..INDIVIDUALS)
                .map(|_| {
                    if rng.gen_bool(0.01) {
                        None
                    } else {
                        Some(u8::from(rng.gen_bool(p)) + u8::from(rng.gen_bool(p)))
                    }
                })
                .collect()
        })
        .collect();
    // Columns are generated for exactly INDIVIDUALS rows.
    match GenotypeMatrix::from_columns(INDIVIDUALS, columns) {
        Ok(matrix) => matrix,
        Err(e) => panic!("benchmark cohort is malformed: {e}"),
    }
}

fn markers(matrix: &GenotypeMatrix, kind: MarkerKind) -> Vec<Marker> {
    let store = match InMemoryStore::new(matrix, kind, false) {
        Ok(store) => store,
        Err(e) => panic!("cannot build the {kind} store: {e}"),
    };
    (0..ALLELE_FREQUENCIES.len() as u32)
        .map(|j| match store.build(MarkerIndex(j)) {
            Ok(marker) => marker,
            Err(e) => panic!("cannot decode marker {j}: {e}"),
        })
        .collect()
}

fn bench_kernels(c: &mut Criterion) {
    let matrix = cohort();
    let mut rng = Pcg64::seed_from_u64(7);
    let residual = Residual::new((0..INDIVIDUALS).map(|_| rng.gen_range(-1.0..1.0)).collect());

    let mut dot = c.benchmark_group("dot_residual");
    dot.throughput(Throughput::Elements(INDIVIDUALS as u64));
    for kind in KINDS {
        for (marker, p) in markers(&matrix, kind).iter().zip(ALLELE_FREQUENCIES) {
            dot.bench_with_input(BenchmarkId::new(kind.to_string(), p), marker, |b, marker| {
                b.iter(|| black_box(marker.dot_residual(black_box(&residual))));
            });
        }
    }
    dot.finish();

    let mut update = c.benchmark_group("update_residual");
    update.throughput(Throughput::Elements(INDIVIDUALS as u64));
    for kind in KINDS {
        for (marker, p) in markers(&matrix, kind).iter().zip(ALLELE_FREQUENCIES) {
            let mut working = residual.clone();
            update.bench_with_input(BenchmarkId::new(kind.to_string(), p), marker, |b, marker| {
                // Alternating signs keep the residual bounded across iterations.
                let mut sign = 1.0;
                b.iter(|| {
                    marker.update_residual(&mut working, 0.0, black_box(0.01 * sign));
                    sign = -sign;
                });
            });
        }
    }
    update.finish();
}

criterion_group!(benches, bench_kernels);
criterion_main!(benches);
