//! Benchmark artifact fingerprint derivation.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use taskforge::core::{Artifact, ArtifactFlags};

fn bench_fingerprints(c: &mut Criterion) {
    c.bench_function("fingerprint_cached_file", |b| {
        b.iter(|| {
            Artifact::file(
                black_box("/data/experiments/run-042/input.bin"),
                "input.bin",
                ArtifactFlags::cached(),
            )
            .unwrap()
        })
    });

    c.bench_function("fingerprint_uncached_buffer", |b| {
        let payload = vec![0x5a_u8; 64 * 1024];
        b.iter(|| {
            Artifact::buffer(black_box(payload.clone()), "payload", ArtifactFlags::default())
                .unwrap()
        })
    });

    c.bench_function("fingerprint_url", |b| {
        b.iter(|| {
            Artifact::url(
                black_box("https://mirror.example.org/datasets/reference.fa.gz"),
                "reference.fa.gz",
                ArtifactFlags::cached(),
            )
            .unwrap()
        })
    });
}

criterion_group!(benches, bench_fingerprints);
criterion_main!(benches);
