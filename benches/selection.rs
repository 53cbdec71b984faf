//! Candidate selection sits on the first-unit path of every destination
//! index; this keeps its cost visible as cluster snapshots grow.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio_pipeline_router::{select_candidate, SharedMembership};

fn populate(nodes: usize) -> SharedMembership {
    let membership = SharedMembership::new();
    membership.job_started();
    for i in 0..nodes {
        // Descending loads, no zeros: forces a full scan.
        membership.register(&format!("10.0.{}.{}", i / 256, i % 256), 9002, nodes - i);
    }
    membership
}

fn bench_select_candidate(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_candidate");
    for nodes in [4usize, 64, 1024] {
        let membership = populate(nodes);
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &membership, |b, m| {
            b.iter(|| black_box(select_candidate(m)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_select_candidate);
criterion_main!(benches);
