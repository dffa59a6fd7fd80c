//! 🧪 bulk_bench — how fast can we staple meta lines to payloads?
//!
//! The batch builder sits on the hot path of every single log event, so it
//! gets numbers instead of feelings.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use omes::bulk::{Batch, estimate_record_size, render_meta};
use omes::event::{Keys, WriteOperation};

fn full_keys() -> Keys<'static> {
    Keys {
        index: Some("logs-2024.01.01"),
        doc_type: None,
        parent: Some("host-42"),
        bulk_id: Some("0123456789abcdef0123456789abcdef"),
        pipeline: Some("geoip"),
    }
}

fn bench_render_meta(c: &mut Criterion) {
    let keys = full_keys();
    c.bench_function("render_meta/index_all_keys", |b| {
        b.iter(|| render_meta(WriteOperation::Index, black_box(&keys), false))
    });

    let sparse = Keys {
        index: Some("logs"),
        doc_type: None,
        parent: None,
        bulk_id: None,
        pipeline: None,
    };
    c.bench_function("render_meta/index_sparse", |b| {
        b.iter(|| render_meta(WriteOperation::Index, black_box(&sparse), false))
    });
}

fn bench_estimate(c: &mut Criterion) {
    let keys = full_keys();
    c.bench_function("estimate_record_size", |b| {
        b.iter(|| estimate_record_size(WriteOperation::Create, black_box(&keys), false, 256))
    });
}

fn bench_batch_assembly(c: &mut Criterion) {
    let keys = Keys {
        index: Some("logs"),
        doc_type: None,
        parent: None,
        bulk_id: None,
        pipeline: None,
    };
    let meta = render_meta(WriteOperation::Index, &keys, false);
    let payload =
        "{\"message\":\"the quick brown fox jumped over the lazy log line\",\"severity\":6}";

    c.bench_function("batch/append_1k_records", |b| {
        b.iter(|| {
            let mut batch = Batch::new();
            for _ in 0..1000 {
                batch.append(black_box(&meta), black_box(payload));
            }
            batch.len()
        })
    });
}

criterion_group!(benches, bench_render_meta, bench_estimate, bench_batch_assembly);
criterion_main!(benches);
