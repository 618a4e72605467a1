//! Benchmarks for the tuple store and handler-routing hot paths.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use trunkline::domain::{NodeId, ResourceKind};
use trunkline::federation::{Tuple, TupleStore, TupleTemplate, classify_ivr_handler};

fn bench_tuple_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("tuple_store");
    for size in [10usize, 100, 1000] {
        let store = TupleStore::new();
        let owners: Vec<NodeId> = (0..size).map(|_| NodeId::generate()).collect();
        for owner in &owners {
            store.put(&Tuple::resource(ResourceKind::Ivr, *owner), *owner);
            store.put(&Tuple::ivr_handler(*owner, "SIP/100", ""), *owner);
        }

        group.bench_with_input(BenchmarkId::new("hashed_lookup", size), &size, |b, _| {
            let template = TupleTemplate::exact(&Tuple::resource(ResourceKind::Ivr, owners[0]));
            b.iter(|| black_box(store.find_tuple(black_box(&template))));
        });
        group.bench_with_input(BenchmarkId::new("wildcard_scan", size), &size, |b, _| {
            let template = TupleTemplate::any_ivr_handler();
            b.iter(|| black_box(store.find_all(black_box(&template))));
        });
    }
    group.finish();
}

fn bench_handler_classification(c: &mut Criterion) {
    let owner = NodeId::generate();
    let tuples = vec![
        Tuple::ivr_handler(owner, "SIP/100", "2772001"),
        Tuple::ivr_handler(owner, "SIP/100", ""),
        Tuple::ivr_handler(owner, "", "2772001"),
        Tuple::ivr_handler(owner, "", ""),
    ];
    c.bench_function("classify_ivr_handlers", |b| {
        b.iter(|| {
            for tuple in &tuples {
                black_box(classify_ivr_handler(
                    black_box(tuple),
                    "SIP/100",
                    "2772001",
                ));
            }
        });
    });
}

criterion_group!(benches, bench_tuple_store, bench_handler_classification);
criterion_main!(benches);
