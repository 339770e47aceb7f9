//! Benchmarks for incremental maintenance.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use rand::{Rng, SeedableRng};

use policy_cage::compile::{parse_atom, parse_query, parse_rule};
use policy_cage::formula::Event;
use policy_cage::policy::{DEFAULT_POLICY, Relation, Runtime};
use policy_cage::schema::TableSchema;
use policy_cage::tuple;

fn closure_runtime(nodes: i64) -> Runtime {
    let mut rt = Runtime::new();
    rt.set_schema(DEFAULT_POLICY, "edge", TableSchema::base(2))
        .unwrap();
    for text in ["path(x, y) :- edge(x, y)", "path(x, z) :- edge(x, y), path(y, z)"] {
        rt.insert_rule(DEFAULT_POLICY, parse_rule(text).unwrap())
            .unwrap();
    }
    for i in 0..nodes - 1 {
        let fact = parse_atom(&format!("edge({i}, {})", i + 1)).unwrap();
        rt.apply_event(DEFAULT_POLICY, &Event::insert(fact)).unwrap();
    }
    rt
}

fn bench_insert_fact(c: &mut Criterion) {
    let base = closure_runtime(60);
    let fact = parse_atom("edge(59, 60)").unwrap();
    c.bench_function("insert_fact_chain60", |bench| {
        bench.iter_batched(
            || base.clone(),
            |mut rt| black_box(rt.apply_event(DEFAULT_POLICY, &Event::insert(fact.clone()))),
            BatchSize::SmallInput,
        )
    });
}

fn bench_delete_fact(c: &mut Criterion) {
    let base = closure_runtime(60);
    let fact = parse_atom("edge(30, 31)").unwrap();
    c.bench_function("delete_fact_chain60", |bench| {
        bench.iter_batched(
            || base.clone(),
            |mut rt| black_box(rt.apply_event(DEFAULT_POLICY, &Event::delete(fact.clone()))),
            BatchSize::SmallInput,
        )
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    let full: Relation = (0..1000)
        .map(|i| tuple![i, rng.gen_range(0..100_i64)])
        .collect();
    let mut shifted = full.clone();
    for i in 0..10 {
        shifted.remove(&tuple![i, rng.gen_range(0..100_i64)]);
        shifted.insert(tuple![1000 + i, 0]);
    }

    let mut base = Runtime::new();
    base.create_policy("src").unwrap();
    base.set_schema("src", "link", TableSchema::base(2)).unwrap();
    base.insert_rule(
        DEFAULT_POLICY,
        parse_rule("owned(x) :- src:link(x, 0)").unwrap(),
    )
    .unwrap();
    base.receive_update("src", "link", &full).unwrap();

    c.bench_function("snapshot_diff_1000", |bench| {
        bench.iter_batched(
            || base.clone(),
            |mut rt| black_box(rt.receive_update("src", "link", &shifted)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_select(c: &mut Criterion) {
    let rt = closure_runtime(60);
    let query = parse_query("path(0, x), edge(x, y)").unwrap();
    c.bench_function("select_join_chain60", |bench| {
        bench.iter(|| black_box(rt.select(DEFAULT_POLICY, &query).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_insert_fact,
    bench_delete_fact,
    bench_snapshot,
    bench_select
);
criterion_main!(benches);
