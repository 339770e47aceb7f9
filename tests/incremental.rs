//! Randomised checks that incremental maintenance agrees with evaluating
//! every rule from scratch.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use policy_cage::compile::{parse_atom, parse_rule};
use policy_cage::formula::{Event, Rule};
use policy_cage::policy::{DEFAULT_POLICY, Relation, Runtime};
use policy_cage::schema::TableSchema;
use policy_cage::tuple;

const NODES: i64 = 6;

fn rules() -> Vec<Rule> {
    [
        "path(x, y) :- edge(x, y)",
        "path(x, z) :- edge(x, y), path(y, z)",
        "linked(x, y) :- src:link(x, y)",
        "linked(x, z) :- src:link(x, y), linked(y, z)",
        "both(x, y) :- path(x, y), linked(x, y)",
        "loop(x) :- path(x, x)",
    ]
    .iter()
    .map(|text| parse_rule(text).unwrap())
    .collect()
}

fn runtime() -> Runtime {
    let mut rt = Runtime::new();
    rt.create_policy("src").unwrap();
    rt.set_schema("src", "link", TableSchema::base(2)).unwrap();
    rt.set_schema(DEFAULT_POLICY, "edge", TableSchema::base(2))
        .unwrap();
    rt
}

fn random_edge(rng: &mut StdRng) -> String {
    format!("edge({}, {})", rng.gen_range(0..NODES), rng.gen_range(0..NODES))
}

fn random_snapshot(rng: &mut StdRng) -> Relation {
    let size = rng.gen_range(0..10);
    (0..size)
        .map(|_| tuple![rng.gen_range(0..NODES), rng.gen_range(0..NODES)])
        .collect()
}

fn assert_agrees(rt: &Runtime, step: usize) {
    assert_eq!(
        rt.derived_tables(),
        rt.naive_derived(),
        "incremental state diverged at step {step}"
    );
}

#[test]
fn random_fact_streams_match_naive_evaluation() {
    for seed in 0..8 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rt = runtime();
        for rule in rules() {
            rt.insert_rule(DEFAULT_POLICY, rule).unwrap();
        }

        for step in 0..150 {
            match rng.gen_range(0..10) {
                0..=3 => {
                    let fact = parse_atom(&random_edge(&mut rng)).unwrap();
                    rt.apply_event(DEFAULT_POLICY, &Event::insert(fact)).unwrap();
                }
                4..=6 => {
                    let fact = parse_atom(&random_edge(&mut rng)).unwrap();
                    rt.apply_event(DEFAULT_POLICY, &Event::delete(fact)).unwrap();
                }
                _ => {
                    let snapshot = random_snapshot(&mut rng);
                    rt.receive_update("src", "link", &snapshot).unwrap();
                }
            }
            assert_agrees(&rt, step);
        }
    }
}

#[test]
fn rule_churn_matches_naive_evaluation() {
    let all = rules();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut rt = runtime();
    let mut active: BTreeSet<usize> = BTreeSet::new();

    for step in 0..200 {
        if rng.gen_bool(0.3) {
            let i = rng.gen_range(0..all.len());
            if active.remove(&i) {
                assert!(rt.delete_rule(DEFAULT_POLICY, &all[i]).unwrap());
            } else if rt.insert_rule(DEFAULT_POLICY, all[i].clone()).is_ok() {
                // Refused while a table the rule reads is still undeclared.
                active.insert(i);
            }
        } else if rng.gen_bool(0.5) {
            let fact = parse_atom(&random_edge(&mut rng)).unwrap();
            let event = if rng.gen_bool(0.6) {
                Event::insert(fact)
            } else {
                Event::delete(fact)
            };
            rt.apply_event(DEFAULT_POLICY, &event).unwrap();
        } else {
            rt.receive_update("src", "link", &random_snapshot(&mut rng))
                .unwrap();
        }
        assert_agrees(&rt, step);
    }
}

#[test]
fn snapshot_diff_reports_changes() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut rt = runtime();
    let mut previous = Relation::new();

    for _ in 0..50 {
        let next = random_snapshot(&mut rng);
        let report = rt.receive_update("src", "link", &next).unwrap();
        assert_eq!(report.inserted, next.difference(&previous).count());
        assert_eq!(report.deleted, previous.difference(&next).count());
        assert_eq!(report.rejected, 0);
        assert_eq!(rt.policy("src").unwrap().table("link").cloned().unwrap_or_default(), next);
        previous = next;
    }
}

#[test]
fn repeated_snapshot_is_a_noop() {
    let mut rt = runtime();
    for rule in rules() {
        rt.insert_rule(DEFAULT_POLICY, rule).unwrap();
    }
    let snapshot: Relation = [tuple![1, 2], tuple![2, 3], tuple![3, 1]]
        .into_iter()
        .collect();
    let first = rt.receive_update("src", "link", &snapshot).unwrap();
    assert_eq!(first.inserted, 3);

    let before = rt.derived_tables();
    let again = rt.receive_update("src", "link", &snapshot).unwrap();
    assert!(again.is_noop());
    assert_eq!(rt.derived_tables(), before);
    assert_eq!(
        rt.select(
            DEFAULT_POLICY,
            &policy_cage::compile::parse_query("linked(1, x)").unwrap()
        )
        .unwrap()
        .len(),
        3
    );
}
