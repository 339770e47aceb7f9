//! Unification, conjunctive joins and the rule dependency index.
//!
//! Evaluation is positive Datalog over sets of tuples. A body is solved left
//! to right by nested-loop join; callers order the goals so the smallest
//! input (usually a delta) comes first.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;

use crate::formula::{Atom, Rule, Term};
use crate::value::{Tuple, Value};

use super::store::{Relation, TableId};

/// Variable assignments accumulated while solving a body.
pub(super) type Binding = HashMap<String, Value>;

/// Shared empty relation for tables that were never populated.
pub(super) static EMPTY: Relation = BTreeSet::new();

/// Table an atom reads, resolved against the policy the atom appears in.
pub(super) fn resolve(policy: &str, atom: &Atom) -> TableId {
    TableId::new(atom.theory.as_deref().unwrap_or(policy), atom.table.as_str())
}

/// Extend `binding` so that `atom` matches `row`.
pub(super) fn unify(atom: &Atom, row: &Tuple, binding: &Binding) -> Option<Binding> {
    if atom.arity() != row.arity() {
        return None;
    }
    let mut out = binding.clone();
    for (term, value) in atom.args.iter().zip(row.values()) {
        match term {
            Term::Const(c) => {
                if c != value {
                    return None;
                }
            }
            Term::Var(name) => match out.get(name) {
                Some(bound) if bound != value => return None,
                Some(_) => {}
                None => {
                    out.insert(name.clone(), value.clone());
                }
            },
        }
    }
    Some(out)
}

/// All bindings extending `seed` that satisfy every goal.
pub(super) fn solve(goals: &[(&Atom, &Relation)], seed: Binding) -> Vec<Binding> {
    let mut frontier = vec![seed];
    for (atom, rows) in goals {
        let mut next = Vec::new();
        for binding in &frontier {
            for row in rows.iter() {
                if let Some(extended) = unify(atom, row, binding) {
                    next.push(extended);
                }
            }
        }
        if next.is_empty() {
            return next;
        }
        frontier = next;
    }
    frontier
}

/// Ground `atom` under `binding`. `None` if a variable is unbound.
pub(super) fn instantiate(atom: &Atom, binding: &Binding) -> Option<Tuple> {
    atom.args
        .iter()
        .map(|term| match term {
            Term::Const(v) => Some(v.clone()),
            Term::Var(name) => binding.get(name).cloned(),
        })
        .collect::<Option<Vec<_>>>()
        .map(Tuple::new)
}

/// Values of `vars` under `binding`, in order.
pub(super) fn project(vars: &[String], binding: &Binding) -> Option<Tuple> {
    vars.iter()
        .map(|v| binding.get(v).cloned())
        .collect::<Option<Vec<_>>>()
        .map(Tuple::new)
}

// ---------------------------------------------------------------------------
// Rule index
// ---------------------------------------------------------------------------

/// A rule with its head and body tables resolved.
#[derive(Debug, Clone)]
pub(super) struct CompiledRule {
    pub rule: Rule,
    pub head: TableId,
    pub body: Vec<TableId>,
}

/// All rules of all policies, indexed by the tables they read and define,
/// plus the table dependency graph (edge `body -> head`).
#[derive(Debug, Clone, Default)]
pub(super) struct RuleIndex {
    rules: Vec<CompiledRule>,
    readers: HashMap<TableId, Vec<usize>>,
    definers: HashMap<TableId, Vec<usize>>,
    graph: DiGraph<TableId, ()>,
    nodes: HashMap<TableId, NodeIndex>,
}

impl RuleIndex {
    pub fn build<'a, I>(policies: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a BTreeSet<Rule>)>,
    {
        let mut index = Self::default();
        for (policy, rules) in policies {
            for rule in rules {
                index.add(policy, rule);
            }
        }
        index
    }

    fn add(&mut self, policy: &str, rule: &Rule) {
        let compiled = CompiledRule {
            rule: rule.clone(),
            head: resolve(policy, &rule.head),
            body: rule.body.iter().map(|a| resolve(policy, a)).collect(),
        };
        let idx = self.rules.len();
        let head_node = self.node(&compiled.head);
        let mut seen = BTreeSet::new();
        for table in &compiled.body {
            if seen.insert(table) {
                self.readers.entry(table.clone()).or_default().push(idx);
                let body_node = self.node(table);
                self.graph.update_edge(body_node, head_node, ());
            }
        }
        self.definers
            .entry(compiled.head.clone())
            .or_default()
            .push(idx);
        self.rules.push(compiled);
    }

    fn node(&mut self, table: &TableId) -> NodeIndex {
        if let Some(&n) = self.nodes.get(table) {
            return n;
        }
        let n = self.graph.add_node(table.clone());
        self.nodes.insert(table.clone(), n);
        n
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn rule(&self, idx: usize) -> &CompiledRule {
        &self.rules[idx]
    }

    /// Rules with `table` somewhere in their body.
    pub fn readers_of(&self, table: &TableId) -> &[usize] {
        self.readers.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Rules whose head is `table`.
    pub fn definers_of(&self, table: &TableId) -> &[usize] {
        self.definers.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Heads of all rules.
    pub fn heads(&self) -> BTreeSet<TableId> {
        self.definers.keys().cloned().collect()
    }

    /// `table` and every table whose content can depend on it.
    pub fn downstream(&self, table: &TableId) -> BTreeSet<TableId> {
        let mut out = BTreeSet::from([table.clone()]);
        if let Some(&start) = self.nodes.get(table) {
            let mut bfs = Bfs::new(&self.graph, start);
            while let Some(n) = bfs.next(&self.graph) {
                out.insert(self.graph[n].clone());
            }
        }
        out
    }
}

/// Group tuples by table, for batched propagation.
pub(super) type Delta = BTreeMap<TableId, Relation>;

pub(super) fn single(table: TableId, rows: Relation) -> Delta {
    let mut delta = Delta::new();
    if !rows.is_empty() {
        delta.insert(table, rows);
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{parse_atom, parse_rule};
    use crate::tuple;

    fn rows(items: &[Tuple]) -> Relation {
        items.iter().cloned().collect()
    }

    #[test]
    fn unify_respects_constants_and_repeats() {
        let atom = parse_atom("r(x, x, 3)").unwrap();
        assert!(unify(&atom, &tuple![1, 1, 3], &Binding::new()).is_some());
        assert!(unify(&atom, &tuple![1, 2, 3], &Binding::new()).is_none());
        assert!(unify(&atom, &tuple![1, 1, 4], &Binding::new()).is_none());
        assert!(unify(&atom, &tuple![1, 1], &Binding::new()).is_none());
    }

    #[test]
    fn solve_joins_on_shared_variables() {
        let edge = parse_atom("e(x, y)").unwrap();
        let label = parse_atom("l(y, name)").unwrap();
        let edges = rows(&[tuple![1, 2], tuple![2, 3]]);
        let labels = rows(&[tuple![2, "two"], tuple![4, "four"]]);

        let out = solve(&[(&edge, &edges), (&label, &labels)], Binding::new());
        assert_eq!(out.len(), 1);
        let vars = vec!["x".to_string(), "name".to_string()];
        assert_eq!(project(&vars, &out[0]), Some(tuple![1, "two"]));
    }

    #[test]
    fn instantiate_needs_every_variable() {
        let head = parse_atom("p(x, 7)").unwrap();
        let mut b = Binding::new();
        assert_eq!(instantiate(&head, &b), None);
        b.insert("x".into(), Value::from("a"));
        assert_eq!(instantiate(&head, &b), Some(tuple!["a", 7]));
    }

    #[test]
    fn downstream_follows_rule_edges() {
        let rules: BTreeSet<Rule> = [
            parse_rule("p(x) :- data:q(x)").unwrap(),
            parse_rule("r(x) :- p(x)").unwrap(),
            parse_rule("s(x) :- t(x)").unwrap(),
        ]
        .into_iter()
        .collect();
        let index = RuleIndex::build([("classification", &rules)]);

        let from_q = index.downstream(&TableId::new("data", "q"));
        assert!(from_q.contains(&TableId::new("classification", "p")));
        assert!(from_q.contains(&TableId::new("classification", "r")));
        assert!(!from_q.contains(&TableId::new("classification", "s")));
        assert_eq!(
            index.readers_of(&TableId::new("data", "q")).len(),
            1
        );
        assert_eq!(
            index.definers_of(&TableId::new("classification", "r")).len(),
            1
        );
    }
}
