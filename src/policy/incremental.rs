//! Incremental maintenance of derived tables across all policies.
//!
//! Fact inserts propagate by semi-naive evaluation: each round joins only the
//! tuples that are new since the previous round. Fact deletes use
//! delete-and-rederive: everything with a derivation through a deleted tuple
//! is removed against the old state, then any removed tuple that still has
//! a one-step derivation from what remains is put back and propagated as an
//! insert. Rule changes re-derive the affected tables from scratch.
//!
//! Every mutating operation validates before it touches a table, so a
//! rejected event leaves all tables as they were.

use std::collections::{BTreeMap, BTreeSet};

use crate::formula::{Action, Atom, Event, Formula, Query, Rule};
use crate::schema::{Schema, TableKind, TableSchema};
use crate::value::Tuple;

use super::error::{PolicyError, PolicyResult, RuleViolation};
use super::eval::{
    Binding, Delta, EMPTY, RuleIndex, instantiate, project, resolve, single, solve, unify,
};
use super::store::{Policy, PolicyState, Relation, TableId, UpdateReport};

/// Policy that exists from engine creation and receives policy updates
/// without an explicit target.
pub const DEFAULT_POLICY: &str = "classification";

/// All policies of one engine plus the compiled rule index.
#[derive(Debug, Clone)]
pub struct Runtime {
    policies: BTreeMap<String, Policy>,
    index: RuleIndex,
    default_policy: String,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_default_policy(DEFAULT_POLICY)
    }

    pub fn with_default_policy(name: &str) -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(name.to_string(), Policy::new(name));
        Self {
            policies,
            index: RuleIndex::default(),
            default_policy: name.to_string(),
        }
    }

    pub fn default_policy(&self) -> &str {
        &self.default_policy
    }

    // -----------------------------------------------------------------------
    // Policies and schemas
    // -----------------------------------------------------------------------

    pub fn create_policy(&mut self, name: &str) -> PolicyResult<()> {
        if self.policies.contains_key(name) {
            return Err(PolicyError::DuplicatePolicy {
                name: name.to_string(),
            });
        }
        self.policies.insert(name.to_string(), Policy::new(name));
        tracing::info!(policy = name, "created policy");
        Ok(())
    }

    /// Drop a policy and everything it holds. Rules in other policies that
    /// read its tables stay, and now see them empty.
    pub fn delete_policy(&mut self, name: &str) -> PolicyResult<()> {
        if self.policies.remove(name).is_none() {
            return Err(unknown(name));
        }
        self.reindex();
        let heads = self.index.heads();
        self.rederive(heads);
        tracing::info!(policy = name, "deleted policy");
        Ok(())
    }

    pub fn policy(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    pub fn contains_policy(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    pub fn policy_names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// Declare one table of `policy`. Declaring a base table binds the
    /// policy's schema: from then on undeclared tables are refused.
    pub fn set_schema(&mut self, policy: &str, table: &str, schema: TableSchema) -> PolicyResult<()> {
        let p = self.policy_mut(policy)?;
        let kind = schema.kind;
        p.schema.declare_schema(table, schema)?;
        if kind == TableKind::Base {
            p.schema_bound = true;
            if p.state == PolicyState::Unconfigured {
                p.state = PolicyState::SchemaBound;
            }
        }
        p.touch();
        tracing::debug!(policy, table, "declared table");
        Ok(())
    }

    /// Declare every table of an exported schema. Stops at the first
    /// conflict; tables declared before it stay declared.
    pub fn bind_schema(&mut self, policy: &str, schema: &Schema) -> PolicyResult<()> {
        for (table, decl) in schema {
            self.set_schema(policy, table, decl.clone())?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Apply one event. `policy` is used unless the event names its own
    /// target. Returns whether anything changed.
    pub fn apply_event(&mut self, policy: &str, event: &Event) -> PolicyResult<bool> {
        let policy = event.target.as_deref().unwrap_or(policy);
        match (&event.formula, event.action) {
            (Formula::Rule(rule), Action::Insert) => self.insert_rule(policy, rule.clone()),
            (Formula::Rule(rule), Action::Delete) => self.delete_rule(policy, rule),
            (Formula::Atom(atom), Action::Insert) => self.insert_fact(policy, atom),
            (Formula::Atom(atom), Action::Delete) => self.delete_fact(policy, atom),
        }
    }

    pub fn insert_rule(&mut self, policy: &str, rule: Rule) -> PolicyResult<bool> {
        self.validate_rule(policy, &rule)
            .map_err(|reason| PolicyError::RuleValidation {
                rule: rule.to_string(),
                reason,
            })?;
        let head = resolve(policy, &rule.head);
        let p = self.policy_mut(policy)?;
        if p.rules.contains(&rule) {
            return Ok(false);
        }
        p.schema
            .declare_schema(&head.table, TableSchema::derived(rule.head.arity()))?;
        self.declare_read_tables(policy, &rule)?;
        let p = self.policy_mut(policy)?;
        tracing::debug!(policy, rule = %rule, "inserted rule");
        p.rules.insert(rule);
        p.touch();

        self.reindex();
        self.rederive(BTreeSet::from([head]));
        Ok(true)
    }

    pub fn delete_rule(&mut self, policy: &str, rule: &Rule) -> PolicyResult<bool> {
        let p = self.policy_mut(policy)?;
        if !p.rules.remove(rule) {
            return Ok(false);
        }
        p.touch();
        tracing::debug!(policy, rule = %rule, "deleted rule");

        self.reindex();
        self.rederive(BTreeSet::from([resolve(policy, &rule.head)]));
        Ok(true)
    }

    pub fn insert_fact(&mut self, policy: &str, atom: &Atom) -> PolicyResult<bool> {
        let (id, tuple) = self.check_fact(policy, atom, true)?;
        if self.contains(&id, &tuple) {
            return Ok(false);
        }
        let delta = single(id.clone(), Relation::from([tuple]));
        self.absorb(&delta);
        let derived = self.propagate_inserts(delta);
        self.touch(&id.policy);
        tracing::trace!(table = %id, derived, "inserted fact");
        Ok(true)
    }

    pub fn delete_fact(&mut self, policy: &str, atom: &Atom) -> PolicyResult<bool> {
        let (id, tuple) = self.check_fact(policy, atom, false)?;
        if !self.contains(&id, &tuple) {
            return Ok(false);
        }
        self.propagate_deletes(single(id.clone(), Relation::from([tuple])));
        self.touch(&id.policy);
        tracing::trace!(table = %id, "deleted fact");
        Ok(true)
    }

    /// Replace the content of an external table with `snapshot`.
    ///
    /// Rows whose arity does not match the table are dropped and recorded as
    /// rejections; the rest is diffed against the previous snapshot and
    /// applied as deletes, then inserts.
    pub fn receive_update(
        &mut self,
        policy: &str,
        table: &str,
        snapshot: &Relation,
    ) -> PolicyResult<UpdateReport> {
        let p = self.policy_mut(policy)?;
        if p.is_derived(table) {
            return Err(PolicyError::DerivedTableWrite {
                policy: policy.to_string(),
                table: table.to_string(),
            });
        }
        let arity = match p.schema.arity(table) {
            Some(arity) => Some(arity),
            None if p.schema_bound => None,
            None => {
                let inferred = infer_arity(snapshot);
                if let Some(arity) = inferred {
                    p.schema.declare(table, arity)?;
                    tracing::debug!(policy, table, arity, "inferred table arity");
                }
                inferred
            }
        };

        let mut accepted = Relation::new();
        let mut rejected = 0;
        for row in snapshot {
            match arity {
                Some(a) if row.arity() == a => {
                    accepted.insert(row.clone());
                }
                Some(a) => {
                    let reason = format!("arity {} does not match declared arity {a}", row.arity());
                    p.reject(table, row.clone(), reason);
                    rejected += 1;
                }
                None => {
                    p.reject(table, row.clone(), "table not declared in bound schema");
                    rejected += 1;
                }
            }
        }

        let old = p.snapshots.get(table).cloned().unwrap_or_default();
        let to_delete: Relation = old.difference(&accepted).cloned().collect();
        let to_insert: Relation = accepted.difference(&old).cloned().collect();
        p.snapshots.insert(table.to_string(), accepted);
        p.state = PolicyState::Active;
        p.touch();

        let id = TableId::new(policy, table);
        let present: Relation = to_delete
            .iter()
            .filter(|t| self.contains(&id, t))
            .cloned()
            .collect();
        if !present.is_empty() {
            self.propagate_deletes(single(id.clone(), present));
        }
        let fresh: Relation = to_insert
            .iter()
            .filter(|t| !self.contains(&id, t))
            .cloned()
            .collect();
        if !fresh.is_empty() {
            let delta = single(id.clone(), fresh);
            self.absorb(&delta);
            self.propagate_inserts(delta);
        }

        let report = UpdateReport {
            inserted: to_insert.len(),
            deleted: to_delete.len(),
            rejected,
        };
        tracing::debug!(
            table = %id,
            inserted = report.inserted,
            deleted = report.deleted,
            rejected = report.rejected,
            "applied snapshot"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Evaluate a conjunctive query in the context of `policy`.
    ///
    /// Each result is the tuple of the query's variables, in order of first
    /// occurrence. A satisfied ground query yields one empty tuple.
    pub fn select(&self, policy: &str, query: &Query) -> PolicyResult<BTreeSet<Tuple>> {
        if !self.policies.contains_key(policy) {
            return Err(unknown(policy));
        }
        let mut goals = Vec::with_capacity(query.atoms.len());
        for atom in &query.atoms {
            let id = resolve(policy, atom);
            if !self.policies.contains_key(&id.policy) {
                return Err(unknown(&id.policy));
            }
            goals.push((atom, self.relation(&id).unwrap_or(&EMPTY)));
        }
        let vars = query.variables();
        Ok(solve(&goals, Binding::new())
            .iter()
            .filter_map(|b| project(&vars, b))
            .collect())
    }

    /// Current rows of a table.
    pub fn relation(&self, id: &TableId) -> Option<&Relation> {
        self.policies.get(&id.policy)?.tables.get(&id.table)
    }

    /// Materialized content of every non-empty derived table.
    pub fn derived_tables(&self) -> BTreeMap<TableId, Relation> {
        let mut out = BTreeMap::new();
        for (name, policy) in &self.policies {
            for (table, rows) in &policy.tables {
                if policy.is_derived(table) && !rows.is_empty() {
                    out.insert(TableId::new(name.as_str(), table.as_str()), rows.clone());
                }
            }
        }
        out
    }

    /// Evaluate every rule from scratch over the current base tables.
    ///
    /// Independent of the incremental path; the result should always equal
    /// [`derived_tables`](Self::derived_tables).
    pub fn naive_derived(&self) -> BTreeMap<TableId, Relation> {
        let mut db: BTreeMap<TableId, Relation> = BTreeMap::new();
        for (name, policy) in &self.policies {
            for (table, rows) in &policy.tables {
                if !policy.is_derived(table) && !rows.is_empty() {
                    db.insert(TableId::new(name.as_str(), table.as_str()), rows.clone());
                }
            }
        }
        loop {
            let mut fresh: Vec<(TableId, Tuple)> = Vec::new();
            for compiled in self.index.rules() {
                let goals: Vec<(&Atom, &Relation)> = compiled
                    .rule
                    .body
                    .iter()
                    .zip(&compiled.body)
                    .map(|(atom, id)| (atom, db.get(id).unwrap_or(&EMPTY)))
                    .collect();
                for binding in solve(&goals, Binding::new()) {
                    if let Some(tuple) = instantiate(&compiled.rule.head, &binding) {
                        if !db.get(&compiled.head).is_some_and(|r| r.contains(&tuple)) {
                            fresh.push((compiled.head.clone(), tuple));
                        }
                    }
                }
            }
            if fresh.is_empty() {
                break;
            }
            for (id, tuple) in fresh {
                db.entry(id).or_default().insert(tuple);
            }
        }
        db.retain(|id, rows| {
            !rows.is_empty()
                && self
                    .policies
                    .get(&id.policy)
                    .is_some_and(|p| p.is_derived(&id.table))
        });
        db
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn validate_rule(&self, policy: &str, rule: &Rule) -> Result<(), RuleViolation> {
        let own = self
            .policies
            .get(policy)
            .ok_or_else(|| RuleViolation::UnknownPolicy {
                policy: policy.to_string(),
            })?;
        if rule.body.is_empty() {
            return Err(RuleViolation::EmptyBody);
        }
        let unbound = rule.unbound_head_variables();
        if !unbound.is_empty() {
            return Err(RuleViolation::UnsafeHead { variables: unbound });
        }
        if let Some(theory) = &rule.head.theory {
            if theory != policy {
                return Err(RuleViolation::ForeignHead {
                    policy: theory.clone(),
                });
            }
        }

        let head = &rule.head;
        match own.schema.get(&head.table) {
            Some(decl) if decl.kind == TableKind::Base => {
                return Err(RuleViolation::BaseTableHead {
                    table: head.table.clone(),
                });
            }
            Some(decl) if decl.arity != head.arity() => {
                return Err(RuleViolation::ArityMismatch {
                    policy: policy.to_string(),
                    table: head.table.clone(),
                    declared: decl.arity,
                    used: head.arity(),
                });
            }
            _ => {}
        }

        for atom in &rule.body {
            let id = resolve(policy, atom);
            let target = self
                .policies
                .get(&id.policy)
                .ok_or_else(|| RuleViolation::UnknownPolicy {
                    policy: id.policy.clone(),
                })?;
            let recursive = id.policy == policy && id.table == head.table;
            let declared = if recursive {
                Some(head.arity())
            } else {
                target.schema.arity(&id.table)
            };
            match declared {
                Some(arity) if arity != atom.arity() => {
                    return Err(RuleViolation::ArityMismatch {
                        policy: id.policy,
                        table: id.table,
                        declared: arity,
                        used: atom.arity(),
                    });
                }
                Some(_) => {}
                None if target.schema_bound => {
                    return Err(RuleViolation::UndeclaredTable {
                        policy: id.policy,
                        table: id.table,
                    });
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Pin the arity of every table the rule reads from an unbound policy,
    /// so later facts of another arity are refused instead of silently
    /// never matching.
    fn declare_read_tables(&mut self, policy: &str, rule: &Rule) -> PolicyResult<()> {
        for atom in &rule.body {
            let id = resolve(policy, atom);
            let target = self.policy_mut(&id.policy)?;
            if target.schema_bound || target.schema.contains(&id.table) {
                continue;
            }
            target.schema.declare(&id.table, atom.arity())?;
            tracing::debug!(policy = %id.policy, table = %id.table, arity = atom.arity(), "declared table read by rule");
        }
        Ok(())
    }

    /// Resolve and check a fact. On insert, an undeclared table of an
    /// unbound policy is declared with the fact's arity. Arity and
    /// declaration failures are recorded as rejections.
    fn check_fact(&mut self, policy: &str, atom: &Atom, insert: bool) -> PolicyResult<(TableId, Tuple)> {
        let id = resolve(policy, atom);
        let tuple = atom.to_tuple().ok_or_else(|| PolicyError::NonGroundFact {
            fact: atom.to_string(),
        })?;
        let p = self.policy_mut(&id.policy)?;
        match p.schema.get(&id.table).map(|s| (s.kind, s.arity)) {
            Some((TableKind::Derived, _)) => Err(PolicyError::DerivedTableWrite {
                policy: id.policy,
                table: id.table,
            }),
            Some((TableKind::Base, arity)) if arity != tuple.arity() => {
                let err = PolicyError::ArityMismatch {
                    policy: id.policy.clone(),
                    table: id.table.clone(),
                    expected: arity,
                    actual: tuple.arity(),
                };
                p.reject(&id.table, tuple, err.to_string());
                Err(err)
            }
            Some(_) => Ok((id, tuple)),
            None if p.schema_bound => {
                let err = PolicyError::UndeclaredTable {
                    policy: id.policy.clone(),
                    table: id.table.clone(),
                };
                p.reject(&id.table, tuple, err.to_string());
                Err(err)
            }
            None if insert => {
                p.schema.declare(&id.table, tuple.arity())?;
                Ok((id, tuple))
            }
            // Deleting from a table that never existed changes nothing.
            None => Ok((id, tuple)),
        }
    }

    // -----------------------------------------------------------------------
    // Propagation
    // -----------------------------------------------------------------------

    fn reindex(&mut self) {
        self.index = RuleIndex::build(
            self.policies
                .iter()
                .map(|(name, p)| (name.as_str(), &p.rules)),
        );
    }

    fn policy_mut(&mut self, name: &str) -> PolicyResult<&mut Policy> {
        self.policies.get_mut(name).ok_or_else(|| unknown(name))
    }

    fn touch(&mut self, policy: &str) {
        if let Some(p) = self.policies.get_mut(policy) {
            p.touch();
        }
    }

    fn contains(&self, id: &TableId, tuple: &Tuple) -> bool {
        self.relation(id).is_some_and(|rows| rows.contains(tuple))
    }

    /// Head tuples of rule `idx`. With `delta = Some((pos, rows))` the body
    /// literal at `pos` reads `rows` instead of its table.
    fn fire(&self, idx: usize, delta: Option<(usize, &Relation)>) -> Vec<Tuple> {
        let compiled = self.index.rule(idx);
        let mut goals: Vec<(&Atom, &Relation)> = Vec::with_capacity(compiled.body.len());
        if let Some((pos, rows)) = delta {
            goals.push((&compiled.rule.body[pos], rows));
        }
        for (j, (atom, id)) in compiled.rule.body.iter().zip(&compiled.body).enumerate() {
            if delta.is_some_and(|(pos, _)| pos == j) {
                continue;
            }
            goals.push((atom, self.relation(id).unwrap_or(&EMPTY)));
        }
        solve(&goals, Binding::new())
            .iter()
            .filter_map(|b| instantiate(&compiled.rule.head, b))
            .collect()
    }

    /// Whether `tuple` has a one-step derivation into `table` from the
    /// current state.
    fn derivable(&self, table: &TableId, tuple: &Tuple) -> bool {
        self.index.definers_of(table).iter().any(|&idx| {
            let compiled = self.index.rule(idx);
            let Some(seed) = unify(&compiled.rule.head, tuple, &Binding::new()) else {
                return false;
            };
            let goals: Vec<(&Atom, &Relation)> = compiled
                .rule
                .body
                .iter()
                .zip(&compiled.body)
                .map(|(atom, id)| (atom, self.relation(id).unwrap_or(&EMPTY)))
                .collect();
            !solve(&goals, seed).is_empty()
        })
    }

    /// Add rows to their tables. Returns how many were new.
    fn absorb(&mut self, delta: &Delta) -> usize {
        let mut added = 0;
        for (id, rows) in delta {
            let Some(p) = self.policies.get_mut(&id.policy) else {
                continue;
            };
            let table = p.tables.entry(id.table.clone()).or_default();
            for row in rows {
                if table.insert(row.clone()) {
                    added += 1;
                }
            }
        }
        added
    }

    fn remove(&mut self, delta: &Delta) {
        for (id, rows) in delta {
            if let Some(table) = self
                .policies
                .get_mut(&id.policy)
                .and_then(|p| p.tables.get_mut(&id.table))
            {
                for row in rows {
                    table.remove(row);
                }
            }
        }
    }

    /// Semi-naive propagation of rows already added to their tables.
    /// Returns the number of derived rows added.
    fn propagate_inserts(&mut self, mut delta: Delta) -> usize {
        let mut total = 0;
        while !delta.is_empty() {
            let mut next = Delta::new();
            for idx in self.triggered(&delta) {
                let compiled = self.index.rule(idx);
                for (pos, body_id) in compiled.body.iter().enumerate() {
                    let Some(rows) = delta.get(body_id) else {
                        continue;
                    };
                    for tuple in self.fire(idx, Some((pos, rows))) {
                        if !self.contains(&compiled.head, &tuple) {
                            next.entry(compiled.head.clone()).or_default().insert(tuple);
                        }
                    }
                }
            }
            total += self.absorb(&next);
            delta = next;
        }
        total
    }

    /// Delete-and-rederive for rows still present in their tables.
    fn propagate_deletes(&mut self, deleted: Delta) {
        let mut over = Delta::new();
        let mut delta = deleted.clone();
        while !delta.is_empty() {
            let mut next = Delta::new();
            for idx in self.triggered(&delta) {
                let compiled = self.index.rule(idx);
                for (pos, body_id) in compiled.body.iter().enumerate() {
                    let Some(rows) = delta.get(body_id) else {
                        continue;
                    };
                    for tuple in self.fire(idx, Some((pos, rows))) {
                        let seen = over
                            .get(&compiled.head)
                            .is_some_and(|r| r.contains(&tuple));
                        if !seen && self.contains(&compiled.head, &tuple) {
                            next.entry(compiled.head.clone()).or_default().insert(tuple);
                        }
                    }
                }
            }
            for (id, rows) in &next {
                over.entry(id.clone())
                    .or_default()
                    .extend(rows.iter().cloned());
            }
            delta = next;
        }

        self.remove(&deleted);
        self.remove(&over);

        let mut rederived = Delta::new();
        for (id, rows) in &over {
            for tuple in rows {
                if self.derivable(id, tuple) {
                    rederived.entry(id.clone()).or_default().insert(tuple.clone());
                }
            }
        }
        let restored = self.absorb(&rederived);
        let cascaded = self.propagate_inserts(rederived);
        tracing::trace!(
            overdeleted = over.values().map(BTreeSet::len).sum::<usize>(),
            restored = restored + cascaded,
            "delete propagated"
        );
    }

    fn triggered(&self, delta: &Delta) -> BTreeSet<usize> {
        delta
            .keys()
            .flat_map(|id| self.index.readers_of(id).iter().copied())
            .collect()
    }

    /// Recompute `tables` and everything downstream of them from scratch.
    fn rederive(&mut self, tables: BTreeSet<TableId>) {
        let mut affected = BTreeSet::new();
        for table in &tables {
            affected.extend(self.index.downstream(table));
        }
        for id in &affected {
            if let Some(rows) = self
                .policies
                .get_mut(&id.policy)
                .and_then(|p| p.tables.get_mut(&id.table))
            {
                rows.clear();
            }
        }

        let mut seed = Delta::new();
        for id in &affected {
            for &idx in self.index.definers_of(id) {
                for tuple in self.fire(idx, None) {
                    seed.entry(id.clone()).or_default().insert(tuple);
                }
            }
        }
        let seeded = self.absorb(&seed);
        let derived = self.propagate_inserts(seed);
        tracing::debug!(
            tables = affected.len(),
            rows = seeded + derived,
            "re-derived tables"
        );
    }
}

fn unknown(name: &str) -> PolicyError {
    PolicyError::UnknownPolicy {
        name: name.to_string(),
    }
}

/// Most common row arity; ties go to the smaller arity.
fn infer_arity(rows: &Relation) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for row in rows {
        *counts.entry(row.arity()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a1, c1), (a2, c2)| c1.cmp(c2).then(a2.cmp(a1)))
        .map(|(arity, _)| arity)
}
