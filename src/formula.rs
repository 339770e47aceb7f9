//! Formulas and events: the typed payloads that mutate policies.
//!
//! A [`Formula`] is either a ground atom (a fact) or a rule `head :- body`.
//! An [`Event`] pairs a formula with an [`Action`]; fact events change base
//! tables and rule events change a policy's rule set.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Tuple, Value};

// ---------------------------------------------------------------------------
// Terms and atoms
// ---------------------------------------------------------------------------

/// An argument position: a variable or a constant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Term {
    Var(String),
    Const(Value),
}

impl Term {
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Const(value.into())
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Self::Var(_))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(name) => write!(f, "{name}"),
            Self::Const(v) => write!(f, "{v}"),
        }
    }
}

/// A table reference applied to arguments, optionally qualified by the
/// policy that owns the table (`data:q(x)`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Atom {
    pub theory: Option<String>,
    pub table: String,
    pub args: Vec<Term>,
}

impl Atom {
    pub fn new(table: impl Into<String>, args: Vec<Term>) -> Self {
        Self {
            theory: None,
            table: table.into(),
            args,
        }
    }

    /// Qualify the atom with the policy that owns its table.
    pub fn in_theory(mut self, theory: impl Into<String>) -> Self {
        self.theory = Some(theory.into());
        self
    }

    /// Build a ground atom from a tuple.
    pub fn fact(table: impl Into<String>, tuple: &Tuple) -> Self {
        Self::new(
            table,
            tuple.values().iter().cloned().map(Term::Const).collect(),
        )
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Whether every argument is a constant.
    pub fn is_ground(&self) -> bool {
        self.args.iter().all(|t| !t.is_variable())
    }

    /// The constant arguments as a tuple, or `None` if any is a variable.
    pub fn to_tuple(&self) -> Option<Tuple> {
        self.args
            .iter()
            .map(|t| match t {
                Term::Const(v) => Some(v.clone()),
                Term::Var(_) => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Tuple::new)
    }

    /// Variables in first-occurrence order, without duplicates.
    pub fn variables(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for term in &self.args {
            if let Term::Var(name) = term {
                if seen.insert(name.as_str()) {
                    out.push(name.as_str());
                }
            }
        }
        out
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(theory) = &self.theory {
            write!(f, "{theory}:")?;
        }
        write!(f, "{}(", self.table)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// Rules and formulas
// ---------------------------------------------------------------------------

/// A Datalog rule: `head :- body_1, ..., body_n`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub head: Atom,
    pub body: Vec<Atom>,
}

impl Rule {
    pub fn new(head: Atom, body: Vec<Atom>) -> Self {
        Self { head, body }
    }

    /// Head variables that occur in no body literal.
    pub fn unbound_head_variables(&self) -> Vec<String> {
        let bound: BTreeSet<&str> = self.body.iter().flat_map(|a| a.variables()).collect();
        self.head
            .variables()
            .into_iter()
            .filter(|v| !bound.contains(v))
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :- ", self.head)?;
        for (i, atom) in self.body.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{atom}")?;
        }
        Ok(())
    }
}

/// The target of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Formula {
    Atom(Atom),
    Rule(Rule),
}

impl Formula {
    pub fn is_rule(&self) -> bool {
        matches!(self, Self::Rule(_))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(a) => write!(f, "{a}"),
            Self::Rule(r) => write!(f, "{r}"),
        }
    }
}

impl From<Atom> for Formula {
    fn from(atom: Atom) -> Self {
        Self::Atom(atom)
    }
}

impl From<Rule> for Formula {
    fn from(rule: Rule) -> Self {
        Self::Rule(rule)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[default]
    Insert,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// An insert or delete of a fact or rule.
///
/// `target` names the policy the event is meant for. When it is `None` the
/// receiver decides: data events go to the publisher's policy and policy
/// updates go to the engine's default policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub action: Action,
    pub formula: Formula,
    #[serde(default)]
    pub target: Option<String>,
}

impl Event {
    pub fn new(action: Action, formula: impl Into<Formula>) -> Self {
        Self {
            action,
            formula: formula.into(),
            target: None,
        }
    }

    pub fn insert(formula: impl Into<Formula>) -> Self {
        Self::new(Action::Insert, formula)
    }

    pub fn delete(formula: impl Into<Formula>) -> Self {
        Self::new(Action::Delete, formula)
    }

    pub fn for_policy(mut self, policy: impl Into<String>) -> Self {
        self.target = Some(policy.into());
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.action, self.formula)?;
        if let Some(target) = &self.target {
            write!(f, "@{target}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// A conjunctive query over materialized tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub atoms: Vec<Atom>,
}

impl Query {
    pub fn new(atoms: Vec<Atom>) -> Self {
        Self { atoms }
    }

    /// Variables across all atoms in first-occurrence order.
    ///
    /// Result tuples of `select` are projected onto this list.
    pub fn variables(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for atom in &self.atoms {
            for var in atom.variables() {
                if seen.insert(var.to_string()) {
                    out.push(var.to_string());
                }
            }
        }
        out
    }
}

impl From<Atom> for Query {
    fn from(atom: Atom) -> Self {
        Self { atoms: vec![atom] }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, atom) in self.atoms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{atom}")?;
        }
        Ok(())
    }
}
