//! Minimal textual reader for atoms, rules, and conjunctive queries.
//!
//! Covers the positive Datalog fragment the engine evaluates:
//!
//! ```text
//! p(x) :- data:q(x), r(x, "web", 3)
//! ```
//!
//! Bare identifiers in argument position are variables; numbers and quoted
//! strings are constants. An optional `theory:` prefix qualifies an atom
//! with the policy that owns its table.

use miette::Diagnostic;
use thiserror::Error;

use crate::formula::{Atom, Formula, Query, Rule, Term};
use crate::value::Value;

#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error("syntax error at offset {offset}: {message}")]
    #[diagnostic(
        code(cage::compile::syntax),
        help(
            "Expected `table(arg, ...)`, optionally qualified as `policy:table(...)`, \
             or a rule `head(...) :- body(...), ...`. Strings must be quoted."
        )
    )]
    Syntax { offset: usize, message: String },

    #[error("expected {expected}, found a {found}")]
    #[diagnostic(
        code(cage::compile::unexpected_form),
        help("Atoms are facts or queries; rules need a `:-` and a non-empty body.")
    )]
    UnexpectedForm {
        expected: &'static str,
        found: &'static str,
    },
}

pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Parse a single fact/atom or rule.
pub fn parse_formula(text: &str) -> CompileResult<Formula> {
    let mut p = Parser::new(text);
    let head = p.atom()?;
    p.skip_ws();
    let formula = if p.eat(":-") {
        let body = p.conjunction()?;
        Formula::Rule(Rule::new(head, body))
    } else {
        Formula::Atom(head)
    };
    p.finish()?;
    Ok(formula)
}

pub fn parse_atom(text: &str) -> CompileResult<Atom> {
    match parse_formula(text)? {
        Formula::Atom(a) => Ok(a),
        Formula::Rule(_) => Err(CompileError::UnexpectedForm {
            expected: "atom",
            found: "rule",
        }),
    }
}

pub fn parse_rule(text: &str) -> CompileResult<Rule> {
    match parse_formula(text)? {
        Formula::Rule(r) => Ok(r),
        Formula::Atom(_) => Err(CompileError::UnexpectedForm {
            expected: "rule",
            found: "atom",
        }),
    }
}

/// Parse a comma-separated conjunction of atoms.
pub fn parse_query(text: &str) -> CompileResult<Query> {
    let mut p = Parser::new(text);
    let atoms = p.conjunction()?;
    p.finish()?;
    Ok(Query::new(atoms))
}

// ---------------------------------------------------------------------------
// Recursive-descent parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> CompileResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{token}`")))
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn finish(&mut self) -> CompileResult<()> {
        self.skip_ws();
        if self.pos == self.src.len() {
            Ok(())
        } else {
            Err(self.error(format!("unexpected trailing input `{}`", self.rest())))
        }
    }

    fn conjunction(&mut self) -> CompileResult<Vec<Atom>> {
        let mut atoms = vec![self.atom()?];
        while self.eat(",") {
            atoms.push(self.atom()?);
        }
        Ok(atoms)
    }

    fn ident(&mut self) -> CompileResult<String> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|&(i, c)| !(c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("expected identifier"));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn atom(&mut self) -> CompileResult<Atom> {
        let first = self.ident()?;
        // `data:q(...)` qualifies; `:-` does not.
        let (theory, table) = if self.rest().starts_with(':') && !self.rest().starts_with(":-") {
            self.pos += 1;
            (Some(first), self.ident()?)
        } else {
            (None, first)
        };
        self.expect("(")?;
        let mut args = Vec::new();
        if !self.eat(")") {
            loop {
                args.push(self.term()?);
                if self.eat(")") {
                    break;
                }
                self.expect(",")?;
            }
        }
        Ok(Atom {
            theory,
            table,
            args,
        })
    }

    fn term(&mut self) -> CompileResult<Term> {
        self.skip_ws();
        match self.peek() {
            Some(q @ ('"' | '\'')) => self.string(q),
            Some(c) if c.is_ascii_digit() || c == '-' => self.number(),
            Some(_) => Ok(Term::Var(self.ident()?)),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn string(&mut self, quote: char) -> CompileResult<Term> {
        let start = self.pos;
        self.pos += quote.len_utf8();
        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                }
                c if c == quote => {
                    self.pos += i + c.len_utf8();
                    return Ok(Term::Const(Value::Str(out)));
                }
                c => out.push(c),
            }
        }
        self.pos = start;
        Err(self.error("unterminated string"))
    }

    fn number(&mut self) -> CompileResult<Term> {
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && c == '-')))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let text = &rest[..len];
        let value = if text.contains('.') {
            text.parse::<f64>().map(Value::Float).ok()
        } else {
            text.parse::<i64>().map(Value::Int).ok()
        };
        match value {
            Some(v) => {
                self.pos += len;
                Ok(Term::Const(v))
            }
            None => Err(self.error(format!("invalid number `{text}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fact() {
        let atom = parse_atom("p(1, \"a b\", 2.5)").unwrap();
        assert_eq!(atom.table, "p");
        assert!(atom.is_ground());
        assert_eq!(atom.to_tuple(), Some(crate::tuple![1, "a b", 2.5]));
    }

    #[test]
    fn parses_qualified_rule() {
        let rule = parse_rule("p(x) :- data:q(x), r(x, y)").unwrap();
        assert_eq!(rule.head.table, "p");
        assert_eq!(rule.body.len(), 2);
        assert_eq!(rule.body[0].theory.as_deref(), Some("data"));
        assert_eq!(rule.body[1].args[1], Term::var("y"));
        assert_eq!(rule.to_string(), "p(x) :- data:q(x), r(x, y)");
    }

    #[test]
    fn parses_conjunctive_query() {
        let q = parse_query("nova:servers(id, name), p(id)").unwrap();
        assert_eq!(q.atoms.len(), 2);
        assert_eq!(q.variables(), vec!["id", "name"]);
    }

    #[test]
    fn single_quotes_and_negative_numbers() {
        let atom = parse_atom("q('x', -3)").unwrap();
        assert_eq!(atom.to_tuple(), Some(crate::tuple!["x", -3]));
    }

    #[test]
    fn zero_arity_atom() {
        let atom = parse_atom("alarm()").unwrap();
        assert_eq!(atom.arity(), 0);
    }

    #[test]
    fn reports_offset_of_syntax_error() {
        let err = parse_formula("p(x").unwrap_err();
        match err {
            CompileError::Syntax { offset, .. } => assert_eq!(offset, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_trailing_garbage_and_wrong_form() {
        assert!(parse_formula("p(1) q(2)").is_err());
        assert!(matches!(
            parse_rule("p(1)"),
            Err(CompileError::UnexpectedForm { .. })
        ));
        assert!(parse_formula("p(x) :- ").is_err());
    }
}
