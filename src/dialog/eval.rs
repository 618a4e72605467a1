//! Dialog destinations and the `EVAL:` destination expression language.
//!
//! A destination is `PREVIOUS`, `CURRENT`, an absolute node name (stored
//! hashed), or an expression of the form
//! `EVAL: if(prev=greeting:bye) elif(last!menu:retry) else(menu)` whose
//! clauses test the visit history and short-circuit left to right.

use std::fmt;

use crate::domain::{ID_LEN, sha1_digest};
use crate::dialog::DialogError;

/// Hashed dialog-node name, the key nodes are stored and referenced under.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey([u8; ID_LEN]);

impl NodeKey {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(sha1_digest(name.as_bytes()))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// A fully resolved destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedDest {
    Previous,
    Current,
    Node(NodeKey),
}

/// A destination as written in the dialog definition.
#[derive(Debug, Clone)]
pub struct Destination {
    raw: String,
    kind: DestKind,
}

#[derive(Debug, Clone)]
enum DestKind {
    Previous,
    Current,
    Node(NodeKey),
    Eval(EvalExpr),
}

impl Destination {
    /// Parses a destination string; absolute node names are hashed.
    pub fn parse(raw: &str) -> Result<Self, DialogError> {
        let kind = match raw {
            "PREVIOUS" => DestKind::Previous,
            "CURRENT" => DestKind::Current,
            _ if raw.trim_start().starts_with("EVAL:") => DestKind::Eval(EvalExpr::parse(raw)?),
            name => DestKind::Node(NodeKey::from_name(name)),
        };
        Ok(Self {
            raw: raw.to_string(),
            kind,
        })
    }

    /// The destination as originally written.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Resolves against the visit history. Returns `None` only when an
    /// expression has no matching clause and no fallback.
    #[must_use]
    pub fn resolve(&self, visited: &[NodeKey]) -> Option<ResolvedDest> {
        match &self.kind {
            DestKind::Previous => Some(ResolvedDest::Previous),
            DestKind::Current => Some(ResolvedDest::Current),
            DestKind::Node(key) => Some(ResolvedDest::Node(*key)),
            DestKind::Eval(expr) => expr.evaluate(visited).map(|name| match name {
                "PREVIOUS" => ResolvedDest::Previous,
                "CURRENT" => ResolvedDest::Current,
                other => ResolvedDest::Node(NodeKey::from_name(other)),
            }),
        }
    }

    /// Every node name this destination can resolve to, for validation.
    #[must_use]
    pub fn referenced_names(&self) -> Vec<&str> {
        match &self.kind {
            DestKind::Previous | DestKind::Current => Vec::new(),
            DestKind::Node(_) => vec![self.raw.as_str()],
            DestKind::Eval(expr) => expr
                .clauses
                .iter()
                .map(|clause| clause.result.as_str())
                .chain(expr.fallback.as_deref())
                .filter(|name| *name != "PREVIOUS" && *name != "CURRENT")
                .collect(),
        }
    }
}

/// Membership/last-visited tests available in an expression clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvalTest {
    /// `prev=` — the subject appears anywhere in the visit history.
    PrevEq,
    /// `prev!` — the subject does not appear in the visit history.
    PrevNe,
    /// `last=` — the subject was the most recently visited node.
    LastEq,
    /// `last!` — the subject was not the most recently visited node.
    LastNe,
}

#[derive(Debug, Clone)]
struct EvalClause {
    test: EvalTest,
    subject: String,
    result: String,
}

/// A parsed `EVAL:` expression.
#[derive(Debug, Clone)]
pub struct EvalExpr {
    clauses: Vec<EvalClause>,
    fallback: Option<String>,
}

impl EvalExpr {
    /// Parses `EVAL: if(test=subject:result) … else(result)`.
    pub fn parse(raw: &str) -> Result<Self, DialogError> {
        let body = raw
            .trim()
            .strip_prefix("EVAL:")
            .ok_or_else(|| DialogError::BadDestination {
                dest: raw.to_string(),
                reason: "expression must start with EVAL:".into(),
            })?;
        let cleaned: String = body.chars().filter(|c| !c.is_whitespace()).collect();

        let mut clauses = Vec::new();
        let mut fallback = None;
        for part in cleaned.split(')') {
            if part.is_empty() {
                continue;
            }
            let (op, inner) = part.split_once('(').ok_or_else(|| DialogError::BadDestination {
                dest: raw.to_string(),
                reason: format!("clause {part:?} is missing its parenthesis"),
            })?;
            match op {
                "else" => fallback = Some(inner.to_string()),
                "if" | "elif" => {
                    let (head, result) =
                        inner
                            .split_once(':')
                            .ok_or_else(|| DialogError::BadDestination {
                                dest: raw.to_string(),
                                reason: format!("clause {part:?} is missing its result"),
                            })?;
                    clauses.push(parse_clause(raw, head, result)?);
                }
                other => {
                    return Err(DialogError::BadDestination {
                        dest: raw.to_string(),
                        reason: format!("unknown clause keyword {other:?}"),
                    });
                }
            }
        }
        if clauses.is_empty() && fallback.is_none() {
            return Err(DialogError::BadDestination {
                dest: raw.to_string(),
                reason: "expression has no clauses".into(),
            });
        }
        Ok(Self { clauses, fallback })
    }

    /// Evaluates left to right, short-circuiting on the first clause whose
    /// test holds; falls back to the `else` result.
    #[must_use]
    pub fn evaluate(&self, visited: &[NodeKey]) -> Option<&str> {
        let last = visited.last();
        for clause in &self.clauses {
            let subject = NodeKey::from_name(&clause.subject);
            let holds = match clause.test {
                EvalTest::PrevEq => visited.contains(&subject),
                EvalTest::PrevNe => !visited.contains(&subject),
                EvalTest::LastEq => last == Some(&subject),
                EvalTest::LastNe => last != Some(&subject),
            };
            if holds {
                return Some(&clause.result);
            }
        }
        self.fallback.as_deref()
    }
}

fn parse_clause(raw: &str, head: &str, result: &str) -> Result<EvalClause, DialogError> {
    let bad = |reason: String| DialogError::BadDestination {
        dest: raw.to_string(),
        reason,
    };
    let (keyword, rest) = head.split_at_checked(4).ok_or_else(|| {
        bad(format!("test {head:?} is too short"))
    })?;
    let mut chars = rest.chars();
    let operator = chars
        .next()
        .ok_or_else(|| bad(format!("test {head:?} is missing its operator")))?;
    // Tolerate the doubled-operator spelling `prev==subject`.
    let mut subject = chars.as_str();
    if operator == '=' {
        subject = subject.strip_prefix('=').unwrap_or(subject);
    }
    let test = match (keyword, operator) {
        ("prev", '=') => EvalTest::PrevEq,
        ("prev", '!') => EvalTest::PrevNe,
        ("last", '=') => EvalTest::LastEq,
        ("last", '!') => EvalTest::LastNe,
        _ => return Err(bad(format!("unknown test {head:?}"))),
    };
    if subject.is_empty() || result.is_empty() {
        return Err(bad(format!("clause {head:?} has an empty subject or result")));
    }
    Ok(EvalClause {
        test,
        subject: subject.to_string(),
        result: result.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visited(names: &[&str]) -> Vec<NodeKey> {
        names.iter().map(|name| NodeKey::from_name(name)).collect()
    }

    #[test]
    fn last_test_follows_the_most_recent_visit() {
        let expr = EvalExpr::parse("EVAL: if(last=greeting:bye) else(menu)").unwrap();
        assert_eq!(expr.evaluate(&visited(&["start", "greeting"])), Some("bye"));
        assert_eq!(expr.evaluate(&visited(&["start", "menu"])), Some("menu"));
    }

    #[test]
    fn clauses_short_circuit_left_to_right() {
        let expr = EvalExpr::parse(
            "EVAL: if(prev=alpha:first) elif(prev=beta:second) else(third)",
        )
        .unwrap();
        assert_eq!(expr.evaluate(&visited(&["alpha", "beta"])), Some("first"));
        assert_eq!(expr.evaluate(&visited(&["beta"])), Some("second"));
        assert_eq!(expr.evaluate(&visited(&["gamma"])), Some("third"));
    }

    #[test]
    fn negated_tests_hold_on_absence() {
        let expr = EvalExpr::parse("EVAL: if(prev!setup:go_setup) else(main)").unwrap();
        assert_eq!(expr.evaluate(&visited(&["main"])), Some("go_setup"));
        assert_eq!(expr.evaluate(&visited(&["setup", "main"])), Some("main"));

        let last_ne = EvalExpr::parse("EVAL: if(last!menu:back) else(stay)").unwrap();
        assert_eq!(last_ne.evaluate(&visited(&["menu", "help"])), Some("back"));
        assert_eq!(last_ne.evaluate(&visited(&["help", "menu"])), Some("stay"));
    }

    #[test]
    fn missing_fallback_yields_none() {
        let expr = EvalExpr::parse("EVAL: if(prev=x:y)").unwrap();
        assert_eq!(expr.evaluate(&visited(&["z"])), None);
    }

    #[test]
    fn doubled_operator_spelling_is_tolerated() {
        let expr = EvalExpr::parse("EVAL: if(last==greeting:bye) else(menu)").unwrap();
        assert_eq!(expr.evaluate(&visited(&["greeting"])), Some("bye"));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(EvalExpr::parse("EVAL:").is_err());
        assert!(EvalExpr::parse("EVAL: if(huh=x:y)").is_err());
        assert!(EvalExpr::parse("EVAL: if(prev=x)").is_err());
        assert!(EvalExpr::parse("EVAL: while(prev=x:y)").is_err());
    }

    #[test]
    fn destinations_parse_and_resolve() {
        assert_eq!(
            Destination::parse("PREVIOUS").unwrap().resolve(&[]),
            Some(ResolvedDest::Previous)
        );
        assert_eq!(
            Destination::parse("CURRENT").unwrap().resolve(&[]),
            Some(ResolvedDest::Current)
        );
        let named = Destination::parse("menu").unwrap();
        assert_eq!(
            named.resolve(&[]),
            Some(ResolvedDest::Node(NodeKey::from_name("menu")))
        );
        assert_eq!(named.referenced_names(), vec!["menu"]);

        let eval = Destination::parse("EVAL: if(last=a:b) else(PREVIOUS)").unwrap();
        assert_eq!(eval.resolve(&visited(&["x"])), Some(ResolvedDest::Previous));
        assert_eq!(eval.referenced_names(), vec!["b"]);
    }
}
