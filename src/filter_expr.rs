//! Push-down filter expressions (spec §4.1).
//!
//! A `FilterExpr` is the predicate tree a `Source::connect` call pushes
//! down into the index walk. The source evaluates purely column-local
//! fragments fully; `CorrelatedSubquery` fragments cannot be evaluated by
//! the source at all (they depend on another operator's state), so any
//! expression containing one reports `fully_applied = false` and the
//! downstream `Exists`/`NotExists` operator re-filters.

use crate::value::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
    IsNot,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistsKind {
    Exists,
    NotExists,
}

#[derive(Debug, Clone)]
pub enum FilterExpr {
    Simple {
        op: CmpOp,
        column: String,
        literal: Literal,
    },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    /// A fragment the source cannot evaluate locally — it names a
    /// relationship whose non-emptiness only the `Exists`/`NotExists`
    /// operator can determine.
    CorrelatedSubquery {
        kind: ExistsKind,
        relationship: String,
    },
}

#[derive(Debug, Clone)]
pub enum Literal {
    Value(Value),
    Array(Vec<Value>),
}

/// The result of evaluating a filter against a row: whether it matched,
/// and whether every part of the expression was actually evaluated (as
/// opposed to a correlated-subquery fragment being skipped, in which case
/// `fully_applied` is false and the row is only a *candidate*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalResult {
    pub matched: bool,
    pub fully_applied: bool,
}

impl FilterExpr {
    /// Evaluate against a row. `CorrelatedSubquery` fragments are treated
    /// as "unknown" (matched = true, fully_applied = false) so they never
    /// wrongly exclude a row the source cannot actually decide about;
    /// combined through `And`/`Or` using three-valued-logic-like rules
    /// only as far as `fully_applied` propagation is concerned (match
    /// propagation itself stays boolean per spec, since only the
    /// `fully_applied` flag signals "ask downstream").
    pub fn eval(&self, row: &Row) -> EvalResult {
        match self {
            FilterExpr::Simple { op, column, literal } => {
                let lhs = row.get_or_null(column);
                EvalResult {
                    matched: eval_simple(*op, &lhs, literal),
                    fully_applied: true,
                }
            }
            FilterExpr::And(parts) => {
                let mut fully_applied = true;
                let mut matched = true;
                for p in parts {
                    let r = p.eval(row);
                    fully_applied &= r.fully_applied;
                    matched &= r.matched;
                }
                EvalResult { matched, fully_applied }
            }
            FilterExpr::Or(parts) => {
                let mut fully_applied = true;
                let mut matched = false;
                for p in parts {
                    let r = p.eval(row);
                    fully_applied &= r.fully_applied;
                    matched |= r.matched;
                }
                EvalResult { matched, fully_applied }
            }
            FilterExpr::CorrelatedSubquery { .. } => EvalResult {
                matched: true,
                fully_applied: false,
            },
        }
    }

    /// Whether this expression (recursively) contains a correlated
    /// subquery fragment.
    pub fn has_correlated_subquery(&self) -> bool {
        match self {
            FilterExpr::Simple { .. } => false,
            FilterExpr::CorrelatedSubquery { .. } => true,
            FilterExpr::And(parts) | FilterExpr::Or(parts) => {
                parts.iter().any(FilterExpr::has_correlated_subquery)
            }
        }
    }

    /// The set of columns this expression reads, excluding correlated
    /// subquery fragments (they read no source-local column). Used by
    /// `Source::connect` to compute the required-columns boundary an edit
    /// must be checked against (§4.1 overlay protocol).
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            FilterExpr::Simple { column, .. } => out.push(column.clone()),
            FilterExpr::And(parts) | FilterExpr::Or(parts) => {
                for p in parts {
                    p.collect_columns(out);
                }
            }
            FilterExpr::CorrelatedSubquery { .. } => {}
        }
    }
}

fn eval_simple(op: CmpOp, lhs: &Value, literal: &Literal) -> bool {
    match (op, literal) {
        (CmpOp::In, Literal::Array(values)) => values.iter().any(|v| lhs.sql_eq(v)),
        (CmpOp::In, Literal::Value(_)) => false,
        (_, Literal::Array(_)) => false,
        (op, Literal::Value(rhs)) => match op {
            CmpOp::Eq => lhs.sql_eq(rhs),
            CmpOp::Ne => !lhs.is_null() && !rhs.is_null() && lhs != rhs,
            CmpOp::Is => lhs.is_same_as(rhs),
            CmpOp::IsNot => !lhs.is_same_as(rhs),
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                if lhs.is_null() || rhs.is_null() {
                    false
                } else {
                    let ord = lhs.cmp(rhs);
                    match op {
                        CmpOp::Lt => ord.is_lt(),
                        CmpOp::Le => ord.is_le(),
                        CmpOp::Gt => ord.is_gt(),
                        CmpOp::Ge => ord.is_ge(),
                        _ => unreachable!(),
                    }
                }
            }
            CmpOp::In => unreachable!("handled above"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_with(col: &str, v: Value) -> Row {
        let mut r = Row::new();
        r.set(col, v);
        r
    }

    #[test]
    fn test_eq_null_never_matches() {
        let expr = FilterExpr::Simple {
            op: CmpOp::Eq,
            column: "a".into(),
            literal: Literal::Value(Value::Null),
        };
        assert!(!expr.eval(&row_with("a", Value::Null)).matched);
    }

    #[test]
    fn test_is_matches_null() {
        let expr = FilterExpr::Simple {
            op: CmpOp::Is,
            column: "a".into(),
            literal: Literal::Value(Value::Null),
        };
        assert!(expr.eval(&row_with("a", Value::Null)).matched);
    }

    #[test]
    fn test_in_accepts_literal_array() {
        let expr = FilterExpr::Simple {
            op: CmpOp::In,
            column: "a".into(),
            literal: Literal::Array(vec![Value::Number(1.0), Value::Number(2.0)]),
        };
        assert!(expr.eval(&row_with("a", Value::Number(2.0))).matched);
        assert!(!expr.eval(&row_with("a", Value::Number(3.0))).matched);
    }

    #[test]
    fn test_correlated_subquery_not_fully_applied() {
        let expr = FilterExpr::CorrelatedSubquery {
            kind: ExistsKind::Exists,
            relationship: "labels".into(),
        };
        let result = expr.eval(&Row::new());
        assert!(result.matched);
        assert!(!result.fully_applied);
        assert!(expr.has_correlated_subquery());
    }

    #[test]
    fn test_and_propagates_not_fully_applied() {
        let expr = FilterExpr::And(vec![
            FilterExpr::Simple {
                op: CmpOp::Gt,
                column: "a".into(),
                literal: Literal::Value(Value::Number(0.0)),
            },
            FilterExpr::CorrelatedSubquery {
                kind: ExistsKind::Exists,
                relationship: "labels".into(),
            },
        ]);
        let result = expr.eval(&row_with("a", Value::Number(5.0)));
        assert!(result.matched);
        assert!(!result.fully_applied);
    }

    #[test]
    fn test_referenced_columns_excludes_correlated() {
        let expr = FilterExpr::And(vec![
            FilterExpr::Simple {
                op: CmpOp::Gt,
                column: "a".into(),
                literal: Literal::Value(Value::Number(0.0)),
            },
            FilterExpr::CorrelatedSubquery {
                kind: ExistsKind::Exists,
                relationship: "labels".into(),
            },
        ]);
        assert_eq!(expr.referenced_columns(), vec!["a".to_string()]);
    }
}
