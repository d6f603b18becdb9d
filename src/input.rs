//! The `Input`/`Output` contract operators are built against (spec §2, §4.1).
//!
//! `Input` is the pull side — `fetch`/`cleanup` walk a sorted tuple stream
//! under an optional `start` bound and `constraint` — and `Output` is the
//! push side — a single `push(Change)` method. Every operator in this crate
//! is both: it consumes an upstream `Input` and is itself the `Output`
//! registered against it, and it exposes itself downstream as an `Input`
//! whose `Output` is whatever is wired above it (another operator, or the
//! view materializer).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::change::{BoxedStream, Change};
use crate::sort::Sort;
use crate::value::{Row, Value};

/// A row → value constraint used by `fetch`/`cleanup` (join correlation,
/// `Take`/`Skip` partitioning). Per spec §4.1, a constrained column never
/// matches `null` against `null` — this is join semantics, distinct from
/// [`crate::filter_expr::CmpOp::Is`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraint(BTreeMap<String, Value>);

impl Constraint {
    pub fn new() -> Self {
        Constraint(BTreeMap::new())
    }

    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.0.insert(column.into(), value);
        self
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Constraint(pairs.into_iter().collect())
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.0.iter().all(|(col, want)| {
            let have = row.get_or_null(col);
            !want.is_null() && !have.is_null() && have == *want
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Where to begin a `fetch`/`cleanup` walk (spec §4.1 `FetchRequest.start`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    /// Begin at the first row `>= row` (or `<= row` when reversed).
    At,
    /// Begin strictly after `row` under the sort direction in effect.
    After,
}

#[derive(Debug, Clone)]
pub struct Start {
    pub row: Row,
    pub basis: Basis,
}

/// A pull request against an [`Input`] (spec §4.1).
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub constraint: Option<Constraint>,
    pub start: Option<Start>,
    pub reverse: bool,
}

impl FetchRequest {
    pub fn new() -> Self {
        FetchRequest::default()
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    pub fn with_start(mut self, row: Row, basis: Basis) -> Self {
        self.start = Some(Start { row, basis });
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// The push side of the operator contract (spec §2, §3).
pub trait Output {
    fn push(&mut self, change: Change);
}

pub type OutputRef = Rc<RefCell<dyn Output>>;
/// Operators hold their output weakly: an operator must not keep its
/// consumer alive past the consumer's own teardown (spec §5, `destroy`
/// cascades *upward* from a view to sources, never the reverse).
pub type WeakOutputRef = Weak<RefCell<dyn Output>>;

/// The pull side of the operator contract (spec §4.1). Every non-leaf
/// operator is itself an `Input` over its combined output, wired to
/// whatever consumes it — another operator, or a [`crate::view::View`].
pub trait Input {
    /// The sort order this input's `fetch`/`cleanup` streams are produced
    /// in (spec §3 "Hierarchical ordering"). Returned as a shared handle
    /// since most `Input` implementors are themselves wrapped behind
    /// `Rc<RefCell<dyn Input>>` further up the graph, where a borrowed
    /// `&Sort` cannot outlive the borrow.
    fn sort(&self) -> Rc<Sort>;

    /// Walk rows without signaling that storage backing them can be
    /// released.
    fn fetch(&self, req: &FetchRequest) -> BoxedStream;

    /// Identical traversal to `fetch`, but tells every stateful operator
    /// along the path that the caller will not revisit these rows, so they
    /// may decrement/erase per-node storage as they pass through (spec
    /// §4.1 "cleanup").
    fn cleanup(&self, req: &FetchRequest) -> BoxedStream;

    /// Whether this input's declared filter (if any) was fully evaluated
    /// by the time rows reach the caller, or whether a correlated
    /// subquery fragment was left for a downstream `Exists`/`NotExists` to
    /// re-check (spec §4.1 "Filter push-down").
    fn fully_applied_filters(&self) -> bool {
        true
    }

    /// Wire this input's changes to `output`. Called once, by whoever
    /// constructs the operator that owns this input.
    fn set_output(&mut self, output: WeakOutputRef);

    /// Tear down this input and cascade to whatever it is itself an
    /// output of (spec §3 "Lifecycle", §5 "Cancellation"). Must not be
    /// called while a push through this input is in progress.
    fn destroy(&mut self);
}

pub type InputRef = Rc<RefCell<dyn Input>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row_with(col: &str, v: Value) -> Row {
        let mut r = Row::new();
        r.set(col, v);
        r
    }

    #[test]
    fn test_constraint_null_never_matches_null() {
        let c = Constraint::new().with("a", Value::Null);
        assert!(!c.matches(&row_with("a", Value::Null)));
    }

    #[test]
    fn test_constraint_matches_equal_non_null() {
        let c = Constraint::new().with("a", Value::Number(1.0));
        assert!(c.matches(&row_with("a", Value::Number(1.0))));
        assert!(!c.matches(&row_with("a", Value::Number(2.0))));
    }

    #[test]
    fn test_constraint_missing_column_is_null() {
        let c = Constraint::new().with("a", Value::Number(1.0));
        assert!(!c.matches(&Row::new()));
    }
}
