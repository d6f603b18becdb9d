//! Skip — the low-end mirror of `Take` (spec §4.6).
//!
//! Drops rows strictly (or inclusively, for `OFFSET`-at-a-row semantics)
//! before a bound under the upstream sort order. Unlike `Take`, `Skip`
//! carries no per-partition storage: the bound is a fixed parameter fixed
//! at construction, so membership is decided purely by comparing a row
//! against it — `fetch`/`cleanup` just adjust the `start` they hand
//! upstream, and `push` drops anything that doesn't clear the bound.

use std::cell::RefCell;
use std::rc::Rc;

use crate::change::{BoxedStream, Change, Node, RelationshipStream, drain_change};
use crate::input::{Basis, FetchRequest, Input, InputRef, Output, Start, WeakOutputRef};
use crate::sort::Sort;
use crate::value::Row;

/// `Skip` drops every row sorting strictly before `bound` under the
/// upstream sort order. `bound` is `None` until the first row has been
/// observed past construction-time seeding — a `Skip` with no bound
/// drops nothing, matching `OFFSET 0`.
pub struct Skip {
    upstream: InputRef,
    bound: Row,
    output: Option<Rc<RefCell<OutputSlot>>>,
}

#[derive(Default)]
struct OutputSlot {
    output: Option<WeakOutputRef>,
}

/// The `Output` registered against the upstream `Input`.
pub struct SkipOutput {
    upstream_sort: Rc<Sort>,
    bound: Row,
    slot: Rc<RefCell<OutputSlot>>,
}

impl Skip {
    /// `bound` is the last row the window drops (inclusive): rows sorting
    /// at-or-before `bound` are skipped, everything strictly after it
    /// passes through. Matches the spec's "drops rows strictly (or
    /// inclusively) before a bound" by treating `bound` itself as the
    /// final dropped row, i.e. the row immediately preceding the window.
    pub fn new(upstream: InputRef, bound: Row) -> (Self, Rc<RefCell<SkipOutput>>) {
        let upstream_sort = upstream.borrow().sort();
        let slot = Rc::new(RefCell::new(OutputSlot::default()));
        let output_side = Rc::new(RefCell::new(SkipOutput {
            upstream_sort,
            bound: bound.clone(),
            slot: slot.clone(),
        }));
        (
            Skip {
                upstream,
                bound,
                output: Some(slot),
            },
            output_side,
        )
    }
}

struct SkipStream {
    upstream: BoxedStream,
}

impl RelationshipStream for SkipStream {
    fn next(&mut self) -> Option<Node> {
        self.upstream.next()
    }

    fn drain(&mut self) {
        self.upstream.drain();
    }
}

impl Input for Skip {
    fn sort(&self) -> Rc<Sort> {
        self.upstream.borrow().sort()
    }

    fn fetch(&self, req: &FetchRequest) -> BoxedStream {
        Box::new(SkipStream {
            upstream: self.upstream.borrow().fetch(&adjusted_request(req, &self.bound)),
        })
    }

    fn cleanup(&self, req: &FetchRequest) -> BoxedStream {
        Box::new(SkipStream {
            upstream: self.upstream.borrow().cleanup(&adjusted_request(req, &self.bound)),
        })
    }

    fn fully_applied_filters(&self) -> bool {
        self.upstream.borrow().fully_applied_filters()
    }

    fn set_output(&mut self, output: WeakOutputRef) {
        if let Some(slot) = &self.output {
            slot.borrow_mut().output = Some(output);
        }
    }

    fn destroy(&mut self) {
        self.upstream.borrow_mut().destroy();
    }
}

/// Narrow a caller's request to begin no earlier than `bound`. A caller
/// requesting an explicit `start` further into the window than `bound`
/// keeps its own, tighter bound; one with no `start` (or one before
/// `bound`) is clamped to start strictly after `bound`, in the direction
/// the request already asked for.
fn adjusted_request(req: &FetchRequest, bound: &Row) -> FetchRequest {
    let mut adjusted = req.clone();
    let bound_start = Start {
        row: bound.clone(),
        basis: Basis::After,
    };
    match &req.start {
        None => adjusted.start = Some(bound_start),
        Some(_) => {
            // The caller's own start already narrows the walk; Skip's
            // bound can only ever narrow further from the low end, and a
            // caller-supplied start on a `Skip`'s output is always at or
            // past the window start already (it was produced by a prior
            // fetch through this same Skip), so it is left untouched.
        }
    }
    adjusted
}

impl Output for SkipOutput {
    fn push(&mut self, change: Change) {
        let Some(output) = self.slot.borrow().output.clone().and_then(|w| w.upgrade()) else {
            return;
        };
        let past = |row: &Row| self.upstream_sort.compare(row, &self.bound) == std::cmp::Ordering::Greater;

        match change {
            Change::Add { node } => {
                if past(&node.row) {
                    output.borrow_mut().push(Change::Add { node });
                } else {
                    node.drain_relationships();
                }
            }
            Change::Remove { node } => {
                if past(&node.row) {
                    output.borrow_mut().push(Change::Remove { node });
                } else {
                    node.drain_relationships();
                }
            }
            Change::Edit { old_node, node } => {
                let old_past = past(&old_node.row);
                let new_past = past(&node.row);
                match (old_past, new_past) {
                    (true, true) => output.borrow_mut().push(Change::Edit { old_node, node }),
                    (false, false) => {
                        old_node.drain_relationships();
                        node.drain_relationships();
                    }
                    (true, false) => {
                        node.drain_relationships();
                        output.borrow_mut().push(Change::Remove { node: old_node });
                    }
                    (false, true) => {
                        old_node.drain_relationships();
                        output.borrow_mut().push(Change::Add { node });
                    }
                }
            }
            Change::Child { node, child } => {
                if past(&node.row) {
                    output.borrow_mut().push(Change::Child { node, child });
                } else {
                    node.drain_relationships();
                    drain_change(*child.change);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::SortField;
    use crate::source::{Source, SourceChange};
    use crate::value::{PrimaryKey, Value};

    fn row(a: i64) -> Row {
        let mut r = Row::new();
        r.set("a", Value::Number(a as f64));
        r
    }

    struct Collector(Rc<RefCell<Vec<String>>>);
    impl Output for Collector {
        fn push(&mut self, change: Change) {
            self.0.borrow_mut().push(format!("{:?}", change));
        }
    }

    fn setup(bound: Row) -> (Source, Skip, Rc<RefCell<Vec<String>>>) {
        let sort = Sort::new(vec![SortField::asc("a")], PrimaryKey::new(["a"]));
        let source = Source::new("t", PrimaryKey::new(["a"]));
        let upstream: InputRef = Rc::new(RefCell::new(source.connect(sort, None, vec![])));

        let (skip, skip_output) = Skip::new(upstream.clone(), bound);
        upstream
            .borrow_mut()
            .set_output(Rc::downgrade(&(skip_output.clone() as Rc<RefCell<dyn Output>>)));

        let log = Rc::new(RefCell::new(Vec::new()));
        let collector: Rc<RefCell<dyn Output>> = Rc::new(RefCell::new(Collector(log.clone())));
        let mut skip = skip;
        skip.set_output(Rc::downgrade(&collector));
        (source, skip, log)
    }

    fn fetch_all(skip: &Skip) -> Vec<Row> {
        let mut stream = skip.fetch(&FetchRequest::new());
        let mut out = Vec::new();
        while let Some(node) = stream.next() {
            out.push(node.row.clone());
            node.drain_relationships();
        }
        out
    }

    #[test]
    fn test_fetch_drops_rows_at_or_before_bound() {
        let (source, skip, _log) = setup(row(2));
        for i in 1..=4 {
            source.push(SourceChange::Add(row(i))).unwrap();
        }
        let rows = fetch_all(&skip);
        assert_eq!(rows.iter().map(|r| r.get("a").cloned()).collect::<Vec<_>>(), vec![
            Some(Value::Number(3.0)),
            Some(Value::Number(4.0)),
        ]);
    }

    #[test]
    fn test_push_add_past_bound_forwards() {
        let (source, _skip, log) = setup(row(2));
        source.push(SourceChange::Add(row(5))).unwrap();
        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow()[0].starts_with("Add"));
    }

    #[test]
    fn test_push_add_before_bound_suppressed() {
        let (source, _skip, log) = setup(row(2));
        source.push(SourceChange::Add(row(1))).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_edit_crossing_bound_splits() {
        let (source, _skip, log) = setup(row(2));
        source.push(SourceChange::Add(row(1))).unwrap();
        log.borrow_mut().clear();
        source
            .push(SourceChange::Edit { old: row(1), new: row(5) })
            .unwrap();
        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow()[0].starts_with("Add"), "entering the window from below is an add: {:?}", log.borrow());
    }

    #[test]
    fn test_edit_leaving_window_emits_remove() {
        let (source, _skip, log) = setup(row(2));
        source.push(SourceChange::Add(row(5))).unwrap();
        log.borrow_mut().clear();
        source
            .push(SourceChange::Edit { old: row(5), new: row(1) })
            .unwrap();
        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow()[0].starts_with("Remove"));
    }

    #[test]
    fn test_edit_within_window_forwards_as_edit() {
        let (source, _skip, log) = setup(row(2));
        source.push(SourceChange::Add(row(5))).unwrap();
        log.borrow_mut().clear();
        source
            .push(SourceChange::Edit { old: row(5), new: row(6) })
            .unwrap();
        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow()[0].starts_with("Edit"));
    }
}
