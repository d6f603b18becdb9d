//! The primary store (spec §4.1).
//!
//! A [`Source`] is the leaf of the operator DAG: an ordered, primary-key
//! keyed table. It maintains one sorted [`Index`] per distinct sort order
//! requested by `connect`, fans out `push`ed changes to every connected
//! output in connection order, and implements the overlay protocol that
//! lets a `fetch` issued *during* that fan-out observe the in-flight
//! change consistently (spec §4.1 "Overlay protocol").

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::change::{BoxedStream, Change, Node, RelationshipStream};
use crate::error::IvmError;
use crate::filter_expr::FilterExpr;
use crate::input::{Basis, FetchRequest, Input, Output, WeakOutputRef};
use crate::sort::Sort;
use crate::value::{PrimaryKey, Row, Value};

/// A sorted list of primary keys under one [`Sort`], shared by every
/// connect call that requested the same sort order.
struct Index {
    sort: Rc<Sort>,
    order: Vec<Vec<Value>>,
}

impl Index {
    fn new(sort: Rc<Sort>) -> Self {
        Index { sort, order: Vec::new() }
    }

    fn position_of(&self, rows: &HashMap<Vec<Value>, Row>, pk: &[Value]) -> Result<usize, usize> {
        let row = rows.get(pk).expect("pk must exist in rows while indexed");
        self.order.binary_search_by(|candidate| {
            let crow = rows.get(candidate).expect("index entry missing from rows");
            self.sort.compare(crow, row)
        })
    }

    fn insert(&mut self, rows: &HashMap<Vec<Value>, Row>, pk: Vec<Value>) {
        match self.position_of(rows, &pk) {
            Ok(_) => unreachable!("duplicate pk inserted into index"),
            Err(pos) => self.order.insert(pos, pk),
        }
    }

    fn remove(&mut self, rows: &HashMap<Vec<Value>, Row>, pk: &[Value]) {
        if let Ok(pos) = self.position_of(rows, pk) {
            self.order.remove(pos);
        }
    }

    /// Recompute this entry's position after a sort-relevant column
    /// changed. `rows` must still contain the *old* row at `pk`.
    fn reposition(&mut self, rows: &HashMap<Vec<Value>, Row>, pk: &[Value]) {
        self.remove(rows, pk);
    }
}

/// A logical patch visible only to the output currently being notified by
/// an in-flight `push` (spec §4.1 "Overlay protocol", §9 "Overlays").
#[derive(Clone)]
enum OverlayPatch {
    None,
    Add(Row),
    Remove(Row),
    Edit(Row, Row),
}

struct ConnectedOutput {
    sort: Rc<Sort>,
    filter: Option<FilterExpr>,
    required_columns: Vec<String>,
    fully_applied: bool,
    output: Option<WeakOutputRef>,
    overlay: OverlayPatch,
}

pub struct SourceInner {
    pk: PrimaryKey,
    rows: HashMap<Vec<Value>, Row>,
    indexes: HashMap<String, Rc<RefCell<Index>>>,
    outputs: Vec<ConnectedOutput>,
    /// Index into `outputs` of the output currently being notified by an
    /// in-flight `push`, if any. Only that output's overlay is visible.
    notifying: Option<usize>,
}

impl SourceInner {
    fn index_key(sort: &Sort) -> String {
        sort.fields()
            .iter()
            .map(|f| format!("{}:{:?}", f.column, f.direction))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// An in-memory, primary-key-keyed table — the leaf of the operator DAG.
///
/// Cheap to clone: every clone shares the same underlying rows and
/// connected outputs, the way a `Source` handle is passed to a
/// [`SourceCatalog`](crate::query::SourceCatalog) while the caller keeps its
/// own handle to keep pushing into it.
#[derive(Clone)]
pub struct Source {
    inner: Rc<RefCell<SourceInner>>,
    name: String,
}

impl Source {
    pub fn new(name: impl Into<String>, pk: PrimaryKey) -> Self {
        Source {
            inner: Rc::new(RefCell::new(SourceInner {
                pk,
                rows: HashMap::new(),
                indexes: HashMap::new(),
                outputs: Vec::new(),
                notifying: None,
            })),
            name: name.into(),
        }
    }

    /// Produce an [`Input`] walking rows under `sort`, push-down filtered
    /// by `filter`, projected to at least `required_columns ∪ primaryKey ∪
    /// sortColumns` (spec §4.1 `connect`). Connects sharing the same sort
    /// order share the underlying index.
    pub fn connect(
        &self,
        sort: Sort,
        filter: Option<FilterExpr>,
        required_columns: Vec<String>,
    ) -> SourceInput {
        let sort = Rc::new(sort);
        let fully_applied = filter
            .as_ref()
            .map(|f| !f.has_correlated_subquery())
            .unwrap_or(true);

        let mut required: Vec<String> = required_columns;
        required.extend(sort.primary_key().columns().iter().cloned());
        if let Some(f) = &filter {
            required.extend(f.referenced_columns());
        }
        required.sort();
        required.dedup();

        let mut inner = self.inner.borrow_mut();
        let key = SourceInner::index_key(&sort);
        let index = inner
            .indexes
            .entry(key)
            .or_insert_with(|| Rc::new(RefCell::new(Index::new(sort.clone()))))
            .clone();

        // Backfill the newly-shared index with existing rows if it was
        // just created empty but other indexes already hold the table.
        if index.borrow().order.is_empty() && !inner.rows.is_empty() {
            let pks: Vec<Vec<Value>> = inner.rows.keys().cloned().collect();
            let mut idx = index.borrow_mut();
            for pk in pks {
                idx.insert(&inner.rows, pk);
            }
        }

        let output_id = inner.outputs.len();
        inner.outputs.push(ConnectedOutput {
            sort: sort.clone(),
            filter,
            required_columns: required,
            fully_applied,
            output: None,
            overlay: OverlayPatch::None,
        });

        SourceInput {
            source: self.inner.clone(),
            index,
            sort,
            output_id,
            source_name: self.name.clone(),
        }
    }

    /// Apply and fan out a mutation (spec §4.1 `push`).
    pub fn push(&self, change: SourceChange) -> Result<(), IvmError> {
        let pk_columns = self.inner.borrow().pk.clone();
        match &change {
            SourceChange::Add(row) => {
                let pk = pk_columns.extract(row);
                if self.inner.borrow().rows.contains_key(&pk) {
                    return Err(IvmError::DuplicateAdd(crate::error::fmt_pk(
                        &pk.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
                    )));
                }
            }
            SourceChange::Remove(row) => {
                let pk = pk_columns.extract(row);
                if !self.inner.borrow().rows.contains_key(&pk) {
                    return Err(IvmError::MissingRow(crate::error::fmt_pk(
                        &pk.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
                    )));
                }
            }
            SourceChange::Edit { old, new } => {
                let old_pk = pk_columns.extract(old);
                let new_pk = pk_columns.extract(new);
                if !self.inner.borrow().rows.contains_key(&old_pk) {
                    return Err(IvmError::MissingRow(crate::error::fmt_pk(
                        &old_pk.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
                    )));
                }
                if old_pk != new_pk {
                    return Err(IvmError::PrimaryKeyMutated(format!(
                        "{:?} -> {:?}",
                        old_pk, new_pk
                    )));
                }
            }
            SourceChange::Set(_) => {}
        }

        let resolved = self.resolve_set(change)?;
        debug!(source = %self.name, "push");

        let n_outputs = self.inner.borrow().outputs.len();
        for idx in 0..n_outputs {
            let (filter_crosses, translated) = {
                let inner = self.inner.borrow();
                let out = &inner.outputs[idx];
                self.translate_for_output(out, &resolved)
            };
            trace!(source = %self.name, output = idx, crosses_boundary = filter_crosses, "notify");

            for patch in translated {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.outputs[idx].overlay = patch.clone();
                    inner.notifying = Some(idx);
                }
                let out = {
                    let inner = self.inner.borrow();
                    inner.outputs[idx].output.clone()
                };
                if let Some(weak) = out {
                    if let Some(strong) = weak.upgrade() {
                        let ch = self.patch_to_change(&patch);
                        if let Some(ch) = ch {
                            strong.borrow_mut().push(ch);
                        }
                    }
                }
                let mut inner = self.inner.borrow_mut();
                inner.outputs[idx].overlay = OverlayPatch::None;
                inner.notifying = None;
            }
        }

        self.commit(resolved);
        Ok(())
    }

    fn resolve_set(&self, change: SourceChange) -> Result<ResolvedChange, IvmError> {
        Ok(match change {
            SourceChange::Add(row) => ResolvedChange::Add(row),
            SourceChange::Remove(row) => ResolvedChange::Remove(row),
            SourceChange::Edit { old, new } => ResolvedChange::Edit { old, new },
            SourceChange::Set(row) => {
                let pk = self.inner.borrow().pk.extract(&row);
                let existing = self.inner.borrow().rows.get(&pk).cloned();
                match existing {
                    Some(old) => ResolvedChange::Edit { old, new: row },
                    None => ResolvedChange::Add(row),
                }
            }
        })
    }

    /// Compute whether `out`'s required-columns boundary is crossed by this
    /// change and produce the sequence of overlay patches to deliver (one,
    /// or remove-then-add when an edit crosses the boundary; spec §4.1).
    fn translate_for_output(
        &self,
        out: &ConnectedOutput,
        change: &ResolvedChange,
    ) -> (bool, Vec<OverlayPatch>) {
        let accepts = |row: &Row| -> bool {
            out.filter.as_ref().map(|f| f.eval(row).matched).unwrap_or(true)
        };
        match change {
            ResolvedChange::Add(row) => {
                if accepts(row) {
                    (false, vec![OverlayPatch::Add(row.clone())])
                } else {
                    (false, vec![])
                }
            }
            ResolvedChange::Remove(row) => {
                if accepts(row) {
                    (false, vec![OverlayPatch::Remove(row.clone())])
                } else {
                    (false, vec![])
                }
            }
            ResolvedChange::Edit { old, new } => {
                let old_matches = accepts(old);
                let new_matches = accepts(new);
                if old_matches && new_matches {
                    (false, vec![OverlayPatch::Edit(old.clone(), new.clone())])
                } else if old_matches && !new_matches {
                    (true, vec![OverlayPatch::Remove(old.clone())])
                } else if !old_matches && new_matches {
                    (true, vec![OverlayPatch::Add(new.clone())])
                } else {
                    (true, vec![])
                }
            }
        }
    }

    fn patch_to_change(&self, patch: &OverlayPatch) -> Option<Change> {
        match patch {
            OverlayPatch::None => None,
            OverlayPatch::Add(row) => Some(Change::add(row.clone())),
            OverlayPatch::Remove(row) => Some(Change::remove(row.clone())),
            OverlayPatch::Edit(old, new) => Some(Change::edit(old.clone(), new.clone())),
        }
    }

    fn commit(&self, change: ResolvedChange) {
        let mut inner = self.inner.borrow_mut();
        match change {
            ResolvedChange::Add(row) => {
                let pk = inner.pk.extract(&row);
                inner.rows.insert(pk.clone(), row);
                for index in inner.indexes.values() {
                    index.borrow_mut().insert(&inner.rows, pk.clone());
                }
            }
            ResolvedChange::Remove(row) => {
                let pk = inner.pk.extract(&row);
                for index in inner.indexes.values() {
                    index.borrow_mut().remove(&inner.rows, &pk);
                }
                inner.rows.remove(&pk);
            }
            ResolvedChange::Edit { old, new } => {
                let pk = inner.pk.extract(&old);
                for index in inner.indexes.values() {
                    index.borrow_mut().reposition(&inner.rows, &pk);
                }
                inner.rows.insert(pk.clone(), new);
                for index in inner.indexes.values() {
                    index.borrow_mut().insert(&inner.rows, pk.clone());
                }
            }
        }
    }
}

/// The change variants a [`Source::push`] accepts (spec §4.1).
pub enum SourceChange {
    Add(Row),
    Remove(Row),
    Edit { old: Row, new: Row },
    /// Upsert: add or edit, never fails on existence.
    Set(Row),
}

enum ResolvedChange {
    Add(Row),
    Remove(Row),
    Edit { old: Row, new: Row },
}

/// The [`Input`] handed back by [`Source::connect`].
pub struct SourceInput {
    source: Rc<RefCell<SourceInner>>,
    index: Rc<RefCell<Index>>,
    sort: Rc<Sort>,
    output_id: usize,
    source_name: String,
}

impl SourceInput {
    fn stream(&self, req: &FetchRequest) -> BoxedStream {
        let inner = self.source.borrow();
        let out = &inner.outputs[self.output_id];
        let overlay = if inner.notifying == Some(self.output_id) {
            out.overlay.clone()
        } else {
            OverlayPatch::None
        };

        let mut pks = self.index.borrow().order.clone();
        if req.reverse {
            pks.reverse();
        }

        let sort = out.sort.clone();
        let filter = out.filter.clone();
        let required: Vec<String> = out.required_columns.clone();
        let constraint = req.constraint.clone();
        let start = req.start.clone();
        let reverse = req.reverse;

        let mut rows: Vec<Row> = pks
            .into_iter()
            .filter_map(|pk| inner.rows.get(&pk).cloned())
            .collect();
        drop(inner);

        match &overlay {
            OverlayPatch::Add(row) => insert_sorted(&mut rows, row.clone(), &sort, reverse),
            OverlayPatch::Remove(row) => remove_matching(&mut rows, row, &sort),
            OverlayPatch::Edit(old, new) => {
                remove_matching(&mut rows, old, &sort);
                insert_sorted(&mut rows, new.clone(), &sort, reverse);
            }
            OverlayPatch::None => {}
        }

        if let Some(start) = &start {
            let keep_from = rows.iter().position(|r| match start.basis {
                Basis::At => !matches_before(&sort, reverse, r, &start.row),
                Basis::After => {
                    !matches_before(&sort, reverse, r, &start.row) && r != &start.row
                }
            });
            rows = match keep_from {
                Some(i) => rows.split_off(i),
                None => Vec::new(),
            };
        }

        let rows: Vec<Row> = rows
            .into_iter()
            .filter(|r| constraint.as_ref().map(|c| c.matches(r)).unwrap_or(true))
            .filter(|r| filter.as_ref().map(|f| f.eval(r).matched).unwrap_or(true))
            .map(|r| r.project(&required.iter().map(String::as_str).collect::<Vec<_>>()))
            .collect();

        Box::new(VecNodeStream::new(rows))
    }
}

fn matches_before(sort: &Sort, reverse: bool, row: &Row, start: &Row) -> bool {
    let ord = sort.compare(row, start);
    if reverse {
        ord == std::cmp::Ordering::Greater
    } else {
        ord == std::cmp::Ordering::Less
    }
}

fn insert_sorted(rows: &mut Vec<Row>, row: Row, sort: &Sort, reverse: bool) {
    let pos = rows.binary_search_by(|r| {
        let ord = sort.compare(r, &row);
        if reverse { ord.reverse() } else { ord }
    });
    let pos = pos.unwrap_or_else(|p| p);
    rows.insert(pos, row);
}

fn remove_matching(rows: &mut Vec<Row>, target: &Row, sort: &Sort) {
    if let Some(pos) = rows.iter().position(|r| sort.compare(r, target) == std::cmp::Ordering::Equal) {
        rows.remove(pos);
    }
}

struct VecNodeStream {
    rows: std::vec::IntoIter<Row>,
}

impl VecNodeStream {
    fn new(rows: Vec<Row>) -> Self {
        VecNodeStream { rows: rows.into_iter() }
    }
}

impl RelationshipStream for VecNodeStream {
    fn next(&mut self) -> Option<Node> {
        self.rows.next().map(Node::new)
    }
}

impl Input for SourceInput {
    fn sort(&self) -> Rc<Sort> {
        self.sort.clone()
    }

    fn fetch(&self, req: &FetchRequest) -> BoxedStream {
        self.stream(req)
    }

    fn cleanup(&self, req: &FetchRequest) -> BoxedStream {
        self.stream(req)
    }

    fn fully_applied_filters(&self) -> bool {
        self.source.borrow().outputs[self.output_id].fully_applied
    }

    fn set_output(&mut self, output: WeakOutputRef) {
        self.source.borrow_mut().outputs[self.output_id].output = Some(output);
    }

    fn destroy(&mut self) {
        let mut inner = self.source.borrow_mut();
        inner.outputs[self.output_id].output = None;
        debug!(source = %self.source_name, output = self.output_id, "destroy connect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::SortField;
    use crate::value::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn row(a: i64, b: &str) -> Row {
        let mut r = Row::new();
        r.set("a", Value::Number(a as f64));
        r.set("b", Value::String(b.into()));
        r
    }

    struct Recorder(Rc<RefCell<Vec<String>>>);
    impl Output for Recorder {
        fn push(&mut self, change: Change) {
            self.0.borrow_mut().push(format!("{:?}", change));
        }
    }

    fn fetch_all(input: &SourceInput) -> Vec<Row> {
        let mut stream = input.fetch(&FetchRequest::new());
        let mut out = Vec::new();
        while let Some(node) = stream.next() {
            out.push(node.row);
        }
        out
    }

    #[test]
    fn test_scenario_simple_filter_and_sort() {
        let source = Source::new("t", PrimaryKey::new(["a"]));
        source.push(SourceChange::Add(row(1, "a"))).unwrap();
        source.push(SourceChange::Add(row(2, "b"))).unwrap();

        let sort = Sort::new(
            vec![SortField::asc("b"), SortField::asc("a")],
            PrimaryKey::new(["a"]),
        );
        let mut input = source.connect(sort, None, vec!["a".into(), "b".into()]);
        let log = Rc::new(RefCell::new(Vec::new()));
        let recorder = Rc::new(RefCell::new(Recorder(log.clone())));
        input.set_output(Rc::downgrade(&(recorder.clone() as Rc<RefCell<dyn Output>>)));

        let rows = fetch_all(&input);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("a"), Some(&Value::Number(1.0)));
        assert_eq!(rows[1].get("a"), Some(&Value::Number(2.0)));

        source.push(SourceChange::Add(row(3, "c"))).unwrap();
        let rows = fetch_all(&input);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].get("a"), Some(&Value::Number(3.0)));

        source.push(SourceChange::Remove(row(2, "b"))).unwrap();
        let rows = fetch_all(&input);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("a"), Some(&Value::Number(1.0)));
        assert_eq!(rows[1].get("a"), Some(&Value::Number(3.0)));

        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let source = Source::new("t", PrimaryKey::new(["a"]));
        source.push(SourceChange::Add(row(1, "a"))).unwrap();
        let err = source.push(SourceChange::Add(row(1, "a"))).unwrap_err();
        assert!(matches!(err, IvmError::DuplicateAdd(_)));
    }

    #[test]
    fn test_missing_remove_rejected() {
        let source = Source::new("t", PrimaryKey::new(["a"]));
        let err = source.push(SourceChange::Remove(row(1, "a"))).unwrap_err();
        assert!(matches!(err, IvmError::MissingRow(_)));
    }

    #[test]
    fn test_primary_key_mutation_rejected() {
        let source = Source::new("t", PrimaryKey::new(["a"]));
        source.push(SourceChange::Add(row(1, "a"))).unwrap();
        let err = source
            .push(SourceChange::Edit { old: row(1, "a"), new: row(2, "a") })
            .unwrap_err();
        assert!(matches!(err, IvmError::PrimaryKeyMutated(_)));
    }

    #[test]
    fn test_set_upserts() {
        let source = Source::new("t", PrimaryKey::new(["a"]));
        source.push(SourceChange::Set(row(1, "a"))).unwrap();
        source.push(SourceChange::Set(row(1, "z"))).unwrap();

        let sort = Sort::new(vec![SortField::asc("a")], PrimaryKey::new(["a"]));
        let input = source.connect(sort, None, vec!["a".into(), "b".into()]);
        let rows = fetch_all(&input);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("b"), Some(&Value::String("z".into())));
    }

    #[test]
    fn test_overlay_not_visible_to_output_not_yet_notified() {
        // Two connects (two outputs). Output B's fetch inside output A's
        // push callback must not see the overlay meant for A.
        let source = Source::new("t", PrimaryKey::new(["a"]));
        source.push(SourceChange::Add(row(1, "a"))).unwrap();

        let sort = Sort::new(vec![SortField::asc("a")], PrimaryKey::new(["a"]));
        let input_b = Rc::new(RefCell::new(source.connect(sort.clone(), None, vec!["a".into()])));
        let seen_by_b_during_a: Rc<RefCell<Option<usize>>> = Rc::new(RefCell::new(None));

        struct ProbeOutput {
            input_b: Rc<RefCell<SourceInput>>,
            seen: Rc<RefCell<Option<usize>>>,
        }
        impl Output for ProbeOutput {
            fn push(&mut self, _change: Change) {
                let mut stream = self.input_b.borrow().fetch(&FetchRequest::new());
                let mut n = 0;
                while stream.next().is_some() {
                    n += 1;
                }
                *self.seen.borrow_mut() = Some(n);
            }
        }

        let mut input_a = source.connect(sort, None, vec!["a".into()]);
        let probe: Rc<RefCell<dyn Output>> = Rc::new(RefCell::new(ProbeOutput {
            input_b: input_b.clone(),
            seen: seen_by_b_during_a.clone(),
        }));
        input_a.set_output(Rc::downgrade(&probe));

        source.push(SourceChange::Add(row(2, "b"))).unwrap();
        // Output A (notified first) sees 2 via overlay during its push;
        // output B (not yet notified at that point) must still see 1.
        assert_eq!(*seen_by_b_during_a.borrow(), Some(1));
    }
}
