//! The view materializer (spec §4.7).
//!
//! A [`View`] wraps a top-level [`Input`] and turns its node stream, plus
//! whatever `Change`s subsequently arrive through its `Output` half, into a
//! live ordered array — or a single optional row when `cardinality` is
//! [`Cardinality::Singular`] — with per-row reference counting and
//! recursive, per-relationship materialization.
//!
//! Relationship arrays need their own sort order to position incremental
//! `Child` splices correctly, but a [`crate::change::RelationshipThunk`]
//! only exposes a one-shot stream, not the `Input` behind it. [`SortTree`]
//! supplies that missing comparator per relationship path, mirroring the
//! `orderBy` the query delegate (§2) already attaches to each `related`
//! entry in the AST.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::change::{Change, ChildChange, Node, drain_change};
use crate::error::IvmError;
use crate::input::{FetchRequest, InputRef, Output, WeakOutputRef};
use crate::sort::Sort;
use crate::value::Row;

/// Whether a view (or a single relationship within it) holds an ordered
/// array or at most one row (spec §4.7 "Singular mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Many,
    Singular,
}

/// Whether the upstream query-complete signal has resolved yet (spec §6
/// "View output").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultDetails {
    #[default]
    Unknown,
    Complete,
}

/// The comparator governing one level of a materialized view — the view
/// itself, or one named relationship within it — plus the comparators for
/// whatever relationships nest below it.
#[derive(Debug, Clone)]
pub struct SortTree {
    pub sort: Rc<Sort>,
    pub cardinality: Cardinality,
    children: HashMap<String, SortTree>,
}

impl SortTree {
    pub fn new(sort: Rc<Sort>, cardinality: Cardinality) -> Self {
        SortTree {
            sort,
            cardinality,
            children: HashMap::new(),
        }
    }

    /// A many-valued level with no further nested relationships declared.
    pub fn leaf(sort: Rc<Sort>) -> Self {
        SortTree::new(sort, Cardinality::Many)
    }

    pub fn singular(sort: Rc<Sort>) -> Self {
        SortTree::new(sort, Cardinality::Singular)
    }

    pub fn with_child(mut self, name: impl Into<String>, child: SortTree) -> Self {
        self.children.insert(name.into(), child);
        self
    }

    fn child(&self, name: &str) -> Option<&SortTree> {
        self.children.get(name)
    }
}

/// A materialized row plus its per-relationship children and a hidden
/// reference count (spec §4.7, §9 "Reference counting in the view").
///
/// The refcount is not exposed to the public observable shape of the view
/// (§9) — it exists so that the same logical row reachable via more than
/// one upstream path (an `OR`-merged `FanIn`, or more than one join
/// correlation matching the same key) is represented once, added once to
/// the array, and only spliced out once every path has removed it.
#[derive(Debug, Clone)]
pub struct ViewRow {
    row: Row,
    refcount: usize,
    relationships: HashMap<String, Vec<ViewRow>>,
}

impl ViewRow {
    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn relationship(&self, name: &str) -> &[ViewRow] {
        self.relationships.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    #[cfg(test)]
    fn refcount(&self) -> usize {
        self.refcount
    }
}

fn binary_search(rows: &[ViewRow], sort: &Sort, row: &Row) -> Result<usize, usize> {
    rows.binary_search_by(|existing| sort.compare(&existing.row, row))
}

/// Invoke and fully materialize every relationship a freshly-added node
/// carries, recursing according to `tree`. A relationship with no matching
/// entry in `tree` has no known sort order; its children are still
/// materialized (arrival order) but cannot themselves carry further nested
/// relationships, since there is nowhere to look up their comparator either.
fn materialize(node: Node, tree: &SortTree) -> ViewRow {
    let Node { row, relationships } = node;
    let mut built = HashMap::with_capacity(relationships.len());
    for (name, thunk) in relationships {
        let mut stream = thunk();
        let mut children = Vec::new();
        match tree.child(&name) {
            Some(child_tree) => {
                while let Some(child_node) = stream.next() {
                    children.push(materialize(child_node, child_tree));
                }
            }
            None => {
                warn!(relationship = %name, "materializing relationship with no declared sort");
                while let Some(child_node) = stream.next() {
                    child_node.drain_relationships();
                    children.push(ViewRow {
                        row: child_node.row,
                        refcount: 1,
                        relationships: HashMap::new(),
                    });
                }
            }
        }
        built.insert(name, children);
    }
    ViewRow {
        row,
        refcount: 1,
        relationships: built,
    }
}

fn apply_add(rows: &mut Vec<ViewRow>, tree: &SortTree, node: Node) -> Result<(), IvmError> {
    match binary_search(rows, &tree.sort, &node.row) {
        Ok(idx) => {
            rows[idx].refcount += 1;
            node.drain_relationships();
            Ok(())
        }
        Err(idx) => {
            if tree.cardinality == Cardinality::Singular && !rows.is_empty() {
                node.drain_relationships();
                return Err(IvmError::SingularViewOverflow);
            }
            rows.insert(idx, materialize(node, tree));
            Ok(())
        }
    }
}

fn apply_remove(rows: &mut Vec<ViewRow>, sort: &Sort, node: Node) -> Result<(), IvmError> {
    match binary_search(rows, sort, &node.row) {
        Ok(idx) => {
            node.drain_relationships();
            rows[idx].refcount -= 1;
            if rows[idx].refcount == 0 {
                rows.remove(idx);
            }
            Ok(())
        }
        Err(_) => {
            let row = node.row.clone();
            node.drain_relationships();
            Err(IvmError::InternalError(format!(
                "remove for row not present in view: {row:?}"
            )))
        }
    }
}

fn apply_edit(rows: &mut Vec<ViewRow>, sort: &Sort, old_node: Node, node: Node) -> Result<(), IvmError> {
    let old_row = old_node.row.clone();
    old_node.drain_relationships();
    let new_row = node.row.clone();
    node.drain_relationships();

    let old_idx = match binary_search(rows, sort, &old_row) {
        Ok(idx) => idx,
        Err(_) => {
            return Err(IvmError::InternalError(format!(
                "edit for row not present in view: {old_row:?}"
            )));
        }
    };

    if sort.compare(&new_row, &old_row) == Ordering::Equal {
        // Position unchanged: mutate in place, keeping the existing
        // relationship arrays exactly as they are (spec §4.7 "do not
        // rebuild").
        rows[old_idx].row = new_row;
        return Ok(());
    }

    let mut moved = rows.remove(old_idx);
    moved.row = new_row;
    match binary_search(rows, sort, &moved.row) {
        Ok(idx) => rows[idx].refcount += 1,
        Err(idx) => rows.insert(idx, moved),
    }
    Ok(())
}

fn apply_child(rows: &mut Vec<ViewRow>, tree: &SortTree, node: Node, child: ChildChange) -> Result<(), IvmError> {
    let row = node.row.clone();
    node.drain_relationships();

    let idx = match binary_search(rows, &tree.sort, &row) {
        Ok(idx) => idx,
        Err(_) => {
            drain_change(*child.change);
            return Err(IvmError::InternalError(format!(
                "child change for row not present in view: {row:?}"
            )));
        }
    };

    let Some(child_tree) = tree.child(&child.relationship_name) else {
        warn!(relationship = %child.relationship_name, "child change for relationship with no declared sort; dropping");
        drain_change(*child.change);
        return Ok(());
    };

    let nested = rows[idx].relationships.entry(child.relationship_name).or_default();
    apply_to_rows(nested, child_tree, *child.change)
}

fn apply_to_rows(rows: &mut Vec<ViewRow>, tree: &SortTree, change: Change) -> Result<(), IvmError> {
    match change {
        Change::Add { node } => apply_add(rows, tree, node),
        Change::Remove { node } => apply_remove(rows, &tree.sort, node),
        Change::Edit { old_node, node } => apply_edit(rows, &tree.sort, old_node, node),
        Change::Child { node, child } => apply_child(rows, tree, node, child),
    }
}

/// Converts a hierarchical node stream plus push `Change`s into a live
/// ordered array (or singular scalar) with per-row reference counting
/// (spec §4.7).
pub struct View {
    input: InputRef,
    tree: SortTree,
    rows: Vec<ViewRow>,
    result_details: ResultDetails,
    listeners: Vec<Box<dyn FnMut()>>,
    batch_depth: Cell<usize>,
    dirty: Cell<bool>,
    /// Set once an apply fails an invariant (spec §7): the current push is
    /// considered aborted and this view must be destroyed. `Output::push`
    /// has no return channel to propagate the error synchronously, so it is
    /// recorded here for the embedder to observe via [`View::poisoned`].
    poison: RefCell<Option<IvmError>>,
}

impl View {
    /// Build a view over `input`, wire it as that input's `Output`, and
    /// perform the initial full materialization (spec §4.7, §6 "View
    /// output").
    pub fn new(input: InputRef, tree: SortTree) -> Rc<RefCell<View>> {
        let view = Rc::new(RefCell::new(View {
            input: input.clone(),
            tree,
            rows: Vec::new(),
            result_details: ResultDetails::Unknown,
            listeners: Vec::new(),
            batch_depth: Cell::new(0),
            dirty: Cell::new(false),
            poison: RefCell::new(None),
        }));

        let weak_output: WeakOutputRef = Rc::downgrade(&(view.clone() as Rc<RefCell<dyn Output>>));
        input.borrow_mut().set_output(weak_output);

        View::load_initial(&view);
        view
    }

    fn load_initial(view: &Rc<RefCell<View>>) {
        let mut built = Vec::new();
        {
            let v = view.borrow();
            let mut stream = v.input.borrow().fetch(&FetchRequest::new());
            while let Some(node) = stream.next() {
                built.push(materialize(node, &v.tree));
            }
        }
        debug!(rows = built.len(), "view initial materialization");
        view.borrow_mut().rows = built;
    }

    pub fn cardinality(&self) -> Cardinality {
        self.tree.cardinality
    }

    pub fn result_details(&self) -> ResultDetails {
        self.result_details
    }

    /// Transition `resultDetails` from `unknown` to `complete` (spec §6 —
    /// "transitions from unknown when the query-complete promise
    /// resolves"). Does not itself notify commit listeners; callers that
    /// want observers to see the transition should wrap it in [`View::batch`]
    /// or call it outside of a batch so the next natural commit picks it up.
    pub fn mark_complete(&mut self) {
        self.result_details = ResultDetails::Complete;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &ViewRow> {
        self.rows.iter()
    }

    /// The singular value, if this view is in singular mode and populated.
    pub fn value(&self) -> Option<&Row> {
        self.rows.first().map(|r| &r.row)
    }

    /// The most recent invariant violation an apply hit, if any. Per spec
    /// §7, once set the view is no longer usable and must be destroyed.
    pub fn poisoned(&self) -> Option<IvmError> {
        self.poison.borrow().as_ref().map(error_clone)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poison.borrow().is_some()
    }

    /// Register a commit listener, fired synchronously after each batched
    /// apply (spec §4.7, §6 "Listeners fire synchronously after each
    /// transaction commit"). Returns a handle usable with
    /// [`View::remove_commit_listener`].
    pub fn add_commit_listener(&mut self, listener: impl FnMut() + 'static) -> usize {
        self.listeners.push(Box::new(listener));
        self.listeners.len() - 1
    }

    pub fn remove_commit_listener(&mut self, id: usize) {
        if let Some(slot) = self.listeners.get_mut(id) {
            *slot = Box::new(|| {});
        }
    }

    fn notify_listeners(&mut self) {
        for listener in &mut self.listeners {
            // Spec §4.7: "listener exceptions are caught and logged, never
            // propagated" — the nearest Rust equivalent of a fallible
            // observer callback that must not be allowed to unwind past
            // this boundary.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener()));
            if result.is_err() {
                error!("view commit listener panicked; continuing");
            }
        }
    }

    /// Begin a batch: `Output::push` calls observed while a batch is open
    /// defer listener notification until the matching [`View::end_batch`]
    /// (spec §4.7 "a batching hook wraps all view mutations resulting from
    /// one upstream transaction"). Takes `&self` so the hook can be opened
    /// before the caller re-borrows the view mutably to drive the pushes
    /// that land on it.
    pub fn begin_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    pub fn end_batch(&mut self) {
        let depth = self.batch_depth.get().saturating_sub(1);
        self.batch_depth.set(depth);
        if depth == 0 && self.dirty.get() {
            self.dirty.set(false);
            self.notify_listeners();
        }
    }

    /// Run `f` with the batching hook held open for its duration. Any
    /// number of upstream pushes performed inside `f` (typically several
    /// `Source::push` calls driven by one poke flush, §4.8) notify commit
    /// listeners at most once.
    pub fn batch<R>(view: &Rc<RefCell<View>>, f: impl FnOnce() -> R) -> R {
        view.borrow().begin_batch();
        let result = f();
        view.borrow_mut().end_batch();
        result
    }

    /// Tear down this view: cascades `destroy` to its input, which cascades
    /// further up to the owning sources (spec §5 "Cancellation").
    pub fn destroy(&mut self) {
        self.input.borrow_mut().destroy();
    }
}

/// `IvmError` does not derive `Clone` (it wraps plain `String`s, which
/// would make `Clone` trivial, but the type is kept minimal); reconstruct
/// an equivalent value for [`View::poisoned`] rather than adding `Clone`
/// project-wide for one accessor.
fn error_clone(err: &IvmError) -> IvmError {
    IvmError::InternalError(err.to_string())
}

impl Output for View {
    fn push(&mut self, change: Change) {
        if self.is_poisoned() {
            drain_change(change);
            return;
        }
        match apply_to_rows(&mut self.rows, &self.tree, change) {
            Ok(()) => {
                if self.batch_depth.get() == 0 {
                    self.notify_listeners();
                } else {
                    self.dirty.set(true);
                }
            }
            Err(err) => {
                error!(?err, "view apply failed; view must be destroyed");
                *self.poison.borrow_mut() = Some(err);
            }
        }
    }
}
