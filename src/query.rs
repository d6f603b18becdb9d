//! The query delegate (spec §2 "glues the above", §6 "Query AST").
//!
//! Given a declarative [`Ast`], builds the operator pipeline it describes —
//! a `Source::connect` at the root, a `Join`/`Exists` per related entry, an
//! optional `Skip`/`Take` pair for pagination — wires every stage's output,
//! and attaches a [`View`] over the top. The AST shape is not prescribed in
//! binary form upstream; this module fixes a concrete Rust type for it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::change::{BoxedStream, Change, Node, RelationshipStream, drain_change};
use crate::error::IvmError;
use crate::exists::Exists;
use crate::filter_expr::{ExistsKind, FilterExpr};
use crate::input::{FetchRequest, Input, InputRef, Output, WeakOutputRef};
use crate::join::{Correlation, Join};
use crate::skip::Skip;
use crate::sort::{Sort, SortField};
use crate::source::Source;
use crate::take::Take;
use crate::value::{PrimaryKey, Row};
use crate::view::{Cardinality, SortTree, View};

/// A relationship attached to a [`Ast`] node (spec §6 "related").
#[derive(Clone)]
pub struct Related {
    /// The name the relationship is exposed under (the view's relationship
    /// key, and the join's `relationshipName`).
    pub name: String,
    /// The column on the parent row correlated against `child_field`.
    pub parent_field: String,
    /// The column on the child row correlated against `parent_field`.
    pub child_field: String,
    pub subquery: Box<Ast>,
    /// A to-one relationship (at most one matching child); singular mode
    /// is enforced in the view's `SortTree` for this branch.
    pub singular: bool,
    /// Present when this relationship is consumed as a correlated-subquery
    /// filter (`EXISTS`/`NOT EXISTS`) rather than — or in addition to —
    /// being materialized for display.
    pub op: Option<ExistsKind>,
    /// A subquery used only to filter (`op.is_some()`, typically) is
    /// usually also `hidden`: its relationship never reaches the view.
    pub hidden: bool,
}

/// The query AST consumed by [`Query::build`] (spec §6).
#[derive(Clone)]
pub struct Ast {
    pub table: String,
    pub alias: String,
    pub condition: Option<FilterExpr>,
    pub order_by: Vec<SortField>,
    pub limit: Option<usize>,
    pub start: Option<Row>,
    pub related: Vec<Related>,
}

impl Ast {
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Ast {
            alias: table.clone(),
            table,
            condition: None,
            order_by: Vec::new(),
            limit: None,
            start: None,
            related: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: FilterExpr) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<SortField>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_start(mut self, start: Row) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_related(mut self, related: Related) -> Self {
        self.related.push(related);
        self
    }
}

/// The tables a [`Ast`] may reference, each with its declared primary key.
#[derive(Default, Clone)]
pub struct SourceCatalog {
    sources: HashMap<String, (Source, PrimaryKey)>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        SourceCatalog::default()
    }

    pub fn register(&mut self, table: impl Into<String>, source: Source, pk: PrimaryKey) {
        self.sources.insert(table.into(), (source, pk));
    }

    fn get(&self, table: &str) -> Result<&(Source, PrimaryKey), IvmError> {
        self.sources
            .get(table)
            .ok_or_else(|| IvmError::InternalError(format!("query AST references unknown table: {table}")))
    }
}

/// A materialized query: the operator pipeline plus the view sitting atop
/// it (spec §2 "Query delegate").
pub struct Query {
    pub view: Rc<RefCell<View>>,
}

impl Query {
    /// Build the full pipeline for `ast` and materialize a view over it.
    /// `cardinality` governs the top-level view only; each `related` entry
    /// declares its own via [`Related::singular`].
    pub fn build(ast: &Ast, catalog: &SourceCatalog, cardinality: Cardinality) -> Result<Self, IvmError> {
        let (input, _sort, mut tree, _pk) = build_level(ast, catalog)?;
        tree.cardinality = cardinality;
        Ok(Query { view: View::new(input, tree) })
    }

    /// Transition the view's `resultDetails` to `complete` (spec §6). A
    /// query built over sources that are already fully populated at
    /// construction time is complete as soon as it is built; an embedder
    /// streaming in an initial sync from elsewhere calls this once that
    /// sync finishes instead.
    pub fn mark_complete(&self) {
        self.view.borrow_mut().mark_complete();
    }

    pub fn destroy(&self) {
        self.view.borrow_mut().destroy();
    }
}

fn build_level(
    ast: &Ast,
    catalog: &SourceCatalog,
) -> Result<(InputRef, Rc<Sort>, SortTree, PrimaryKey), IvmError> {
    let (source, pk) = catalog.get(&ast.table)?;

    let sort = Rc::new(Sort::new(ast.order_by.clone(), pk.clone()));
    let required_columns: Vec<String> = ast.related.iter().map(|r| r.parent_field.clone()).collect();

    let base: InputRef = Rc::new(RefCell::new(source.connect(
        (*sort).clone(),
        ast.condition.clone(),
        required_columns,
    )));

    let mut current_input = base;
    let mut current_tree = SortTree::leaf(sort.clone());

    for related in &ast.related {
        let (child_input, _child_sort, mut child_tree, _child_pk) = build_level(&related.subquery, catalog)?;
        child_tree.cardinality = if related.singular { Cardinality::Singular } else { Cardinality::Many };

        let correlation = Correlation::new(vec![related.parent_field.clone()], vec![related.child_field.clone()]);
        let (join, parent_side, child_side) = Join::new(
            current_input.clone(),
            child_input.clone(),
            correlation,
            related.name.clone(),
            pk.clone(),
        );
        current_input
            .borrow_mut()
            .set_output(Rc::downgrade(&(parent_side as Rc<RefCell<dyn Output>>)));
        child_input
            .borrow_mut()
            .set_output(Rc::downgrade(&(child_side as Rc<RefCell<dyn Output>>)));

        let join_input: InputRef = Rc::new(RefCell::new(join));

        current_input = if let Some(kind) = related.op {
            let (exists_op, exists_output) =
                Exists::new(join_input.clone(), related.name.clone(), kind, pk.clone(), vec![related.parent_field.clone()]);
            join_input
                .borrow_mut()
                .set_output(Rc::downgrade(&(exists_output as Rc<RefCell<dyn Output>>)));
            Rc::new(RefCell::new(exists_op))
        } else {
            join_input
        };

        if related.hidden {
            let (strip, strip_output) = HideRelationship::new(current_input.clone(), related.name.clone());
            current_input
                .borrow_mut()
                .set_output(Rc::downgrade(&(strip_output as Rc<RefCell<dyn Output>>)));
            current_input = Rc::new(RefCell::new(strip));
        } else {
            current_tree = current_tree.with_child(related.name.clone(), child_tree);
        }
    }

    if let Some(start) = &ast.start {
        let (skip, skip_output) = Skip::new(current_input.clone(), start.clone());
        current_input
            .borrow_mut()
            .set_output(Rc::downgrade(&(skip_output as Rc<RefCell<dyn Output>>)));
        current_input = Rc::new(RefCell::new(skip));
    }

    if let Some(limit) = ast.limit {
        let (take, take_output) = Take::new(current_input.clone(), limit, Vec::new());
        current_input
            .borrow_mut()
            .set_output(Rc::downgrade(&(take_output as Rc<RefCell<dyn Output>>)));
        current_input = Rc::new(RefCell::new(take));
    }

    Ok((current_input, sort, current_tree, pk.clone()))
}

fn strip_node(node: Node, name: &str) -> Node {
    let Node { row, mut relationships } = node;
    if let Some(thunk) = relationships.remove(name) {
        thunk().drain();
    }
    Node { row, relationships }
}

/// A pass-through adapter that removes one named relationship from every
/// node crossing it, draining whatever it removes. Used for `related`
/// entries marked `hidden` — subqueries consumed only as an `EXISTS`/`NOT
/// EXISTS` filter and never meant to reach the materialized view.
pub struct HideRelationship {
    upstream: InputRef,
    name: String,
    slot: Rc<RefCell<HideSlot>>,
}

#[derive(Default)]
struct HideSlot {
    output: Option<WeakOutputRef>,
}

pub struct HideRelationshipOutput {
    name: String,
    slot: Rc<RefCell<HideSlot>>,
}

impl HideRelationship {
    pub fn new(upstream: InputRef, name: impl Into<String>) -> (Self, Rc<RefCell<HideRelationshipOutput>>) {
        let name = name.into();
        let slot = Rc::new(RefCell::new(HideSlot::default()));
        let output_side = Rc::new(RefCell::new(HideRelationshipOutput { name: name.clone(), slot: slot.clone() }));
        (HideRelationship { upstream, name, slot }, output_side)
    }
}

struct HideStream {
    inner: BoxedStream,
    name: String,
}

impl RelationshipStream for HideStream {
    fn next(&mut self) -> Option<Node> {
        self.inner.next().map(|node| strip_node(node, &self.name))
    }

    fn drain(&mut self) {
        self.inner.drain();
    }
}

impl Input for HideRelationship {
    fn sort(&self) -> Rc<Sort> {
        self.upstream.borrow().sort()
    }

    fn fetch(&self, req: &FetchRequest) -> BoxedStream {
        Box::new(HideStream { inner: self.upstream.borrow().fetch(req), name: self.name.clone() })
    }

    fn cleanup(&self, req: &FetchRequest) -> BoxedStream {
        Box::new(HideStream { inner: self.upstream.borrow().cleanup(req), name: self.name.clone() })
    }

    fn fully_applied_filters(&self) -> bool {
        self.upstream.borrow().fully_applied_filters()
    }

    fn set_output(&mut self, output: WeakOutputRef) {
        self.slot.borrow_mut().output = Some(output);
    }

    fn destroy(&mut self) {
        self.upstream.borrow_mut().destroy();
    }
}

impl Output for HideRelationshipOutput {
    fn push(&mut self, change: Change) {
        let Some(output) = self.slot.borrow().output.clone().and_then(|w| w.upgrade()) else {
            return;
        };
        match change {
            Change::Add { node } => output.borrow_mut().push(Change::Add { node: strip_node(node, &self.name) }),
            Change::Remove { node } => output.borrow_mut().push(Change::Remove { node: strip_node(node, &self.name) }),
            Change::Edit { old_node, node } => output.borrow_mut().push(Change::Edit {
                old_node: strip_node(old_node, &self.name),
                node: strip_node(node, &self.name),
            }),
            Change::Child { node, child } => {
                if child.relationship_name == self.name {
                    node.drain_relationships();
                    drain_change(*child.change);
                } else {
                    output.borrow_mut().push(Change::Child { node: strip_node(node, &self.name), child });
                }
            }
        }
    }
}
