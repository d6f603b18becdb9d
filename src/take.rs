//! Take — sliding-window LIMIT-N operator (spec §4.5).
//!
//! Maintains the first `limit` rows of the upstream sort order, per
//! partition (the empty partition key describes an unconstrained
//! top-level `LIMIT`; a non-empty one is how a `Take` nested under a
//! `Join` relationship — "first 3 comments per post" — scopes its
//! window to each correlation value separately). Storage holds, per
//! partition, the window's current size and its *boundary*: the last
//! (highest-sorting) row currently inside the window. While the
//! window isn't yet full there is no boundary — every upstream row
//! belongs to it.
//!
//! Boundary crossings (a row entering displaces the previous boundary,
//! or a windowed row leaves and a successor must be pulled in) are
//! resolved by a bounded refetch of the partition's first `limit` rows
//! rather than incremental predecessor/successor bookkeeping — the
//! same "recompute for the affected partition" strategy
//! `dvm::operators::window` uses for window functions, adapted here to
//! push-based membership tracking instead of batch SQL differencing.
//! The cost is bounded by `limit`, not by partition size, so this stays
//! cheap even for large upstream partitions.

use std::cmp::Ordering;
use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::change::{BoxedStream, Change, Node, RelationshipStream};
use crate::input::{Basis, Constraint, FetchRequest, Input, InputRef, Output, OutputRef, WeakOutputRef};
use crate::sort::Sort;
use crate::storage::Storage;
use crate::value::{Row, Value};

#[derive(Debug, Clone, Default)]
struct PartitionState {
    size: usize,
    /// Set exactly when `size == limit`: the highest-sorting row
    /// currently in the window.
    boundary: Option<Row>,
}

struct TakeInner {
    upstream: InputRef,
    limit: usize,
    partition_key: Vec<String>,
    storage: Storage<PartitionState>,
    output: Option<WeakOutputRef>,
}

impl TakeInner {
    fn partition_values(&self, row: &Row) -> Vec<Value> {
        self.partition_key.iter().map(|c| row.get_or_null(c)).collect()
    }

    fn request_partition_values(&self, req: &FetchRequest) -> Vec<Value> {
        self.partition_key
            .iter()
            .map(|c| {
                req.constraint
                    .as_ref()
                    .and_then(|ct| ct.iter().find(|(k, _)| *k == c).map(|(_, v)| v.clone()))
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    fn partition_constraint(&self, values: &[Value]) -> Constraint {
        Constraint::from_pairs(self.partition_key.iter().cloned().zip(values.iter().cloned()))
    }

    /// Walk the partition from its start and recompute size/boundary from
    /// scratch. Bounded to `limit` upstream rows.
    fn recompute(&self, values: &[Value]) -> PartitionState {
        let req = FetchRequest::new().with_constraint(self.partition_constraint(values));
        let mut stream = self.upstream.borrow().fetch(&req);
        let mut last: Option<Row> = None;
        let mut size = 0usize;
        while size < self.limit {
            let Some(node) = stream.next() else { break };
            let row = node.row.clone();
            node.drain_relationships();
            last = Some(row);
            size += 1;
        }
        stream.drain();
        PartitionState {
            size,
            boundary: if size == self.limit { last } else { None },
        }
    }
}

pub struct Take {
    inner: Rc<RefCell<TakeInner>>,
}

pub struct TakeOutput(Rc<RefCell<TakeInner>>);

impl Take {
    pub fn new(
        upstream: InputRef,
        limit: usize,
        partition_key: Vec<String>,
    ) -> (Self, Rc<RefCell<TakeOutput>>) {
        assert!(limit > 0, "take limit must be positive");
        let inner = Rc::new(RefCell::new(TakeInner {
            upstream,
            limit,
            partition_key,
            storage: Storage::new(),
            output: None,
        }));
        let output_side = Rc::new(RefCell::new(TakeOutput(inner.clone())));
        (Take { inner }, output_side)
    }

    pub fn storage_len(&self) -> usize {
        self.inner.borrow().storage.len()
    }

    fn ensure_state(&self, values: &[Value]) -> PartitionState {
        let cached = self.inner.borrow().storage.get(&values.to_vec()).cloned();
        if let Some(state) = cached {
            return state;
        }
        let state = self.inner.borrow().recompute(values);
        self.inner.borrow_mut().storage.insert(values.to_vec(), state.clone());
        state
    }
}

/// Bounds an upstream stream to the rows at or before `boundary` (under
/// the upstream sort order). `None` means the window isn't full yet, so
/// every upstream row in the partition belongs to it.
struct TakeStream {
    upstream: BoxedStream,
    boundary: Option<Row>,
    sort: Rc<Sort>,
}

impl RelationshipStream for TakeStream {
    fn next(&mut self) -> Option<Node> {
        let node = self.upstream.next()?;
        if let Some(boundary) = &self.boundary {
            if self.sort.compare(&node.row, boundary) == Ordering::Greater {
                node.drain_relationships();
                self.upstream.drain();
                return None;
            }
        }
        Some(node)
    }

    fn drain(&mut self) {
        while let Some(node) = self.next() {
            node.drain_relationships();
        }
    }
}

impl Input for Take {
    fn sort(&self) -> Rc<Sort> {
        self.inner.borrow().upstream.borrow().sort()
    }

    fn fetch(&self, req: &FetchRequest) -> BoxedStream {
        let values = self.inner.borrow().request_partition_values(req);
        let state = self.ensure_state(&values);
        let upstream = self.inner.borrow().upstream.borrow().fetch(req);
        let sort = self.inner.borrow().upstream.borrow().sort();
        Box::new(TakeStream { upstream, boundary: state.boundary, sort })
    }

    fn cleanup(&self, req: &FetchRequest) -> BoxedStream {
        let values = self.inner.borrow().request_partition_values(req);
        let state = self.ensure_state(&values);
        if req.start.is_none() {
            self.inner.borrow_mut().storage.remove(&values);
        }
        let upstream = self.inner.borrow().upstream.borrow().cleanup(req);
        let sort = self.inner.borrow().upstream.borrow().sort();
        Box::new(TakeStream { upstream, boundary: state.boundary, sort })
    }

    fn fully_applied_filters(&self) -> bool {
        self.inner.borrow().upstream.borrow().fully_applied_filters()
    }

    fn set_output(&mut self, output: WeakOutputRef) {
        self.inner.borrow_mut().output = Some(output);
    }

    fn destroy(&mut self) {
        let upstream = self.inner.borrow().upstream.clone();
        upstream.borrow_mut().destroy();
    }
}

/// Push a row that was not previously tracked (add, or an edit turning a
/// previously out-of-window row into one). Evicts the current boundary
/// if the window is already full and `node`'s row outranks it.
fn emit_add(inner: &Rc<RefCell<TakeInner>>, output: &OutputRef, values: &[Value], node: Node) {
    let limit = inner.borrow().limit;
    let state = inner.borrow().storage.get(&values.to_vec()).cloned().unwrap_or_default();

    if state.size < limit {
        output.borrow_mut().push(Change::Add { node });
        let new_state = if state.size + 1 == limit {
            inner.borrow().recompute(values)
        } else {
            PartitionState { size: state.size + 1, boundary: None }
        };
        inner.borrow_mut().storage.insert(values.to_vec(), new_state);
        return;
    }

    let boundary = state.boundary.clone().expect("full window always has a boundary");
    let sort = inner.borrow().upstream.borrow().sort();
    if sort.compare(&node.row, &boundary) == Ordering::Less {
        output.borrow_mut().push(Change::Remove { node: Node::new(boundary) });
        output.borrow_mut().push(Change::Add { node });
        let new_state = inner.borrow().recompute(values);
        inner.borrow_mut().storage.insert(values.to_vec(), new_state);
    } else {
        node.drain_relationships();
    }
}

/// Push a row leaving the tracked set (remove, or an edit turning a
/// windowed row into an out-of-window one). Backfills from the
/// partition's successor when the window was full.
fn emit_remove(inner: &Rc<RefCell<TakeInner>>, output: &OutputRef, values: &[Value], node: Node) {
    let Some(state) = inner.borrow().storage.get(&values.to_vec()).cloned() else {
        warn!("take: remove for untracked partition, suppressing");
        node.drain_relationships();
        return;
    };
    let limit = inner.borrow().limit;

    if state.size < limit {
        output.borrow_mut().push(Change::Remove { node });
        let new_state = PartitionState { size: state.size.saturating_sub(1), boundary: None };
        inner.borrow_mut().storage.insert(values.to_vec(), new_state);
        return;
    }

    let boundary = state.boundary.clone().expect("full window always has a boundary");
    let sort = inner.borrow().upstream.borrow().sort();
    if sort.compare(&node.row, &boundary) == Ordering::Greater {
        node.drain_relationships();
        return;
    }

    output.borrow_mut().push(Change::Remove { node });
    let req = FetchRequest::new()
        .with_constraint(inner.borrow().partition_constraint(values))
        .with_start(boundary.clone(), Basis::After);
    let upstream = inner.borrow().upstream.clone();
    let mut stream = upstream.borrow().fetch(&req);
    let successor = stream.next();
    stream.drain();

    let new_state = match successor {
        Some(succ_node) => {
            let new_boundary = succ_node.row.clone();
            output.borrow_mut().push(Change::Add { node: succ_node });
            PartitionState { size: limit, boundary: Some(new_boundary) }
        }
        None => PartitionState { size: limit - 1, boundary: None },
    };
    inner.borrow_mut().storage.insert(values.to_vec(), new_state);
}

impl Output for TakeOutput {
    fn push(&mut self, change: Change) {
        let inner = &self.0;
        let output = inner.borrow().output.clone();
        let Some(output) = output.and_then(|w| w.upgrade()) else { return };

        match change {
            Change::Add { node } => {
                let values = inner.borrow().partition_values(&node.row);
                emit_add(inner, &output, &values, node);
            }
            Change::Remove { node } => {
                let values = inner.borrow().partition_values(&node.row);
                emit_remove(inner, &output, &values, node);
            }
            Change::Edit { old_node, node } => {
                let old_values = inner.borrow().partition_values(&old_node.row);
                let new_values = inner.borrow().partition_values(&node.row);
                if old_values != new_values {
                    warn!("take: edit changed partition key, dropping (violates edit invariant)");
                    return;
                }

                let values = old_values;
                let limit = inner.borrow().limit;
                let state = inner.borrow().storage.get(&values.to_vec()).cloned().unwrap_or_default();
                let sort = inner.borrow().upstream.borrow().sort();

                let in_window = |row: &Row, state: &PartitionState| {
                    state.size < limit
                        || state.boundary.as_ref().is_none_or(|b| sort.compare(row, b) != Ordering::Greater)
                };
                let old_in = in_window(&old_node.row, &state);
                let new_in = in_window(&node.row, &state);

                match (old_in, new_in) {
                    (true, true) => {
                        let mut new_state = state.clone();
                        if let Some(boundary) = &new_state.boundary {
                            if *boundary == old_node.row {
                                new_state.boundary = Some(node.row.clone());
                            }
                        }
                        inner.borrow_mut().storage.insert(values, new_state);
                        output.borrow_mut().push(Change::Edit { old_node, node });
                    }
                    (false, false) => {}
                    (true, false) => {
                        emit_remove(inner, &output, &values, old_node);
                    }
                    (false, true) => {
                        emit_add(inner, &output, &values, node);
                    }
                }
            }
            Change::Child { node, child } => {
                output.borrow_mut().push(Change::Child { node, child });
            }
        }
    }
}
