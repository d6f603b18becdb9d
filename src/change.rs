//! The `Change` ADT and hierarchical `Node` type (spec §3, §4.1).
//!
//! A [`Node`] pairs a row with its relationships. Relationships are lazy:
//! each one is a thunk returning a [`RelationshipStream`], a single-use
//! iterator over child nodes. The stream cannot be rewound — once consumed
//! or abandoned it must be [`RelationshipStream::drain`]ed so that the
//! operator storage backing it can release its reference counts (§3,
//! "Streams are single-pass").

use std::collections::HashMap;

use crate::value::Row;

/// A single-use stream of child nodes produced by invoking a relationship
/// thunk. Implementors back this with whatever the owning operator uses
/// internally (a `fetch`/`cleanup` walk over a child `Input`, typically).
pub trait RelationshipStream {
    /// Pull the next child node, or `None` when exhausted.
    fn next(&mut self) -> Option<Node>;

    /// Consume and discard all remaining nodes without materializing them,
    /// releasing any storage they would otherwise hold a reference to.
    /// Default implementation just calls `next()` to exhaustion — that is
    /// correct but not necessarily efficient; operators whose storage
    /// bookkeeping can be released in bulk should override this.
    fn drain(&mut self) {
        while self.next().is_some() {}
    }
}

/// A boxed, type-erased relationship stream.
pub type BoxedStream = Box<dyn RelationshipStream>;

/// A relationship thunk: calling it produces a fresh, one-shot stream.
/// Stored as a boxed closure so each relationship can close over whatever
/// state (a child `Input`, a correlation value) it needs to start a fetch.
pub type RelationshipThunk = Box<dyn FnOnce() -> BoxedStream>;

/// A materialized row plus its lazy relationship children.
pub struct Node {
    pub row: Row,
    pub relationships: HashMap<String, RelationshipThunk>,
}

impl Node {
    pub fn new(row: Row) -> Self {
        Node {
            row,
            relationships: HashMap::new(),
        }
    }

    pub fn with_relationship(
        mut self,
        name: impl Into<String>,
        thunk: RelationshipThunk,
    ) -> Self {
        self.relationships.insert(name.into(), thunk);
        self
    }

    /// Invoke and fully drain every relationship this node carries,
    /// releasing the storage each one holds a reference to. Used when a
    /// node is discarded (e.g. a `remove`'s outgoing snapshot) without its
    /// relationships ever being materialized by a view.
    pub fn drain_relationships(self) {
        for (_name, thunk) in self.relationships {
            let mut stream = thunk();
            stream.drain();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("row", &self.row)
            .field("relationships", &self.relationships.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Discard a [`Change`] that will not be forwarded, draining every node it
/// carries so operator storage backing it is released (spec §3, "Streams
/// are single-pass"). Shared by operators that drop changes outright (a
/// `Skip`/`Take` boundary a row doesn't clear) and by the view materializer
/// when it rejects a change it cannot apply.
pub fn drain_change(change: Change) {
    match change {
        Change::Add { node } | Change::Remove { node } => node.drain_relationships(),
        Change::Edit { old_node, node } => {
            old_node.drain_relationships();
            node.drain_relationships();
        }
        Change::Child { node, child } => {
            node.drain_relationships();
            drain_change(*child.change);
        }
    }
}

/// A change confined to a descendant relationship (spec §3 `child`).
pub struct ChildChange {
    pub relationship_name: String,
    pub change: Box<Change>,
}

/// The change ADT threaded through every operator's `push` (spec §3).
pub enum Change {
    Add { node: Node },
    Remove { node: Node },
    Edit { old_node: Node, node: Node },
    Child { node: Node, child: ChildChange },
}

impl Change {
    /// The row identifying this change at the current operator level. For
    /// `Edit`, this is the *new* row; for `Child`, the parent row.
    pub fn row(&self) -> &Row {
        match self {
            Change::Add { node } => &node.row,
            Change::Remove { node } => &node.row,
            Change::Edit { node, .. } => &node.row,
            Change::Child { node, .. } => &node.row,
        }
    }

    pub fn add(row: Row) -> Self {
        Change::Add { node: Node::new(row) }
    }

    pub fn remove(row: Row) -> Self {
        Change::Remove { node: Node::new(row) }
    }

    pub fn edit(old_row: Row, new_row: Row) -> Self {
        Change::Edit {
            old_node: Node::new(old_row),
            node: Node::new(new_row),
        }
    }

    pub fn child(row: Row, relationship_name: impl Into<String>, change: Change) -> Self {
        Change::Child {
            node: Node::new(row),
            child: ChildChange {
                relationship_name: relationship_name.into(),
                change: Box::new(change),
            },
        }
    }
}

impl std::fmt::Debug for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Change::Add { node } => f.debug_tuple("Add").field(&node.row).finish(),
            Change::Remove { node } => f.debug_tuple("Remove").field(&node.row).finish(),
            Change::Edit { old_node, node } => f
                .debug_tuple("Edit")
                .field(&old_node.row)
                .field(&node.row)
                .finish(),
            Change::Child { node, child } => f
                .debug_struct("Child")
                .field("row", &node.row)
                .field("relationship", &child.relationship_name)
                .field("change", &child.change)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    struct VecStream(std::vec::IntoIter<Node>);
    impl RelationshipStream for VecStream {
        fn next(&mut self) -> Option<Node> {
            self.0.next()
        }
    }

    fn row(a: f64) -> Row {
        let mut r = Row::new();
        r.set("a", Value::Number(a));
        r
    }

    #[test]
    fn test_drain_relationships_consumes_thunk() {
        let drained = std::rc::Rc::new(std::cell::Cell::new(false));
        let drained2 = drained.clone();
        let thunk: RelationshipThunk = Box::new(move || {
            drained2.set(true);
            Box::new(VecStream(vec![Node::new(row(1.0))].into_iter())) as BoxedStream
        });
        let node = Node::new(row(0.0)).with_relationship("children", thunk);
        node.drain_relationships();
        assert!(drained.get());
    }

    #[test]
    fn test_change_row_accessor() {
        let c = Change::add(row(1.0));
        assert_eq!(c.row().get("a"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn test_default_drain_exhausts_stream() {
        let mut stream = VecStream(vec![Node::new(row(1.0)), Node::new(row(2.0))].into_iter());
        stream.drain();
        assert!(stream.next().is_none());
    }
}
