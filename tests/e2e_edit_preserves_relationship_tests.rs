//! End-to-end: editing a column that isn't part of any relationship
//! correlation mutates the view row in place, preserves the identity of its
//! materialized relationship array, and fires commit listeners exactly once
//! (spec §8 scenario 6).

use std::cell::Cell;
use std::rc::Rc;

use viewflow::query::{Ast, Query, Related, SourceCatalog};
use viewflow::sort::SortField;
use viewflow::source::{Source, SourceChange};
use viewflow::value::{PrimaryKey, Row, Value};
use viewflow::view::Cardinality;

fn parent(id: i64, title: &str) -> Row {
    let mut r = Row::new();
    r.set("id", Value::Number(id as f64));
    r.set("title", Value::String(title.into()));
    r
}

fn child(id: i64, parent_id: i64) -> Row {
    let mut r = Row::new();
    r.set("id", Value::Number(id as f64));
    r.set("parentID", Value::Number(parent_id as f64));
    r
}

#[test]
fn test_edit_preserves_relationship_and_fires_listener_once() {
    let parents = Source::new("items", PrimaryKey::new(["id"]));
    let children = Source::new("comments", PrimaryKey::new(["id"]));
    parents.push(SourceChange::Add(parent(1, "a"))).unwrap();
    children.push(SourceChange::Add(child(100, 1))).unwrap();

    let mut catalog = SourceCatalog::new();
    catalog.register("items", parents.clone(), PrimaryKey::new(["id"]));
    catalog.register("comments", children.clone(), PrimaryKey::new(["id"]));

    let ast = Ast::new("items").with_order_by(vec![SortField::asc("id")]).with_related(Related {
        name: "comments".into(),
        parent_field: "id".into(),
        child_field: "parentID".into(),
        subquery: Box::new(Ast::new("comments").with_order_by(vec![SortField::asc("id")])),
        singular: false,
        op: None,
        hidden: false,
    });

    let query = Query::build(&ast, &catalog, Cardinality::Many).unwrap();
    assert_eq!(query.view.borrow().rows().next().unwrap().relationship("comments").len(), 1);

    let fire_count = Rc::new(Cell::new(0));
    let fire_count_handle = fire_count.clone();
    query.view.borrow_mut().add_commit_listener(move || fire_count_handle.set(fire_count_handle.get() + 1));

    parents
        .push(SourceChange::Edit { old: parent(1, "a"), new: parent(1, "a-renamed") })
        .unwrap();

    assert_eq!(fire_count.get(), 1, "exactly one commit listener fire for the single edit");
    let view = query.view.borrow();
    let row = view.rows().next().unwrap();
    assert_eq!(row.row().get("title"), Some(&Value::String("a-renamed".into())));
    assert_eq!(row.relationship("comments").len(), 1, "relationship array survives the in-place edit");
}
