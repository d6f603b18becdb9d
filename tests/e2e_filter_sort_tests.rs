//! End-to-end: a plain filter + sort pipeline, built through the public
//! `Query` delegate rather than poking at `Source`/`Input` directly.

use viewflow::query::{Ast, Query, SourceCatalog};
use viewflow::sort::SortField;
use viewflow::source::{Source, SourceChange};
use viewflow::value::{PrimaryKey, Row, Value};
use viewflow::view::Cardinality;

fn row(a: i64, b: &str) -> Row {
    let mut r = Row::new();
    r.set("a", Value::Number(a as f64));
    r.set("b", Value::String(b.into()));
    r
}

#[test]
fn test_simple_filter_and_sort_end_to_end() {
    let source = Source::new("t", PrimaryKey::new(["a"]));
    source.push(SourceChange::Add(row(1, "a"))).unwrap();
    source.push(SourceChange::Add(row(2, "b"))).unwrap();

    let mut catalog = SourceCatalog::new();
    catalog.register("t", source.clone(), PrimaryKey::new(["a"]));

    let ast = Ast::new("t").with_order_by(vec![SortField::asc("b"), SortField::asc("a")]);
    let query = Query::build(&ast, &catalog, Cardinality::Many).unwrap();

    let values = |q: &Query| -> Vec<Row> { q.view.borrow().rows().map(|r| r.row().clone()).collect() };
    assert_eq!(values(&query), vec![row(1, "a"), row(2, "b")]);

    source.push(SourceChange::Add(row(3, "c"))).unwrap();
    assert_eq!(values(&query), vec![row(1, "a"), row(2, "b"), row(3, "c")]);

    source.push(SourceChange::Remove(row(2, "b"))).unwrap();
    assert_eq!(values(&query), vec![row(1, "a"), row(3, "c")]);
}
