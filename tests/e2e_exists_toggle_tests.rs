//! End-to-end: EXISTS-subquery filtering toggles parent visibility
//! (spec §8 scenario 3).

use viewflow::filter_expr::ExistsKind;
use viewflow::query::{Ast, Query, Related, SourceCatalog};
use viewflow::sort::SortField;
use viewflow::source::{Source, SourceChange};
use viewflow::value::{PrimaryKey, Row, Value};
use viewflow::view::Cardinality;

fn issue(id: i64) -> Row {
    let mut r = Row::new();
    r.set("id", Value::Number(id as f64));
    r
}

fn label(id: i64, issue_id: i64) -> Row {
    let mut r = Row::new();
    r.set("id", Value::Number(id as f64));
    r.set("issueID", Value::Number(issue_id as f64));
    r
}

#[test]
fn test_exists_subquery_toggles_parent_in_and_out() {
    let issues = Source::new("issue", PrimaryKey::new(["id"]));
    let labels = Source::new("issueLabel", PrimaryKey::new(["id"]));
    issues.push(SourceChange::Add(issue(1))).unwrap();

    let mut catalog = SourceCatalog::new();
    catalog.register("issue", issues.clone(), PrimaryKey::new(["id"]));
    catalog.register("issueLabel", labels.clone(), PrimaryKey::new(["id"]));

    let ast = Ast::new("issue").with_order_by(vec![SortField::asc("id")]).with_related(Related {
        name: "labels".into(),
        parent_field: "id".into(),
        child_field: "issueID".into(),
        subquery: Box::new(Ast::new("issueLabel")),
        singular: false,
        op: Some(ExistsKind::Exists),
        hidden: true,
    });

    let query = Query::build(&ast, &catalog, Cardinality::Many).unwrap();
    assert_eq!(query.view.borrow().len(), 0, "issue 1 has no labels yet");

    labels.push(SourceChange::Add(label(7, 1))).unwrap();
    {
        let view = query.view.borrow();
        assert_eq!(view.len(), 1);
        assert_eq!(view.rows().next().unwrap().row().get("id"), Some(&Value::Number(1.0)));
    }

    labels.push(SourceChange::Remove(label(7, 1))).unwrap();
    assert_eq!(query.view.borrow().len(), 0, "issue 1's only label was removed");
}
