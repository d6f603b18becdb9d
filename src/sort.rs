//! Compound sort orders (spec §3, "Hierarchical ordering").
//!
//! Every sort order used by a source index or an operator is a compound
//! list of `(column, direction)` pairs, always tie-broken by the primary
//! key so that two distinct rows never compare equal.

use std::cmp::Ordering;

use crate::value::{PrimaryKey, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub column: String,
    pub direction: Direction,
}

impl SortField {
    pub fn asc(column: impl Into<String>) -> Self {
        SortField {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        SortField {
            column: column.into(),
            direction: Direction::Desc,
        }
    }
}

/// A compound sort order, always ending in the primary-key tie-break.
#[derive(Debug, Clone)]
pub struct Sort {
    fields: Vec<SortField>,
    pk: PrimaryKey,
}

impl Sort {
    /// Build a sort order from explicit fields. The primary key is always
    /// appended (ascending) as the final tie-break by [`Sort::compare`].
    pub fn new(fields: Vec<SortField>, pk: PrimaryKey) -> Self {
        Sort { fields, pk }
    }

    pub fn fields(&self) -> &[SortField] {
        &self.fields
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.pk
    }

    /// Compare two rows under this sort order: declared fields first, then
    /// the primary key ascending as a final tie-break.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for field in &self.fields {
            let va = a.get_or_null(&field.column);
            let vb = b.get_or_null(&field.column);
            let ord = va.cmp(&vb);
            let ord = match field.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        let pa = self.pk.extract(a);
        let pb = self.pk.extract(b);
        pa.cmp(&pb)
    }

    /// Whether `row` sorts strictly before `start` (used to implement
    /// `basis: 'after'`).
    pub fn before(&self, row: &Row, start: &Row) -> bool {
        self.compare(row, start) == Ordering::Less
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(a: f64, b: &str) -> Row {
        let mut r = Row::new();
        r.set("a", Value::Number(a));
        r.set("b", Value::String(b.into()));
        r
    }

    #[test]
    fn test_compare_ascending() {
        let sort = Sort::new(vec![SortField::asc("b")], PrimaryKey::new(["a"]));
        assert_eq!(sort.compare(&row(1.0, "a"), &row(2.0, "b")), Ordering::Less);
    }

    #[test]
    fn test_compare_descending() {
        let sort = Sort::new(vec![SortField::desc("b")], PrimaryKey::new(["a"]));
        assert_eq!(
            sort.compare(&row(1.0, "a"), &row(2.0, "b")),
            Ordering::Greater
        );
    }

    #[test]
    fn test_tie_broken_by_primary_key() {
        let sort = Sort::new(vec![SortField::asc("b")], PrimaryKey::new(["a"]));
        assert_eq!(sort.compare(&row(1.0, "x"), &row(2.0, "x")), Ordering::Less);
    }
}
