//! Property-based coverage of spec §8 invariants:
//!
//! - view order always matches the top-level operator's declared sort,
//!   regardless of the order rows were pushed in;
//! - a row's visible refcount never goes negative, and a view never holds a
//!   row once its refcount has been driven to (or below) zero;
//! - a chain of buffered pokes either merges in full or is rejected whole as
//!   a cookie gap — partial application never happens.
//!
//! Mirrors the teacher's own `property_tests.rs` style: helper `arb_*`
//! strategies feeding `proptest!` blocks of `prop_`-prefixed tests.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;

use proptest::prelude::*;

use viewflow::change::Change;
use viewflow::error::IvmError;
use viewflow::input::{InputRef, Output};
use viewflow::name_map::IdentityNameMapper;
use viewflow::poke::{MergedPatch, PatchSink, PokeMerger, PokePart, RowPatchOp};
use viewflow::scheduler::ManualFrameScheduler;
use viewflow::sort::{Sort, SortField};
use viewflow::source::{Source, SourceChange};
use viewflow::value::{PrimaryKey, Row, Value};
use viewflow::view::{SortTree, View};

static TRACING_INIT: Once = Once::new();

/// Initialize a real subscriber once, the way an embedder would at process
/// start, so test runs can be observed with `RUST_LOG` set.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn row_with_id(id: i64) -> Row {
    let mut row = Row::new();
    row.set("a", Value::Number(id as f64));
    row
}

fn row_id(row: &Row) -> i64 {
    match row.get("a") {
        Some(Value::Number(n)) => *n as i64,
        other => panic!("expected a numeric \"a\" column, got {other:?}"),
    }
}

fn arb_unique_ids() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::hash_set(0i64..500, 1..40).prop_map(|ids| ids.into_iter().collect())
}

struct RecordingSink {
    applied: Rc<RefCell<Vec<MergedPatch>>>,
}

impl PatchSink for RecordingSink {
    fn apply_patch(&mut self, patch: MergedPatch) -> Result<(), IvmError> {
        self.applied.borrow_mut().push(patch);
        Ok(())
    }
}

/// Build `n` sequential, chained poke cookies `"0" -> "1" -> ... -> "n"`.
/// When `break_at` names an index `>= 1`, that poke's base cookie is
/// corrupted so it no longer chains from the previous poke's end cookie,
/// without removing any poke from the sequence.
fn cookie_chain(n: usize, break_at: Option<usize>) -> Vec<(String, String)> {
    (0..n)
        .map(|i| {
            let base = if break_at == Some(i) && i > 0 { "corrupt".to_string() } else { i.to_string() };
            (base, (i + 1).to_string())
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// View order always matches the top sort order (spec §3 "Hierarchical
    /// ordering", §8 invariant 1), independent of push order.
    #[test]
    fn prop_view_order_matches_top_sort_order(ids in arb_unique_ids()) {
        init_tracing();
        let sort = Sort::new(vec![SortField::asc("a")], PrimaryKey::new(["a"]));
        let source = Source::new("t", PrimaryKey::new(["a"]));
        let source_input = source.connect(sort.clone(), None, vec![]);
        let input: InputRef = Rc::new(RefCell::new(source_input));
        let view = View::new(input, SortTree::leaf(Rc::new(sort)));

        for id in &ids {
            source.push(SourceChange::Add(row_with_id(*id))).unwrap();
        }

        let observed: Vec<i64> = view.borrow().rows().map(|r| row_id(r.row())).collect();
        let mut expected = ids.clone();
        expected.sort_unstable();
        prop_assert_eq!(observed, expected);
        prop_assert!(!view.borrow().is_poisoned());
    }

    /// A row's refcount never goes negative: pushing `adds` adds followed by
    /// `removes <= adds` removes for the same primary key never poisons the
    /// view, and the row is present iff its refcount is still positive
    /// (spec §4.6 "ref-counted row storage", §8 invariant 4).
    #[test]
    fn prop_refcount_never_goes_negative(adds in 1usize..6, removes in 0usize..6) {
        init_tracing();
        let removes = removes.min(adds);
        let sort = Sort::new(vec![SortField::asc("a")], PrimaryKey::new(["a"]));
        let source = Source::new("t", PrimaryKey::new(["a"]));
        let source_input = source.connect(sort.clone(), None, vec![]);
        let input: InputRef = Rc::new(RefCell::new(source_input));
        let view = View::new(input, SortTree::leaf(Rc::new(sort)));

        for _ in 0..adds {
            view.borrow_mut().push(Change::add(row_with_id(1)));
        }
        for _ in 0..removes {
            view.borrow_mut().push(Change::remove(row_with_id(1)));
        }

        prop_assert!(!view.borrow().is_poisoned());
        if removes < adds {
            prop_assert_eq!(view.borrow().len(), 1);
        } else {
            prop_assert_eq!(view.borrow().len(), 0);
        }
    }

    /// A chain of buffered pokes either merges atomically in full, or — if
    /// any link's cookie doesn't chain — is rejected as a whole with
    /// nothing applied (spec §4.8, §7 "poke protocol error"); it never
    /// applies a prefix.
    #[test]
    fn prop_cookie_chain_applies_whole_or_not_at_all(n in 2usize..6, break_raw in 0usize..8, inject_gap in any::<bool>()) {
        init_tracing();
        let break_index = 1 + (break_raw % (n - 1));
        let chain = cookie_chain(n, if inject_gap { Some(break_index) } else { None });

        let applied = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let errors_handle = errors.clone();
        let merger = PokeMerger::new(
            ManualFrameScheduler::new(),
            IdentityNameMapper,
            RecordingSink { applied: applied.clone() },
        );
        merger.borrow_mut().set_on_poke_error(move |e| errors_handle.borrow_mut().push(e));

        for (i, (base, end)) in chain.iter().enumerate() {
            let poke_id = format!("p{i}");
            merger.borrow_mut().poke_start(poke_id.clone(), base.clone());
            merger.borrow_mut().poke_part(
                &poke_id,
                "client",
                PokePart::new().with_row_patch(RowPatchOp::Put { table_name: "t".into(), value: row_with_id(i as i64) }),
            );
            merger.borrow_mut().poke_end(&poke_id, end.clone(), false);
        }
        merger.borrow_mut().flush();

        if inject_gap {
            prop_assert!(applied.borrow().is_empty(), "a broken chain must apply nothing");
            prop_assert_eq!(errors.borrow().len(), 1);
            prop_assert!(errors.borrow()[0].is_poke_protocol_error());
        } else {
            prop_assert_eq!(applied.borrow().len(), 1, "an unbroken chain merges into exactly one patch");
            prop_assert!(errors.borrow().is_empty());
            prop_assert_eq!(applied.borrow()[0].rows_patch.len(), chain.len());
        }
    }
}
