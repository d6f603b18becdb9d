//! End-to-end: a cookie gap between two buffered pokes is rejected and the
//! view-facing sink is left untouched (spec §8 scenario 5).

use std::cell::RefCell;
use std::rc::Rc;

use viewflow::error::IvmError;
use viewflow::name_map::IdentityNameMapper;
use viewflow::poke::{MergedPatch, PatchSink, PokeMerger};
use viewflow::scheduler::ManualFrameScheduler;

struct RecordingSink {
    applied: Rc<RefCell<Vec<MergedPatch>>>,
}

impl PatchSink for RecordingSink {
    fn apply_patch(&mut self, patch: MergedPatch) -> Result<(), IvmError> {
        self.applied.borrow_mut().push(patch);
        Ok(())
    }
}

#[test]
fn test_cookie_gap_between_pokes_is_rejected_and_view_unchanged() {
    let applied = Rc::new(RefCell::new(Vec::new()));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let errors_handle = errors.clone();

    let merger =
        PokeMerger::new(ManualFrameScheduler::new(), IdentityNameMapper, RecordingSink { applied: applied.clone() });
    merger.borrow_mut().set_on_poke_error(move |e| errors_handle.borrow_mut().push(e.to_string()));

    merger.borrow_mut().poke_start("poke-a", "3");
    merger.borrow_mut().poke_end("poke-a", "4", false);

    merger.borrow_mut().poke_start("poke-b", "5");
    merger.borrow_mut().poke_end("poke-b", "6", false);

    merger.borrow_mut().scheduler_mut().tick();

    assert!(applied.borrow().is_empty(), "the view must remain at its pre-flush contents");
    assert_eq!(errors.borrow().len(), 1);
    assert!(errors.borrow()[0].contains("cookie gap"));
}
