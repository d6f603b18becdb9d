//! The poke merger (spec §4.8).
//!
//! Buffers incoming multi-part change batches ("pokes"), each bounded by a
//! `start`/`end` pair and identified while in flight by a `pokeID`. A
//! completed poke is appended to a buffer and, on the next cooperative
//! [`FrameScheduler`] tick, every buffered poke since the last flush is
//! merged into a single patch and delivered atomically to a [`PatchSink`]
//! (typically a [`crate::view::View`] adapter, via whatever bridges the
//! server's row shape into `Change`s for it). `PokeMerger::new` returns the
//! merger wrapped in `Rc<RefCell<...>>` so the closure it hands to
//! `FrameScheduler::schedule_flush` can hold a `Weak` back to it and
//! actually perform the flush when the scheduler's tick fires.
//!
//! Protocol errors (wrong `pokeID`, a cookie gap at merge time, a rejected
//! patch) clear all buffered and in-progress state and are reported through
//! the `onPokeError` callback (spec §7) rather than propagated — the poke
//! merger itself never retries; that is the embedder's connection layer's
//! decision.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::error::IvmError;
use crate::name_map::NameMapper;
use crate::query::Ast;
use crate::scheduler::FrameScheduler;
use crate::value::Row;

/// One `rowsPatch` operation (spec §6).
#[derive(Debug, Clone)]
pub enum RowPatchOp {
    Put { table_name: String, value: Row },
    Update { table_name: String, id: Row, merge: Option<Row>, constrain: Option<Vec<String>> },
    Del { table_name: String, id: Row },
    Clear,
}

/// One `desiredQueriesPatches`/`gotQueriesPatch` operation (spec §6).
#[derive(Debug, Clone)]
pub enum QueriesPatchOp {
    Put { hash: String, ast: Ast, ttl: Option<u64> },
    Del { hash: String },
    Clear,
}

impl std::fmt::Debug for Ast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ast").field("table", &self.table).field("alias", &self.alias).finish()
    }
}

/// One `clientsPatch` operation (spec §6).
#[derive(Debug, Clone)]
pub enum ClientsPatchOp {
    Put { client_id: String },
    Del { client_id: String },
    Clear,
}

/// A single `pokePart` message (spec §6). `poke_id` must match the poke
/// currently in progress.
#[derive(Default)]
pub struct PokePart {
    pub last_mutation_id_changes: HashMap<String, u64>,
    pub desired_queries_patches: Vec<QueriesPatchOp>,
    pub got_queries_patch: Vec<QueriesPatchOp>,
    pub rows_patch: Vec<RowPatchOp>,
    pub clients_patch: Vec<ClientsPatchOp>,
}

impl PokePart {
    pub fn new() -> Self {
        PokePart::default()
    }

    pub fn with_last_mutation_id_change(mut self, client_id: impl Into<String>, id: u64) -> Self {
        self.last_mutation_id_changes.insert(client_id.into(), id);
        self
    }

    pub fn with_row_patch(mut self, op: RowPatchOp) -> Self {
        self.rows_patch.push(op);
        self
    }
}

/// A fully-buffered poke: everything accumulated between its `start` and a
/// non-cancelled `end`.
#[derive(Default)]
struct BufferedPoke {
    base_cookie: String,
    cookie: String,
    last_mutation_id_changes: HashMap<String, u64>,
    desired_queries_patches: Vec<QueriesPatchOp>,
    got_queries_patch: Vec<QueriesPatchOp>,
    rows_patch: Vec<RowPatchOp>,
    clients_patch: Vec<ClientsPatchOp>,
}

impl BufferedPoke {
    fn absorb(&mut self, part: PokePart) {
        self.last_mutation_id_changes.extend(part.last_mutation_id_changes);
        self.desired_queries_patches.extend(part.desired_queries_patches);
        self.got_queries_patch.extend(part.got_queries_patch);
        self.rows_patch.extend(part.rows_patch);
        self.clients_patch.extend(part.clients_patch);
    }
}

/// The merged, atomically-applied result of one flush (spec §4.8 "Deliver
/// the merged patch atomically to the view adapter").
#[derive(Debug, Default)]
pub struct MergedPatch {
    pub cookie: String,
    pub last_mutation_id_changes: HashMap<String, u64>,
    pub desired_queries_patches: Vec<QueriesPatchOp>,
    pub got_queries_patch: Vec<QueriesPatchOp>,
    pub rows_patch: Vec<RowPatchOp>,
    pub clients_patch: Vec<ClientsPatchOp>,
}

/// The consumer a merged patch is delivered to. Returning `Err` (e.g. the
/// adapter's own cookie accounting disagrees) is a poke protocol error
/// (spec §7): the merger clears its state and reports it, same as a cookie
/// gap.
pub trait PatchSink {
    fn apply_patch(&mut self, patch: MergedPatch) -> Result<(), IvmError>;
}

enum MergeState {
    Idle,
    Receiving { poke_id: String, base_cookie: String, accum: BufferedPoke },
}

/// Merges multi-part poke batches into single atomic applies (spec §4.8).
///
/// Held behind `Rc<RefCell<...>>` rather than owned directly: the scheduled
/// flush closure handed to [`FrameScheduler::schedule_flush`] needs a way
/// back into the merger that created it, so `new` builds the merger with
/// `Rc::new_cyclic` and keeps a `Weak` to itself for exactly that closure.
pub struct PokeMerger<S: FrameScheduler, M: NameMapper, K: PatchSink> {
    state: MergeState,
    buffered: Vec<BufferedPoke>,
    last_applied_cookie: Option<String>,
    scheduler: S,
    name_mapper: M,
    sink: K,
    on_error: Option<Box<dyn FnMut(IvmError)>>,
    self_ref: Weak<RefCell<PokeMerger<S, M, K>>>,
}

impl<S: FrameScheduler, M: NameMapper, K: PatchSink> PokeMerger<S, M, K> {
    pub fn new(scheduler: S, name_mapper: M, sink: K) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(PokeMerger {
                state: MergeState::Idle,
                buffered: Vec::new(),
                last_applied_cookie: None,
                scheduler,
                name_mapper,
                sink,
                on_error: None,
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Direct access to the underlying scheduler, for embedders (and tests)
    /// that need to drive its `tick()` themselves rather than relying on
    /// whatever event loop owns it elsewhere.
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn set_on_poke_error(&mut self, callback: impl FnMut(IvmError) + 'static) {
        self.on_error = Some(Box::new(callback));
    }

    fn report_error(&mut self, err: IvmError) {
        warn!(?err, "poke protocol error; clearing buffered and in-progress state");
        self.state = MergeState::Idle;
        self.buffered.clear();
        if let Some(cb) = &mut self.on_error {
            cb(err);
        }
    }

    /// `idle -> receiving` (spec §4.8).
    pub fn poke_start(&mut self, poke_id: impl Into<String>, base_cookie: impl Into<String>) {
        if matches!(self.state, MergeState::Receiving { .. }) {
            self.report_error(IvmError::PokeIdMismatch {
                in_progress: "<none: start while already receiving>".into(),
                received: "<start>".into(),
            });
        }
        self.state = MergeState::Receiving {
            poke_id: poke_id.into(),
            base_cookie: base_cookie.into(),
            accum: BufferedPoke::default(),
        };
    }

    /// Absorb a `pokePart`. Returns the new last-mutation-id for the local
    /// client, if this part changed it, for synchronous upstream tracking
    /// (spec §4.8 "per-part ... returns that value").
    pub fn poke_part(&mut self, poke_id: &str, local_client_id: &str, part: PokePart) -> Option<u64> {
        let MergeState::Receiving { poke_id: current, accum, .. } = &mut self.state else {
            self.report_error(IvmError::PokeIdMismatch {
                in_progress: "<none>".into(),
                received: poke_id.into(),
            });
            return None;
        };
        if current != poke_id {
            let in_progress = current.clone();
            self.report_error(IvmError::PokeIdMismatch { in_progress, received: poke_id.into() });
            return None;
        }
        let local_change = part.last_mutation_id_changes.get(local_client_id).copied();
        accum.absorb(part);
        local_change
    }

    /// `receiving -> idle`, buffering the completed poke unless `cancel`.
    pub fn poke_end(&mut self, poke_id: &str, cookie: impl Into<String>, cancel: bool) {
        let (current_id, base_cookie, accum) = match std::mem::replace(&mut self.state, MergeState::Idle) {
            MergeState::Idle => {
                self.report_error(IvmError::PokeIdMismatch { in_progress: "<none>".into(), received: poke_id.into() });
                return;
            }
            MergeState::Receiving { poke_id, base_cookie, accum } => (poke_id, base_cookie, accum),
        };
        if current_id != poke_id {
            self.report_error(IvmError::PokeIdMismatch { in_progress: current_id, received: poke_id.into() });
            return;
        }
        if cancel {
            debug!(poke_id, "poke cancelled, discarding");
            return;
        }

        let mut buffered = accum;
        buffered.base_cookie = base_cookie;
        buffered.cookie = cookie.into();

        let was_empty = self.buffered.is_empty();
        self.buffered.push(buffered);
        if was_empty {
            // Schedule exactly once per otherwise-empty buffer; pokes that
            // arrive before the scheduled tick fires just extend the same
            // buffer (spec §9 "batches multiple pokes arriving in the same
            // macro-tick").
            self.schedule_flush();
        }
    }

    fn schedule_flush(&mut self) {
        let weak = self.self_ref.clone();
        self.scheduler.schedule_flush(Box::new(move || {
            if let Some(merger) = weak.upgrade() {
                merger.borrow_mut().flush();
            }
        }));
    }

    /// Merge and apply everything buffered since the last flush. Invoked
    /// automatically when the embedder's scheduler fires the closure set up
    /// by `schedule_flush` — see
    /// [`crate::scheduler::ManualFrameScheduler::tick`]. Also callable
    /// directly, e.g. by an embedder whose scheduler has no `tick` of its
    /// own and just calls back synchronously.
    pub fn flush(&mut self) {
        if self.buffered.is_empty() {
            return;
        }
        let pokes = std::mem::take(&mut self.buffered);

        if let Some(prev) = &self.last_applied_cookie {
            if pokes[0].base_cookie != *prev {
                self.report_error(IvmError::CookieGap { expected: prev.clone(), actual: pokes[0].base_cookie.clone() });
                return;
            }
        }
        for pair in pokes.windows(2) {
            if pair[1].base_cookie != pair[0].cookie {
                self.report_error(IvmError::CookieGap {
                    expected: pair[0].cookie.clone(),
                    actual: pair[1].base_cookie.clone(),
                });
                return;
            }
        }

        let final_cookie = pokes.last().map(|p| p.cookie.clone()).unwrap_or_default();
        let merged = self.merge(pokes);

        match self.sink.apply_patch(merged) {
            Ok(()) => {
                self.last_applied_cookie = Some(final_cookie);
            }
            Err(err) => {
                self.report_error(IvmError::PatchRejected(err.to_string()));
            }
        }
    }

    /// Concatenate every buffered poke's operations in order and translate
    /// server table/column names to client ones. `clear` resets only the
    /// rows-patch accumulator built up so far in this merge, not the whole
    /// buffered sequence — an op appended after a `clear` still lands in
    /// the output (spec §9, Open Question resolution).
    fn merge(&self, pokes: Vec<BufferedPoke>) -> MergedPatch {
        let mut merged = MergedPatch { cookie: pokes.last().map(|p| p.cookie.clone()).unwrap_or_default(), ..Default::default() };

        for poke in pokes {
            merged.last_mutation_id_changes.extend(poke.last_mutation_id_changes);
            merged.desired_queries_patches.extend(poke.desired_queries_patches);
            merged.got_queries_patch.extend(poke.got_queries_patch);
            merged.clients_patch.extend(poke.clients_patch);
            for op in poke.rows_patch {
                match op {
                    RowPatchOp::Clear => merged.rows_patch.clear(),
                    other => merged.rows_patch.push(self.translate_row_op(other)),
                }
            }
        }
        merged
    }

    fn translate_row_op(&self, op: RowPatchOp) -> RowPatchOp {
        match op {
            RowPatchOp::Put { table_name, value } => RowPatchOp::Put {
                table_name: self.name_mapper.map_table(&table_name),
                value: translate_row(&self.name_mapper, &table_name, value),
            },
            RowPatchOp::Update { table_name, id, merge, constrain } => RowPatchOp::Update {
                merge: merge.map(|m| translate_row(&self.name_mapper, &table_name, m)),
                constrain: constrain.map(|cols| {
                    cols.iter().map(|c| self.name_mapper.map_column(&table_name, c)).collect()
                }),
                id: translate_row(&self.name_mapper, &table_name, id),
                table_name: self.name_mapper.map_table(&table_name),
            },
            RowPatchOp::Del { table_name, id } => RowPatchOp::Del {
                id: translate_row(&self.name_mapper, &table_name, id),
                table_name: self.name_mapper.map_table(&table_name),
            },
            RowPatchOp::Clear => RowPatchOp::Clear,
        }
    }
}

fn translate_row(mapper: &impl NameMapper, server_table: &str, row: Row) -> Row {
    let mut out = Row::new();
    for (col, value) in row.iter() {
        out.set(mapper.map_column(server_table, col), value.clone());
    }
    out
}
