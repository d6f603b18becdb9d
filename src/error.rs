//! Error types for viewflow.
//!
//! All errors that can occur within the engine are represented by
//! [`IvmError`]. Errors are propagated via `Result<T, IvmError>` throughout
//! the codebase.
//!
//! # Error Classification
//!
//! Errors are classified into categories that determine how the engine
//! recovers (§7 of the specification this crate implements):
//! - **Invariant violation** — duplicate add, missing remove, an edit that
//!   changes a primary key or join correlation, a singular view receiving a
//!   second row, a stream drained twice, a storage scan finding an
//!   unexpected key. The current push must be aborted; the view that
//!   observed the error is no longer usable and must be destroyed.
//! - **Poke protocol error** — a `part`/`end` for the wrong poke id, a
//!   cookie gap at merge time, or the view adapter rejecting a merged
//!   patch. All buffered and in-progress poke state is cleared and the
//!   error is reported to the embedder; the engine itself never retries.
//! - **Overlay mismatch** — a child-push overlay failed to apply during a
//!   downstream fetch issued from the same push (the child was not found
//!   at the expected sort position). This indicates an operator bug and is
//!   always an abort.
//!
//! Filter evaluation errors (e.g. a type mismatch that cannot be coerced)
//! are deliberately **not** represented here: per spec they never
//! propagate as exceptions. Operators that hit one log at `tracing::warn!`
//! and treat the row as non-matching.
//!
//! There is no retry policy in this crate — §7 is explicit that "the
//! engine itself performs no retry"; that decision belongs to the
//! embedder's connection layer.

use std::fmt;

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum IvmError {
    // ── Invariant violations — abort the current push ────────────────────
    /// `Source::push(Add)` for a primary key that already exists.
    #[error("duplicate add for primary key {0}")]
    DuplicateAdd(String),

    /// `Source::push(Remove)`/`Edit` for a primary key that does not exist.
    #[error("missing row for primary key {0}")]
    MissingRow(String),

    /// An edit attempted to change a primary-key column.
    #[error("edit changed primary key: {0}")]
    PrimaryKeyMutated(String),

    /// An edit attempted to change a column participating in a downstream
    /// join correlation without going through the source's edit-splitting
    /// path.
    #[error("edit changed join correlation column: {0}")]
    CorrelationColumnMutated(String),

    /// A singular view received a second `add` while already populated.
    #[error("singular view received a second row")]
    SingularViewOverflow,

    /// A relationship stream was drained (or abandoned) more than once.
    #[error("relationship stream drained twice: {0}")]
    StreamDrainedTwice(String),

    /// Storage scan encountered a key shape it did not expect.
    #[error("storage scan found unexpected key: {0}")]
    UnexpectedStorageKey(String),

    /// A primary key tuple did not match the source's declared key arity.
    #[error("primary key arity mismatch: expected {expected}, got {actual}")]
    PrimaryKeyArity { expected: usize, actual: usize },

    /// A row value exceeded a configured JSON depth/size limit.
    #[error("JSON value exceeds configured limit: {0}")]
    JsonLimitExceeded(String),

    // ── Poke protocol errors — clear state, report, never retried ────────
    /// A `pokePart`/`pokeEnd` arrived for a poke id other than the one
    /// currently in progress.
    #[error("poke id mismatch: in progress {in_progress}, received {received}")]
    PokeIdMismatch { in_progress: String, received: String },

    /// Two buffered pokes did not chain (`baseCookie` != previous `cookie`).
    #[error("cookie gap: expected base cookie {expected}, got {actual}")]
    CookieGap { expected: String, actual: String },

    /// The view adapter rejected a merged patch (e.g. its own cookie
    /// accounting disagreed).
    #[error("view adapter rejected merged patch: {0}")]
    PatchRejected(String),

    // ── Overlay errors — operator bug, always an abort ───────────────────
    /// A child-push overlay could not be located at the expected position
    /// during a downstream fetch issued from the same push.
    #[error("overlay mismatch: {0}")]
    OverlayMismatch(String),

    // ── Internal ──────────────────────────────────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl IvmError {
    /// Whether this error must abort the push/view that produced it (as
    /// opposed to being reported and recovered from at the poke-merger
    /// boundary).
    pub fn is_abort(&self) -> bool {
        !matches!(
            self,
            IvmError::PokeIdMismatch { .. } | IvmError::CookieGap { .. } | IvmError::PatchRejected(_)
        )
    }

    /// Whether this is a poke-protocol error (clears merger state, invokes
    /// `onPokeError`, never aborts the whole engine).
    pub fn is_poke_protocol_error(&self) -> bool {
        matches!(
            self,
            IvmError::PokeIdMismatch { .. } | IvmError::CookieGap { .. } | IvmError::PatchRejected(_)
        )
    }

    /// Whether this indicates an operator bug (overlay protocol violated)
    /// rather than a misuse of the public API by the embedder.
    pub fn is_operator_bug(&self) -> bool {
        matches!(self, IvmError::OverlayMismatch(_) | IvmError::InternalError(_))
    }
}

/// Render a primary-key tuple for inclusion in error messages.
pub fn fmt_pk(values: &[impl fmt::Display]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}
