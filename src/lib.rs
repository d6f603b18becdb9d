//! viewflow — an embeddable incremental view maintenance (IVM) engine.
//!
//! Given a declarative relational query over in-memory [`Source`] tables —
//! filters, joins, exists-predicates, ordering, limit/offset — this crate
//! materializes and continuously maintains the result as a hierarchical,
//! ordered [`View`] that updates in place as rows are pushed into the
//! sources it draws from.
//!
//! # Architecture
//!
//! The engine is single-threaded and cooperatively scheduled: every
//! `push`, `fetch`, and view apply runs to completion before the next
//! begins. There is no internal concurrency.
//!
//! - [`source`] — the authoritative in-memory table, keyed by primary key,
//!   with one ordered index per distinct connected sort.
//! - [`filter_graph`] and [`filter_expr`] — the push-down predicate
//!   sub-graph (`FanOut`/`FanIn` for OR-composition).
//! - [`join`] — hierarchical parent/child correlation.
//! - [`exists`] — filters parent rows by relationship non-emptiness.
//! - [`take`] and [`skip`] — limit/offset windows.
//! - [`view`] — the materializer turning a node stream plus pushed changes
//!   into a live ordered array (or singular value).
//! - [`poke`] — merges multi-part server change batches into a single
//!   atomic apply per cooperative tick.
//! - [`query`] — builds an operator pipeline from a declarative [`query::Ast`].
//!
//! # Theoretical basis
//!
//! - Gupta & Mumick (1995), "Maintenance of Materialized Views: Problems,
//!   Techniques, and Applications", IEEE Data Engineering Bulletin.
//! - Budiu et al., "DBSP: Automatic Differential View Maintenance for Rich
//!   Query Languages", PVLDB 2023. <https://arxiv.org/abs/2203.16684>

#![allow(dead_code)]

pub mod change;
pub mod error;
pub mod exists;
pub mod filter_expr;
pub mod filter_graph;
pub mod hash;
pub mod input;
pub mod join;
pub mod name_map;
pub mod poke;
pub mod query;
pub mod scheduler;
pub mod skip;
pub mod sort;
pub mod source;
pub mod storage;
pub mod take;
pub mod value;
pub mod view;

pub use change::{Change, ChildChange, Node};
pub use error::IvmError;
pub use source::Source;
pub use value::{PrimaryKey, Row, Value};
pub use view::View;
