//! Embedded storage backend for orc.
//!
//! A single-writer SQLite database (WAL mode) holds everything the engine
//! persists: tasks, plans, phase states, execution states, transcripts,
//! gate decisions, costs, and budgets. Transcripts are indexed with FTS5.
//!
//! Schema versioning is clean-slate: on open the stored version must be
//! absent (fresh database) or equal to the supported version; anything else
//! is a `SchemaMismatch` and the caller decides what to do with the file.

mod costs;
mod schema;
mod store;

pub use costs::{CostByModel, CostBucket, Granularity};
pub use store::{Attachment, Initiative, Store, StoreError, TaskComment, TaskFilter, TranscriptRef};

pub use schema::SCHEMA_VERSION;
