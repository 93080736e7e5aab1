//! Embedded persistence: SQLite index over append-only JSONL shards.
//!
//! Each record `kind` gets its own JSONL shard (`<root>/<kind>.jsonl`) that is
//! the durable source of truth — every `put`/`delete` appends one line and
//! never rewrites history. SQLite holds a queryable cache of the latest state
//! per id, rebuilt from the JSONL shard with [`Store::rebuild_indexes`] at
//! startup. Losing the SQLite file is not data loss; losing a JSONL shard is.

mod error;
mod filter;
mod record;
mod store;

pub use error::StoreError;
pub use filter::{Filter, FilterOp, IndexValue};
pub use record::Record;
pub use store::Store;
