use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::filter::IndexValue;

/// A type that can be stored and retrieved through [`crate::Store`].
///
/// `kind()` names the JSONL shard (`<kind>.jsonl`) and SQLite table the
/// record lives in; it must be stable across releases since it is persisted
/// on disk. `index_fields()` lists the subset of fields `Store::query` can
/// filter on — everything else is opaque JSON as far as the store cares.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn kind() -> &'static str;

    fn id(&self) -> String;

    fn index_fields(&self) -> Vec<(&'static str, IndexValue)> {
        Vec::new()
    }
}
