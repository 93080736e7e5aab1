use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::filter::Filter;
use crate::record::Record;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Op {
    Put,
    Delete,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    op: Op,
    id: String,
    ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Opens one SQLite index (`<root>/index.db`) plus one append-only JSONL
/// shard per record kind (`<root>/<kind>.jsonl`). The JSONL shards are the
/// durable source of truth; the SQLite tables are a rebuildable cache.
pub struct Store {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io { path: root.display().to_string(), source })?;

        let db_path = root.join("index.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );
            CREATE TABLE IF NOT EXISTS field_index (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                field TEXT NOT NULL,
                value_text TEXT NOT NULL,
                value_num REAL
            );
            CREATE INDEX IF NOT EXISTS field_index_lookup ON field_index (kind, field);",
        )?;

        debug!(root = %root.display(), "Store::open: called");
        Ok(Self { root, conn: Mutex::new(conn) })
    }

    fn shard_path<T: Record>(&self) -> PathBuf {
        self.root.join(format!("{}.jsonl", T::kind()))
    }

    fn append_envelope<T: Record>(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let path = self.shard_path::<T>();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::Io { path: path.display().to_string(), source })?;

        file.lock_exclusive().map_err(|e| StoreError::Lock {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let line = serde_json::to_string(envelope).map_err(|source| StoreError::Serde { kind: T::kind(), source })?;
        let write_result = writeln!(file, "{line}").map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        });

        let _ = file.unlock();
        write_result
    }

    /// Append a new snapshot. The JSONL shard is the durable write; the
    /// SQLite row is best-effort and repairable via [`Self::rebuild_indexes`].
    pub fn put<T: Record>(&self, record: &T) -> Result<(), StoreError> {
        let id = record.id();
        let data = serde_json::to_value(record).map_err(|source| StoreError::Serde { kind: T::kind(), source })?;

        self.append_envelope::<T>(&Envelope { op: Op::Put, id: id.clone(), ts: Utc::now(), data: Some(data.clone()) })?;

        let conn = self.conn.lock().expect("store connection poisoned");
        upsert_record(&conn, T::kind(), &id, &data)?;
        reindex_fields(&conn, T::kind(), &id, &record.index_fields())?;
        debug!(kind = T::kind(), id = %id, "Store::put: called");
        Ok(())
    }

    /// Append a tombstone and mark the cached row deleted. Deleted records
    /// are excluded from `get`/`query` but remain in the JSONL history.
    pub fn delete<T: Record>(&self, id: &str) -> Result<(), StoreError> {
        self.append_envelope::<T>(&Envelope { op: Op::Delete, id: id.to_string(), ts: Utc::now(), data: None })?;

        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE records SET deleted = 1 WHERE kind = ?1 AND id = ?2",
            params![T::kind(), id],
        )?;
        conn.execute("DELETE FROM field_index WHERE kind = ?1 AND id = ?2", params![T::kind(), id])?;
        debug!(kind = T::kind(), id, "Store::delete: called");
        Ok(())
    }

    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>, StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt =
            conn.prepare("SELECT data FROM records WHERE kind = ?1 AND id = ?2 AND deleted = 0")?;
        let mut rows = stmt.query(params![T::kind(), id])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let value: T =
                    serde_json::from_str(&raw).map_err(|source| StoreError::Serde { kind: T::kind(), source })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every non-deleted record of kind `T`, optionally narrowed by
    /// ANDed `filters` evaluated against `Record::index_fields`.
    pub fn query<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>, StoreError> {
        let conn = self.conn.lock().expect("store connection poisoned");

        let candidate_ids: Option<HashSet<String>> = if filters.is_empty() {
            None
        } else {
            let mut ids: Option<HashSet<String>> = None;
            for filter in filters {
                let mut stmt = conn.prepare(
                    "SELECT id, value_text, value_num FROM field_index WHERE kind = ?1 AND field = ?2",
                )?;
                let mut rows = stmt.query(params![T::kind(), filter.field])?;
                let mut matched = HashSet::new();
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let value_text: String = row.get(1)?;
                    let value_num: Option<f64> = row.get(2)?;
                    let candidate = if value_num.is_some() {
                        crate::filter::IndexValue::Int(value_num.unwrap() as i64)
                    } else {
                        crate::filter::IndexValue::Text(value_text)
                    };
                    if filter.matches(&candidate) {
                        matched.insert(id);
                    }
                }
                ids = Some(match ids {
                    Some(existing) => existing.intersection(&matched).cloned().collect(),
                    None => matched,
                });
            }
            ids
        };

        let mut stmt = conn.prepare("SELECT id, data FROM records WHERE kind = ?1 AND deleted = 0")?;
        let mut rows = stmt.query(params![T::kind()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            if let Some(ref allowed) = candidate_ids {
                if !allowed.contains(&id) {
                    continue;
                }
            }
            let raw: String = row.get(1)?;
            let value: T =
                serde_json::from_str(&raw).map_err(|source| StoreError::Serde { kind: T::kind(), source })?;
            out.push(value);
        }
        Ok(out)
    }

    /// Replay the JSONL shard for `T` from scratch into SQLite, discarding
    /// whatever cached rows existed. Safe to call at startup even if the
    /// SQLite file is missing, corrupt, or stale relative to the shard.
    pub fn rebuild_indexes<T: Record>(&self) -> Result<(), StoreError> {
        let path = self.shard_path::<T>();
        let mut latest: HashMap<String, Option<Value>> = HashMap::new();

        if path.exists() {
            let file = File::open(&path).map_err(|source| StoreError::Io { path: path.display().to_string(), source })?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|source| StoreError::Io { path: path.display().to_string(), source })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Envelope>(&line) {
                    Ok(envelope) => {
                        match envelope.op {
                            Op::Put => {
                                latest.insert(envelope.id, envelope.data);
                            }
                            Op::Delete => {
                                latest.insert(envelope.id, None);
                            }
                        }
                    }
                    Err(e) => warn!(path = %path.display(), line = lineno, error = %e, "rebuild_indexes: skipping malformed record"),
                }
            }
        }

        let conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM records WHERE kind = ?1", params![T::kind()])?;
        tx.execute("DELETE FROM field_index WHERE kind = ?1", params![T::kind()])?;

        for (id, data) in &latest {
            match data {
                Some(value) => {
                    upsert_record(&tx, T::kind(), id, value)?;
                    if let Ok(record) = serde_json::from_value::<T>(value.clone()) {
                        reindex_fields(&tx, T::kind(), id, &record.index_fields())?;
                    }
                }
                None => {
                    tx.execute(
                        "INSERT OR REPLACE INTO records (kind, id, deleted, data) VALUES (?1, ?2, 1, '{}')",
                        params![T::kind(), id],
                    )?;
                }
            }
        }
        tx.commit()?;
        debug!(kind = T::kind(), count = latest.len(), "Store::rebuild_indexes: called");
        Ok(())
    }
}

fn upsert_record(conn: &Connection, kind: &'static str, id: &str, data: &Value) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO records (kind, id, deleted, data) VALUES (?1, ?2, 0, ?3)
         ON CONFLICT(kind, id) DO UPDATE SET deleted = 0, data = excluded.data",
        params![kind, id, data.to_string()],
    )?;
    Ok(())
}

fn reindex_fields(
    conn: &Connection,
    kind: &'static str,
    id: &str,
    fields: &[(&'static str, crate::filter::IndexValue)],
) -> Result<(), StoreError> {
    conn.execute("DELETE FROM field_index WHERE kind = ?1 AND id = ?2", params![kind, id])?;
    for (field, value) in fields {
        conn.execute(
            "INSERT INTO field_index (kind, id, field, value_text, value_num) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![kind, id, field, value.as_text(), value.as_num()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, FilterOp, IndexValue};
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        name: String,
        count: i64,
    }

    impl Record for Widget {
        fn kind() -> &'static str {
            "widget"
        }
        fn id(&self) -> String {
            self.id.clone()
        }
        fn index_fields(&self) -> Vec<(&'static str, IndexValue)> {
            vec![("name", IndexValue::Text(self.name.clone())), ("count", IndexValue::Int(self.count))]
        }
    }

    #[test]
    fn put_then_get_roundtrips() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let w = Widget { id: "w1".into(), name: "bolt".into(), count: 3 };
        store.put(&w).unwrap();
        assert_eq!(store.get::<Widget>("w1").unwrap(), Some(w));
    }

    #[test]
    fn delete_hides_from_get_and_query() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.put(&Widget { id: "w1".into(), name: "bolt".into(), count: 3 }).unwrap();
        store.delete::<Widget>("w1").unwrap();
        assert_eq!(store.get::<Widget>("w1").unwrap(), None);
        assert!(store.query::<Widget>(&[]).unwrap().is_empty());
    }

    #[test]
    fn query_filters_by_indexed_field() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.put(&Widget { id: "w1".into(), name: "bolt".into(), count: 3 }).unwrap();
        store.put(&Widget { id: "w2".into(), name: "nut".into(), count: 7 }).unwrap();

        let results = store
            .query::<Widget>(&[Filter::new("count", FilterOp::Gte, IndexValue::Int(5))])
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "w2");
    }

    #[test]
    fn rebuild_indexes_replays_shard_into_fresh_sqlite() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.put(&Widget { id: "w1".into(), name: "bolt".into(), count: 3 }).unwrap();
            store.put(&Widget { id: "w2".into(), name: "nut".into(), count: 7 }).unwrap();
            store.delete::<Widget>("w2").unwrap();
        }

        // Simulate a stale/missing SQLite cache: reopen and rebuild.
        fs::remove_file(dir.path().join("index.db")).unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.rebuild_indexes::<Widget>().unwrap();

        assert_eq!(store.get::<Widget>("w1").unwrap().unwrap().count, 3);
        assert_eq!(store.get::<Widget>("w2").unwrap(), None);
    }

    #[test]
    fn rebuild_indexes_on_empty_shard_is_a_noop() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.rebuild_indexes::<Widget>().unwrap();
        assert!(store.query::<Widget>(&[]).unwrap().is_empty());
    }
}
