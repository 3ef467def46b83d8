//! Redb-based persistent key-value store implementation.
//!
//! Every write runs in its own redb write transaction with the default
//! (immediate) durability, so a call returning `Ok` has been fsynced.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::{KVError, KVOp, KVResult, KVStore};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

fn storage<E: std::fmt::Display>(e: E) -> KVError {
    KVError::Storage(e.to_string())
}

/// A persistent key-value store backed by redb.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a redb store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> KVResult<Self> {
        let db = Database::create(path).map_err(storage)?;

        // Opening the table in a write transaction creates it.
        let tx = db.begin_write().map_err(storage)?;
        {
            let _ = tx.open_table(TABLE).map_err(storage)?;
        }
        tx.commit().map_err(storage)?;

        Ok(Self { db })
    }
}

impl KVStore for RedbStore {
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;
        let value = table.get(key).map_err(storage)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> KVResult<()> {
        self.write_batch(&[KVOp::put(key, value.to_vec())])
    }

    fn delete(&self, key: &str) -> KVResult<()> {
        self.write_batch(&[KVOp::delete(key)])
    }

    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;

        // Keys iterate in order, so the prefix is one contiguous run.
        let mut out = Vec::new();
        for entry in table.range(prefix..).map_err(storage)? {
            let (key, value) = entry.map_err(storage)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), value.value().to_vec()));
        }
        Ok(out)
    }

    fn write_batch(&self, ops: &[KVOp]) -> KVResult<()> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage)?;
            for op in ops {
                match op {
                    KVOp::Put { key, value } => {
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(storage)?;
                    }
                    KVOp::Delete { key } => {
                        table.remove(key.as_str()).map_err(storage)?;
                    }
                }
            }
        }
        // Dropping an uncommitted transaction aborts it, so an error above
        // leaves the store untouched.
        tx.commit().map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_redb_basic() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store.set("key1", b"value1").unwrap();
        assert_eq!(store.get("key1").unwrap(), Some(b"value1".to_vec()));

        store.delete("key1").unwrap();
        assert_eq!(store.get("key1").unwrap(), None);
    }

    #[test]
    fn test_redb_scan() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store.set("prefix:a", b"1").unwrap();
        store.set("prefix:b", b"2").unwrap();
        store.set("other:c", b"3").unwrap();

        store.set("prefiy", b"4").unwrap();

        let keys: Vec<String> = store
            .scan("prefix:")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["prefix:a", "prefix:b"]);
    }

    #[test]
    fn test_redb_write_batch_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.set("old", b"x").unwrap();
            store
                .write_batch(&[KVOp::put("new", b"y".to_vec()), KVOp::delete("old")])
                .unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("new").unwrap(), Some(b"y".to_vec()));
        assert_eq!(store.get("old").unwrap(), None);
    }
}
