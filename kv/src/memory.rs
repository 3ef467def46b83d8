//! In-memory key-value store implementation for testing.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{KVOp, KVResult, KVStore};

/// An in-memory key-value store backed by a BTreeMap.
///
/// Clones share the same underlying map, which lets a test keep a handle
/// to the data after handing the store to a consumer.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KVStore for MemoryStore {
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> KVResult<()> {
        self.data.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> KVResult<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>> {
        let data = self.data.lock();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: &[KVOp]) -> KVResult<()> {
        let mut data = self.data.lock();
        for op in ops {
            match op {
                KVOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                KVOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }
}
