//! Key-value storage for the identity table.
//!
//! [`KVStore`] maps string keys to byte values. [`MemoryStore`] keeps
//! everything in process and is meant for tests; [`RedbStore`] persists to
//! a single redb file. Mutations that must land together go through
//! [`KVStore::write_batch`], which applies all of its operations in one
//! transaction.

pub mod memory;
pub mod redb;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KVError {
    #[error("kv: storage error: {0}")]
    Storage(String),
}

pub type KVResult<T> = Result<T, KVError>;

/// A single operation inside a [`KVStore::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KVOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl KVOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        KVOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KVOp::Delete { key: key.into() }
    }
}

/// String keys, byte values. For persistent implementations every mutating
/// call is durable by the time it returns `Ok`.
pub trait KVStore: Send + Sync {
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> KVResult<()>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> KVResult<()>;

    /// All entries whose key starts with `prefix`, sorted by key.
    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>>;

    /// Apply `ops` in order, atomically: afterwards either every op is
    /// visible or none is.
    fn write_batch(&self, ops: &[KVOp]) -> KVResult<()>;
}

pub use self::memory::MemoryStore;
pub use self::redb::RedbStore;
