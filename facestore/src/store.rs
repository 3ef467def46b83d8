use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use faceid_kv::KVStore;
use faceid_vecstore::{load_flat, save_flat, FlatIndex, VecError};

use crate::error::StoreError;
use crate::table::IdentityTable;

/// The best enrolled identity for a query.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
    pub identity: String,
    /// Raw inner product between the query and the enrolled embedding.
    pub score: f32,
}

struct StoreInner {
    index: FlatIndex,
    table: IdentityTable,
}

/// FaceStore binds a positional [`FlatIndex`] to a durable [`IdentityTable`].
///
/// Invariant: `index.len() == table.len()`, and for every record
/// `(slot, identity)` the vector at `slot` is the one enrolled under
/// `identity`. Every mutation holds the write lock across both structures;
/// `verify` holds the read lock, so it never observes a half-applied
/// mutation.
///
/// The table is written through on every mutation. The index is kept in
/// memory and snapshotted by [`save`](Self::save); on open, a snapshot whose
/// generation does not match the table is discarded and the index is rebuilt
/// from the embeddings stored in the table.
pub struct FaceStore {
    inner: RwLock<StoreInner>,
    index_path: Option<PathBuf>,
    saved_generation: AtomicU64,
    // Concurrent saves share the temporary file.
    save_lock: Mutex<()>,
}

impl FaceStore {
    /// Open a store with no snapshot file. The index is rebuilt from `kv`.
    /// Panics if `dim` is 0.
    pub fn new(dim: usize, kv: Box<dyn KVStore>) -> Result<Self, StoreError> {
        let table = IdentityTable::open(kv)?;
        let index = rebuild_index(dim, &table)?;
        let generation = table.generation();
        Ok(Self::from_parts(index, table, None, generation))
    }

    /// Open a store whose index is snapshotted to `index_path`.
    pub fn open(
        dim: usize,
        index_path: impl Into<PathBuf>,
        kv: Box<dyn KVStore>,
    ) -> Result<Self, StoreError> {
        let index_path = index_path.into();
        let table = IdentityTable::open(kv)?;

        // Until the first save, a rebuilt index has no matching snapshot.
        let mut saved = u64::MAX;
        let index = match read_snapshot(&index_path) {
            Ok(Some(snap)) if snap.index.dim() != dim => {
                return Err(StoreError::DimensionMismatch {
                    got: snap.index.dim(),
                    want: dim,
                });
            }
            Ok(Some(snap))
                if snap.generation == table.generation() && snap.index.len() == table.len() =>
            {
                info!(
                    path = %index_path.display(),
                    count = snap.index.len(),
                    generation = snap.generation,
                    "facestore: loaded index snapshot"
                );
                saved = snap.generation;
                snap.index
            }
            Ok(Some(snap)) => {
                warn!(
                    snapshot_generation = snap.generation,
                    table_generation = table.generation(),
                    "facestore: stale index snapshot, rebuilding from table"
                );
                rebuild_index(dim, &table)?
            }
            Ok(None) => rebuild_index(dim, &table)?,
            Err(e) => {
                warn!(error = %e, "facestore: unreadable index snapshot, rebuilding from table");
                rebuild_index(dim, &table)?
            }
        };

        let store = Self::from_parts(index, table, Some(index_path), saved);
        store.check_consistency()?;
        Ok(store)
    }

    fn from_parts(
        index: FlatIndex,
        table: IdentityTable,
        index_path: Option<PathBuf>,
        saved: u64,
    ) -> Self {
        Self {
            inner: RwLock::new(StoreInner { index, table }),
            index_path,
            saved_generation: AtomicU64::new(saved),
            save_lock: Mutex::new(()),
        }
    }

    /// Embedding dimension accepted by the store.
    pub fn dim(&self) -> usize {
        self.inner.read().index.dim()
    }

    /// Number of enrolled identities.
    pub fn len(&self) -> usize {
        self.inner.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.inner.read().table.contains(identity)
    }

    /// Enrolled identities in slot order.
    pub fn identities(&self) -> Vec<String> {
        self.inner
            .read()
            .table
            .records()
            .into_iter()
            .map(|r| r.identity)
            .collect()
    }

    /// Enroll `embedding` under `identity`.
    pub fn enroll(&self, identity: &str, embedding: &[f32]) -> Result<(), StoreError> {
        if identity.is_empty() {
            return Err(StoreError::InvalidIdentity("empty identity".into()));
        }

        let mut inner = self.inner.write();
        if embedding.len() != inner.index.dim() {
            return Err(StoreError::DimensionMismatch {
                got: embedding.len(),
                want: inner.index.dim(),
            });
        }
        if inner.table.contains(identity) {
            return Err(StoreError::DuplicateIdentity(identity.to_string()));
        }

        let slot = inner.commit_enroll(identity, embedding)?;
        info!(identity, slot, "facestore: enrolled");
        Ok(())
    }

    /// Return the best-scoring identity if its score is strictly greater
    /// than `threshold`. An empty store never matches.
    pub fn verify(&self, query: &[f32], threshold: f32) -> Result<Option<FaceMatch>, StoreError> {
        let inner = self.inner.read();

        // Only the best hit matters; ties resolve to the lowest slot.
        let hits = inner.index.search(query, 1)?;
        let Some(best) = hits.first() else {
            return Ok(None);
        };
        debug!(slot = best.slot, score = best.score, threshold, "facestore: best hit");
        if best.score <= threshold {
            return Ok(None);
        }

        match inner.table.lookup_by_slot(best.slot) {
            Some(identity) => Ok(Some(FaceMatch {
                identity: identity.to_string(),
                score: best.score,
            })),
            None => {
                error!(
                    slot = best.slot,
                    count = inner.index.len(),
                    records = inner.table.len(),
                    "facestore: index slot has no identity record"
                );
                Err(StoreError::CorruptState(format!(
                    "slot {} has no identity record",
                    best.slot
                )))
            }
        }
    }

    /// Remove `identity` and compact the index.
    pub fn remove(&self, identity: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let slot = inner
            .table
            .lookup_by_identity(identity)
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;
        if slot >= inner.index.len() {
            error!(identity, slot, count = inner.index.len(), "facestore: record past end of index");
            return Err(StoreError::CorruptState(format!(
                "{identity:?} bound to slot {slot} past end of index"
            )));
        }

        // The table batch (delete + renumber) commits first; if it fails
        // nothing has changed. The index compaction below then mirrors it.
        inner.table.remove_and_shift(identity)?;
        inner.index.remove_at(slot).map_err(|e| {
            error!(identity, slot, error = %e, "facestore: index removal failed after table commit");
            StoreError::CorruptState(e.to_string())
        })?;

        info!(identity, slot, "facestore: removed");
        Ok(())
    }

    /// Remove every identity.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.table.clear()?;
        inner.index.reset();
        info!("facestore: cleared");
        Ok(())
    }

    /// Write the index snapshot. The snapshot is written to a temporary
    /// file, synced, then renamed over the live one, so a crash leaves
    /// either the old or the new snapshot. A store opened without a
    /// snapshot path has nothing to save.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.index_path else {
            return Ok(());
        };
        let _saving = self.save_lock.lock();

        // Copy under the read lock; write without holding it.
        let (index, generation) = {
            let inner = self.inner.read();
            (inner.index.clone(), inner.table.generation())
        };

        write_snapshot(path, &index, generation)?;
        self.saved_generation.store(generation, Ordering::SeqCst);
        info!(
            path = %path.display(),
            count = index.len(),
            generation,
            "facestore: saved index snapshot"
        );
        Ok(())
    }

    /// Save only if the store changed since the last save. Returns whether
    /// a snapshot was written.
    pub fn save_if_dirty(&self) -> Result<bool, StoreError> {
        if self.index_path.is_none() {
            return Ok(false);
        }
        let generation = self.inner.read().table.generation();
        if self.saved_generation.load(Ordering::SeqCst) == generation {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Verify the store invariant against the stored embeddings.
    pub fn check_consistency(&self) -> Result<(), StoreError> {
        let inner = self.inner.read();
        let count = inner.index.len();
        if count != inner.table.len() || !inner.table.is_dense() {
            return Err(StoreError::CorruptState(format!(
                "index holds {count} vectors, table holds {} records",
                inner.table.len()
            )));
        }

        let stored = inner.table.embeddings()?;
        for record in inner.table.records() {
            let expected = stored.get(&record.identity).ok_or_else(|| {
                StoreError::CorruptState(format!("no embedding stored for {:?}", record.identity))
            })?;
            if inner.index.vector_at(record.slot) != Some(expected.as_slice()) {
                return Err(StoreError::CorruptState(format!(
                    "slot {} does not hold the embedding of {:?}",
                    record.slot, record.identity
                )));
            }
        }
        Ok(())
    }
}

impl StoreInner {
    /// Add to the index, then bind in the table. If the table rejects the
    /// record, the just-added vector is removed again.
    fn commit_enroll(&mut self, identity: &str, embedding: &[f32]) -> Result<usize, StoreError> {
        let slot = self.index.add(embedding)?;
        if let Err(e) = self.table.insert(slot, identity, embedding) {
            warn!(identity, slot, error = %e, "facestore: rolling back index add");
            self.index.remove_at(slot).map_err(|re| {
                error!(slot, error = %re, "facestore: rollback failed");
                StoreError::CorruptState(re.to_string())
            })?;
            return Err(e);
        }
        Ok(slot)
    }
}

fn rebuild_index(dim: usize, table: &IdentityTable) -> Result<FlatIndex, StoreError> {
    if !table.is_dense() {
        return Err(StoreError::CorruptState(
            "identity table has unbound slots".into(),
        ));
    }

    let mut stored = table.embeddings()?;
    let mut index = FlatIndex::new(dim);
    for record in table.records() {
        let v = stored.remove(&record.identity).ok_or_else(|| {
            StoreError::CorruptState(format!("no embedding stored for {:?}", record.identity))
        })?;
        let slot = index.add(&v)?;
        debug_assert_eq!(slot, record.slot);
    }
    if !table.is_empty() {
        info!(count = index.len(), "facestore: rebuilt index from table");
    }
    Ok(index)
}

fn read_snapshot(path: &Path) -> Result<Option<faceid_vecstore::Snapshot>, VecError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VecError::Io(e.to_string())),
    };
    load_flat(&mut file).map(Some)
}

fn write_snapshot(path: &Path, index: &FlatIndex, generation: u64) -> Result<(), StoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = File::create(&tmp)?;
        save_flat(index, generation, &mut file)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use faceid_kv::{KVError, KVOp, KVResult, MemoryStore};

    fn unit(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    fn mem_store(dim: usize) -> FaceStore {
        FaceStore::new(dim, Box::new(MemoryStore::new())).unwrap()
    }

    /// Fails every write while `fail` is set.
    struct FlakyStore {
        inner: MemoryStore,
        fail: Arc<AtomicBool>,
    }

    impl KVStore for FlakyStore {
        fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> KVResult<()> {
            self.write_batch(&[KVOp::put(key, value.to_vec())])
        }

        fn delete(&self, key: &str) -> KVResult<()> {
            self.write_batch(&[KVOp::delete(key)])
        }

        fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>> {
            self.inner.scan(prefix)
        }

        fn write_batch(&self, ops: &[KVOp]) -> KVResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(KVError::Storage("injected failure".into()));
            }
            self.inner.write_batch(ops)
        }
    }

    #[test]
    fn enroll_and_verify() {
        let store = mem_store(4);
        store.enroll("alice", &unit(4, 0)).unwrap();
        store.enroll("bob", &unit(4, 1)).unwrap();

        let m = store.verify(&unit(4, 1), 0.5).unwrap().unwrap();
        assert_eq!(m.identity, "bob");
        assert!((m.score - 1.0).abs() < 1e-6);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn verify_empty_store_is_no_match() {
        let store = mem_store(4);
        assert_eq!(store.verify(&unit(4, 0), -1000.0).unwrap(), None);
    }

    #[test]
    fn verify_below_threshold_is_no_match() {
        let store = mem_store(2);
        store.enroll("alice", &[1.0, 0.0]).unwrap();
        assert_eq!(store.verify(&[0.0, 1.0], 0.5).unwrap(), None);
    }

    #[test]
    fn verify_dimension_mismatch() {
        let store = mem_store(4);
        store.enroll("alice", &unit(4, 0)).unwrap();
        assert!(matches!(
            store.verify(&[1.0, 0.0], 0.0),
            Err(StoreError::DimensionMismatch { got: 2, want: 4 })
        ));
    }

    #[test]
    fn threshold_is_strict() {
        let store = mem_store(2);
        store.enroll("alice", &[0.5, 0.0]).unwrap();
        // Score is exactly 0.5.
        let query = [1.0, 0.0];
        assert_eq!(store.verify(&query, 0.5).unwrap(), None);
        assert!(store.verify(&query, 0.5 - 1e-4).unwrap().is_some());
        assert_eq!(store.verify(&query, 0.5 + 1e-4).unwrap(), None);
    }

    #[test]
    fn enroll_dimension_mismatch_leaves_store_untouched() {
        let store = mem_store(4);
        let err = store.enroll("alice", &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { got: 2, want: 4 }));
        assert!(store.is_empty());
    }

    #[test]
    fn non_finite_embedding_is_rejected() {
        let store = mem_store(2);
        let err = store.enroll("alice", &[f32::NAN, 0.0]).unwrap_err();
        assert!(matches!(err, StoreError::NonFinite(0)));
        assert!(store.is_empty());
        assert!(!store.contains("alice"));

        store.enroll("bob", &[1.0, 0.0]).unwrap();
        assert!(matches!(
            store.verify(&[0.0, f32::INFINITY], 0.5),
            Err(StoreError::NonFinite(1))
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn enroll_duplicate_rejected() {
        let store = mem_store(4);
        store.enroll("alice", &unit(4, 0)).unwrap();
        let err = store.enroll("alice", &unit(4, 1)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity(ref id) if id == "alice"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.inner.read().index.len(), 1);
        // The first embedding is still the one bound to alice.
        assert_eq!(
            store.verify(&unit(4, 0), 0.5).unwrap().unwrap().identity,
            "alice"
        );
        assert_eq!(store.verify(&unit(4, 1), 0.5).unwrap(), None);
    }

    #[test]
    fn enroll_empty_identity_rejected() {
        let store = mem_store(2);
        assert!(matches!(
            store.enroll("", &[1.0, 0.0]),
            Err(StoreError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn rollback_when_table_insert_hits_duplicate() {
        let store = mem_store(4);
        store.enroll("alice", &unit(4, 0)).unwrap();

        // Skip the facade's pre-check so the duplicate surfaces at commit.
        let mut inner = store.inner.write();
        let before = inner.index.len();
        let err = inner.commit_enroll("alice", &unit(4, 2)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity(_)));
        assert_eq!(inner.index.len(), before);
        drop(inner);

        store.check_consistency().unwrap();
    }

    #[test]
    fn rollback_when_table_write_fails() {
        let fail = Arc::new(AtomicBool::new(false));
        let kv = FlakyStore {
            inner: MemoryStore::new(),
            fail: Arc::clone(&fail),
        };
        let store = FaceStore::new(4, Box::new(kv)).unwrap();
        store.enroll("alice", &unit(4, 0)).unwrap();

        fail.store(true, Ordering::SeqCst);
        let err = store.enroll("bob", &unit(4, 1)).unwrap_err();
        assert!(matches!(err, StoreError::KV(_)));
        assert_eq!(store.inner.read().index.len(), 1);
        assert!(!store.contains("bob"));

        // Removal fails cleanly as well.
        assert!(store.remove("alice").is_err());
        assert!(store.contains("alice"));

        fail.store(false, Ordering::SeqCst);
        store.check_consistency().unwrap();
        store.enroll("bob", &unit(4, 1)).unwrap();
        store.check_consistency().unwrap();
    }

    #[test]
    fn remove_renumbers_later_identities() {
        let store = mem_store(4);
        store.enroll("A", &unit(4, 0)).unwrap();
        store.enroll("B", &unit(4, 1)).unwrap();
        store.enroll("C", &unit(4, 2)).unwrap();

        store.remove("B").unwrap();

        let m = store.verify(&unit(4, 2), 0.5).unwrap().unwrap();
        assert_eq!(m.identity, "C");
        assert_eq!(store.verify(&unit(4, 1), 0.5).unwrap(), None);
        assert_eq!(store.identities(), vec!["A", "C"]);
        store.check_consistency().unwrap();

        // Enrolling after a removal reuses the compacted tail.
        store.enroll("D", &unit(4, 3)).unwrap();
        assert_eq!(store.verify(&unit(4, 3), 0.5).unwrap().unwrap().identity, "D");
        assert_eq!(store.verify(&unit(4, 2), 0.5).unwrap().unwrap().identity, "C");
        store.check_consistency().unwrap();
    }

    #[test]
    fn remove_missing_is_not_found() {
        let store = mem_store(2);
        assert!(matches!(store.remove("ghost"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn clear_empties_store() {
        let store = mem_store(2);
        store.enroll("a", &[1.0, 0.0]).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.verify(&[1.0, 0.0], 0.0).unwrap(), None);
        store.enroll("a", &[1.0, 0.0]).unwrap();
        store.check_consistency().unwrap();
    }

    #[test]
    fn corrupt_mapping_is_reported_not_hidden() {
        let store = mem_store(2);
        store.enroll("a", &[1.0, 0.0]).unwrap();
        // Simulate a broken mutation: a vector with no identity record.
        store.inner.write().index.add(&[0.0, 1.0]).unwrap();

        assert!(matches!(
            store.verify(&[0.0, 1.0], 0.5),
            Err(StoreError::CorruptState(_))
        ));
        assert!(store.check_consistency().is_err());
    }

    #[test]
    fn save_without_path_is_noop() {
        let store = mem_store(2);
        store.save().unwrap();
        assert!(!store.save_if_dirty().unwrap());
    }
}
