use std::collections::HashMap;

use faceid_kv::{KVOp, KVStore};

use crate::error::StoreError;
use crate::keys::{
    decode_u64, decode_vector, encode_u64, encode_vector, slot_key, vec_key, GENERATION_KEY,
    SLOT_PREFIX, VEC_PREFIX,
};

/// A live `(slot, identity)` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub slot: usize,
    pub identity: String,
}

/// Durable mapping from dense index slots to external identities.
///
/// Every mutation is written to the KV store in a single batch (which also
/// bumps the table generation) before the in-memory view is updated, so a
/// failed write leaves the table exactly as it was. Lookups are served from
/// the in-memory view.
///
/// Each record also keeps the enrolled embedding, which lets the owner
/// rebuild its vector index from the table alone.
pub struct IdentityTable {
    kv: Box<dyn KVStore>,
    by_slot: Vec<Option<String>>,
    by_identity: HashMap<String, usize>,
    generation: u64,
}

impl IdentityTable {
    /// Open a table over `kv`, loading every stored record.
    pub fn open(kv: Box<dyn KVStore>) -> Result<Self, StoreError> {
        let generation = match kv.get(GENERATION_KEY)? {
            Some(b) => decode_u64(&b)
                .ok_or_else(|| StoreError::CorruptState("bad generation value".into()))?,
            None => 0,
        };

        // Slots are dense, so n records occupy exactly 0..n.
        let entries = kv.scan(SLOT_PREFIX)?;
        let count = entries.len();
        let mut by_identity = HashMap::with_capacity(count);
        let mut by_slot: Vec<Option<String>> = vec![None; count];
        for (key, value) in entries {
            let identity = key[SLOT_PREFIX.len()..].to_string();
            let raw = decode_u64(&value).ok_or_else(|| {
                StoreError::CorruptState(format!("bad slot value for {identity:?}"))
            })?;
            if raw >= count as u64 {
                return Err(StoreError::CorruptState(format!(
                    "slot {raw} for {identity:?} out of range ({count} records)"
                )));
            }

            let slot = raw as usize;
            if let Some(other) = &by_slot[slot] {
                return Err(StoreError::CorruptState(format!(
                    "slot {slot} bound to both {other:?} and {identity:?}"
                )));
            }
            by_slot[slot] = Some(identity.clone());
            by_identity.insert(identity, slot);
        }

        Ok(Self {
            kv,
            by_slot,
            by_identity,
            generation,
        })
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    /// Counter bumped by every committed mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True when slots `0..len()` are all bound, with no holes.
    pub fn is_dense(&self) -> bool {
        self.by_slot.len() == self.by_identity.len()
    }

    pub fn lookup_by_slot(&self, slot: usize) -> Option<&str> {
        self.by_slot.get(slot)?.as_deref()
    }

    pub fn lookup_by_identity(&self, identity: &str) -> Option<usize> {
        self.by_identity.get(identity).copied()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.by_identity.contains_key(identity)
    }

    /// Live records in slot order.
    pub fn records(&self) -> Vec<IdentityRecord> {
        self.by_slot
            .iter()
            .enumerate()
            .filter_map(|(slot, id)| {
                id.as_ref().map(|identity| IdentityRecord {
                    slot,
                    identity: identity.clone(),
                })
            })
            .collect()
    }

    /// Read the embedding stored for `identity`.
    pub fn embedding(&self, identity: &str) -> Result<Vec<f32>, StoreError> {
        if !self.contains(identity) {
            return Err(StoreError::NotFound(identity.to_string()));
        }
        let raw = self.kv.get(&vec_key(identity))?.ok_or_else(|| {
            StoreError::CorruptState(format!("no embedding stored for {identity:?}"))
        })?;
        decode_vector(&raw)
            .ok_or_else(|| StoreError::CorruptState(format!("bad embedding for {identity:?}")))
    }

    /// Every stored embedding, keyed by identity.
    pub(crate) fn embeddings(&self) -> Result<HashMap<String, Vec<f32>>, StoreError> {
        let mut out = HashMap::with_capacity(self.len());
        for (key, value) in self.kv.scan(VEC_PREFIX)? {
            let identity = key[VEC_PREFIX.len()..].to_string();
            let v = decode_vector(&value).ok_or_else(|| {
                StoreError::CorruptState(format!("bad embedding for {identity:?}"))
            })?;
            out.insert(identity, v);
        }
        Ok(out)
    }

    /// Bind `identity` to `slot`. Slots are appended densely, so `slot`
    /// must equal the current slot count.
    pub fn insert(
        &mut self,
        slot: usize,
        identity: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        if identity.is_empty() {
            return Err(StoreError::InvalidIdentity("empty identity".into()));
        }
        if self.contains(identity) {
            return Err(StoreError::DuplicateIdentity(identity.to_string()));
        }
        if slot != self.by_slot.len() {
            return Err(StoreError::CorruptState(format!(
                "insert at slot {slot}, next free slot is {}",
                self.by_slot.len()
            )));
        }

        self.commit(vec![
            KVOp::put(slot_key(identity), encode_u64(slot as u64)),
            KVOp::put(vec_key(identity), encode_vector(embedding)),
        ])?;

        self.by_slot.push(Some(identity.to_string()));
        self.by_identity.insert(identity.to_string(), slot);
        Ok(())
    }

    /// Delete the record for `identity`, leaving its slot unbound.
    /// Callers compacting the index follow up with
    /// [`shift_slots_above`](Self::shift_slots_above); prefer
    /// [`remove_and_shift`](Self::remove_and_shift), which does both in
    /// one durable batch.
    pub fn remove(&mut self, identity: &str) -> Result<usize, StoreError> {
        let slot = self
            .lookup_by_identity(identity)
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;
        self.commit(remove_ops(identity))?;
        self.unbind(identity, slot);
        Ok(slot)
    }

    /// Decrement the slot of every record whose slot is greater than
    /// `threshold`. `threshold` itself must already be unbound.
    pub fn shift_slots_above(&mut self, threshold: usize) -> Result<(), StoreError> {
        if threshold >= self.by_slot.len() {
            return Ok(());
        }
        if let Some(identity) = &self.by_slot[threshold] {
            return Err(StoreError::CorruptState(format!(
                "cannot shift over slot {threshold}: still bound to {identity:?}"
            )));
        }
        let ops = self.shift_ops(threshold);
        self.commit(ops)?;
        self.compact(threshold);
        Ok(())
    }

    /// Remove `identity` and renumber every later record, atomically.
    /// Returns the slot the identity occupied.
    pub fn remove_and_shift(&mut self, identity: &str) -> Result<usize, StoreError> {
        let slot = self
            .lookup_by_identity(identity)
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;

        let mut ops = remove_ops(identity);
        ops.extend(self.shift_ops(slot));
        self.commit(ops)?;

        self.unbind(identity, slot);
        self.compact(slot);
        Ok(slot)
    }

    /// Delete every record.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        let ops: Vec<KVOp> = self
            .by_identity
            .keys()
            .flat_map(|identity| remove_ops(identity))
            .collect();
        self.commit(ops)?;
        self.by_slot.clear();
        self.by_identity.clear();
        Ok(())
    }

    fn shift_ops(&self, threshold: usize) -> Vec<KVOp> {
        self.by_slot
            .iter()
            .enumerate()
            .skip(threshold + 1)
            .filter_map(|(slot, id)| {
                id.as_ref()
                    .map(|identity| KVOp::put(slot_key(identity), encode_u64(slot as u64 - 1)))
            })
            .collect()
    }

    fn unbind(&mut self, identity: &str, slot: usize) {
        self.by_identity.remove(identity);
        self.by_slot[slot] = None;
    }

    /// Drop the (unbound) entry at `threshold` and renumber the rest.
    fn compact(&mut self, threshold: usize) {
        self.by_slot.remove(threshold);
        for (slot, id) in self.by_slot.iter().enumerate().skip(threshold) {
            if let Some(identity) = id {
                self.by_identity.insert(identity.clone(), slot);
            }
        }
    }

    fn commit(&mut self, mut ops: Vec<KVOp>) -> Result<(), StoreError> {
        let next = self.generation + 1;
        ops.push(KVOp::put(GENERATION_KEY, encode_u64(next)));
        self.kv.write_batch(&ops)?;
        self.generation = next;
        Ok(())
    }
}

fn remove_ops(identity: &str) -> Vec<KVOp> {
    vec![KVOp::delete(slot_key(identity)), KVOp::delete(vec_key(identity))]
}
