//! KV key layout for the identity table.
//!
//! ```text
//! face:slot:{identity}   → u64 LE slot
//! face:vec:{identity}    → dim x f32 LE embedding
//! face:meta:generation   → u64 LE, bumped by every mutation
//! ```
//!
//! Slot and vector live under separate keys so that renumbering after a
//! removal only rewrites the small slot values.

pub const SLOT_PREFIX: &str = "face:slot:";
pub const VEC_PREFIX: &str = "face:vec:";
pub const GENERATION_KEY: &str = "face:meta:generation";

/// KV key for an identity's slot. Format: "face:slot:{identity}"
pub fn slot_key(identity: &str) -> String {
    format!("{SLOT_PREFIX}{identity}")
}

/// KV key for an identity's embedding. Format: "face:vec:{identity}"
pub fn vec_key(identity: &str) -> String {
    format!("{VEC_PREFIX}{identity}")
}

pub fn encode_u64(v: u64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn decode_u64(b: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(b.try_into().ok()?))
}

pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn decode_vector(b: &[u8]) -> Option<Vec<f32>> {
    if b.len() % 4 != 0 {
        return None;
    }
    Some(
        b.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
