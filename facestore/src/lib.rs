//! Face embedding store.
//!
//! [`FaceStore`] keeps a positional [`FlatIndex`](faceid_vecstore::FlatIndex)
//! and an [`IdentityTable`] in lockstep: slot `i` of the index always holds
//! the embedding enrolled under the identity bound to slot `i` in the table.
//!
//! # Storage
//!
//! The table lives in a [`KVStore`](faceid_kv::KVStore) (see [`keys`] for the
//! layout) and is written through on every mutation. The index is held in
//! memory and snapshotted with [`FaceStore::save`]. On open, a snapshot whose
//! generation disagrees with the table is discarded and the index is rebuilt
//! from the embeddings kept in the table.
//!
//! # Example
//!
//! ```ignore
//! let kv = faceid_kv::RedbStore::open("face_db.redb")?;
//! let store = FaceStore::open(512, "face_db.index", Box::new(kv))?;
//! store.enroll("alice", &embedding)?;
//! if let Some(m) = store.verify(&query, 0.75)? {
//!     println!("{} ({:.3})", m.identity, m.score);
//! }
//! store.save()?;
//! ```

mod error;
pub mod keys;
mod store;
mod table;

pub use error::StoreError;
pub use store::{FaceMatch, FaceStore};
pub use table::{IdentityRecord, IdentityTable};
