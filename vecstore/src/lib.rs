//! Dense positional embedding index.
//!
//! [`FlatIndex`] stores fixed-dimension float32 vectors addressed by slot
//! and answers exhaustive inner-product queries. Slots are dense: removal
//! compacts the index. [`save_flat`] / [`load_flat`] round-trip the whole
//! index through a compact binary snapshot.

pub mod dot;
pub mod error;
pub mod flat;
pub mod flat_io;

pub use dot::{inner_product, l2_normalize};
pub use error::VecError;
pub use flat::{FlatIndex, Hit};
pub use flat_io::{load as load_flat, save as save_flat, Snapshot};
