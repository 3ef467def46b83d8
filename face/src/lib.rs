//! Face embedding model interface.
//!
//! A [`FaceModel`] turns an encoded image into a fixed-length embedding.
//! Detection, alignment and the network itself live behind the trait;
//! this crate only fixes the contract and its error kinds.
//!
//! [`RemoteModel`] is the bundled implementation: it forwards images to an
//! HTTP embedding server and decodes the returned vector.

mod error;
mod model;
mod remote;

pub use error::FaceError;
pub use model::FaceModel;
pub use remote::{RemoteModel, RemoteModelConfig};
