//! Face verification service.
//!
//! - [`InferenceDispatcher`]: fixed-size pool running model inference
//!   (and the read-only store lookup that follows it) off the async threads,
//!   with per-submission timeouts and a draining shutdown.
//! - [`VerificationService`]: the operations exposed to transports
//!   (`enroll`, `verify`, `remove`, `represent`, ...) plus periodic and
//!   shutdown flushing of the store.
//! - [`ServiceConfig`]: YAML configuration.
//!
//! A service is built from an explicit [`ServiceContext`]; nothing here is
//! process-global.

mod config;
mod dispatcher;
mod error;
mod service;

pub use config::{ModelConfig, ModelKind, ServiceConfig};
pub use dispatcher::{DispatcherConfig, InferenceDispatcher, Verdict};
pub use error::ServiceError;
pub use service::{ServiceContext, VerificationService};
