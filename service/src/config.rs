//! Service configuration.
//!
//! Loaded from YAML; every field has a default so an empty file is valid.
//!
//! ```yaml
//! listen: 127.0.0.1:8000
//! dim: 512
//! threshold: 0.75
//! workers: 4
//! data_dir: /var/lib/faceid
//! model:
//!   kind: remote
//!   url: http://127.0.0.1:5000/represent
//! tokens: [secret]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use faceid_face::RemoteModelConfig;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Transport listen address.
    pub listen: String,

    /// Embedding dimension of the model and the store.
    pub dim: usize,

    /// Default similarity threshold. A match requires a strictly greater
    /// score.
    pub threshold: f32,

    /// Fixed size of the inference pool.
    pub workers: usize,

    /// Upper bound on one submission, queueing included.
    pub timeout_ms: u64,

    /// How long shutdown waits for in-flight inference.
    pub drain_timeout_ms: u64,

    /// L2-normalize model output before it reaches the store.
    pub normalize: bool,

    /// Directory holding the index snapshot and the identity table.
    pub data_dir: PathBuf,
    pub index_file: String,
    pub table_file: String,

    /// Periodic snapshot interval. 0 disables.
    pub flush_interval_secs: u64,

    pub model: ModelConfig,

    /// Accepted bearer tokens. Empty disables auth.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8000".into(),
            dim: 512,
            threshold: 0.75,
            workers: 4,
            timeout_ms: 10_000,
            drain_timeout_ms: 5_000,
            normalize: true,
            data_dir: PathBuf::from("."),
            index_file: "face_db.index".into(),
            table_file: "face_db.redb".into(),
            flush_interval_secs: 60,
            model: ModelConfig::default(),
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Remote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub kind: ModelKind,

    /// Embedding endpoint for the remote model.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Authorization header sent to the model server.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,

    /// Per-request timeout. 0 uses the client default.
    pub timeout_ms: u64,
}

impl ServiceConfig {
    /// Read a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self, ServiceError> {
        // An empty document deserializes to unit, not to an empty map.
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self =
            serde_yaml::from_str(data).map_err(|e| ServiceError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.dim == 0 {
            return Err(ServiceError::Config("dim must be positive".into()));
        }
        if self.workers == 0 {
            return Err(ServiceError::Config("workers must be positive".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ServiceError::Config("timeout_ms must be positive".into()));
        }
        if !self.threshold.is_finite() {
            return Err(ServiceError::Config("threshold must be finite".into()));
        }
        if self.index_file.is_empty() || self.table_file.is_empty() {
            return Err(ServiceError::Config("storage file names must be set".into()));
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.index_file)
    }

    pub fn table_path(&self) -> PathBuf {
        self.data_dir.join(&self.table_file)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_secs > 0).then(|| Duration::from_secs(self.flush_interval_secs))
    }

    /// Client settings for [`RemoteModel`](faceid_face::RemoteModel).
    pub fn remote_model(&self) -> RemoteModelConfig {
        RemoteModelConfig {
            url: self.model.url.clone(),
            token: self.model.token.clone(),
            dim: self.dim,
            timeout: (self.model.timeout_ms > 0)
                .then(|| Duration::from_millis(self.model.timeout_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg = ServiceConfig::from_yaml("").unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:8000");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.dim, 512);
        assert_eq!(cfg.index_path(), PathBuf::from("./face_db.index"));
        assert!(cfg.tokens.is_empty());
    }

    #[test]
    fn partial_yaml_overrides() {
        let cfg = ServiceConfig::from_yaml(
            "workers: 2\nthreshold: 0.5\ndata_dir: /tmp/faces\nmodel:\n  url: http://m/represent\n  timeout_ms: 1500\n",
        )
        .unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.threshold, 0.5);
        assert_eq!(cfg.table_path(), PathBuf::from("/tmp/faces/face_db.redb"));
        assert_eq!(cfg.model.kind, ModelKind::Remote);

        let remote = cfg.remote_model();
        assert_eq!(remote.url, "http://m/represent");
        assert_eq!(remote.dim, 512);
        assert_eq!(remote.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(ServiceConfig::from_yaml("workers: 0").is_err());
    }

    #[test]
    fn unknown_model_kind_rejected() {
        assert!(ServiceConfig::from_yaml("model:\n  kind: onnx\n").is_err());
    }

    #[test]
    fn flush_interval_zero_disables() {
        let cfg = ServiceConfig::from_yaml("flush_interval_secs: 0").unwrap();
        assert_eq!(cfg.flush_interval(), None);
    }
}
