//! [`FaceModel`] implementation that delegates inference to an HTTP
//! embedding server.
//!
//! The server receives the raw image as the request body and answers with
//! a JSON array of floats, either flat (`[0.1, ...]`) or wrapped in a
//! batch of one (`[[0.1, ...]]`). HTTP 422 means no usable face was found.

use std::time::Duration;

use serde::Deserialize;

use crate::error::FaceError;
use crate::model::FaceModel;

const DEFAULT_DIM: usize = 512;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`RemoteModel`].
#[derive(Debug, Clone, Default)]
pub struct RemoteModelConfig {
    /// Endpoint receiving `POST <image bytes>`.
    pub url: String,
    /// Sent verbatim as the `Authorization` header when non-empty.
    pub token: String,
    /// Expected embedding dimension (default: 512).
    pub dim: usize,
    /// Per-request timeout (default: 10s).
    pub timeout: Option<Duration>,
}

/// Blocking HTTP client for a remote embedding server.
pub struct RemoteModel {
    agent: ureq::Agent,
    url: String,
    token: String,
    dim: usize,
}

impl RemoteModel {
    pub fn new(cfg: RemoteModelConfig) -> Result<Self, FaceError> {
        if cfg.url.is_empty() {
            return Err(FaceError::Model("remote model url is empty".into()));
        }
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(cfg.timeout.unwrap_or(DEFAULT_TIMEOUT)))
            .build();
        Ok(Self {
            agent: config.into(),
            url: cfg.url,
            token: cfg.token,
            dim: if cfg.dim == 0 { DEFAULT_DIM } else { cfg.dim },
        })
    }
}

impl FaceModel for RemoteModel {
    fn embed(&self, image: &[u8]) -> Result<Vec<f32>, FaceError> {
        if image.is_empty() {
            return Err(FaceError::InvalidImage("empty image".into()));
        }

        let mut req = self
            .agent
            .post(self.url.as_str())
            .header("Content-Type", "application/octet-stream");
        if !self.token.is_empty() {
            req = req.header("Authorization", self.token.as_str());
        }

        let mut resp = req.send(image).map_err(map_http_error)?;
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| FaceError::Model(e.to_string()))?;
        parse_embedding(&body)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

fn map_http_error(err: ureq::Error) -> FaceError {
    match err {
        ureq::Error::StatusCode(422) => FaceError::NoFaceDetected,
        ureq::Error::StatusCode(400) => {
            FaceError::InvalidImage("rejected by embedding server".into())
        }
        other => FaceError::Model(other.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingBody {
    Flat(Vec<f32>),
    Batch(Vec<Vec<f32>>),
}

/// Decodes an embedding server response body.
pub(crate) fn parse_embedding(body: &str) -> Result<Vec<f32>, FaceError> {
    let parsed: EmbeddingBody = serde_json::from_str(body)
        .map_err(|e| FaceError::Model(format!("invalid embedding response: {e}")))?;
    let vector = match parsed {
        EmbeddingBody::Flat(v) => v,
        EmbeddingBody::Batch(rows) => rows.into_iter().next().unwrap_or_default(),
    };
    if vector.is_empty() {
        return Err(FaceError::NoFaceDetected);
    }
    Ok(vector)
}
