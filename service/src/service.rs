use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use faceid_face::{FaceModel, RemoteModel};
use faceid_facestore::{FaceStore, StoreError};
use faceid_kv::RedbStore;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ModelKind, ServiceConfig};
use crate::dispatcher::{DispatcherConfig, InferenceDispatcher, Verdict};
use crate::error::ServiceError;

/// Everything a [`VerificationService`] is built from.
pub struct ServiceContext {
    pub config: ServiceConfig,
    pub store: Arc<FaceStore>,
    pub model: Arc<dyn FaceModel>,
}

impl ServiceContext {
    pub fn new(config: ServiceConfig, store: Arc<FaceStore>, model: Arc<dyn FaceModel>) -> Self {
        Self { config, store, model }
    }

    /// Open the on-disk store and the configured model.
    pub fn open(config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(StoreError::from)?;

        let kv = RedbStore::open(config.table_path()).map_err(StoreError::from)?;
        let store = FaceStore::open(config.dim, config.index_path(), Box::new(kv))?;
        info!(
            identities = store.len(),
            index = %config.index_path().display(),
            table = %config.table_path().display(),
            "service: store opened"
        );

        let model: Arc<dyn FaceModel> = match config.model.kind {
            ModelKind::Remote => Arc::new(
                RemoteModel::new(config.remote_model())
                    .map_err(|e| ServiceError::Config(e.to_string()))?,
            ),
        };
        if model.dimension() != config.dim {
            return Err(ServiceError::Config(format!(
                "model produces {}-d embeddings, store expects {}",
                model.dimension(),
                config.dim
            )));
        }

        Ok(Self::new(config, Arc::new(store), model))
    }
}

/// Request-facing orchestration over the store and the inference pool.
///
/// Verification runs entirely on the pool. Enrollment extracts its
/// embedding on the pool too, but the store mutation (like removal) runs
/// on a plain blocking task so a full pool never delays a write that
/// already has its embedding.
pub struct VerificationService {
    config: ServiceConfig,
    store: Arc<FaceStore>,
    dispatcher: InferenceDispatcher,
    ready: AtomicBool,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl VerificationService {
    /// Build the service and start the periodic flush. Must be called
    /// inside a tokio runtime.
    pub fn start(ctx: ServiceContext) -> Self {
        let ServiceContext { config, store, model } = ctx;
        let dispatcher = InferenceDispatcher::new(
            model,
            Arc::clone(&store),
            DispatcherConfig {
                workers: config.workers,
                timeout: config.timeout(),
                normalize: config.normalize,
            },
        );

        let cancel = CancellationToken::new();
        let flusher = config
            .flush_interval()
            .map(|every| spawn_flusher(Arc::clone(&store), every, cancel.clone()));

        info!(
            workers = config.workers,
            threshold = config.threshold,
            identities = store.len(),
            "service: started"
        );

        Self {
            config,
            store,
            dispatcher,
            ready: AtomicBool::new(true),
            cancel,
            flusher: Mutex::new(flusher),
        }
    }

    /// False once shutdown has begun.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Enroll the face in `image` under `identity`.
    pub async fn enroll(&self, identity: &str, image: Vec<u8>) -> Result<(), ServiceError> {
        self.ensure_ready()?;
        if identity.is_empty() {
            return Err(ServiceError::InvalidInput("identity is required".into()));
        }
        // Skip inference for an identity that is already taken.
        if self.store.contains(identity) {
            return Err(StoreError::DuplicateIdentity(identity.to_string()).into());
        }

        let embedding = self.dispatcher.embed(image).await?;
        let store = Arc::clone(&self.store);
        let identity = identity.to_string();
        blocking(move || store.enroll(&identity, &embedding)).await
    }

    /// Verify the face in `image`. `threshold` falls back to the configured
    /// default.
    pub async fn verify(&self, image: Vec<u8>, threshold: Option<f32>) -> Result<Verdict, ServiceError> {
        self.ensure_ready()?;
        let threshold = threshold.unwrap_or(self.config.threshold);
        if !threshold.is_finite() {
            return Err(ServiceError::InvalidInput(format!("bad threshold {threshold}")));
        }

        let verdict = self.dispatcher.submit(image, threshold).await;
        match &verdict {
            Ok(Verdict::Match(m)) => debug!(identity = %m.identity, score = m.score, "service: verified"),
            Ok(Verdict::NoMatch) => debug!(threshold, "service: no match"),
            Err(ServiceError::Store(StoreError::CorruptState(msg))) => {
                error!(error = %msg, "service: store consistency fault during verify")
            }
            Err(_) => {}
        }
        verdict
    }

    pub async fn remove(&self, identity: &str) -> Result<(), ServiceError> {
        self.ensure_ready()?;
        let store = Arc::clone(&self.store);
        let identity = identity.to_string();
        blocking(move || store.remove(&identity)).await
    }

    /// Extract the embedding for `image` without touching the store.
    pub async fn represent(&self, image: Vec<u8>) -> Result<Vec<f32>, ServiceError> {
        self.ensure_ready()?;
        self.dispatcher.embed(image).await
    }

    pub fn count(&self) -> usize {
        self.store.len()
    }

    /// Remove every enrolled identity.
    pub async fn clear(&self) -> Result<(), ServiceError> {
        self.ensure_ready()?;
        let store = Arc::clone(&self.store);
        blocking(move || store.clear()).await
    }

    /// Snapshot the index now.
    pub async fn save(&self) -> Result<(), ServiceError> {
        let store = Arc::clone(&self.store);
        blocking(move || store.save()).await
    }

    /// Stop taking requests, drain the pool, then flush the store.
    /// Calling it again only repeats the flush.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.ready.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        let flusher = self.flusher.lock().take();
        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                warn!(error = %e, "service: flush task ended abnormally");
            }
        }

        if !self.dispatcher.shutdown(self.config.drain_timeout()).await {
            warn!("service: flushing with inference still running");
        }

        self.save().await?;
        info!(identities = self.store.len(), "service: shut down");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), ServiceError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ServiceError::Closed)
        }
    }
}

/// Run a store call off the async threads.
async fn blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::Worker(e.to_string()))?
        .map_err(ServiceError::from)
}

fn spawn_flusher(store: Arc<FaceStore>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        // The first tick completes immediately.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    let store = Arc::clone(&store);
                    match tokio::task::spawn_blocking(move || store.save_if_dirty()).await {
                        Ok(Ok(true)) => debug!("service: periodic flush"),
                        Ok(Ok(false)) => {}
                        Ok(Err(e)) => warn!(error = %e, "service: periodic flush failed"),
                        Err(e) => warn!(error = %e, "service: periodic flush panicked"),
                    }
                }
            }
        }
    })
}
