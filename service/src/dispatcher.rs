//! Bounded inference pool.
//!
//! Every job runs on tokio's blocking thread pool, but at most `workers`
//! jobs run at once: a job first takes a permit from a fair semaphore,
//! so excess submissions wait in FIFO order instead of spawning more
//! threads. Each submission is bounded by a timeout that covers both the
//! wait for a permit and the job itself.
//!
//! Jobs are pure functions of their input plus read-only access to the
//! [`FaceStore`]; all store mutation happens outside the pool.

use std::sync::Arc;
use std::time::Duration;

use faceid_face::FaceModel;
use faceid_facestore::{FaceMatch, FaceStore};
use faceid_vecstore::l2_normalize;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::ServiceError;

/// Result of a verification that reached the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Match(FaceMatch),
    NoMatch,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Maximum number of jobs running at once.
    pub workers: usize,
    /// Upper bound on a submission, queueing included.
    pub timeout: Duration,
    /// L2-normalize embeddings returned by the model.
    pub normalize: bool,
}

pub struct InferenceDispatcher {
    model: Arc<dyn FaceModel>,
    store: Arc<FaceStore>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cfg: DispatcherConfig,
}

impl InferenceDispatcher {
    /// Panics if `cfg.workers` is 0.
    pub fn new(model: Arc<dyn FaceModel>, store: Arc<FaceStore>, cfg: DispatcherConfig) -> Self {
        assert!(cfg.workers > 0, "service: dispatcher needs at least one worker");
        Self {
            model,
            store,
            permits: Arc::new(Semaphore::new(cfg.workers)),
            tracker: TaskTracker::new(),
            cfg,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Extract an embedding from `image` and verify it against the store.
    pub async fn submit(&self, image: Vec<u8>, threshold: f32) -> Result<Verdict, ServiceError> {
        let model = Arc::clone(&self.model);
        let store = Arc::clone(&self.store);
        let normalize = self.cfg.normalize;

        self.run(move || {
            let embedding = extract(model.as_ref(), &image, normalize)?;
            Ok(match store.verify(&embedding, threshold)? {
                Some(m) => Verdict::Match(m),
                None => Verdict::NoMatch,
            })
        })
        .await
    }

    /// Extract an embedding from `image` without touching the store.
    pub async fn embed(&self, image: Vec<u8>) -> Result<Vec<f32>, ServiceError> {
        let model = Arc::clone(&self.model);
        let normalize = self.cfg.normalize;
        self.run(move || extract(model.as_ref(), &image, normalize))
            .await
    }

    /// Run `job` on the pool.
    ///
    /// A job that times out is not cancelled: it keeps its permit until it
    /// finishes, and only the caller stops waiting. A job that panics
    /// surfaces as [`ServiceError::Worker`]; the pool keeps serving.
    pub async fn run<T, F>(&self, job: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(ServiceError::Closed);
        }

        let permits = Arc::clone(&self.permits);
        let tracker = self.tracker.clone();
        let dispatch = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| ServiceError::Closed)?;
            let handle = tracker.spawn_blocking(move || {
                let _permit = permit;
                job()
            });
            handle
                .await
                .map_err(|e| ServiceError::Worker(e.to_string()))?
        };

        match tokio::time::timeout(self.cfg.timeout, dispatch).await {
            Ok(result) => {
                if let Err(e) = &result {
                    debug!(error = %e, "dispatcher: job failed");
                }
                result
            }
            Err(_) => {
                warn!(timeout = ?self.cfg.timeout, "dispatcher: submission timed out");
                Err(ServiceError::Timeout(self.cfg.timeout))
            }
        }
    }

    /// Stop accepting work and wait up to `drain` for running jobs.
    /// Submissions still waiting for a permit fail with
    /// [`ServiceError::Closed`]. Returns whether every job finished.
    pub async fn shutdown(&self, drain: Duration) -> bool {
        self.permits.close();
        self.tracker.close();

        let running = self.tracker.len();
        match tokio::time::timeout(drain, self.tracker.wait()).await {
            Ok(()) => {
                info!(drained = running, "dispatcher: shut down");
                true
            }
            Err(_) => {
                warn!(
                    still_running = self.tracker.len(),
                    "dispatcher: drain timed out, abandoning running jobs"
                );
                false
            }
        }
    }
}

fn extract(model: &dyn FaceModel, image: &[u8], normalize: bool) -> Result<Vec<f32>, ServiceError> {
    let mut embedding = model.embed(image)?;
    if normalize {
        l2_normalize(&mut embedding);
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use faceid_face::FaceError;
    use faceid_kv::MemoryStore;

    /// Reads the first byte of the image as the hot axis.
    struct AxisModel {
        dim: usize,
        delay: Duration,
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl AxisModel {
        fn new(dim: usize, delay: Duration) -> Self {
            Self {
                dim,
                delay,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl FaceModel for AxisModel {
        fn embed(&self, image: &[u8]) -> Result<Vec<f32>, FaceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if image.first() == Some(&0xFD) {
                std::thread::sleep(Duration::from_millis(300));
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            match image.first() {
                None => Err(FaceError::InvalidImage("empty".into())),
                Some(&0xFF) => Err(FaceError::NoFaceDetected),
                Some(&0xFE) => panic!("model crashed"),
                Some(&b) => {
                    let mut v = vec![0.0; self.dim];
                    v[b as usize % self.dim] = 2.0;
                    Ok(v)
                }
            }
        }

        fn dimension(&self) -> usize {
            self.dim
        }
    }

    fn setup(workers: usize, delay: Duration, timeout: Duration) -> (Arc<AxisModel>, InferenceDispatcher) {
        let model = Arc::new(AxisModel::new(4, delay));
        let store = Arc::new(FaceStore::new(4, Box::new(MemoryStore::new())).unwrap());
        store.enroll("zero", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        let dispatcher = InferenceDispatcher::new(
            model.clone(),
            store,
            DispatcherConfig {
                workers,
                timeout,
                normalize: true,
            },
        );
        (model, dispatcher)
    }

    #[tokio::test]
    async fn submit_matches_and_misses() {
        let (_, d) = setup(2, Duration::ZERO, Duration::from_secs(5));

        match d.submit(vec![0], 0.5).await.unwrap() {
            Verdict::Match(m) => {
                assert_eq!(m.identity, "zero");
                // Normalized before search.
                assert!((m.score - 1.0).abs() < 1e-6);
            }
            Verdict::NoMatch => panic!("expected a match"),
        }
        assert_eq!(d.submit(vec![1], 0.5).await.unwrap(), Verdict::NoMatch);
    }

    #[tokio::test]
    async fn embedding_error_is_typed_and_pool_survives() {
        let (_, d) = setup(1, Duration::ZERO, Duration::from_secs(5));

        let err = d.submit(vec![0xFF], 0.5).await.unwrap_err();
        assert!(matches!(err, ServiceError::Embedding(FaceError::NoFaceDetected)));

        let err = d.submit(vec![0xFE], 0.5).await.unwrap_err();
        assert!(matches!(err, ServiceError::Worker(_)));

        // The single worker is still there.
        assert!(matches!(d.submit(vec![0], 0.5).await, Ok(Verdict::Match(_))));
    }

    #[tokio::test]
    async fn submissions_beyond_capacity_queue() {
        let (model, d) = setup(2, Duration::from_millis(30), Duration::from_secs(10));
        let d = Arc::new(d);

        let jobs: Vec<_> = (0..8u8)
            .map(|i| {
                let d = Arc::clone(&d);
                tokio::spawn(async move { d.embed(vec![i]).await })
            })
            .collect();
        for job in jobs {
            assert!(job.await.unwrap().is_ok());
        }
        assert!(model.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn slow_job_times_out() {
        let (_, d) = setup(1, Duration::from_millis(300), Duration::from_millis(20));
        let err = d.embed(vec![0]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));
    }

    #[tokio::test]
    async fn queued_submission_times_out_and_frees_its_turn() {
        let (model, d) = setup(1, Duration::ZERO, Duration::from_millis(100));
        let d = Arc::new(d);

        // Holds the only permit for 300ms.
        let slow = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.embed(vec![0xFD]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = d.embed(vec![0]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));
        assert!(matches!(slow.await.unwrap(), Err(ServiceError::Timeout(_))));
        // The queued job never reached the model.
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);

        // Once the slow job finishes the pool serves again.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(d.embed(vec![1]).await.is_ok());
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert!(model.peak.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn shutdown_drains_and_rejects_new_work() {
        let (_, d) = setup(1, Duration::from_millis(50), Duration::from_secs(5));
        let d = Arc::new(d);

        let running = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.embed(vec![0]).await })
        };
        // Let the job reach the pool.
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(d.shutdown(Duration::from_secs(5)).await);
        assert!(running.await.unwrap().is_ok());
        assert!(matches!(d.embed(vec![0]).await, Err(ServiceError::Closed)));
    }
}
