//! The scheduler (spec section 4.7): enqueues jobs, enforces per-URL
//! at-most-once active, dispatches to a bounded worker pool, translates
//! parser events into store updates and UI events, honors cancellation,
//! transitions terminal states, persists history.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventName};
use crate::extractor::{DownloadEvent, ExtractorClient, is_instagram_host};
use crate::job_store::JobStore;
use crate::models::{DownloadOptions, Job, JobFile, JobProgress, JobStatus, normalize_url};
use crate::rate_limiter::{self, PerEndpointLimiter};

/// Default worker pool size; configurable up to `MAX_WORKERS` (spec section
/// 4.7).
pub const DEFAULT_WORKERS: usize = 3;
pub const MAX_WORKERS: usize = 16;

/// Per-job cancellation registry: written on worker start and terminal
/// transition, read on `cancel` (spec section 4.7/9).
type CancelRegistry = Arc<Mutex<HashMap<uuid::Uuid, CancellationToken>>>;

#[derive(Clone)]
pub struct DownloadManager {
    store: JobStore,
    bus: EventBus,
    extractor: Arc<ExtractorClient>,
    limiter: Arc<PerEndpointLimiter>,
    out_dir: Arc<String>,
    aria2_path: Arc<Option<String>>,
    cancel_registry: CancelRegistry,
    submit_job: mpsc::Sender<uuid::Uuid>,
    root_token: CancellationToken,
    semaphore: Arc<Semaphore>,
    /// Serializes `enqueue`'s check-then-insert so two concurrent calls for
    /// the same URL cannot both observe "no active job" (spec section 8,
    /// property 1: at-most-one-active-per-URL).
    enqueue_lock: Arc<Mutex<()>>,
}

impl DownloadManager {
    #[must_use]
    pub fn new(
        store: JobStore,
        bus: EventBus,
        extractor: ExtractorClient,
        out_dir: String,
        aria2_path: Option<String>,
        worker_count: usize,
    ) -> (Self, mpsc::Receiver<uuid::Uuid>) {
        let worker_count = worker_count.clamp(1, MAX_WORKERS);
        let (submit_job, recv_job) = mpsc::channel(256);
        let manager = Self {
            store,
            bus,
            extractor: Arc::new(extractor),
            limiter: Arc::new(PerEndpointLimiter::new()),
            out_dir: Arc::new(out_dir),
            aria2_path: Arc::new(aria2_path),
            cancel_registry: Arc::new(Mutex::new(HashMap::new())),
            submit_job,
            root_token: CancellationToken::new(),
            semaphore: Arc::new(Semaphore::new(worker_count)),
            enqueue_lock: Arc::new(Mutex::new(())),
        };
        (manager, recv_job)
    }

    /// Runs the dispatch loop until the manager's root token is cancelled.
    /// Each picked-up job acquires a permit from the bounded worker
    /// semaphore and runs on its own task, so up to `worker_count` jobs
    /// download concurrently.
    pub async fn run(self, mut recv_job: mpsc::Receiver<uuid::Uuid>) {
        loop {
            tokio::select! {
                () = self.root_token.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                maybe_id = recv_job.recv() => {
                    let Some(job_id) = maybe_id else { return };
                    let manager = self.clone();
                    let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                        return;
                    };
                    tokio::spawn(async move {
                        let _permit = permit;
                        manager.run_job(job_id).await;
                    });
                }
            }
        }
    }

    /// Cancels every outstanding per-job token so the runner force-kills
    /// their children (spec section 4.7: "Process kill on manager
    /// shutdown").
    pub async fn shutdown(&self) {
        self.root_token.cancel();
        let registry = self.cancel_registry.lock().await;
        for token in registry.values() {
            token.cancel();
        }
    }

    /// `Enqueue(url, opts)`: idempotent on an already-active URL (spec
    /// section 4.7, invariant 2 of spec section 3/8).
    pub async fn enqueue(&self, url: &str, opts: DownloadOptions) -> Result<Job> {
        let normalized = normalize_url(url);
        if url::Url::parse(&normalized).is_err() {
            return Err(CoreError::InvalidInput(normalized));
        }
        if crate::clipboard::validate_media_url(&normalized).is_none() {
            return Err(CoreError::Unsupported(normalized));
        }

        let guard = self.enqueue_lock.lock().await;

        if let Some(existing) = self.store.exists_active_by_url(&normalized).await? {
            return Ok(existing);
        }

        let job = Job::new(normalized, opts);
        self.store.create(&job).await?;
        drop(guard);
        self.bus.emit(
            EventName::DownloadAdded,
            serde_json::json!({"id": job.id, "url": job.url, "status": job.status}),
        );

        if self.submit_job.send(job.id).await.is_err() {
            tracing::warn!("job queue receiver dropped, job {} left pending", job.id);
        }

        Ok(job)
    }

    /// Re-submits a job id already present in the store onto the dispatch
    /// channel, without touching its row or emitting `DownloadAdded`. Used at
    /// startup to pick back up `pending` jobs a prior process left behind
    /// (spec section 2/4.6).
    pub async fn resubmit(&self, job_id: uuid::Uuid) -> std::result::Result<(), mpsc::error::SendError<uuid::Uuid>> {
        self.submit_job.send(job_id).await
    }

    /// The shared per-endpoint rate limiter, reused by the HTTP surface so
    /// `video_info`/`instagram` buckets are the same instance the download
    /// path sees.
    #[must_use]
    pub fn limiter(&self) -> Arc<PerEndpointLimiter> {
        self.limiter.clone()
    }

    /// Idempotent; a no-op on a terminal (or already-removed) job (spec
    /// section 5: "Cancel(id) is idempotent").
    pub async fn cancel(&self, id: uuid::Uuid) {
        if let Some(token) = self.cancel_registry.lock().await.get(&id) {
            token.cancel();
        }
    }

    async fn run_job(&self, job_id: uuid::Uuid) {
        let Ok(Some(mut job)) = self.store.get_by_id(job_id).await else {
            tracing::warn!("job {job_id} vanished before a worker could pick it up");
            return;
        };
        if job.status.is_terminal() {
            return;
        }

        let token = self.root_token.child_token();
        self.cancel_registry.lock().await.insert(job_id, token.clone());

        let last_progress = Arc::new(std::sync::Mutex::new(job.progress.clone()));
        let outcome = self.drive_job(&mut job, &token, &last_progress).await;
        self.settle(&mut job, outcome, &last_progress).await;

        self.cancel_registry.lock().await.remove(&job_id);
    }

    #[allow(clippy::too_many_lines)]
    async fn drive_job(
        &self,
        job: &mut Job,
        token: &CancellationToken,
        last_progress: &Arc<std::sync::Mutex<JobProgress>>,
    ) -> Result<Option<String>> {
        job.status = JobStatus::Downloading;
        job.started_at = Some(chrono::Utc::now());
        self.store.update(job).await?;

        let bucket = self
            .limiter
            .bucket("download", rate_limiter::DOWNLOAD)
            .await;
        bucket.wait(token).await?;

        if is_instagram_host(&job.url) {
            self.limiter
                .bucket("instagram", rate_limiter::INSTAGRAM)
                .await
                .wait(token)
                .await?;
        }
        if job.options.embed_thumbnail {
            self.limiter
                .bucket("image_download", rate_limiter::IMAGE_DOWNLOAD)
                .await
                .wait(token)
                .await?;
        }

        let store = self.store.clone();
        let bus = self.bus.clone();
        let job_id = job.id;

        let extractor = self.extractor.clone();
        let opts = job.options.clone();
        let url = job.url.clone();
        let out_dir = (*self.out_dir).clone();
        let aria2_path = (*self.aria2_path).clone();

        let on_progress_store = store.clone();
        let on_progress_bus = bus.clone();
        let on_progress_last = last_progress.clone();

        extractor
            .download(
                token,
                &opts,
                &url,
                &out_dir,
                aria2_path.as_deref(),
                move |event| match event {
                    DownloadEvent::Progress { percent, speed, eta } => {
                        // Monotonic non-decreasing within a job (spec section 3,
                        // invariant 3 / section 8, property 2). The clamped
                        // value is folded into `last_progress` synchronously so
                        // `settle` can persist it even on a Failed/Cancelled
                        // outcome, instead of the stale pre-download snapshot.
                        let percent = {
                            let mut guard = match on_progress_last.lock() {
                                Ok(guard) => guard,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            let clamped = percent.max(guard.percent);
                            guard.percent = clamped;
                            guard.speed.clone_from(&speed);
                            guard.eta.clone_from(&eta);
                            clamped
                        };
                        let store = on_progress_store.clone();
                        let bus = on_progress_bus.clone();
                        let speed_owned = speed.clone();
                        let eta_owned = eta.clone();
                        tokio::spawn(async move {
                            let _ = store
                                .update_progress(job_id, percent, speed_owned.as_deref(), eta_owned.as_deref())
                                .await;
                        });
                        bus.emit(
                            EventName::DownloadProgress,
                            serde_json::json!({
                                "id": job_id,
                                "status": "downloading",
                                "percent": percent,
                                "speed": speed,
                                "eta": eta,
                            }),
                        );
                    }
                    DownloadEvent::Merging => {
                        {
                            let mut guard = match on_progress_last.lock() {
                                Ok(guard) => guard,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            guard.percent = guard.percent.max(100.0);
                        }
                        let store = on_progress_store.clone();
                        tokio::spawn(async move {
                            let _ = store
                                .update_status(job_id, JobStatus::Merging, None)
                                .await;
                        });
                        on_progress_bus.emit(
                            EventName::DownloadProgress,
                            serde_json::json!({"id": job_id, "status": "merging", "percent": 100}),
                        );
                    }
                },
                move |line| {
                    bus.emit(
                        EventName::DownloadLog,
                        serde_json::json!({"id": job_id, "line": line}),
                    );
                },
            )
            .await
    }

    async fn settle(&self, job: &mut Job, outcome: Result<Option<String>>, last_progress: &Arc<std::sync::Mutex<JobProgress>>) {
        job.completed_at = Some(chrono::Utc::now());

        let observed = match last_progress.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        job.progress.percent = job.progress.percent.max(observed.percent);
        if observed.speed.is_some() {
            job.progress.speed = observed.speed;
        }
        if observed.eta.is_some() {
            job.progress.eta = observed.eta;
        }

        match outcome {
            Ok(path) => {
                job.status = JobStatus::Completed;
                job.progress.percent = 100.0;
                if let Some(path) = path {
                    let size_bytes = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
                    job.file = JobFile { path: Some(path), size_bytes };
                }
            }
            Err(CoreError::Cancelled) => {
                job.status = JobStatus::Cancelled;
            }
            Err(other) => {
                job.status = JobStatus::Failed;
                job.progress.error_message = Some(sanitize_error(&other.to_string()));
            }
        }
        if let Err(e) = self.store.update(job).await {
            tracing::warn!("failed to persist terminal status for job {}: {e}", job.id);
        }
        self.bus.emit(
            EventName::DownloadProgress,
            serde_json::json!({"id": job.id, "status": job.status, "percent": job.progress.percent}),
        );
    }
}

/// Ensures a stderr-derived error message is valid UTF-8 before it is stored
/// or broadcast (spec section 4.7: "carries the last stderr line, sanitized
/// to UTF-8").
fn sanitize_error(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_control() || *c == '\n').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ExtractorClient;
    use crate::job_store::{self, JobStore};

    async fn test_manager() -> (DownloadManager, mpsc::Receiver<uuid::Uuid>) {
        let pool = job_store::open(":memory:").await.unwrap();
        let store = JobStore::new(pool);
        let bus = EventBus::with_capacity(64);
        let extractor = ExtractorClient::new("true", "true");
        DownloadManager::new(store, bus, extractor, "/tmp".to_string(), None, DEFAULT_WORKERS)
    }

    #[tokio::test]
    async fn enqueue_twice_quickly_returns_same_job_and_emits_once() {
        let (manager, _recv) = test_manager().await;
        let mut rx = manager.bus.subscribe();
        let url = "https://youtube.com/watch?v=abc";

        let a = manager.enqueue(url, DownloadOptions::default()).await.unwrap();
        let b = manager.enqueue(url, DownloadOptions::default()).await.unwrap();
        assert_eq!(a.id, b.id);

        let mut added_events = 0;
        while let Ok(event) = rx.try_recv() {
            if event.name == EventName::DownloadAdded {
                added_events += 1;
            }
        }
        assert_eq!(added_events, 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_unsupported_host() {
        let (manager, _recv) = test_manager().await;
        let result = manager.enqueue("https://example.com/video", DownloadOptions::default()).await;
        assert!(matches!(result, Err(CoreError::Unsupported(_))));
    }

    #[tokio::test]
    async fn cancel_on_terminal_or_unknown_job_is_a_no_op() {
        let (manager, _recv) = test_manager().await;
        manager.cancel(uuid::Uuid::new_v4()).await;
    }

    #[test]
    fn sanitize_error_strips_control_bytes() {
        let cleaned = sanitize_error("bad\u{7}line\nnext");
        assert!(!cleaned.contains('\u{7}'));
        assert!(cleaned.contains('\n'));
    }

    fn write_fake_ytdlp(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("ytdlp.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    /// A job that reaches 42% before its extractor exits non-zero must
    /// persist `percent: 42.0`, not regress to the pre-download default of
    /// `0.0` (spec section 3 invariant 3 / section 8 property 2).
    #[tokio::test]
    async fn settle_persists_observed_progress_on_failure() {
        let pool = job_store::open(":memory:").await.unwrap();
        let store = JobStore::new(pool);
        let bus = EventBus::with_capacity(64);
        let dir = tempfile::tempdir().unwrap();
        let script = write_fake_ytdlp(&dir, "echo '[download]  42.0% of 10.0MiB'\nexit 1\n");
        let extractor = ExtractorClient::new(script.to_str().unwrap(), "true");
        let (manager, _recv) =
            DownloadManager::new(store.clone(), bus, extractor, "/tmp".to_string(), None, DEFAULT_WORKERS);

        let job = manager
            .enqueue("https://youtube.com/watch?v=progress", DownloadOptions::default())
            .await
            .unwrap();
        manager.run_job(job.id).await;

        let persisted = store.get_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Failed);
        assert_eq!(persisted.progress.percent, 42.0);
    }

    /// A completed job must persist its final output path and size (spec
    /// section 3 invariant 5: "`file` is non-empty iff status is
    /// `completed`").
    #[tokio::test]
    async fn settle_populates_file_path_and_size_on_success() {
        let pool = job_store::open(":memory:").await.unwrap();
        let store = JobStore::new(pool);
        let bus = EventBus::with_capacity(64);
        let out_dir = tempfile::tempdir().unwrap();
        let out_file = out_dir.path().join("video.mp4");
        std::fs::write(&out_file, b"hello").unwrap();

        let script_dir = tempfile::tempdir().unwrap();
        let script = write_fake_ytdlp(&script_dir, &format!("echo 'DOWNCORE_FILEPATH:{}'\n", out_file.display()));
        let extractor = ExtractorClient::new(script.to_str().unwrap(), "true");
        let (manager, _recv) = DownloadManager::new(
            store.clone(),
            bus,
            extractor,
            out_dir.path().to_string_lossy().into_owned(),
            None,
            DEFAULT_WORKERS,
        );

        let job = manager
            .enqueue("https://youtube.com/watch?v=file", DownloadOptions::default())
            .await
            .unwrap();
        manager.run_job(job.id).await;

        let persisted = store.get_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Completed);
        assert_eq!(persisted.file.path.as_deref(), Some(out_file.to_str().unwrap()));
        assert_eq!(persisted.file.size_bytes, Some(5));
    }

    /// Two enqueues racing on the same URL must still leave exactly one
    /// active row (spec section 8 property 1: at-most-one-active-per-URL).
    #[tokio::test]
    async fn concurrent_enqueue_of_same_url_creates_one_row() {
        let (manager, _recv) = test_manager().await;
        let manager = Arc::new(manager);
        let url = "https://youtube.com/watch?v=racey";

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.enqueue(url, DownloadOptions::default()).await.unwrap()
            }));
        }
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().id);
        }

        assert_eq!(ids.len(), 1);
    }
}
