//! The download scheduler: a fixed worker pool over a bounded job channel.
//!
//! Submission tries an immediate non-blocking send; when the channel is
//! full the job simply stays `pending` in the store and the 5-second
//! dispatcher re-offers it, so producers never block. Workers claim jobs
//! with a compare-and-set (`pending -> verifying`), which makes the overlap
//! between immediate sends and dispatcher sweeps harmless.
//!
//! Each claimed job runs up to `max_retries + 1` attempts: backoff sleep
//! (cancellation-aware), mirror resolution, local-mirror probe,
//! reachability verification, then the throttled, hash-as-you-go transfer
//! into the distribution's artifact path. Success feeds the shared cache.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use distsmith_cache::ArtifactCache;
use distsmith_cancel::CancellationToken;
use distsmith_db::Store;
use distsmith_storage::{ObjectStorage, content_type_for_key};
use distsmith_types::{CoreError, DownloadJob, RetrievalMethod};

use crate::download::{
    FetchedFile, archive_git_checkout, download_http, ingest_local_file,
};
use crate::mirror::{MirrorResolver, local_mirror_candidate};
use crate::paths::{artifact_key, filename_from_url};
use crate::retry::backoff_delay;
use crate::throttle::RateLimiter;
use crate::urlbuild::GitCheckout;
use crate::verify::{git_tag_exists, http_client, transfer_client, verify_release_url};

/// Progress rows are written at most this often per job.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// How long an idle worker parks on the channel before rechecking shutdown.
const IDLE_RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Scheduler tunables; mirrors the top-level and `[throttle]`/`[mirror]`
/// config sections.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub workers: usize,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub per_worker_bytes_per_sec: u64,
    pub global_bytes_per_sec: u64,
    pub proxy_url: Option<String>,
    pub local_mirror: Option<PathBuf>,
    /// Scratch space for in-flight transfers.
    pub work_dir: PathBuf,
    /// Interval of the pending-jobs dispatcher sweep.
    pub dispatch_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            per_worker_bytes_per_sec: 0,
            global_bytes_per_sec: 0,
            proxy_url: None,
            local_mirror: None,
            work_dir: std::env::temp_dir().join("distsmith-work"),
            dispatch_interval: Duration::from_secs(5),
        }
    }
}

struct Inner {
    store: Arc<Store>,
    storage: Arc<dyn ObjectStorage>,
    cache: Arc<ArtifactCache>,
    settings: ManagerSettings,
    global_limiter: Arc<RateLimiter>,
    cancels: RwLock<HashMap<String, CancellationToken>>,
    running: RwLock<bool>,
    shutdown: CancellationToken,
}

/// What one job's attempt loop concluded.
enum Outcome {
    Completed {
        key: String,
        checksum: String,
        size: u64,
        content_type: String,
    },
    Cancelled,
    Failed(String),
}

/// The download manager. Construct, [`start`](Self::start), submit job ids,
/// [`stop`](Self::stop) on shutdown.
pub struct DownloadManager {
    inner: Arc<Inner>,
    tx: Mutex<Option<SyncSender<String>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    pub fn new(
        store: Arc<Store>,
        storage: Arc<dyn ObjectStorage>,
        cache: Arc<ArtifactCache>,
        settings: ManagerSettings,
    ) -> Self {
        let global_limiter = Arc::new(RateLimiter::new(settings.global_bytes_per_sec));
        Self {
            inner: Arc::new(Inner {
                store,
                storage,
                cache,
                settings,
                global_limiter,
                cancels: RwLock::new(HashMap::new()),
                running: RwLock::new(false),
                shutdown: CancellationToken::new(),
            }),
            tx: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool and the pending-jobs dispatcher.
    pub fn start(&self) -> Result<()> {
        let mut running = self.inner.running.write().expect("running lock poisoned");
        if *running {
            return Ok(());
        }

        fs::create_dir_all(&self.inner.settings.work_dir).with_context(|| {
            format!(
                "failed to create work dir: {}",
                self.inner.settings.work_dir.display()
            )
        })?;

        let capacity = self.inner.settings.workers.max(1) * 2;
        let (tx, rx) = sync_channel::<String>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        *self.tx.lock().expect("tx lock poisoned") = Some(tx.clone());

        let mut threads = self.threads.lock().expect("threads lock poisoned");
        for worker_index in 0..self.inner.settings.workers.max(1) {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&rx);
            threads.push(thread::spawn(move || run_worker(inner, rx, worker_index)));
        }

        let inner = Arc::clone(&self.inner);
        threads.push(thread::spawn(move || run_dispatcher(inner, tx)));

        *running = true;
        info!(workers = self.inner.settings.workers, "download manager started");
        Ok(())
    }

    /// Offer a job to the pool right now; a full channel is not an error,
    /// the dispatcher will pick the job up from the store.
    pub fn submit(&self, job_id: &str) {
        let guard = self.tx.lock().expect("tx lock poisoned");
        if let Some(tx) = guard.as_ref() {
            match tx.try_send(job_id.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(job_id, "job channel full, leaving job for dispatcher");
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!(job_id, "job channel closed, leaving job for dispatcher");
                }
            }
        }
    }

    /// Cancel a job: preempt the owning worker when one is live, and record
    /// `cancelled` in the store either way so queued jobs transition too.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        if let Some(token) = self
            .inner
            .cancels
            .read()
            .expect("cancel map poisoned")
            .get(job_id)
        {
            token.cancel();
        }
        let changed = self.inner.store.jobs().mark_cancelled(job_id)?;
        if changed {
            info!(job_id, "download job cancelled");
        }
        Ok(changed)
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.read().expect("running lock poisoned")
    }

    /// Stop accepting work, cancel in-flight waits, and join every thread.
    pub fn stop(&self) {
        {
            let mut running = self.inner.running.write().expect("running lock poisoned");
            if !*running {
                return;
            }
            *running = false;
        }
        self.inner.shutdown.cancel();
        // In-flight transfers abort through their own tokens.
        for token in self
            .inner
            .cancels
            .read()
            .expect("cancel map poisoned")
            .values()
        {
            token.cancel();
        }
        // Closing the channel wakes idle workers.
        *self.tx.lock().expect("tx lock poisoned") = None;

        let threads: Vec<JoinHandle<()>> =
            self.threads.lock().expect("threads lock poisoned").drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
        info!("download manager stopped");
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_dispatcher(inner: Arc<Inner>, tx: SyncSender<String>) {
    loop {
        match inner.store.jobs().pending_ids_by_priority() {
            Ok(ids) => {
                for id in ids {
                    match tx.try_send(id) {
                        Ok(()) => {}
                        // Channel full: workers are saturated, the rest of
                        // the queue waits for the next sweep.
                        Err(TrySendError::Full(_)) => break,
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
            }
            Err(e) => warn!(error = %format!("{:#}", e), "dispatcher failed to read queue"),
        }
        if inner.shutdown.wait_timeout(inner.settings.dispatch_interval) {
            return;
        }
    }
}

fn run_worker(inner: Arc<Inner>, rx: Arc<Mutex<Receiver<String>>>, worker_index: usize) {
    debug!(worker_index, "download worker online");
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let message = {
            let rx = rx.lock().expect("receiver lock poisoned");
            rx.recv_timeout(IDLE_RECV_TIMEOUT)
        };
        match message {
            Ok(job_id) => process_job(&inner, &job_id),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(worker_index, "download worker offline");
}

fn process_job(inner: &Arc<Inner>, job_id: &str) {
    // Compare-and-set claim: a lost race (another worker, a cancel) is a
    // silent drop.
    match inner.store.jobs().claim(job_id) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            warn!(job_id, error = %format!("{:#}", e), "failed to claim job");
            return;
        }
    }
    let job = match inner.store.jobs().get(job_id) {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(e) => {
            warn!(job_id, error = %format!("{:#}", e), "failed to load claimed job");
            return;
        }
    };

    let token = CancellationToken::new();
    inner
        .cancels
        .write()
        .expect("cancel map poisoned")
        .insert(job.id.clone(), token.clone());

    let outcome = run_attempts(inner, &job, &token);

    inner
        .cancels
        .write()
        .expect("cancel map poisoned")
        .remove(&job.id);

    finalize(inner, &job, outcome);
}

fn run_attempts(inner: &Arc<Inner>, job: &DownloadJob, token: &CancellationToken) -> Outcome {
    let clients = (|| -> anyhow::Result<Clients> {
        Ok(Clients {
            probe: http_client(
                inner.settings.request_timeout,
                inner.settings.proxy_url.as_deref(),
            )?,
            transfer: transfer_client(
                inner.settings.request_timeout,
                inner.settings.proxy_url.as_deref(),
            )?,
        })
    })();
    let clients = match clients {
        Ok(clients) => clients,
        Err(e) => return Outcome::Failed(format!("{:#}", e)),
    };
    // The per-worker bucket is fresh per download; the global one is shared.
    let worker_limiter = Arc::new(RateLimiter::new(inner.settings.per_worker_bytes_per_sec));

    let attempts = job.max_retries + 1;
    let mut last_error = String::from("no attempts executed");

    for attempt in 1..=attempts {
        if token.is_cancelled() || inner.shutdown.is_cancelled() {
            return Outcome::Cancelled;
        }
        if attempt > 1 {
            let delay = backoff_delay(inner.settings.retry_delay, attempt - 1);
            debug!(job_id = %job.id, attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
            if token.wait_timeout(delay) {
                return Outcome::Cancelled;
            }
            if let Err(e) = inner.store.jobs().mark_verifying(&job.id) {
                warn!(job_id = %job.id, error = %format!("{:#}", e), "failed to reset job for retry");
            }
        }

        match run_attempt(inner, job, token, &clients, &worker_limiter) {
            Ok(done) => {
                return Outcome::Completed {
                    content_type: content_type_for_key(&done.key).to_string(),
                    key: done.key,
                    checksum: done.checksum,
                    size: done.size,
                };
            }
            Err(e) => {
                if token.is_cancelled() || e.downcast_ref::<CoreError>().is_some_and(|c| matches!(c, CoreError::Cancelled)) {
                    return Outcome::Cancelled;
                }
                last_error = format!("{:#}", e);
                warn!(job_id = %job.id, attempt, error = %last_error, "download attempt failed");
                if attempt < attempts {
                    if let Err(e) = inner.store.jobs().record_attempt_failure(&job.id, &last_error) {
                        warn!(job_id = %job.id, error = %format!("{:#}", e), "failed to record attempt");
                    }
                }
            }
        }
    }

    Outcome::Failed(last_error)
}

struct PlacedArtifact {
    key: String,
    checksum: String,
    size: u64,
}

/// Probe requests fail fast; transfers run unbounded.
struct Clients {
    probe: reqwest::blocking::Client,
    transfer: reqwest::blocking::Client,
}

fn run_attempt(
    inner: &Arc<Inner>,
    job: &DownloadJob,
    token: &CancellationToken,
    clients: &Clients,
    worker_limiter: &Arc<RateLimiter>,
) -> Result<PlacedArtifact> {
    let filename = job_filename(job);
    let key = artifact_key(
        &job.owner_id,
        &job.distribution_id,
        job.retrieval_method,
        &job.source_id,
        &job.version,
        &filename,
    );
    let content_type = content_type_for_key(&filename);
    let tmp = inner.settings.work_dir.join(format!("{}.part", job.id));

    // Pre-seeded local mirror beats any network I/O.
    if let Some(mirror_dir) = &inner.settings.local_mirror
        && let Some(local) = local_mirror_candidate(mirror_dir, &job.source_id, &job.version, &filename)
    {
        debug!(job_id = %job.id, path = %local.display(), "serving from local mirror");
        let total = fs::metadata(&local).map(|m| m.len()).unwrap_or(0);
        inner.store.jobs().mark_downloading(&job.id, total)?;
        let fetched = ingest_local_file(&local, &tmp, token, progress_writer(inner, &job.id))?;
        return place_artifact(inner, fetched, &key, content_type);
    }

    // Mirror rules rewrite the upstream URL; rules are re-read per attempt
    // so operator edits apply to in-flight retries.
    let resolver = MirrorResolver::from_store(&inner.store)?;
    let (url, _rule) = resolver.resolve(&job.resolved_url);

    match job.retrieval_method {
        RetrievalMethod::Release => {
            let head = verify_release_url(&clients.probe, &url)?;
            if !head.exists {
                anyhow::bail!("release url not reachable (status {}): {}", head.status, url);
            }
            inner
                .store
                .jobs()
                .mark_downloading(&job.id, head.content_length.unwrap_or(0))?;

            let fetched = download_http(
                &clients.transfer,
                &url,
                &tmp,
                Arc::clone(&inner.global_limiter),
                Arc::clone(worker_limiter),
                token,
                progress_writer(inner, &job.id),
            )?;
            place_artifact(inner, fetched, &key, content_type)
        }
        RetrievalMethod::Git => {
            let checkout = GitCheckout {
                clone_url: url,
                reference: format!("v{}", job.version),
            };
            if !git_tag_exists(&checkout.clone_url, &checkout.reference)? {
                anyhow::bail!(
                    "git tag {} not found on {}",
                    checkout.reference,
                    checkout.clone_url
                );
            }
            inner.store.jobs().mark_downloading(&job.id, 0)?;

            let archive_root = filename
                .strip_suffix(".tar.gz")
                .unwrap_or(&filename)
                .to_string();
            let fetched = archive_git_checkout(
                &checkout,
                &archive_root,
                &inner.settings.work_dir,
                &tmp,
                token,
            )?;
            place_artifact(inner, fetched, &key, content_type)
        }
    }
}

/// Filename for the stored artifact: the URL basename for releases, a
/// `{repo}-{version}.tar.gz` archive name for git checkouts.
fn job_filename(job: &DownloadJob) -> String {
    match job.retrieval_method {
        RetrievalMethod::Release => {
            filename_from_url(&job.resolved_url, &job.source_id, &job.version)
        }
        RetrievalMethod::Git => {
            let stem = job
                .resolved_url
                .trim_end_matches('/')
                .trim_end_matches(".git")
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or(&job.source_id)
                .to_string();
            format!("{}-{}.tar.gz", stem, job.version)
        }
    }
}

/// A progress callback that writes through to the store at most every
/// [`PROGRESS_INTERVAL`].
fn progress_writer<'a>(inner: &'a Arc<Inner>, job_id: &'a str) -> impl FnMut(u64) + 'a {
    let mut last_write = Instant::now();
    let mut first = true;
    move |bytes| {
        if first || last_write.elapsed() >= PROGRESS_INTERVAL {
            first = false;
            last_write = Instant::now();
            if let Err(e) = inner.store.jobs().update_progress(job_id, bytes) {
                warn!(job_id, error = %format!("{:#}", e), "failed to write progress");
            }
        }
    }
}

/// Move the finished temp file into the distribution namespace: a rename
/// when the backend is local, a streamed upload otherwise.
fn place_artifact(
    inner: &Arc<Inner>,
    fetched: FetchedFile,
    key: &str,
    content_type: &'static str,
) -> Result<PlacedArtifact> {
    if let Some(local) = inner.storage.as_local() {
        let target = local.resolve_path(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        if fs::rename(&fetched.path, &target).is_err() {
            // Cross-device work dir: fall back to a byte copy.
            fs::copy(&fetched.path, &target)
                .with_context(|| format!("failed to move artifact into place: {}", target.display()))?;
            let _ = fs::remove_file(&fetched.path);
        }
    } else {
        let mut file = fs::File::open(&fetched.path)
            .with_context(|| format!("failed to reopen transfer: {}", fetched.path.display()))?;
        inner
            .storage
            .upload(key, &mut file, fetched.size, content_type)
            .map_err(|e| anyhow::Error::from(CoreError::StorageUnavailable(format!("{:#}", e))))?;
        let _ = fs::remove_file(&fetched.path);
    }
    Ok(PlacedArtifact {
        key: key.to_string(),
        checksum: fetched.checksum,
        size: fetched.size,
    })
}

fn finalize(inner: &Arc<Inner>, job: &DownloadJob, outcome: Outcome) {
    match outcome {
        Outcome::Completed {
            key,
            checksum,
            size,
            content_type,
        } => {
            match inner.store.jobs().mark_completed(&job.id, &key, &checksum, size) {
                Ok(()) => {
                    info!(job_id = %job.id, artifact = %key, bytes = size, "download completed");
                    // Cache feeding is best-effort; a cache failure never
                    // fails the job.
                    if let Err(e) = inner.cache.store(
                        &job.source_id,
                        &job.version,
                        &key,
                        &checksum,
                        size,
                        &content_type,
                        &job.resolved_url,
                    ) {
                        warn!(job_id = %job.id, error = %format!("{:#}", e), "failed to cache artifact");
                    }
                }
                Err(e) => {
                    // Lost a race with a cancel: drop the placed object.
                    warn!(job_id = %job.id, error = %format!("{:#}", e), "completion rejected, removing artifact");
                    let _ = inner.storage.delete(&key);
                }
            }
        }
        Outcome::Cancelled => {
            let _ = fs::remove_file(inner.settings.work_dir.join(format!("{}.part", job.id)));
            if let Err(e) = inner.store.jobs().mark_cancelled(&job.id) {
                warn!(job_id = %job.id, error = %format!("{:#}", e), "failed to record cancellation");
            }
            info!(job_id = %job.id, "download cancelled");
        }
        Outcome::Failed(message) => {
            if let Err(e) = inner.store.jobs().mark_failed(&job.id, &message) {
                warn!(job_id = %job.id, error = %format!("{:#}", e), "failed to record failure");
            }
            error!(job_id = %job.id, error = %message, "download failed after retries");
        }
    }
}
