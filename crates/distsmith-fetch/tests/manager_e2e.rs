//! End-to-end download scheduler tests against a loopback HTTP upstream.

use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tiny_http::{Response, Server, StatusCode};

use distsmith_cache::{ArtifactCache, CacheSettings};
use distsmith_db::{NewDownloadJob, Store};
use distsmith_fetch::{DownloadManager, ManagerSettings};
use distsmith_storage::{FileStorage, ObjectStorage};
use distsmith_types::{DownloadJob, DownloadJobStatus, RetrievalMethod, SourceType};

struct Fixture {
    _objects: tempfile::TempDir,
    _work: tempfile::TempDir,
    store: Arc<Store>,
    storage: Arc<FileStorage>,
    manager: DownloadManager,
}

fn fixture(tune: impl FnOnce(&mut ManagerSettings)) -> Fixture {
    let objects = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open_in_memory().expect("open store"));
    let storage = Arc::new(FileStorage::new(objects.path().to_path_buf()));
    let storage_dyn: Arc<dyn ObjectStorage> =
        Arc::new(FileStorage::new(objects.path().to_path_buf()));
    let cache = Arc::new(ArtifactCache::new(
        Arc::clone(&store),
        Arc::clone(&storage_dyn),
        CacheSettings::default(),
    ));

    let mut settings = ManagerSettings {
        workers: 1,
        retry_delay: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
        work_dir: work.path().to_path_buf(),
        dispatch_interval: Duration::from_millis(200),
        ..Default::default()
    };
    tune(&mut settings);

    let manager = DownloadManager::new(Arc::clone(&store), storage_dyn, cache, settings);
    manager.start().expect("start manager");

    Fixture {
        _objects: objects,
        _work: work,
        store,
        storage,
        manager,
    }
}

fn kernel_job(store: &Store, distribution: &str, version: &str, url: &str) -> DownloadJob {
    let component = store
        .components()
        .get_by_name("kernel-source")
        .expect("get component")
        .expect("seeded");
    store
        .jobs()
        .create(NewDownloadJob {
            distribution_id: distribution.to_string(),
            owner_id: "u1".to_string(),
            component_id: component.id,
            source_id: "kernel-source".to_string(),
            source_name: "kernel.org".to_string(),
            source_type: SourceType::Default,
            retrieval_method: RetrievalMethod::Release,
            resolved_url: url.to_string(),
            version: version.to_string(),
            max_retries: 3,
            priority: 10,
        })
        .expect("create job")
}

fn wait_for_terminal(store: &Store, job_id: &str, timeout: Duration) -> DownloadJob {
    let deadline = Instant::now() + timeout;
    loop {
        let job = store
            .jobs()
            .get(job_id)
            .expect("get job")
            .expect("job present");
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {} stuck in {:?}",
            job_id,
            job.status
        );
        thread::sleep(Duration::from_millis(25));
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[test]
fn fresh_download_completes_and_feeds_the_cache() {
    let body = b"pretend this is a kernel tarball".to_vec();
    let server = Server::http("127.0.0.1:0").expect("server");
    let url = format!(
        "http://{}/pub/linux/v6.x/linux-6.12.4.tar.xz",
        server.server_addr()
    );
    let expected_checksum = sha256_hex(&body);

    let server_body = body.clone();
    let server_thread = thread::spawn(move || {
        // HEAD for verification, then GET for the transfer.
        for _ in 0..2 {
            let request = server.recv().expect("request");
            let _ = request.respond(Response::from_data(server_body.clone()));
        }
    });

    let fixture = fixture(|_| {});
    let job = kernel_job(&fixture.store, "d1", "6.12.4", &url);
    fixture.manager.submit(&job.id);

    let job = wait_for_terminal(&fixture.store, &job.id, Duration::from_secs(15));
    server_thread.join().expect("server");

    assert_eq!(job.status, DownloadJobStatus::Completed);
    assert!(!job.cache_hit);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.checksum.as_deref(), Some(expected_checksum.as_str()));
    assert_eq!(
        job.artifact_path.as_deref(),
        Some("distribution/u1/d1/components/kernel-source/6.12.4/linux-6.12.4.tar.xz")
    );
    assert!(job.completed_at.expect("completed_at") >= job.started_at.expect("started_at"));

    // The artifact really is in storage, byte-for-byte.
    let (mut reader, info) = fixture
        .storage
        .download(job.artifact_path.as_deref().expect("path"))
        .expect("download");
    let mut stored = Vec::new();
    reader.read_to_end(&mut stored).expect("read");
    assert_eq!(stored, body);
    assert_eq!(info.content_type, "application/x-xz");

    // And the shared cache picked it up.
    let entry = fixture
        .store
        .cache_entries()
        .get("kernel-source", "6.12.4")
        .expect("get entry")
        .expect("cached");
    assert_eq!(
        entry.cache_path,
        "cache/artifacts/kernel-source/6.12.4/linux-6.12.4.tar.xz"
    );
    assert!(fixture.storage.exists(&entry.cache_path).expect("exists"));

    fixture.manager.stop();
}

#[test]
fn transient_errors_retry_with_backoff_then_succeed() {
    let body = b"eventually available".to_vec();
    let server = Server::http("127.0.0.1:0").expect("server");
    let url = format!("http://{}/artifact-1.0.tar.gz", server.server_addr());

    let server_body = body.clone();
    let server_thread = thread::spawn(move || {
        // Two failed verifications, then HEAD + GET succeeding.
        for step in 0..4 {
            let request = server.recv().expect("request");
            let response = match step {
                0 | 1 => Response::from_string("upstream busy")
                    .with_status_code(StatusCode(503)),
                _ => Response::from_data(server_body.clone()).with_status_code(StatusCode(200)),
            };
            let _ = request.respond(response);
        }
    });

    let fixture = fixture(|_| {});
    let job = kernel_job(&fixture.store, "d1", "1.0", &url);
    fixture.manager.submit(&job.id);

    let job = wait_for_terminal(&fixture.store, &job.id, Duration::from_secs(15));
    server_thread.join().expect("server");

    assert_eq!(job.status, DownloadJobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.checksum.as_deref(), Some(sha256_hex(&body).as_str()));
}

#[test]
fn exhausted_retries_mark_the_job_failed() {
    let server = Server::http("127.0.0.1:0").expect("server");
    let url = format!("http://{}/gone-2.0.tar.gz", server.server_addr());

    let server_thread = thread::spawn(move || {
        // max_retries = 3 means four verification attempts, all 404.
        for _ in 0..4 {
            let request = server.recv().expect("request");
            let _ = request.respond(Response::empty(StatusCode(404)));
        }
    });

    let fixture = fixture(|_| {});
    let job = kernel_job(&fixture.store, "d1", "2.0", &url);
    fixture.manager.submit(&job.id);

    let job = wait_for_terminal(&fixture.store, &job.id, Duration::from_secs(15));
    server_thread.join().expect("server");

    assert_eq!(job.status, DownloadJobStatus::Failed);
    assert!(job.error_message.expect("message").contains("404"));
    assert!(job.completed_at.is_some());
    assert!(job.artifact_path.is_none());
}

#[test]
fn zero_max_retries_means_one_attempt() {
    let server = Server::http("127.0.0.1:0").expect("server");
    let url = format!("http://{}/flaky-1.0.tar.gz", server.server_addr());

    let server_thread = thread::spawn(move || {
        // Exactly one verification; a retry would hang on a second recv and
        // fail the join below.
        let request = server.recv().expect("request");
        let _ = request.respond(Response::empty(StatusCode(503)));
    });

    let fixture = fixture(|_| {});
    let component = fixture
        .store
        .components()
        .get_by_name("kernel-source")
        .expect("get component")
        .expect("seeded");
    let job = fixture
        .store
        .jobs()
        .create(NewDownloadJob {
            distribution_id: "d1".to_string(),
            owner_id: "u1".to_string(),
            component_id: component.id,
            source_id: "kernel-source".to_string(),
            source_name: "kernel.org".to_string(),
            source_type: SourceType::Default,
            retrieval_method: RetrievalMethod::Release,
            resolved_url: url,
            version: "1.0".to_string(),
            max_retries: 0,
            priority: 0,
        })
        .expect("create job");
    fixture.manager.submit(&job.id);

    let job = wait_for_terminal(&fixture.store, &job.id, Duration::from_secs(15));
    server_thread.join().expect("server");

    assert_eq!(job.status, DownloadJobStatus::Failed);
    assert_eq!(job.retry_count, 0);
}

/// Reader that trickles bytes so a cancel can land mid-transfer.
struct SlowReader {
    remaining: usize,
    chunk: usize,
    delay: Duration,
}

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        thread::sleep(self.delay);
        let n = self.chunk.min(self.remaining).min(buf.len());
        buf[..n].fill(9);
        self.remaining -= n;
        Ok(n)
    }
}

#[test]
fn cancellation_mid_download_is_terminal_and_leaves_no_cache_entry() {
    let total = 512 * 1024;
    let server = Server::http("127.0.0.1:0").expect("server");
    let url = format!("http://{}/big-3.0.tar.gz", server.server_addr());

    let server_thread = thread::spawn(move || {
        // Verification HEAD.
        let request = server.recv().expect("request");
        let _ = request.respond(Response::from_data(vec![0u8; total]));

        // Slow GET; the client aborts mid-stream, so the respond error is
        // expected.
        let request = server.recv().expect("request");
        let reader = SlowReader {
            remaining: total,
            chunk: 8 * 1024,
            delay: Duration::from_millis(20),
        };
        let response = Response::new(StatusCode(200), vec![], reader, Some(total), None);
        let _ = request.respond(response);
    });

    let fixture = fixture(|_| {});
    let job = kernel_job(&fixture.store, "d1", "3.0", &url);
    fixture.manager.submit(&job.id);

    // Wait for real progress, then cancel.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let current = fixture
            .store
            .jobs()
            .get(&job.id)
            .expect("get")
            .expect("present");
        if current.status == DownloadJobStatus::Downloading && current.progress_bytes > 0 {
            break;
        }
        assert!(Instant::now() < deadline, "download never made progress");
        thread::sleep(Duration::from_millis(10));
    }
    fixture.manager.cancel_job(&job.id).expect("cancel");

    let job = wait_for_terminal(&fixture.store, &job.id, Duration::from_secs(10));
    server_thread.join().expect("server");

    assert_eq!(job.status, DownloadJobStatus::Cancelled);
    assert!(job.completed_at.is_some());
    assert!(
        fixture
            .store
            .cache_entries()
            .get("kernel-source", "3.0")
            .expect("get")
            .is_none()
    );
    // No artifact and no leftover temp file.
    assert!(
        fixture
            .storage
            .list("distribution")
            .expect("list")
            .is_empty()
    );
}

#[test]
fn cancelling_a_queued_job_needs_no_worker() {
    let fixture = fixture(|_| {});
    // Unreachable url, but the job never runs: cancel lands first.
    let job = kernel_job(&fixture.store, "d1", "4.0", "http://192.0.2.1:9/x.tar.gz");

    assert!(fixture.manager.cancel_job(&job.id).expect("cancel"));
    let job = fixture
        .store
        .jobs()
        .get(&job.id)
        .expect("get")
        .expect("present");
    assert_eq!(job.status, DownloadJobStatus::Cancelled);
    assert!(job.completed_at.is_some());
}

#[test]
fn local_mirror_skips_the_network_entirely() {
    let mirror = tempfile::tempdir().expect("tempdir");
    let body = b"preseeded artifact";
    let structured = mirror.path().join("kernel-source").join("5.0");
    std::fs::create_dir_all(&structured).expect("mkdir");
    std::fs::write(structured.join("linux-5.0.tar.xz"), body).expect("write");

    let mirror_path = mirror.path().to_path_buf();
    let fixture = fixture(move |settings| {
        settings.local_mirror = Some(mirror_path);
    });

    // The URL's host does not exist; only the local mirror can satisfy this.
    let job = kernel_job(
        &fixture.store,
        "d1",
        "5.0",
        "http://192.0.2.1:9/linux-5.0.tar.xz",
    );
    fixture.manager.submit(&job.id);

    let job = wait_for_terminal(&fixture.store, &job.id, Duration::from_secs(15));
    assert_eq!(job.status, DownloadJobStatus::Completed);
    assert_eq!(job.checksum.as_deref(), Some(sha256_hex(body).as_str()));
    assert!(
        fixture
            .storage
            .exists("distribution/u1/d1/components/kernel-source/5.0/linux-5.0.tar.xz")
            .expect("exists")
    );
}

#[test]
fn backpressure_drains_through_the_dispatcher() {
    // One worker, channel capacity two: five submissions overflow onto the
    // store queue and the dispatcher must finish the rest.
    let versions = ["10.0", "10.1", "10.2", "10.3", "10.4"];
    let body = b"small artifact".to_vec();

    let server = Server::http("127.0.0.1:0").expect("server");
    let base = format!("http://{}", server.server_addr());
    let server_body = body.clone();
    let server_thread = thread::spawn(move || {
        // Each job does HEAD + GET.
        for _ in 0..10 {
            let request = server.recv().expect("request");
            let _ = request.respond(Response::from_data(server_body.clone()));
        }
    });

    let fixture = fixture(|_| {});
    let mut job_ids = Vec::new();
    for version in versions {
        let url = format!("{}/artifact-{}.tar.gz", base, version);
        let job = kernel_job(&fixture.store, "d1", version, &url);
        fixture.manager.submit(&job.id);
        job_ids.push(job.id);
    }

    for job_id in &job_ids {
        let job = wait_for_terminal(&fixture.store, job_id, Duration::from_secs(30));
        assert_eq!(job.status, DownloadJobStatus::Completed);
    }
    server_thread.join().expect("server");

    let stats = fixture.store.jobs().stats(Some("d1")).expect("stats");
    assert_eq!(stats.completed, 5);
}
