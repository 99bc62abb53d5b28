//! End-to-end acquisition scenarios: fresh download, cross-build cache
//! reuse, and in-build deduplication, over a loopback HTTP upstream.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tiny_http::{Response, Server};

use distsmith::Core;
use distsmith_config::Config;
use distsmith_db::NewUpstreamSource;
use distsmith_types::{
    Actor, BuildTarget, ComponentSelection, Distribution, DistributionConfig, DownloadJob,
    DownloadJobStatus, FilesystemSelection, ImageFormat, KernelSelection, SecuritySelection,
    TargetArch,
};

fn test_config(objects_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.workers = 1;
    config.retry_delay = Duration::from_millis(50);
    config.request_timeout = Duration::from_secs(5);
    config.persist.path = None;
    config.storage.base_dir = objects_dir.to_path_buf();
    config
}

fn distribution(id: &str, config: DistributionConfig) -> Distribution {
    let now = chrono::Utc::now();
    Distribution {
        id: id.to_string(),
        owner_id: "u1".to_string(),
        name: format!("build {}", id),
        config,
        created_at: now,
        updated_at: now,
    }
}

fn base_recipe() -> DistributionConfig {
    DistributionConfig {
        kernel: KernelSelection {
            selection: ComponentSelection::new("kernel"),
            ..Default::default()
        },
        bootloader: ComponentSelection::new("grub"),
        init: ComponentSelection::new("systemd"),
        filesystem: FilesystemSelection {
            selection: ComponentSelection::new("ext4"),
            userspace_tools: false,
        },
        package_manager: ComponentSelection::new("apk"),
        security: SecuritySelection {
            selection: ComponentSelection::new("selinux"),
            userspace: false,
        },
        container_runtime: None,
        virtualization: None,
        target: BuildTarget::Server,
        arch: TargetArch::X86_64,
        board_profile_id: None,
        image_format: ImageFormat::Raw,
    }
}

fn wait_for_terminal(core: &Core, job_id: &str, timeout: Duration) -> DownloadJob {
    let deadline = Instant::now() + timeout;
    loop {
        let job = core
            .store()
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

/// Bind a loopback source to the seeded kernel component, outranking the
/// seeded kernel.org source.
fn bind_kernel_source(core: &Core, base_url: &str) -> String {
    let kernel = core
        .store()
        .components()
        .get_by_name("kernel-source")
        .expect("get")
        .expect("seeded");
    core.catalog()
        .create_source(
            &Actor::user("u1"),
            NewUpstreamSource {
                name: "loopback-kernel".to_string(),
                url: base_url.to_string(),
                component_ids: vec![kernel.id],
                url_template: Some("{base_url}/linux-{version}.tar.xz".to_string()),
                priority: 1,
                ..Default::default()
            },
        )
        .expect("create source")
        .id
}

#[test]
fn kernel_fresh_download_then_cache_hit_across_builds() {
    let objects = tempfile::tempdir().expect("tempdir");
    let body = b"linux 6.12.4 source tarball".to_vec();

    let server = Server::http("127.0.0.1:0").expect("server");
    let base_url = format!("http://{}", server.server_addr());
    let server_body = body.clone();
    let server_thread = thread::spawn(move || {
        // Exactly one HEAD and one GET: the second build must not touch the
        // network at all.
        for _ in 0..2 {
            let request = server.recv().expect("request");
            let _ = request.respond(Response::from_data(server_body.clone()));
        }
    });

    let mut core = Core::new(test_config(objects.path())).expect("core");
    core.manager().start().expect("start manager");
    let source_id = bind_kernel_source(&core, &base_url);
    let acquisition = core.acquisition();

    // Build one: fresh download.
    let mut recipe = base_recipe();
    recipe.kernel.selection.version = Some("6.12.4".to_string());
    let d1 = distribution("d1", recipe.clone());

    let jobs = acquisition.submit_distribution(&d1).expect("submit d1");
    assert_eq!(jobs.len(), 1, "only the pinned kernel resolves a version");
    assert_eq!(jobs[0].priority, 10);

    let job = wait_for_terminal(&core, &jobs[0].id, Duration::from_secs(15));
    server_thread.join().expect("server");

    assert_eq!(job.status, DownloadJobStatus::Completed);
    assert!(!job.cache_hit);
    let d1_path = format!(
        "distribution/u1/d1/components/{}/6.12.4/linux-6.12.4.tar.xz",
        source_id
    );
    assert_eq!(job.artifact_path.as_deref(), Some(d1_path.as_str()));
    assert_eq!(job.checksum.as_deref(), Some(sha256_hex(&body).as_str()));

    let entry = core
        .store()
        .cache_entries()
        .get(&source_id, "6.12.4")
        .expect("get entry")
        .expect("cached");
    assert_eq!(
        entry.cache_path,
        format!("cache/artifacts/{}/6.12.4/linux-6.12.4.tar.xz", source_id)
    );

    // Build two: same artifact, no server left to talk to.
    let d2 = distribution("d2", recipe);
    let jobs = acquisition.submit_distribution(&d2).expect("submit d2");
    assert_eq!(jobs.len(), 1);
    let hit = &jobs[0];
    assert_eq!(hit.status, DownloadJobStatus::Completed);
    assert!(hit.cache_hit);
    let d2_path = format!(
        "distribution/u1/d2/components/{}/6.12.4/linux-6.12.4.tar.xz",
        source_id
    );
    assert_eq!(hit.artifact_path.as_deref(), Some(d2_path.as_str()));
    assert_eq!(hit.checksum.as_deref(), Some(sha256_hex(&body).as_str()));

    // Local filesystem backend: the copy is a hard link.
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let cached = std::fs::metadata(objects.path().join(&entry.cache_path)).expect("meta");
        let linked = std::fs::metadata(objects.path().join(&d2_path)).expect("meta");
        assert_eq!(cached.ino(), linked.ino());
    }

    // Resubmitting the same build creates no second job.
    let again = acquisition.submit_distribution(&d2).expect("resubmit d2");
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, hit.id);
    assert_eq!(
        core.store()
            .jobs()
            .list_for_distribution("d2")
            .expect("list")
            .len(),
        1
    );

    let stats = acquisition.stats("d2").expect("stats");
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cache_hits, 1);

    core.stop();
}

#[test]
fn hybrid_components_sharing_an_artifact_deduplicate_into_one_job() {
    let objects = tempfile::tempdir().expect("tempdir");
    let mut core = Core::new(test_config(objects.path())).expect("core");
    // The manager stays stopped: this scenario is about planning.

    let btrfs = core
        .store()
        .components()
        .get_by_name("filesystem-btrfs")
        .expect("get")
        .expect("seeded");
    let progs = core
        .store()
        .components()
        .get_by_name("userspace-btrfs-progs")
        .expect("get")
        .expect("seeded");

    core.catalog()
        .create_source(
            &Actor::user("u1"),
            NewUpstreamSource {
                name: "loopback-btrfs".to_string(),
                url: "http://127.0.0.1:9/btrfs".to_string(),
                component_ids: vec![btrfs.id.clone(), progs.id.clone()],
                url_template: Some("{base_url}/btrfs-{version}.tar.gz".to_string()),
                priority: 1,
                ..Default::default()
            },
        )
        .expect("create source");

    let mut recipe = base_recipe();
    recipe.filesystem = FilesystemSelection {
        selection: ComponentSelection::pinned("btrfs", "6.12"),
        userspace_tools: true,
    };
    let d1 = distribution("d1", recipe);

    let acquisition = core.acquisition();
    let jobs = acquisition.submit_distribution(&d1).expect("submit");

    assert_eq!(jobs.len(), 1, "both components share one artifact job");
    let job = &jobs[0];
    assert_eq!(job.status, DownloadJobStatus::Pending);
    assert_eq!(job.version, "6.12");
    assert_eq!(job.component_id, btrfs.id);
    assert!(job.component_ids.contains(&btrfs.id));
    assert!(job.component_ids.contains(&progs.id));
    assert_eq!(job.component_ids.len(), 2);

    core.stop();
}

#[test]
fn unresolvable_selections_are_skipped_not_fatal() {
    let objects = tempfile::tempdir().expect("tempdir");
    let mut core = Core::new(test_config(objects.path())).expect("core");

    let mut recipe = base_recipe();
    recipe.container_runtime = Some(ComponentSelection::new("youki"));
    let d1 = distribution("d1", recipe);

    let jobs = core
        .acquisition()
        .submit_distribution(&d1)
        .expect("submit");
    // Nothing resolves a version (no discovery ran, nothing pinned), and
    // the unknown runtime resolves no component; the plan is simply empty.
    assert!(jobs.is_empty());

    core.stop();
}
