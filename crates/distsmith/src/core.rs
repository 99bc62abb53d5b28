//! Wiring: one [`Core`] owns every long-lived piece of the acquisition
//! subsystem and manages their startup and shutdown order.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::info;

use distsmith_cache::{ArtifactCache, CacheSettings};
use distsmith_cancel::CancellationToken;
use distsmith_catalog::Catalog;
use distsmith_config::Config;
use distsmith_db::{Store, StoreOptions};
use distsmith_discovery::{SyncEngine, SyncScheduler, SyncSettings};
use distsmith_fetch::{DownloadManager, ManagerSettings};
use distsmith_storage::{ObjectStorage, build_storage};

use crate::acquisition::Acquisition;

/// The assembled acquisition core.
pub struct Core {
    config: Config,
    store: Arc<Store>,
    storage: Arc<dyn ObjectStorage>,
    catalog: Catalog,
    cache: Arc<ArtifactCache>,
    manager: Arc<DownloadManager>,
    sync_engine: SyncEngine,
    scheduler: Option<SyncScheduler>,
    snapshot_cancel: CancellationToken,
    snapshot_thread: Option<JoinHandle<()>>,
}

impl Core {
    /// Build every component from configuration. Nothing runs yet; call
    /// [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(
            Store::open(StoreOptions {
                persist_path: config.persist.path.clone(),
                load_on_start: config.persist.load_on_start,
            })
            .context("failed to open state store")?,
        );

        let storage: Arc<dyn ObjectStorage> =
            Arc::from(build_storage(&config.storage).context("failed to build storage backend")?);
        storage.ping().context("storage backend unavailable")?;

        let catalog = Catalog::new(Arc::clone(&store));
        let cache = Arc::new(ArtifactCache::new(
            Arc::clone(&store),
            Arc::clone(&storage),
            CacheSettings {
                enabled: config.cache.enabled,
                max_size_gb: config.cache.max_size_gb,
            },
        ));

        let manager = Arc::new(DownloadManager::new(
            Arc::clone(&store),
            Arc::clone(&storage),
            Arc::clone(&cache),
            ManagerSettings {
                workers: config.workers,
                retry_delay: config.retry_delay,
                request_timeout: config.request_timeout,
                per_worker_bytes_per_sec: config.throttle.per_worker_bytes_per_sec,
                global_bytes_per_sec: config.throttle.global_bytes_per_sec,
                proxy_url: config.mirror.proxy_url.clone(),
                local_mirror: config.mirror.local_path.clone(),
                ..Default::default()
            },
        ));

        let sync_engine = SyncEngine::new(
            Arc::clone(&store),
            SyncSettings {
                request_timeout: config.request_timeout,
                cache_duration: config.sync.cache_duration,
                github_token: config.discovery.github_token.clone(),
                ..Default::default()
            },
        );

        Ok(Self {
            config,
            store,
            storage,
            catalog,
            cache,
            manager,
            sync_engine,
            scheduler: None,
            snapshot_cancel: CancellationToken::new(),
            snapshot_thread: None,
        })
    }

    /// Start background work: the download worker pool, the version-sync
    /// scheduler, and the periodic state snapshot.
    pub fn start(&mut self) -> Result<()> {
        self.manager.start()?;
        self.scheduler = Some(SyncScheduler::start(
            self.sync_engine.clone(),
            self.config.sync.interval,
        ));

        if self.config.persist.path.is_some() {
            let store = Arc::clone(&self.store);
            let cancel = self.snapshot_cancel.clone();
            let interval = self.config.persist.snapshot_interval;
            self.snapshot_thread = Some(thread::spawn(move || {
                while !cancel.wait_timeout(interval) {
                    store.snapshot_best_effort();
                }
            }));
        }

        info!("acquisition core started");
        Ok(())
    }

    /// Stop background work in dependency order and take a final snapshot.
    pub fn stop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        self.manager.stop();
        self.snapshot_cancel.cancel();
        if let Some(handle) = self.snapshot_thread.take() {
            let _ = handle.join();
        }
        self.store.snapshot_best_effort();
        info!("acquisition core stopped");
    }

    /// The build pipeline's entry point.
    pub fn acquisition(&self) -> Acquisition {
        Acquisition::new(
            Arc::clone(&self.store),
            self.catalog.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.storage),
            Arc::clone(&self.manager),
            self.config.max_retries,
        )
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn manager(&self) -> &Arc<DownloadManager> {
        &self.manager
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync_engine
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.stop();
    }
}
