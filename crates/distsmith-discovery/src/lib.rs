//! Version discovery for upstream sources.
//!
//! For each enabled upstream a sync job polls the remote for available
//! versions and upserts them into the state store. The strategy is
//! dispatched from the source URL (or its `forge_type`): the GitHub API,
//! the kernel.org directory tree, or a generic HTTP index. After a
//! successful sync the engine resolves default versions: the source's (the
//! GitHub "latest release" tag, or the first stable discovered version) and
//! each bound component's, per its default-version rule.
//!
//! [`SyncScheduler`] runs the whole thing in the background: at startup and
//! on an interval it walks enabled sources, skipping those with a live sync
//! or a fresh enough last success, and dispatches one sync task per stale
//! source with a hard five-minute deadline.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, warn};

use distsmith_cancel::{CancellationToken, Deadline};
use distsmith_db::{DiscoveredVersion, Store};
use distsmith_types::{SyncJob, UpstreamSource, VersionRule};
use distsmith_version::first_stable;

mod github;
mod http_index;
mod kernel_org;

pub use github::{GithubClient, api_base_for, parse_repo};
pub use http_index::{HttpIndexClient, extract_versions};
pub use kernel_org::KernelOrgClient;

/// Hard per-source sync deadline.
pub const SYNC_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Discovery strategy, dispatched from the source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    GitHub,
    KernelOrg,
    HttpIndex,
}

/// Pick the strategy for a source. An explicit `forge_type` wins, so GitHub
/// Enterprise hosts and test servers dispatch correctly.
pub fn strategy_for(source: &UpstreamSource) -> Strategy {
    match source.forge_type.as_deref() {
        Some("github") => return Strategy::GitHub,
        Some("kernel.org") => return Strategy::KernelOrg,
        _ => {}
    }
    if source.url.contains("github.com") {
        Strategy::GitHub
    } else if source.url.contains("kernel.org") {
        Strategy::KernelOrg
    } else {
        Strategy::HttpIndex
    }
}

/// Tunables for the engine; mirrors the `[sync]`/`[discovery]` config.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub request_timeout: Duration,
    /// How long a successful sync keeps a source fresh.
    pub cache_duration: Duration,
    pub github_token: Option<String>,
    pub sync_deadline: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            cache_duration: Duration::from_secs(60 * 60),
            github_token: None,
            sync_deadline: SYNC_DEADLINE,
        }
    }
}

/// The discovery engine. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<Store>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(store: Arc<Store>, settings: SyncSettings) -> Self {
        Self { store, settings }
    }

    /// Run one sync against a source, recording a sync job either way.
    /// Discovery failures land in the job's `error_message`; only store
    /// failures surface as `Err`.
    pub fn sync_source(
        &self,
        source: &UpstreamSource,
        cancel: &CancellationToken,
    ) -> Result<SyncJob> {
        let job = self.store.sync_jobs().create(&source.id)?;
        self.store.sync_jobs().mark_running(&job.id)?;
        debug!(source = %source.name, sync_job = %job.id, "version sync started");

        let deadline = Deadline::after(self.settings.sync_deadline);
        let outcome = self.discover(source, &deadline, cancel);

        let versions = match outcome {
            Ok(versions) => versions,
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(source = %source.name, error = %message, "version sync failed");
                self.store.sync_jobs().mark_failed(&job.id, &message)?;
                return self
                    .store
                    .sync_jobs()
                    .get(&job.id)?
                    .context("sync job vanished");
            }
        };

        let versions = apply_version_filter(versions, source.version_filter.as_deref())?;
        let (found, new) =
            self.store
                .versions()
                .upsert_bulk(&source.id, source.source_type(), &versions)?;

        if let Err(e) = self.apply_auto_defaults(source) {
            // Default resolution is best-effort; the discovered versions are
            // already stored.
            warn!(source = %source.name, error = %format!("{:#}", e), "auto-default resolution failed");
        }

        self.store.sync_jobs().mark_completed(&job.id, found, new)?;
        info!(source = %source.name, found, new, "version sync completed");
        self.store
            .sync_jobs()
            .get(&job.id)?
            .context("sync job vanished")
    }

    fn discover(
        &self,
        source: &UpstreamSource,
        deadline: &Deadline,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredVersion>> {
        if cancel.is_cancelled() {
            anyhow::bail!("sync cancelled");
        }
        let versions = match strategy_for(source) {
            Strategy::GitHub => {
                let (owner, repo) = parse_repo(&source.url)?;
                let client = GithubClient::for_repo(
                    &source.url,
                    self.settings.github_token.clone(),
                    self.settings.request_timeout,
                );
                client.discover(&owner, &repo, deadline)?
            }
            Strategy::KernelOrg => {
                KernelOrgClient::new(&source.url, self.settings.request_timeout)
                    .discover(deadline)?
            }
            Strategy::HttpIndex => {
                HttpIndexClient::new(&source.url, self.settings.request_timeout).discover()?
            }
        };
        if cancel.is_cancelled() {
            anyhow::bail!("sync cancelled");
        }
        if deadline.expired() {
            anyhow::bail!("sync deadline exceeded");
        }
        Ok(versions)
    }

    /// Fill the source's default version when empty, then re-resolve every
    /// bound component whose rule is not pinned.
    fn apply_auto_defaults(&self, source: &UpstreamSource) -> Result<()> {
        if source.default_version.is_none() {
            let default = match strategy_for(source) {
                Strategy::GitHub => {
                    let (owner, repo) = parse_repo(&source.url)?;
                    let client = GithubClient::for_repo(
                        &source.url,
                        self.settings.github_token.clone(),
                        self.settings.request_timeout,
                    );
                    client.latest_release(&owner, &repo)?
                }
                _ => None,
            };
            let default = match default {
                Some(default) => Some(default),
                None => {
                    let versions = self.store.versions().list_for_source(&source.id)?;
                    first_stable(versions.iter().map(|v| v.version.as_str()))
                        .map(str::to_string)
                }
            };
            if let Some(default) = default {
                self.store.sources().set_default_version(&source.id, &default)?;
                debug!(source = %source.name, version = %default, "source default version set");
            }
        }

        for component_id in &source.component_ids {
            let Some(component) = self.store.components().get(component_id)? else {
                continue;
            };
            if component.default_version_rule == VersionRule::Pinned {
                continue;
            }
            let resolved = self
                .store
                .versions()
                .newest_matching(&source.id, component.default_version_rule)?;
            if let Some(resolved) = resolved
                && component.default_version.as_deref() != Some(resolved.version.as_str())
            {
                self.store
                    .components()
                    .set_default_version(&component.id, &resolved.version)?;
                debug!(
                    component = %component.name,
                    version = %resolved.version,
                    "component default version re-resolved"
                );
            }
        }
        Ok(())
    }

    /// Walk enabled sources and sync the stale ones, one background task
    /// each, joining them all before returning. Returns how many synced.
    pub fn sync_stale_sources(&self, cancel: &CancellationToken) -> Result<u64> {
        let sources = self.store.sources().list_enabled()?;
        let mut handles = Vec::new();

        for source in sources {
            if cancel.is_cancelled() {
                break;
            }
            if self.store.sync_jobs().has_active(&source.id)? {
                continue;
            }
            if let Some(last) = self.store.sync_jobs().last_success(&source.id)? {
                let age = chrono::Utc::now()
                    .signed_duration_since(last)
                    .to_std()
                    .unwrap_or_default();
                if age < self.settings.cache_duration {
                    continue;
                }
            }

            let engine = self.clone();
            let cancel = cancel.clone();
            handles.push(thread::spawn(move || {
                if let Err(e) = engine.sync_source(&source, &cancel) {
                    warn!(source = %source.name, error = %format!("{:#}", e), "sync task failed");
                }
            }));
        }

        let count = handles.len() as u64;
        for handle in handles {
            let _ = handle.join();
        }
        Ok(count)
    }
}

fn apply_version_filter(
    versions: Vec<DiscoveredVersion>,
    filter: Option<&str>,
) -> Result<Vec<DiscoveredVersion>> {
    let Some(filter) = filter else {
        return Ok(versions);
    };
    let re = Regex::new(filter).with_context(|| format!("invalid version filter: {}", filter))?;
    Ok(versions
        .into_iter()
        .filter(|v| re.is_match(&v.version))
        .collect())
}

/// Background sync loop: one pass at startup, then one per interval.
pub struct SyncScheduler {
    cancel: CancellationToken,
    handle: Option<thread::JoinHandle<()>>,
}

impl SyncScheduler {
    pub fn start(engine: SyncEngine, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = thread::spawn(move || {
            loop {
                if let Err(e) = engine.sync_stale_sources(&loop_cancel) {
                    warn!(error = %format!("{:#}", e), "sync sweep failed");
                }
                if loop_cancel.wait_timeout(interval) {
                    break;
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the loop and wait for any in-flight sweep to finish.
    pub fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
