//! Distribution job planning and submission.
//!
//! For one build request the planner walks the distribution's component
//! selections, resolves each to `(component, source, version)` through the
//! catalog, and produces the minimal set of download jobs:
//!
//! - the same `(source, version)` twice in one batch, or already live for
//!   this distribution, appends the component to the existing job;
//! - an artifact present in the shared cache, or completed by another
//!   distribution, synthesizes an already-completed job backed by one
//!   server-side copy, with no network traffic;
//! - everything else becomes a pending job offered to the worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use distsmith_cache::ArtifactCache;
use distsmith_catalog::{Catalog, ResolvedComponent};
use distsmith_db::{DownloadStats, JobRepo, NewDownloadJob, Store};
use distsmith_fetch::{DownloadManager, artifact_key, build_git_checkout, build_release_url};
use distsmith_storage::ObjectStorage;
use distsmith_types::{
    Distribution, DownloadJob, RetrievalMethod, priority_for_category,
};

/// Job planning and watching for the build pipeline.
#[derive(Clone)]
pub struct Acquisition {
    store: Arc<Store>,
    catalog: Catalog,
    cache: Arc<ArtifactCache>,
    storage: Arc<dyn ObjectStorage>,
    manager: Arc<DownloadManager>,
    max_retries: u32,
}

impl Acquisition {
    pub(crate) fn new(
        store: Arc<Store>,
        catalog: Catalog,
        cache: Arc<ArtifactCache>,
        storage: Arc<dyn ObjectStorage>,
        manager: Arc<DownloadManager>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            catalog,
            cache,
            storage,
            manager,
            max_retries,
        }
    }

    /// Plan and submit the download jobs one distribution needs. Returns
    /// every job involved, including deduplicated and cache-satisfied ones.
    pub fn submit_distribution(&self, distribution: &Distribution) -> Result<Vec<DownloadJob>> {
        let user_id = distribution.owner_id.as_str();
        // (source_id, version) -> job id, for batch-level dedup.
        let mut batch: HashMap<(String, String), String> = HashMap::new();
        let mut jobs: Vec<DownloadJob> = Vec::new();

        for request in distribution.config.selections() {
            let resolved = match self.catalog.resolve_request(
                &request.category,
                &request.name,
                request.version.as_deref(),
                Some(user_id),
                Some(&distribution.id),
            )? {
                Some(resolved) => resolved,
                None => {
                    warn!(
                        category = %request.category,
                        name = %request.name,
                        "no resolvable component for selection, skipping"
                    );
                    continue;
                }
            };
            if !resolved.component.supports_arch(distribution.config.arch) {
                warn!(
                    component = %resolved.component.name,
                    arch = %distribution.config.arch,
                    "component does not support target architecture, skipping"
                );
                continue;
            }

            let key = (resolved.source.id.clone(), resolved.version.clone());

            // Same artifact twice in this batch: append the component.
            if let Some(job_id) = batch.get(&key) {
                let updated = self
                    .store
                    .jobs()
                    .append_component(job_id, &resolved.component.id)?;
                replace(&mut jobs, updated);
                continue;
            }
            // Already live for this distribution (resubmitted build).
            if let Some(existing) =
                self.store
                    .jobs()
                    .find_active(&distribution.id, &key.0, &key.1)?
            {
                let updated = self
                    .store
                    .jobs()
                    .append_component(&existing.id, &resolved.component.id)?;
                batch.insert(key, updated.id.clone());
                jobs.push(updated);
                continue;
            }

            let job = self.create_job(distribution, &resolved)?;
            self.manager_submit(&job);
            batch.insert(key, job.id.clone());
            jobs.push(job);
        }

        Ok(jobs)
    }

    fn create_job(
        &self,
        distribution: &Distribution,
        resolved: &ResolvedComponent,
    ) -> Result<DownloadJob> {
        let source = &resolved.source;
        let component = &resolved.component;
        let version = resolved.version.as_str();

        let resolved_url = match source.retrieval_method {
            RetrievalMethod::Release => build_release_url(source, component, version),
            RetrievalMethod::Git => build_git_checkout(source, version).clone_url,
        };
        let new_job = NewDownloadJob {
            distribution_id: distribution.id.clone(),
            owner_id: distribution.owner_id.clone(),
            component_id: component.id.clone(),
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            source_type: source.source_type(),
            retrieval_method: source.retrieval_method,
            resolved_url: resolved_url.clone(),
            version: version.to_string(),
            max_retries: self.max_retries,
            priority: priority_for_category(component.primary_category()),
        };

        // Shared-cache hit: one server-side copy, a job born completed.
        match self.cache.lookup(&source.id, version) {
            Ok(Some(entry)) => {
                let filename = basename(&entry.cache_path);
                let dst = artifact_key(
                    &distribution.owner_id,
                    &distribution.id,
                    source.retrieval_method,
                    &source.id,
                    version,
                    filename,
                );
                match self.cache.copy_to_distribution(&entry, &dst) {
                    Ok(()) => {
                        debug!(
                            component = %component.name,
                            version,
                            "cache hit, synthesizing completed job"
                        );
                        return self.store.jobs().create_cache_hit(
                            new_job,
                            &dst,
                            &entry.checksum,
                            entry.size_bytes,
                        );
                    }
                    Err(e) => warn!(
                        component = %component.name,
                        error = %format!("{:#}", e),
                        "cache copy failed, downloading fresh"
                    ),
                }
            }
            Ok(None) => {}
            // Cache failures degrade to a fresh download, never fail a build.
            Err(e) => warn!(
                component = %component.name,
                error = %format!("{:#}", e),
                "cache lookup failed, downloading fresh"
            ),
        }

        // Another distribution already completed this artifact.
        if let Some(done) =
            self.store
                .jobs()
                .find_completed_elsewhere(&source.id, version, &distribution.id)?
            && let (Some(src_path), Some(checksum)) = (&done.artifact_path, &done.checksum)
        {
            let filename = basename(src_path);
            let dst = artifact_key(
                &distribution.owner_id,
                &distribution.id,
                source.retrieval_method,
                &source.id,
                version,
                filename,
            );
            match self.storage.copy(src_path, &dst) {
                Ok(()) => {
                    debug!(
                        component = %component.name,
                        version,
                        from_distribution = %done.distribution_id,
                        "reusing completed artifact from another build"
                    );
                    return self.store.jobs().create_cache_hit(
                        new_job,
                        &dst,
                        checksum,
                        done.total_bytes,
                    );
                }
                Err(e) => warn!(
                    component = %component.name,
                    error = %format!("{:#}", e),
                    "cross-build copy failed, downloading fresh"
                ),
            }
        }

        self.store.jobs().create(new_job)
    }

    fn manager_submit(&self, job: &DownloadJob) {
        if !job.status.is_terminal() {
            self.manager.submit(&job.id);
        }
    }

    /// All jobs of one distribution, queue order.
    pub fn jobs(&self, distribution_id: &str) -> Result<Vec<DownloadJob>> {
        self.store.jobs().list_for_distribution(distribution_id)
    }

    pub fn job(&self, job_id: &str) -> Result<Option<DownloadJob>> {
        self.store.jobs().get(job_id)
    }

    /// Aggregate progress for the build pipeline's status view.
    pub fn stats(&self, distribution_id: &str) -> Result<DownloadStats> {
        self.store.jobs().stats(Some(distribution_id))
    }

    /// Preempt a job wherever it is: a live worker aborts, a queued job
    /// transitions in the store.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        self.manager.cancel_job(job_id)
    }

    pub fn repo(&self) -> JobRepo<'_> {
        self.store.jobs()
    }
}

fn replace(jobs: &mut Vec<DownloadJob>, updated: DownloadJob) {
    if let Some(slot) = jobs.iter_mut().find(|j| j.id == updated.id) {
        *slot = updated;
    } else {
        jobs.push(updated);
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
