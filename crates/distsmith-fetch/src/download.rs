//! Transfer primitives: streamed HTTP download with hashing and throttling,
//! local-file ingestion, and git shallow-clone archiving.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

use distsmith_cancel::CancellationToken;
use distsmith_types::CoreError;

use crate::throttle::{RateLimiter, READ_CHUNK, ThrottledReader};
use crate::urlbuild::GitCheckout;

/// A file produced by one transfer, hashed while it was written.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

/// Copy `reader` to `dest`, hashing as bytes flow and reporting the running
/// byte count. The partial file is removed on any failure.
pub fn hash_copy(
    mut reader: impl Read,
    dest: &Path,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u64),
) -> Result<FetchedFile> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    let result = (|| -> Result<FetchedFile> {
        let mut file = File::create(dest)
            .with_context(|| format!("failed to create temp file: {}", dest.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled.into());
            }
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    return Err(CoreError::Cancelled.into());
                }
                Err(e) => return Err(anyhow::Error::from(e).context("read failed mid-transfer")),
            };
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).context("write failed mid-transfer")?;
            total += n as u64;
            on_progress(total);
        }

        file.flush().context("failed to flush transfer")?;
        Ok(FetchedFile {
            path: dest.to_path_buf(),
            size: total,
            checksum: hex::encode(hasher.finalize()),
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

/// Stream a release URL into `dest` through both rate limiters.
pub fn download_http(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    global: Arc<RateLimiter>,
    worker: Arc<RateLimiter>,
    cancel: &CancellationToken,
    on_progress: impl FnMut(u64),
) -> Result<FetchedFile> {
    let response = client
        .get(url)
        .send()
        .with_context(|| format!("download request failed: {}", url))?;
    if !response.status().is_success() {
        anyhow::bail!("unexpected status {} downloading {}", response.status(), url);
    }

    let reader = ThrottledReader::new(response, global, worker, cancel.clone());
    let fetched = hash_copy(reader, dest, cancel, on_progress)?;
    debug!(url, bytes = fetched.size, "download finished");
    Ok(fetched)
}

/// Ingest a pre-seeded local-mirror file into `dest`, hashing on the way.
pub fn ingest_local_file(
    src: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    on_progress: impl FnMut(u64),
) -> Result<FetchedFile> {
    let file =
        File::open(src).with_context(|| format!("failed to open local mirror file: {}", src.display()))?;
    hash_copy(file, dest, cancel, on_progress)
}

/// Shallow-clone a tag and pack the checkout as a gzipped tarball at
/// `dest`. The `.git` directory is left out of the archive.
pub fn archive_git_checkout(
    checkout: &GitCheckout,
    archive_root: &str,
    work_dir: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<FetchedFile> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled.into());
    }
    fs::create_dir_all(work_dir)
        .with_context(|| format!("failed to create work dir: {}", work_dir.display()))?;
    let clone_dir = work_dir.join(format!("clone-{}", distsmith_types::new_id()));

    let result = (|| -> Result<FetchedFile> {
        let output = Command::new("git")
            .args([
                "clone",
                "--depth",
                "1",
                "--branch",
                &checkout.reference,
                &checkout.clone_url,
            ])
            .arg(&clone_dir)
            .output()
            .context("failed to run git clone")?;
        if !output.status.success() {
            anyhow::bail!(
                "git clone failed for {} at {}: {}",
                checkout.clone_url,
                checkout.reference,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled.into());
        }

        // Source archives carry the worktree, not repository internals.
        let _ = fs::remove_dir_all(clone_dir.join(".git"));

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        {
            let file = File::create(dest)
                .with_context(|| format!("failed to create archive: {}", dest.display()))?;
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all(archive_root, &clone_dir)
                .context("failed to pack checkout")?;
            let encoder = builder.into_inner().context("failed to finish archive")?;
            encoder.finish().context("failed to finish gzip stream")?;
        }

        let fetched = hash_file(dest)?;
        debug!(
            clone_url = %checkout.clone_url,
            reference = %checkout.reference,
            bytes = fetched.size,
            "git checkout archived"
        );
        Ok(fetched)
    })();

    let _ = fs::remove_dir_all(&clone_dir);
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

/// SHA-256 and size of an existing file.
pub fn hash_file(path: &Path) -> Result<FetchedFile> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open file: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf).context("failed to read file")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok(FetchedFile {
        path: path.to_path_buf(),
        size: total,
        checksum: hex::encode(hasher.finalize()),
    })
}
