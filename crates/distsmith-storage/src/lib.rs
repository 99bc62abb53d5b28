//! Storage backends for distsmith artifacts.
//!
//! This crate provides the [`ObjectStorage`] trait the acquisition core
//! writes artifacts through, and the filesystem adapter used by default
//! deployments. Keys are forward-slash object paths
//! (`distribution/u1/d1/components/...`); the adapter maps them under a base
//! directory, refusing anything that would escape it.
//!
//! # Example
//!
//! ```
//! use distsmith_storage::{FileStorage, ObjectStorage};
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let storage = FileStorage::new(dir.path().to_path_buf());
//!
//! let mut data: &[u8] = b"artifact bytes";
//! storage
//!     .upload("cache/artifacts/demo/1.0/demo-1.0.tar.gz", &mut data, 14, "application/gzip")
//!     .expect("upload");
//! assert!(storage.exists("cache/artifacts/demo/1.0/demo-1.0.tar.gz").expect("exists"));
//! ```

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component as PathComponent, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Backend flavor, for logging and capability decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Local filesystem under a base directory.
    #[default]
    File,
    /// S3-compatible object store (path-style addressing).
    S3,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::File => write!(f, "file"),
            StorageType::S3 => write!(f, "s3"),
        }
    }
}

impl std::str::FromStr for StorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" | "local" => Ok(StorageType::File),
            "s3" => Ok(StorageType::S3),
            _ => anyhow::bail!("unknown storage type: {}", s),
        }
    }
}

/// Metadata for a stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Narrow object-storage contract the core consumes.
///
/// Implementations must be safe to call from any worker thread.
pub trait ObjectStorage: Send + Sync {
    /// Store `size` bytes from `reader` under `key`. A short or long read is
    /// an integrity error; nothing is left behind at `key` on failure.
    fn upload(
        &self,
        key: &str,
        reader: &mut dyn Read,
        size: u64,
        content_type: &str,
    ) -> Result<()>;

    /// Open an object for streaming reads.
    fn download(&self, key: &str) -> Result<(Box<dyn Read + Send>, ObjectInfo)>;

    /// Remove an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn get_info(&self, key: &str) -> Result<ObjectInfo>;

    /// Server-side copy within the backend (no client round trip).
    fn copy(&self, src: &str, dst: &str) -> Result<()>;

    /// All keys under a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// A URL granting temporary read access to the object.
    fn presigned_url(&self, key: &str, expires_in: Duration) -> Result<String>;

    /// A stable (non-expiring) URL for UI display.
    fn web_url(&self, key: &str) -> String;

    /// Cheap health probe.
    fn ping(&self) -> Result<()>;

    fn storage_type(&self) -> StorageType;

    /// Human-readable location (base directory, bucket URL).
    fn location(&self) -> String;

    /// Capability discovery: backends whose objects are plain files expose
    /// local paths so callers can hard-link instead of copying bytes.
    fn as_local(&self) -> Option<&dyn LocalPathResolver> {
        None
    }
}

/// Optional capability: resolve an object key to a path on the local
/// filesystem.
pub trait LocalPathResolver {
    fn resolve_path(&self, key: &str) -> Result<PathBuf>;
}

/// Connection settings for an S3-compatible backend. The adapter itself is
/// provided by the deployment; the core only carries its configuration
/// surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Custom endpoint for MinIO and friends; path-style addressing is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

impl S3Config {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            anyhow::bail!("bucket name is required for s3 storage");
        }
        Ok(())
    }
}

/// Storage selection for [`build_storage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub storage_type: StorageType,
    /// Base directory for file storage.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".distsmith/objects")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::File,
            base_dir: default_base_dir(),
            s3: None,
        }
    }
}

/// Build a storage backend from configuration.
pub fn build_storage(config: &StorageConfig) -> Result<Box<dyn ObjectStorage>> {
    match config.storage_type {
        StorageType::File => Ok(Box::new(FileStorage::new(config.base_dir.clone()))),
        StorageType::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .context("s3 storage selected but [storage.s3] is missing")?;
            s3.validate()?;
            anyhow::bail!("s3 storage adapter is provided by the deployment, not the core")
        }
    }
}

/// Filesystem-backed object storage.
///
/// Objects live at `base_dir/<key>`; writes go through a `*.tmp` sibling and
/// an atomic rename.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Map a key under the base directory, rejecting traversal: absolute
    /// keys, `..` segments, and backslashes are refused.
    fn safe_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            anyhow::bail!("empty storage key");
        }
        if key.contains('\\') {
            anyhow::bail!("invalid storage key (backslash): {}", key);
        }
        let relative = Path::new(key);
        if relative.is_absolute() {
            anyhow::bail!("invalid storage key (absolute): {}", key);
        }
        for component in relative.components() {
            match component {
                PathComponent::Normal(_) => {}
                _ => anyhow::bail!("invalid storage key (traversal): {}", key),
            }
        }
        Ok(self.base_dir.join(relative))
    }

    fn info_for(&self, key: &str, path: &Path) -> Result<ObjectInfo> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to stat object: {}", path.display()))?;
        let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        Ok(ObjectInfo {
            key: key.to_string(),
            size: metadata.len(),
            content_type: content_type_for_key(key).to_string(),
            last_modified,
        })
    }
}

impl ObjectStorage for FileStorage {
    fn upload(
        &self,
        key: &str,
        reader: &mut dyn Read,
        size: u64,
        content_type: &str,
    ) -> Result<()> {
        let path = self.safe_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("tmp");
        let written = (|| -> Result<u64> {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            let written = io::copy(reader, &mut file)
                .with_context(|| format!("failed to write object: {}", tmp_path.display()))?;
            file.flush().context("failed to flush object")?;
            file.sync_all().context("failed to sync object")?;
            Ok(written)
        })();

        let written = match written {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        if written != size {
            let _ = fs::remove_file(&tmp_path);
            anyhow::bail!(
                "size mismatch uploading {}: expected {} bytes, wrote {}",
                key,
                size,
                written
            );
        }

        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename object into place: {}", path.display()))?;
        debug!(key, size, content_type, "stored object");
        Ok(())
    }

    fn download(&self, key: &str) -> Result<(Box<dyn Read + Send>, ObjectInfo)> {
        let path = self.safe_path(key)?;
        let info = self.info_for(key, &path)?;
        let file =
            File::open(&path).with_context(|| format!("failed to open object: {}", path.display()))?;
        Ok((Box::new(file), info))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.safe_path(key)?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete object: {}", path.display()))?;
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.safe_path(key)?.is_file())
    }

    fn get_info(&self, key: &str) -> Result<ObjectInfo> {
        let path = self.safe_path(key)?;
        self.info_for(key, &path)
    }

    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let src_path = self.safe_path(src)?;
        let dst_path = self.safe_path(dst)?;
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        if dst_path.exists() {
            fs::remove_file(&dst_path)
                .with_context(|| format!("failed to replace object: {}", dst_path.display()))?;
        }

        // Hard link when both ends share a filesystem; byte copy otherwise.
        match fs::hard_link(&src_path, &dst_path) {
            Ok(()) => Ok(()),
            Err(link_err) => {
                debug!(src, dst, error = %link_err, "hard link failed, copying bytes");
                fs::copy(&src_path, &dst_path)
                    .with_context(|| format!("failed to copy {} to {}", src, dst))?;
                Ok(())
            }
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = if prefix.is_empty() {
            self.base_dir.clone()
        } else {
            self.safe_path(prefix)?
        };
        let mut keys = Vec::new();
        if !base.exists() {
            return Ok(keys);
        }

        fn walk(dir: &Path, root: &Path, keys: &mut Vec<String>) -> Result<()> {
            for entry in fs::read_dir(dir)
                .with_context(|| format!("failed to read dir: {}", dir.display()))?
            {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, root, keys)?;
                } else if let Ok(relative) = path.strip_prefix(root)
                    && let Some(s) = relative.to_str()
                {
                    keys.push(s.replace('\\', "/"));
                }
            }
            Ok(())
        }

        walk(&base, &self.base_dir, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn presigned_url(&self, key: &str, _expires_in: Duration) -> Result<String> {
        // Local files need no signature; hand back the direct path URL.
        let path = self.safe_path(key)?;
        Ok(format!("file://{}", path.display()))
    }

    fn web_url(&self, key: &str) -> String {
        format!("file://{}", self.base_dir.join(key).display())
    }

    fn ping(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "storage base directory is not writable: {}",
                self.base_dir.display()
            )
        })?;
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }

    fn location(&self) -> String {
        self.base_dir.display().to_string()
    }

    fn as_local(&self) -> Option<&dyn LocalPathResolver> {
        Some(self)
    }
}

impl LocalPathResolver for FileStorage {
    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        self.safe_path(key)
    }
}

/// Content type by file extension; unknown extensions are octet-stream.
pub fn content_type_for_key(key: &str) -> &'static str {
    let lower = key.to_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        "application/gzip"
    } else if lower.ends_with(".tar.xz") {
        "application/x-xz"
    } else if lower.ends_with(".tar.bz2") {
        "application/x-bzip2"
    } else if lower.ends_with(".zip") {
        "application/zip"
    } else if lower.ends_with(".tar") {
        "application/x-tar"
    } else {
        "application/octet-stream"
    }
}
