//! # Types
//!
//! Core domain types for distsmith: the component catalog, upstream sources,
//! discovered versions, download jobs, artifact cache entries, and mirror
//! configuration, plus the closed status enumerations shared by every layer.
//!
//! ## Serialization
//!
//! All types implement `Serialize`/`Deserialize`. Status fields are closed
//! enumerations (`rename_all` snake/kebab case); unknown values are rejected
//! at the boundary rather than coerced. Timestamps are `chrono::DateTime<Utc>`.
//!
//! ## Identity
//!
//! Entities carry opaque string identifiers produced by [`new_id`] (UUID v4).
//! Nothing in the system parses an id; equality and foreign keys are the only
//! operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

mod distribution;
mod error;

pub use distribution::{
    BuildTarget, ComponentRequest, ComponentSelection, Distribution, DistributionConfig,
    FilesystemSelection, KernelSelection, SecuritySelection,
};
pub use error::CoreError;

/// Generate a fresh opaque entity id (UUID v4 rendered as a string).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds).
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// How a component's effective version is chosen when a build does not pin one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionRule {
    /// Always use the component's stored `default_version`.
    Pinned,
    /// Track the newest stable version discovered for the effective source.
    #[default]
    LatestStable,
    /// Track the newest longterm (LTS) version discovered for the effective source.
    LatestLts,
}

impl std::fmt::Display for VersionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionRule::Pinned => write!(f, "pinned"),
            VersionRule::LatestStable => write!(f, "latest-stable"),
            VersionRule::LatestLts => write!(f, "latest-lts"),
        }
    }
}

impl std::str::FromStr for VersionRule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pinned" => Ok(VersionRule::Pinned),
            "latest-stable" => Ok(VersionRule::LatestStable),
            "latest-lts" => Ok(VersionRule::LatestLts),
            other => Err(CoreError::InvalidInput(format!(
                "unknown version rule: {}",
                other
            ))),
        }
    }
}

/// How artifacts are fetched from an upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    /// HTTP GET of a release tarball.
    #[default]
    Release,
    /// Shallow clone of a tag, archived server-side.
    Git,
}

impl std::fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrievalMethod::Release => write!(f, "release"),
            RetrievalMethod::Git => write!(f, "git"),
        }
    }
}

impl std::str::FromStr for RetrievalMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "release" => Ok(RetrievalMethod::Release),
            "git" => Ok(RetrievalMethod::Git),
            other => Err(CoreError::InvalidInput(format!(
                "unknown retrieval method: {}",
                other
            ))),
        }
    }
}

/// Whether a source (and the jobs it produces) is a system default or user-supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Default,
    User,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Default => write!(f, "default"),
            SourceType::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(SourceType::Default),
            "user" => Ok(SourceType::User),
            other => Err(CoreError::InvalidInput(format!(
                "unknown source type: {}",
                other
            ))),
        }
    }
}

/// Listing scope for catalog queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// System-seeded resources only.
    System,
    /// A specific user's resources only.
    User,
    /// System resources plus one user's resources.
    All,
}

/// Classification of a discovered version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionType {
    /// Development/mainline release (`-rc` builds).
    Mainline,
    /// Regular stable release.
    #[default]
    Stable,
    /// Long-term support series.
    Longterm,
    /// linux-next snapshot.
    LinuxNext,
}

impl std::fmt::Display for VersionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionType::Mainline => write!(f, "mainline"),
            VersionType::Stable => write!(f, "stable"),
            VersionType::Longterm => write!(f, "longterm"),
            VersionType::LinuxNext => write!(f, "linux-next"),
        }
    }
}

impl std::str::FromStr for VersionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainline" => Ok(VersionType::Mainline),
            "stable" => Ok(VersionType::Stable),
            "longterm" => Ok(VersionType::Longterm),
            "linux-next" => Ok(VersionType::LinuxNext),
            other => Err(CoreError::InvalidInput(format!(
                "unknown version type: {}",
                other
            ))),
        }
    }
}

/// Lifecycle of a download job.
///
/// ```text
/// pending -> verifying -> downloading -> completed
///                     \->  failed (retry_count < max_retries -> pending)
///                     \->  cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadJobStatus {
    #[default]
    Pending,
    Verifying,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadJobStatus {
    /// Terminal states carry a `completed_at` timestamp and never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadJobStatus::Completed | DownloadJobStatus::Failed | DownloadJobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DownloadJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DownloadJobStatus::Pending => "pending",
            DownloadJobStatus::Verifying => "verifying",
            DownloadJobStatus::Downloading => "downloading",
            DownloadJobStatus::Completed => "completed",
            DownloadJobStatus::Failed => "failed",
            DownloadJobStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DownloadJobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DownloadJobStatus::Pending),
            "verifying" => Ok(DownloadJobStatus::Verifying),
            "downloading" => Ok(DownloadJobStatus::Downloading),
            "completed" => Ok(DownloadJobStatus::Completed),
            "failed" => Ok(DownloadJobStatus::Failed),
            "cancelled" => Ok(DownloadJobStatus::Cancelled),
            other => Err(CoreError::InvalidInput(format!(
                "unknown download job status: {}",
                other
            ))),
        }
    }
}

/// Lifecycle of a version-discovery sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for SyncJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncJobStatus::Pending => "pending",
            SyncJobStatus::Running => "running",
            SyncJobStatus::Completed => "completed",
            SyncJobStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SyncJobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncJobStatus::Pending),
            "running" => Ok(SyncJobStatus::Running),
            "completed" => Ok(SyncJobStatus::Completed),
            "failed" => Ok(SyncJobStatus::Failed),
            other => Err(CoreError::InvalidInput(format!(
                "unknown sync job status: {}",
                other
            ))),
        }
    }
}

/// Kernel configuration strategy for a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelConfigMode {
    #[default]
    Defconfig,
    DefconfigOptions,
    Custom,
}

/// Output image format for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    #[default]
    Raw,
    Qcow2,
    Iso,
}

/// CPU architectures a component can target. An empty support list means "all".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetArch {
    X86_64,
    Aarch64,
    Riscv64,
    Armv7,
}

impl std::fmt::Display for TargetArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetArch::X86_64 => "x86_64",
            TargetArch::Aarch64 => "aarch64",
            TargetArch::Riscv64 => "riscv64",
            TargetArch::Armv7 => "armv7",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TargetArch {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "amd64" => Ok(TargetArch::X86_64),
            "aarch64" | "arm64" => Ok(TargetArch::Aarch64),
            "riscv64" => Ok(TargetArch::Riscv64),
            "armv7" => Ok(TargetArch::Armv7),
            other => Err(CoreError::InvalidInput(format!(
                "unknown target architecture: {}",
                other
            ))),
        }
    }
}

/// The authenticated principal a catalog mutation runs as.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    /// User id, absent for anonymous reads.
    pub user_id: Option<String>,
    /// Admins may mutate system resources and other users' resources.
    pub is_admin: bool,
}

impl Actor {
    /// An admin principal.
    pub fn admin(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            is_admin: true,
        }
    }

    /// A regular user principal.
    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            is_admin: false,
        }
    }
}

/// A buildable piece of a target distribution (kernel, bootloader, init, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    /// Unique machine name, e.g. `kernel-source` or `userspace-btrfs-progs`.
    pub name: String,
    /// Non-empty, ordered category list; the first entry is the primary
    /// category and drives download priority.
    pub categories: Vec<String>,
    pub display_name: String,
    pub description: String,
    /// Filename pattern of the released artifact, e.g. `linux-{version}.tar.xz`.
    pub artifact_pattern: Option<String>,
    /// Fallback URL template when the source does not carry its own.
    pub default_url_template: Option<String>,
    /// Template used when the source URL points at a known forge (GitHub, GitLab).
    pub forge_url_template: Option<String>,
    pub is_optional: bool,
    /// System components are seeded by migrations and have no owner.
    pub is_system: bool,
    pub owner_id: Option<String>,
    pub is_kernel_module: bool,
    pub is_userspace: bool,
    pub default_version: Option<String>,
    pub default_version_rule: VersionRule,
    /// Architectures this component supports; empty means all.
    pub supported_architectures: Vec<TargetArch>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Component {
    /// The primary category (first entry). Categories are validated non-empty
    /// at the repository boundary.
    pub fn primary_category(&self) -> &str {
        self.categories.first().map(String::as_str).unwrap_or("")
    }

    /// Whether this component can be built for `arch`. An empty support list
    /// means every architecture.
    pub fn supports_arch(&self, arch: TargetArch) -> bool {
        self.supported_architectures.is_empty() || self.supported_architectures.contains(&arch)
    }
}

/// Download priority derived from a component's primary category: the kernel
/// outranks the bootloader, which outranks init; everything else is 0.
pub fn priority_for_category(primary_category: &str) -> i64 {
    match primary_category {
        "core" => 10,
        "bootloader" => 5,
        "init" => 3,
        _ => 0,
    }
}

/// A remote provider of versions and artifacts for one or more components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSource {
    pub id: String,
    pub name: String,
    /// Base URL: a GitHub repository, a kernel.org directory, or a plain index.
    pub url: String,
    /// Ids of the components this source can serve.
    pub component_ids: Vec<String>,
    pub retrieval_method: RetrievalMethod,
    /// Download URL template; overrides any component-level template.
    pub url_template: Option<String>,
    pub forge_type: Option<String>,
    /// Optional regex applied to discovered versions before they are stored.
    pub version_filter: Option<String>,
    pub default_version: Option<String>,
    /// Lower number wins when several sources serve the same component.
    pub priority: i64,
    pub enabled: bool,
    pub is_system: bool,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UpstreamSource {
    /// The `SourceType` label stamped onto jobs produced from this source.
    pub fn source_type(&self) -> SourceType {
        if self.is_system {
            SourceType::Default
        } else {
            SourceType::User
        }
    }

    /// Whether this source is bound to the given component.
    pub fn serves(&self, component_id: &str) -> bool {
        self.component_ids.iter().any(|id| id == component_id)
    }
}

/// A version discovered on an upstream source. Unique on `(source_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceVersion {
    pub id: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub version: String,
    pub version_type: VersionType,
    pub release_date: Option<DateTime<Utc>>,
    pub download_url: Option<String>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub file_size: Option<u64>,
    pub discovered_at: DateTime<Utc>,
}

/// A single artifact acquisition tracked in the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub distribution_id: String,
    pub owner_id: String,
    /// The component that first requested this artifact.
    pub component_id: String,
    /// Every component sharing the artifact; always contains `component_id`,
    /// never contains duplicates.
    pub component_ids: Vec<String>,
    pub source_id: String,
    pub source_name: String,
    pub source_type: SourceType,
    pub retrieval_method: RetrievalMethod,
    pub resolved_url: String,
    pub version: String,
    pub status: DownloadJobStatus,
    pub progress_bytes: u64,
    /// 0 when the upstream did not report a length.
    pub total_bytes: u64,
    pub artifact_path: Option<String>,
    pub checksum: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: i64,
    /// True when the artifact was served from the shared cache or another
    /// build's completed job, without network traffic.
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    /// Percentage for progress displays; 0 when the total is unknown.
    pub fn progress_percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.progress_bytes.saturating_mul(100)) / self.total_bytes).min(100) as u8
    }
}

/// An entry in the shared content-addressed artifact cache.
/// Unique on `(source_id, version)`; LRU ordering is by `last_used_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactCacheEntry {
    pub id: String,
    pub source_id: String,
    pub version: String,
    pub checksum: String,
    pub cache_path: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub resolved_url: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u64,
}

/// A URL-prefix rewrite redirecting downloads to an alternate origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfigEntry {
    pub id: String,
    pub name: String,
    /// Prefix matched against resolved URLs (longest enabled prefix wins).
    pub url_prefix: String,
    /// Replacement for the matched prefix.
    pub mirror_url: String,
    pub priority: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One run of the version-discovery engine against a single source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub source_id: String,
    pub status: SyncJobStatus,
    pub versions_found: u64,
    pub versions_new: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A per-distribution pin of one component to a specific upstream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistSourceOverride {
    pub id: String,
    pub distribution_id: String,
    pub component_id: String,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
}
