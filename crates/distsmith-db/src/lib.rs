//! Embedded state store for the acquisition core.
//!
//! One in-memory SQLite database holds every table: the component and
//! upstream catalogs, discovered versions, download jobs, the artifact cache
//! index, mirror configuration, sync jobs, and key/value settings. Access
//! goes through a single connection behind a mutex (exactly one writer, no
//! table-level lock contention) and persistence is a periodic, plus
//! shutdown-time, snapshot to a single file on disk, written atomically.
//!
//! Schema management is a numbered, idempotent migration sequence
//! ([`migrations`]); migrations are the only path that seeds system
//! components and system upstream sources.
//!
//! Each entity gets a named repository handle off [`Store`]:
//!
//! ```
//! use distsmith_db::Store;
//!
//! let store = Store::open_in_memory().expect("open");
//! let kernel = store
//!     .components()
//!     .get_by_name("kernel-source")
//!     .expect("query")
//!     .expect("seeded");
//! assert!(kernel.is_system);
//! ```

mod cache_entries;
mod components;
mod jobs;
mod migrations;
mod mirrors;
mod overrides;
mod sources;
mod store;
mod sync_jobs;
mod util;
mod versions;

pub use cache_entries::CacheEntryRepo;
pub use components::{ComponentRepo, NewComponent};
pub use jobs::{DownloadStats, JobRepo, NewDownloadJob};
pub use migrations::{Migration, migrations};
pub use mirrors::{MirrorRepo, NewMirror};
pub use overrides::OverrideRepo;
pub use sources::{NewUpstreamSource, SourceRepo};
pub use store::{Store, StoreOptions};
pub use sync_jobs::SyncJobRepo;
pub use versions::{DiscoveredVersion, VersionRepo};
