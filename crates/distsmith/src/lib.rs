//! # distsmith
//!
//! The artifact-acquisition core of a build-to-order Linux image server.
//! Users describe a distribution (kernel, bootloader, init system,
//! filesystem, runtimes, target); this crate resolves the required upstream
//! components, discovers their versions, fetches source artifacts from
//! heterogeneous upstreams (GitHub, kernel.org, plain HTTP indexes, git),
//! deduplicates and caches them across builds, and hands artifact paths to
//! the build pipeline.
//!
//! [`Core`] wires the pieces together from a [`distsmith_config::Config`]:
//! the embedded state store, the object-storage backend, the catalog, the
//! version-sync scheduler, the download manager, and the shared artifact
//! cache. [`Acquisition`] is the build pipeline's entry point: it plans the
//! job set for one distribution (with batch, cross-build and cache
//! deduplication) and watches it.
//!
//! ```no_run
//! use distsmith::Core;
//! use distsmith_config::Config;
//!
//! let mut core = Core::new(Config::default()).expect("wire core");
//! core.start().expect("start background work");
//! // ... serve requests ...
//! core.stop();
//! ```

mod acquisition;
pub mod api;
mod core;

pub use crate::acquisition::Acquisition;
pub use crate::core::Core;
