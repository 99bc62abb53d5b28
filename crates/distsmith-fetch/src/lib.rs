//! Artifact fetching for the acquisition core.
//!
//! Four concerns live here, layered bottom-up:
//!
//! - [`urlbuild`]: concrete fetch URLs from templates
//!   (`{base_url}/{major_x}/linux-{version}.tar.xz`), plus git clone
//!   URL/ref construction.
//! - [`verify`]: reachability checks before bandwidth is committed, `HEAD`
//!   for release URLs and `git ls-remote` for tags.
//! - [`mirror`] and [`throttle`]: URL-prefix mirror rewriting, local-mirror
//!   probing, and token-bucket bandwidth limits.
//! - [`manager`]: the download scheduler, a fixed worker pool consuming a
//!   bounded priority queue with retries, cancellation, progress reporting
//!   and cache feeding.

pub mod download;
pub mod manager;
pub mod mirror;
pub mod paths;
pub mod retry;
pub mod throttle;
pub mod urlbuild;
pub mod verify;

pub use download::{FetchedFile, hash_file};
pub use manager::{DownloadManager, ManagerSettings};
pub use mirror::{MirrorResolver, local_mirror_candidate};
pub use paths::{artifact_key, filename_from_url};
pub use retry::{backoff_delay, backoff_delay_jittered};
pub use throttle::{RateLimiter, ThrottledReader};
pub use urlbuild::{GitCheckout, build_git_checkout, build_release_url, render_template};
pub use verify::{HeadInfo, git_tag_exists, http_client, transfer_client, verify_release_url};
