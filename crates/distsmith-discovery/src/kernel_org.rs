//! kernel.org index scraping.
//!
//! The kernel CDN publishes plain directory listings: the top level holds
//! `vN.x/` series directories, each holding `linux-<version>.tar.xz`
//! tarballs. Versions are tagged mainline (`-rc`), longterm (LTS series) or
//! stable.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::warn;

use distsmith_cancel::Deadline;
use distsmith_db::DiscoveredVersion;
use distsmith_version::classify_kernel_version;

const USER_AGENT: &str = concat!("distsmith/", env!("CARGO_PKG_VERSION"));

/// Blocking scraper for a kernel.org-style directory tree.
#[derive(Debug, Clone)]
pub struct KernelOrgClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl KernelOrgClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Scrape the series index, then each series directory.
    pub fn discover(&self, deadline: &Deadline) -> Result<Vec<DiscoveredVersion>> {
        let index = self
            .fetch(&self.base_url)
            .context("failed to fetch kernel index")?;

        let series_re = Regex::new(r#"href="(v\d+\.x)/""#).expect("static regex");
        let series: BTreeSet<String> = series_re
            .captures_iter(&index)
            .map(|caps| caps[1].to_string())
            .collect();

        let tarball_re =
            Regex::new(r#"linux-([0-9][0-9a-zA-Z.\-]*?)\.tar\.xz"#).expect("static regex");

        let mut seen = BTreeSet::new();
        let mut versions = Vec::new();
        for dir in series {
            if deadline.expired() {
                warn!(dir, "kernel index walk hit sync deadline");
                break;
            }
            let url = format!("{}/{}/", self.base_url, dir);
            let listing = match self.fetch(&url) {
                Ok(listing) => listing,
                Err(e) => {
                    // One unreadable series directory does not sink the sync.
                    warn!(dir, error = %format!("{:#}", e), "failed to list kernel series");
                    continue;
                }
            };
            let download_base = format!("{}/{}", self.base_url, dir);
            for caps in tarball_re.captures_iter(&listing) {
                let version = caps[1].to_string();
                if !seen.insert(version.clone()) {
                    continue;
                }
                versions.push(DiscoveredVersion {
                    version_type: classify_kernel_version(&version),
                    download_url: Some(format!("{}/linux-{}.tar.xz", download_base, version)),
                    version,
                    ..Default::default()
                });
            }
        }
        Ok(versions)
    }

    fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request failed: {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("unexpected status {} from {}", response.status(), url);
        }
        response.text().context("failed to read index body")
    }
}
