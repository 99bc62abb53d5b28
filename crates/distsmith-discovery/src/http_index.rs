//! Generic HTTP index discovery.
//!
//! Works for plain `ftp.gnu.org`-style listings: versions are extracted
//! from `name-<version>.tar.{gz,xz,bz2}` / `.zip` artifact links and from
//! bare `v?<version>/` directory links.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use distsmith_db::DiscoveredVersion;
use distsmith_types::VersionType;
use distsmith_version::is_prerelease;

const USER_AGENT: &str = concat!("distsmith/", env!("CARGO_PKG_VERSION"));

/// Blocking client for a plain HTTP index page.
#[derive(Debug, Clone)]
pub struct HttpIndexClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpIndexClient {
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

    pub fn discover(&self) -> Result<Vec<DiscoveredVersion>> {
        let response = self
            .client
            .get(&self.base_url)
            .send()
            .with_context(|| format!("request failed: {}", self.base_url))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "unexpected status {} from {}",
                response.status(),
                self.base_url
            );
        }
        let body = response.text().context("failed to read index body")?;
        Ok(extract_versions(&body))
    }
}

/// Pull version strings out of an index page.
pub fn extract_versions(body: &str) -> Vec<DiscoveredVersion> {
    let artifact_re = Regex::new(
        r"[A-Za-z0-9_.+]+-v?([0-9][0-9A-Za-z.\-]*?)\.(?:tar\.gz|tar\.xz|tar\.bz2|zip)",
    )
    .expect("static regex");
    let dir_re = Regex::new(r#"href="v?([0-9]+(?:\.[0-9]+)+)/""#).expect("static regex");

    let mut seen = BTreeSet::new();
    let mut versions = Vec::new();
    let mut push = |version: String| {
        if seen.insert(version.clone()) {
            versions.push(DiscoveredVersion {
                version_type: if is_prerelease(&version) {
                    VersionType::Mainline
                } else {
                    VersionType::Stable
                },
                version,
                ..Default::default()
            });
        }
    };

    for caps in artifact_re.captures_iter(body) {
        push(caps[1].to_string());
    }
    for caps in dir_re.captures_iter(body) {
        push(caps[1].to_string());
    }
    versions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tarball_versions() {
        let body = r#"
            <a href="grub-2.12.tar.xz">grub-2.12.tar.xz</a>
            <a href="grub-2.06.tar.gz">grub-2.06.tar.gz</a>
            <a href="grub-2.06.tar.gz.sig">grub-2.06.tar.gz.sig</a>
        "#;
        let versions = extract_versions(body);
        let names: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(names, vec!["2.12", "2.06"]);
    }

    #[test]
    fn extracts_directory_versions() {
        let body = r#"<a href="v1.2.3/">v1.2.3/</a> <a href="2.0.1/">2.0.1/</a> <a href="other/">other</a>"#;
        let versions = extract_versions(body);
        let names: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(names, vec!["1.2.3", "2.0.1"]);
    }

    #[test]
    fn strips_v_prefix_and_handles_bz2_zip() {
        let body = r#"
            <a href="tool-v3.1.0.zip">tool-v3.1.0.zip</a>
            <a href="tool-3.0.9.tar.bz2">tool-3.0.9.tar.bz2</a>
        "#;
        let versions = extract_versions(body);
        let names: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(names, vec!["3.1.0", "3.0.9"]);
    }

    #[test]
    fn prerelease_versions_are_tagged_mainline() {
        let body = r#"<a href="qemu-9.0.0-rc1.tar.xz">x</a>"#;
        let versions = extract_versions(body);
        assert_eq!(versions[0].version, "9.0.0-rc1");
        assert_eq!(versions[0].version_type, VersionType::Mainline);
    }

    #[test]
    fn duplicates_collapse() {
        let body = r#"
            <a href="demo-1.0.tar.gz">demo-1.0.tar.gz</a>
            <a href="demo-1.0.tar.gz">demo-1.0.tar.gz (mirror)</a>
        "#;
        assert_eq!(extract_versions(body).len(), 1);
    }
}
