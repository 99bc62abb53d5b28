//! GitHub release and tag discovery.
//!
//! Pages the Releases API first, then the Tags API, merging the two with
//! releases winning on metadata. Rate-limit responses (403/429) mid-walk
//! keep whatever was already collected; a rate limit with nothing collected
//! is an error the sync job surfaces.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use distsmith_cancel::Deadline;
use distsmith_db::DiscoveredVersion;
use distsmith_types::VersionType;
use distsmith_version::{is_prerelease, normalize};

/// Hosted GitHub API endpoint.
pub const GITHUB_API: &str = "https://api.github.com";

/// Releases/tags per page; GitHub's maximum.
const PER_PAGE: u32 = 100;

/// Hard cap on pages walked per source; old releases beyond this add noise,
/// not value.
const MAX_PAGES: u32 = 10;

const USER_AGENT: &str = concat!("distsmith/", env!("CARGO_PKG_VERSION"));

/// Derive the API base for a repository URL: hosted GitHub uses
/// `api.github.com`, anything else (GitHub Enterprise, test servers) the
/// `/api/v3` convention on the same host.
pub fn api_base_for(repo_url: &str) -> String {
    if repo_url.contains("://github.com/") || repo_url.starts_with("github.com/") {
        return GITHUB_API.to_string();
    }
    let trimmed = repo_url.trim_end_matches('/');
    match trimmed.find("://").map(|i| i + 3) {
        Some(host_start) => match trimmed[host_start..].find('/') {
            Some(path_start) => format!("{}/api/v3", &trimmed[..host_start + path_start]),
            None => format!("{}/api/v3", trimmed),
        },
        None => format!("{}/api/v3", trimmed),
    }
}

/// Extract `(owner, repo)` from a repository URL.
pub fn parse_repo(url: &str) -> Result<(String, String)> {
    let trimmed = url
        .trim_end_matches('/')
        .trim_end_matches(".git");
    let path = match trimmed.find("://") {
        Some(i) => &trimmed[i + 3..],
        None => trimmed,
    };
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let _host = segments.next();
    let owner = segments.next();
    let repo = segments.next();
    match (owner, repo) {
        (Some(owner), Some(repo)) => Ok((owner.to_string(), repo.to_string())),
        _ => anyhow::bail!("not a repository url: {}", url),
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<AssetResponse>,
}

#[derive(Debug, Deserialize)]
struct AssetResponse {
    name: String,
    browser_download_url: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct TagResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LatestReleaseResponse {
    tag_name: String,
}

/// Blocking GitHub API client.
#[derive(Debug, Clone)]
pub struct GithubClient {
    api_base: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl GithubClient {
    pub fn new(api_base: &str, token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    /// Client for a repository URL, picking hosted vs enterprise API bases.
    pub fn for_repo(repo_url: &str, token: Option<String>, timeout: Duration) -> Self {
        Self::new(&api_base_for(repo_url), token, timeout)
    }

    fn get(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        request
    }

    /// Walk releases then tags, merged into one version list. A rate limit
    /// with partial results stops the walk and keeps them; with zero
    /// results it fails the sync.
    pub fn discover(
        &self,
        owner: &str,
        repo: &str,
        deadline: &Deadline,
    ) -> Result<Vec<DiscoveredVersion>> {
        let mut versions: Vec<DiscoveredVersion> = Vec::new();
        let mut rate_limited = false;

        'pages: for page in 1..=MAX_PAGES {
            if deadline.expired() {
                warn!(owner, repo, "release walk hit sync deadline");
                break;
            }
            let url = format!(
                "{}/repos/{}/{}/releases?per_page={}&page={}",
                self.api_base, owner, repo, PER_PAGE, page
            );
            let response = self.get(&url).send().context("releases request failed")?;
            match response.status().as_u16() {
                200 => {}
                403 | 429 => {
                    rate_limited = true;
                    break 'pages;
                }
                404 => break 'pages,
                status => anyhow::bail!("unexpected status from releases api: {}", status),
            }
            let releases: Vec<ReleaseResponse> =
                response.json().context("failed to parse releases")?;
            if releases.is_empty() {
                break;
            }
            for release in releases {
                if release.draft {
                    continue;
                }
                let version = normalize(&release.tag_name).to_string();
                if version.is_empty() {
                    continue;
                }
                let asset = release
                    .assets
                    .iter()
                    .find(|a| a.name.contains(".tar."))
                    .or(release.assets.first());
                versions.push(DiscoveredVersion {
                    version,
                    version_type: if release.prerelease {
                        VersionType::Mainline
                    } else {
                        VersionType::Stable
                    },
                    release_date: release.published_at,
                    download_url: asset.map(|a| a.browser_download_url.clone()),
                    file_size: asset.map(|a| a.size),
                    ..Default::default()
                });
            }
        }

        if !rate_limited {
            rate_limited = self.collect_tags(owner, repo, deadline, &mut versions)?;
        }

        if rate_limited && versions.is_empty() {
            anyhow::bail!("github rate limit hit with no versions collected");
        }
        if rate_limited {
            debug!(
                owner,
                repo,
                collected = versions.len(),
                "github rate limit hit, keeping partial results"
            );
        }
        Ok(versions)
    }

    /// Tags fill in versions that never got a release. Returns whether the
    /// walk was rate limited.
    fn collect_tags(
        &self,
        owner: &str,
        repo: &str,
        deadline: &Deadline,
        versions: &mut Vec<DiscoveredVersion>,
    ) -> Result<bool> {
        for page in 1..=MAX_PAGES {
            if deadline.expired() {
                return Ok(false);
            }
            let url = format!(
                "{}/repos/{}/{}/tags?per_page={}&page={}",
                self.api_base, owner, repo, PER_PAGE, page
            );
            let response = self.get(&url).send().context("tags request failed")?;
            match response.status().as_u16() {
                200 => {}
                403 | 429 => return Ok(true),
                404 => return Ok(false),
                status => anyhow::bail!("unexpected status from tags api: {}", status),
            }
            let tags: Vec<TagResponse> = response.json().context("failed to parse tags")?;
            if tags.is_empty() {
                return Ok(false);
            }
            for tag in tags {
                let version = normalize(&tag.name).to_string();
                if version.is_empty()
                    || versions.iter().any(|v| v.version == version)
                {
                    continue;
                }
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
        }
        Ok(false)
    }

    /// The tag GitHub calls the latest release, normalized; `None` when the
    /// repository has no releases.
    pub fn latest_release(&self, owner: &str, repo: &str) -> Result<Option<String>> {
        let url = format!("{}/repos/{}/{}/releases/latest", self.api_base, owner, repo);
        let response = self.get(&url).send().context("latest release request failed")?;
        match response.status().as_u16() {
            200 => {
                let latest: LatestReleaseResponse =
                    response.json().context("failed to parse latest release")?;
                Ok(Some(normalize(&latest.tag_name).to_string()))
            }
            404 => Ok(None),
            status => anyhow::bail!("unexpected status from latest release api: {}", status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_base_hosted_github() {
        assert_eq!(api_base_for("https://github.com/torvalds/linux"), GITHUB_API);
    }

    #[test]
    fn api_base_enterprise_host() {
        assert_eq!(
            api_base_for("https://git.corp.example/team/repo"),
            "https://git.corp.example/api/v3"
        );
        assert_eq!(
            api_base_for("http://127.0.0.1:8080/owner/repo"),
            "http://127.0.0.1:8080/api/v3"
        );
    }

    #[test]
    fn parse_repo_variants() {
        assert_eq!(
            parse_repo("https://github.com/cri-o/cri-o").expect("parse"),
            ("cri-o".to_string(), "cri-o".to_string())
        );
        assert_eq!(
            parse_repo("https://github.com/kdave/btrfs-progs.git/").expect("parse"),
            ("kdave".to_string(), "btrfs-progs".to_string())
        );
        assert!(parse_repo("https://github.com/onlyowner").is_err());
    }

    #[test]
    fn release_response_parsing() {
        let json = r#"[{
            "tag_name": "v1.30.0",
            "prerelease": false,
            "draft": false,
            "published_at": "2025-01-15T12:00:00Z",
            "assets": [
                {"name": "cri-o-1.30.0.tar.gz",
                 "browser_download_url": "https://example.com/cri-o-1.30.0.tar.gz",
                 "size": 1024}
            ]
        }]"#;
        let releases: Vec<ReleaseResponse> = serde_json::from_str(json).expect("parse");
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].tag_name, "v1.30.0");
        assert_eq!(releases[0].assets[0].size, 1024);
    }

    #[test]
    fn tag_response_parsing() {
        let json = r#"[{"name": "v1.29.0"}, {"name": "v1.28.0"}]"#;
        let tags: Vec<TagResponse> = serde_json::from_str(json).expect("parse");
        assert_eq!(tags.len(), 2);
    }
}
