//! Reachability verification before committing bandwidth.
//!
//! Release URLs get a `HEAD`; existence means HTTP 200, and the response
//! headers carry size hints. Git sources get a `git ls-remote` for the tag;
//! existence means non-empty output. Verification failures are recoverable:
//! the scheduler retries them.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use tracing::debug;

/// What a `HEAD` probe learned about a release URL.
#[derive(Debug, Clone, Default)]
pub struct HeadInfo {
    pub exists: bool,
    pub status: u16,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Build the HTTP client used for verification probes. The timeout bounds
/// the whole request; probes are header-only and must fail fast.
pub fn http_client(timeout: Duration, proxy_url: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .user_agent(concat!("distsmith/", env!("CARGO_PKG_VERSION")));
    if let Some(proxy_url) = proxy_url {
        builder = builder.proxy(
            reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("invalid proxy url: {}", proxy_url))?,
        );
    }
    builder.build().context("failed to build http client")
}

/// Build the HTTP client used for artifact transfers: connects are bounded,
/// the body read is not. A multi-gigabyte tarball takes as long as it
/// takes; only the job's cancellation token cuts it short.
pub fn transfer_client(connect_timeout: Duration, proxy_url: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(None)
        .user_agent(concat!("distsmith/", env!("CARGO_PKG_VERSION")));
    if let Some(proxy_url) = proxy_url {
        builder = builder.proxy(
            reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("invalid proxy url: {}", proxy_url))?,
        );
    }
    builder.build().context("failed to build http client")
}

/// `HEAD` a release URL. Network errors are `Err` (retryable); a reachable
/// server answering anything but 200 comes back as `exists: false`.
pub fn verify_release_url(client: &Client, url: &str) -> Result<HeadInfo> {
    let response = client
        .head(url)
        .send()
        .with_context(|| format!("verification request failed: {}", url))?;

    let status = response.status().as_u16();
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let info = HeadInfo {
        exists: status == 200,
        status,
        content_length: header("content-length").and_then(|v| v.parse().ok()),
        etag: header("etag"),
        last_modified: header("last-modified"),
    };
    debug!(url, status, exists = info.exists, "release url verified");
    Ok(info)
}

/// Check that `refs/tags/<tag>` exists on a git remote.
pub fn git_tag_exists(clone_url: &str, tag: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["ls-remote", clone_url, &format!("refs/tags/{}", tag)])
        .output()
        .context("failed to run git ls-remote")?;

    if !output.status.success() {
        anyhow::bail!(
            "git ls-remote failed for {}: {}",
            clone_url,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let exists = !output.stdout.is_empty();
    debug!(clone_url, tag, exists, "git tag verified");
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tiny_http::{Response, Server, StatusCode};

    #[test]
    fn head_200_exists_with_length() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let url = format!("http://{}/artifact.tar.gz", server.server_addr());
        let handle = thread::spawn(move || {
            let request = server.recv().expect("request");
            assert_eq!(request.method().as_str(), "HEAD");
            // tiny_http derives Content-Length from the body it is handed.
            let response = Response::from_data(vec![0u8; 4096]);
            request.respond(response).expect("respond");
        });

        let client = http_client(Duration::from_secs(5), None).expect("client");
        let info = verify_release_url(&client, &url).expect("verify");
        handle.join().expect("server");

        assert!(info.exists);
        assert_eq!(info.content_length, Some(4096));
    }

    #[test]
    fn head_404_does_not_exist() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let url = format!("http://{}/missing.tar.gz", server.server_addr());
        let handle = thread::spawn(move || {
            let request = server.recv().expect("request");
            request
                .respond(Response::empty(StatusCode(404)))
                .expect("respond");
        });

        let client = http_client(Duration::from_secs(5), None).expect("client");
        let info = verify_release_url(&client, &url).expect("verify");
        handle.join().expect("server");

        assert!(!info.exists);
        assert_eq!(info.status, 404);
    }

    #[test]
    fn unreachable_host_is_an_error() {
        let client = http_client(Duration::from_millis(300), None).expect("client");
        // Reserved TEST-NET address; nothing listens there.
        assert!(verify_release_url(&client, "http://192.0.2.1:9/x").is_err());
    }

    #[test]
    fn invalid_proxy_is_rejected() {
        assert!(http_client(Duration::from_secs(1), Some("::not a url::")).is_err());
    }
}
