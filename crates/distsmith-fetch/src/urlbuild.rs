//! Concrete fetch-URL construction from templates.
//!
//! Template selection order: the source's own template, then the
//! component's forge-specific template when the source URL points at a
//! known forge, then the component's default template; with no template at
//! all the source URL itself is the download URL.

use distsmith_types::{Component, UpstreamSource};
use distsmith_version::VersionParts;

/// `{base_url}`: the source URL with trailing `/` and `.git` stripped.
pub fn base_url(source_url: &str) -> &str {
    source_url.trim_end_matches('/').trim_end_matches(".git")
}

/// Whether the source URL points at a forge the component may carry a
/// dedicated template for.
pub fn is_forge(source: &UpstreamSource) -> bool {
    source.forge_type.is_some()
        || source.url.contains("github.com")
        || source.url.contains("gitlab")
}

/// Substitute every placeholder in `template`.
pub fn render_template(template: &str, source_url: &str, version: &str) -> String {
    let parts = VersionParts::parse(version);
    template
        .replace("{base_url}", base_url(source_url))
        .replace("{version}", version)
        .replace("{tag}", &format!("v{}", version))
        .replace("{tag_short}", &format!("v{}", parts.short()))
        .replace("{tag_compact}", &format!("v{}", version.replace('.', "")))
        .replace("{major_x}", &parts.major_x())
        .replace("{major}", &parts.major.to_string())
        .replace("{minor}", &parts.minor.to_string())
        .replace("{patch}", &parts.patch.to_string())
}

/// The release download URL for `(source, component, version)`.
pub fn build_release_url(
    source: &UpstreamSource,
    component: &Component,
    version: &str,
) -> String {
    let template = source
        .url_template
        .as_deref()
        .or_else(|| {
            if is_forge(source) {
                component.forge_url_template.as_deref()
            } else {
                None
            }
        })
        .or(component.default_url_template.as_deref());

    match template {
        Some(template) => render_template(template, &source.url, version),
        None => base_url(&source.url).to_string(),
    }
}

/// A git checkout target: clone URL plus tag ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCheckout {
    pub clone_url: String,
    pub reference: String,
}

/// The clone URL (with a `.git` suffix on remote URLs) and `v<version>` ref
/// for git retrieval.
pub fn build_git_checkout(source: &UpstreamSource, version: &str) -> GitCheckout {
    let trimmed = source.url.trim_end_matches('/');
    let clone_url = if trimmed.ends_with(".git") || !trimmed.contains("://") {
        // Local paths and already-suffixed URLs go through untouched.
        trimmed.to_string()
    } else {
        format!("{}.git", trimmed)
    };
    GitCheckout {
        clone_url,
        reference: format!("v{}", version),
    }
}
