//! Artifact key layout and filename derivation.

use distsmith_types::RetrievalMethod;

/// The basename of a download URL, with query strings stripped; falls back
/// to a synthesized `{source_id}-{version}.tar.gz` when the URL has no
/// usable basename.
pub fn filename_from_url(url: &str, source_id: &str, version: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    // Drop the scheme and host so a bare origin never yields the hostname.
    let path = match without_query.find("://") {
        Some(i) => &without_query[i + 3..],
        None => without_query,
    };
    let path = path.trim_end_matches('/');
    let basename = match path.find('/') {
        Some(_) => path.rsplit('/').next().unwrap_or(""),
        None => "",
    };
    if basename.is_empty() || !basename.contains('.') {
        format!("{}-{}.tar.gz", source_id, version)
    } else {
        basename.to_string()
    }
}

/// Storage key for a distribution's artifact:
/// `distribution/{owner}/{distribution}/{components|sources}/{source}/{version}/{filename}`.
/// Git checkouts land under `sources/`, release tarballs under `components/`.
pub fn artifact_key(
    owner_id: &str,
    distribution_id: &str,
    method: RetrievalMethod,
    source_id: &str,
    version: &str,
    filename: &str,
) -> String {
    let kind = match method {
        RetrievalMethod::Release => "components",
        RetrievalMethod::Git => "sources",
    };
    format!(
        "distribution/{}/{}/{}/{}/{}/{}",
        owner_id, distribution_id, kind, source_id, version, filename
    )
}
