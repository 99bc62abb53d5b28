//! Version-string ordering and classification for upstream discovery.
//!
//! Upstreams publish versions in loosely dotted forms (`6.12.4`, `v2.06`,
//! `1.2.3-rc2`, `2.39`). This crate provides the component-wise comparator
//! used to order them, prerelease detection, kernel release classification
//! (mainline / stable / longterm), and the numeric part extraction the URL
//! template builder relies on.
//!
//! The comparator splits on `.` and compares each component numerically
//! first, then by suffix, where an empty suffix beats a non-empty one
//! (a stable release outranks its prereleases). It deliberately does not
//! implement full SemVer pre-release identifier precedence.

use std::cmp::Ordering;

use distsmith_types::VersionType;

/// Kernel series maintained as longterm (LTS) releases.
pub const KERNEL_LTS_SERIES: &[&str] = &[
    "6.12", "6.6", "6.1", "5.15", "5.10", "5.4", "4.19", "4.14",
];

/// Markers that tag a version string as a prerelease.
const PRERELEASE_MARKERS: &[&str] = &[
    "-rc", "-alpha", "-beta", "-dev", "-pre", ".rc", "_rc", "alpha", "beta",
];

/// Numeric pieces of a version string, with absent parts defaulting to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionParts {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl VersionParts {
    /// Extract `major.minor.patch` from a version string, ignoring any
    /// leading `v` and any suffix after the numeric parts. `"6"` yields
    /// `{6, 0, 0}`.
    pub fn parse(version: &str) -> Self {
        let normalized = normalize(version);
        let mut parts = normalized.split('.');
        let major = leading_number(parts.next().unwrap_or(""));
        let minor = leading_number(parts.next().unwrap_or(""));
        let patch = leading_number(parts.next().unwrap_or(""));
        Self {
            major,
            minor,
            patch,
        }
    }

    /// `major.minor`, as used by `{tag_short}`.
    pub fn short(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// `major.x`, as used by kernel.org directory names.
    pub fn major_x(&self) -> String {
        format!("{}.x", self.major)
    }
}

/// Strip a leading `v`/`V` so tags and plain versions compare equal.
pub fn normalize(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}

fn leading_number(component: &str) -> u64 {
    let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

fn split_component(component: &str) -> (u64, &str) {
    let split_at = component
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(component.len());
    let (digits, suffix) = component.split_at(split_at);
    (digits.parse().unwrap_or(0), suffix)
}

fn compare_suffix(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        // Empty suffix wins: 6.1 > 6.1-rc3.
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// Compare two version strings component-wise. A missing component counts
/// as 0, so `6.12 < 6.12.1` and `6.12 == 6.12.0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<&str> = normalize(a).split('.').collect();
    let b_parts: Vec<&str> = normalize(b).split('.').collect();
    let len = a_parts.len().max(b_parts.len());

    for i in 0..len {
        let (a_num, a_suffix) = split_component(a_parts.get(i).copied().unwrap_or("0"));
        let (b_num, b_suffix) = split_component(b_parts.get(i).copied().unwrap_or("0"));
        match a_num.cmp(&b_num) {
            Ordering::Equal => {}
            other => return other,
        }
        match compare_suffix(a_suffix, b_suffix) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    Ordering::Equal
}

/// Sort newest-first using [`compare_versions`].
pub fn sort_versions_desc(versions: &mut [String]) {
    versions.sort_by(|a, b| compare_versions(b, a));
}

/// Whether a version string denotes a prerelease build.
pub fn is_prerelease(version: &str) -> bool {
    let lower = version.to_lowercase();
    PRERELEASE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Classify a kernel.org release: `-rc` builds are mainline, versions in an
/// LTS series are longterm, `next-` snapshots are linux-next, the rest are
/// stable.
pub fn classify_kernel_version(version: &str) -> VersionType {
    let normalized = normalize(version);
    if normalized.contains("-rc") {
        return VersionType::Mainline;
    }
    if normalized.starts_with("next-") {
        return VersionType::LinuxNext;
    }
    let parts = VersionParts::parse(normalized);
    if KERNEL_LTS_SERIES.contains(&parts.short().as_str()) {
        return VersionType::Longterm;
    }
    VersionType::Stable
}

/// First non-prerelease entry of an already-descending version list.
pub fn first_stable<'a, I>(versions: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    versions.into_iter().find(|v| !is_prerelease(v))
}
