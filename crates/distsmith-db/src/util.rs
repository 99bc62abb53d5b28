//! Column mapping helpers shared by the repositories.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use distsmith_types::TargetArch;

/// Render a timestamp for a TEXT column (RFC 3339, UTC).
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn ts_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

/// Parse a TEXT timestamp column.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp in store: {}", s))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Categories are a single comma-separated column; the first entry is the
/// primary category.
pub(crate) fn join_csv(values: &[String]) -> String {
    values.join(",")
}

pub(crate) fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn join_arches(arches: &[TargetArch]) -> String {
    arches
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn parse_arches(s: &str) -> Result<Vec<TargetArch>> {
    split_csv(s)
        .iter()
        .map(|part| part.parse::<TargetArch>().map_err(anyhow::Error::from))
        .collect()
}

/// Id sets (a job's `component_ids`, a source's bindings) are stored as JSON
/// arrays so membership survives ids containing commas-free UUIDs and stays
/// queryable with `json_each` if ever needed.
pub(crate) fn join_ids(ids: &[String]) -> Result<String> {
    serde_json::to_string(ids).context("failed to serialize id set")
}

pub(crate) fn parse_ids(s: &str) -> Result<Vec<String>> {
    serde_json::from_str(s).with_context(|| format!("invalid id set in store: {}", s))
}

pub(crate) fn bool_col(v: i64) -> bool {
    v != 0
}

pub(crate) fn u64_col(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}
