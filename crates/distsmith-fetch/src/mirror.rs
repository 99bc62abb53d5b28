//! Mirror redirection and local-mirror probing.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use distsmith_db::Store;
use distsmith_types::MirrorConfigEntry;

/// Rewrites download URLs through configured mirror rules.
///
/// The matching rule is the enabled one with the longest `url_prefix` that
/// prefixes the URL; ties fall to the lower priority number, then name.
#[derive(Debug, Clone, Default)]
pub struct MirrorResolver {
    rules: Vec<MirrorConfigEntry>,
}

impl MirrorResolver {
    pub fn new(mut rules: Vec<MirrorConfigEntry>) -> Self {
        rules.retain(|r| r.enabled);
        Self { rules }
    }

    /// Load the current enabled rule set from the store.
    pub fn from_store(store: &Store) -> Result<Self> {
        Ok(Self::new(store.mirrors().list_enabled()?))
    }

    /// Rewrite `url` through the best-matching rule; the original comes back
    /// untouched when nothing matches.
    pub fn resolve(&self, url: &str) -> (String, Option<&MirrorConfigEntry>) {
        let mut best: Option<&MirrorConfigEntry> = None;
        for rule in &self.rules {
            if !url.starts_with(&rule.url_prefix) {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    let by_len = rule.url_prefix.len().cmp(&current.url_prefix.len());
                    match by_len {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => {
                            (rule.priority, rule.name.as_str())
                                < (current.priority, current.name.as_str())
                        }
                    }
                }
            };
            if better {
                best = Some(rule);
            }
        }

        match best {
            Some(rule) => {
                let rewritten = format!(
                    "{}{}",
                    rule.mirror_url.trim_end_matches('/'),
                    &url[rule.url_prefix.trim_end_matches('/').len()..]
                );
                debug!(url, mirror = %rule.name, rewritten = %rewritten, "mirror rewrite");
                (rewritten, Some(rule))
            }
            None => (url.to_string(), None),
        }
    }
}

/// Probe a local mirror directory for a pre-seeded artifact: the structured
/// `{mirror}/{source_id}/{version}/{filename}` layout first, the flat
/// `{mirror}/{filename}` second.
pub fn local_mirror_candidate(
    mirror_dir: &Path,
    source_id: &str,
    version: &str,
    filename: &str,
) -> Option<PathBuf> {
    let structured = mirror_dir.join(source_id).join(version).join(filename);
    if structured.is_file() {
        return Some(structured);
    }
    let flat = mirror_dir.join(filename);
    if flat.is_file() {
        return Some(flat);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(name: &str, prefix: &str, target: &str, priority: i64, enabled: bool) -> MirrorConfigEntry {
        let now = Utc::now();
        MirrorConfigEntry {
            id: name.to_string(),
            name: name.to_string(),
            url_prefix: prefix.to_string(),
            mirror_url: target.to_string(),
            priority,
            enabled,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let resolver = MirrorResolver::new(vec![
            rule("broad", "https://cdn.kernel.org", "https://mirror.a/kernel", 1, true),
            rule(
                "narrow",
                "https://cdn.kernel.org/pub/linux",
                "https://mirror.b/linux",
                50,
                true,
            ),
        ]);

        let (rewritten, matched) =
            resolver.resolve("https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.12.4.tar.xz");
        assert_eq!(matched.expect("match").name, "narrow");
        assert_eq!(
            rewritten,
            "https://mirror.b/linux/kernel/v6.x/linux-6.12.4.tar.xz"
        );
    }

    #[test]
    fn priority_breaks_prefix_ties() {
        let resolver = MirrorResolver::new(vec![
            rule("second", "https://github.com", "https://mirror.two", 20, true),
            rule("first", "https://github.com", "https://mirror.one", 10, true),
        ]);
        let (_, matched) = resolver.resolve("https://github.com/a/b.tar.gz");
        assert_eq!(matched.expect("match").name, "first");
    }

    #[test]
    fn disabled_mirrors_never_match() {
        let resolver = MirrorResolver::new(vec![rule(
            "off",
            "https://cdn.kernel.org",
            "https://mirror.dead",
            1,
            false,
        )]);
        let (rewritten, matched) = resolver.resolve("https://cdn.kernel.org/x.tar.xz");
        assert!(matched.is_none());
        assert_eq!(rewritten, "https://cdn.kernel.org/x.tar.xz");
    }

    #[test]
    fn no_rules_pass_through() {
        let resolver = MirrorResolver::default();
        let (rewritten, matched) = resolver.resolve("https://example.org/a");
        assert!(matched.is_none());
        assert_eq!(rewritten, "https://example.org/a");
    }

    #[test]
    fn local_mirror_prefers_structured_layout() {
        let td = tempfile::tempdir().expect("tempdir");
        let structured_dir = td.path().join("s1").join("1.0");
        std::fs::create_dir_all(&structured_dir).expect("mkdir");
        std::fs::write(structured_dir.join("a.tar.gz"), b"structured").expect("write");
        std::fs::write(td.path().join("a.tar.gz"), b"flat").expect("write");

        let found =
            local_mirror_candidate(td.path(), "s1", "1.0", "a.tar.gz").expect("candidate");
        assert!(found.ends_with("s1/1.0/a.tar.gz"));
    }

    #[test]
    fn local_mirror_falls_back_to_flat() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("b.tar.gz"), b"flat").expect("write");

        let found = local_mirror_candidate(td.path(), "s1", "1.0", "b.tar.gz").expect("candidate");
        assert_eq!(found, td.path().join("b.tar.gz"));
        assert!(local_mirror_candidate(td.path(), "s1", "1.0", "missing.tar.gz").is_none());
    }
}
