//! Numbered, idempotent schema migrations.
//!
//! Every migration can run against a database that already carries it
//! (`CREATE TABLE IF NOT EXISTS`, `INSERT OR IGNORE`): startup executes the
//! full sequence unconditionally, which makes snapshot restores from older
//! schemas and `reset_to_defaults` the same code path. `schema_migrations`
//! records when each version first applied.
//!
//! Migrations are the only place system components and system upstream
//! sources are seeded.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::debug;

use distsmith_types::new_id;

/// One schema step.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub apply: fn(&Transaction) -> Result<()>,
}

/// The full ordered migration sequence.
pub fn migrations() -> &'static [Migration] {
    &[
        Migration {
            version: 1,
            description: "core tables",
            apply: apply_core_tables,
        },
        Migration {
            version: 2,
            description: "job and cache indexes",
            apply: apply_indexes,
        },
        Migration {
            version: 3,
            description: "seed system components",
            apply: seed_system_components,
        },
        Migration {
            version: 4,
            description: "seed system upstream sources",
            apply: seed_system_sources,
        },
    ]
}

/// Run the whole sequence inside one transaction, recording newly applied
/// versions.
pub fn apply_all(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().context("failed to begin migration tx")?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  TEXT NOT NULL
        );",
    )
    .context("failed to create schema_migrations")?;

    for migration in migrations() {
        (migration.apply)(&tx)
            .with_context(|| format!("migration {} failed: {}", migration.version, migration.description))?;
        let recorded = tx
            .execute(
                "INSERT OR IGNORE INTO schema_migrations (version, description, applied_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    migration.version,
                    migration.description,
                    Utc::now().to_rfc3339()
                ],
            )
            .with_context(|| format!("failed to record migration {}", migration.version))?;
        if recorded > 0 {
            debug!(version = migration.version, description = migration.description, "applied migration");
        }
    }

    tx.commit().context("failed to commit migrations")
}

fn apply_core_tables(tx: &Transaction) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS components (
            id                      TEXT PRIMARY KEY,
            name                    TEXT NOT NULL UNIQUE,
            categories              TEXT NOT NULL,
            display_name            TEXT NOT NULL DEFAULT '',
            description             TEXT NOT NULL DEFAULT '',
            artifact_pattern        TEXT,
            default_url_template    TEXT,
            forge_url_template      TEXT,
            is_optional             INTEGER NOT NULL DEFAULT 0,
            is_system               INTEGER NOT NULL DEFAULT 0,
            owner_id                TEXT,
            is_kernel_module        INTEGER NOT NULL DEFAULT 0,
            is_userspace            INTEGER NOT NULL DEFAULT 0,
            default_version         TEXT,
            default_version_rule    TEXT NOT NULL DEFAULT 'latest-stable',
            supported_architectures TEXT NOT NULL DEFAULT '',
            created_at              TEXT NOT NULL,
            updated_at              TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS upstream_sources (
            id               TEXT PRIMARY KEY,
            name             TEXT NOT NULL,
            url              TEXT NOT NULL,
            component_ids    TEXT NOT NULL DEFAULT '[]',
            retrieval_method TEXT NOT NULL DEFAULT 'release',
            url_template     TEXT,
            forge_type       TEXT,
            version_filter   TEXT,
            default_version  TEXT,
            priority         INTEGER NOT NULL DEFAULT 100,
            enabled          INTEGER NOT NULL DEFAULT 1,
            is_system        INTEGER NOT NULL DEFAULT 0,
            owner_id         TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS source_versions (
            id            TEXT PRIMARY KEY,
            source_id     TEXT NOT NULL REFERENCES upstream_sources(id) ON DELETE CASCADE,
            source_type   TEXT NOT NULL DEFAULT 'default',
            version       TEXT NOT NULL,
            version_type  TEXT NOT NULL DEFAULT 'stable',
            release_date  TEXT,
            download_url  TEXT,
            checksum      TEXT,
            checksum_type TEXT,
            file_size     INTEGER,
            discovered_at TEXT NOT NULL,
            UNIQUE (source_id, version)
        );

        CREATE TABLE IF NOT EXISTS download_jobs (
            id               TEXT PRIMARY KEY,
            distribution_id  TEXT NOT NULL,
            owner_id         TEXT NOT NULL,
            component_id     TEXT NOT NULL REFERENCES components(id) ON DELETE CASCADE,
            component_ids    TEXT NOT NULL DEFAULT '[]',
            source_id        TEXT NOT NULL,
            source_name      TEXT NOT NULL DEFAULT '',
            source_type      TEXT NOT NULL DEFAULT 'default',
            retrieval_method TEXT NOT NULL DEFAULT 'release',
            resolved_url     TEXT NOT NULL DEFAULT '',
            version          TEXT NOT NULL,
            status           TEXT NOT NULL DEFAULT 'pending',
            progress_bytes   INTEGER NOT NULL DEFAULT 0,
            total_bytes      INTEGER NOT NULL DEFAULT 0,
            artifact_path    TEXT,
            checksum         TEXT,
            error_message    TEXT,
            retry_count      INTEGER NOT NULL DEFAULT 0,
            max_retries      INTEGER NOT NULL DEFAULT 3,
            priority         INTEGER NOT NULL DEFAULT 0,
            cache_hit        INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            started_at       TEXT,
            completed_at     TEXT
        );

        CREATE TABLE IF NOT EXISTS artifact_cache (
            id           TEXT PRIMARY KEY,
            source_id    TEXT NOT NULL,
            version      TEXT NOT NULL,
            checksum     TEXT NOT NULL,
            cache_path   TEXT NOT NULL,
            size_bytes   INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            resolved_url TEXT NOT NULL DEFAULT '',
            created_at   TEXT NOT NULL,
            last_used_at TEXT NOT NULL,
            use_count    INTEGER NOT NULL DEFAULT 0,
            UNIQUE (source_id, version)
        );

        CREATE TABLE IF NOT EXISTS mirrors (
            id         TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            url_prefix TEXT NOT NULL,
            mirror_url TEXT NOT NULL,
            priority   INTEGER NOT NULL DEFAULT 100,
            enabled    INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_jobs (
            id             TEXT PRIMARY KEY,
            source_id      TEXT NOT NULL REFERENCES upstream_sources(id) ON DELETE CASCADE,
            status         TEXT NOT NULL DEFAULT 'pending',
            versions_found INTEGER NOT NULL DEFAULT 0,
            versions_new   INTEGER NOT NULL DEFAULT 0,
            error_message  TEXT,
            created_at     TEXT NOT NULL,
            started_at     TEXT,
            completed_at   TEXT
        );

        CREATE TABLE IF NOT EXISTS dist_source_overrides (
            id              TEXT PRIMARY KEY,
            distribution_id TEXT NOT NULL,
            component_id    TEXT NOT NULL,
            source_id       TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            UNIQUE (distribution_id, component_id)
        );",
    )
    .context("failed to create core tables")
}

fn apply_indexes(tx: &Transaction) -> Result<()> {
    tx.execute_batch(
        "-- One live job per (distribution, source, version); cancelled rows
        -- do not block resubmission.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_download_jobs_dedup
            ON download_jobs (distribution_id, source_id, version)
            WHERE status != 'cancelled';

        CREATE INDEX IF NOT EXISTS idx_download_jobs_queue
            ON download_jobs (status, priority, created_at);

        CREATE INDEX IF NOT EXISTS idx_download_jobs_distribution
            ON download_jobs (distribution_id);

        CREATE INDEX IF NOT EXISTS idx_artifact_cache_lru
            ON artifact_cache (last_used_at);

        CREATE INDEX IF NOT EXISTS idx_source_versions_source
            ON source_versions (source_id);

        CREATE INDEX IF NOT EXISTS idx_sync_jobs_source
            ON sync_jobs (source_id, status);",
    )
    .context("failed to create indexes")
}

struct SeedComponent {
    name: &'static str,
    categories: &'static str,
    display_name: &'static str,
    artifact_pattern: Option<&'static str>,
    default_url_template: Option<&'static str>,
    forge_url_template: Option<&'static str>,
    is_kernel_module: bool,
    is_userspace: bool,
    default_version_rule: &'static str,
}

fn seed_system_components(tx: &Transaction) -> Result<()> {
    let seeds = [
        SeedComponent {
            name: "kernel-source",
            categories: "core",
            display_name: "Linux kernel",
            artifact_pattern: Some("linux-{version}.tar.xz"),
            default_url_template: Some("{base_url}/{major_x}/linux-{version}.tar.xz"),
            forge_url_template: None,
            is_kernel_module: false,
            is_userspace: false,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "bootloader-grub",
            categories: "bootloader",
            display_name: "GNU GRUB",
            artifact_pattern: Some("grub-{version}.tar.xz"),
            default_url_template: Some("{base_url}/grub-{version}.tar.xz"),
            forge_url_template: None,
            is_kernel_module: false,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "bootloader-systemd-boot",
            categories: "bootloader",
            display_name: "systemd-boot",
            artifact_pattern: None,
            default_url_template: None,
            forge_url_template: Some("{base_url}/archive/refs/tags/{tag}.tar.gz"),
            is_kernel_module: false,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "init-systemd",
            categories: "init",
            display_name: "systemd",
            artifact_pattern: None,
            default_url_template: None,
            forge_url_template: Some("{base_url}/archive/refs/tags/{tag}.tar.gz"),
            is_kernel_module: false,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "init-openrc",
            categories: "init",
            display_name: "OpenRC",
            artifact_pattern: None,
            default_url_template: None,
            forge_url_template: Some("{base_url}/archive/refs/tags/{version}.tar.gz"),
            is_kernel_module: false,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "filesystem-btrfs",
            categories: "filesystem,core",
            display_name: "Btrfs",
            artifact_pattern: None,
            default_url_template: None,
            forge_url_template: None,
            is_kernel_module: true,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "filesystem-ext4",
            categories: "filesystem,core",
            display_name: "ext4",
            artifact_pattern: None,
            default_url_template: None,
            forge_url_template: None,
            is_kernel_module: true,
            is_userspace: false,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "userspace-btrfs-progs",
            categories: "userspace",
            display_name: "btrfs-progs",
            artifact_pattern: Some("btrfs-progs-v{version}.tar.xz"),
            default_url_template: None,
            forge_url_template: Some("{base_url}/archive/refs/tags/{tag}.tar.gz"),
            is_kernel_module: false,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "package-manager-apk",
            categories: "package-manager",
            display_name: "apk-tools",
            artifact_pattern: None,
            default_url_template: None,
            forge_url_template: Some("{base_url}/archive/refs/tags/{tag}.tar.gz"),
            is_kernel_module: false,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "security-selinux",
            categories: "security",
            display_name: "SELinux",
            artifact_pattern: None,
            default_url_template: None,
            forge_url_template: Some("{base_url}/archive/refs/tags/{version}.tar.gz"),
            is_kernel_module: false,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "container-runtime-cri-o",
            categories: "container-runtime",
            display_name: "CRI-O",
            artifact_pattern: None,
            default_url_template: None,
            forge_url_template: Some("{base_url}/archive/refs/tags/{tag}.tar.gz"),
            is_kernel_module: false,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
        SeedComponent {
            name: "virtualization-qemu",
            categories: "virtualization",
            display_name: "QEMU",
            artifact_pattern: Some("qemu-{version}.tar.xz"),
            default_url_template: Some("{base_url}/qemu-{version}.tar.xz"),
            forge_url_template: None,
            is_kernel_module: false,
            is_userspace: true,
            default_version_rule: "latest-stable",
        },
    ];

    let now = Utc::now().to_rfc3339();
    for seed in seeds {
        tx.execute(
            "INSERT OR IGNORE INTO components
                (id, name, categories, display_name, description, artifact_pattern,
                 default_url_template, forge_url_template, is_optional, is_system,
                 owner_id, is_kernel_module, is_userspace, default_version,
                 default_version_rule, supported_architectures, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, '', ?5, ?6, ?7, 0, 1, NULL, ?8, ?9, NULL, ?10, '', ?11, ?11)",
            params![
                new_id(),
                seed.name,
                seed.categories,
                seed.display_name,
                seed.artifact_pattern,
                seed.default_url_template,
                seed.forge_url_template,
                seed.is_kernel_module as i64,
                seed.is_userspace as i64,
                seed.default_version_rule,
                now,
            ],
        )
        .with_context(|| format!("failed to seed component {}", seed.name))?;
    }
    Ok(())
}

struct SeedSource {
    name: &'static str,
    url: &'static str,
    component_names: &'static [&'static str],
    retrieval_method: &'static str,
    url_template: Option<&'static str>,
    forge_type: Option<&'static str>,
    priority: i64,
}

fn seed_system_sources(tx: &Transaction) -> Result<()> {
    let seeds = [
        SeedSource {
            name: "kernel.org",
            url: "https://cdn.kernel.org/pub/linux/kernel",
            component_names: &["kernel-source", "filesystem-btrfs", "filesystem-ext4"],
            retrieval_method: "release",
            url_template: Some("{base_url}/{major_x}/linux-{version}.tar.xz"),
            forge_type: None,
            priority: 10,
        },
        SeedSource {
            name: "gnu-grub",
            url: "https://ftp.gnu.org/gnu/grub",
            component_names: &["bootloader-grub"],
            retrieval_method: "release",
            url_template: Some("{base_url}/grub-{version}.tar.xz"),
            forge_type: None,
            priority: 10,
        },
        SeedSource {
            name: "github-systemd",
            url: "https://github.com/systemd/systemd",
            component_names: &["init-systemd", "bootloader-systemd-boot"],
            retrieval_method: "git",
            url_template: None,
            forge_type: Some("github"),
            priority: 10,
        },
        SeedSource {
            name: "github-openrc",
            url: "https://github.com/OpenRC/openrc",
            component_names: &["init-openrc"],
            retrieval_method: "git",
            url_template: None,
            forge_type: Some("github"),
            priority: 10,
        },
        SeedSource {
            name: "github-btrfs-progs",
            url: "https://github.com/kdave/btrfs-progs",
            component_names: &["userspace-btrfs-progs"],
            retrieval_method: "release",
            url_template: Some("{base_url}/archive/refs/tags/{tag}.tar.gz"),
            forge_type: Some("github"),
            priority: 10,
        },
        SeedSource {
            name: "gitlab-apk-tools",
            url: "https://gitlab.alpinelinux.org/alpine/apk-tools",
            component_names: &["package-manager-apk"],
            retrieval_method: "git",
            url_template: None,
            forge_type: Some("gitlab"),
            priority: 10,
        },
        SeedSource {
            name: "github-selinux",
            url: "https://github.com/SELinuxProject/selinux",
            component_names: &["security-selinux"],
            retrieval_method: "release",
            url_template: Some("{base_url}/archive/refs/tags/{version}.tar.gz"),
            forge_type: Some("github"),
            priority: 10,
        },
        SeedSource {
            name: "github-cri-o",
            url: "https://github.com/cri-o/cri-o",
            component_names: &["container-runtime-cri-o"],
            retrieval_method: "release",
            url_template: Some("{base_url}/archive/refs/tags/{tag}.tar.gz"),
            forge_type: Some("github"),
            priority: 10,
        },
        SeedSource {
            name: "qemu.org",
            url: "https://download.qemu.org",
            component_names: &["virtualization-qemu"],
            retrieval_method: "release",
            url_template: Some("{base_url}/qemu-{version}.tar.xz"),
            forge_type: None,
            priority: 10,
        },
    ];

    let now = Utc::now().to_rfc3339();
    for seed in seeds {
        // Resolve bound component ids; the component seed ran first.
        let mut component_ids = Vec::new();
        for name in seed.component_names {
            let id: Option<String> = tx
                .query_row(
                    "SELECT id FROM components WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("failed to look up seed component {}", name))?;
            if let Some(id) = id {
                component_ids.push(id);
            }
        }
        let component_ids =
            serde_json::to_string(&component_ids).context("failed to encode component ids")?;

        tx.execute(
            "INSERT OR IGNORE INTO upstream_sources
                (id, name, url, component_ids, retrieval_method, url_template,
                 forge_type, version_filter, default_version, priority, enabled,
                 is_system, owner_id, created_at, updated_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, ?8, 1, 1, NULL, ?9, ?9
             WHERE NOT EXISTS (SELECT 1 FROM upstream_sources WHERE name = ?2 AND is_system = 1)",
            params![
                new_id(),
                seed.name,
                seed.url,
                component_ids,
                seed.retrieval_method,
                seed.url_template,
                seed.forge_type,
                seed.priority,
                now,
            ],
        )
        .with_context(|| format!("failed to seed source {}", seed.name))?;
    }
    Ok(())
}
