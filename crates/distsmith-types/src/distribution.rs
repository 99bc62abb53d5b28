//! Distribution documents, as consumed from the build orchestrator.
//!
//! A [`DistributionConfig`] is a user's recipe for one image: the chosen
//! kernel, bootloader, init system, filesystem, package manager, security
//! module, optional runtimes, target shape, and architecture. The acquisition
//! core never mutates these; it reads them to derive the component set a
//! build needs ([`DistributionConfig::selections`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ImageFormat, KernelConfigMode, TargetArch};

/// A stored distribution recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub config: DistributionConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Selection of one component by name, with an optional pinned version.
/// An absent version means "use the component's default-version rule".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentSelection {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ComponentSelection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: None,
        }
    }

    pub fn pinned(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: Some(version.to_string()),
        }
    }
}

/// Kernel choice plus its configuration strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelSelection {
    #[serde(flatten)]
    pub selection: ComponentSelection,
    #[serde(default)]
    pub config_mode: KernelConfigMode,
    /// Extra options applied on top of defconfig (config_mode = defconfig_options).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_options: Vec<String>,
}

/// Root filesystem choice; `userspace_tools` additionally pulls in the
/// matching userspace package (e.g. btrfs-progs for btrfs).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemSelection {
    #[serde(flatten)]
    pub selection: ComponentSelection,
    #[serde(default)]
    pub userspace_tools: bool,
}

/// Security module choice; `userspace` pulls in the policy tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySelection {
    #[serde(flatten)]
    pub selection: ComponentSelection,
    #[serde(default)]
    pub userspace: bool,
}

/// Target shape of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildTarget {
    Server,
    Desktop {
        environment: String,
        display_server: String,
    },
}

impl Default for BuildTarget {
    fn default() -> Self {
        BuildTarget::Server
    }
}

/// The full recipe consumed by a build request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    pub kernel: KernelSelection,
    pub bootloader: ComponentSelection,
    pub init: ComponentSelection,
    pub filesystem: FilesystemSelection,
    pub package_manager: ComponentSelection,
    pub security: SecuritySelection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<ComponentSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtualization: Option<ComponentSelection>,
    #[serde(default)]
    pub target: BuildTarget,
    pub arch: TargetArch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_profile_id: Option<String>,
    #[serde(default)]
    pub image_format: ImageFormat,
}

/// One entry of the component set a distribution requires: the category to
/// search, the user-facing name to match within it, and an optional version
/// override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRequest {
    pub category: String,
    pub name: String,
    pub version: Option<String>,
}

impl ComponentRequest {
    fn new(category: &str, name: &str, version: Option<&String>) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            version: version.cloned(),
        }
    }
}

impl DistributionConfig {
    /// Flatten the recipe into the ordered list of `(category, name)` lookups
    /// the catalog resolves at build time. Hybrid choices (filesystem with
    /// userspace tools, security module with userspace policy tooling) emit a
    /// second request in the `userspace` category under the same name, so
    /// both resolve against the same upstream and deduplicate into one job
    /// when they share an artifact.
    pub fn selections(&self) -> Vec<ComponentRequest> {
        let mut requests = vec![
            ComponentRequest::new(
                "core",
                &self.kernel.selection.name,
                self.kernel.selection.version.as_ref(),
            ),
            ComponentRequest::new(
                "bootloader",
                &self.bootloader.name,
                self.bootloader.version.as_ref(),
            ),
            ComponentRequest::new("init", &self.init.name, self.init.version.as_ref()),
            ComponentRequest::new(
                "filesystem",
                &self.filesystem.selection.name,
                self.filesystem.selection.version.as_ref(),
            ),
            ComponentRequest::new(
                "package-manager",
                &self.package_manager.name,
                self.package_manager.version.as_ref(),
            ),
            ComponentRequest::new(
                "security",
                &self.security.selection.name,
                self.security.selection.version.as_ref(),
            ),
        ];

        if self.filesystem.userspace_tools {
            requests.push(ComponentRequest::new(
                "userspace",
                &self.filesystem.selection.name,
                self.filesystem.selection.version.as_ref(),
            ));
        }
        if self.security.userspace {
            requests.push(ComponentRequest::new(
                "userspace",
                &self.security.selection.name,
                self.security.selection.version.as_ref(),
            ));
        }
        if let Some(runtime) = &self.container_runtime {
            requests.push(ComponentRequest::new(
                "container-runtime",
                &runtime.name,
                runtime.version.as_ref(),
            ));
        }
        if let Some(virt) = &self.virtualization {
            requests.push(ComponentRequest::new(
                "virtualization",
                &virt.name,
                virt.version.as_ref(),
            ));
        }
        if let BuildTarget::Desktop {
            environment,
            display_server,
        } = &self.target
        {
            requests.push(ComponentRequest::new("desktop", environment, None));
            requests.push(ComponentRequest::new("display-server", display_server, None));
        }

        requests
    }
}
