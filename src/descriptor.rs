//! Plugin discovery from on-disk descriptors
//!
//! The plugin directory holds one subdirectory per plugin. Each subdirectory
//! carries a `plugin.json` (or `plugin.yaml` / `plugin.yml`) describing the
//! plugin's identity, RPC endpoint and capabilities. Nothing is cached: every
//! call to [`DescriptorStore::discover`] re-reads the directory.

use crate::error::DescriptorError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Descriptor file names, in order of preference
pub const DESCRIPTOR_FILES: [&str; 3] = ["plugin.json", "plugin.yaml", "plugin.yml"];

/// Capability flags advertised by a plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub supports_projected_cost: bool,
    #[serde(default)]
    pub supports_actual_cost: bool,
    #[serde(default)]
    pub supports_optimization: bool,
}

/// Immutable snapshot of a plugin descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    /// Unique plugin name
    pub name: String,
    /// Semantic version string
    pub version: String,
    pub description: Option<String>,
    /// Providers the plugin prices (free text, e.g. "aws,gcp")
    pub providers: Option<String>,
    /// `host:port` of the plugin's RPC endpoint
    pub rpc_address: String,
    pub capabilities: Capabilities,
    /// Directory the descriptor was read from
    #[serde(skip)]
    pub path: PathBuf,
}

/// On-disk shape of a descriptor file
#[derive(Debug, Deserialize)]
struct DescriptorFile {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    providers: Option<String>,
    grpc_address: Option<String>,
    #[serde(default)]
    capabilities: Capabilities,
}

impl PluginDescriptor {
    /// Read and validate a single descriptor file
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let content = std::fs::read_to_string(path).map_err(|e| DescriptorError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let file: DescriptorFile = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| DescriptorError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| DescriptorError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };

        let required = |value: Option<String>, field: &'static str| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| DescriptorError::MissingField {
                    path: path.to_path_buf(),
                    field,
                })
        };

        Ok(Self {
            name: required(file.name, "name")?,
            version: required(file.version, "version")?,
            description: file.description,
            providers: file.providers,
            rpc_address: required(file.grpc_address, "grpc_address")?,
            capabilities: file.capabilities,
            path: path.parent().map(Path::to_path_buf).unwrap_or_default(),
        })
    }
}

/// Reads plugin descriptors from a root directory
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    root: PathBuf,
}

impl DescriptorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Discover every plugin under the root directory.
    ///
    /// A missing root yields an empty list. Subdirectories without a
    /// descriptor, or with one that fails to read or parse, are skipped and
    /// logged. No ordering guarantee.
    pub fn discover(&self) -> Vec<PluginDescriptor> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Plugin directory {} does not exist", self.root.display());
                return Vec::new();
            }
            Err(e) => {
                warn!(
                    "Failed to read plugin directory {}: {}",
                    self.root.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut descriptors = Vec::new();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }

            let Some(descriptor_path) = find_descriptor_file(&dir) else {
                debug!("Skipping {}: no descriptor file", dir.display());
                continue;
            };

            match PluginDescriptor::from_file(&descriptor_path) {
                Ok(descriptor) => {
                    if !seen.insert(descriptor.name.clone()) {
                        warn!(
                            plugin = %descriptor.name,
                            "Skipping duplicate plugin descriptor at {}",
                            descriptor_path.display()
                        );
                        continue;
                    }
                    debug!(
                        plugin = %descriptor.name,
                        version = %descriptor.version,
                        address = %descriptor.rpc_address,
                        "Discovered plugin"
                    );
                    descriptors.push(descriptor);
                }
                Err(e) => {
                    warn!("Skipping invalid plugin descriptor: {}", e);
                }
            }
        }

        descriptors
    }

    /// Discover and return the plugin with the given name
    pub fn find(&self, name: &str) -> Option<PluginDescriptor> {
        self.discover().into_iter().find(|d| d.name == name)
    }
}

fn find_descriptor_file(dir: &Path) -> Option<PathBuf> {
    DESCRIPTOR_FILES
        .iter()
        .map(|file| dir.join(file))
        .find(|candidate| candidate.is_file())
}
