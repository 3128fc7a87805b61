//! Manifest loading for GPU components
//!
//! Each component ships as a directory of single-object YAML manifests.
//! Loading is two-phase: a cheap scan of the top-level `kind:` line picks the
//! concrete type, then the bytes are decoded into that type. The resulting
//! [`ResourceBundle`] holds the templates and the applier table lists the
//! appliers to run, in discovery order.

use std::fs;
use std::path::{Path, PathBuf};

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::appliers::Applier;
use super::cluster::ObjectKind;
use crate::error::{Error, Result};

/// Components deployed by default, in deployment order
pub const DEFAULT_COMPONENTS: &[&str] = &[
    "device-plugin",
    "kubevirt-device-plugin",
    "vgpu-device-manager",
    "vfio-manager",
];

/// Object templates belonging to one component
#[derive(Clone, Debug, Default)]
pub struct ResourceBundle {
    pub service_account: Option<ServiceAccount>,
    pub role: Option<Role>,
    pub cluster_role: Option<ClusterRole>,
    pub role_binding: Option<RoleBinding>,
    pub cluster_role_binding: Option<ClusterRoleBinding>,
    /// In discovery order
    pub config_maps: Vec<ConfigMap>,
    pub daemon_set: Option<DaemonSet>,
}

/// A loaded component: its templates and the appliers that reconcile them
#[derive(Clone, Debug)]
pub struct Component {
    /// Manifest directory name, also the enablement key
    pub name: String,
    pub bundle: ResourceBundle,
    pub appliers: Vec<Applier>,
}

impl Component {
    /// Load every manifest under `dir`.
    ///
    /// Manifests of unknown kinds are skipped. A manifest of a known kind
    /// that fails to decode aborts the load.
    pub fn load(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::ConfigError(format!("invalid component directory {}", dir.display()))
            })?
            .to_string();

        info!("Loading manifests for component {} from {}", name, dir.display());

        let mut bundle = ResourceBundle::default();
        let mut appliers = Vec::new();

        for path in manifest_files(dir)? {
            let raw = fs::read(&path).map_err(|source| Error::IoError {
                path: path.clone(),
                source,
            })?;
            let text = String::from_utf8_lossy(&raw);

            let Some(kind_name) = scan_kind(&text) else {
                warn!("No kind found in manifest {}, skipping", path.display());
                continue;
            };
            let Some(kind) = ObjectKind::from_kind(kind_name) else {
                warn!(
                    "Unknown kind {} in manifest {}, skipping",
                    kind_name,
                    path.display()
                );
                continue;
            };
            debug!("Found {} in {}", kind, path.display());

            let first_of_kind = bundle.insert(kind, &raw, &path)?;
            if first_of_kind {
                appliers.push(Applier::for_kind(kind));
            } else if kind != ObjectKind::ConfigMap {
                warn!(
                    "Component {} declares more than one {}, {} replaces the earlier one",
                    name,
                    kind,
                    path.display()
                );
            }
        }

        Ok(Self {
            name,
            bundle,
            appliers,
        })
    }
}

impl ResourceBundle {
    /// Decode `raw` as `kind` into the matching slot.
    ///
    /// Returns `true` when this is the first object of that kind.
    fn insert(&mut self, kind: ObjectKind, raw: &[u8], path: &Path) -> Result<bool> {
        let first = match kind {
            ObjectKind::ServiceAccount => {
                self.service_account
                    .replace(decode(kind, raw, path)?)
                    .is_none()
            }
            ObjectKind::Role => self.role.replace(decode(kind, raw, path)?).is_none(),
            ObjectKind::ClusterRole => self.cluster_role.replace(decode(kind, raw, path)?).is_none(),
            ObjectKind::RoleBinding => self.role_binding.replace(decode(kind, raw, path)?).is_none(),
            ObjectKind::ClusterRoleBinding => self
                .cluster_role_binding
                .replace(decode(kind, raw, path)?)
                .is_none(),
            ObjectKind::ConfigMap => {
                self.config_maps.push(decode(kind, raw, path)?);
                self.config_maps.len() == 1
            }
            ObjectKind::DaemonSet => self.daemon_set.replace(decode(kind, raw, path)?).is_none(),
        };
        Ok(first)
    }
}

fn decode<K: DeserializeOwned>(kind: ObjectKind, raw: &[u8], path: &Path) -> Result<K> {
    serde_yaml::from_slice(raw).map_err(|source| Error::ManifestError {
        path: path.to_path_buf(),
        kind: kind.to_string(),
        source,
    })
}

/// Find the value of the top-level `kind:` field without parsing the document
pub fn scan_kind(manifest: &str) -> Option<&str> {
    manifest.lines().find_map(|line| {
        let value = line.strip_prefix("kind:")?;
        let value = value.split('#').next().unwrap_or_default().trim();
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then_some(value)
    })
}

/// All regular files under `dir`, recursively, in lexicographic path order.
///
/// Symlinks to files are included; symlinks to directories are skipped.
fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|source| Error::IoError {
            path: current.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| Error::IoError {
                path: current.clone(),
                source,
            })?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|source| Error::IoError {
                path: path.clone(),
                source,
            })?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                files.push(path);
            } else if file_type.is_symlink() {
                // Never descend through a symlinked directory
                if path.is_file() {
                    files.push(path);
                } else {
                    warn!("Skipping symlink {} in manifest directory", path.display());
                }
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Load the named components from sub-directories of `root`.
///
/// A component without a directory is skipped with a warning so that a
/// partial manifest set still deploys what it ships.
pub fn load_components<S: AsRef<str>>(root: &Path, names: &[S]) -> Result<Vec<Component>> {
    let mut components = Vec::with_capacity(names.len());
    for name in names {
        let dir = root.join(name.as_ref());
        if !dir.is_dir() {
            warn!(
                "No manifest directory for component {} at {}, skipping",
                name.as_ref(),
                dir.display()
            );
            continue;
        }
        components.push(Component::load(&dir)?);
    }
    info!(
        "Loaded {} components: {:?}",
        components.len(),
        components.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
    );
    Ok(components)
}
