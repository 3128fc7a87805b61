//! DaemonSet rendering from the GpuCluster spec
//!
//! A component DaemonSet template goes through two stages before it is
//! applied: settings shared by every component ([`DaemonSetsSpec`]) and
//! settings of the component the DaemonSet belongs to, selected by the
//! DaemonSet's name. DaemonSets with an unknown name pass through untouched.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetUpdateStrategy, RollingUpdateDaemonSet};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, LocalObjectReference, PodSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::crd::{ComponentSpec, DaemonSetsSpec, GpuClusterSpec, Runtime};
use crate::error::{Error, Result};

/// RuntimeClass used on containerd nodes when the GpuCluster names none
pub const DEFAULT_RUNTIME_CLASS: &str = "xdxct";
/// ConfigMap holding the default vGPU device configurations
pub const VGPU_DEVICE_CONFIG_MAP: &str = "vgpu-device-config";
/// Configuration selected from the vGPU ConfigMap when the GpuCluster names none
pub const VGPU_DEVICE_DEFAULT_CONFIG: &str = "default";

const DEFAULT_VGPU_CONFIG_ENV: &str = "DEFAULT_VGPU_CONFIG";
const CONFIG_FILE_VOLUME: &str = "configfile";

/// Pod template labels users may not override; DaemonSet selectors use them
const PROTECTED_LABELS: &[&str] = &["app", "app.kubernetes.io/part-of"];

/// Environment lookup used for image fallbacks
pub type EnvLookup<'a> = &'a (dyn Fn(&str) -> Option<String> + Send + Sync);

/// Workloads with a per-component transform
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    DevicePlugin,
    KubevirtDevicePlugin,
    VgpuDeviceManager,
    VfioManager,
}

impl Workload {
    pub fn from_daemon_set_name(name: &str) -> Option<Self> {
        match name {
            "xdxct-device-plugin-ds" => Some(Workload::DevicePlugin),
            "xdxct-kubevirt-device-plugin-ds" => Some(Workload::KubevirtDevicePlugin),
            "xdxct-vgpu-device-manager-ds" => Some(Workload::VgpuDeviceManager),
            "xdxct-vfio-manager-ds" => Some(Workload::VfioManager),
            _ => None,
        }
    }

    fn settings<'a>(&self, spec: &'a GpuClusterSpec) -> &'a ComponentSpec {
        match self {
            Workload::DevicePlugin => &spec.device_plugin,
            Workload::KubevirtDevicePlugin => &spec.kubevirt_device_plugin,
            Workload::VgpuDeviceManager => &spec.vgpu_device_manager,
            Workload::VfioManager => &spec.vfio_manager,
        }
    }

    /// Environment variable holding the fallback image
    pub fn image_env(&self) -> &'static str {
        match self {
            Workload::DevicePlugin => "DEVICE_PLUGIN_IMAGE",
            Workload::KubevirtDevicePlugin => "KUBEVIRT_DEVICE_PLUGIN_IMAGE",
            Workload::VgpuDeviceManager => "VGPU_DEVICE_MANAGER_IMAGE",
            Workload::VfioManager => "VFIO_MANAGER_IMAGE",
        }
    }
}

/// Render `ds` in place from the GpuCluster spec
pub fn transform_daemon_set(
    ds: &mut DaemonSet,
    spec: &GpuClusterSpec,
    runtime: Runtime,
    env: EnvLookup<'_>,
) -> Result<()> {
    let name = ds.name_any();
    let Some(workload) = Workload::from_daemon_set_name(&name) else {
        debug!("No transformation for DaemonSet {}", name);
        return Ok(());
    };

    apply_common_config(ds, &spec.daemon_sets)?;

    let settings = workload.settings(spec);
    apply_component_settings(ds, settings, workload.image_env(), env)?;

    match workload {
        Workload::DevicePlugin => {
            set_runtime_class(
                pod_spec_mut(ds),
                runtime,
                spec.operator.runtime_class.as_deref(),
            );
        }
        Workload::VgpuDeviceManager => apply_vgpu_config(ds, settings)?,
        Workload::KubevirtDevicePlugin | Workload::VfioManager => {}
    }

    apply_common_metadata(ds, &spec.daemon_sets);
    Ok(())
}

/// Update strategy, priority class and tolerations shared by all components
pub fn apply_common_config(ds: &mut DaemonSet, config: &DaemonSetsSpec) -> Result<()> {
    let name = ds.name_any();

    match config.update_strategy.as_deref() {
        Some("OnDelete") => {
            ds.spec.get_or_insert_with(Default::default).update_strategy =
                Some(DaemonSetUpdateStrategy {
                    type_: Some("OnDelete".to_string()),
                    rolling_update: None,
                });
        }
        _ => {
            let bound = config
                .rolling_update
                .as_ref()
                .and_then(|r| r.max_unavailable.as_deref())
                .filter(|b| !b.is_empty());
            if let Some(bound) = bound {
                let max_unavailable = parse_max_unavailable(&name, bound)?;
                ds.spec.get_or_insert_with(Default::default).update_strategy =
                    Some(DaemonSetUpdateStrategy {
                        type_: Some("RollingUpdate".to_string()),
                        rolling_update: Some(RollingUpdateDaemonSet {
                            max_unavailable: Some(max_unavailable),
                            ..Default::default()
                        }),
                    });
            }
        }
    }

    let pod_spec = pod_spec_mut(ds);
    if let Some(priority_class) = config.priority_class_name.as_ref().filter(|p| !p.is_empty()) {
        pod_spec.priority_class_name = Some(priority_class.clone());
    }
    if !config.tolerations.is_empty() {
        pod_spec.tolerations = Some(config.tolerations.clone());
    }

    Ok(())
}

/// Parse a rolling-update bound: `"20%"` stays a string, anything else must be an integer
pub fn parse_max_unavailable(ds_name: &str, bound: &str) -> Result<IntOrString> {
    if bound.ends_with('%') {
        return Ok(IntOrString::String(bound.to_string()));
    }
    bound
        .parse::<i32>()
        .map(IntOrString::Int)
        .map_err(|e| Error::TransformError {
            name: ds_name.to_string(),
            message: format!("invalid rollingUpdate.maxUnavailable {bound:?}: {e}"),
        })
}

/// Image, pull policy, pull secrets, args, env and resources of one component
fn apply_component_settings(
    ds: &mut DaemonSet,
    settings: &ComponentSpec,
    image_env: &str,
    env: EnvLookup<'_>,
) -> Result<()> {
    let name = ds.name_any();
    let image = settings.image_path(image_env, env)?;

    let pod_spec = pod_spec_mut(ds);
    for secret in &settings.image_pull_secrets {
        add_pull_secret(pod_spec, secret);
    }

    if let Some(resources) = &settings.resources {
        for container in &mut pod_spec.containers {
            container.resources = Some(ResourceRequirements {
                limits: resources.limits.clone(),
                requests: resources.requests.clone(),
                ..Default::default()
            });
        }
    }

    let container = pod_spec
        .containers
        .first_mut()
        .ok_or_else(|| Error::TransformError {
            name,
            message: "pod template has no containers".to_string(),
        })?;

    container.image = Some(image);
    container.image_pull_policy = Some(settings.pull_policy().to_string());
    if !settings.args.is_empty() {
        container.args = Some(settings.args.clone());
    }
    for var in &settings.env {
        set_container_env(container, &var.name, &var.value);
    }

    Ok(())
}

/// Point the vGPU device manager at the user's ConfigMap and default config
fn apply_vgpu_config(ds: &mut DaemonSet, settings: &ComponentSpec) -> Result<()> {
    let name = ds.name_any();
    let config_map = settings.config_name().unwrap_or(VGPU_DEVICE_CONFIG_MAP);
    let default_config = settings
        .config
        .as_ref()
        .map(|c| c.default.as_str())
        .filter(|d| !d.is_empty())
        .unwrap_or(VGPU_DEVICE_DEFAULT_CONFIG);

    let pod_spec = pod_spec_mut(ds);
    let volume = pod_spec
        .volumes
        .iter_mut()
        .flatten()
        .find(|v| v.name.contains(CONFIG_FILE_VOLUME));
    match volume.and_then(|v| v.config_map.as_mut()) {
        Some(source) => source.name = Some(config_map.to_string()),
        None => warn!("DaemonSet {} has no ConfigMap volume for vGPU configs", name),
    }

    let container = pod_spec
        .containers
        .first_mut()
        .ok_or_else(|| Error::TransformError {
            name,
            message: "pod template has no containers".to_string(),
        })?;
    set_container_env(container, DEFAULT_VGPU_CONFIG_ENV, default_config);

    Ok(())
}

/// Merge user labels and annotations into the pod template
pub fn apply_common_metadata(ds: &mut DaemonSet, config: &DaemonSetsSpec) {
    let template = &mut ds.spec.get_or_insert_with(Default::default).template;
    let metadata = template.metadata.get_or_insert_with(Default::default);

    if !config.labels.is_empty() {
        metadata.labels = Some(merge_map(
            metadata.labels.as_ref(),
            &config.labels,
            PROTECTED_LABELS,
        ));
    }
    if !config.annotations.is_empty() {
        metadata.annotations = Some(merge_map(
            metadata.annotations.as_ref(),
            &config.annotations,
            &[],
        ));
    }
}

/// `base` overlaid with `overrides`, minus override keys listed in `excluded`
pub fn merge_map(
    base: Option<&BTreeMap<String, String>>,
    overrides: &BTreeMap<String, String>,
    excluded: &[&str],
) -> BTreeMap<String, String> {
    let mut merged = base.cloned().unwrap_or_default();
    merged.extend(
        overrides
            .iter()
            .filter(|(k, _)| !excluded.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    merged
}

/// Set `key` on the container, replacing an existing entry of that name
pub fn set_container_env(container: &mut Container, key: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == key) {
        Some(existing) => {
            existing.value = Some(value.to_string());
            existing.value_from = None;
        }
        None => env.push(EnvVar {
            name: key.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }),
    }
}

fn add_pull_secret(pod_spec: &mut PodSpec, secret: &str) {
    let secrets = pod_spec.image_pull_secrets.get_or_insert_with(Vec::new);
    if !secrets.iter().any(|s| s.name.as_deref() == Some(secret)) {
        secrets.push(LocalObjectReference {
            name: Some(secret.to_string()),
        });
    }
}

/// Select the operator's RuntimeClass on containerd nodes
pub fn set_runtime_class(pod_spec: &mut PodSpec, runtime: Runtime, runtime_class: Option<&str>) {
    if runtime == Runtime::Containerd {
        let class = runtime_class
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_RUNTIME_CLASS);
        pod_spec.runtime_class_name = Some(class.to_string());
    }
}

fn pod_spec_mut(ds: &mut DaemonSet) -> &mut PodSpec {
    ds.spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}
