//! GpuCluster Custom Resource Definition
//!
//! A GpuCluster declares which GPU support components run on the cluster and
//! how their DaemonSets are rendered. Only one instance is reconciled per
//! operator process.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComponentSpec, Condition, DaemonSetsSpec, OperatorSpec, State};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "xdxct.com",
    version = "v1alpha1",
    kind = "GpuCluster",
    status = "GpuClusterStatus",
    shortname = "gpuc",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".status.namespace"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GpuClusterSpec {
    #[serde(default)]
    pub operator: OperatorSpec,

    #[serde(default)]
    pub daemon_sets: DaemonSetsSpec,

    #[serde(default)]
    pub device_plugin: ComponentSpec,

    #[serde(default)]
    pub kubevirt_device_plugin: ComponentSpec,

    #[serde(default)]
    pub vgpu_device_manager: ComponentSpec,

    #[serde(default)]
    pub vfio_manager: ComponentSpec,
}

/// Observed state of a GpuCluster
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GpuClusterStatus {
    /// Namespace the components are deployed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub state: State,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl GpuClusterSpec {
    /// Component settings by component (manifest directory) name
    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        match name {
            "device-plugin" => Some(&self.device_plugin),
            "kubevirt-device-plugin" => Some(&self.kubevirt_device_plugin),
            "vgpu-device-manager" => Some(&self.vgpu_device_manager),
            "vfio-manager" => Some(&self.vfio_manager),
            _ => None,
        }
    }
}
