//! Shared types for the GpuCluster specification
//!
//! These types are used across the CRD definition and the controller logic.
//!
//! # Type Hierarchy
//!
//! - [`OperatorSpec`] - Cluster-wide operator settings (runtime class, default runtime)
//! - [`DaemonSetsSpec`] - Settings applied to every component DaemonSet
//! - [`ComponentSpec`] - Per-component image, pull, args, env and resource overrides
//! - [`State`] - Reconciliation state reported for components and the cluster
//! - [`Runtime`] - Container runtime running on the GPU nodes

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reconciliation state of a component or of the whole GpuCluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum State {
    /// Every object of the component exists and its rollout converged
    Ready,
    /// Objects exist but at least one rollout has not converged yet
    #[default]
    NotReady,
    /// The component is switched off and its objects were removed
    Disabled,
    /// Duplicate GpuCluster instance; only the first one is reconciled
    Ignored,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Ready => write!(f, "ready"),
            State::NotReady => write!(f, "notReady"),
            State::Disabled => write!(f, "disabled"),
            State::Ignored => write!(f, "ignored"),
        }
    }
}

/// Container runtime of the GPU nodes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Docker,
    Crio,
    #[default]
    Containerd,
}

impl Runtime {
    /// Map a `Node.status.nodeInfo.containerRuntimeVersion` value
    /// (e.g. `containerd://1.7.2`) to a runtime
    pub fn from_runtime_version(version: &str) -> Option<Self> {
        let (scheme, _) = version.split_once("://")?;
        match scheme {
            "containerd" => Some(Runtime::Containerd),
            "cri-o" => Some(Runtime::Crio),
            "docker" => Some(Runtime::Docker),
            _ => None,
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Runtime::Docker => write!(f, "docker"),
            Runtime::Crio => write!(f, "crio"),
            Runtime::Containerd => write!(f, "containerd"),
        }
    }
}

/// Operator-wide configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    /// RuntimeClass injected into runtime-dependent pods on containerd nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class: Option<String>,

    /// Runtime assumed when no node reports a recognized runtime
    #[serde(default)]
    pub default_runtime: Runtime,
}

/// Common configuration for all component DaemonSets
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetsSpec {
    /// Labels added to every DaemonSet and its pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations added to every DaemonSet and its pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub tolerations: Vec<Toleration>,

    /// `OnDelete` or `RollingUpdate` (default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

/// Rolling update bound for all DaemonSets
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateSpec {
    /// Either an integer count (`"1"`) or a percentage (`"20%"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<String>,
}

/// Environment variable set on a component container
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Resource requests and limits for a component container
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<BTreeMap<String, String>>")]
    pub limits: Option<BTreeMap<String, Quantity>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<BTreeMap<String, String>>")]
    pub requests: Option<BTreeMap<String, Quantity>>,
}

/// User-provided ConfigMap that replaces a component's default one
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ComponentConfig {
    /// Name of the user's ConfigMap
    #[serde(default)]
    pub name: String,

    /// Key of the configuration to apply by default
    #[serde(default)]
    pub default: String,
}

/// Configuration of one deployable component
///
/// Shared by the device plugin, the KubeVirt device plugin, the vGPU
/// device manager and the VFIO manager. `config` is only consulted by the
/// components that ship a default ConfigMap.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Whether to deploy the component; unset means enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Image tag, or a `sha256:` digest
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_policy: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ComponentConfig>,
}

impl ComponentSpec {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Name of the user-supplied ConfigMap, if one is set
    pub fn config_name(&self) -> Option<&str> {
        self.config
            .as_ref()
            .map(|c| c.name.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Resolve the container image for this component.
    ///
    /// Precedence: `repository`/`image`/`version` (digest form when the
    /// version starts with `sha256:`), then a bare `image`, then the
    /// environment variable `env_name` looked up through `lookup`.
    pub fn image_path<F>(&self, env_name: &str, lookup: F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let from_spec = if self.repository.is_empty() && self.version.is_empty() {
            self.image.clone()
        } else if self.version.starts_with("sha256:") {
            format!("{}/{}@{}", self.repository, self.image, self.version)
        } else {
            format!("{}/{}:{}", self.repository, self.image, self.version)
        };
        if !from_spec.is_empty() {
            return Ok(from_spec);
        }

        lookup(env_name)
            .filter(|image| !image.is_empty())
            .ok_or_else(|| Error::ImageResolutionError(env_name.to_string()))
    }

    /// Pull policy to set on the container
    pub fn pull_policy(&self) -> &'static str {
        image_pull_policy(&self.image_pull_policy)
    }
}

/// Map a user-provided pull policy to a valid Kubernetes value
pub fn image_pull_policy(policy: &str) -> &'static str {
    match policy {
        "Always" => "Always",
        "Never" => "Never",
        _ => "IfNotPresent",
    }
}

/// Kubernetes-style status condition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
