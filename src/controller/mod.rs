//! Controller module for GpuCluster reconciliation
//!
//! This module contains the component orchestration engine (manifest
//! loading, kind appliers, DaemonSet rendering, drift detection, rollout
//! readiness) and the kube-runtime loop that drives it.

pub mod appliers;
pub mod cluster;
pub mod conditions;
pub mod drift;
pub mod manifests;
pub mod orchestrator;
pub mod readiness;
mod reconciler;
pub mod transforms;

#[cfg(test)]
mod fake_cluster;

pub use appliers::Applier;
pub use cluster::{ClusterApi, ClusterObject, KubeCluster, ObjectKind};
pub use manifests::{load_components, Component, ResourceBundle, DEFAULT_COMPONENTS};
pub use orchestrator::{
    detect_runtime, is_component_enabled, validate_component_names, Orchestrator, Session,
};
pub use readiness::check_daemon_set_ready;
pub use reconciler::{run_controller, ControllerState};
