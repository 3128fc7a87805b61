//! Rollout readiness of component DaemonSets
//!
//! A DaemonSet is ready when every scheduled pod is ready. With the
//! `OnDelete` strategy old pods keep running after a template change, so the
//! pods themselves must also be on the current controller revision.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use super::cluster::ClusterApi;
use crate::crd::State;

/// Label the DaemonSet controller puts on pods with their template revision
pub const REVISION_HASH_LABEL: &str = "controller-revision-hash";

/// Outcome of looking at the DaemonSet status alone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusVerdict {
    Ready,
    NotReady,
    /// Counters look settled but pods must be checked against the revision
    CheckPods,
}

/// Judge readiness from the DaemonSet's status counters and update strategy
pub fn evaluate_status(ds: &DaemonSet) -> StatusVerdict {
    let Some(status) = ds.status.as_ref() else {
        return StatusVerdict::NotReady;
    };

    let on_delete = is_on_delete(ds);
    if status.desired_number_scheduled == status.number_ready {
        return if on_delete {
            StatusVerdict::CheckPods
        } else {
            StatusVerdict::Ready
        };
    }
    if status.number_unavailable.unwrap_or(0) != 0 {
        return StatusVerdict::NotReady;
    }
    if !on_delete {
        return StatusVerdict::NotReady;
    }
    StatusVerdict::CheckPods
}

fn is_on_delete(ds: &DaemonSet) -> bool {
    ds.spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.type_.as_deref())
        == Some("OnDelete")
}

/// Hash of the newest ControllerRevision belonging to `ds`.
///
/// Revisions are named `<daemonset>-<hash>`.
pub fn current_revision_hash(ds: &DaemonSet, revisions: &[ControllerRevision]) -> Option<String> {
    let name = ds.name_any();
    let prefix = format!("{name}-");
    revisions
        .iter()
        .filter(|r| r.name_any().starts_with(&prefix))
        .max_by_key(|r| r.revision)
        .and_then(|r| r.name_any().strip_prefix(&prefix).map(str::to_string))
}

/// Every pod runs the current revision, is `Running` and has all containers ready
pub fn pods_ready(pods: &[Pod], revision: &str) -> bool {
    if pods.is_empty() {
        return false;
    }
    pods.iter().all(|pod| {
        let pod_revision = pod.labels().get(REVISION_HASH_LABEL);
        let Some(pod_revision) = pod_revision else {
            debug!("Pod {} has no {} label", pod.name_any(), REVISION_HASH_LABEL);
            return false;
        };
        let status = pod.status.as_ref();
        let running = status.and_then(|s| s.phase.as_deref()) == Some("Running");
        let containers_ready = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| statuses.iter().all(|c| c.ready))
            .unwrap_or(true);
        pod_revision == revision && running && containers_ready
    })
}

/// Read back the DaemonSet and decide whether its rollout converged.
///
/// Lookup failures are reported as `NotReady`; the caller re-polls.
#[instrument(skip(cluster))]
pub async fn check_daemon_set_ready(cluster: &dyn ClusterApi, namespace: &str, name: &str) -> State {
    let ds = match cluster.get_daemon_set(namespace, name).await {
        Ok(Some(ds)) => ds,
        Ok(None) => {
            warn!("DaemonSet {}/{} not found while checking readiness", namespace, name);
            return State::NotReady;
        }
        Err(e) => {
            warn!("Failed to get DaemonSet {}/{}: {}", namespace, name, e);
            return State::NotReady;
        }
    };

    match evaluate_status(&ds) {
        StatusVerdict::Ready => State::Ready,
        StatusVerdict::NotReady => State::NotReady,
        StatusVerdict::CheckPods => check_pods(cluster, namespace, &ds).await,
    }
}

async fn check_pods(cluster: &dyn ClusterApi, namespace: &str, ds: &DaemonSet) -> State {
    let spec = ds.spec.as_ref();
    let pod_labels = spec
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    let selector_labels: BTreeMap<String, String> = spec
        .and_then(|s| s.selector.match_labels.clone())
        .unwrap_or_default();

    let pods = match cluster.list_pods(namespace, &pod_labels).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!("Failed to list pods of DaemonSet {}: {}", ds.name_any(), e);
            return State::NotReady;
        }
    };

    let revisions = match cluster
        .list_controller_revisions(namespace, &selector_labels)
        .await
    {
        Ok(revisions) => revisions,
        Err(e) => {
            warn!("Failed to list revisions of DaemonSet {}: {}", ds.name_any(), e);
            return State::NotReady;
        }
    };
    let Some(revision) = current_revision_hash(ds, &revisions) else {
        warn!("No controller revision found for DaemonSet {}", ds.name_any());
        return State::NotReady;
    };

    if pods_ready(&pods, &revision) {
        State::Ready
    } else {
        State::NotReady
    }
}
