//! Kind appliers
//!
//! One applier per object kind found in a component's manifests. Each applier
//! renders its template for the session, then creates, updates or (for a
//! disabled component) deletes the live object.

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::rbac::v1::Subject;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use super::cluster::{is_already_exists, is_not_found, ClusterObject, ObjectKind};
use super::drift::{daemon_set_hash, set_hash, stored_hash};
use super::manifests::Component;
use super::orchestrator::Session;
use super::readiness::check_daemon_set_ready;
use super::transforms::{merge_map, transform_daemon_set, VGPU_DEVICE_CONFIG_MAP};
use crate::crd::{GpuCluster, GpuClusterSpec, State};
use crate::error::Result;

/// Reconciles the objects of one kind within a component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applier {
    ServiceAccount,
    Role,
    ClusterRole,
    RoleBinding,
    ClusterRoleBinding,
    /// All ConfigMaps of the component, in discovery order
    ConfigMaps,
    DaemonSet,
}

impl Applier {
    pub fn for_kind(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::ServiceAccount => Applier::ServiceAccount,
            ObjectKind::Role => Applier::Role,
            ObjectKind::ClusterRole => Applier::ClusterRole,
            ObjectKind::RoleBinding => Applier::RoleBinding,
            ObjectKind::ClusterRoleBinding => Applier::ClusterRoleBinding,
            ObjectKind::ConfigMap => Applier::ConfigMaps,
            ObjectKind::DaemonSet => Applier::DaemonSet,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Applier::ServiceAccount => ObjectKind::ServiceAccount,
            Applier::Role => ObjectKind::Role,
            Applier::ClusterRole => ObjectKind::ClusterRole,
            Applier::RoleBinding => ObjectKind::RoleBinding,
            Applier::ClusterRoleBinding => ObjectKind::ClusterRoleBinding,
            Applier::ConfigMaps => ObjectKind::ConfigMap,
            Applier::DaemonSet => ObjectKind::DaemonSet,
        }
    }

    /// Apply this kind's objects of `component`
    pub async fn apply(&self, session: &Session<'_>, component: &Component) -> Result<State> {
        let bundle = &component.bundle;
        let namespace = session.namespace.as_str();

        let object = match self {
            Applier::ServiceAccount => bundle.service_account.clone().map(|mut o| {
                o.metadata.namespace = Some(namespace.to_string());
                ClusterObject::ServiceAccount(o)
            }),
            Applier::Role => bundle.role.clone().map(|mut o| {
                o.metadata.namespace = Some(namespace.to_string());
                ClusterObject::Role(o)
            }),
            Applier::ClusterRole => bundle.cluster_role.clone().map(ClusterObject::ClusterRole),
            Applier::RoleBinding => bundle.role_binding.clone().map(|mut o| {
                o.metadata.namespace = Some(namespace.to_string());
                set_subject_namespace(o.subjects.as_mut(), namespace);
                ClusterObject::RoleBinding(o)
            }),
            Applier::ClusterRoleBinding => bundle.cluster_role_binding.clone().map(|mut o| {
                set_subject_namespace(o.subjects.as_mut(), namespace);
                ClusterObject::ClusterRoleBinding(o)
            }),
            Applier::ConfigMaps => return apply_config_maps(session, component).await,
            Applier::DaemonSet => return apply_daemon_set(session, component).await,
        };

        let Some(object) = object else {
            return Ok(State::Ready);
        };
        // ServiceAccounts carry generated token references; never overwrite them
        let update_existing = *self != Applier::ServiceAccount;
        apply_object(session, component, object, update_existing).await
    }
}

fn set_subject_namespace(subjects: Option<&mut Vec<Subject>>, namespace: &str) {
    for subject in subjects.into_iter().flatten() {
        if subject.kind == "ServiceAccount" {
            subject.namespace = Some(namespace.to_string());
        }
    }
}

/// Controller owner reference pointing at the GpuCluster
pub fn owner_reference(cluster: &GpuCluster) -> OwnerReference {
    OwnerReference {
        api_version: GpuCluster::api_version(&()).to_string(),
        kind: GpuCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn set_owner(metadata: &mut ObjectMeta, cluster: &GpuCluster) {
    metadata.owner_references = Some(vec![owner_reference(cluster)]);
}

fn metadata_mut(object: &mut ClusterObject) -> &mut ObjectMeta {
    match object {
        ClusterObject::ServiceAccount(o) => &mut o.metadata,
        ClusterObject::Role(o) => &mut o.metadata,
        ClusterObject::ClusterRole(o) => &mut o.metadata,
        ClusterObject::RoleBinding(o) => &mut o.metadata,
        ClusterObject::ClusterRoleBinding(o) => &mut o.metadata,
        ClusterObject::ConfigMap(o) => &mut o.metadata,
        ClusterObject::DaemonSet(o) => &mut o.metadata,
    }
}

/// Delete an object of a disabled component; a missing object is fine
async fn delete_object(session: &Session<'_>, kind: ObjectKind, name: &str) -> Result<()> {
    match session.cluster.delete(kind, &session.namespace, name).await {
        Ok(()) => {
            info!("Deleted {} {}", kind, name);
            Ok(())
        }
        Err(e) if is_not_found(&e) => {
            debug!("{} {} not found, already deleted", kind, name);
            Ok(())
        }
        Err(e) => {
            error!("Failed to delete {} {}: {}", kind, name, e);
            Err(e)
        }
    }
}

/// Create `object`, falling back to an update when it already exists
#[instrument(skip_all, fields(component = %component.name, kind = %object.kind(), name = %object.name()))]
async fn apply_object(
    session: &Session<'_>,
    component: &Component,
    mut object: ClusterObject,
    update_existing: bool,
) -> Result<State> {
    let kind = object.kind();
    let name = object.name();

    if !session.is_enabled(&component.name) {
        delete_object(session, kind, &name).await?;
        return Ok(State::Disabled);
    }

    set_owner(metadata_mut(&mut object), session.singleton);

    match session.cluster.create(&session.namespace, &object).await {
        Ok(()) => {
            info!("Created {} {}", kind, name);
            Ok(State::Ready)
        }
        Err(e) if is_already_exists(&e) => {
            if !update_existing {
                debug!("{} {} exists, skipping update", kind, name);
                return Ok(State::Ready);
            }
            session
                .cluster
                .replace(&session.namespace, &object)
                .await
                .map_err(|e| {
                    error!("Failed to update {} {}: {}", kind, name, e);
                    e
                })?;
            debug!("Updated {} {}", kind, name);
            Ok(State::Ready)
        }
        Err(e) => {
            error!("Failed to create {} {}: {}", kind, name, e);
            Err(e)
        }
    }
}

/// User ConfigMap that replaces the default ConfigMap `name`, if configured
pub fn config_map_override<'a>(spec: &'a GpuClusterSpec, name: &str) -> Option<&'a str> {
    match name {
        VGPU_DEVICE_CONFIG_MAP => spec.vgpu_device_manager.config_name(),
        _ => None,
    }
}

async fn apply_config_maps(session: &Session<'_>, component: &Component) -> Result<State> {
    let mut result = State::Ready;

    for template in &component.bundle.config_maps {
        let mut cm = template.clone();
        cm.metadata.namespace = Some(session.namespace.clone());
        let name = cm.name_any();

        if session.is_enabled(&component.name) {
            if let Some(custom) = config_map_override(&session.singleton.spec, &name) {
                info!(
                    "Not creating ConfigMap {}, custom ConfigMap provided: {}",
                    name, custom
                );
                continue;
            }
        }

        let state =
            apply_object(session, component, ClusterObject::ConfigMap(cm), true).await?;
        if state != State::Ready {
            result = state;
        }
    }

    Ok(result)
}

#[instrument(skip_all, fields(component = %component.name))]
async fn apply_daemon_set(session: &Session<'_>, component: &Component) -> Result<State> {
    let Some(template) = component.bundle.daemon_set.as_ref() else {
        return Ok(State::Ready);
    };
    let namespace = session.namespace.as_str();
    let mut ds: DaemonSet = template.clone();
    ds.metadata.namespace = Some(namespace.to_string());
    let name = ds.name_any();

    if !session.is_enabled(&component.name) {
        delete_object(session, ObjectKind::DaemonSet, &name).await?;
        return Ok(State::Disabled);
    }

    let spec = &session.singleton.spec;
    transform_daemon_set(&mut ds, spec, session.runtime, session.env).map_err(|e| {
        error!("Failed to render DaemonSet {}: {}", name, e);
        e
    })?;

    set_owner(&mut ds.metadata, session.singleton);
    let daemon_sets = &spec.daemon_sets;
    if !daemon_sets.labels.is_empty() {
        ds.metadata.labels = Some(merge_map(
            ds.metadata.labels.as_ref(),
            &daemon_sets.labels,
            &[],
        ));
    }
    if !daemon_sets.annotations.is_empty() {
        ds.metadata.annotations = Some(merge_map(
            ds.metadata.annotations.as_ref(),
            &daemon_sets.annotations,
            &[],
        ));
    }

    let hash = daemon_set_hash(&ds)?;
    let live = session
        .cluster
        .get_daemon_set(namespace, &name)
        .await
        .map_err(|e| {
            error!("Failed to get DaemonSet {}: {}", name, e);
            e
        })?;

    match live {
        None => {
            info!("DaemonSet {} not found, creating", name);
            set_hash(&mut ds, hash);
            session
                .cluster
                .create(namespace, &ClusterObject::DaemonSet(ds))
                .await
                .map_err(|e| {
                    error!("Failed to create DaemonSet {}: {}", name, e);
                    e
                })?;
        }
        Some(live) if stored_hash(&live) == Some(hash.as_str()) => {
            debug!("DaemonSet {} unchanged, skipping update", name);
        }
        Some(live) => {
            info!("DaemonSet {} changed, updating", name);
            set_hash(&mut ds, hash);
            ds.metadata.resource_version = live.metadata.resource_version;
            session
                .cluster
                .replace(namespace, &ClusterObject::DaemonSet(ds))
                .await
                .map_err(|e| {
                    error!("Failed to update DaemonSet {}: {}", name, e);
                    e
                })?;
        }
    }

    Ok(check_daemon_set_ready(session.cluster, namespace, &name).await)
}
