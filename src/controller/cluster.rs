//! Cluster access for the component engine
//!
//! Every object the engine manages is one of a fixed set of kinds, modelled
//! as the closed [`ClusterObject`] sum type. All reads and writes go through
//! the [`ClusterApi`] trait so the orchestrator can run against the real API
//! server ([`KubeCluster`]) or an in-memory cluster in tests.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::error::{Error, Result};

/// Object kinds the engine knows how to apply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    ServiceAccount,
    Role,
    ClusterRole,
    RoleBinding,
    ClusterRoleBinding,
    ConfigMap,
    DaemonSet,
}

impl ObjectKind {
    /// Look up a kind by its manifest `kind:` value
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "ServiceAccount" => Some(ObjectKind::ServiceAccount),
            "Role" => Some(ObjectKind::Role),
            "ClusterRole" => Some(ObjectKind::ClusterRole),
            "RoleBinding" => Some(ObjectKind::RoleBinding),
            "ClusterRoleBinding" => Some(ObjectKind::ClusterRoleBinding),
            "ConfigMap" => Some(ObjectKind::ConfigMap),
            "DaemonSet" => Some(ObjectKind::DaemonSet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::Role => "Role",
            ObjectKind::ClusterRole => "ClusterRole",
            ObjectKind::RoleBinding => "RoleBinding",
            ObjectKind::ClusterRoleBinding => "ClusterRoleBinding",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::DaemonSet => "DaemonSet",
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, ObjectKind::ClusterRole | ObjectKind::ClusterRoleBinding)
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed object of one of the managed kinds
#[derive(Clone, Debug)]
pub enum ClusterObject {
    ServiceAccount(ServiceAccount),
    Role(Role),
    ClusterRole(ClusterRole),
    RoleBinding(RoleBinding),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    DaemonSet(DaemonSet),
}

impl ClusterObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ClusterObject::ServiceAccount(_) => ObjectKind::ServiceAccount,
            ClusterObject::Role(_) => ObjectKind::Role,
            ClusterObject::ClusterRole(_) => ObjectKind::ClusterRole,
            ClusterObject::RoleBinding(_) => ObjectKind::RoleBinding,
            ClusterObject::ClusterRoleBinding(_) => ObjectKind::ClusterRoleBinding,
            ClusterObject::ConfigMap(_) => ObjectKind::ConfigMap,
            ClusterObject::DaemonSet(_) => ObjectKind::DaemonSet,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ClusterObject::ServiceAccount(o) => &o.metadata,
            ClusterObject::Role(o) => &o.metadata,
            ClusterObject::ClusterRole(o) => &o.metadata,
            ClusterObject::RoleBinding(o) => &o.metadata,
            ClusterObject::ClusterRoleBinding(o) => &o.metadata,
            ClusterObject::ConfigMap(o) => &o.metadata,
            ClusterObject::DaemonSet(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> String {
        self.metadata().name.clone().unwrap_or_default()
    }
}

/// Operations the engine performs against the cluster
///
/// Namespaced kinds are addressed in `namespace`; cluster-scoped kinds
/// ignore it.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create an object. Fails with an `AlreadyExists` API error if present.
    async fn create(&self, namespace: &str, object: &ClusterObject) -> Result<()>;

    /// Overwrite an existing object. Fails with `NotFound` if absent.
    async fn replace(&self, namespace: &str, object: &ClusterObject) -> Result<()>;

    /// Delete an object by name. Fails with `NotFound` if absent.
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()>;

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ControllerRevision>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

/// `true` when the error is an API `404 NotFound`
pub fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
}

/// `true` when the error is an API `409 AlreadyExists`
pub fn is_already_exists(err: &Error) -> bool {
    matches!(
        err,
        Error::KubeError(kube::Error::Api(e)) if e.code == 409 && e.reason == "AlreadyExists"
    )
}

/// Render a label map as a label selector (`a=b,c=d`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`ClusterApi`] backed by a live kube-rs client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }
}

async fn create_object<K>(api: Api<K>, object: &K) -> Result<()>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), object).await?;
    Ok(())
}

async fn replace_object<K>(api: Api<K>, object: &K) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.replace(&object.name_any(), &PostParams::default(), object)
        .await?;
    Ok(())
}

async fn delete_object<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::default()).await?;
    Ok(())
}

#[async_trait]
impl ClusterApi for KubeCluster {
    #[instrument(skip(self, object), fields(kind = %object.kind(), name = %object.name()))]
    async fn create(&self, namespace: &str, object: &ClusterObject) -> Result<()> {
        match object {
            ClusterObject::ServiceAccount(o) => create_object(self.namespaced(namespace), o).await,
            ClusterObject::Role(o) => create_object(self.namespaced(namespace), o).await,
            ClusterObject::ClusterRole(o) => create_object(self.cluster(), o).await,
            ClusterObject::RoleBinding(o) => create_object(self.namespaced(namespace), o).await,
            ClusterObject::ClusterRoleBinding(o) => create_object(self.cluster(), o).await,
            ClusterObject::ConfigMap(o) => create_object(self.namespaced(namespace), o).await,
            ClusterObject::DaemonSet(o) => create_object(self.namespaced(namespace), o).await,
        }
    }

    #[instrument(skip(self, object), fields(kind = %object.kind(), name = %object.name()))]
    async fn replace(&self, namespace: &str, object: &ClusterObject) -> Result<()> {
        match object {
            ClusterObject::ServiceAccount(o) => replace_object(self.namespaced(namespace), o).await,
            ClusterObject::Role(o) => replace_object(self.namespaced(namespace), o).await,
            ClusterObject::ClusterRole(o) => replace_object(self.cluster(), o).await,
            ClusterObject::RoleBinding(o) => replace_object(self.namespaced(namespace), o).await,
            ClusterObject::ClusterRoleBinding(o) => replace_object(self.cluster(), o).await,
            ClusterObject::ConfigMap(o) => replace_object(self.namespaced(namespace), o).await,
            ClusterObject::DaemonSet(o) => replace_object(self.namespaced(namespace), o).await,
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        match kind {
            ObjectKind::ServiceAccount => {
                delete_object(self.namespaced::<ServiceAccount>(namespace), name).await
            }
            ObjectKind::Role => delete_object(self.namespaced::<Role>(namespace), name).await,
            ObjectKind::ClusterRole => delete_object(self.cluster::<ClusterRole>(), name).await,
            ObjectKind::RoleBinding => {
                delete_object(self.namespaced::<RoleBinding>(namespace), name).await
            }
            ObjectKind::ClusterRoleBinding => {
                delete_object(self.cluster::<ClusterRoleBinding>(), name).await
            }
            ObjectKind::ConfigMap => {
                delete_object(self.namespaced::<ConfigMap>(namespace), name).await
            }
            ObjectKind::DaemonSet => {
                delete_object(self.namespaced::<DaemonSet>(namespace), name).await
            }
        }
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = self.namespaced(namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ControllerRevision>> {
        let api: Api<ControllerRevision> = self.namespaced(namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = self.cluster();
        Ok(api.list(&ListParams::default()).await?.items)
    }
}
