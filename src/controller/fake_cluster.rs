//! In-memory [`ClusterApi`] for engine tests

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet, DaemonSetStatus};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use super::cluster::{ClusterApi, ClusterObject, ObjectKind};
use crate::error::{Error, Result};

/// Build a kube API error as the API server would return it
pub fn api_error(code: u16, reason: &str) -> Error {
    let response: kube::error::ErrorResponse = serde_json::from_value(serde_json::json!({
        "status": "Failure",
        "message": format!("fake {reason}"),
        "reason": reason,
        "code": code,
    }))
    .unwrap();
    Error::KubeError(kube::Error::Api(response))
}

/// A write recorded by the fake
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Create(ObjectKind, String),
    Replace(ObjectKind, String),
    Delete(ObjectKind, String),
}

type Key = (ObjectKind, String, String);

#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<Key, ClusterObject>>,
    calls: Mutex<Vec<Call>>,
    /// Status stamped on DaemonSets when they are created
    daemon_set_status: Mutex<Option<DaemonSetStatus>>,
    pods: Mutex<Vec<Pod>>,
    revisions: Mutex<Vec<ControllerRevision>>,
    nodes: Mutex<Vec<Node>>,
    /// Writes to this kind fail with a 500
    fail_kind: Mutex<Option<ObjectKind>>,
}

fn key(kind: ObjectKind, namespace: &str, name: &str) -> Key {
    let namespace = if kind.is_cluster_scoped() { "" } else { namespace };
    (kind, namespace.to_string(), name.to_string())
}

fn labels_match(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fake with DaemonSets that report every pod ready
    pub fn converged() -> Self {
        let fake = Self::new();
        fake.set_daemon_set_status(Some(DaemonSetStatus {
            desired_number_scheduled: 2,
            number_ready: 2,
            current_number_scheduled: 2,
            ..Default::default()
        }));
        fake
    }

    pub fn set_daemon_set_status(&self, status: Option<DaemonSetStatus>) {
        *self.daemon_set_status.lock().unwrap() = status;
    }

    pub fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn set_revisions(&self, revisions: Vec<ControllerRevision>) {
        *self.revisions.lock().unwrap() = revisions;
    }

    pub fn set_nodes(&self, nodes: Vec<Node>) {
        *self.nodes.lock().unwrap() = nodes;
    }

    pub fn fail_writes_of(&self, kind: Option<ObjectKind>) {
        *self.fail_kind.lock().unwrap() = kind;
    }

    /// Seed an object without recording a call
    pub fn insert(&self, namespace: &str, object: ClusterObject) {
        let key = key(object.kind(), namespace, &object.name());
        self.objects.lock().unwrap().insert(key, object);
    }

    pub fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<ClusterObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&key(kind, namespace, name))
            .cloned()
    }

    pub fn daemon_set(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        match self.get(ObjectKind::DaemonSet, namespace, name) {
            Some(ClusterObject::DaemonSet(ds)) => Some(ds),
            _ => None,
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_failure(&self, kind: ObjectKind) -> Result<()> {
        if *self.fail_kind.lock().unwrap() == Some(kind) {
            return Err(api_error(500, "InternalError"));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create(&self, namespace: &str, object: &ClusterObject) -> Result<()> {
        let kind = object.kind();
        let name = object.name();
        self.record(Call::Create(kind, name.clone()));
        self.check_failure(kind)?;

        let mut objects = self.objects.lock().unwrap();
        let key = key(kind, namespace, &name);
        if objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut object = object.clone();
        if let ClusterObject::DaemonSet(ds) = &mut object {
            ds.status = self.daemon_set_status.lock().unwrap().clone();
            ds.metadata.resource_version = Some("1".to_string());
        }
        objects.insert(key, object);
        Ok(())
    }

    async fn replace(&self, namespace: &str, object: &ClusterObject) -> Result<()> {
        let kind = object.kind();
        let name = object.name();
        self.record(Call::Replace(kind, name.clone()));
        self.check_failure(kind)?;

        let mut objects = self.objects.lock().unwrap();
        let key = key(kind, namespace, &name);
        let Some(existing) = objects.get(&key) else {
            return Err(api_error(404, "NotFound"));
        };
        let mut object = object.clone();
        if let (ClusterObject::DaemonSet(new), ClusterObject::DaemonSet(old)) =
            (&mut object, existing)
        {
            new.status = old.status.clone();
        }
        objects.insert(key, object);
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        self.record(Call::Delete(kind, name.to_string()));
        self.check_failure(kind)?;

        match self.objects.lock().unwrap().remove(&key(kind, namespace, name)) {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound")),
        }
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        Ok(self.daemon_set(namespace, name))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| labels_match(p.labels(), labels))
            .cloned()
            .collect())
    }

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ControllerRevision>> {
        Ok(self
            .revisions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.namespace().as_deref() == Some(namespace))
            .filter(|r| labels_match(r.labels(), labels))
            .cloned()
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().unwrap().clone())
    }
}
