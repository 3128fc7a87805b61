//! Main reconciler for GpuCluster resources
//!
//! Implements the controller pattern using kube-rs runtime. Each reconcile
//! runs one forward sweep of the component orchestrator.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use once_cell::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

use super::cluster::{ClusterApi, KubeCluster};
use super::conditions::{
    find_condition, is_condition_true, set_ready_condition, CONDITION_STATUS_TRUE,
    CONDITION_TYPE_READY,
};
use super::manifests::{load_components, Component};
use super::orchestrator::{detect_runtime, validate_component_names, Orchestrator, Session};
use crate::crd::{GpuCluster, GpuClusterStatus, State};
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "k8s-gpu-operator";

const REQUEUE_ON_ERROR: Duration = Duration::from_secs(10);
const REQUEUE_NOT_READY: Duration = Duration::from_secs(10);
const REQUEUE_READY: Duration = Duration::from_secs(300);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    /// Namespace the components are deployed into
    pub namespace: String,
    /// Root of the per-component manifest directories
    pub manifest_dir: PathBuf,
    /// Components to deploy, in order
    pub component_names: Vec<String>,
    components: OnceCell<Vec<Component>>,
    bound_singleton: Mutex<Option<String>>,
}

impl ControllerState {
    pub fn new(
        client: Client,
        namespace: String,
        manifest_dir: PathBuf,
        component_names: Vec<String>,
    ) -> Self {
        Self {
            client,
            namespace,
            manifest_dir,
            component_names,
            components: OnceCell::new(),
            bound_singleton: Mutex::new(None),
        }
    }

    /// Load the component manifests on first use; later calls return the
    /// already loaded set.
    pub fn initialize(&self) -> Result<&[Component]> {
        let components = self.components.get_or_try_init(|| {
            validate_component_names(&self.component_names)?;
            load_components(&self.manifest_dir, &self.component_names)
        })?;
        Ok(components)
    }

    /// Name of the GpuCluster this process reconciles, if one was seen
    pub fn bound_singleton(&self) -> Option<String> {
        self.bound_singleton
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Bind `name` unless another instance is already bound.
    ///
    /// Returns `true` when `name` is the bound instance.
    pub fn bind_singleton(&self, name: &str) -> bool {
        let mut bound = self
            .bound_singleton
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match bound.as_deref() {
            Some(existing) => existing == name,
            None => {
                *bound = Some(name.to_string());
                true
            }
        }
    }

    /// Move the binding from `expected` to `name`.
    ///
    /// Only succeeds while `expected` is still bound, so of several
    /// instances racing to replace a deleted one exactly one wins.
    pub fn rebind_singleton(&self, expected: &str, name: &str) -> bool {
        let mut bound = self
            .bound_singleton
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match bound.as_deref() {
            Some(existing) if existing == name => true,
            Some(existing) if existing == expected => {
                *bound = Some(name.to_string());
                true
            }
            Some(_) => false,
            None => {
                *bound = Some(name.to_string());
                true
            }
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let gpu_clusters: Api<GpuCluster> = Api::all(client.clone());

    info!("Starting GpuCluster controller");

    match gpu_clusters.list(&Default::default()).await {
        Ok(_) => info!("GpuCluster CRD is available"),
        Err(e) => {
            error!(
                "GpuCluster CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "GpuCluster CRD not installed".to_string(),
            ));
        }
    }

    // Fail fast on malformed manifests
    state.initialize()?;

    let namespace = state.namespace.clone();
    Controller::new(gpu_clusters, Config::default())
        .owns::<DaemonSet>(Api::namespaced(client.clone(), &namespace), Config::default())
        .owns::<ConfigMap>(Api::namespaced(client.clone(), &namespace), Config::default())
        .owns::<ServiceAccount>(Api::namespaced(client.clone(), &namespace), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// Called whenever a GpuCluster or one of the objects it owns changes, and
/// when the requeue timer expires.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any()))]
async fn reconcile(obj: Arc<GpuCluster>, ctx: Arc<ControllerState>) -> Result<Action> {
    let name = obj.name_any();
    let api: Api<GpuCluster> = Api::all(ctx.client.clone());

    if !ctx.bind_singleton(&name) {
        let bound = ctx.bound_singleton().unwrap_or_default();
        let bound_exists = api.get_opt(&bound).await?.is_some();
        if bound_exists || !ctx.rebind_singleton(&bound, &name) {
            warn!(
                "GpuCluster {} ignored, {} is already reconciled by this operator",
                name,
                ctx.bound_singleton().unwrap_or(bound)
            );
            update_status(&api, &obj, State::Ignored, Some(&ctx.namespace)).await?;
            return Ok(Action::requeue(REQUEUE_NOT_READY));
        }
        info!("Bound GpuCluster {} no longer exists, binding {}", bound, name);
    }

    info!("Reconciling GpuCluster {}", name);

    let components = ctx.initialize()?;
    let cluster = KubeCluster::new(ctx.client.clone());
    let default_runtime = obj.spec.operator.default_runtime;
    let runtime = match cluster.list_nodes().await {
        Ok(nodes) => detect_runtime(&nodes, default_runtime),
        Err(e) => {
            warn!("Failed to list nodes, assuming {}: {}", default_runtime, e);
            default_runtime
        }
    };
    debug!("Container runtime: {}", runtime);

    let env = |key: &str| std::env::var(key).ok();
    let session = Session {
        cluster: &cluster,
        namespace: ctx.namespace.clone(),
        singleton: &obj,
        runtime,
        env: &env,
    };

    let mut orchestrator = Orchestrator::new(session, components);
    let state = match orchestrator.run_pass().await {
        Ok(state) => state,
        Err(e) => {
            error!(
                "Pass for GpuCluster {} failed at component {}: {}",
                name,
                orchestrator.cursor(),
                e
            );
            update_status(&api, &obj, State::NotReady, Some(&ctx.namespace)).await?;
            return Err(e);
        }
    };

    update_status(&api, &obj, state, Some(&ctx.namespace)).await?;
    info!("GpuCluster {} is {}", name, state);

    if state == State::Ready {
        Ok(Action::requeue(REQUEUE_READY))
    } else {
        Ok(Action::requeue(REQUEUE_NOT_READY))
    }
}

/// Update the status subresource of a GpuCluster
async fn update_status(
    api: &Api<GpuCluster>,
    obj: &GpuCluster,
    state: State,
    namespace: Option<&str>,
) -> Result<()> {
    let mut status = obj.status.clone().unwrap_or_else(GpuClusterStatus::default);
    status.state = state;
    if let Some(namespace) = namespace {
        status.namespace = Some(namespace.to_string());
    }
    let was_ready = is_condition_true(&status.conditions, CONDITION_TYPE_READY);
    set_ready_condition(&mut status.conditions, state);
    if let Some(ready) = find_condition(&status.conditions, CONDITION_TYPE_READY) {
        if was_ready != (ready.status == CONDITION_STATUS_TRUE) {
            info!(
                "GpuCluster {} Ready condition is now {}: {}",
                obj.name_any(),
                ready.status,
                ready.reason
            );
        }
    }

    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    Ok(())
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(obj: Arc<GpuCluster>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    if error.is_retriable() {
        warn!("Reconciliation error for {}: {:?}", obj.name_any(), error);
    } else {
        error!(
            "Configuration error for {}, fix the GpuCluster or manifests: {:?}",
            obj.name_any(),
            error
        );
    }

    Action::requeue(REQUEUE_ON_ERROR)
}
