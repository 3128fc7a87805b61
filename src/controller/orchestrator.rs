//! Component orchestration
//!
//! A [`Session`] carries everything one reconciliation pass needs. The
//! [`Orchestrator`] walks the loaded components in order, running each
//! component's appliers and folding their results into a single state.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::cluster::ClusterApi;
use super::manifests::Component;
use super::transforms::EnvLookup;
use crate::crd::{GpuCluster, GpuClusterSpec, Runtime, State};
use crate::error::{Error, Result};

/// State shared by all appliers during one pass
pub struct Session<'a> {
    pub cluster: &'a dyn ClusterApi,
    /// Namespace the components are deployed into
    pub namespace: String,
    /// The bound GpuCluster
    pub singleton: &'a GpuCluster,
    /// Container runtime detected on the nodes
    pub runtime: Runtime,
    /// Lookup for image fallbacks
    pub env: EnvLookup<'a>,
}

impl Session<'_> {
    pub fn is_enabled(&self, component: &str) -> bool {
        is_component_enabled(&self.singleton.spec, component)
    }
}

/// Enablement of a component by name; unknown names are never enabled
pub fn is_component_enabled(spec: &GpuClusterSpec, component: &str) -> bool {
    match spec.component(component) {
        Some(settings) => settings.is_enabled(),
        None => {
            error!("Unknown component {}, treating as disabled", component);
            false
        }
    }
}

/// Reject component names that have no enablement switch
pub fn validate_component_names<S: AsRef<str>>(names: &[S]) -> Result<()> {
    let spec = GpuClusterSpec::default();
    for name in names {
        if spec.component(name.as_ref()).is_none() {
            return Err(Error::UnknownComponent(name.as_ref().to_string()));
        }
    }
    Ok(())
}

/// Runtime of the first node reporting a recognized one, else `default`
pub fn detect_runtime(nodes: &[Node], default: Runtime) -> Runtime {
    nodes
        .iter()
        .find_map(|node| {
            let version = node
                .status
                .as_ref()?
                .node_info
                .as_ref()?
                .container_runtime_version
                .as_str();
            let runtime = Runtime::from_runtime_version(version);
            if runtime.is_none() {
                debug!("Node {} reports unknown runtime {}", node.name_any(), version);
            }
            runtime
        })
        .unwrap_or(default)
}

/// Forward-only sweep over the components of one pass
pub struct Orchestrator<'a> {
    session: Session<'a>,
    components: &'a [Component],
    cursor: usize,
}

impl<'a> Orchestrator<'a> {
    pub fn new(session: Session<'a>, components: &'a [Component]) -> Self {
        Self {
            session,
            components,
            cursor: 0,
        }
    }

    /// Index of the next component to apply
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= self.components.len()
    }

    /// Apply the component at the cursor and advance.
    ///
    /// The first failing applier stops the component; the cursor then stays
    /// put and the error is returned.
    pub async fn step(&mut self) -> Result<State> {
        let component = self.components.get(self.cursor).ok_or_else(|| {
            Error::ConfigError(format!(
                "no component at position {} of {}",
                self.cursor,
                self.components.len()
            ))
        })?;

        let state = apply_component(&self.session, component).await?;
        self.cursor += 1;
        Ok(state)
    }

    /// Step through every remaining component.
    ///
    /// The result is `Ready` only if every component is ready. A component
    /// that is not ready does not stop the sweep.
    pub async fn run_pass(&mut self) -> Result<State> {
        let mut overall = State::Ready;
        while !self.is_done() {
            if self.step().await? != State::Ready {
                overall = State::NotReady;
            }
        }
        Ok(overall)
    }
}

#[instrument(skip_all, fields(component = %component.name))]
async fn apply_component(session: &Session<'_>, component: &Component) -> Result<State> {
    let mut aggregate = State::Ready;

    for applier in &component.appliers {
        let state = applier.apply(session, component).await.map_err(|e| {
            error!(
                "Applier for {} failed in component {}: {}",
                applier.kind(),
                component.name,
                e
            );
            e
        })?;
        debug!("{} applier reported {}", applier.kind(), state);
        if state != State::Ready {
            aggregate = State::NotReady;
        }
    }

    if session.is_enabled(&component.name) {
        info!("Component {} is {}", component.name, aggregate);
        Ok(aggregate)
    } else {
        warn!("Component {} is disabled", component.name);
        Ok(State::Disabled)
    }
}
