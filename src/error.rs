//! Error types for the GPU operator

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API call failed
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Operator or custom resource configuration is unusable
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A manifest of a recognized kind could not be decoded
    #[error("Failed to decode {kind} manifest {path}: {source}")]
    ManifestError {
        path: PathBuf,
        kind: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Reading the manifest directory failed
    #[error("Failed to read {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A DaemonSet template could not be rendered from the GpuCluster spec
    #[error("Failed to transform DaemonSet {name}: {message}")]
    TransformError { name: String, message: String },

    /// No image could be resolved from the GpuCluster or the environment
    #[error("Empty image path in both GpuCluster spec and env {0}")]
    ImageResolutionError(String),

    /// Component name is not in the enablement lookup
    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Whether a later pass with the same input may succeed.
    ///
    /// Cluster API failures are transient. Everything else stems from the
    /// manifests or the GpuCluster spec and fails the same way until one of
    /// them changes.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::KubeError(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
