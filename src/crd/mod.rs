//! Custom Resource Definitions for the GPU operator
//!
//! This module defines the Kubernetes CRD that declares the desired GPU
//! component set.

mod gpu_cluster;
pub mod types;


pub use gpu_cluster::{GpuCluster, GpuClusterSpec, GpuClusterStatus};
pub use types::*;
