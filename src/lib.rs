//! k8s-gpu-operator: Kubernetes operator for GPU support components
//!
//! This crate deploys the GPU device plugin, the KubeVirt device plugin,
//! the vGPU device manager and the VFIO manager from per-component manifest
//! directories, driven by a single cluster-scoped `GpuCluster` resource.

pub mod controller;
pub mod crd;
pub mod error;

pub use crate::error::{Error, Result};
