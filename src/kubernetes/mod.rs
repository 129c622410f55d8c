//! Kubernetes Adapter
//!
//! kube-rs backed implementations of the cluster port and type discovery.

pub mod client;
pub mod discovery;

pub use client::KubeClusterClient;
pub use discovery::{discover_types, run_discovery};
