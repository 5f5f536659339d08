//! Mock Kubernetes API server for workload apply tests.
//!
//! Provides an HTTP server that can be used with kubeconfig-based
//! connections, serving workload resources, namespaces, watch streams and
//! the Local Source Proxy endpoints.

pub mod http;

pub use http::{MockCluster, RunningMockCluster};
