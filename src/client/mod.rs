//! Resource Client Adapters
//!
//! Provides [`ResourceClient`](crate::domain::ports::ResourceClient)
//! implementations:
//! - Kube: live cluster access through the Kubernetes API
//! - Memory: in-process cluster model backing the test suite

pub mod kube;
pub mod memory;

pub use self::kube::KubeResourceClient;
pub use self::memory::{InMemoryCluster, Operation};
