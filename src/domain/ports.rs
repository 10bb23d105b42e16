//! Domain Ports - Core trait definitions for the migrator
//!
//! These traits define the boundaries between the migration engine and the
//! outside world: the cluster API, the operator at the terminal, and the
//! progress display. Adapters implement these traits to provide concrete
//! functionality.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use std::sync::Arc;

// =============================================================================
// Resource References
// =============================================================================

/// The four resource kinds the migrator touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    PersistentVolumeClaim,
    PersistentVolume,
    Pod,
    Job,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::PersistentVolumeClaim => write!(f, "PersistentVolumeClaim"),
            ResourceKind::PersistentVolume => write!(f, "PersistentVolume"),
            ResourceKind::Pod => write!(f, "Pod"),
            ResourceKind::Job => write!(f, "Job"),
        }
    }
}

/// Locates a single resource in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    /// `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn namespaced(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

// =============================================================================
// Volume Patches
// =============================================================================

/// Partial updates the migrator applies to a PersistentVolume
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumePatch {
    /// Replace `spec.persistentVolumeReclaimPolicy`
    ReclaimPolicy(String),
    /// Remove `spec.claimRef`, releasing the volume
    RemoveClaimRef,
}

impl VolumePatch {
    /// JSON merge patch body for this update
    pub fn to_merge_patch(&self) -> serde_json::Value {
        match self {
            VolumePatch::ReclaimPolicy(policy) => serde_json::json!({
                "spec": { "persistentVolumeReclaimPolicy": policy }
            }),
            VolumePatch::RemoveClaimRef => serde_json::json!({
                "spec": { "claimRef": null }
            }),
        }
    }
}

// =============================================================================
// Poll Results
// =============================================================================

/// Outcome of a single poll evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Pending,
    Succeeded,
    Failed,
}

impl PollResult {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PollResult::Pending)
    }
}

// =============================================================================
// Resource Client Port
// =============================================================================

/// Port for cluster resource operations
///
/// Reads of absent objects must fail with [`crate::Error::ResourceNotFound`]
/// so callers can tell deletion apart from transport failures.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Read a claim
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim>;

    /// Create a claim
    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// Delete a claim (returns once the API accepted the request)
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;

    /// List pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// List all PersistentVolumes (cluster-scoped)
    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>>;

    /// Apply a partial update to a PersistentVolume
    async fn patch_volume(&self, name: &str, patch: &VolumePatch) -> Result<PersistentVolume>;

    /// Create a batch job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;

    /// Read a batch job including its status counters
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job>;

    /// Delete a batch job together with its pods
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
}

// =============================================================================
// Interaction Ports
// =============================================================================

/// Port for the operator confirmation between steps
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    /// Present `prompt` and return whether the operator approved
    async fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Port for the single-line progress display used while polling
pub trait ProgressReporter: Send + Sync {
    /// Replace the current progress line
    fn update(&self, line: &str);

    /// Print a standalone message
    fn message(&self, line: &str);

    /// Terminate the current progress line
    fn finish(&self);
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceClientRef = Arc<dyn ResourceClient>;
pub type ConfirmationGateRef = Arc<dyn ConfirmationGate>;
pub type ProgressReporterRef = Arc<dyn ProgressReporter>;
