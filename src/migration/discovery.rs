//! Discovery
//!
//! One-shot, read-only resolution of everything a migration needs: the
//! claim, the volume bound to it, and the pods mounting it. Every field the
//! steps consume is validated here, so a [`RunContext`] only exists when
//! the migration can be planned.

use crate::domain::ports::{ResourceClient, ResourceKind, ResourceRef};
use crate::error::{Error, Result};
use crate::migration::identity::{RunId, MAX_JOB_NAME_LEN};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use parking_lot::RwLock;
use tracing::{debug, info};

const CLAIM_KIND: &str = "PersistentVolumeClaim";

// =============================================================================
// Run Context
// =============================================================================

/// Inputs of one migration run, resolved and validated by [`Discovery`]
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub namespace: String,
    pub claim_name: String,
    /// Storage class the claim moves to
    pub target_class: String,
    /// The claim as read before any mutation
    pub claim: PersistentVolumeClaim,
    /// Storage class the claim currently uses
    pub source_class: String,
    pub access_modes: Vec<String>,
    /// `spec.resources.requests.storage` of the claim
    pub storage_request: Quantity,
    /// The Bound volume whose claimRef matches the claim
    pub volume: PersistentVolume,
    pub volume_name: String,
    mounting_workloads: RwLock<Vec<ResourceRef>>,
}

impl RunContext {
    /// Pods last seen mounting the claim
    pub fn mounting_workloads(&self) -> Vec<ResourceRef> {
        self.mounting_workloads.read().clone()
    }

    pub(crate) fn set_mounting_workloads(&self, workloads: Vec<ResourceRef>) {
        *self.mounting_workloads.write() = workloads;
    }
}

// =============================================================================
// Matching
// =============================================================================

/// Whether `volume` is Bound and its claimRef carries `claim_uid`
pub fn volume_bound_to(volume: &PersistentVolume, claim_uid: &str) -> bool {
    let bound = volume
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Bound");

    bound
        && volume
            .spec
            .as_ref()
            .and_then(|s| s.claim_ref.as_ref())
            .and_then(|r| r.uid.as_deref())
            == Some(claim_uid)
}

/// Whether any of the pod's volumes is a claim source naming `claim_name`
pub fn pod_mounts_claim(pod: &Pod, claim_name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .map(|source| source.claim_name == claim_name)
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

// =============================================================================
// Discovery
// =============================================================================

/// Read-only resolver over a [`ResourceClient`]
pub struct Discovery<'a> {
    client: &'a dyn ResourceClient,
}

impl<'a> Discovery<'a> {
    pub fn new(client: &'a dyn ResourceClient) -> Self {
        Self { client }
    }

    /// Find the Bound volume whose claimRef uid matches the claim
    pub async fn resolve_bound_volume(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<Option<PersistentVolume>> {
        let name = claim.metadata.name.as_deref().unwrap_or_default();
        let uid = claim
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| Error::missing(CLAIM_KIND, name, "metadata.uid"))?;

        let volumes = self.client.list_volumes().await?;
        debug!("Scanning {} volumes for claim uid {}", volumes.len(), uid);

        Ok(volumes.into_iter().find(|v| volume_bound_to(v, uid)))
    }

    /// Every pod in `namespace` with a volume sourced from `claim_name`
    pub async fn resolve_mounting_workloads(
        &self,
        claim_name: &str,
        namespace: &str,
    ) -> Result<Vec<ResourceRef>> {
        let pods = self.client.list_pods(namespace).await?;

        Ok(pods
            .iter()
            .filter(|pod| pod_mounts_claim(pod, claim_name))
            .filter_map(|pod| pod.metadata.name.as_deref())
            .map(|name| ResourceRef::namespaced(ResourceKind::Pod, namespace, name))
            .collect())
    }

    /// Resolve and validate all inputs of a run
    pub async fn discover(
        &self,
        namespace: &str,
        claim_name: &str,
        target_class: &str,
    ) -> Result<RunContext> {
        let claim = self
            .client
            .get_claim(namespace, claim_name)
            .await
            .map_err(|e| Error::ClaimUnavailable {
                namespace: namespace.to_string(),
                name: claim_name.to_string(),
                reason: e.to_string(),
            })?;

        let spec = claim
            .spec
            .as_ref()
            .ok_or_else(|| Error::missing(CLAIM_KIND, claim_name, "spec"))?;
        let source_class = spec
            .storage_class_name
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::missing(CLAIM_KIND, claim_name, "spec.storageClassName"))?;
        let access_modes = spec
            .access_modes
            .clone()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::missing(CLAIM_KIND, claim_name, "spec.accessModes"))?;
        let storage_request = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .cloned()
            .ok_or_else(|| {
                Error::missing(CLAIM_KIND, claim_name, "spec.resources.requests.storage")
            })?;

        if source_class == target_class {
            return Err(Error::Configuration(format!(
                "Claim {}/{} already uses storage class {}",
                namespace, claim_name, target_class
            )));
        }

        let run_id = RunId::generate();
        let job_name = run_id.copy_job_name(claim_name);
        if job_name.len() > MAX_JOB_NAME_LEN {
            return Err(Error::Configuration(format!(
                "Claim name {} is too long: copy job {} would exceed {} characters",
                claim_name, job_name, MAX_JOB_NAME_LEN
            )));
        }

        let volume = self
            .resolve_bound_volume(&claim)
            .await?
            .ok_or_else(|| Error::NoBoundVolume {
                namespace: namespace.to_string(),
                name: claim_name.to_string(),
            })?;
        let volume_name = volume
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::missing("PersistentVolume", "", "metadata.name"))?;

        let workloads = self
            .resolve_mounting_workloads(claim_name, namespace)
            .await?;

        info!(
            "Discovered claim {}/{} on volume {} ({} mounting pods), run {}",
            namespace,
            claim_name,
            volume_name,
            workloads.len(),
            run_id
        );

        Ok(RunContext {
            run_id,
            namespace: namespace.to_string(),
            claim_name: claim_name.to_string(),
            target_class: target_class.to_string(),
            claim,
            source_class,
            access_modes,
            storage_request,
            volume,
            volume_name,
            mounting_workloads: RwLock::new(workloads),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InMemoryCluster, Operation};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{
        ObjectReference, PersistentVolumeSpec, PersistentVolumeStatus, PodSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn volume(phase: &str, uid: Option<&str>) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-x".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                claim_ref: uid.map(|u| ObjectReference {
                    uid: Some(u.into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_volume_bound_to() {
        assert!(volume_bound_to(&volume("Bound", Some("abc")), "abc"));
        assert!(!volume_bound_to(&volume("Bound", Some("other")), "abc"));
        assert!(!volume_bound_to(&volume("Released", Some("abc")), "abc"));
        assert!(!volume_bound_to(&volume("Bound", None), "abc"));
    }

    #[test]
    fn test_pod_without_volumes_does_not_mount() {
        let bare = Pod::default();
        assert!(!pod_mounts_claim(&bare, "data"));

        let no_volumes = Pod {
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        assert!(!pod_mounts_claim(&no_volumes, "data"));
    }

    #[tokio::test]
    async fn test_resolve_mounting_workloads() {
        let cluster = InMemoryCluster::new();
        cluster.add_pod("apps", "web-0", &["data", "cache"]);
        cluster.add_pod("apps", "web-1", &["cache"]);
        cluster.add_pod("other", "web-2", &["data"]);
        cluster.insert_pod(Pod {
            metadata: ObjectMeta {
                name: Some("bare".into()),
                namespace: Some("apps".into()),
                ..Default::default()
            },
            ..Default::default()
        });

        let discovery = Discovery::new(&cluster);
        let workloads = discovery
            .resolve_mounting_workloads("data", "apps")
            .await
            .unwrap();

        assert_eq!(
            workloads,
            vec![ResourceRef::namespaced(ResourceKind::Pod, "apps", "web-0")]
        );
        assert!(discovery
            .resolve_mounting_workloads("unused", "apps")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_discover_resolves_context() {
        let cluster = InMemoryCluster::new();
        cluster.seed_bound_claim("apps", "data", "standard", "pv-1", "5Gi");
        cluster.seed_bound_claim("apps", "logs", "standard", "pv-2", "1Gi");
        cluster.add_pod("apps", "db-0", &["data"]);

        let ctx = Discovery::new(&cluster)
            .discover("apps", "data", "fast")
            .await
            .unwrap();

        assert_eq!(ctx.volume_name, "pv-1");
        assert_eq!(ctx.source_class, "standard");
        assert_eq!(ctx.target_class, "fast");
        assert_eq!(ctx.storage_request, Quantity("5Gi".into()));
        assert_eq!(ctx.access_modes, vec!["ReadWriteOnce"]);
        assert_eq!(ctx.mounting_workloads().len(), 1);
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_discover_missing_claim() {
        let cluster = InMemoryCluster::new();

        let err = Discovery::new(&cluster)
            .discover("apps", "data", "fast")
            .await
            .unwrap_err();

        assert!(err.is_discovery());
        assert_matches!(err, Error::ClaimUnavailable { .. });
    }

    #[tokio::test]
    async fn test_discover_requires_bound_volume() {
        let cluster = InMemoryCluster::new();
        cluster.seed_bound_claim("apps", "data", "standard", "pv-1", "1Gi");
        cluster
            .patch_volume("pv-1", &crate::domain::ports::VolumePatch::RemoveClaimRef)
            .await
            .unwrap();

        let err = Discovery::new(&cluster)
            .discover("apps", "data", "fast")
            .await
            .unwrap_err();

        assert_matches!(err, Error::NoBoundVolume { .. });
        assert!(!cluster.calls().contains(&Operation::ListPods));
    }

    #[tokio::test]
    async fn test_discover_rejects_claim_without_uid() {
        let cluster = InMemoryCluster::new();
        cluster.seed_bound_claim("apps", "data", "standard", "pv-1", "1Gi");
        let mut claim = cluster.claim("apps", "data").unwrap();
        claim.metadata.uid = None;
        cluster.insert_claim(claim);

        let err = Discovery::new(&cluster)
            .discover("apps", "data", "fast")
            .await
            .unwrap_err();

        assert_matches!(err, Error::MissingField { ref field, .. } if field == "metadata.uid");
    }

    #[tokio::test]
    async fn test_discover_rejects_same_class() {
        let cluster = InMemoryCluster::new();
        cluster.seed_bound_claim("apps", "data", "standard", "pv-1", "1Gi");

        let err = Discovery::new(&cluster)
            .discover("apps", "data", "standard")
            .await
            .unwrap_err();

        assert_matches!(err, Error::Configuration(_));
    }

    #[tokio::test]
    async fn test_discover_rejects_claim_name_too_long_for_copy_job() {
        let cluster = InMemoryCluster::new();
        let name = "data-postgres-postgresql-0";
        cluster.seed_bound_claim("apps", name, "standard", "pv-1", "1Gi");

        let err = Discovery::new(&cluster)
            .discover("apps", name, "fast")
            .await
            .unwrap_err();

        assert_matches!(err, Error::Configuration(ref msg) if msg.contains(name));
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_discover_accepts_longest_claim_name() {
        let cluster = InMemoryCluster::new();
        let name = "a".repeat(21);
        cluster.seed_bound_claim("apps", &name, "standard", "pv-1", "1Gi");

        let ctx = Discovery::new(&cluster)
            .discover("apps", &name, "fast")
            .await
            .unwrap();

        assert_eq!(ctx.run_id.copy_job_name(&name).len(), MAX_JOB_NAME_LEN);
    }
}
