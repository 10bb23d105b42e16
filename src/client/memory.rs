//! In-Memory Cluster
//!
//! An in-process [`ResourceClient`] that models the slice of cluster
//! behavior the migrator depends on:
//!
//! - claims with a `volumeName` bind to that volume; claims with only a
//!   storage class get a freshly provisioned volume
//! - deleting a claim can be held back for a number of reads, the way a
//!   `kubernetes.io/pvc-protection` finalizer holds it while pods mount it
//! - removing a claim releases its volume (Retain) or removes it (Delete)
//! - job status counters follow a scripted sequence
//!
//! Every call is recorded so tests can assert which operations ran.

use crate::domain::ports::{ResourceClient, ResourceKind, VolumePatch};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec,
    PersistentVolumeStatus, Pod, PodSpec, Volume, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

// =============================================================================
// Call Log
// =============================================================================

/// Operations recorded by [`InMemoryCluster`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    GetClaim,
    CreateClaim,
    DeleteClaim,
    ListPods,
    ListVolumes,
    PatchVolume,
    CreateJob,
    GetJob,
    DeleteJob,
}

impl Operation {
    /// Whether the operation changes cluster state
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Operation::CreateClaim
                | Operation::DeleteClaim
                | Operation::PatchVolume
                | Operation::CreateJob
                | Operation::DeleteJob
        )
    }
}

// =============================================================================
// Cluster State
// =============================================================================

#[derive(Default)]
struct ClusterState {
    claims: BTreeMap<Key, PersistentVolumeClaim>,
    volumes: BTreeMap<String, PersistentVolume>,
    pods: BTreeMap<Key, Pod>,
    jobs: BTreeMap<Key, Job>,
    /// Reads left before a deleted claim disappears
    held_deletions: BTreeMap<Key, u32>,
    /// Deletion holds to apply when the claim is deleted
    deletion_holds: BTreeMap<Key, u32>,
    /// (failed, succeeded) counters served on successive job reads
    job_script: VecDeque<(i32, i32)>,
    faults: BTreeMap<Operation, VecDeque<String>>,
    next_uid: u64,
}

impl ClusterState {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("00000000-0000-0000-0000-{:012}", self.next_uid)
    }

    fn bind(&mut self, claim: &mut PersistentVolumeClaim, volume_name: &str) {
        let namespace = claim.metadata.namespace.clone();
        let name = claim.metadata.name.clone();
        let uid = claim.metadata.uid.clone();

        if let Some(volume) = self.volumes.get_mut(volume_name) {
            let spec = volume.spec.get_or_insert_with(Default::default);
            spec.claim_ref = Some(ObjectReference {
                kind: Some("PersistentVolumeClaim".into()),
                namespace,
                name,
                uid,
                ..Default::default()
            });
            volume.status = Some(PersistentVolumeStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            });
            claim.status = Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            });
        }
    }

    fn provision(&mut self, claim: &mut PersistentVolumeClaim) {
        let Some(spec) = claim.spec.as_mut() else {
            return;
        };
        let Some(class) = spec.storage_class_name.clone() else {
            return;
        };
        let uid = claim.metadata.uid.clone().unwrap_or_default();
        let volume_name = format!("pvc-{}", uid);
        spec.volume_name = Some(volume_name.clone());

        let capacity = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.clone())
            .unwrap_or_default();

        let volume_uid = self.uid();
        self.volumes.insert(
            volume_name.clone(),
            PersistentVolume {
                metadata: ObjectMeta {
                    name: Some(volume_name.clone()),
                    uid: Some(volume_uid),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeSpec {
                    storage_class_name: Some(class),
                    access_modes: spec.access_modes.clone(),
                    capacity: Some(capacity),
                    persistent_volume_reclaim_policy: Some("Delete".into()),
                    ..Default::default()
                }),
                status: None,
            },
        );
        self.bind(claim, &volume_name);
    }

    /// Drop a claim and release or reclaim its volume
    fn remove_claim(&mut self, k: &Key) {
        let Some(claim) = self.claims.remove(k) else {
            return;
        };
        let uid = claim.metadata.uid;

        let bound: Vec<String> = self
            .volumes
            .iter()
            .filter(|(_, pv)| {
                pv.spec
                    .as_ref()
                    .and_then(|s| s.claim_ref.as_ref())
                    .map(|r| r.uid == uid)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in bound {
            let retain = self.volumes[&name]
                .spec
                .as_ref()
                .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
                == Some("Retain");
            if retain {
                if let Some(volume) = self.volumes.get_mut(&name) {
                    volume.status = Some(PersistentVolumeStatus {
                        phase: Some("Released".into()),
                        ..Default::default()
                    });
                }
            } else {
                self.volumes.remove(&name);
            }
        }
    }

    fn take_fault(&mut self, op: Operation) -> Option<Error> {
        self.faults
            .get_mut(&op)
            .and_then(|queue| queue.pop_front())
            .map(Error::Internal)
    }
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// [`ResourceClient`] over an in-process model of the cluster
#[derive(Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    calls: Mutex<Vec<Operation>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a claim of `class` bound to a volume with the `Delete` policy
    pub fn seed_bound_claim(
        &self,
        namespace: &str,
        name: &str,
        class: &str,
        volume_name: &str,
        size: &str,
    ) {
        let mut state = self.state.write();
        let claim_uid = state.uid();
        let volume_uid = state.uid();

        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(size.to_string()));

        state.volumes.insert(
            volume_name.to_string(),
            PersistentVolume {
                metadata: ObjectMeta {
                    name: Some(volume_name.to_string()),
                    uid: Some(volume_uid),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeSpec {
                    storage_class_name: Some(class.to_string()),
                    access_modes: Some(vec!["ReadWriteOnce".into()]),
                    capacity: Some(requests.clone()),
                    persistent_volume_reclaim_policy: Some("Delete".into()),
                    ..Default::default()
                }),
                status: None,
            },
        );

        let mut claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(claim_uid),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(class.to_string()),
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                volume_name: Some(volume_name.to_string()),
                ..Default::default()
            }),
            status: None,
        };
        state.bind(&mut claim, volume_name);
        state.claims.insert(key(namespace, name), claim);
    }

    /// Store a claim verbatim, without binding
    pub fn insert_claim(&self, claim: PersistentVolumeClaim) {
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let name = claim.metadata.name.clone().unwrap_or_default();
        self.state.write().claims.insert((namespace, name), claim);
    }

    /// Store a volume verbatim
    pub fn insert_volume(&self, volume: PersistentVolume) {
        let name = volume.metadata.name.clone().unwrap_or_default();
        self.state.write().volumes.insert(name, volume);
    }

    /// Add a pod mounting the given claims
    pub fn add_pod(&self, namespace: &str, name: &str, claims: &[&str]) {
        let volumes = claims
            .iter()
            .enumerate()
            .map(|(i, claim)| Volume {
                name: format!("vol-{}", i),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            })
            .collect();

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(volumes),
                ..Default::default()
            }),
            status: None,
        };
        self.state.write().pods.insert(key(namespace, name), pod);
    }

    /// Store a pod verbatim
    pub fn insert_pod(&self, pod: Pod) {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.state.write().pods.insert((namespace, name), pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.state.write().pods.remove(&key(namespace, name));
    }

    /// Keep the claim readable for `reads` reads after it is deleted
    pub fn hold_claim_deletion(&self, namespace: &str, name: &str, reads: u32) {
        self.state
            .write()
            .deletion_holds
            .insert(key(namespace, name), reads);
    }

    /// Serve these (failed, succeeded) counters on successive job reads;
    /// the last entry repeats once the script is exhausted
    pub fn script_job_status(&self, statuses: &[(i32, i32)]) {
        self.state.write().job_script = statuses.iter().copied().collect();
    }

    /// Fail the next call of `op` with an internal error carrying `message`
    pub fn fail_next(&self, op: Operation, message: &str) {
        self.state
            .write()
            .faults
            .entry(op)
            .or_default()
            .push_back(message.to_string());
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state.read().claims.get(&key(namespace, name)).cloned()
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.read().volumes.get(name).cloned()
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.state.read().jobs.get(&key(namespace, name)).cloned()
    }

    pub fn claim_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .read()
            .claims
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn job_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .read()
            .jobs
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Operation> {
        self.calls.lock().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls.lock().iter().filter(|op| op.is_mutation()).count()
    }

    fn record(&self, op: Operation) -> Result<()> {
        self.calls.lock().push(op);
        match self.state.write().take_fault(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn not_found(kind: ResourceKind, name: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

#[async_trait]
impl ResourceClient for InMemoryCluster {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.record(Operation::GetClaim)?;
        let k = key(namespace, name);
        let mut state = self.state.write();

        let expired = match state.held_deletions.get_mut(&k) {
            Some(0) => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        };
        if expired {
            state.held_deletions.remove(&k);
            state.remove_claim(&k);
        }

        state
            .claims
            .get(&k)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::PersistentVolumeClaim, name))
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        self.record(Operation::CreateClaim)?;
        let name = claim
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::missing("PersistentVolumeClaim", "", "metadata.name"))?;
        let k = key(namespace, &name);
        let mut state = self.state.write();

        if state.claims.contains_key(&k) {
            return Err(Error::ResourceExists {
                kind: ResourceKind::PersistentVolumeClaim.to_string(),
                name,
            });
        }

        let mut stored = claim.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.uid = Some(state.uid());

        let requested_volume = stored.spec.as_ref().and_then(|s| s.volume_name.clone());
        match requested_volume {
            Some(volume_name) => state.bind(&mut stored, &volume_name),
            None => state.provision(&mut stored),
        }

        debug!("in-memory: created claim {}/{}", namespace, name);
        state.claims.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.record(Operation::DeleteClaim)?;
        let k = key(namespace, name);
        let mut state = self.state.write();

        if !state.claims.contains_key(&k) {
            return Err(not_found(ResourceKind::PersistentVolumeClaim, name));
        }

        match state.deletion_holds.remove(&k) {
            Some(reads) => {
                if let Some(claim) = state.claims.get_mut(&k) {
                    claim.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                }
                state.held_deletions.insert(k, reads);
            }
            None => state.remove_claim(&k),
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        self.record(Operation::ListPods)?;
        Ok(self
            .state
            .read()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        self.record(Operation::ListVolumes)?;
        Ok(self.state.read().volumes.values().cloned().collect())
    }

    async fn patch_volume(&self, name: &str, patch: &VolumePatch) -> Result<PersistentVolume> {
        self.record(Operation::PatchVolume)?;
        let mut state = self.state.write();
        let volume = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::PersistentVolume, name))?;
        let spec = volume.spec.get_or_insert_with(Default::default);

        match patch {
            VolumePatch::ReclaimPolicy(policy) => {
                spec.persistent_volume_reclaim_policy = Some(policy.clone());
            }
            VolumePatch::RemoveClaimRef => {
                spec.claim_ref = None;
                volume.status = Some(PersistentVolumeStatus {
                    phase: Some("Available".into()),
                    ..Default::default()
                });
            }
        }
        Ok(volume.clone())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        self.record(Operation::CreateJob)?;
        let name = job
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::missing("Job", "", "metadata.name"))?;
        let k = key(namespace, &name);
        let mut state = self.state.write();

        if state.jobs.contains_key(&k) {
            return Err(Error::ResourceExists {
                kind: ResourceKind::Job.to_string(),
                name,
            });
        }

        let mut stored = job.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.uid = Some(state.uid());
        state.jobs.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job> {
        self.record(Operation::GetJob)?;
        let k = key(namespace, name);
        let mut state = self.state.write();

        let counters = if state.job_script.len() > 1 {
            state.job_script.pop_front()
        } else {
            state.job_script.front().copied()
        };

        let job = state
            .jobs
            .get_mut(&k)
            .ok_or_else(|| not_found(ResourceKind::Job, name))?;

        // Without a script the job completes on first read
        let (failed, succeeded) = counters.unwrap_or((0, 1));
        job.status = Some(JobStatus {
            failed: Some(failed),
            succeeded: Some(succeeded),
            ..Default::default()
        });
        Ok(job.clone())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.record(Operation::DeleteJob)?;
        self.state
            .write()
            .jobs
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found(ResourceKind::Job, name))
    }
}
