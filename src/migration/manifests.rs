//! Resource Manifests
//!
//! Pure builders for the objects the migration creates: the replacement
//! claim, the temporary claim that rebinds the old volume, and the copy
//! job.

use crate::migration::discovery::RunContext;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Annotation prefix owned by the volume controller
pub const RESERVED_ANNOTATION_PREFIX: &str = "pv.kubernetes.io/";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const RUN_ID_LABEL: &str = "pvc-migrator/run-id";
const MANAGER: &str = "pvc-migrator";

const OLD_MOUNT: &str = "/old";
const NEW_MOUNT: &str = "/new";

/// Drop controller-owned annotations, keep everything else verbatim
pub fn filter_annotations(annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    annotations
        .iter()
        .filter(|(k, _)| !k.starts_with(RESERVED_ANNOTATION_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn run_labels(ctx: &RunContext) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
    labels.insert(RUN_ID_LABEL.to_string(), ctx.run_id.to_string());
    labels
}

/// The claim that takes over the original name under the target class
///
/// Name, namespace, labels and spec are copied; reserved annotations are
/// stripped, the storage class is replaced and `volumeName` is cleared so
/// the target class provisions a fresh volume.
pub fn replacement_claim(ctx: &RunContext) -> PersistentVolumeClaim {
    let original = &ctx.claim.metadata;
    let annotations = original
        .annotations
        .as_ref()
        .map(filter_annotations)
        .filter(|a| !a.is_empty());

    let mut spec = ctx.claim.spec.clone().unwrap_or_default();
    spec.storage_class_name = Some(ctx.target_class.clone());
    spec.volume_name = None;

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(ctx.claim_name.clone()),
            namespace: Some(ctx.namespace.clone()),
            labels: original.labels.clone(),
            annotations,
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// A run-scoped claim bound by name to the original volume
pub fn temporary_claim(ctx: &RunContext) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), ctx.storage_request.clone());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(ctx.run_id.temporary_claim_name(&ctx.claim_name)),
            namespace: Some(ctx.namespace.clone()),
            labels: Some(run_labels(ctx)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some(ctx.source_class.clone()),
            access_modes: Some(ctx.access_modes.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            volume_name: Some(ctx.volume_name.clone()),
            ..Default::default()
        }),
        status: None,
    }
}

fn claim_volume(name: &str, claim: String, read_only: bool) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim,
            read_only: Some(read_only),
        }),
        ..Default::default()
    }
}

/// A single-pod job copying the old volume onto the new claim
pub fn copy_job(ctx: &RunContext, image: &str) -> Job {
    let labels = run_labels(ctx);

    let container = Container {
        name: "copy".to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cp -a {}/. {}/", OLD_MOUNT, NEW_MOUNT),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "old".to_string(),
                mount_path: OLD_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "new".to_string(),
                mount_path: NEW_MOUNT.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(ctx.run_id.copy_job_name(&ctx.claim_name)),
            namespace: Some(ctx.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    volumes: Some(vec![
                        claim_volume(
                            "old",
                            ctx.run_id.temporary_claim_name(&ctx.claim_name),
                            true,
                        ),
                        claim_volume("new", ctx.claim_name.clone(), false),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}
