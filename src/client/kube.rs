//! Live Kubernetes Resource Client
//!
//! Implements [`ResourceClient`] over typed `kube::Api` handles. Every call
//! is a single request/response; nothing is cached between calls.

use crate::domain::ports::{ResourceClient, ResourceKind, VolumePatch};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

/// Field manager recorded on patches issued by the migrator
const FIELD_MANAGER: &str = "pvc-migrator";

/// [`ResourceClient`] backed by a Kubernetes API server
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client for a named kubeconfig context
    pub async fn for_context(context: &str) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().map_err(|e| {
            Error::Configuration(format!("Cannot read kubeconfig: {}", e))
        })?;

        if !kubeconfig.contexts.iter().any(|c| c.name == context) {
            return Err(Error::Configuration(format!(
                "Context {} not found in kubeconfig",
                context
            )));
        }

        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| {
                Error::Configuration(format!("Invalid kubeconfig context {}: {}", context, e))
            })?;

        debug!("Connecting to cluster {} via context {}", config.cluster_url, context);

        Ok(Self::new(Client::try_from(config)?))
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Convert HTTP 404 into the structured Not-Found signal
fn classify(kind: ResourceKind, name: &str) -> impl FnOnce(kube::Error) -> Error + '_ {
    move |err| match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 => Error::ResourceExists {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        debug!("GET pvc {}/{}", namespace, name);
        self.claims(namespace)
            .get(name)
            .await
            .map_err(classify(ResourceKind::PersistentVolumeClaim, name))
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let name = claim.metadata.name.as_deref().unwrap_or_default();
        debug!("CREATE pvc {}/{}", namespace, name);
        self.claims(namespace)
            .create(&PostParams::default(), claim)
            .await
            .map_err(classify(ResourceKind::PersistentVolumeClaim, name))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        debug!("DELETE pvc {}/{}", namespace, name);
        self.claims(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(classify(ResourceKind::PersistentVolumeClaim, name))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        debug!("LIST pods in {}", namespace);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.list(&ListParams::default()).await?.items)
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        debug!("LIST pv");
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(volumes.list(&ListParams::default()).await?.items)
    }

    async fn patch_volume(&self, name: &str, patch: &VolumePatch) -> Result<PersistentVolume> {
        debug!("PATCH pv {}: {:?}", name, patch);
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let body = patch.to_merge_patch();
        volumes
            .patch(name, &patch_params(), &Patch::Merge(&body))
            .await
            .map_err(classify(ResourceKind::PersistentVolume, name))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let name = job.metadata.name.as_deref().unwrap_or_default();
        debug!("CREATE job {}/{}", namespace, name);
        self.jobs(namespace)
            .create(&PostParams::default(), job)
            .await
            .map_err(classify(ResourceKind::Job, name))
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job> {
        debug!("GET job {}/{}", namespace, name);
        self.jobs(namespace)
            .get(name)
            .await
            .map_err(classify(ResourceKind::Job, name))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        debug!("DELETE job {}/{}", namespace, name);
        self.jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(classify(ResourceKind::Job, name))?;
        Ok(())
    }
}
