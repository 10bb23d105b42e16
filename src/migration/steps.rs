//! Migration Steps
//!
//! The six fixed actions of a migration. Each action reads only the
//! [`RunContext`] and the collaborators in [`StepEnv`]; nothing is carried
//! from one step to the next except cluster state.

use crate::config::MigrationConfig;
use crate::domain::ports::{PollResult, ProgressReporter, ResourceClient, VolumePatch};
use crate::error::{Error, Result};
use crate::migration::discovery::RunContext;
use crate::migration::manifests;
use crate::migration::poll::{poll_until, DeletionProbe, JobCompletionProbe};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reclaim policy that keeps the backing storage after the claim is gone
pub const RETAIN: &str = "Retain";

/// Everything a step may use while it runs
pub struct StepEnv<'a> {
    pub ctx: &'a RunContext,
    pub client: &'a dyn ResourceClient,
    pub progress: &'a dyn ProgressReporter,
    pub config: &'a MigrationConfig,
    pub cancel: &'a CancellationToken,
}

/// The side effect of one step
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, env: &StepEnv<'_>) -> Result<()>;
}

// =============================================================================
// 1. Protect source volume
// =============================================================================

/// Switch the bound volume to `Retain` so it survives claim deletion
pub struct ProtectVolume;

#[async_trait]
impl StepAction for ProtectVolume {
    async fn run(&self, env: &StepEnv<'_>) -> Result<()> {
        let volume = env
            .client
            .patch_volume(&env.ctx.volume_name, &VolumePatch::ReclaimPolicy(RETAIN.into()))
            .await?;

        let policy = volume
            .spec
            .and_then(|s| s.persistent_volume_reclaim_policy)
            .unwrap_or_default();
        if policy != RETAIN {
            return Err(Error::Internal(format!(
                "Volume {} reports reclaim policy {:?} after patch",
                env.ctx.volume_name, policy
            )));
        }

        info!("Volume {} now retained", env.ctx.volume_name);
        Ok(())
    }
}

// =============================================================================
// 2. Delete original claim and wait
// =============================================================================

/// Delete the claim and block until it is gone
pub struct DeleteClaim;

#[async_trait]
impl StepAction for DeleteClaim {
    async fn run(&self, env: &StepEnv<'_>) -> Result<()> {
        let ctx = env.ctx;
        env.client
            .delete_claim(&ctx.namespace, &ctx.claim_name)
            .await?;
        info!("Deletion of claim {}/{} requested", ctx.namespace, ctx.claim_name);

        let mut probe = DeletionProbe::new(env.client, ctx);
        match poll_until(&mut probe, &env.config.poll, env.cancel, env.progress).await? {
            PollResult::Succeeded => Ok(()),
            other => Err(Error::Internal(format!(
                "Deletion wait for {}/{} ended with {:?}",
                ctx.namespace, ctx.claim_name, other
            ))),
        }
    }
}

// =============================================================================
// 3. Create replacement claim
// =============================================================================

/// Recreate the claim under the target storage class
pub struct CreateReplacementClaim;

#[async_trait]
impl StepAction for CreateReplacementClaim {
    async fn run(&self, env: &StepEnv<'_>) -> Result<()> {
        let claim = manifests::replacement_claim(env.ctx);
        env.client.create_claim(&env.ctx.namespace, &claim).await?;
        info!(
            "Created claim {}/{} with storage class {}",
            env.ctx.namespace, env.ctx.claim_name, env.ctx.target_class
        );
        Ok(())
    }
}

// =============================================================================
// 4. Expose old volume for copy
// =============================================================================

/// Release the old volume and bind it to a run-scoped temporary claim
pub struct ExposeOldVolume;

#[async_trait]
impl StepAction for ExposeOldVolume {
    async fn run(&self, env: &StepEnv<'_>) -> Result<()> {
        let ctx = env.ctx;
        env.client
            .patch_volume(&ctx.volume_name, &VolumePatch::RemoveClaimRef)
            .await?;

        let claim = manifests::temporary_claim(ctx);
        env.client.create_claim(&ctx.namespace, &claim).await?;
        info!(
            "Volume {} bound to temporary claim {}",
            ctx.volume_name,
            ctx.run_id.temporary_claim_name(&ctx.claim_name)
        );
        Ok(())
    }
}

// =============================================================================
// 5. Copy data and wait
// =============================================================================

/// Run the copy job and block until it succeeds or fails
pub struct CopyData;

#[async_trait]
impl StepAction for CopyData {
    async fn run(&self, env: &StepEnv<'_>) -> Result<()> {
        let ctx = env.ctx;
        let job = manifests::copy_job(ctx, &env.config.copy_image);
        let name = ctx.run_id.copy_job_name(&ctx.claim_name);

        env.client.create_job(&ctx.namespace, &job).await?;
        info!("Started copy job {}/{}", ctx.namespace, name);

        let mut probe = JobCompletionProbe::new(env.client, &ctx.namespace, &name);
        match poll_until(&mut probe, &env.config.poll, env.cancel, env.progress).await? {
            PollResult::Succeeded => Ok(()),
            _ => Err(Error::JobFailed {
                namespace: ctx.namespace.clone(),
                name,
            }),
        }
    }
}

// =============================================================================
// 6. Clean up temporary claim
// =============================================================================

/// Remove the finished copy job and the temporary claim it mounted; the
/// old volume stays for verification
pub struct CleanupTemporaryClaim;

#[async_trait]
impl StepAction for CleanupTemporaryClaim {
    async fn run(&self, env: &StepEnv<'_>) -> Result<()> {
        let ctx = env.ctx;
        let job = ctx.run_id.copy_job_name(&ctx.claim_name);
        match env.client.delete_job(&ctx.namespace, &job).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Copy job {} already gone", job),
            Err(e) => return Err(e),
        }

        let name = ctx.run_id.temporary_claim_name(&ctx.claim_name);
        env.client.delete_claim(&ctx.namespace, &name).await?;
        info!(
            "Deleted temporary claim {}; volume {} left for verification",
            name, ctx.volume_name
        );
        Ok(())
    }
}
