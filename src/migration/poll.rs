//! Poll Loop
//!
//! Waits on asynchronous cluster changes by evaluating a [`Probe`] at a
//! fixed interval until it reports a terminal [`PollResult`]. The probe
//! decides the result; the loop owns sleeping, progress redraws, the
//! optional timeout and cancellation.

use crate::domain::ports::{PollResult, ProgressReporter, ResourceClient};
use crate::error::{Error, Result};
use crate::migration::discovery::{Discovery, RunContext};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Settings
// =============================================================================

/// Timing for poll loops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Sleep between evaluations
    pub interval: Duration,
    /// Give up after this long; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

// =============================================================================
// Probe
// =============================================================================

/// A condition evaluated by [`poll_until`]
#[async_trait]
pub trait Probe: Send {
    /// What is being waited for, used in progress lines and errors
    fn target(&self) -> String;

    /// Check the condition once
    async fn evaluate(&mut self) -> Result<PollResult>;

    /// Progress line shown after a pending evaluation
    async fn pending_status(&mut self, elapsed: Duration) -> Result<String> {
        Ok(format!(
            "Waiting for {} ({}s)",
            self.target(),
            elapsed.as_secs()
        ))
    }
}

/// Evaluate `probe` every `settings.interval` until it is no longer pending
///
/// Each pending evaluation produces exactly one progress update. Errors from
/// the probe end the loop and are returned unchanged.
pub async fn poll_until<P>(
    probe: &mut P,
    settings: &PollSettings,
    cancel: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<PollResult>
where
    P: Probe + ?Sized,
{
    let started = Instant::now();
    let mut ticks = 0u64;

    loop {
        let result = match probe.evaluate().await {
            Ok(result) => result,
            Err(e) => {
                progress.finish();
                return Err(e);
            }
        };

        if result.is_terminal() {
            progress.finish();
            debug!("{} resolved {:?} after {} ticks", probe.target(), result, ticks);
            return Ok(result);
        }

        let elapsed = started.elapsed();
        if let Some(limit) = settings.timeout {
            if elapsed >= limit {
                progress.finish();
                warn!("Gave up waiting for {} after {:?}", probe.target(), elapsed);
                return Err(Error::PollTimeout {
                    what: probe.target(),
                    after: elapsed,
                });
            }
        }

        let line = match probe.pending_status(elapsed).await {
            Ok(line) => line,
            Err(e) => {
                progress.finish();
                return Err(e);
            }
        };
        progress.update(&line);
        ticks += 1;

        tokio::select! {
            _ = cancel.cancelled() => {
                progress.finish();
                return Err(Error::PollCancelled { what: probe.target() });
            }
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }
}

// =============================================================================
// Deletion Wait
// =============================================================================

/// Pending while the claim still exists, Succeeded once it reads Not-Found
///
/// While pending, re-resolves the pods mounting the claim so the operator
/// can see what is holding the deletion back.
pub struct DeletionProbe<'a> {
    client: &'a dyn ResourceClient,
    ctx: &'a RunContext,
}

impl<'a> DeletionProbe<'a> {
    pub fn new(client: &'a dyn ResourceClient, ctx: &'a RunContext) -> Self {
        Self { client, ctx }
    }
}

#[async_trait]
impl<'a> Probe for DeletionProbe<'a> {
    fn target(&self) -> String {
        format!(
            "claim {}/{} to be deleted",
            self.ctx.namespace, self.ctx.claim_name
        )
    }

    async fn evaluate(&mut self) -> Result<PollResult> {
        match self
            .client
            .get_claim(&self.ctx.namespace, &self.ctx.claim_name)
            .await
        {
            Ok(_) => Ok(PollResult::Pending),
            Err(e) if e.is_not_found() => Ok(PollResult::Succeeded),
            Err(e) => Err(e),
        }
    }

    async fn pending_status(&mut self, elapsed: Duration) -> Result<String> {
        let workloads = Discovery::new(self.client)
            .resolve_mounting_workloads(&self.ctx.claim_name, &self.ctx.namespace)
            .await?;
        self.ctx.set_mounting_workloads(workloads.clone());

        let blockers = if workloads.is_empty() {
            "no pods mounting it".to_string()
        } else {
            let names: Vec<&str> = workloads.iter().map(|w| w.name.as_str()).collect();
            format!("mounted by: {}", names.join(", "))
        };

        Ok(format!(
            "Waiting for {} ({}s) - {}",
            self.target(),
            elapsed.as_secs(),
            blockers
        ))
    }
}

// =============================================================================
// Job Completion Wait
// =============================================================================

/// Map job status counters to a poll result
///
/// Failures are checked first, so a status reporting both resolves to
/// Failed.
pub fn job_result(failed: i32, succeeded: i32) -> PollResult {
    if failed > 0 {
        PollResult::Failed
    } else if succeeded > 0 {
        PollResult::Succeeded
    } else {
        PollResult::Pending
    }
}

/// Follows a batch job until it reports success or failure
pub struct JobCompletionProbe<'a> {
    client: &'a dyn ResourceClient,
    namespace: &'a str,
    name: &'a str,
    active: i32,
}

impl<'a> JobCompletionProbe<'a> {
    pub fn new(client: &'a dyn ResourceClient, namespace: &'a str, name: &'a str) -> Self {
        Self {
            client,
            namespace,
            name,
            active: 0,
        }
    }
}

#[async_trait]
impl<'a> Probe for JobCompletionProbe<'a> {
    fn target(&self) -> String {
        format!("job {}/{} to complete", self.namespace, self.name)
    }

    async fn evaluate(&mut self) -> Result<PollResult> {
        let job = self.client.get_job(self.namespace, self.name).await?;
        let status = job.status.unwrap_or_default();
        self.active = status.active.unwrap_or(0);

        Ok(job_result(
            status.failed.unwrap_or(0),
            status.succeeded.unwrap_or(0),
        ))
    }

    async fn pending_status(&mut self, elapsed: Duration) -> Result<String> {
        Ok(format!(
            "Waiting for {} ({}s, {} active pod(s))",
            self.target(),
            elapsed.as_secs(),
            self.active
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InMemoryCluster, Operation};
    use crate::migration::progress::RecordingProgress;
    use assert_matches::assert_matches;
    use std::collections::VecDeque;

    fn fast() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(1),
            timeout: None,
        }
    }

    struct ScriptedProbe {
        results: VecDeque<Result<PollResult>>,
        evaluations: usize,
    }

    impl ScriptedProbe {
        fn new(results: Vec<Result<PollResult>>) -> Self {
            Self {
                results: results.into(),
                evaluations: 0,
            }
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        fn target(&self) -> String {
            "script".into()
        }

        async fn evaluate(&mut self) -> Result<PollResult> {
            self.evaluations += 1;
            self.results.pop_front().unwrap_or(Ok(PollResult::Pending))
        }
    }

    #[test]
    fn test_job_result_checks_failed_first() {
        assert_eq!(job_result(0, 0), PollResult::Pending);
        assert_eq!(job_result(0, 1), PollResult::Succeeded);
        assert_eq!(job_result(1, 0), PollResult::Failed);
        assert_eq!(job_result(1, 1), PollResult::Failed);
    }

    #[tokio::test]
    async fn test_poll_reports_once_per_pending_tick() {
        let mut probe = ScriptedProbe::new(vec![
            Ok(PollResult::Pending),
            Ok(PollResult::Pending),
            Ok(PollResult::Succeeded),
        ]);
        let progress = RecordingProgress::new();

        let result = poll_until(&mut probe, &fast(), &CancellationToken::new(), &progress)
            .await
            .unwrap();

        assert_eq!(result, PollResult::Succeeded);
        assert_eq!(probe.evaluations, 3);
        assert_eq!(progress.updates().len(), 2);
    }

    #[tokio::test]
    async fn test_poll_propagates_probe_error() {
        let mut probe = ScriptedProbe::new(vec![
            Ok(PollResult::Pending),
            Err(Error::Internal("connection reset".into())),
        ]);
        let progress = RecordingProgress::new();

        let err = poll_until(&mut probe, &fast(), &CancellationToken::new(), &progress)
            .await
            .unwrap_err();

        assert_matches!(err, Error::Internal(ref msg) if msg == "connection reset");
        assert_eq!(probe.evaluations, 2);
    }

    #[tokio::test]
    async fn test_poll_timeout() {
        let mut probe = ScriptedProbe::new(vec![]);
        let settings = PollSettings {
            interval: Duration::from_millis(2),
            timeout: Some(Duration::from_millis(10)),
        };

        let err = poll_until(
            &mut probe,
            &settings,
            &CancellationToken::new(),
            &RecordingProgress::new(),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::PollTimeout { .. });
    }

    #[tokio::test]
    async fn test_poll_cancellation() {
        let mut probe = ScriptedProbe::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = poll_until(&mut probe, &fast(), &cancel, &RecordingProgress::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::PollCancelled { .. });
        assert_eq!(probe.evaluations, 1);
    }

    async fn seeded_context(cluster: &InMemoryCluster) -> RunContext {
        cluster.seed_bound_claim("apps", "data", "standard", "pv-1", "1Gi");
        Discovery::new(cluster)
            .discover("apps", "data", "fast")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_deletion_wait_two_ticks_then_gone() {
        let cluster = InMemoryCluster::new();
        let ctx = seeded_context(&cluster).await;
        cluster.add_pod("apps", "web-0", &["data"]);
        cluster.hold_claim_deletion("apps", "data", 2);
        cluster.delete_claim("apps", "data").await.unwrap();

        let progress = RecordingProgress::new();
        let mut probe = DeletionProbe::new(&cluster, &ctx);
        let result = poll_until(&mut probe, &fast(), &CancellationToken::new(), &progress)
            .await
            .unwrap();

        assert_eq!(result, PollResult::Succeeded);
        let updates = progress.updates();
        assert_eq!(updates.len(), 2);
        assert!(updates[0].contains("mounted by: web-0"));
        assert_eq!(ctx.mounting_workloads()[0].name, "web-0");

        let reads = cluster
            .calls()
            .into_iter()
            .filter(|op| *op == Operation::GetClaim)
            .count();
        // one read during discovery, three while polling
        assert_eq!(reads, 4);
    }

    #[tokio::test]
    async fn test_deletion_wait_propagates_other_errors() {
        let cluster = InMemoryCluster::new();
        let ctx = seeded_context(&cluster).await;
        cluster.hold_claim_deletion("apps", "data", 5);
        cluster.delete_claim("apps", "data").await.unwrap();
        cluster.fail_next(Operation::GetClaim, "etcd unavailable");

        let mut probe = DeletionProbe::new(&cluster, &ctx);
        let err = poll_until(
            &mut probe,
            &fast(),
            &CancellationToken::new(),
            &RecordingProgress::new(),
        )
        .await
        .unwrap_err();

        assert!(!err.is_not_found());
        assert_matches!(err, Error::Internal(_));
    }

    #[tokio::test]
    async fn test_job_wait_succeeds_on_third_check() {
        let cluster = InMemoryCluster::new();
        let ctx = seeded_context(&cluster).await;
        let job = crate::migration::manifests::copy_job(&ctx, "alpine:3");
        cluster.create_job("apps", &job).await.unwrap();
        cluster.script_job_status(&[(0, 0), (0, 0), (0, 1)]);

        let name = ctx.run_id.copy_job_name("data");
        let mut probe = JobCompletionProbe::new(&cluster, "apps", &name);
        let progress = RecordingProgress::new();
        let result = poll_until(&mut probe, &fast(), &CancellationToken::new(), &progress)
            .await
            .unwrap();

        assert_eq!(result, PollResult::Succeeded);
        assert_eq!(progress.updates().len(), 2);
    }

    #[tokio::test]
    async fn test_job_wait_failed_wins_over_succeeded() {
        let cluster = InMemoryCluster::new();
        let ctx = seeded_context(&cluster).await;
        let job = crate::migration::manifests::copy_job(&ctx, "alpine:3");
        cluster.create_job("apps", &job).await.unwrap();
        cluster.script_job_status(&[(0, 0), (1, 1)]);

        let name = ctx.run_id.copy_job_name("data");
        let mut probe = JobCompletionProbe::new(&cluster, "apps", &name);
        let result = poll_until(
            &mut probe,
            &fast(),
            &CancellationToken::new(),
            &RecordingProgress::new(),
        )
        .await
        .unwrap();

        assert_eq!(result, PollResult::Failed);
    }
}
