//! End-to-end migration runs against the in-memory cluster

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use pvc_migrator::client::{InMemoryCluster, Operation};
use pvc_migrator::migration::{
    AbortReason, PollSettings, RecordingProgress, ScriptedGate, AFFIRMATIVE,
};
use pvc_migrator::{
    ConfirmationGate, Discovery, Error, MigrationConfig, MigrationPlan, RunContext,
    SequencerState, StepSequencer,
};
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "apps";

fn fast_config() -> MigrationConfig {
    MigrationConfig {
        poll: PollSettings {
            interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
        },
        ..Default::default()
    }
}

async fn prepare() -> (Arc<InMemoryCluster>, RunContext, MigrationPlan) {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.seed_bound_claim(NS, "data", "standard", "pv-1", "10Gi");

    let ctx = Discovery::new(cluster.as_ref())
        .discover(NS, "data", "fast")
        .await
        .unwrap();
    let plan = MigrationPlan::standard(&ctx);
    (cluster, ctx, plan)
}

fn sequencer(
    cluster: Arc<InMemoryCluster>,
    gate: Arc<dyn ConfirmationGate>,
    progress: Arc<RecordingProgress>,
) -> StepSequencer {
    StepSequencer::new(cluster, gate, progress, fast_config())
}

/// Answers from a script and notes how many cluster calls had happened
/// when each prompt appeared
struct ObservingGate {
    cluster: Arc<InMemoryCluster>,
    inner: ScriptedGate,
    calls_at_prompt: Mutex<Vec<usize>>,
}

#[async_trait]
impl ConfirmationGate for ObservingGate {
    async fn confirm(&self, prompt: &str) -> pvc_migrator::Result<bool> {
        self.calls_at_prompt.lock().push(self.cluster.calls().len());
        self.inner.confirm(prompt).await
    }
}

#[tokio::test]
async fn migrates_claim_to_target_class() {
    let (cluster, ctx, plan) = prepare().await;
    let progress = Arc::new(RecordingProgress::new());
    let mut seq = sequencer(
        cluster.clone(),
        Arc::new(ScriptedGate::approve_all(6)),
        progress.clone(),
    );

    let report = seq.run(&ctx, &plan).await;

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.completed_steps, 6);

    let claim = cluster.claim(NS, "data").expect("replacement claim");
    let spec = claim.spec.unwrap();
    assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
    assert_ne!(spec.volume_name.as_deref(), Some("pv-1"));

    let volume = cluster.volume("pv-1").expect("old volume kept");
    assert_eq!(
        volume
            .spec
            .as_ref()
            .unwrap()
            .persistent_volume_reclaim_policy
            .as_deref(),
        Some("Retain")
    );
    assert_ne!(volume.status.unwrap().phase.as_deref(), Some("Bound"));

    assert_eq!(cluster.claim_names(NS), vec!["data".to_string()]);
    assert!(cluster.job_names(NS).is_empty());
    assert!(cluster
        .claim(NS, &ctx.run_id.temporary_claim_name("data"))
        .is_none());
    assert!(cluster
        .job(NS, &ctx.run_id.copy_job_name("data"))
        .is_none());

    let summary = report.summary().join("\n");
    assert!(summary.contains("pv-1"));
}

#[tokio::test]
async fn failed_copy_job_aborts_at_step_five() {
    let (cluster, ctx, plan) = prepare().await;
    cluster.script_job_status(&[(0, 0), (1, 0), (0, 1)]);
    let mut seq = sequencer(
        cluster.clone(),
        Arc::new(ScriptedGate::approve_all(6)),
        Arc::new(RecordingProgress::new()),
    );

    let report = seq.run(&ctx, &plan).await;

    assert_matches!(
        report.state,
        SequencerState::Aborted {
            index: 4,
            reason: AbortReason::StepFailed(_)
        }
    );
    assert_eq!(report.completed_steps, 4);
    assert_matches!(
        report.error,
        Some(Error::StepFailed { index: 4, ref source, .. })
            if matches!(**source, Error::JobFailed { .. })
    );

    // the new claim exists but was never filled
    let claim = cluster.claim(NS, "data").unwrap();
    assert_eq!(
        claim.spec.unwrap().storage_class_name.as_deref(),
        Some("fast")
    );
    // left for manual cleanup
    assert!(cluster
        .claim(NS, &ctx.run_id.temporary_claim_name("data"))
        .is_some());
    assert!(!cluster.calls().contains(&Operation::DeleteJob));
}

#[tokio::test]
async fn declining_stops_all_further_calls() {
    for declined_at in 0..6 {
        let (cluster, ctx, plan) = prepare().await;
        let mut answers = vec![AFFIRMATIVE.to_string(); declined_at];
        answers.push("y".to_string());

        let gate = Arc::new(ObservingGate {
            cluster: cluster.clone(),
            inner: ScriptedGate::new(answers),
            calls_at_prompt: Mutex::new(Vec::new()),
        });
        let mut seq = sequencer(
            cluster.clone(),
            gate.clone(),
            Arc::new(RecordingProgress::new()),
        );

        let report = seq.run(&ctx, &plan).await;

        assert_eq!(
            report.state,
            SequencerState::Aborted {
                index: declined_at,
                reason: AbortReason::Declined
            }
        );
        assert_eq!(report.completed_steps, declined_at);

        let at_last_prompt = *gate.calls_at_prompt.lock().last().unwrap();
        assert_eq!(
            cluster.calls().len(),
            at_last_prompt,
            "calls after declining step {}",
            declined_at
        );
    }
}

#[tokio::test]
async fn declining_first_step_leaves_cluster_untouched() {
    let (cluster, ctx, plan) = prepare().await;
    let mut seq = sequencer(
        cluster.clone(),
        Arc::new(ScriptedGate::new([""])),
        Arc::new(RecordingProgress::new()),
    );

    let report = seq.run(&ctx, &plan).await;

    assert_matches!(report.error, Some(Error::ConfirmationDeclined { step: 0 }));
    assert_eq!(cluster.mutation_count(), 0);
    let volume = cluster.volume("pv-1").unwrap();
    assert_eq!(
        volume.spec.unwrap().persistent_volume_reclaim_policy.as_deref(),
        Some("Delete")
    );
}

#[tokio::test]
async fn failed_step_is_not_retried_and_next_step_never_runs() {
    let (cluster, ctx, plan) = prepare().await;
    cluster.fail_next(Operation::CreateClaim, "admission webhook denied");
    let mut seq = sequencer(
        cluster.clone(),
        Arc::new(ScriptedGate::approve_all(6)),
        Arc::new(RecordingProgress::new()),
    );

    let report = seq.run(&ctx, &plan).await;

    assert_matches!(report.state, SequencerState::Aborted { index: 2, .. });
    let calls = cluster.calls();
    let creates = calls.iter().filter(|op| **op == Operation::CreateClaim).count();
    let patches = calls.iter().filter(|op| **op == Operation::PatchVolume).count();
    assert_eq!(creates, 1);
    // only the Retain patch from step 1; step 4 never released the volume
    assert_eq!(patches, 1);
    assert!(cluster.claim(NS, "data").is_none());
}

#[tokio::test]
async fn deletion_wait_shows_blocking_pods() {
    let (cluster, ctx, plan) = prepare().await;
    cluster.add_pod(NS, "db-0", &["data"]);
    cluster.hold_claim_deletion(NS, "data", 3);
    let progress = Arc::new(RecordingProgress::new());
    let mut seq = sequencer(
        cluster.clone(),
        Arc::new(ScriptedGate::new([AFFIRMATIVE, AFFIRMATIVE])),
        progress.clone(),
    );

    let report = seq.run(&ctx, &plan).await;

    assert_matches!(
        report.state,
        SequencerState::Aborted {
            index: 2,
            reason: AbortReason::Declined
        }
    );
    let updates = progress.updates();
    assert_eq!(updates.len(), 3);
    assert!(updates.iter().all(|line| line.contains("db-0")));
    assert_eq!(ctx.mounting_workloads()[0].name, "db-0");
}

#[tokio::test]
async fn independent_runs_use_distinct_temporary_names() {
    let (_, first, _) = prepare().await;
    let (_, second, _) = prepare().await;

    assert_ne!(first.run_id, second.run_id);
    assert_ne!(
        first.run_id.temporary_claim_name("data"),
        second.run_id.temporary_claim_name("data")
    );
    assert_ne!(
        first.run_id.copy_job_name("data"),
        second.run_id.copy_job_name("data")
    );
}
