//! Step Sequencer
//!
//! Drives a [`MigrationPlan`] one step at a time:
//!
//! ```text
//! NotStarted -> AwaitingConfirmation(i) -> Running(i) -> StepSucceeded(i)
//!                       |                      |               |
//!                       v                      v               v
//!               Aborted(i, declined)  Aborted(i, failed)  AwaitingConfirmation(i+1)
//!                                                          or Completed
//! ```
//!
//! Each step runs at most once. The first decline or failure ends the run
//! and leaves the cluster as the last successful step left it; there is no
//! retry and no rollback.

use crate::config::MigrationConfig;
use crate::domain::ports::{ConfirmationGateRef, ProgressReporterRef, ResourceClientRef};
use crate::error::Error;
use crate::migration::discovery::RunContext;
use crate::migration::identity::RunId;
use crate::migration::steps::{
    CleanupTemporaryClaim, CopyData, CreateReplacementClaim, DeleteClaim, ExposeOldVolume,
    ProtectVolume, StepAction, StepEnv,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// =============================================================================
// Plan
// =============================================================================

/// A described step of the plan
#[derive(Clone)]
pub struct Step {
    pub description: String,
    pub action: Arc<dyn StepAction>,
}

impl Step {
    pub fn new(description: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self {
            description: description.into(),
            action: Arc::new(action),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Ordered, immutable list of steps
///
/// Only buildable from a [`RunContext`], which only discovery produces.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    steps: Vec<Step>,
}

impl MigrationPlan {
    /// The six-step storage class migration
    pub fn standard(ctx: &RunContext) -> Self {
        let temp = ctx.run_id.temporary_claim_name(&ctx.claim_name);
        let job = ctx.run_id.copy_job_name(&ctx.claim_name);

        Self::with_steps(
            ctx,
            vec![
                Step::new(
                    format!(
                        "Set reclaim policy of volume {} to Retain",
                        ctx.volume_name
                    ),
                    ProtectVolume,
                ),
                Step::new(
                    format!(
                        "Delete claim {}/{} and wait until it is gone",
                        ctx.namespace, ctx.claim_name
                    ),
                    DeleteClaim,
                ),
                Step::new(
                    format!(
                        "Create claim {}/{} with storage class {}",
                        ctx.namespace, ctx.claim_name, ctx.target_class
                    ),
                    CreateReplacementClaim,
                ),
                Step::new(
                    format!(
                        "Release volume {} and bind it to temporary claim {}",
                        ctx.volume_name, temp
                    ),
                    ExposeOldVolume,
                ),
                Step::new(
                    format!("Copy data with job {} and wait for it", job),
                    CopyData,
                ),
                Step::new(format!("Delete temporary claim {}", temp), CleanupTemporaryClaim),
            ],
        )
    }

    /// A plan with custom steps for the given context
    pub fn with_steps(_ctx: &RunContext, steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// =============================================================================
// State
// =============================================================================

/// Why a run stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The operator did not approve the step
    Declined,
    /// The step's action returned an error
    StepFailed(String),
}

/// Position of the sequencer in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerState {
    NotStarted,
    AwaitingConfirmation(usize),
    Running(usize),
    StepSucceeded(usize),
    Aborted { index: usize, reason: AbortReason },
    Completed,
}

impl SequencerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SequencerState::Aborted { .. } | SequencerState::Completed)
    }
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of a run
#[derive(Debug)]
pub struct MigrationReport {
    pub run_id: RunId,
    pub namespace: String,
    pub claim_name: String,
    pub target_class: String,
    pub volume_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed_steps: usize,
    pub state: SequencerState,
    /// Set whenever the run did not complete
    pub error: Option<Error>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.state == SequencerState::Completed
    }

    /// Human-readable summary for the operator
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match &self.state {
            SequencerState::Completed => {
                lines.push(format!(
                    "Migration of {}/{} to storage class {} completed.",
                    self.namespace, self.claim_name, self.target_class
                ));
                lines.push(format!(
                    "Volume {} was retained and left unbound; delete it once the new data is verified.",
                    self.volume_name
                ));
            }
            SequencerState::Aborted { index, reason } => {
                match reason {
                    AbortReason::Declined => lines.push(format!(
                        "Stopped by request at step {}; nothing was changed by that step.",
                        index + 1
                    )),
                    AbortReason::StepFailed(detail) => {
                        lines.push(format!("Migration aborted at step {}.", index + 1));
                        lines.push(format!("Error: {}", detail));
                    }
                }
                lines.push(format!(
                    "{} step(s) completed. Cluster is left as the last completed step produced; recover manually.",
                    self.completed_steps
                ));
                lines.push(format!(
                    "Temporary resources of this run are named with {}.",
                    self.run_id
                ));
            }
            other => lines.push(format!("Run ended in unexpected state {:?}", other)),
        }
        lines
    }
}

// =============================================================================
// Sequencer
// =============================================================================

/// Runs a plan step by step behind the confirmation gate
pub struct StepSequencer {
    client: ResourceClientRef,
    gate: ConfirmationGateRef,
    progress: ProgressReporterRef,
    config: MigrationConfig,
    cancel: CancellationToken,
    state: SequencerState,
    history: Vec<SequencerState>,
}

impl StepSequencer {
    pub fn new(
        client: ResourceClientRef,
        gate: ConfirmationGateRef,
        progress: ProgressReporterRef,
        config: MigrationConfig,
    ) -> Self {
        Self {
            client,
            gate,
            progress,
            config,
            cancel: CancellationToken::new(),
            state: SequencerState::NotStarted,
            history: vec![SequencerState::NotStarted],
        }
    }

    /// Stop waits and pending prompts when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    /// Every state entered so far, starting with `NotStarted`
    pub fn history(&self) -> &[SequencerState] {
        &self.history
    }

    fn transition(&mut self, next: SequencerState) {
        info!("Sequencer: {:?} -> {:?}", self.state, next);
        self.history.push(next.clone());
        self.state = next;
    }

    /// Print the resolved context and the numbered plan
    fn announce(&self, ctx: &RunContext, plan: &MigrationPlan) {
        let p = &self.progress;
        p.message(&format!("Run:            {}", ctx.run_id));
        p.message(&format!("Claim:          {}/{}", ctx.namespace, ctx.claim_name));
        p.message(&format!("Bound volume:   {}", ctx.volume_name));
        p.message(&format!(
            "Storage class:  {} -> {}",
            ctx.source_class, ctx.target_class
        ));

        let workloads = ctx.mounting_workloads();
        if workloads.is_empty() {
            p.message("Mounted by:     no pods");
        } else {
            let names: Vec<&str> = workloads.iter().map(|w| w.name.as_str()).collect();
            p.message(&format!("Mounted by:     {}", names.join(", ")));
        }

        p.message(
            "Scale down every controller or replica using this claim before continuing; \
             the migrator does not lock it.",
        );
        p.message("Plan:");
        for (index, step) in plan.steps().iter().enumerate() {
            p.message(&format!("  {}. {}", index + 1, step.description));
        }
    }

    async fn confirm(&self, prompt: &str) -> bool {
        // a cancelled run declines even when an answer is already buffered
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            answer = self.gate.confirm(prompt) => match answer {
                Ok(approved) => approved,
                Err(e) => {
                    warn!("Confirmation failed, treating as declined: {}", e);
                    false
                }
            },
        }
    }

    /// Drive `plan` to completion or to the first abort
    pub async fn run(&mut self, ctx: &RunContext, plan: &MigrationPlan) -> MigrationReport {
        let started_at = Utc::now();
        let total = plan.len();
        let mut completed_steps = 0;
        let mut error = None;

        self.announce(ctx, plan);

        for (index, step) in plan.steps().iter().enumerate() {
            self.transition(SequencerState::AwaitingConfirmation(index));
            let prompt = format!("Step {}/{}: {}?", index + 1, total, step.description);

            if !self.confirm(&prompt).await {
                warn!("Step {} declined by operator", index + 1);
                self.transition(SequencerState::Aborted {
                    index,
                    reason: AbortReason::Declined,
                });
                error = Some(Error::ConfirmationDeclined { step: index });
                break;
            }

            self.transition(SequencerState::Running(index));
            let env = StepEnv {
                ctx,
                client: self.client.as_ref(),
                progress: self.progress.as_ref(),
                config: &self.config,
                cancel: &self.cancel,
            };

            let outcome = step.action.run(&env).await;
            match outcome {
                Ok(()) => {
                    completed_steps += 1;
                    self.progress
                        .message(&format!("Step {}/{} done.", index + 1, total));
                    self.transition(SequencerState::StepSucceeded(index));
                }
                Err(e) => {
                    let failure = Error::StepFailed {
                        index,
                        description: step.description.clone(),
                        source: Box::new(e),
                    };
                    warn!("{}", failure);
                    self.transition(SequencerState::Aborted {
                        index,
                        reason: AbortReason::StepFailed(failure.to_string()),
                    });
                    error = Some(failure);
                    break;
                }
            }
        }

        if !self.state.is_terminal() {
            self.transition(SequencerState::Completed);
        }

        MigrationReport {
            run_id: ctx.run_id,
            namespace: ctx.namespace.clone(),
            claim_name: ctx.claim_name.clone(),
            target_class: ctx.target_class.clone(),
            volume_name: ctx.volume_name.clone(),
            started_at,
            finished_at: Utc::now(),
            completed_steps,
            state: self.state.clone(),
            error,
        }
    }
}
