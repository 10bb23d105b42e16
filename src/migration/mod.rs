//! Migration Engine
//!
//! Discovery resolves the claim, its volume and the pods mounting it; the
//! sequencer then walks the six-step plan behind the confirmation gate,
//! blocking on poll loops where the cluster changes asynchronously.

pub mod discovery;
pub mod gate;
pub mod identity;
pub mod manifests;
pub mod poll;
pub mod progress;
pub mod sequencer;
pub mod steps;

pub use discovery::{Discovery, RunContext};
pub use gate::{is_affirmative, ScriptedGate, TerminalGate, AFFIRMATIVE};
pub use identity::RunId;
pub use poll::{poll_until, DeletionProbe, JobCompletionProbe, PollSettings, Probe};
pub use progress::{ProgressEvent, RecordingProgress, TerminalProgress};
pub use sequencer::{
    AbortReason, MigrationPlan, MigrationReport, SequencerState, Step, StepSequencer,
};
pub use steps::{StepAction, StepEnv};
