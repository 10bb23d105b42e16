//! PVC Migrator
//!
//! Moves a PersistentVolumeClaim to another StorageClass by walking a
//! fixed, operator-confirmed sequence of cluster mutations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Step Sequencer                             │
//! │   confirm ─► run step ─► record ─► next step │ abort                │
//! ├───────────────────┬───────────────────────┬─────────────────────────┤
//! │  Confirmation     │      Poll Loop        │      Discovery          │
//! │  Gate             │  (deletion / job)     │  claim, volume, pods    │
//! ├───────────────────┴───────────────────────┴─────────────────────────┤
//! │                        Resource Client                              │
//! │        Kubernetes API (live)   │   In-memory cluster (tests)        │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Steps
//!
//! 1. Set the bound volume's reclaim policy to `Retain`
//! 2. Delete the claim and wait until it is gone
//! 3. Recreate the claim under the target storage class
//! 4. Release the old volume and bind it to a temporary claim
//! 5. Copy the data with a job and wait for it
//! 6. Delete the temporary claim
//!
//! # Modules
//!
//! - [`migration`]: Discovery, step sequencing, polling and interaction
//! - [`client`]: Resource client adapters
//! - [`domain`]: Port traits and shared types
//! - [`config`]: Run configuration
//! - [`error`]: Error types and handling

pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod migration;

// Re-export commonly used types
pub use client::{InMemoryCluster, KubeResourceClient};

pub use config::MigrationConfig;

pub use domain::ports::{
    ConfirmationGate, PollResult, ProgressReporter, ResourceClient, ResourceKind, ResourceRef,
    VolumePatch,
};

pub use error::{Error, Result};

pub use migration::{
    Discovery, MigrationPlan, MigrationReport, RunContext, RunId, SequencerState, StepSequencer,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
