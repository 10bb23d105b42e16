//! Run Identity
//!
//! One token per invocation, embedded in the names of the temporary claim
//! and copy job so that runs never collide with each other or with
//! leftovers from earlier runs.

use uuid::Uuid;

/// Longest name the API server accepts for a Job
pub const MAX_JOB_NAME_LEN: usize = 63;

/// Unique identifier of a single migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Name of the claim that temporarily rebinds the old volume
    pub fn temporary_claim_name(&self, claim: &str) -> String {
        format!("{}-old-{}", self, claim)
    }

    /// Name of the batch job that copies the data
    pub fn copy_job_name(&self, claim: &str) -> String {
        format!("{}-copy-{}", self, claim)
    }
}

impl From<Uuid> for RunId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
