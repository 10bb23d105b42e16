//! Migration Configuration
//!
//! Knobs that tune how steps run without changing what they do.

use crate::error::{Error, Result};
use crate::migration::poll::PollSettings;
use std::time::Duration;

/// Image used by the copy job when none is configured
pub const DEFAULT_COPY_IMAGE: &str = "alpine:3";

/// Configuration for a migration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Timing of the deletion and job-completion waits
    pub poll: PollSettings,
    /// Container image for the copy job; must provide `sh` and `cp`
    pub copy_image: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            copy_image: DEFAULT_COPY_IMAGE.to_string(),
        }
    }
}

impl MigrationConfig {
    /// Build from CLI values, in seconds
    pub fn from_secs(
        poll_interval_secs: u64,
        poll_timeout_secs: Option<u64>,
        copy_image: &str,
    ) -> Result<Self> {
        let config = Self {
            poll: PollSettings {
                interval: Duration::from_secs(poll_interval_secs),
                timeout: poll_timeout_secs.map(Duration::from_secs),
            },
            copy_image: copy_image.to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll.interval.is_zero() {
            return Err(Error::Configuration(
                "Poll interval must be greater than zero".into(),
            ));
        }
        if let Some(timeout) = self.poll.timeout {
            if timeout < self.poll.interval {
                return Err(Error::Configuration(format!(
                    "Poll timeout {:?} is shorter than the poll interval {:?}",
                    timeout, self.poll.interval
                )));
            }
        }
        if self.copy_image.trim().is_empty() {
            return Err(Error::Configuration("Copy image must not be empty".into()));
        }
        Ok(())
    }
}
