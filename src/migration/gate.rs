//! Confirmation Gates
//!
//! Every step waits for the operator. Only the exact, case-sensitive
//! [`AFFIRMATIVE`] token proceeds; anything else, including end of input,
//! stops the run.

use crate::domain::ports::ConfirmationGate;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};

/// The only answer that lets a step run
pub const AFFIRMATIVE: &str = "Y";

/// Whether a raw input line is the affirmative token
///
/// Only the line terminator is stripped; surrounding spaces or a
/// different case decline.
pub fn is_affirmative(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == AFFIRMATIVE
}

// =============================================================================
// Terminal Gate
// =============================================================================

/// Prompts on stdout and reads the answer from stdin
pub struct TerminalGate {
    input: tokio::sync::Mutex<BufReader<Stdin>>,
}

impl TerminalGate {
    pub fn new() -> Self {
        Self {
            input: tokio::sync::Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

impl Default for TerminalGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfirmationGate for TerminalGate {
    async fn confirm(&self, prompt: &str) -> Result<bool> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{} [type {} to continue]: ", prompt, AFFIRMATIVE).as_bytes())
            .await?;
        stdout.flush().await?;

        let mut line = String::new();
        let read = self.input.lock().await.read_line(&mut line).await?;
        if read == 0 {
            // stdin closed
            return Ok(false);
        }
        Ok(is_affirmative(&line))
    }
}

// =============================================================================
// Scripted Gate
// =============================================================================

/// Answers prompts from a fixed script; an exhausted script declines
#[derive(Default)]
pub struct ScriptedGate {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGate {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Approve `count` prompts
    pub fn approve_all(count: usize) -> Self {
        Self::new(std::iter::repeat(AFFIRMATIVE).take(count))
    }

    /// Prompts shown so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ConfirmationGate for ScriptedGate {
    async fn confirm(&self, prompt: &str) -> Result<bool> {
        self.prompts.lock().push(prompt.to_string());
        let answer = self.answers.lock().pop_front();
        Ok(answer.map(|a| is_affirmative(&a)).unwrap_or(false))
    }
}
