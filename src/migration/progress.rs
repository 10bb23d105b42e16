//! Progress Reporters
//!
//! Poll loops redraw a single status line while they wait. The terminal
//! reporter overwrites it in place; the recording reporter keeps every
//! event for assertions.

use crate::domain::ports::ProgressReporter;
use parking_lot::Mutex;
use std::io::Write;

/// Carriage return plus ANSI erase-line
const CLEAR_LINE: &str = "\r\x1b[2K";

/// Writes progress to stdout, redrawing the active line
#[derive(Default)]
pub struct TerminalProgress {
    line_open: Mutex<bool>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for TerminalProgress {
    fn update(&self, line: &str) {
        let mut open = self.line_open.lock();
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "{}{}", CLEAR_LINE, line);
        let _ = out.flush();
        *open = true;
    }

    fn message(&self, line: &str) {
        let mut open = self.line_open.lock();
        let mut out = std::io::stdout().lock();
        if *open {
            let _ = writeln!(out);
            *open = false;
        }
        let _ = writeln!(out, "{}", line);
    }

    fn finish(&self) {
        let mut open = self.line_open.lock();
        if *open {
            println!();
            *open = false;
        }
    }
}

/// Event captured by [`RecordingProgress`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Update(String),
    Message(String),
    Finish,
}

/// Keeps every progress event in memory
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// Lines passed to `update`, in order
    pub fn updates(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Update(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// Lines passed to `message`, in order
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Message(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ProgressReporter for RecordingProgress {
    fn update(&self, line: &str) {
        self.events.lock().push(ProgressEvent::Update(line.to_string()));
    }

    fn message(&self, line: &str) {
        self.events.lock().push(ProgressEvent::Message(line.to_string()));
    }

    fn finish(&self) {
        self.events.lock().push(ProgressEvent::Finish);
    }
}
