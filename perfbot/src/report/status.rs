//! Status-message windows.
//!
//! Long-running commands stream progress into a status message identified by
//! id. Each window keeps only the most recent lines, and all updates go
//! through one lock so concurrent pipeline steps never interleave text.

use chrono::Local;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Number of lines retained per status window.
const STATUS_WINDOW_LINES: usize = 10;

/// Mutex-guarded map of status id → accumulated window text.
#[derive(Debug, Default)]
pub struct StatusBoard {
    entries: Mutex<HashMap<Uuid, String>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a timestamped line to a window, trimming it to the most recent
    /// [`STATUS_WINDOW_LINES`], and return the full window text.
    pub fn append(&self, id: Uuid, line: &str) -> String {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let window = entries.entry(id).or_default();

        let stamped = format!("[{}] {}", Local::now().format("%H:%M:%S"), line);
        if !window.is_empty() {
            window.push('\n');
        }
        window.push_str(&stamped);

        let lines: Vec<&str> = window.lines().collect();
        if lines.len() > STATUS_WINDOW_LINES {
            *window = lines[lines.len() - STATUS_WINDOW_LINES..].join("\n");
        }

        window.clone()
    }

    /// Current text of a window, if any update has been posted.
    pub fn get(&self, id: Uuid) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(&id).cloned()
    }
}
