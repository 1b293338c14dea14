//! Per-speaker subtitle buffering with threshold and idle flush policy.
//!
//! Buffers and idle deadlines are owned by the single client loop thread,
//! which serializes all mutations; deadlines are polled on the loop's
//! periodic tick rather than carried by per-speaker timer tasks, so at most
//! one deadline exists per speaker key by construction.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Normalize an optional speaker field into the partition key; absent
/// speakers share one empty key.
pub fn speaker_key(speaker: Option<&str>) -> String {
    speaker.unwrap_or("").to_string()
}

pub struct SpeakerBuffers {
    threshold: usize,
    idle_timeout: Option<Duration>,
    buffers: HashMap<String, Vec<String>>,
    deadlines: HashMap<String, Instant>,
}

impl SpeakerBuffers {
    /// `threshold` is clamped to at least 1; `idle_timeout` of zero
    /// disables idle flushing.
    pub fn new(threshold: usize, idle_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            idle_timeout: (!idle_timeout.is_zero()).then_some(idle_timeout),
            buffers: HashMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Append one line for the given key. Returns true when the buffer hit
    /// the threshold and must be flushed now; otherwise the key's idle
    /// deadline is (re)armed.
    pub fn push(&mut self, key: &str, line: &str, now: Instant) -> bool {
        let buffer = self.buffers.entry(key.to_string()).or_default();
        buffer.push(line.to_string());
        if buffer.len() >= self.threshold {
            self.deadlines.remove(key);
            return true;
        }
        if let Some(idle) = self.idle_timeout {
            self.deadlines.insert(key.to_string(), now + idle);
        }
        false
    }

    /// Atomically read-and-clear the buffer for a key, joining lines in
    /// arrival order. Clears the key's idle deadline. `None` if empty.
    pub fn take(&mut self, key: &str) -> Option<String> {
        self.deadlines.remove(key);
        let lines = self.buffers.remove(key)?;
        if lines.is_empty() {
            return None;
        }
        Some(lines.join("\n"))
    }

    /// Keys whose idle deadline has passed.
    pub fn due_keys(&self, now: Instant) -> Vec<String> {
        self.deadlines
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drain every non-empty buffer once (shutdown path) and cancel all
    /// idle deadlines.
    pub fn drain_all(&mut self) -> Vec<(String, String)> {
        self.deadlines.clear();
        let mut drained: Vec<(String, String)> = self
            .buffers
            .drain()
            .filter(|(_, lines)| !lines.is_empty())
            .map(|(key, lines)| (key, lines.join("\n")))
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    pub fn has_deadline(&self, key: &str) -> bool {
        self.deadlines.contains_key(key)
    }
}
