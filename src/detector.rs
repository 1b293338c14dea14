//! Completion detection over the interactive session's output stream.
//!
//! The external tool streams answer tokens incrementally behind a marker
//! glyph, interleaves transient spinner frames while generating, and only
//! prints a terminating status line (after a trailing blank line) once the
//! answer is final. The same terminal buffer may also still echo the
//! previous exchange's final answer before the new one appears, so the
//! scanner has to drain such a stale block instead of returning it.
//!
//! The scanner is fed one raw output line at a time, which keeps it fully
//! testable with synthetic scripts independent of the real tool.

use strip_ansi_escapes::strip_str;

pub const DEFAULT_MARKER: char = '✦';
pub const DEFAULT_SPINNER_FRAMES: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";
pub const DEFAULT_CONFIRM_PREFIX: &str = "Using:";

/// Glyphs and literals tied to the external tool's current output format.
/// Versioned defaults, overridable from the configuration surface.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Character signaling the start of an answer line.
    pub marker: char,
    /// Glyphs indicating the tool is still generating.
    pub spinner_frames: Vec<char>,
    /// Literal that, following a blank line, marks an answer as final.
    pub confirm_prefix: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER,
            spinner_frames: DEFAULT_SPINNER_FRAMES.chars().collect(),
            confirm_prefix: DEFAULT_CONFIRM_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Looking for a marker line whose body starts a new answer block.
    SeekMarker,
    /// Tracking a streaming answer. `drain` marks a stale block that is
    /// consumed and discarded instead of returned.
    Track { drain: bool },
}

/// Finite-state scanner over one exchange's output lines.
#[derive(Debug)]
pub struct AnswerScanner {
    config: DetectorConfig,
    skip_text: Option<String>,
    state: ScanState,
    tracked: Option<String>,
    blank_seen: bool,
    loading: bool,
}

impl AnswerScanner {
    /// `skip_text` is the previous exchange's confirmed answer; a marker
    /// block echoing it is drained and discarded rather than returned.
    pub fn new(config: DetectorConfig, skip_text: Option<String>) -> Self {
        Self {
            config,
            skip_text,
            state: ScanState::SeekMarker,
            tracked: None,
            blank_seen: false,
            loading: false,
        }
    }

    /// Feed one raw output line. Returns the confirmed answer once the
    /// terminating status line is observed after a true blank line.
    pub fn push_line(&mut self, raw: &str) -> Option<String> {
        let cleaned = strip_str(raw);
        let content = cleaned.trim();

        match self.state {
            ScanState::SeekMarker => {
                if let Some(body) = self.marker_body(content) {
                    if body.is_empty() {
                        return None;
                    }
                    let drain = self.skip_text.as_deref() == Some(body);
                    if drain {
                        tracing::debug!("marker matches previous answer, draining stale block");
                    }
                    self.state = ScanState::Track { drain };
                    self.tracked = Some(body.to_string());
                    self.blank_seen = false;
                    self.loading = false;
                }
                None
            }
            ScanState::Track { drain } => {
                if let Some(body) = self.marker_body(content) {
                    // Streaming updates arrive as repeated marker lines; a
                    // marker redraw also replaces any spinner frame.
                    if !body.is_empty() {
                        if !drain && self.skip_text.as_deref() == Some(body) {
                            tracing::debug!(
                                "tracked text caught up with previous answer, draining"
                            );
                            self.state = ScanState::Track { drain: true };
                        }
                        self.tracked = Some(body.to_string());
                        self.blank_seen = false;
                        self.loading = false;
                    }
                    return None;
                }

                if self.starts_with_spinner(content) {
                    self.loading = true;
                    self.blank_seen = false;
                    return None;
                }

                if content.is_empty() {
                    // A blank while the spinner is active is redraw noise,
                    // not the blank that precedes the status line.
                    if self.tracked.is_some() && !self.loading {
                        self.blank_seen = true;
                    }
                    return None;
                }

                if self.blank_seen && content.starts_with(self.config.confirm_prefix.as_str()) {
                    if drain {
                        tracing::debug!("stale block drained, resuming scan");
                        self.reset_to_seek();
                        return None;
                    }
                    return self.tracked.clone();
                }

                self.loading = false;
                None
            }
        }
    }

    /// Deadline fallback: the latest candidate while an answer block was
    /// being tracked, or nothing if no marker was ever found.
    pub fn best_effort(&self) -> Option<String> {
        match self.state {
            ScanState::SeekMarker => None,
            ScanState::Track { .. } => self.tracked.clone(),
        }
    }

    fn reset_to_seek(&mut self) {
        self.state = ScanState::SeekMarker;
        self.tracked = None;
        self.blank_seen = false;
        self.loading = false;
    }

    /// The trailing text after the marker glyph, trimmed. The marker is not
    /// always at the start of the line; redraws may concatenate it.
    fn marker_body<'a>(&self, content: &'a str) -> Option<&'a str> {
        let idx = content.find(self.config.marker)?;
        Some(content[idx + self.config.marker.len_utf8()..].trim())
    }

    fn starts_with_spinner(&self, content: &str) -> bool {
        content
            .chars()
            .next()
            .is_some_and(|ch| self.config.spinner_frames.contains(&ch))
    }
}
