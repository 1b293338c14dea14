//! Persistent interactive session over a PTY.
//!
//! Owns the external AI CLI process and serializes every prompt/response
//! exchange through the completion detector. The process is spawned once,
//! primed with an optional system instruction, and driven until shutdown;
//! it is not reentrant, so callers must serialize access (the comment
//! worker thread is the single entry point in this crate).

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use tracing::{debug, info, warn};
use vte::{Parser as VteParser, Perform};

use crate::detector::{AnswerScanner, DetectorConfig};
use crate::errors::SessionError;
use crate::sanitize::sanitize;
use crate::ShutdownToken;

/// Prompt-text patterns accepted as the ready prompt, most specific first.
const READY_PROMPT_PATTERNS: &[&str] = &[
    r">\s+Type your message or @path/to/file",
    r">\s+Type your message",
    r">",
];

/// Quit command understood by the external tool. Deliberately not
/// sanitized: it is the one meta-command the bridge itself issues.
const QUIT_COMMAND: &[u8] = b"/quit\r";

const OUTPUT_CHANNEL_CAPACITY: usize = 512;
const READ_BUFFER_SIZE: usize = 4096;
/// Delay between writing the prompt text and the submitting CR, giving the
/// tool's input widget time to settle.
const SUBMIT_SETTLE: Duration = Duration::from_millis(100);
/// Granularity of blocking waits, bounding shutdown observation latency.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Bounded wait for the process to exit after the quit command.
const QUIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interactive CLI command and its full argument list.
    pub command: String,
    pub args: Vec<String>,
    /// Locale exported to the child (LANG / LC_ALL).
    pub locale: String,
    pub rows: u16,
    pub cols: u16,
    /// Deadline for one exchange's confirmed answer.
    pub response_timeout: Duration,
    /// Deadline for the initial ready prompt and the post-answer re-wait.
    pub ready_timeout: Duration,
    /// Optional one-time priming instruction, sent sanitized at startup.
    pub system_prompt: Option<String>,
    pub detector: DetectorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: "gemini".to_string(),
            args: Vec::new(),
            locale: "ja_JP.UTF-8".to_string(),
            rows: 24,
            cols: 160,
            response_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(10),
            system_prompt: None,
            detector: DetectorConfig::default(),
        }
    }
}

/// Strip ANSI escape/control sequences from a raw PTY chunk while keeping
/// the control bytes the line assembler needs.
fn strip_ansi_preserve_controls(bytes: &[u8]) -> String {
    struct ControlStripper {
        output: String,
    }

    impl Perform for ControlStripper {
        fn print(&mut self, c: char) {
            self.output.push(c);
        }

        fn execute(&mut self, byte: u8) {
            match byte {
                b'\n' | b'\r' | b'\t' => self.output.push(byte as char),
                _ => {}
            }
        }
    }

    let mut parser = VteParser::new();
    let mut stripper = ControlStripper {
        output: String::with_capacity(bytes.len()),
    };
    parser.advance(&mut stripper, bytes);
    stripper.output
}

/// Reassembles raw PTY chunks into logical lines.
///
/// CRLF terminates a line; a lone CR is an in-place redraw and clears the
/// pending text, so only the final render of a redrawn line is observed.
/// The current partial line stays queryable because the ready prompt is
/// drawn without a trailing newline.
struct LineAssembler {
    current: String,
    ready: VecDeque<String>,
    pending_cr: bool,
}

impl LineAssembler {
    fn new() -> Self {
        Self {
            current: String::new(),
            ready: VecDeque::new(),
            pending_cr: false,
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        for ch in strip_ansi_preserve_controls(bytes).chars() {
            if self.pending_cr {
                self.pending_cr = false;
                if ch == '\n' {
                    self.complete();
                    continue;
                }
                self.current.clear();
            }
            match ch {
                '\r' => self.pending_cr = true,
                '\n' => self.complete(),
                '\t' => self.current.push(' '),
                _ => self.current.push(ch),
            }
        }
    }

    fn complete(&mut self) {
        self.ready.push_back(std::mem::take(&mut self.current));
    }

    fn pop(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn partial(&self) -> &str {
        &self.current
    }

    fn clear_partial(&mut self) {
        self.current.clear();
        self.pending_cr = false;
    }
}

/// Exchange-capable session, the seam between the comment worker and the
/// real PTY bridge.
pub trait Exchanger {
    fn exchange(&mut self, prompt: &str) -> Result<String, SessionError>;
    fn shutdown(&mut self);
}

impl Exchanger for SessionBridge {
    fn exchange(&mut self, prompt: &str) -> Result<String, SessionError> {
        SessionBridge::exchange(self, prompt)
    }

    fn shutdown(&mut self) {
        SessionBridge::shutdown(self);
    }
}

/// Bridge to the long-lived interactive session.
pub struct SessionBridge {
    config: SessionConfig,
    shutdown: ShutdownToken,
    ready_patterns: Vec<Regex>,
    master: Option<Box<dyn MasterPty + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    writer: Option<Box<dyn Write + Send>>,
    chunk_rx: Option<Receiver<Vec<u8>>>,
    reader_handle: Option<JoinHandle<()>>,
    assembler: LineAssembler,
    initialized: bool,
    last_answer: Option<String>,
}

impl SessionBridge {
    pub fn new(config: SessionConfig, shutdown: ShutdownToken) -> Result<Self, SessionError> {
        let ready_patterns = READY_PROMPT_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| SessionError::Initialization(format!("bad prompt pattern: {err}")))?;
        Ok(Self {
            config,
            shutdown,
            ready_patterns,
            master: None,
            child: None,
            writer: None,
            chunk_rx: None,
            reader_handle: None,
            assembler: LineAssembler::new(),
            initialized: false,
            last_answer: None,
        })
    }

    /// Start the external process and wait for its ready prompt. Idempotent.
    /// A failure here is fatal to the whole run.
    pub fn initialize(&mut self) -> Result<(), SessionError> {
        if self.initialized {
            debug!("session already initialized, skipping");
            return Ok(());
        }

        self.spawn_child()?;
        info!(
            command = %self.config.command,
            args = ?self.config.args,
            "started interactive session"
        );

        if !self.wait_ready(self.config.ready_timeout)? {
            self.shutdown();
            return Err(SessionError::Initialization(
                "tool never reached its ready prompt".to_string(),
            ));
        }
        debug!("input prompt ready");

        if let Some(instruction) = self.config.system_prompt.clone() {
            self.send_system_prompt(&instruction)?;
        }

        self.initialized = true;
        info!("session initialized");
        Ok(())
    }

    /// Send one prompt and wait for its confirmed answer. Requires
    /// `initialize()`; only one exchange may be active at a time.
    pub fn exchange(&mut self, prompt: &str) -> Result<String, SessionError> {
        if !self.initialized {
            return Err(SessionError::Io("session is not initialized".to_string()));
        }
        self.exchange_inner(prompt)
    }

    fn exchange_inner(&mut self, prompt: &str) -> Result<String, SessionError> {
        let sanitized = sanitize(prompt);
        debug!(chars = sanitized.chars().count(), "sending prompt");

        self.send_bytes(sanitized.as_bytes())?;
        self.settle()?;
        let started = Instant::now();
        self.send_bytes(b"\r")?;

        let answer = self.wait_answer(self.config.response_timeout)?;
        match answer {
            Some(text) => {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    chars = text.chars().count(),
                    "received response"
                );
                self.last_answer = Some(text.clone());
                // The prompt not returning is logged but non-fatal; the
                // next exchange simply retries the wait.
                if !self.wait_ready(self.config.ready_timeout)? {
                    warn!("prompt did not return after answer");
                }
                Ok(text)
            }
            None => Err(SessionError::ResponseTimeout {
                timeout_secs: self.config.response_timeout.as_secs(),
            }),
        }
    }

    /// Graceful quit, bounded wait, then force kill. Idempotent and safe
    /// from a destructor path.
    pub fn shutdown(&mut self) {
        if self.child.is_none() && !self.initialized {
            return;
        }
        info!("closing interactive session");

        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.write_all(QUIT_COMMAND);
            let _ = writer.flush();
        }

        if let Some(child) = self.child.as_mut() {
            let deadline = Instant::now() + QUIT_GRACE;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) => {
                        if Instant::now() >= deadline {
                            let _ = child.kill();
                            let _ = child.wait();
                            break;
                        }
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(_) => break,
                }
            }
        }

        self.writer = None;
        self.child = None;
        self.chunk_rx = None;
        self.master = None;
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        self.initialized = false;
        self.last_answer = None;
        debug!("session closed");
    }

    fn spawn_child(&mut self) -> Result<(), SessionError> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: self.config.rows,
                cols: self.config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| SessionError::Initialization(format!("openpty failed: {err}")))?;

        let mut cmd = CommandBuilder::new(&self.config.command);
        for arg in &self.config.args {
            cmd.arg(arg);
        }
        cmd.env("LANG", &self.config.locale);
        cmd.env("LC_ALL", &self.config.locale);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| SessionError::Initialization(format!("spawn failed: {err}")))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| SessionError::Initialization(format!("pty reader: {err}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| SessionError::Initialization(format!("pty writer: {err}")))?;

        let (chunk_tx, chunk_rx) = bounded::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.master = Some(pair.master);
        self.child = Some(child);
        self.writer = Some(writer);
        self.chunk_rx = Some(chunk_rx);
        self.reader_handle = Some(handle);
        Ok(())
    }

    fn send_system_prompt(&mut self, instruction: &str) -> Result<(), SessionError> {
        info!("sending system prompt");
        match self.exchange_inner(instruction) {
            Ok(answer) => {
                info!(answer = %answer, "system prompt response");
            }
            Err(SessionError::Cancelled) => return Err(SessionError::Cancelled),
            Err(err) => {
                warn!(%err, "system prompt failed");
            }
        }
        Ok(())
    }

    /// Run the completion detector over the output stream until a confirmed
    /// answer, cancellation, or the deadline. `None` means no marker was
    /// ever found; a tracked-but-unconfirmed answer is salvaged best-effort.
    fn wait_answer(&mut self, timeout: Duration) -> Result<Option<String>, SessionError> {
        let rx = self
            .chunk_rx
            .clone()
            .ok_or_else(|| SessionError::Io("session output stream not open".to_string()))?;
        let deadline = Instant::now() + timeout;
        let mut scanner =
            AnswerScanner::new(self.config.detector.clone(), self.last_answer.clone());
        debug!(timeout_secs = timeout.as_secs(), skip = ?self.last_answer, "waiting for answer");

        loop {
            if self.shutdown.should_abort() {
                return Err(SessionError::Cancelled);
            }
            while let Some(line) = self.assembler.pop() {
                if let Some(answer) = scanner.push_line(&line) {
                    return Ok(Some(answer));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                let salvaged = scanner.best_effort();
                if salvaged.is_some() {
                    debug!("deadline hit, salvaging tracked answer");
                }
                return Ok(salvaged);
            }
            match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok(chunk) => self.assembler.feed(&chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::Io("session output stream closed".to_string()))
                }
            }
        }
    }

    /// Wait until the ready prompt is visible, either as a completed line
    /// or as the current partial line. `Ok(false)` on deadline.
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool, SessionError> {
        let rx = self
            .chunk_rx
            .clone()
            .ok_or_else(|| SessionError::Io("session output stream not open".to_string()))?;
        let deadline = Instant::now() + timeout;

        loop {
            if self.shutdown.should_abort() {
                return Err(SessionError::Cancelled);
            }
            while let Some(line) = self.assembler.pop() {
                if self.matches_ready(&line) {
                    return Ok(true);
                }
            }
            if self.matches_ready(self.assembler.partial()) {
                self.assembler.clear_partial();
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok(chunk) => self.assembler.feed(&chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(false),
            }
        }
    }

    fn matches_ready(&self, line: &str) -> bool {
        let cleaned = strip_ansi_escapes::strip_str(line);
        self.ready_patterns
            .iter()
            .any(|pattern| pattern.is_match(&cleaned))
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SessionError::Io("session input stream not open".to_string()))?;
        writer
            .write_all(bytes)
            .and_then(|_| writer.flush())
            .map_err(|err| SessionError::Io(format!("pty write failed: {err}")))
    }

    fn settle(&mut self) -> Result<(), SessionError> {
        if self.shutdown.should_abort() {
            return Err(SessionError::Cancelled);
        }
        thread::sleep(SUBMIT_SETTLE);
        Ok(())
    }
}

impl Drop for SessionBridge {
    fn drop(&mut self) {
        if self.initialized {
            self.shutdown();
        }
    }
}
