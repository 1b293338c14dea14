//! Runtime configuration, from CLI flags and environment variables.

use std::time::Duration;

use anyhow::{ensure, Result};
use clap::Parser;

use crate::detector::{
    DetectorConfig, DEFAULT_CONFIRM_PREFIX, DEFAULT_MARKER, DEFAULT_SPINNER_FRAMES,
};
use crate::session::SessionConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "wipecast",
    about = "Live-broadcast comment overlay client backed by an interactive AI CLI"
)]
pub struct AppConfig {
    /// Model passed to the CLI tool via -m.
    #[arg(long, env = "WIPECAST_MODEL", default_value = "gemini-1.5-flash")]
    pub model: String,

    /// Interactive CLI command to drive.
    #[arg(long, env = "WIPECAST_CLI_CMD", default_value = "gemini")]
    pub cli_cmd: String,

    /// Extra argument appended to the CLI invocation (repeatable).
    #[arg(long = "cli-arg", allow_hyphen_values = true)]
    pub cli_args: Vec<String>,

    /// Seconds to wait for one confirmed answer.
    #[arg(long, default_value_t = 60)]
    pub response_timeout_secs: u64,

    /// Character cap for published comments; 0 or negative disables it.
    #[arg(long, default_value_t = 120)]
    pub max_output_chars: i64,

    /// Prompt template with {text}/{speaker}/{speaker_part}/{lines_num}
    /// placeholders; without it prompts are SPEAKER「TEXT」.
    #[arg(long, env = "WIPECAST_PROMPT_TEMPLATE")]
    pub prompt_template: Option<String>,

    /// One-time priming instruction sent when the session starts.
    #[arg(long, env = "WIPECAST_SYSTEM_PROMPT")]
    pub system_prompt: Option<String>,

    /// Overlay socket host.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Overlay socket port.
    #[arg(long, default_value_t = 50001)]
    pub port: u16,

    /// Display name attached to published comments.
    #[arg(long, default_value = "wipe")]
    pub speaker_name: String,

    /// Initial reconnect backoff in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub reconnect_initial_ms: u64,

    /// Reconnect backoff cap in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub reconnect_max_ms: u64,

    /// Subtitle lines buffered per speaker before a flush.
    #[arg(long, default_value_t = 5)]
    pub lines_per_batch: usize,

    /// Seconds of per-speaker silence before a partial buffer is flushed;
    /// 0 disables idle flushing.
    #[arg(long, default_value_t = 0)]
    pub idle_flush_secs: u64,

    /// Locale exported to the CLI child process.
    #[arg(long, default_value = "ja_JP.UTF-8")]
    pub locale: String,

    /// Glyph that starts an answer line in the tool's output.
    #[arg(long, default_value_t = DEFAULT_MARKER)]
    pub answer_marker: char,

    /// Spinner glyphs the tool shows while generating.
    #[arg(long, default_value = DEFAULT_SPINNER_FRAMES)]
    pub spinner_frames: String,

    /// Status-line prefix that confirms an answer as final.
    #[arg(long, default_value = DEFAULT_CONFIRM_PREFIX)]
    pub confirm_prefix: String,

    /// Comment published when generation fails or comes back empty.
    #[arg(long, default_value = "いいね！")]
    pub fallback_comment: String,

    /// Log filter when WIPECAST_LOG is unset.
    #[arg(long, env = "WIPECAST_LOG", default_value = "info")]
    pub log_level: String,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.confirm_prefix.trim().is_empty(),
            "confirm prefix must not be empty"
        );
        ensure!(
            !self.spinner_frames.is_empty(),
            "spinner frames must not be empty"
        );
        ensure!(
            self.reconnect_max_ms >= self.reconnect_initial_ms,
            "reconnect backoff cap {}ms is below the initial {}ms",
            self.reconnect_max_ms,
            self.reconnect_initial_ms
        );
        ensure!(
            self.response_timeout_secs >= 1,
            "response timeout must be at least 1 second"
        );
        Ok(())
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }

    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            marker: self.answer_marker,
            spinner_frames: self.spinner_frames.chars().collect(),
            confirm_prefix: self.confirm_prefix.clone(),
        }
    }

    pub fn session(&self) -> SessionConfig {
        let mut args = vec!["-m".to_string(), self.model.clone()];
        args.extend(self.cli_args.iter().cloned());
        SessionConfig {
            command: self.cli_cmd.clone(),
            args,
            locale: self.locale.clone(),
            rows: 24,
            cols: 160,
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            ready_timeout: Duration::from_secs(10),
            system_prompt: self.system_prompt.clone(),
            detector: self.detector(),
        }
    }
}
