// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::tailer::WebhookFormat;

/// Input variant the tailer is built from.
#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum InputType {
    /// Tail files matched by the include globs
    #[default]
    File,
    /// Tail standard input
    Stdin,
    /// Accept lines via HTTP POST
    Webhook,
}

/// Discovery strategy for file input.
#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum FileMode {
    /// File-system events drive discovery; readers follow by polling
    Watch,
    /// Periodic directory re-listing only
    Poll,
    /// Events for discovery plus polling followers, which also covers
    /// symlinks whose target appears later
    #[default]
    Mixed,
}

/// How a webhook request body maps to lines.
#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum WebhookFormatArg {
    /// The whole body is one line
    #[value(name = "text_single")]
    TextSingle,
    /// The body is split on newlines
    #[default]
    #[value(name = "text_bulk")]
    TextBulk,
}

impl From<WebhookFormatArg> for WebhookFormat {
    fn from(f: WebhookFormatArg) -> Self {
        match f {
            WebhookFormatArg::TextSingle => WebhookFormat::TextSingle,
            WebhookFormatArg::TextBulk => WebhookFormat::TextBulk,
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(name = "tailmet", version, about = "Log-line exporter")]
pub struct Args {
    /// Input type
    #[arg(value_enum, long, env = "TAILMET_INPUT_TYPE", default_value = "file")]
    pub input_type: InputType,

    /// Comma-separated glob patterns for files to tail (e.g. "/var/log/*.log")
    #[arg(long, env = "TAILMET_INPUT_INCLUDE", value_delimiter = ',')]
    pub input_include: Vec<String>,

    /// Comma-separated glob patterns for files to skip
    #[arg(long, env = "TAILMET_INPUT_EXCLUDE", value_delimiter = ',')]
    pub input_exclude: Vec<String>,

    /// Discovery mode for file input: watch, poll, mixed
    #[arg(value_enum, long, env = "TAILMET_FILE_MODE", default_value = "mixed")]
    pub file_mode: FileMode,

    /// Where read offsets are persisted across restarts
    #[arg(
        long,
        env = "TAILMET_POSITION_FILE",
        default_value = "/var/lib/tailmet/position.json"
    )]
    pub position_file: PathBuf,

    /// Seconds between position file flushes
    #[arg(long, env = "TAILMET_POSITION_SYNC_INTERVAL", default_value = "10")]
    pub position_sync_interval_secs: u64,

    /// Milliseconds between directory re-lists (poll mode) and between
    /// EOF re-checks of the per-file followers
    #[arg(long, env = "TAILMET_POLL_INTERVAL_MS", default_value = "250")]
    pub poll_interval_ms: u64,

    /// Stop readers quiet for this many seconds, keeping their offset.
    /// 0 disables the idle sweep.
    #[arg(long, env = "TAILMET_IDLE_TIMEOUT", default_value = "0")]
    pub idle_timeout_secs: u64,

    /// Treat a missing file as an error instead of waiting for it
    #[arg(long, env = "TAILMET_FAIL_ON_MISSING_FILE", default_value = "false")]
    pub fail_on_missing_file: bool,

    /// Maximum lines held in the fan-in buffer; 0 means unbounded
    #[arg(long, env = "TAILMET_MAX_LINES_IN_BUFFER", default_value = "0")]
    pub max_lines_in_buffer: usize,

    /// Address of the HTTP scrape endpoint
    #[arg(long, env = "TAILMET_LISTEN", default_value = "0.0.0.0:9144")]
    pub listen: SocketAddr,

    /// Path serving the Prometheus text exposition
    #[arg(long, env = "TAILMET_METRICS_PATH", default_value = "/metrics")]
    pub metrics_path: String,

    /// Path accepting webhook POSTs (webhook input only)
    #[arg(long, env = "TAILMET_WEBHOOK_PATH", default_value = "/webhook")]
    pub webhook_path: String,

    /// Webhook body format: text_single, text_bulk
    #[arg(
        value_enum,
        long,
        env = "TAILMET_WEBHOOK_FORMAT",
        default_value = "text_bulk"
    )]
    pub webhook_format: WebhookFormatArg,

    /// Log filter (tracing EnvFilter syntax, e.g. "info" or "tailmet=debug")
    #[arg(long, env = "TAILMET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate cross-field constraints before anything is started.
    pub fn validate(&self) -> Result<(), String> {
        if self.input_type == InputType::File && self.input_include.is_empty() {
            return Err("file input requires at least one --input-include pattern".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("--poll-interval-ms must be positive".to_string());
        }
        if self.input_type == InputType::Webhook && self.webhook_path == self.metrics_path {
            return Err("--webhook-path must differ from --metrics-path".to_string());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn position_sync_interval(&self) -> Duration {
        Duration::from_secs(self.position_sync_interval_secs)
    }
}
