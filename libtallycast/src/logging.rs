//! Log output for the Tallycast binaries
//!
//! `TALLYCAST_LOG_FORMAT` selects text, json or pretty output and
//! `TALLYCAST_LOG_LEVEL` the level; `RUST_LOG` overrides both. Logs always go
//! to stderr so stdout stays free for command output.

use std::fmt;
use std::str::FromStr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;

pub const FORMAT_ENV: &str = "TALLYCAST_LOG_FORMAT";
pub const LEVEL_ENV: &str = "TALLYCAST_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain lines, no colors
    #[default]
    Text,
    /// One flattened JSON object per event
    Json,
    /// Multi-line, colored
    Pretty,
}

impl LogFormat {
    const ALL: [LogFormat; 3] = [LogFormat::Text, LogFormat::Json, LogFormat::Pretty];

    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::Invalid {
                field: FORMAT_ENV.to_string(),
                message: format!("expected text, json or pretty, got {:?}", s),
            })
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    /// Forces debug for tallycast's own events
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: impl Into<String>, verbose: bool) -> Self {
        Self {
            format,
            level: level.into(),
            verbose,
        }
    }

    /// Format and level from the environment, `info` when unset
    pub fn from_env(verbose: bool) -> Self {
        Self::from_env_or("info", verbose)
    }

    /// Format and level from the environment, `default_level` when unset
    pub fn from_env_or(default_level: &str, verbose: bool) -> Self {
        let format = std::env::var(FORMAT_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();
        let level = std::env::var(LEVEL_ENV)
            .ok()
            .filter(|level| !level.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());

        Self::new(format, level, verbose)
    }

    /// Filter directive used when `RUST_LOG` is unset
    ///
    /// sqlx stays at warn even in verbose mode; its per-statement events
    /// drown out the adapters' page logs.
    fn directive(&self) -> String {
        let level = if self.verbose { "debug" } else { self.level.as_str() };
        format!("{},sqlx=warn", level)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(self.directive()))
            .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"))
    }

    /// Install the global subscriber
    pub fn try_init(&self) -> Result<(), TryInitError> {
        let json = (self.format == LogFormat::Json).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_writer(std::io::stderr)
        });
        let pretty = (self.format == LogFormat::Pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
        });
        let text = (self.format == LogFormat::Text).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stderr)
        });

        tracing_subscriber::registry()
            .with(self.filter())
            .with(json)
            .with(pretty)
            .with(text)
            .try_init()
    }

    /// Like [`try_init`](Self::try_init), keeping an existing subscriber
    pub fn init(&self) {
        if let Err(e) = self.try_init() {
            eprintln!("Logging already initialized: {}", e);
        }
    }
}
