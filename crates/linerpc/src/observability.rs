//! Local diagnostic logging.
//!
//! Router diagnostics (unparseable lines, stray responses, failing
//! notification handlers) go through `tracing`. They never touch the protocol
//! stream: for a stdio peer stdout *is* the protocol channel, so diagnostics
//! are written to stderr or to a file.
//!
//! | Output | Guard Required | Why |
//! |--------|----------------|-----|
//! | `Stderr` | No | Direct writes, no buffering |
//! | `File` | **Yes** | Non-blocking I/O buffers logs |
//! | `None` | No | No logging |
//!
//! ```rust,no_run
//! use linerpc::LoggingConfig;
//!
//! LoggingConfig::stderr_minimal().init()?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Where diagnostics are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutput {
    /// Standard error
    #[default]
    Stderr,
    /// Daily-rotated file in [`LoggingConfig::directory`]
    File,
    /// Discard everything
    None,
}

/// Diagnostic logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub structured: bool,
    /// Output target
    pub output: LogOutput,
    /// Directory for [`LogOutput::File`]
    pub directory: Option<PathBuf>,
    /// File name prefix for [`LogOutput::File`]
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: false,
            output: LogOutput::Stderr,
            directory: None,
            file_prefix: "linerpc".to_string(),
        }
    }
}

/// Guard that flushes buffered file logs on drop. Hold it until exit.
#[derive(Debug)]
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

impl LoggingConfig {
    /// Errors only, to stderr.
    #[must_use]
    pub fn stderr_minimal() -> Self {
        Self {
            level: "error".to_string(),
            ..Self::default()
        }
    }

    /// Everything from debug up, to stderr.
    #[must_use]
    pub fn stderr_debug() -> Self {
        Self {
            level: "debug".to_string(),
            ..Self::default()
        }
    }

    /// Info and up, to a daily-rotated file under `directory`.
    #[must_use]
    pub fn file(directory: impl AsRef<Path>) -> Self {
        Self {
            output: LogOutput::File,
            directory: Some(directory.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Install the global subscriber.
    ///
    /// Returns `Some(LoggingGuard)` for file output; it must be held.
    ///
    /// # Errors
    ///
    /// Returns an error if file output has no directory, the directory cannot
    /// be created, or a global subscriber is already installed.
    pub fn init(&self) -> io::Result<Option<LoggingGuard>> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.output {
            LogOutput::None => Ok(None),
            LogOutput::Stderr => {
                let subscriber = tracing_subscriber::registry().with(filter);
                let installed = if self.structured {
                    subscriber
                        .with(fmt::layer().json().with_writer(io::stderr))
                        .try_init()
                } else {
                    subscriber
                        .with(fmt::layer().with_writer(io::stderr))
                        .try_init()
                };
                installed.map_err(|e| io::Error::other(e.to_string()))?;
                Ok(None)
            }
            LogOutput::File => {
                let dir = self.directory.as_ref().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "File logging requires a directory",
                    )
                })?;
                std::fs::create_dir_all(dir)?;

                let appender = tracing_appender::rolling::daily(dir, &self.file_prefix);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let subscriber = tracing_subscriber::registry().with(filter);
                let installed = if self.structured {
                    subscriber
                        .with(fmt::layer().json().with_ansi(false).with_writer(writer))
                        .try_init()
                } else {
                    subscriber
                        .with(fmt::layer().with_ansi(false).with_writer(writer))
                        .try_init()
                };
                installed.map_err(|e| io::Error::other(e.to_string()))?;
                Ok(Some(LoggingGuard { _guard: guard }))
            }
        }
    }
}
