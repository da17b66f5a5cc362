//! Tracing subscriber setup.
//!
//! Logs go to stderr by default. With a log file configured, the previous
//! files are rotated (`conductor.log` → `.1` → `.2` …) and every line is
//! flushed to disk as it is written.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::mcp_client::errors::McpError;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "mcp_conductor=info,warn";

/// Logging options, usually read from the `logging` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOptions {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
    /// Write to this file instead of stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Rotated files kept next to `file`.
    #[serde(default = "default_keep")]
    pub keep: u32,
}

fn default_filter() -> String {
    DEFAULT_FILTER.to_string()
}

fn default_keep() -> u32 {
    3
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
            file: None,
            keep: default_keep(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Fails if the log file cannot be opened or a subscriber is already set.
pub fn init_tracing(options: &LogOptions) -> Result<(), McpError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.filter))
        .map_err(|e| McpError::ConfigError {
            reason: format!("invalid log filter '{}': {e}", options.filter),
        })?;

    let builder = fmt::fmt().with_env_filter(filter).with_target(true);

    let installed = match &options.file {
        Some(path) => {
            let writer = open_log_file(path, options.keep)?;
            let builder = builder.with_writer(writer).with_ansi(false);
            if options.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            if options.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
    };

    installed.map_err(|e| McpError::ConfigError {
        reason: format!("failed to install tracing subscriber: {e}"),
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?options.file,
        pid = std::process::id(),
        "logging initialized"
    );
    Ok(())
}

fn open_log_file(path: &Path, keep: u32) -> Result<FlushingWriter, McpError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| McpError::ConfigError {
            reason: format!("cannot create log directory {}: {e}", dir.display()),
        })?;
    }

    rotate_log_file(path, keep);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| McpError::ConfigError {
            reason: format!("cannot open log file {}: {e}", path.display()),
        })?;
    Ok(FlushingWriter::new(file))
}

/// Rotate log files: `name` → `name.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write, so the log survives a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("conductor.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("conductor.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("conductor.log.2"), "two").unwrap();

        rotate_log_file(&base, 2);

        assert!(!base.exists());
        let one = std::fs::read_to_string(dir.path().join("conductor.log.1")).unwrap();
        let two = std::fs::read_to_string(dir.path().join("conductor.log.2")).unwrap();
        assert_eq!(one, "current");
        assert_eq!(two, "one");
        assert!(!dir.path().join("conductor.log.3").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("out.log");
        let mut writer = open_log_file(&path, 3).unwrap();
        writer.write_all(b"line one\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_options_defaults() {
        let opts: LogOptions = serde_yaml::from_str("{}").unwrap();
        assert_eq!(opts.filter, DEFAULT_FILTER);
        assert_eq!(opts.keep, 3);
        assert!(opts.file.is_none());
    }
}
