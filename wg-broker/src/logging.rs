//! Leveled log sink
//!
//! Initialises `env_logger` with a writer that mirrors every record to stderr
//! and, optionally, to a log file. [`LogControl`] backs the broker's log
//! enable/disable/clear calls.

use anyhow::{Context, Result};
use log::LevelFilter;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Writes to stderr and to the shared log file
struct TeeWriter {
    file: Option<Arc<Mutex<File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                f.write_all(buf)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                f.flush()?;
            }
        }
        Ok(())
    }
}

/// Runtime control over the installed logger
#[derive(Clone)]
pub struct LogControl {
    file: Option<Arc<Mutex<File>>>,
    path: Option<PathBuf>,
    level: LevelFilter,
}

impl LogControl {
    /// A control with no backing file (tests, or when no logger is installed)
    pub fn detached() -> Self {
        Self {
            file: None,
            path: None,
            level: log::max_level(),
        }
    }

    /// Configured log file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-enable the configured level, or silence all output
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            log::set_max_level(self.level);
            log::info!("Logging enabled at {}", self.level);
        } else {
            log::info!("Logging disabled");
            log::set_max_level(LevelFilter::Off);
        }
    }

    /// Truncate the log file
    pub fn clear(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let mut f = file
            .lock()
            .map_err(|_| anyhow::anyhow!("Log file lock poisoned"))?;
        f.set_len(0).context("Failed to truncate log file")?;
        f.seek(SeekFrom::Start(0))
            .context("Failed to rewind log file")?;
        Ok(())
    }
}

/// Install the global logger
///
/// `RUST_LOG` overrides `level`, as with any `env_logger` setup.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<LogControl> {
    let file = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(Arc::new(Mutex::new(f)))
        }
        None => None,
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file: file.clone() })))
        .init();

    Ok(LogControl {
        file,
        path: log_file.map(Path::to_path_buf),
        level: log::max_level(),
    })
}
