//! JSONL mirror for timeline events.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::models::TimelineEvent;
use crate::{AppError, Result};

/// Appends one JSON object per line to a single file.
pub struct JsonlTimelineWriter {
    path: PathBuf,
    writer: Mutex<BufWriter<fs::File>>,
}

impl JsonlTimelineWriter {
    /// Open `path` for appending, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory or file cannot be created.
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::Io(format!(
                    "failed to create timeline directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                AppError::Io(format!("failed to open timeline log {}: {e}", path.display()))
            })?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Destination file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize and flush one event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if serialization or the write fails.
    pub fn append(&self, event: &TimelineEvent) -> Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| AppError::Io(format!("failed to serialize timeline event: {e}")))?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}")
            .and_then(|()| writer.flush())
            .map_err(|e| AppError::Io(format!("timeline write failed: {e}")))
    }
}
