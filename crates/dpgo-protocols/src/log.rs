//! Per-iteration diagnostics, one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use dpgo_core::RobotId;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub robot: RobotId,
    pub iteration: u64,
    /// Time since optimization started.
    pub elapsed_ms: u64,
    pub objective: f64,
    /// Public state received so far.
    pub bytes_received: u64,
}

/// Append-only iteration log.
#[derive(Debug)]
pub struct IterationLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl IterationLog {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &IterationRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
