//! Per-task log capture.
//!
//! Each `(artifact, step)` task accumulates its narration and the captured
//! output of external tools into a buffer. The buffer is flushed to the
//! slot's `log.txt` when the task finishes and additionally echoed to the
//! global `tracing` sink when the step failed, one event per line.

use crate::error::{BuildError, Result};
use std::{fmt::Display, fs, path::Path};

#[derive(Debug, Default)]
pub struct StepLog {
    lines: Vec<String>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a single line.
    pub fn line(&mut self, line: impl Display) {
        self.lines.push(line.to_string());
    }

    /// Appends every line of a (possibly multi-line) tool output block.
    pub fn block(&mut self, block: &str) {
        for line in block.lines() {
            self.lines.push(line.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Writes the buffered lines to `path`, creating parent directories.
    pub fn flush_to(&self, path: &Path) -> Result<()> {
        crate::utils::create_parent_dir_all(path)?;
        let mut content = self.lines.join("\n");
        content.push('\n');
        fs::write(path, content).map_err(|err| BuildError::io(err, path))
    }

    /// Echoes every buffered line to the global sink. Used when a step
    /// failed so the captured tool output surfaces without opening the slot.
    pub fn echo(&self, context: impl Display) {
        for line in &self.lines {
            error!(target: "j2cl_build", "{context}: {line}");
        }
    }
}
