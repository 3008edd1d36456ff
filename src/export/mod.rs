pub mod record;

pub use record::*;

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::state::LiveStats;

/// Append-only result sink: one JSON object per line.
///
/// A decoupled enricher may later rewrite records to attach an egress_path;
/// nothing here blocks on or knows about that.
pub struct ResultWriter {
    path: PathBuf,
}

impl ResultWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, result: &TestResult) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open results file {}", self.path.display()))?;
        let line = serde_json::to_string(result)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Overwrite the live stats snapshot file (polled by the dashboard)
pub fn write_live_stats(path: &Path, stats: &LiveStats) -> Result<()> {
    let json = serde_json::to_string(stats)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write stats file {}", path.display()))?;
    Ok(())
}
