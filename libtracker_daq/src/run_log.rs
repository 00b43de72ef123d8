use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use super::error::RunLogError;
use super::telemetry::BoardTelemetry;
use super::worker_status::RunStatistics;

/// How a run ended. Degraded runs carry partial data from at least one
/// board; aborted runs were cut short by the operator after acquisition had
/// already begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunQuality {
    Good,
    Degraded,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardRecord {
    pub board_id: u8,
    /// True when the board's drain did not finalize cleanly; its frame file
    /// may be truncated but is still analyzable.
    pub partial: bool,
    pub statistics: Option<RunStatistics>,
    pub telemetry: Option<BoardTelemetry>,
}

/// One entry of the run log. Written exactly once per completed or degraded
/// run and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogRecord {
    pub run_number: u32,
    pub started: OffsetDateTime,
    pub finished: OffsetDateTime,
    pub quality: RunQuality,
    pub acquisition_window_ms: u64,
    pub boards: Vec<BoardRecord>,
}

/// Append-only run log: one YAML document per run, `---` separated, keyed
/// by run number. There is no update or delete.
#[derive(Debug, Clone)]
pub struct RunLogger {
    path: PathBuf,
}

impl RunLogger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &RunLogRecord) -> Result<(), RunLogError> {
        let yaml_str = serde_yaml::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "---")?;
        file.write_all(yaml_str.as_bytes())?;
        Ok(())
    }

    /// Deserialize the whole log, oldest first. Used by offline tools and
    /// tests; the acquisition itself only ever appends.
    pub fn read_all(&self) -> Result<Vec<RunLogRecord>, RunLogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&text) {
            records.push(RunLogRecord::deserialize(document)?);
        }
        Ok(records)
    }
}
