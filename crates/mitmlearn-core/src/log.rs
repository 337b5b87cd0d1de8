//! Durable, append-only record of every resolved query.
//!
//! Three files live in the log directory:
//!
//! - `log.jsonl`: one [`LogRecord`] per line, the source of truth for resume
//! - `log.csv`: query and response
//! - `time_log.csv`: query and the per-action wall times in seconds
//!
//! Each write is flushed before the next query is served.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const LOG_FILE: &str = "log.jsonl";
pub const BACKUP_FILE: &str = "log.jsonl.bak";
pub const CSV_FILE: &str = "log.csv";
pub const TIME_LOG_FILE: &str = "time_log.csv";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Log IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Log CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Refusing to resume: backup {} already exists", .0.display())]
    BackupExists(PathBuf),
}

/// One resolved query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub query: String,
    pub response: String,
    /// Seconds per executed action; empty when answered from cache.
    pub transition_times: Vec<f64>,
    pub equivalence_digest: String,
    pub traces: Vec<Vec<String>>,
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
    /// Whether the learner asked for this query in the current run.
    pub used_query: bool,
}

impl LogRecord {
    pub fn new(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response: response.into(),
            transition_times: Vec::new(),
            equivalence_digest: String::new(),
            traces: Vec::new(),
            timestamps: BTreeMap::new(),
            used_query: true,
        }
    }

    pub fn with_times(mut self, times: &[Duration]) -> Self {
        self.transition_times = times.iter().map(Duration::as_secs_f64).collect();
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.equivalence_digest = digest.into();
        self
    }

    pub fn with_traces(mut self, traces: Vec<Vec<String>>) -> Self {
        self.traces = traces;
        self
    }

    pub fn stamp(&mut self, event: &str) {
        self.timestamps.insert(event.to_string(), Utc::now());
    }
}

pub struct SessionLog {
    dir: PathBuf,
    records: BufWriter<File>,
    table: csv::Writer<File>,
    times: csv::Writer<File>,
    backlog: Option<Lines<BufReader<File>>>,
}

impl SessionLog {
    /// Open a fresh log in `dir`.
    ///
    /// With `resume`, an existing `log.jsonl` is moved to `log.jsonl.bak`
    /// and its records are offered through [`SessionLog::resume_next`].
    pub fn open(dir: &Path, resume: bool) -> Result<Self, LogError> {
        fs::create_dir_all(dir)?;
        let log_path = dir.join(LOG_FILE);
        let mut backlog = None;
        if resume {
            let backup = dir.join(BACKUP_FILE);
            if backup.exists() {
                return Err(LogError::BackupExists(backup));
            }
            if log_path.exists() {
                fs::rename(&log_path, &backup)?;
                info!(backup = %backup.display(), "resuming from previous log");
                backlog = Some(BufReader::new(File::open(&backup)?).lines());
            } else {
                warn!(dir = %dir.display(), "nothing to resume");
            }
        }

        let records = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            records: BufWriter::new(records),
            table: csv::WriterBuilder::new()
                .has_headers(false)
                .from_path(dir.join(CSV_FILE))?,
            times: csv::WriterBuilder::new()
                .has_headers(false)
                .from_path(dir.join(TIME_LOG_FILE))?,
            backlog,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        serde_json::to_writer(&mut self.records, record)?;
        self.records.write_all(b"\n")?;
        self.records.flush()?;

        self.table.write_record([&record.query, &record.response])?;
        self.table.flush()?;

        let times = record
            .transition_times
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(";");
        self.times.write_record([record.query.as_str(), times.as_str()])?;
        self.times.flush()?;
        Ok(())
    }

    /// Next record of the previous run. A malformed line ends the backlog.
    pub fn resume_next(&mut self) -> Result<Option<LogRecord>, LogError> {
        let Some(lines) = self.backlog.as_mut() else {
            return Ok(None);
        };
        for line in lines.by_ref() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    warn!(error = %e, "malformed log line, stopping resume");
                    break;
                }
            }
        }
        self.backlog = None;
        Ok(None)
    }

    pub fn flush(&mut self) -> Result<(), LogError> {
        self.records.flush()?;
        self.table.flush()?;
        self.times.flush()?;
        Ok(())
    }
}
