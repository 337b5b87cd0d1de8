//! Per-session interception history and equivalence digest.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use mitmlearn_transport::{Pair, PhaseKind};
use serde::{Deserialize, Serialize};

use crate::FuzzError;

pub const HISTORY_FILE: &str = "fuzzer.jsonl";

/// Separator between the digest parts of one session.
pub const DIGEST_SEPARATOR: &str = "###";

/// One intercepted message and the action that was pending when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub cmd: String,
    pub message: String,
    pub cookies: Vec<Pair>,
    pub kind: PhaseKind,
    pub symbol: String,
    pub mitm: String,
    /// Body actually forwarded, when a fuzzer replaced it.
    pub msg_mod: Option<String>,
}

/// State owned by one learning session, reset before every query.
#[derive(Debug, Default)]
pub struct SessionContext {
    history: Vec<HistoryEntry>,
    digest: Vec<String>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// Note that the last message was forwarded as `body` instead.
    pub fn mark_modified(&mut self, body: &str, cookies: Option<&[Pair]>) {
        if let Some(last) = self.history.last_mut() {
            last.msg_mod = Some(body.to_string());
            if let Some(cookies) = cookies {
                last.cookies = cookies.to_vec();
            }
        }
    }

    pub fn push_digest(&mut self, part: impl Into<String>) {
        self.digest.push(part.into());
    }

    /// Equivalence digest of the session so far.
    pub fn digest(&self) -> String {
        self.digest.join(DIGEST_SEPARATOR)
    }

    /// Index of the most recent entry in `history[..end]` matching the
    /// filters.
    pub fn search(
        &self,
        end: usize,
        kind: Option<PhaseKind>,
        symbol: Option<&str>,
    ) -> Option<usize> {
        let end = end.min(self.history.len());
        self.history[..end].iter().rposition(|entry| {
            kind.map_or(true, |k| entry.kind == k)
                && symbol.map_or(true, |s| entry.symbol == s)
        })
    }

    /// Start a new session, handing back the finished history.
    pub fn reset(&mut self) -> Vec<HistoryEntry> {
        self.digest.clear();
        std::mem::take(&mut self.history)
    }
}

/// Append-only record of finished session histories, one JSON line each.
pub struct HistoryLog {
    writer: BufWriter<File>,
}

impl HistoryLog {
    pub fn open(dir: &Path, append: bool) -> Result<Self, FuzzError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(dir.join(HISTORY_FILE))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, history: &[HistoryEntry]) -> Result<(), FuzzError> {
        serde_json::to_writer(&mut self.writer, history)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
