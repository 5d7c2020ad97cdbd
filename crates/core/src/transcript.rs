//! Session transcript
//!
//! [`Transcript`] is the in-memory log sink every network loop appends to.
//! [`TranscriptWriter`] dumps it to a text file when the session ends.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local, Utc};

use crate::error::Result;
use crate::models::{EntryKind, LogEntry};

const RULE_WIDTH: usize = 80;

/// Shared, append-only chat log
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(
        &self,
        kind: EntryKind,
        username: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) {
        self.lock()
            .push(LogEntry::new(kind, username, text, timestamp));
    }

    /// Record a system notice stamped now
    pub fn system(&self, text: impl Into<String>) {
        self.record(EntryKind::System, "SYSTEM", text, Utc::now());
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Role the node held when the transcript was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    Server,
    Client {
        hub_username: String,
        host: String,
        port: u16,
    },
    /// Never got as far as hosting or joining
    Offline,
}

/// Metadata written at the top of a transcript file
#[derive(Debug, Clone)]
pub struct TranscriptHeader {
    pub username: String,
    pub started_at: DateTime<Utc>,
    pub mode: SessionMode,
}

/// Writes transcripts as `chat_log_<user>_<start>_to_<end>.log`
#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(header: &TranscriptHeader, ended_at: DateTime<Utc>) -> String {
        format!(
            "chat_log_{}_{}_to_{}.log",
            sanitize(&header.username),
            header.started_at.with_timezone(&Local).format("%Y%m%d_%H%M%S"),
            ended_at.with_timezone(&Local).format("%Y%m%d_%H%M%S"),
        )
    }

    /// Render the transcript body
    pub fn render(header: &TranscriptHeader, entries: &[LogEntry], ended_at: DateTime<Utc>) -> String {
        let rule = "=".repeat(RULE_WIDTH);
        let mut out = String::new();

        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "CHAT LOG - User: {}", header.username);
        let _ = writeln!(
            out,
            "Session: {} - {}",
            header.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            ended_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        );
        match &header.mode {
            SessionMode::Server => {
                let _ = writeln!(out, "Mode: SERVER");
            }
            SessionMode::Client {
                hub_username,
                host,
                port,
            } => {
                let _ = writeln!(out, "Mode: CLIENT");
                let _ = writeln!(out, "Server: {} ({}:{})", hub_username, host, port);
            }
            SessionMode::Offline => {
                let _ = writeln!(out, "Mode: OFFLINE");
            }
        }
        let _ = writeln!(out, "{}", rule);
        out.push('\n');

        for entry in entries {
            let _ = writeln!(out, "{}", format_entry(entry));
        }

        out.push('\n');
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "END OF LOG");
        out
    }

    /// Write the transcript. Returns `None` when there was nothing to save.
    pub fn write(
        &self,
        header: &TranscriptHeader,
        entries: &[LogEntry],
        ended_at: DateTime<Utc>,
    ) -> Result<Option<PathBuf>> {
        if entries.is_empty() {
            return Ok(None);
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::file_name(header, ended_at));
        fs::write(&path, Self::render(header, entries, ended_at))?;

        tracing::info!(path = %path.display(), entries = entries.len(), "Transcript written");
        Ok(Some(path))
    }
}

/// One transcript line
pub fn format_entry(entry: &LogEntry) -> String {
    let ts = entry.format_timestamp();
    match entry.kind {
        EntryKind::ChatMessage => format!("[{}] {}: {}", ts, entry.username, entry.text),
        EntryKind::ServerMessage => {
            format!("[{}] {} (SERVER): {}", ts, entry.username, entry.text)
        }
        EntryKind::System => format!("[{}] >>> {}", ts, entry.text),
    }
}

/// Keep file names portable
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
