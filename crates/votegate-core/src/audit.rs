use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::identity::Identity;

pub const MAX_CLIENT_AGENT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Accepted,
    Rejected,
}

/// Caller metadata recorded next to each attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub agent: Option<String>,
}

impl ClientInfo {
    pub fn new(ip: Option<String>, agent: Option<String>) -> Self {
        Self {
            ip,
            agent: agent.map(|value| value.chars().take(MAX_CLIENT_AGENT_CHARS).collect()),
        }
    }
}

/// An attempt as reported by the pipeline, before the log assigns it a
/// position.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    pub identity: Identity,
    pub outcome: AttemptOutcome,
    pub similarity_score: Option<f64>,
    pub liveness_passed: Option<bool>,
    pub client: ClientInfo,
    pub failure_reason: Option<String>,
}

impl NewAttempt {
    pub fn rejected(identity: &Identity, client: &ClientInfo, reason: impl Into<String>) -> Self {
        Self {
            identity: identity.clone(),
            outcome: AttemptOutcome::Rejected,
            similarity_score: None,
            liveness_passed: None,
            client: client.clone(),
            failure_reason: Some(reason.into()),
        }
    }

    pub fn with_similarity(mut self, score: f64) -> Self {
        self.similarity_score = Some(score);
        self
    }

    pub fn with_liveness(mut self, passed: Option<bool>) -> Self {
        self.liveness_passed = passed;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub sequence: u64,
    pub attempt_id: Uuid,
    pub identity: Identity,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Append-only attempt log. Entries can never be edited or removed.
pub trait AuditLog: Send + Sync {
    fn append(&self, attempt: NewAttempt) -> AppResult<AttemptRecord>;
}

/// Byte sink under the audit log; `File` in production.
trait LogSink {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogSink for File {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.write_all(line)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

struct LogState<S> {
    sink: S,
    next_sequence: u64,
    committed_len: u64,
    torn: bool,
}

impl<S: LogSink> LogState<S> {
    /// Writes and syncs one line. A failed append leaves the sink at its last
    /// committed length and does not consume a sequence number.
    fn commit(&mut self, line: &[u8]) -> io::Result<()> {
        if self.torn {
            self.sink.truncate(self.committed_len)?;
            self.torn = false;
        }

        let written = self
            .sink
            .write_line(line)
            .and_then(|_| self.sink.sync());
        if let Err(err) = written {
            if let Err(rollback) = self.sink.truncate(self.committed_len) {
                warn!(error = %rollback, "could not roll back failed audit append");
                self.torn = true;
            }
            return Err(err);
        }

        self.committed_len += line.len() as u64;
        self.next_sequence += 1;
        Ok(())
    }
}

/// JSON-lines audit log; one fsynced line per attempt.
pub struct JsonlAuditLog {
    path: PathBuf,
    state: Mutex<LogState<File>>,
}

impl JsonlAuditLog {
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| AppError::AuditWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut options = OpenOptions::new();
        options.create(true).read(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path).map_err(|source| AppError::AuditWrite {
            path: path.clone(),
            source,
        })?;

        let (next_sequence, committed_len) = recover_tail(&path, &file)?;
        debug!(path = %path.display(), next_sequence, "audit log opened");

        Ok(Self {
            path,
            state: Mutex::new(LogState {
                sink: file,
                next_sequence,
                committed_len,
                torn: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditLog for JsonlAuditLog {
    fn append(&self, attempt: NewAttempt) -> AppResult<AttemptRecord> {
        let mut state = self.state.lock().map_err(|_| AppError::AuditWrite {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::Other, "audit lock poisoned"),
        })?;

        let record = AttemptRecord {
            sequence: state.next_sequence,
            attempt_id: Uuid::new_v4(),
            identity: attempt.identity,
            timestamp: Utc::now(),
            outcome: attempt.outcome,
            similarity_score: attempt.similarity_score,
            liveness_passed: attempt.liveness_passed,
            client_ip: attempt.client.ip,
            client_agent: attempt.client.agent,
            failure_reason: attempt.failure_reason,
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        state.commit(&line).map_err(|source| AppError::AuditWrite {
            path: self.path.clone(),
            source,
        })?;

        Ok(record)
    }
}

/// Drops a partially written trailing line. Returns the next sequence number
/// and the length of the complete entries.
fn recover_tail(path: &Path, file: &File) -> AppResult<(u64, u64)> {
    let contents = fs::read(path).map_err(|source| AppError::AuditWrite {
        path: path.to_path_buf(),
        source,
    })?;

    let complete_len = match contents.iter().rposition(|byte| *byte == b'\n') {
        Some(idx) => idx + 1,
        None => 0,
    };
    if complete_len < contents.len() {
        warn!(
            path = %path.display(),
            dropped_bytes = contents.len() - complete_len,
            "truncating torn audit log entry"
        );
        file.set_len(complete_len as u64)
            .map_err(|source| AppError::AuditWrite {
                path: path.to_path_buf(),
                source,
            })?;
    }

    let last_line = contents[..complete_len]
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.is_empty())
        .last();
    match last_line {
        Some(line) => {
            let record: AttemptRecord =
                serde_json::from_slice(line).map_err(|err| AppError::InvalidAuditLog {
                    path: path.to_path_buf(),
                    message: format!("last entry is unreadable: {err}"),
                })?;
            Ok((record.sequence + 1, complete_len as u64))
        }
        None => Ok((0, complete_len as u64)),
    }
}

/// Read-only inspection. Returns the most recent `limit` entries (all when
/// `None`), oldest first, optionally filtered by identity.
pub fn read_entries(
    path: &Path,
    identity: Option<&Identity>,
    limit: Option<usize>,
) -> AppResult<Vec<AttemptRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(AppError::AuditWrite {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut buffer = String::new();
    let mut line_no = 0usize;
    loop {
        buffer.clear();
        let read = reader
            .read_line(&mut buffer)
            .map_err(|source| AppError::AuditWrite {
                path: path.to_path_buf(),
                source,
            })?;
        if read == 0 {
            break;
        }
        line_no += 1;
        if !buffer.ends_with('\n') {
            break;
        }
        let trimmed = buffer.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: AttemptRecord =
            serde_json::from_str(trimmed).map_err(|err| AppError::InvalidAuditLog {
                path: path.to_path_buf(),
                message: format!("line {line_no}: {err}"),
            })?;
        if identity.map_or(true, |wanted| &record.identity == wanted) {
            entries.push(record);
        }
    }

    if let Some(limit) = limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }
    Ok(entries)
}
