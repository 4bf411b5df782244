//! Append-only breadcrumb logs, keyed by drive session.
//!
//! Only raw positions are persisted. Coverage is rebuilt from them on demand
//! (see [`crate::drive::replay_session`]).

use crate::error::{lock_poisoned, CoverageError, Result};
use crate::position::Position;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A drive session as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: u64,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// One persisted position fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub session_id: u64,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Breadcrumb {
    pub fn from_position(session_id: u64, position: &Position) -> Self {
        Breadcrumb {
            session_id,
            lat: position.lat,
            lng: position.lng,
            accuracy: position.accuracy,
            timestamp: position.timestamp,
        }
    }

    pub fn to_position(&self) -> Position {
        Position {
            lat: self.lat,
            lng: self.lng,
            accuracy: self.accuracy,
            heading: None,
            speed: None,
            timestamp: self.timestamp,
        }
    }
}

/// Durable session + breadcrumb storage
pub trait BreadcrumbStore: Send + Sync {
    fn create_session(&self, name: &str) -> Result<SessionRecord>;

    /// Mark a session inactive
    fn end_session(&self, session_id: u64) -> Result<()>;

    fn session(&self, session_id: u64) -> Result<Option<SessionRecord>>;

    /// All sessions, newest first
    fn sessions(&self) -> Result<Vec<SessionRecord>>;

    fn append(&self, breadcrumb: &Breadcrumb) -> Result<()>;

    /// Breadcrumbs of one session in timestamp order
    fn breadcrumbs(&self, session_id: u64) -> Result<Vec<Breadcrumb>>;
}

fn newest_first(mut sessions: Vec<SessionRecord>) -> Vec<SessionRecord> {
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    sessions
}

fn unknown_session(session_id: u64) -> CoverageError {
    CoverageError::Storage(format!("Unknown session {}", session_id))
}

#[derive(Default)]
struct MemoryInner {
    next_id: u64,
    sessions: Vec<SessionRecord>,
    breadcrumbs: HashMap<u64, Vec<Breadcrumb>>,
}

/// Process-local store, used for tests and when no directory is configured
#[derive(Default)]
pub struct MemoryBreadcrumbStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryBreadcrumbStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreadcrumbStore for MemoryBreadcrumbStore {
    fn create_session(&self, name: &str) -> Result<SessionRecord> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("breadcrumb store"))?;
        inner.next_id += 1;
        let record = SessionRecord {
            id: inner.next_id,
            name: name.to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        inner.sessions.push(record.clone());
        Ok(record)
    }

    fn end_session(&self, session_id: u64) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("breadcrumb store"))?;
        let record = inner
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| unknown_session(session_id))?;
        record.is_active = false;
        Ok(())
    }

    fn session(&self, session_id: u64) -> Result<Option<SessionRecord>> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("breadcrumb store"))?;
        Ok(inner.sessions.iter().find(|s| s.id == session_id).cloned())
    }

    fn sessions(&self) -> Result<Vec<SessionRecord>> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("breadcrumb store"))?;
        Ok(newest_first(inner.sessions.clone()))
    }

    fn append(&self, breadcrumb: &Breadcrumb) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("breadcrumb store"))?;
        if !inner.sessions.iter().any(|s| s.id == breadcrumb.session_id) {
            return Err(unknown_session(breadcrumb.session_id));
        }
        inner
            .breadcrumbs
            .entry(breadcrumb.session_id)
            .or_default()
            .push(breadcrumb.clone());
        Ok(())
    }

    fn breadcrumbs(&self, session_id: u64) -> Result<Vec<Breadcrumb>> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("breadcrumb store"))?;
        let mut crumbs = inner.breadcrumbs.get(&session_id).cloned().unwrap_or_default();
        crumbs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(crumbs)
    }
}

/// On-disk store
///
/// # File Format
/// - `{dir}/sessions.json`: JSON array of session records
/// - `{dir}/session_{id}.jsonl.gz`: one gzip member per appended breadcrumb,
///   each holding a single JSON line; read back with a multi-member decoder
pub struct FileBreadcrumbStore {
    dir: PathBuf,
    // Serializes index rewrites and appends
    lock: Mutex<()>,
}

impl FileBreadcrumbStore {
    /// Open (creating if missing) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| {
                CoverageError::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        Ok(FileBreadcrumbStore {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("sessions.json")
    }

    fn log_path(&self, session_id: u64) -> PathBuf {
        self.dir.join(format!("session_{}.jsonl.gz", session_id))
    }

    fn read_index(&self) -> Result<Vec<SessionRecord>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| CoverageError::Storage(format!("Failed to read session index: {}", e)))?;
        serde_json::from_str(&text)
            .map_err(|e| CoverageError::Storage(format!("Corrupt session index: {}", e)))
    }

    fn write_index(&self, sessions: &[SessionRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(sessions)
            .map_err(|e| CoverageError::Storage(format!("Failed to serialize sessions: {}", e)))?;

        // Replace atomically through a temp file
        let tmp = self.dir.join("sessions.json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| CoverageError::Storage(format!("Failed to write session index: {}", e)))?;
        fs::rename(&tmp, self.index_path())
            .map_err(|e| CoverageError::Storage(format!("Failed to replace session index: {}", e)))
    }
}

impl BreadcrumbStore for FileBreadcrumbStore {
    fn create_session(&self, name: &str) -> Result<SessionRecord> {
        let _guard = self.lock.lock().map_err(|_| lock_poisoned("breadcrumb file"))?;
        let mut sessions = self.read_index()?;

        let record = SessionRecord {
            id: sessions.iter().map(|s| s.id).max().unwrap_or(0) + 1,
            name: name.to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        sessions.push(record.clone());
        self.write_index(&sessions)?;

        log::debug!("Created session {} in {}", record.id, self.dir.display());
        Ok(record)
    }

    fn end_session(&self, session_id: u64) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| lock_poisoned("breadcrumb file"))?;
        let mut sessions = self.read_index()?;
        let record = sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| unknown_session(session_id))?;
        record.is_active = false;
        self.write_index(&sessions)
    }

    fn session(&self, session_id: u64) -> Result<Option<SessionRecord>> {
        let _guard = self.lock.lock().map_err(|_| lock_poisoned("breadcrumb file"))?;
        Ok(self.read_index()?.into_iter().find(|s| s.id == session_id))
    }

    fn sessions(&self) -> Result<Vec<SessionRecord>> {
        let _guard = self.lock.lock().map_err(|_| lock_poisoned("breadcrumb file"))?;
        Ok(newest_first(self.read_index()?))
    }

    fn append(&self, breadcrumb: &Breadcrumb) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| lock_poisoned("breadcrumb file"))?;
        if !self.read_index()?.iter().any(|s| s.id == breadcrumb.session_id) {
            return Err(unknown_session(breadcrumb.session_id));
        }

        let mut line = serde_json::to_string(breadcrumb)
            .map_err(|e| CoverageError::Storage(format!("Failed to serialize breadcrumb: {}", e)))?;
        line.push('\n');

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(breadcrumb.session_id))
            .map_err(|e| CoverageError::Storage(format!("Failed to open breadcrumb log: {}", e)))?;

        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(line.as_bytes())
            .map_err(|e| CoverageError::Storage(format!("Failed to write breadcrumb: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| CoverageError::Storage(format!("Failed to finalize breadcrumb: {}", e)))?;

        Ok(())
    }

    fn breadcrumbs(&self, session_id: u64) -> Result<Vec<Breadcrumb>> {
        let _guard = self.lock.lock().map_err(|_| lock_poisoned("breadcrumb file"))?;
        let path = self.log_path(session_id);

        // No log yet is an empty session, not an error
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .map_err(|e| CoverageError::Storage(format!("Failed to open breadcrumb log: {}", e)))?;
        let reader = BufReader::new(MultiGzDecoder::new(file));

        let mut crumbs = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| {
                    CoverageError::Storage(format!("Failed to decompress breadcrumb log: {}", e))
                })?;
            if line.trim().is_empty() {
                continue;
            }
            let crumb: Breadcrumb = serde_json::from_str(&line)
                .map_err(|e| CoverageError::Storage(format!("Corrupt breadcrumb: {}", e)))?;
            crumbs.push(crumb);
        }

        crumbs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(crumbs)
    }
}
