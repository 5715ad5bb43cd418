//! Append-only migration ledger (JSON Lines).
//!
//! One record per file per phase. A record is appended and synced before the
//! next file is started, so the ledger is the resumability checkpoint: files
//! with a successful record for a phase are skipped by that phase on rerun.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{normalize_separators, Phase};
use crate::error::{MigrateError, Result};

/// What happened to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Copied and its content rewritten.
    Migrated,
    /// Copied without touching content.
    Copied,
    /// Edited where it already was (`auto-existing` / in-place).
    Edited,
    /// Deliberately left alone (in-place protection, missing target).
    Skipped,
    /// Failed; see `detail`.
    Failed,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Migrated | Outcome::Copied | Outcome::Edited)
    }
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub phase: Phase,
    pub job: usize,
    pub source: PathBuf,
    /// Where the file is on disk after this step.
    pub target: PathBuf,
    /// The path the migrated server will use for the file.
    pub server_path: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        phase: Phase,
        job: usize,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        server_path: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            phase,
            job,
            source: source.into(),
            target: target.into(),
            server_path: server_path.into(),
            outcome,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The persistent ledger plus in-memory indexes over it.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: File,
    entries: Vec<LedgerEntry>,
    completed: HashSet<(Phase, PathBuf)>,
    /// Normalized server path → latest on-disk location.
    destinations: HashMap<String, PathBuf>,
    /// Source file → latest on-disk location.
    targets: HashMap<PathBuf, PathBuf>,
}

impl Ledger {
    /// Open (or create) the ledger at `path`, loading existing records.
    ///
    /// Lines that fail to parse (an interrupted append) are skipped with a
    /// warning.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MigrateError::io_with_path(e, parent))?;
        }

        let mut ledger = Self {
            path: path.to_path_buf(),
            file: OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| MigrateError::io_with_path(e, path))?,
            entries: Vec::new(),
            completed: HashSet::new(),
            destinations: HashMap::new(),
            targets: HashMap::new(),
        };

        let contents = fs::read_to_string(path).map_err(|e| MigrateError::io_with_path(e, path))?;
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(line) {
                Ok(entry) => ledger.index(entry),
                Err(e) => warn!("Skipping unreadable ledger line {} in {}: {}", number + 1, path.display(), e),
            }
        }
        // Terminate a torn last line so the next record starts cleanly.
        if !contents.is_empty() && !contents.ends_with('\n') {
            ledger
                .file
                .write_all(b"\n")
                .map_err(|e| MigrateError::io_with_path(e, path))?;
        }

        debug!("Loaded {} ledger entries from {}", ledger.entries.len(), path.display());
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// A previous (or this) run finished `source` in `phase`.
    pub fn is_completed(&self, phase: Phase, source: &Path) -> bool {
        self.completed.contains(&(phase, source.to_path_buf()))
    }

    /// Where the file the server knows as `server_path` lives on disk.
    pub fn destination_for(&self, server_path: &str) -> Option<&Path> {
        self.destinations
            .get(&normalize_separators(server_path))
            .map(PathBuf::as_path)
    }

    /// Where `source` ended up after the latest successful step.
    pub fn target_of(&self, source: &Path) -> Option<&Path> {
        self.targets.get(source).map(PathBuf::as_path)
    }

    /// Append and sync one record.
    pub fn record(&mut self, entry: LedgerEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.sync_all())
            .map_err(|e| MigrateError::io_with_path(e, &self.path))?;
        self.index(entry);
        Ok(())
    }

    fn index(&mut self, entry: LedgerEntry) {
        if entry.outcome.is_success() {
            self.completed.insert((entry.phase, entry.source.clone()));
            self.destinations
                .insert(normalize_separators(&entry.server_path), entry.target.clone());
            self.targets.insert(entry.source.clone(), entry.target.clone());
        }
        self.entries.push(entry);
    }
}
