//! Enumeration of the lock files in a lock directory

use super::record::{PersistentRecord, RECORD_EXTENSION};
use crate::error::Result;
use glob::Pattern;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A lock file found on disk
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockEntry {
    /// Record name, i.e. the file stem
    pub name: String,
    pub path: PathBuf,
}

/// The directory shared by every lock of every run
#[derive(Debug, Clone)]
pub struct LockDirectory {
    root: PathBuf,
}

impl LockDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_exists(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Every lock file in the directory, sorted by name
    pub fn list(&self) -> Result<Vec<LockEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if let Some(lock_entry) = Self::entry_for(path) {
                entries.push(lock_entry);
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Lock files whose name ends with `_<case_name>`, sorted by name
    pub fn list_for_case(&self, case_name: &str) -> Result<Vec<LockEntry>> {
        let pattern = format!(
            "{}/*_{}.{RECORD_EXTENSION}",
            Pattern::escape(&self.root.to_string_lossy()),
            Pattern::escape(case_name)
        );

        let mut entries = Vec::new();
        for path in glob::glob(&pattern)? {
            match path {
                Ok(path) => {
                    if let Some(entry) = Self::entry_for(path) {
                        entries.push(entry);
                    }
                }
                Err(e) => warn!("Skipping unreadable lock path: {}", e),
            }
        }
        entries.sort();
        debug!(case = case_name, count = entries.len(), "Listed locks for case");
        Ok(entries)
    }

    /// Open the record behind `entry`
    pub fn open(&self, entry: &LockEntry, autosave: bool) -> Result<PersistentRecord> {
        PersistentRecord::open(&self.root, &entry.name, autosave)
    }

    /// One more than the highest `exec_id` recorded in any readable lock, or
    /// 0 when no lock records one.
    pub fn next_exec_id(&self) -> Result<u64> {
        let mut highest: Option<u64> = None;

        for entry in self.list()? {
            let record = match self.open(&entry, false) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Ignoring unreadable lock {} while computing exec id: {}", entry.name, e);
                    continue;
                }
            };

            if let Some(id) = record.get("exec_id").and_then(|v| v.as_u64()) {
                highest = Some(highest.map_or(id, |h| h.max(id)));
            }
        }

        Ok(highest.map_or(0, |h| h + 1))
    }

    fn entry_for(path: PathBuf) -> Option<LockEntry> {
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
            return None;
        }
        let name = path.file_stem()?.to_str()?.to_string();
        Some(LockEntry { name, path })
    }
}
