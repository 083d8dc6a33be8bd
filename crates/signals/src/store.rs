use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use common::{PublicSignal, Signal};
use serde::{Deserialize, Serialize};

/// `PublicSignal` carries no `user_id` (it's a UI-stable contract that
/// doesn't name an owner inline); the public v1 file wraps each one with
/// its owner so `list`'s per-user filter and admin cross-user reads both
/// work off the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicSignalRecord {
    pub user_id: String,
    #[serde(flatten)]
    pub signal: PublicSignal,
}

/// Two append-only JSONL files (legacy v1 `Signal`, public v1
/// `PublicSignalRecord`). Append is fsync-append rather than
/// write-temp-and-rename: spec.md §4.11 allows either as long as it's
/// crash-safe, and fsync-append avoids an O(n) rewrite per signal on an
/// append-only, ever-growing file.
pub struct SignalsStore {
    legacy_path: PathBuf,
    public_path: PathBuf,
    lock: Mutex<()>,
}

impl SignalsStore {
    pub fn new(legacy_path: impl Into<PathBuf>, public_path: impl Into<PathBuf>) -> Self {
        SignalsStore { legacy_path: legacy_path.into(), public_path: public_path.into(), lock: Mutex::new(()) }
    }

    pub fn append(&self, signal: &Signal, public_record: &PublicSignalRecord) -> io::Result<()> {
        let legacy_line = serde_json::to_string(signal)?;
        let public_line = serde_json::to_string(public_record)?;

        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        append_line(&self.legacy_path, &legacy_line)?;
        append_line(&self.public_path, &public_line)?;
        Ok(())
    }

    /// Newest-first, up to `limit`. `user_id` filters to that owner unless
    /// `None` (admin cross-user read); `symbol` further restricts to one
    /// market, matching spec.md's `GET /api/signals?limit&symbol`.
    pub fn list(&self, user_id: Option<&str>, symbol: Option<&str>, limit: usize) -> Vec<PublicSignalRecord> {
        let records = read_jsonl::<PublicSignalRecord>(&self.public_path);
        records
            .into_iter()
            .rev()
            .filter(|r| user_id.is_none_or(|uid| r.user_id == uid))
            .filter(|r| symbol.is_none_or(|sym| r.signal.symbol.eq_ignore_ascii_case(sym)))
            .take(limit)
            .collect()
    }

    /// Reverse scan for the first `public.signal.signal_id == id` match.
    pub fn get_by_id(&self, signal_id: &str) -> Option<PublicSignalRecord> {
        let records = read_jsonl::<PublicSignalRecord>(&self.public_path);
        records.into_iter().rev().find(|r| r.signal.signal_id == signal_id)
    }

    pub fn legacy_path(&self) -> &Path {
        &self.legacy_path
    }

    pub fn public_path(&self) -> &Path {
        &self.public_path
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    file.flush()?;
    file.sync_data()
}

/// Tolerant of blank lines and malformed JSON — a torn write from a crash
/// mid-append must not make the rest of the file unreadable.
fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Vec<T> {
    let Ok(file) = fs::File::open(path) else {
        return Vec::new();
    };
    let reader = io::BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { continue };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(record) => out.push(record),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "skipping malformed signals line");
            }
        }
    }
    out
}
