// src/store.rs
//! Baseline store: one accepted snapshot per source plus a bounded history of
//! superseded snapshots, durable as one JSON file per source.
//!
//! Correctness depends only on the current baseline; history is diagnostic.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Cheap per-snapshot structure summary used to short-circuit comparison
/// before any diffing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralDigest {
    pub paragraphs: usize,
    pub tokens: usize,
}

impl StructuralDigest {
    pub fn of(content: &str) -> Self {
        Self {
            paragraphs: content.lines().filter(|l| !l.trim().is_empty()).count(),
            tokens: content.split_whitespace().count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    pub content: String,
    pub fingerprint: String,
    pub digest: StructuralDigest,
}

impl Snapshot {
    pub fn capture(content: String, captured_at: DateTime<Utc>) -> Self {
        let fingerprint = fingerprint(&content);
        let digest = StructuralDigest::of(&content);
        Self {
            captured_at,
            content,
            fingerprint,
            digest,
        }
    }
}

/// Stable hash of normalized content. Content is expected to already be
/// cleaned (see `fetch::clean_content`); fingerprinting only folds case-
/// preserving whitespace runs so cosmetic reflows do not count as change.
pub fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    for token in content.split_whitespace() {
        hasher.update(token.as_bytes());
        hasher.update(b" ");
    }
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceRecord {
    baseline: Snapshot,
    #[serde(default)]
    history: VecDeque<Snapshot>,
}

pub struct BaselineStore {
    dir: PathBuf,
    retention: usize,
    inner: Mutex<HashMap<String, SourceRecord>>,
}

impl BaselineStore {
    /// Open (or create) a store rooted at `dir`, loading any records already
    /// on disk.
    pub fn open(dir: impl Into<PathBuf>, retention: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating state dir {}", dir.display()))?;

        let mut map = HashMap::new();
        for entry in std::fs::read_dir(&dir).context("listing state dir")? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match read_record(&path) {
                Ok(rec) => {
                    map.insert(stem.to_string(), rec);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable baseline: {e:#}");
                }
            }
        }

        Ok(Self {
            dir,
            retention,
            inner: Mutex::new(map),
        })
    }

    /// Current accepted snapshot, or `None` for a source never ingested.
    pub fn baseline(&self, source_id: &str) -> Option<Snapshot> {
        let map = self.inner.lock().expect("store mutex poisoned");
        map.get(source_id).map(|r| r.baseline.clone())
    }

    /// Atomically replace the baseline, demoting the prior one into bounded
    /// history. Either the new baseline is fully visible or the old one
    /// remains; a failed disk write leaves the in-memory state untouched.
    pub fn commit(&self, source_id: &str, new: Snapshot) -> Result<()> {
        let mut map = self.inner.lock().expect("store mutex poisoned");
        let record = match map.get(source_id) {
            Some(old) => {
                let mut history = old.history.clone();
                history.push_back(old.baseline.clone());
                while history.len() > self.retention {
                    history.pop_front();
                }
                SourceRecord {
                    baseline: new,
                    history,
                }
            }
            None => SourceRecord {
                baseline: new,
                history: VecDeque::new(),
            },
        };
        write_record(&self.dir, source_id, &record)?;
        map.insert(source_id.to_string(), record);
        Ok(())
    }

    /// Superseded snapshots, oldest first. Diagnostic only.
    pub fn history(&self, source_id: &str) -> Vec<Snapshot> {
        let map = self.inner.lock().expect("store mutex poisoned");
        map.get(source_id)
            .map(|r| r.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all state for a deleted source.
    pub fn remove(&self, source_id: &str) {
        let mut map = self.inner.lock().expect("store mutex poisoned");
        map.remove(source_id);
        let path = record_path(&self.dir, source_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), "removing baseline file: {e}");
            }
        }
    }
}

fn record_path(dir: &Path, source_id: &str) -> PathBuf {
    // Source ids are generated by the registry and filename-safe; anything
    // else is sanitized rather than rejected.
    let safe: String = source_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{safe}.json"))
}

fn read_record(path: &Path) -> Result<SourceRecord> {
    let s = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&s)?)
}

fn write_record(dir: &Path, source_id: &str, record: &SourceRecord) -> Result<()> {
    let path = record_path(dir, source_id);
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(record).context("serializing baseline record")?;
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}
