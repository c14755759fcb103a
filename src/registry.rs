// src/registry.rs
//! Job registry boundary: source identity, lifecycle, and schedule fields.
//! The scheduler consumes `JobRegistry` to enumerate active jobs and reports
//! run outcomes back through it. Lifecycle writes are single-writer per
//! source (the `RwLock` in the provided implementation serializes them).

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::classify::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Active,
    Paused,
    Deleted,
}

/// Monitoring cadence: a fixed interval or a daily wall-clock slot
/// (the `daily@HH:MM` expression form).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    Every { secs: u64 },
    Daily { hour: u32, minute: u32 },
}

impl Schedule {
    /// Parse `"90s"`, `"15m"`, `"2h"`, or `"daily@09:00"`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("daily@") {
            let (h, m) = rest
                .split_once(':')
                .ok_or_else(|| anyhow!("daily schedule needs HH:MM, got {rest:?}"))?;
            let hour: u32 = h.parse()?;
            let minute: u32 = m.parse()?;
            if hour > 23 || minute > 59 {
                return Err(anyhow!("daily schedule out of range: {rest}"));
            }
            return Ok(Schedule::Daily { hour, minute });
        }
        let unit = s.chars().next_back().ok_or_else(|| anyhow!("empty schedule"))?;
        let num = &s[..s.len() - unit.len_utf8()];
        let n: u64 = num.parse().map_err(|_| anyhow!("bad schedule: {s:?}"))?;
        let secs = match unit {
            's' => n,
            'm' => n * 60,
            'h' => n * 3600,
            _ => return Err(anyhow!("bad schedule unit in {s:?} (want s/m/h)")),
        };
        if secs == 0 {
            return Err(anyhow!("schedule interval must be positive"));
        }
        Ok(Schedule::Every { secs })
    }

    pub fn next_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Schedule::Every { secs } => from + ChronoDuration::seconds(secs as i64),
            Schedule::Daily { hour, minute } => {
                let today = from.date_naive().and_hms_opt(hour, minute, 0).unwrap_or_else(|| {
                    from.date_naive().and_hms_opt(0, 0, 0).expect("midnight exists")
                });
                let mut next = Utc.from_utc_datetime(&today);
                if next <= from {
                    next += ChronoDuration::days(1);
                }
                next
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredSource {
    pub id: String,
    pub url: String,
    pub label: String,
    pub schedule: Schedule,
    pub lifecycle: Lifecycle,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_verdict: Verdict,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("registry storage error: {0}")]
    Storage(String),
}

/// CRUD-level collaborator the scheduler drives. Mockable for tests.
#[async_trait::async_trait]
pub trait JobRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<MonitoredSource>, RegistryError>;
    async fn list_active(&self) -> Result<Vec<MonitoredSource>, RegistryError>;
    async fn get(&self, id: &str) -> Result<MonitoredSource, RegistryError>;
    async fn create(
        &self,
        url: String,
        label: String,
        schedule: Schedule,
    ) -> Result<MonitoredSource, RegistryError>;
    async fn update_run_state(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        verdict: Verdict,
    ) -> Result<(), RegistryError>;
    async fn set_lifecycle(&self, id: &str, lifecycle: Lifecycle) -> Result<(), RegistryError>;
}

/// In-memory registry with optional JSON durability under the state dir.
/// Sufficient for a single-node core; swap the trait impl for a database
/// without touching the scheduler.
pub struct InMemoryRegistry {
    inner: RwLock<HashMap<String, MonitoredSource>>,
    persist_path: Option<PathBuf>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            persist_path: None,
        }
    }

    /// Load persisted sources from `<dir>/sources.json` if present and keep
    /// the file updated on every mutation.
    pub fn with_persistence(dir: impl Into<PathBuf>) -> Result<Self> {
        let path = dir.into().join("sources.json");
        let mut map = HashMap::new();
        if path.exists() {
            let s = std::fs::read_to_string(&path)?;
            let sources: Vec<MonitoredSource> = serde_json::from_str(&s)?;
            for src in sources {
                map.insert(src.id.clone(), src);
            }
        }
        Ok(Self {
            inner: RwLock::new(map),
            persist_path: Some(path),
        })
    }

    fn persist(&self, map: &HashMap<String, MonitoredSource>) -> Result<(), RegistryError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let mut sources: Vec<&MonitoredSource> = map.values().collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        let bytes = serde_json::to_vec_pretty(&sources)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| RegistryError::Storage(e.to_string()))
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_id(url: &str, at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(at.timestamp_micros().to_le_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write;
        let _ = write!(hex, "{b:02x}");
    }
    format!("src-{hex}")
}

#[async_trait::async_trait]
impl JobRegistry for InMemoryRegistry {
    async fn list(&self) -> Result<Vec<MonitoredSource>, RegistryError> {
        let map = self.inner.read().expect("registry lock poisoned");
        let mut v: Vec<MonitoredSource> = map
            .values()
            .filter(|s| s.lifecycle != Lifecycle::Deleted)
            .cloned()
            .collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(v)
    }

    async fn list_active(&self) -> Result<Vec<MonitoredSource>, RegistryError> {
        let map = self.inner.read().expect("registry lock poisoned");
        Ok(map
            .values()
            .filter(|s| s.lifecycle == Lifecycle::Active)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<MonitoredSource, RegistryError> {
        let map = self.inner.read().expect("registry lock poisoned");
        map.get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn create(
        &self,
        url: String,
        label: String,
        schedule: Schedule,
    ) -> Result<MonitoredSource, RegistryError> {
        let now = Utc::now();
        let source = MonitoredSource {
            id: generate_id(&url, now),
            url,
            label,
            schedule,
            lifecycle: Lifecycle::Active,
            // First run happens at the next tick.
            next_run_at: now,
            last_run_at: None,
            last_verdict: Verdict::Unknown,
        };
        let mut map = self.inner.write().expect("registry lock poisoned");
        map.insert(source.id.clone(), source.clone());
        self.persist(&map)?;
        Ok(source)
    }

    async fn update_run_state(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        verdict: Verdict,
    ) -> Result<(), RegistryError> {
        let mut map = self.inner.write().expect("registry lock poisoned");
        let src = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        src.last_run_at = Some(last_run_at);
        src.next_run_at = next_run_at;
        src.last_verdict = verdict;
        self.persist(&map)
    }

    async fn set_lifecycle(&self, id: &str, lifecycle: Lifecycle) -> Result<(), RegistryError> {
        let mut map = self.inner.write().expect("registry lock poisoned");
        let src = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        src.lifecycle = lifecycle;
        if lifecycle == Lifecycle::Active {
            // Resume runs at the next tick rather than waiting out the
            // remainder of the old slot.
            src.next_run_at = Utc::now();
        }
        self.persist(&map)
    }
}
