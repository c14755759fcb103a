// src/scheduler.rs
//! # Scheduler
//! Owns job execution: decides which sources are due, runs their
//! fetch → compare → classify → commit/alert cycle without overlap, and
//! reschedules. All per-source failures are contained in that source's
//! execution unit; nothing here stops the tick loop.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::classify::{SignificanceClassifier, Verdict};
use crate::fetch::Fetcher;
use crate::notify::{ChangeEvent, NotifierMux};
use crate::registry::{JobRegistry, Lifecycle, MonitoredSource, RegistryError};
use crate::store::{BaselineStore, Snapshot};

#[derive(Debug, Clone)]
pub struct SchedulerCfg {
    /// Cap on simultaneous fetches across all sources.
    pub max_concurrent_fetches: usize,
    /// Per-fetch bound; crossing it ends the cycle with verdict `Error`.
    pub fetch_timeout: Duration,
    /// Consecutive `Error` verdicts before status reports the source degraded.
    /// The source keeps being scheduled either way.
    pub degraded_after_errors: u32,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            fetch_timeout: Duration::from_secs(30),
            degraded_after_errors: 3,
        }
    }
}

/// Run-state surface for UI/CLI reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub label: String,
    pub lifecycle: Lifecycle,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub last_verdict: Verdict,
    pub consecutive_errors: u32,
    pub degraded: bool,
    pub in_flight: bool,
}

/// Result of a manual `trigger_now` request.
pub enum Triggered {
    Started(JoinHandle<()>),
    /// An execution for this source is already in flight.
    Busy,
    /// Paused or deleted sources are not runnable.
    NotActive,
}

pub struct Scheduler {
    registry: Arc<dyn JobRegistry>,
    store: Arc<BaselineStore>,
    fetcher: Arc<dyn Fetcher>,
    classifier: Arc<SignificanceClassifier>,
    dispatcher: Arc<NotifierMux>,
    cfg: SchedulerCfg,
    /// Per-source mutual exclusion: claimed before an execution unit is
    /// spawned, released when it fully completes.
    in_flight: Mutex<HashSet<String>>,
    consecutive_errors: Mutex<HashMap<String, u32>>,
    fetch_permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        store: Arc<BaselineStore>,
        fetcher: Arc<dyn Fetcher>,
        classifier: Arc<SignificanceClassifier>,
        dispatcher: Arc<NotifierMux>,
        cfg: SchedulerCfg,
    ) -> Self {
        let fetch_permits = Arc::new(Semaphore::new(cfg.max_concurrent_fetches));
        Self {
            registry,
            store,
            fetcher,
            classifier,
            dispatcher,
            cfg,
            in_flight: Mutex::new(HashSet::new()),
            consecutive_errors: Mutex::new(HashMap::new()),
            fetch_permits,
        }
    }

    /// Poll loop: tick on a fixed cadence until the task is dropped.
    pub async fn run(self: Arc<Self>, tick_interval: Duration) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    /// Select all Active sources with `next_run_at <= now` that have no
    /// execution in flight and launch one execution unit each. Returns the
    /// spawned handles so tests can await completion; the run loop drops
    /// them (units are independent).
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let due = match self.registry.list_active().await {
            Ok(sources) => sources,
            Err(e) => {
                // Re-read next tick; a registry hiccup never kills the loop.
                tracing::warn!("listing active sources failed: {e}");
                return Vec::new();
            }
        };

        let mut handles = Vec::new();
        for source in due {
            if source.next_run_at > now {
                continue;
            }
            if !self.claim(&source.id) {
                tracing::debug!(source = %source.id, "skipping tick, execution in flight");
                continue;
            }
            let me = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                me.run_cycle(source).await;
            }));
        }
        handles
    }

    /// Force an out-of-schedule execution, subject to the same in-flight
    /// guard as scheduled runs.
    pub async fn trigger_now(self: &Arc<Self>, id: &str) -> Result<Triggered, RegistryError> {
        let source = self.registry.get(id).await?;
        if source.lifecycle != Lifecycle::Active {
            return Ok(Triggered::NotActive);
        }
        if !self.claim(&source.id) {
            return Ok(Triggered::Busy);
        }
        let me = Arc::clone(self);
        Ok(Triggered::Started(tokio::spawn(async move {
            me.run_cycle(source).await;
        })))
    }

    pub async fn status(&self, id: &str) -> Result<SourceStatus, RegistryError> {
        let source = self.registry.get(id).await?;
        let consecutive_errors = {
            let map = self.consecutive_errors.lock().expect("error map poisoned");
            map.get(id).copied().unwrap_or(0)
        };
        let in_flight = {
            let set = self.in_flight.lock().expect("in-flight set poisoned");
            set.contains(id)
        };
        Ok(SourceStatus {
            id: source.id,
            label: source.label,
            lifecycle: source.lifecycle,
            last_run_at: source.last_run_at,
            next_run_at: source.next_run_at,
            last_verdict: source.last_verdict,
            consecutive_errors,
            degraded: consecutive_errors >= self.cfg.degraded_after_errors,
            in_flight,
        })
    }

    /// Mark a source deleted and drop its baseline state. Any in-flight
    /// execution finishes but its result is discarded.
    pub async fn delete_source(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.set_lifecycle(id, Lifecycle::Deleted).await?;
        self.store.remove(id);
        self.consecutive_errors
            .lock()
            .expect("error map poisoned")
            .remove(id);
        Ok(())
    }

    fn claim(&self, id: &str) -> bool {
        let mut set = self.in_flight.lock().expect("in-flight set poisoned");
        set.insert(id.to_string())
    }

    fn release(&self, id: &str) {
        let mut set = self.in_flight.lock().expect("in-flight set poisoned");
        set.remove(id);
    }

    /// One execution unit: a short-lived sequential pipeline for one source.
    /// The in-flight flag is already claimed by the caller.
    async fn run_cycle(self: Arc<Self>, source: MonitoredSource) {
        metrics::counter!("cycles_total").increment(1);

        let end = self.execute(&source).await;
        // Lifecycle changes taking effect mid-flight discard the whole
        // result, run-state update included.
        let verdict = match end {
            CycleEnd::Applied(v) if self.still_active(&source.id).await => Some(v),
            _ => None,
        };

        match verdict {
            Some(verdict) => {
                self.note_verdict(&source.id, verdict);

                let completed_at = Utc::now();
                let next_run_at = source.schedule.next_after(completed_at);
                if let Err(e) = self
                    .registry
                    .update_run_state(&source.id, completed_at, next_run_at, verdict)
                    .await
                {
                    // The registry is re-read every tick, so this heals itself.
                    tracing::warn!(source = %source.id, "run state update failed: {e}");
                }
            }
            None => {
                tracing::info!(source = %source.id, "cycle result discarded (source no longer active)");
                metrics::counter!("cycles_discarded_total").increment(1);
            }
        }

        self.release(&source.id);
    }

    async fn execute(&self, source: &MonitoredSource) -> CycleEnd {
        // Bounded parallelism across all fetches. The semaphore is never
        // closed, so acquire only fails on shutdown.
        let Ok(permit) = self.fetch_permits.acquire().await else {
            return CycleEnd::Discarded;
        };

        let fetched = match tokio::time::timeout(
            self.cfg.fetch_timeout,
            self.fetcher.fetch(&source.url),
        )
        .await
        {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                tracing::warn!(source = %source.id, url = %source.url, "fetch failed: {e}");
                metrics::counter!("fetch_errors_total").increment(1);
                return CycleEnd::Applied(Verdict::Error);
            }
            Err(_) => {
                tracing::warn!(source = %source.id, timeout = ?self.cfg.fetch_timeout, "fetch timed out");
                metrics::counter!("fetch_errors_total").increment(1);
                return CycleEnd::Applied(Verdict::Error);
            }
        };

        // Only the network phase counts against the fetch-parallelism cap.
        drop(permit);

        let candidate = Snapshot::capture(fetched.content, fetched.fetched_at);

        let Some(baseline) = self.store.baseline(&source.id) else {
            // First successful fetch seeds the baseline. Never Significant:
            // there is nothing to compare against.
            if !self.still_active(&source.id).await {
                return CycleEnd::Discarded;
            }
            if let Err(e) = self.store.commit(&source.id, candidate) {
                tracing::warn!(source = %source.id, "seeding baseline failed: {e:#}");
                return CycleEnd::Applied(Verdict::Error);
            }
            tracing::info!(source = %source.id, "baseline seeded");
            return CycleEnd::Applied(Verdict::Unchanged);
        };

        let classification = match self.classifier.classify(&baseline, &candidate).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(source = %source.id, "classification failed: {e}");
                metrics::counter!("classify_errors_total").increment(1);
                return CycleEnd::Applied(Verdict::Error);
            }
        };
        metrics::counter!("verdicts_total", "verdict" => verdict_label(classification.verdict))
            .increment(1);

        if classification.verdict != Verdict::Significant {
            // Trivial/Unchanged never mutate the baseline.
            return CycleEnd::Applied(classification.verdict);
        }

        // Lifecycle may have changed while we were fetching; a deleted or
        // paused source gets no commit and no alert.
        if !self.still_active(&source.id).await {
            return CycleEnd::Discarded;
        }

        let event = ChangeEvent {
            source_id: source.id.clone(),
            source_label: source.label.clone(),
            url: source.url.clone(),
            baseline_fingerprint: baseline.fingerprint.clone(),
            new_fingerprint: candidate.fingerprint.clone(),
            verdict: Verdict::Significant,
            diff: classification.diff.clone(),
            ts: candidate.captured_at,
        };

        if let Err(e) = self.store.commit(&source.id, candidate) {
            tracing::warn!(source = %source.id, "baseline commit failed: {e:#}");
            return CycleEnd::Applied(Verdict::Error);
        }

        let attempted = self.dispatcher.dispatch(&event).await;
        tracing::info!(
            source = %source.id,
            divergence = classification.divergence,
            added = event.diff.added_spans,
            removed = event.diff.removed_spans,
            dispatched = attempted,
            "significant change committed"
        );

        CycleEnd::Applied(Verdict::Significant)
    }

    async fn still_active(&self, id: &str) -> bool {
        match self.registry.get(id).await {
            Ok(src) => src.lifecycle == Lifecycle::Active,
            // A vanished record means deleted and purged.
            Err(RegistryError::NotFound(_)) => false,
            Err(e) => {
                tracing::warn!(source = %id, "lifecycle re-check failed, keeping result: {e}");
                true
            }
        }
    }

    fn note_verdict(&self, id: &str, verdict: Verdict) {
        let mut map = self.consecutive_errors.lock().expect("error map poisoned");
        if verdict == Verdict::Error {
            let count = map.entry(id.to_string()).or_insert(0);
            *count += 1;
            if *count >= self.cfg.degraded_after_errors {
                tracing::warn!(source = %id, consecutive_errors = *count, "source degraded");
            }
        } else {
            map.remove(id);
        }
    }
}

enum CycleEnd {
    /// Cycle completed; verdict feeds run state and error tracking.
    Applied(Verdict),
    /// Source was paused or deleted mid-flight; nothing is recorded.
    Discarded,
}

fn verdict_label(v: Verdict) -> &'static str {
    match v {
        Verdict::Unchanged => "unchanged",
        Verdict::Trivial => "trivial",
        Verdict::Significant => "significant",
        Verdict::Error => "error",
        Verdict::Unknown => "unknown",
    }
}
