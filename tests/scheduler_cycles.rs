// tests/scheduler_cycles.rs
//
// End-to-end fetch-compare-classify-commit cycles against fake collaborators:
// baseline seeding, verdict progression, alert dispatch, error tracking, and
// discard semantics for lifecycle changes mid-flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;

use sitewatch::classify::{SignificanceClassifier, Verdict};
use sitewatch::fetch::{FetchError, FetchedContent, Fetcher};
use sitewatch::notify::{ChangeEvent, DispatchError, Notifier, NotifierMux};
use sitewatch::registry::{InMemoryRegistry, JobRegistry, Lifecycle, Schedule};
use sitewatch::scheduler::{Scheduler, SchedulerCfg};
use sitewatch::store::BaselineStore;

// --- content fixtures -----------------------------------------------------
//
// 20 equal-length tokens so the structural-digest short-circuit stays out of
// the way and divergence is pure token overlap.

fn base_content() -> String {
    (0..20).map(|i| format!("word{i:02}x")).collect::<Vec<_>>().join(" ")
}

/// 2 of 20 tokens replaced: divergence 1 - 18/22 ≈ 0.18, under the 0.3
/// trivial threshold. Models a date or counter churn.
fn trivial_variant() -> String {
    let mut tokens: Vec<String> = (0..18).map(|i| format!("word{i:02}x")).collect();
    tokens.push("fresh01".into());
    tokens.push("fresh02".into());
    tokens.join(" ")
}

/// 18 of 20 tokens replaced: divergence 1 - 2/38 ≈ 0.95, far above the 0.5
/// significant threshold. Models a wholly rewritten page.
fn significant_variant() -> String {
    let mut tokens: Vec<String> = vec!["word00x".into(), "word01x".into()];
    tokens.extend((0..18).map(|i| format!("brandnew{i:02}")));
    tokens.join(" ")
}

// --- fake collaborators ---------------------------------------------------

enum Step {
    Ok(String),
    Fail,
}

/// Returns scripted responses in order; repeats the last step when exhausted.
struct ScriptedFetcher {
    steps: Vec<Step>,
    cursor: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, _url: &str) -> Result<FetchedContent, FetchError> {
        let i = self.cursor.fetch_add(1, Ordering::SeqCst).min(self.steps.len() - 1);
        match &self.steps[i] {
            Step::Ok(content) => Ok(FetchedContent {
                content: content.clone(),
                fetched_at: Utc::now(),
            }),
            Step::Fail => Err(FetchError::Network("connection refused".into())),
        }
    }
}

#[derive(Default)]
struct CapturingNotifier {
    events: Mutex<Vec<ChangeEvent>>,
}

/// Orphan-rule-safe wrapper: `Notifier` and `Arc` are both foreign here.
struct SharedCapture(Arc<CapturingNotifier>);

#[async_trait::async_trait]
impl Notifier for SharedCapture {
    fn channel(&self) -> &'static str {
        "capture"
    }
    async fn send(&self, ev: &ChangeEvent) -> Result<(), DispatchError> {
        self.0.events.lock().unwrap().push(ev.clone());
        Ok(())
    }
}

struct Harness {
    sched: Arc<Scheduler>,
    registry: Arc<InMemoryRegistry>,
    store: Arc<BaselineStore>,
    alerts: Arc<CapturingNotifier>,
    _tmp: tempfile::TempDir,
}

fn harness(fetcher: Arc<dyn Fetcher>, degraded_after: u32) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let registry = Arc::new(InMemoryRegistry::new());
    let store = Arc::new(BaselineStore::open(tmp.path(), 5).unwrap());
    let alerts = Arc::new(CapturingNotifier::default());
    let sched = Arc::new(Scheduler::new(
        registry.clone(),
        store.clone(),
        fetcher,
        Arc::new(SignificanceClassifier::new(0.3, 0.5)),
        Arc::new(NotifierMux::new(vec![Box::new(SharedCapture(alerts.clone()))], 0)),
        SchedulerCfg {
            max_concurrent_fetches: 4,
            fetch_timeout: Duration::from_secs(60),
            degraded_after_errors: degraded_after,
        },
    ));
    Harness {
        sched,
        registry,
        store,
        alerts,
        _tmp: tmp,
    }
}

async fn run_due(h: &Harness, at: chrono::DateTime<Utc>) {
    for handle in h.sched.tick(at).await {
        handle.await.unwrap();
    }
}

// --- tests ----------------------------------------------------------------

#[tokio::test]
async fn first_fetch_seeds_baseline_without_alert() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![Step::Ok(base_content())]));
    let h = harness(fetcher, 3);
    let src = h
        .registry
        .create("https://example.org".into(), "E".into(), Schedule::Every { secs: 60 })
        .await
        .unwrap();

    run_due(&h, Utc::now()).await;

    assert_eq!(h.store.baseline(&src.id).unwrap().content, base_content());
    let status = h.sched.status(&src.id).await.unwrap();
    assert_eq!(status.last_verdict, Verdict::Unchanged);
    assert!(status.last_run_at.is_some());
    assert!(h.alerts.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unchanged_cycle_advances_schedule_by_interval() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        Step::Ok(base_content()),
        Step::Ok(base_content()),
    ]));
    let h = harness(fetcher, 3);
    let src = h
        .registry
        .create("https://example.org".into(), "E".into(), Schedule::Every { secs: 60 })
        .await
        .unwrap();

    run_due(&h, Utc::now()).await;
    // Past the 60s interval the source is due again; identical content
    // stays Unchanged.
    run_due(&h, Utc::now() + chrono::Duration::seconds(61)).await;

    let status = h.sched.status(&src.id).await.unwrap();
    assert_eq!(status.last_verdict, Verdict::Unchanged);
    let gap = status.next_run_at - status.last_run_at.unwrap();
    assert_eq!(gap.num_seconds(), 60);
    assert!(h.alerts.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn trivial_then_significant_progression() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        Step::Ok(base_content()),
        Step::Ok(trivial_variant()),
        Step::Ok(significant_variant()),
    ]));
    let h = harness(fetcher, 3);
    let src = h
        .registry
        .create("https://example.org".into(), "E".into(), Schedule::Every { secs: 60 })
        .await
        .unwrap();

    run_due(&h, Utc::now()).await;

    // High token overlap: Trivial, baseline untouched, no alert.
    run_due(&h, Utc::now() + chrono::Duration::seconds(61)).await;
    assert_eq!(h.sched.status(&src.id).await.unwrap().last_verdict, Verdict::Trivial);
    assert_eq!(h.store.baseline(&src.id).unwrap().content, base_content());
    assert!(h.alerts.events.lock().unwrap().is_empty());

    // Low token overlap: Significant, baseline replaced, exactly one dispatch
    // carrying the diff excerpt.
    run_due(&h, Utc::now() + chrono::Duration::seconds(122)).await;
    assert_eq!(
        h.sched.status(&src.id).await.unwrap().last_verdict,
        Verdict::Significant
    );
    assert_eq!(h.store.baseline(&src.id).unwrap().content, significant_variant());

    let events = h.alerts.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source_id, src.id);
    assert!(events[0].diff.excerpt.contains("brandnew"));
    // The superseded baseline is retained in history.
    assert_eq!(h.store.history(&src.id).len(), 1);
}

#[tokio::test]
async fn fetch_failures_track_consecutive_errors_and_recover() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        Step::Fail,
        Step::Fail,
        Step::Ok(base_content()),
    ]));
    let h = harness(fetcher, 2);
    let src = h
        .registry
        .create("https://example.org".into(), "E".into(), Schedule::Every { secs: 60 })
        .await
        .unwrap();

    run_due(&h, Utc::now()).await;
    let status = h.sched.status(&src.id).await.unwrap();
    assert_eq!(status.last_verdict, Verdict::Error);
    assert_eq!(status.consecutive_errors, 1);
    assert!(!status.degraded);
    // Schedule still advances; no retry storm.
    assert!(status.next_run_at > Utc::now());

    run_due(&h, Utc::now() + chrono::Duration::seconds(61)).await;
    let status = h.sched.status(&src.id).await.unwrap();
    assert_eq!(status.consecutive_errors, 2);
    assert!(status.degraded);

    // A successful cycle clears the counter.
    run_due(&h, Utc::now() + chrono::Duration::seconds(122)).await;
    let status = h.sched.status(&src.id).await.unwrap();
    assert_eq!(status.last_verdict, Verdict::Unchanged);
    assert_eq!(status.consecutive_errors, 0);
    assert!(!status.degraded);
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_times_out_to_error_verdict() {
    struct SleepyFetcher;

    #[async_trait::async_trait]
    impl Fetcher for SleepyFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedContent, FetchError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(FetchedContent {
                content: "late".into(),
                fetched_at: Utc::now(),
            })
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let registry = Arc::new(InMemoryRegistry::new());
    let store = Arc::new(BaselineStore::open(tmp.path(), 5).unwrap());
    let sched = Arc::new(Scheduler::new(
        registry.clone(),
        store.clone(),
        Arc::new(SleepyFetcher),
        Arc::new(SignificanceClassifier::new(0.3, 0.5)),
        Arc::new(NotifierMux::new(vec![], 0)),
        SchedulerCfg {
            max_concurrent_fetches: 4,
            fetch_timeout: Duration::from_millis(100),
            degraded_after_errors: 3,
        },
    ));
    let src = registry
        .create("https://example.org".into(), "E".into(), Schedule::Every { secs: 60 })
        .await
        .unwrap();

    for handle in sched.tick(Utc::now()).await {
        handle.await.unwrap();
    }
    let status = sched.status(&src.id).await.unwrap();
    assert_eq!(status.last_verdict, Verdict::Error);
    assert!(store.baseline(&src.id).is_none());
}

#[tokio::test]
async fn empty_fetch_is_error_and_keeps_baseline() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        Step::Ok(base_content()),
        Step::Ok(String::new()),
    ]));
    let h = harness(fetcher, 3);
    let src = h
        .registry
        .create("https://example.org".into(), "E".into(), Schedule::Every { secs: 60 })
        .await
        .unwrap();

    run_due(&h, Utc::now()).await;
    run_due(&h, Utc::now() + chrono::Duration::seconds(61)).await;

    let status = h.sched.status(&src.id).await.unwrap();
    assert_eq!(status.last_verdict, Verdict::Error);
    assert_eq!(h.store.baseline(&src.id).unwrap().content, base_content());
}

/// Seeds a baseline, then blocks the second fetch until the test releases it.
struct SeedThenBlockFetcher {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl SeedThenBlockFetcher {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for SeedThenBlockFetcher {
    async fn fetch(&self, _url: &str) -> Result<FetchedContent, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let content = if call == 0 {
            base_content()
        } else {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            significant_variant()
        };
        Ok(FetchedContent {
            content,
            fetched_at: Utc::now(),
        })
    }
}

#[tokio::test]
async fn delete_during_flight_discards_commit_and_alert() {
    let fetcher = Arc::new(SeedThenBlockFetcher::new());
    let h = harness(fetcher.clone(), 3);
    let src = h
        .registry
        .create("https://example.org".into(), "E".into(), Schedule::Every { secs: 60 })
        .await
        .unwrap();

    run_due(&h, Utc::now()).await;
    assert!(h.store.baseline(&src.id).is_some());

    // Second cycle blocks in fetch; delete while it is in flight.
    let handles = h.sched.tick(Utc::now() + chrono::Duration::seconds(61)).await;
    assert_eq!(handles.len(), 1);
    h.sched.delete_source(&src.id).await.unwrap();

    fetcher.gate.add_permits(1);
    for handle in handles {
        handle.await.unwrap(); // completes without error
    }

    // Result discarded: no baseline resurrection, no alert, no further runs.
    assert!(h.store.baseline(&src.id).is_none());
    assert!(h.alerts.events.lock().unwrap().is_empty());
    assert_eq!(h.registry.get(&src.id).await.unwrap().lifecycle, Lifecycle::Deleted);
    assert!(h.sched.tick(Utc::now() + chrono::Duration::seconds(3600)).await.is_empty());
}

#[tokio::test]
async fn pause_during_flight_discards_result_but_keeps_baseline() {
    let fetcher = Arc::new(SeedThenBlockFetcher::new());
    let h = harness(fetcher.clone(), 3);
    let src = h
        .registry
        .create("https://example.org".into(), "E".into(), Schedule::Every { secs: 60 })
        .await
        .unwrap();

    run_due(&h, Utc::now()).await;

    let handles = h.sched.tick(Utc::now() + chrono::Duration::seconds(61)).await;
    assert_eq!(handles.len(), 1);
    h.registry.set_lifecycle(&src.id, Lifecycle::Paused).await.unwrap();

    fetcher.gate.add_permits(1);
    for handle in handles {
        handle.await.unwrap();
    }

    // The significant result was discarded; the old baseline stands.
    assert_eq!(h.store.baseline(&src.id).unwrap().content, base_content());
    assert!(h.alerts.events.lock().unwrap().is_empty());
    // Paused sources are not scheduled.
    assert!(h.sched.tick(Utc::now() + chrono::Duration::seconds(3600)).await.is_empty());
}
