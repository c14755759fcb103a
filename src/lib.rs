// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod classify;
pub mod config;
pub mod fetch;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::classify::{
    Classification, DiffSummary, JudgeVerdict, SemanticJudge, SignificanceClassifier, Verdict,
};
pub use crate::config::MonitorConfig;
pub use crate::fetch::{FetchError, FetchedContent, Fetcher, HttpFetcher};
pub use crate::notify::{ChangeEvent, Notifier, NotifierMux};
pub use crate::registry::{InMemoryRegistry, JobRegistry, Lifecycle, MonitoredSource, Schedule};
pub use crate::scheduler::{Scheduler, SchedulerCfg, SourceStatus, Triggered};
pub use crate::store::{BaselineStore, Snapshot};
