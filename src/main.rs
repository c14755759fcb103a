//! SiteWatch — Binary Entrypoint
//! Wires the monitoring core (scheduler, baseline store, classifier,
//! notifier mux) and serves the status/control API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sitewatch::api::{self, AppState};
use sitewatch::classify::SignificanceClassifier;
use sitewatch::config::MonitorConfig;
use sitewatch::fetch::HttpFetcher;
use sitewatch::notify::NotifierMux;
use sitewatch::registry::{InMemoryRegistry, JobRegistry};
use sitewatch::scheduler::{Scheduler, SchedulerCfg};
use sitewatch::store::BaselineStore;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sitewatch=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = MonitorConfig::load_default().context("loading configuration")?;
    tracing::info!(
        tick = cfg.tick_interval_secs,
        trivial = cfg.trivial_threshold,
        significant = cfg.significant_threshold,
        "sitewatch starting"
    );

    let registry: Arc<dyn JobRegistry> = Arc::new(
        InMemoryRegistry::with_persistence(&cfg.state_dir).context("loading source registry")?,
    );
    let store = Arc::new(
        BaselineStore::open(cfg.state_dir.join("baselines"), cfg.history_retention)
            .context("opening baseline store")?,
    );
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(cfg.fetch_timeout_secs)));
    let classifier = Arc::new(SignificanceClassifier::new(
        cfg.trivial_threshold,
        cfg.significant_threshold,
    ));
    let dispatcher = Arc::new(NotifierMux::from_env(cfg.alert_cooldown_secs));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&registry),
        store,
        fetcher,
        classifier,
        dispatcher,
        SchedulerCfg {
            max_concurrent_fetches: cfg.max_concurrent_fetches,
            fetch_timeout: Duration::from_secs(cfg.fetch_timeout_secs),
            degraded_after_errors: cfg.degraded_after_errors,
        },
    ));

    tokio::spawn(
        Arc::clone(&scheduler).run(Duration::from_secs(cfg.tick_interval_secs)),
    );

    let router = api::create_router(AppState { scheduler, registry });
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    tracing::info!(addr = %cfg.listen_addr, "api listening");
    axum::serve(listener, router).await.context("serving api")?;
    Ok(())
}
