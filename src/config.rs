// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const ENV_PATH: &str = "SITEWATCH_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/sitewatch.toml";

/// Runtime configuration for the monitoring core.
///
/// Loaded from TOML with env overrides for the knobs operators commonly tune.
/// All thresholds are *divergence* in [0, 1]: 0.0 means identical content,
/// 1.0 means no token overlap at all.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Scheduler poll cadence in seconds.
    pub tick_interval_secs: u64,
    /// Cap on simultaneous fetches across all sources.
    pub max_concurrent_fetches: usize,
    /// Per-fetch timeout; a slower fetch ends the cycle with verdict Error.
    pub fetch_timeout_secs: u64,
    /// Time bound for the optional semantic judge in the ambiguous band.
    pub judge_timeout_secs: u64,
    /// Divergence at or below this is Trivial.
    pub trivial_threshold: f64,
    /// Divergence at or above this is Significant. Must be >= trivial_threshold.
    pub significant_threshold: f64,
    /// How many superseded snapshots to keep per source.
    pub history_retention: usize,
    /// Consecutive Error verdicts before a source surfaces as degraded.
    pub degraded_after_errors: u32,
    /// Minimum seconds between alerts for one source (0 disables the gate).
    pub alert_cooldown_secs: i64,
    /// Directory for baselines and registry state.
    pub state_dir: PathBuf,
    /// Bind address for the status/control API.
    pub listen_addr: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            max_concurrent_fetches: 8,
            fetch_timeout_secs: 30,
            judge_timeout_secs: 20,
            trivial_threshold: 0.15,
            significant_threshold: 0.5,
            history_retention: 20,
            degraded_after_errors: 3,
            alert_cooldown_secs: 0,
            state_dir: PathBuf::from("state"),
            listen_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let cfg: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load using env var + fallback:
    /// 1) $SITEWATCH_CONFIG_PATH (must exist if set)
    /// 2) config/sitewatch.toml if present
    /// 3) built-in defaults
    ///
    /// `SITEWATCH_TRIVIAL_THRESHOLD` / `SITEWATCH_SIGNIFICANT_THRESHOLD` env
    /// vars override the file values afterwards.
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("SITEWATCH_CONFIG_PATH points to non-existent path"));
            }
            Self::from_path(&pb)?
        } else {
            let default = PathBuf::from(DEFAULT_PATH);
            if default.exists() {
                Self::from_path(&default)?
            } else {
                Self::default()
            }
        };

        if let Some(v) = env_f64("SITEWATCH_TRIVIAL_THRESHOLD") {
            cfg.trivial_threshold = v;
        }
        if let Some(v) = env_f64("SITEWATCH_SIGNIFICANT_THRESHOLD") {
            cfg.significant_threshold = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("trivial_threshold", self.trivial_threshold),
            ("significant_threshold", self.significant_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(anyhow!("{name} must be within [0, 1], got {v}"));
            }
        }
        if self.significant_threshold < self.trivial_threshold {
            return Err(anyhow!(
                "significant_threshold ({}) must be >= trivial_threshold ({})",
                self.significant_threshold,
                self.trivial_threshold
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(anyhow!("max_concurrent_fetches must be at least 1"));
        }
        Ok(())
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
