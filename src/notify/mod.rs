// src/notify/mod.rs
//! Alert dispatch boundary. The scheduler hands a `ChangeEvent` to the
//! `NotifierMux`; delivery failure is logged and never fails the cycle, and
//! the core makes at most one dispatch attempt per event.

pub mod cooldown;
pub mod email;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

use crate::classify::{DiffSummary, Verdict};
use cooldown::CooldownGate;

/// Immutable record of one detected change, produced once per fetch cycle
/// that ends in `Significant`. Carries the diff summary so no notifier has
/// to re-derive it.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub source_id: String,
    pub source_label: String,
    pub url: String,
    pub baseline_fingerprint: String,
    pub new_fingerprint: String,
    pub verdict: Verdict,
    pub diff: DiffSummary,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("delivery failed via {channel}: {reason}")]
    Delivery { channel: &'static str, reason: String },
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;
    async fn send(&self, ev: &ChangeEvent) -> Result<(), DispatchError>;
}

/// Fan-out to all configured channels, gated by the per-source cooldown.
pub struct NotifierMux {
    notifiers: Vec<Box<dyn Notifier>>,
    gate: Mutex<CooldownGate>,
}

impl NotifierMux {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>, cooldown_secs: i64) -> Self {
        Self {
            notifiers,
            gate: Mutex::new(CooldownGate::new(cooldown_secs)),
        }
    }

    /// Build from environment: email when SMTP vars are set, webhook when
    /// `ALERT_WEBHOOK_URL` is set. No channels configured is valid (alerts
    /// are then log-only).
    pub fn from_env(cooldown_secs: i64) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
        match email::EmailNotifier::from_env() {
            Ok(Some(n)) => notifiers.push(Box::new(n)),
            Ok(None) => tracing::debug!("email alerts disabled (SMTP env not set)"),
            Err(e) => tracing::warn!("email alerts misconfigured, disabling: {e:#}"),
        }
        if let Some(n) = webhook::WebhookNotifier::from_env() {
            notifiers.push(Box::new(n));
        }
        Self::new(notifiers, cooldown_secs)
    }

    /// One delivery attempt per configured channel. Returns whether a
    /// delivery attempt was made (false when suppressed by the cooldown).
    pub async fn dispatch(&self, ev: &ChangeEvent) -> bool {
        {
            let mut gate = self.gate.lock().expect("cooldown gate poisoned");
            if !gate.should_alert(&ev.source_id, ev.ts) {
                tracing::debug!(source = %ev.source_id, "alert suppressed by cooldown");
                metrics::counter!("alerts_suppressed_total").increment(1);
                return false;
            }
            gate.record_alert(&ev.source_id, ev.ts);
        }

        if self.notifiers.is_empty() {
            tracing::info!(
                source = %ev.source_id,
                added = ev.diff.added_spans,
                removed = ev.diff.removed_spans,
                "significant change (no alert channels configured)"
            );
            return true;
        }

        for n in &self.notifiers {
            match n.send(ev).await {
                Ok(()) => {
                    metrics::counter!("alerts_sent_total", "channel" => n.channel()).increment(1);
                }
                Err(e) => {
                    // Logged, not retried; the monitoring cycle proceeds.
                    metrics::counter!("alerts_failed_total", "channel" => n.channel()).increment(1);
                    tracing::warn!(source = %ev.source_id, "alert delivery failed: {e}");
                }
            }
        }
        true
    }
}

/// Shared plain-text rendering used by the email and webhook channels.
pub(crate) fn render_event(ev: &ChangeEvent) -> String {
    format!(
        "Source: {} ({})\nURL: {}\nChange: +{} / -{} spans\nExcerpt: {}\nDetected: {}\n",
        ev.source_label,
        ev.source_id,
        ev.url,
        ev.diff.added_spans,
        ev.diff.removed_spans,
        ev.diff.excerpt,
        ev.ts.to_rfc3339(),
    )
}
