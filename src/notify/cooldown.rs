// src/notify/cooldown.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

/// Per-source cooldown gate to prevent alert storms.
/// - First alert for a source always passes.
/// - Inside the cooldown window, alerts for that source are suppressed.
/// - State is updated explicitly via `record_alert` after an attempt.
#[derive(Debug, Clone, Default)]
pub struct CooldownGate {
    cooldown: ChronoDuration,
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl CooldownGate {
    /// `cooldown_secs` <= 0 disables the gate.
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown: ChronoDuration::seconds(cooldown_secs.max(0)),
            last_alert: HashMap::new(),
        }
    }

    /// Check if we may alert for `source_id` at `now`. Does NOT mutate state.
    pub fn should_alert(&self, source_id: &str, now: DateTime<Utc>) -> bool {
        match self.last_alert.get(source_id) {
            None => true,
            Some(ts) => now.signed_duration_since(*ts) >= self.cooldown,
        }
    }

    pub fn record_alert(&mut self, source_id: &str, now: DateTime<Utc>) {
        self.last_alert.insert(source_id.to_string(), now);
    }
}
