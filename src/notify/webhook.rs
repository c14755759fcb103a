// src/notify/webhook.rs
use reqwest::Client;
use std::time::Duration;

use super::{render_event, ChangeEvent, DispatchError, Notifier};

/// Generic JSON webhook (Slack-style `{"text": ...}` payload). Single
/// attempt with a short timeout; the mux owns the no-retry policy.
pub struct WebhookNotifier {
    url: String,
    client: Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var("ALERT_WEBHOOK_URL").ok().map(Self::new)
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, ev: &ChangeEvent) -> Result<(), DispatchError> {
        let text = format!(
            "*SiteWatch:* significant change on *{}*\n{}",
            ev.source_label,
            render_event(ev)
        );
        let body = serde_json::json!({ "text": text, "event": ev });

        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Delivery {
                channel: "webhook",
                reason: format!("post: {e}"),
            })?
            .error_for_status()
            .map_err(|e| DispatchError::Delivery {
                channel: "webhook",
                reason: format!("non-2xx: {e}"),
            })?;
        Ok(())
    }
}
