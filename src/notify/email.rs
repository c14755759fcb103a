// src/notify/email.rs
use anyhow::{Context, Result};
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::{render_event, ChangeEvent, DispatchError, Notifier};

pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailNotifier {
    /// `Ok(None)` when SMTP_HOST is unset (channel disabled); `Err` when the
    /// channel is half-configured.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(host) = std::env::var("SMTP_HOST") else {
            return Ok(None);
        };
        let user = std::env::var("SMTP_USER").context("SMTP_USER missing")?;
        let pass = std::env::var("SMTP_PASS").context("SMTP_PASS missing")?;
        let from_addr = std::env::var("ALERT_EMAIL_FROM").context("ALERT_EMAIL_FROM missing")?;
        let to_addr = std::env::var("ALERT_EMAIL_TO").context("ALERT_EMAIL_TO missing")?;

        let creds = Credentials::new(user, pass);
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .context("invalid SMTP_HOST")?
            .credentials(creds)
            .build();

        let from = from_addr.parse().context("invalid ALERT_EMAIL_FROM")?;
        let to = to_addr.parse().context("invalid ALERT_EMAIL_TO")?;

        Ok(Some(Self { mailer, from, to }))
    }
}

#[async_trait::async_trait]
impl Notifier for EmailNotifier {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn send(&self, ev: &ChangeEvent) -> Result<(), DispatchError> {
        let subject = format!(
            "SiteWatch: change detected on {} (+{}/-{})",
            ev.source_label, ev.diff.added_spans, ev.diff.removed_spans
        );

        let msg = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(render_event(ev))
            .map_err(|e| DispatchError::Delivery {
                channel: "email",
                reason: format!("build email: {e}"),
            })?;

        self.mailer
            .send(msg)
            .await
            .map_err(|e| DispatchError::Delivery {
                channel: "email",
                reason: format!("smtp send: {e}"),
            })?;
        Ok(())
    }
}
