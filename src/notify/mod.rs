//! SMTP escalation for alerts and lifecycle events.
//!
//! Email is strictly best-effort: a failed send is logged and never fails
//! the cycle. The `notified` flag on a persisted alert is only set after a
//! send succeeds.

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use crate::anomaly::Alert;
use crate::config::SmtpConfig;

/// Async SMTP mailer over STARTTLS.
#[derive(Clone)]
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl Mailer {
    /// Build a mailer from config. Returns `None` when escalation is
    /// disabled or not configured; the monitor runs fine without it.
    pub fn from_config(cfg: &SmtpConfig) -> anyhow::Result<Option<Self>> {
        if !cfg.enabled {
            info!("email escalation disabled");
            return Ok(None);
        }
        if cfg.host.is_empty() || cfg.from.is_empty() || cfg.to.is_empty() {
            warn!("smtp enabled but host/from/to incomplete, escalation off");
            return Ok(None);
        }

        let from: Mailbox = cfg
            .from
            .parse()
            .map_err(|e| anyhow::anyhow!("bad smtp from address {:?}: {e}", cfg.from))?;
        let mut to = Vec::with_capacity(cfg.to.len());
        for addr in &cfg.to {
            to.push(
                addr.parse()
                    .map_err(|e| anyhow::anyhow!("bad smtp to address {addr:?}: {e}"))?,
            );
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)?
            .port(cfg.port);
        if !cfg.username.is_empty() {
            builder = builder
                .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()));
        }

        info!(host = %cfg.host, port = cfg.port, recipients = to.len(), "smtp escalation ready");
        Ok(Some(Self {
            transport: builder.build(),
            from,
            to,
        }))
    }

    /// Email a single alert to every configured recipient.
    pub async fn send_alert(&self, alert: &Alert) -> anyhow::Result<()> {
        let subject = format!("[chainsentry] {}: {}", alert.severity, alert.kind);
        let details = serde_json::to_string_pretty(&alert.details)
            .unwrap_or_else(|_| alert.details.to_string());
        let body = format!(
            "<h3>{}</h3>\
             <p><b>Severity:</b> {}</p>\
             <p><b>Raised:</b> {}</p>\
             <p>{}</p>\
             <pre>{}</pre>",
            escape(&alert.kind.to_string()),
            escape(&alert.severity.to_string()),
            alert.raised_at.to_rfc3339(),
            escape(&alert.message),
            escape(&details),
        );
        self.send(&subject, &body).await
    }

    /// Plain notice for lifecycle events (startup, shutdown, crash, stale).
    pub async fn send_notice(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        let subject = format!("[chainsentry] {subject}");
        let html = format!("<p>{}</p><p>{}</p>", escape(body), chrono::Utc::now().to_rfc3339());
        self.send(&subject, &html).await
    }

    async fn send(&self, subject: &str, html: &str) -> anyhow::Result<()> {
        for recipient in &self.to {
            let message = Message::builder()
                .from(self.from.clone())
                .to(recipient.clone())
                .subject(subject)
                .header(ContentType::TEXT_HTML)
                .body(html.to_string())?;
            self.transport.send(message).await?;
        }
        info!(subject = subject, recipients = self.to.len(), "email sent");
        Ok(())
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_config_yields_no_mailer() {
        let cfg = SmtpConfig {
            enabled: false,
            host: "smtp.example.com".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from: "monitor@example.com".to_string(),
            to: vec!["ops@example.com".to_string()],
        };
        assert!(Mailer::from_config(&cfg).unwrap().is_none());
    }

    #[test]
    fn test_incomplete_config_yields_no_mailer() {
        let cfg = SmtpConfig {
            enabled: true,
            host: String::new(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from: "monitor@example.com".to_string(),
            to: vec!["ops@example.com".to_string()],
        };
        assert!(Mailer::from_config(&cfg).unwrap().is_none());
    }

    #[test]
    fn test_bad_address_is_an_error() {
        let cfg = SmtpConfig {
            enabled: true,
            host: "smtp.example.com".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from: "not an address".to_string(),
            to: vec!["ops@example.com".to_string()],
        };
        assert!(Mailer::from_config(&cfg).is_err());
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
