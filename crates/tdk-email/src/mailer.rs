//! SMTP transport boundary.
//!
//! The trait exists so the worker and the scenario suite can run against an
//! in-process recorder; `SmtpMailer` is the production implementation.
//! Outcomes carry the transient/permanent classification the retry table
//! needs — SMTP 4xx and connection failures retry, 5xx rejections do not.

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

/// Result of one delivery attempt.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent,
    Transient(String),
    Permanent(String),
}

#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> SendOutcome;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        from_address: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| anyhow::anyhow!("smtp relay setup failed: {e}"))?
            .port(port)
            .timeout(Some(timeout));

        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        let from: Mailbox = from_address
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid from address {from_address}: {e}"))?;

        Ok(SmtpMailer {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait::async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> SendOutcome {
        let to: Mailbox = match to.parse() {
            Ok(mb) => mb,
            // A stored address that cannot parse will never send.
            Err(e) => return SendOutcome::Permanent(format!("invalid recipient: {e}")),
        };

        let message = match Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body_html.to_string())
        {
            Ok(m) => m,
            Err(e) => return SendOutcome::Permanent(format!("message build failed: {e}")),
        };

        match self.transport.send(message).await {
            Ok(_) => SendOutcome::Sent,
            Err(e) if e.is_permanent() => SendOutcome::Permanent(e.to_string()),
            // Connection failures, timeouts, and 4xx responses all retry.
            Err(e) => SendOutcome::Transient(e.to_string()),
        }
    }
}
