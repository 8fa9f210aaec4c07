//! Notification email lane: outbox drain, rendering, SMTP transport.

pub mod mailer;
pub mod render;
pub mod worker;

pub use mailer::{Mailer, SendOutcome, SmtpMailer};
pub use worker::{email_backoff, EmailWorker};
