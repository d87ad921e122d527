//! Development transport that logs instead of sending.

use crate::transport::{MailError, MailTransport, OutgoingEmail};
use std::time::Duration;
use tracing::info;

/// Logs each message and succeeds. An optional artificial latency makes the
/// worker's pacing visible when developing against real-looking timings.
#[derive(Debug, Clone, Default)]
pub struct ConsoleMailer {
    latency: Option<Duration>,
}

impl ConsoleMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
        }
    }
}

#[async_trait::async_trait]
impl MailTransport for ConsoleMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        info!(
            to = %email.to,
            subject = %email.subject,
            body_len = email.body.len(),
            "console transport delivered email"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn console_send_always_succeeds() {
        let mailer = ConsoleMailer::new();
        let email = OutgoingEmail::new(
            "user@example.com".parse().unwrap(),
            "Hello",
            "A short message body.",
        );
        assert!(mailer.send(&email).await.is_ok());
    }
}
