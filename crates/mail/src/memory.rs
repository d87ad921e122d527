//! Recording transport for tests.

use crate::transport::{MailError, MailTransport, OutgoingEmail};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    sent: Vec<OutgoingEmail>,
    // Address -> remaining number of sends that should fail.
    failures: HashMap<String, u32>,
}

/// Captures every send and can be scripted to fail specific recipients a
/// given number of times, which is how retry behaviour gets exercised.
#[derive(Default)]
pub struct MemoryMailer {
    inner: Mutex<Inner>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` sends to `address` fail with a transport error.
    pub fn fail_times(&self, address: &str, times: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.insert(address.to_string(), times);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.inner.lock().unwrap().sent.len()
    }
}

#[async_trait::async_trait]
impl MailTransport for MemoryMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(remaining) = inner.failures.get_mut(email.to.as_str()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MailError::transport("simulated delivery failure"));
            }
        }
        inner.sent.push(email.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(to: &str) -> OutgoingEmail {
        OutgoingEmail::new(to.parse().unwrap(), "Subject", "Body text goes here.")
    }

    #[tokio::test]
    async fn records_successful_sends_in_order() {
        let mailer = MemoryMailer::new();
        mailer.send(&email("a@example.com")).await.unwrap();
        mailer.send(&email("b@example.com")).await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].to.as_str(), "a@example.com");
        assert_eq!(sent[1].to.as_str(), "b@example.com");
    }

    #[tokio::test]
    async fn scripted_failures_run_out_then_send_succeeds() {
        let mailer = MemoryMailer::new();
        mailer.fail_times("a@example.com", 2);

        assert!(mailer.send(&email("a@example.com")).await.is_err());
        assert!(mailer.send(&email("a@example.com")).await.is_err());
        assert!(mailer.send(&email("a@example.com")).await.is_ok());
        assert_eq!(mailer.sent_count(), 1);
    }
}
