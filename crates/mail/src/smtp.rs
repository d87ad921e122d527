//! SMTP delivery via lettre.

use crate::transport::{MailError, MailTransport, OutgoingEmail};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::instrument;

/// Connection settings for an authenticated STARTTLS relay.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Relay hostname, e.g. `smtp.gmail.com`.
    pub relay: String,
    pub username: String,
    pub password: String,
    /// Sender shown on outgoing mail, e.g. `Mailforge <no-reply@example.com>`.
    pub from: String,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Result<Self, MailError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| MailError::config(format!("invalid from address: {e}")))?;
        let credentials = Credentials::new(config.username, config.password);
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.relay)
            .map_err(MailError::config)?
            .credentials(credentials)
            .build();
        Ok(Self { transport, from })
    }

    fn build_message(&self, email: &OutgoingEmail) -> Result<Message, MailError> {
        let to: Mailbox = email
            .to
            .as_str()
            .parse()
            .map_err(|e| MailError::invalid_message(format!("recipient: {e}")))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&email.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())
            .map_err(MailError::invalid_message)
    }
}

#[async_trait::async_trait]
impl MailTransport for SmtpMailer {
    #[instrument(skip(self, email), fields(to = %email.to), err)]
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        let message = self.build_message(email)?;
        self.transport
            .send(message)
            .await
            .map_err(MailError::transport)?;
        Ok(())
    }
}
