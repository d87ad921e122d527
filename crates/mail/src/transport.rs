//! Outbound mail abstraction.

use mailforge_core::email::EmailAddress;
use thiserror::Error;

/// One rendered message, ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: EmailAddress,
    pub subject: String,
    pub body: String,
}

impl OutgoingEmail {
    pub fn new(to: EmailAddress, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to,
            subject: subject.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    /// The relay rejected or dropped the message. Retriable.
    #[error("mail transport error: {0}")]
    Transport(String),

    /// The message itself could not be built. Not retriable.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("mail configuration error: {0}")]
    Config(String),
}

impl MailError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn invalid_message(err: impl std::fmt::Display) -> Self {
        Self::InvalidMessage(err.to_string())
    }

    pub fn config(err: impl std::fmt::Display) -> Self {
        Self::Config(err.to_string())
    }
}

/// Delivers a single email. Implementations must be safe to call from the
/// dispatch worker loop; rate pacing lives in the worker, not here.
#[async_trait::async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError>;
}
