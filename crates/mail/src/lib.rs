//! Mail transports: SMTP for production, console for development and a
//! recording double for tests.

pub mod console;
pub mod memory;
pub mod smtp;
pub mod transport;

pub use console::ConsoleMailer;
pub use memory::MemoryMailer;
pub use smtp::{SmtpConfig, SmtpMailer};
pub use transport::{MailError, MailTransport, OutgoingEmail};
