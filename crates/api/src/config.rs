//! Environment-driven configuration for the service binary.
//!
//! Everything comes from plain environment variables. Missing values fall
//! back to development defaults and are logged loudly; values that would
//! make the process silently misbehave (an SMTP transport without
//! credentials, persistence without a database) fail startup instead.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set when {1}")]
    Missing(&'static str, &'static str),

    #[error("{0} is invalid: {1}")]
    Invalid(&'static str, String),
}

/// Which transport the worker delivers through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailBackend {
    /// Log-only transport for dev and tests.
    Console,
    /// Real SMTP relay over STARTTLS.
    Smtp,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub relay: String,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub jwt_secret: String,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub use_persistent_stores: bool,
    pub mail_backend: MailBackend,
    pub smtp: Option<SmtpSettings>,
    pub worker_poll: Duration,
    pub pause_recheck: Duration,
    pub rate_limit_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
            tracing::warn!("JWT_SECRET not set; using insecure dev default");
            "dev-secret".to_string()
        });

        let use_persistent_stores = env_bool("USE_PERSISTENT_STORES", false);
        let database_url = std::env::var("DATABASE_URL").ok();
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing(
                "DATABASE_URL",
                "USE_PERSISTENT_STORES=true",
            ));
        }
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        let mail_backend = match std::env::var("MAIL_TRANSPORT").as_deref() {
            Ok("smtp") => MailBackend::Smtp,
            Ok("console") | Err(_) => MailBackend::Console,
            Ok(other) => {
                return Err(ConfigError::Invalid(
                    "MAIL_TRANSPORT",
                    format!("expected console or smtp, got {other}"),
                ));
            }
        };

        let smtp = match mail_backend {
            MailBackend::Smtp => {
                let relay = require_env("SMTP_RELAY")?;
                let username = require_env("SMTP_USERNAME")?;
                let password = require_env("SMTP_PASSWORD")?;
                // Most relays expect the authenticated account as sender.
                let from = std::env::var("SMTP_FROM").unwrap_or_else(|_| username.clone());
                Some(SmtpSettings {
                    relay,
                    username,
                    password,
                    from,
                })
            }
            MailBackend::Console => None,
        };

        let worker_poll = Duration::from_millis(env_u64("WORKER_POLL_MS", 250)?);
        let pause_recheck = Duration::from_millis(env_u64("PAUSE_RECHECK_MS", 2_000)?);
        let rate_limit_enabled = env_bool("RATE_LIMIT_ENABLED", false);

        Ok(Self {
            bind_addr,
            jwt_secret,
            database_url,
            redis_url,
            use_persistent_stores,
            mail_backend,
            smtp,
            worker_poll,
            pause_recheck,
            rate_limit_enabled,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name, "MAIL_TRANSPORT=smtp"))
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<bool>()
        .unwrap_or(default)
}

fn env_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|e| ConfigError::Invalid(name, e.to_string())),
        Err(_) => Ok(default),
    }
}
