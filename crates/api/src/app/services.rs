//! Infrastructure wiring: storage backends, mail transport, manager, worker.

use std::sync::Arc;

use anyhow::Context;

use mailforge_dispatch::{BatchManager, DispatchWorker, WorkerConfig, WorkerHandle};
use mailforge_mail::{ConsoleMailer, MailTransport, SmtpConfig, SmtpMailer};
use mailforge_queue::{DispatchQueue, InMemoryQueue};
use mailforge_registry::{BatchRegistry, InMemoryRegistry};
use mailforge_state::{InMemoryStateStore, StateStore};

use crate::config::{Config, MailBackend};

/// Shared service graph handed to handlers through `Extension`.
///
/// Everything behind trait objects so the memory and persistent wirings
/// produce the same type.
pub struct AppServices {
    pub registry: Arc<dyn BatchRegistry>,
    pub state: Arc<dyn StateStore>,
    pub queue: Arc<dyn DispatchQueue>,
    pub mailer: Arc<dyn MailTransport>,
    pub manager: BatchManager,
}

type Stores = (
    Arc<dyn BatchRegistry>,
    Arc<dyn StateStore>,
    Arc<dyn DispatchQueue>,
);

pub async fn build_services(config: &Config) -> anyhow::Result<AppServices> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            let stores = build_persistent_stores(config).await?;
            return assemble(config, stores);
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
            return assemble(config, build_in_memory_stores());
        }
    }

    assemble(config, build_in_memory_stores())
}

fn assemble(config: &Config, (registry, state, queue): Stores) -> anyhow::Result<AppServices> {
    let mailer = build_mailer(config)?;
    let manager = BatchManager::new(registry.clone(), state.clone(), queue.clone());

    Ok(AppServices {
        registry,
        state,
        queue,
        mailer,
        manager,
    })
}

/// Spawn the single dispatch worker over the wired services.
pub fn spawn_worker(services: &AppServices, config: &Config) -> WorkerHandle {
    DispatchWorker::new(
        services.registry.clone(),
        services.state.clone(),
        services.queue.clone(),
        services.mailer.clone(),
        WorkerConfig {
            poll_interval: config.worker_poll,
            pause_recheck: config.pause_recheck,
            ..WorkerConfig::default()
        },
    )
    .spawn()
}

fn build_in_memory_stores() -> Stores {
    tracing::info!("using in-memory registry, state store, and queue");
    (
        Arc::new(InMemoryRegistry::new()),
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryQueue::new()),
    )
}

#[cfg(feature = "redis")]
async fn build_persistent_stores(config: &Config) -> anyhow::Result<Stores> {
    use mailforge_queue::RedisQueue;
    use mailforge_registry::PostgresRegistry;
    use mailforge_state::RedisStateStore;

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let registry = PostgresRegistry::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    registry
        .migrate()
        .await
        .context("failed to run registry migrations")?;

    let state = RedisStateStore::connect(&config.redis_url)
        .await
        .context("failed to connect to Redis (state store)")?;

    let queue = RedisQueue::connect(&config.redis_url)
        .await
        .context("failed to connect to Redis (queue)")?;
    // Jobs a crashed worker left in-flight go back to the front of the
    // waiting list before anything new is claimed.
    let reclaimed = queue
        .reclaim_active()
        .await
        .context("failed to reclaim in-flight jobs")?;
    if reclaimed > 0 {
        tracing::info!(reclaimed, "requeued jobs left in-flight by a previous run");
    }

    Ok((Arc::new(registry), Arc::new(state), Arc::new(queue)))
}

fn build_mailer(config: &Config) -> anyhow::Result<Arc<dyn MailTransport>> {
    match config.mail_backend {
        MailBackend::Smtp => {
            let smtp = config
                .smtp
                .as_ref()
                .context("SMTP settings must be present when MAIL_TRANSPORT=smtp")?;
            let mailer = SmtpMailer::new(SmtpConfig {
                relay: smtp.relay.clone(),
                username: smtp.username.clone(),
                password: smtp.password.clone(),
                from: smtp.from.clone(),
            })
            .context("failed to build SMTP transport")?;
            Ok(Arc::new(mailer))
        }
        MailBackend::Console => {
            tracing::info!("using console mail transport");
            Ok(Arc::new(ConsoleMailer::new()))
        }
    }
}
