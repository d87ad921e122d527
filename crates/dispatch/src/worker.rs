//! The single queue consumer.
//!
//! One worker task claims jobs, checks the batch's runtime state, sends,
//! paces, and does the window bookkeeping. All counting keys off the
//! recipient row actually being removed, so redeliveries are counted once
//! no matter how often they are sent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mailforge_mail::{MailTransport, OutgoingEmail};
use mailforge_queue::{DispatchJob, DispatchQueue, QueuedJob};
use mailforge_registry::{BatchRegistry, BatchStatus, UploadStatus};
use mailforge_state::StateStore;

use crate::error::{DispatchError, DispatchResult};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Re-check delay for jobs claimed while their batch is paused.
    pub pause_recheck: Duration,
    /// Window accounting and pause semantics assume exactly one consumer;
    /// any other value is clamped to 1 with a warning.
    pub concurrency: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            pause_recheck: Duration::from_secs(2),
            concurrency: 1,
        }
    }
}

/// Owns the spawned worker task; dropping it leaves the task running.
pub struct WorkerHandle {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for the in-flight job (including its pacing
    /// delay) to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

pub struct DispatchWorker {
    registry: Arc<dyn BatchRegistry>,
    state: Arc<dyn StateStore>,
    queue: Arc<dyn DispatchQueue>,
    mailer: Arc<dyn MailTransport>,
    config: WorkerConfig,
}

impl DispatchWorker {
    pub fn new(
        registry: Arc<dyn BatchRegistry>,
        state: Arc<dyn StateStore>,
        queue: Arc<dyn DispatchQueue>,
        mailer: Arc<dyn MailTransport>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            state,
            queue,
            mailer,
            config,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let shutdown = Arc::new(Notify::new());
        let notify = shutdown.clone();
        let handle = tokio::spawn(async move { self.run(notify).await });
        WorkerHandle { shutdown, handle }
    }

    async fn run(self, shutdown: Arc<Notify>) {
        if self.config.concurrency != 1 {
            warn!(
                requested = self.config.concurrency,
                "dispatch requires a single consumer; clamping concurrency to 1"
            );
        }
        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "dispatch worker started"
        );
        loop {
            // Shutdown is only honoured between jobs; a claimed job always
            // runs to completion, pacing delay included.
            let claimed = tokio::select! {
                _ = shutdown.notified() => break,
                claimed = self.queue.claim_next() => claimed,
            };
            match claimed {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "queue claim failed");
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        info!("dispatch worker stopped");
    }

    /// Claim and handle at most one job. Returns whether one was claimed.
    pub async fn step(&self) -> DispatchResult<bool> {
        match self.queue.claim_next().await? {
            Some(job) => {
                self.process(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, job: QueuedJob) {
        if let Err(e) = self.try_process(&job).await {
            error!(job = %job.id, error = %e, "job processing error");
            if let Err(settle) = self.queue.fail(&job, &e.to_string()).await {
                error!(job = %job.id, error = %settle, "could not settle job after error");
            }
        }
    }

    async fn try_process(&self, job: &QueuedJob) -> DispatchResult<()> {
        let payload = &job.payload;

        let state = match self.state.get(payload.batch_id).await {
            Ok(state) => state,
            Err(e) => {
                // The state store being unreachable is not the job's fault;
                // park it and try again later.
                warn!(job = %job.id, error = %e, "state store unavailable; releasing job");
                return self
                    .queue
                    .release(job, self.config.pause_recheck)
                    .await
                    .map_err(Into::into);
            }
        };

        let Some(state) = state else {
            return self.handle_missing_state(job).await;
        };

        if state.epoch != payload.epoch {
            debug!(
                job = %job.id,
                batch = %payload.batch_key,
                job_epoch = payload.epoch,
                state_epoch = state.epoch,
                "stale generation; discarding job"
            );
            return self.queue.complete(job).await.map_err(Into::into);
        }

        if state.paused {
            debug!(job = %job.id, batch = %payload.batch_key, "batch paused; re-delaying job");
            return self
                .queue
                .release(job, self.config.pause_recheck)
                .await
                .map_err(Into::into);
        }

        let email = OutgoingEmail::new(
            payload.email.clone(),
            payload.subject.clone(),
            payload.body.clone(),
        );
        if let Err(e) = self.mailer.send(&email).await {
            // Failures never touch counters or the recipient row; the
            // queue's retry policy decides what happens to the job.
            let err = DispatchError::transport(e);
            warn!(job = %job.id, to = %payload.email, error = %err, "delivery failed");
            return self.queue.fail(job, &err.to_string()).await.map_err(Into::into);
        }

        if state.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(state.delay_ms)).await;
        }

        let removed = self.registry.delete_record(payload.record_id).await?;
        if removed {
            let total = self.state.incr_total(payload.batch_id).await?;
            let window = self.state.incr_window(payload.batch_id).await?;
            self.after_count(payload, total, window, state.window_size)
                .await?;
        } else {
            debug!(
                job = %job.id,
                record = %payload.record_id,
                "recipient row already consumed; redelivery not counted"
            );
        }

        self.queue.complete(job).await?;
        Ok(())
    }

    /// No runtime state for the job's batch. A purged or completed batch is
    /// normal teardown debris; a live batch without state is an error.
    async fn handle_missing_state(&self, job: &QueuedJob) -> DispatchResult<()> {
        let payload = &job.payload;
        match self.registry.batch(payload.batch_id).await? {
            None => {
                debug!(job = %job.id, batch = %payload.batch_key, "batch gone; discarding job");
                self.queue.complete(job).await.map_err(Into::into)
            }
            Some(batch) if batch.status.is_terminal() => {
                debug!(
                    job = %job.id,
                    batch = %payload.batch_key,
                    status = batch.status.as_str(),
                    "batch finished; discarding leftover job"
                );
                self.queue.complete(job).await.map_err(Into::into)
            }
            Some(_) => {
                let err = DispatchError::state_inconsistency(format!(
                    "batch {} is live but has no runtime state",
                    payload.batch_key
                ));
                error!(job = %job.id, batch = %payload.batch_key, "{err}");
                self.queue
                    .fail(job, &err.to_string())
                    .await
                    .map_err(Into::into)
            }
        }
    }

    /// Bookkeeping after a counted success. Completion wins over the window
    /// boundary so a final recipient that also fills the window completes
    /// the batch instead of pausing it.
    async fn after_count(
        &self,
        payload: &DispatchJob,
        total: u64,
        window: u64,
        window_size: u32,
    ) -> DispatchResult<()> {
        let remaining = self.registry.count_pending(payload.upload_id).await?;
        if remaining == 0 {
            self.registry.record_progress(payload.batch_id, total).await?;
            self.registry
                .set_batch_status(payload.batch_id, BatchStatus::Completed)
                .await?;
            self.registry
                .set_upload_status(payload.upload_id, UploadStatus::Completed)
                .await?;
            self.state.delete(payload.batch_id).await?;
            info!(batch = %payload.batch_key, total, "batch completed");
            return Ok(());
        }

        if window >= u64::from(window_size) {
            self.state.reset_window(payload.batch_id).await?;
            self.state.set_paused(payload.batch_id, true).await?;
            self.registry.record_progress(payload.batch_id, total).await?;
            self.registry
                .set_batch_status(payload.batch_id, BatchStatus::Paused)
                .await?;
            info!(
                batch = %payload.batch_key,
                total,
                window_size,
                "window complete; batch paused"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{BatchDraft, BatchManager, BatchSource, Schedule, StartBatch};
    use mailforge_auth::{Actor, ActorId, Role};
    use mailforge_core::email::Recipient;
    use mailforge_mail::MemoryMailer;
    use mailforge_queue::{InMemoryQueue, RetryPolicy};
    use mailforge_registry::InMemoryRegistry;
    use mailforge_state::InMemoryStateStore;
    use proptest::prelude::*;
    use std::collections::HashSet;

    struct Rig {
        registry: Arc<InMemoryRegistry>,
        state: Arc<InMemoryStateStore>,
        queue: Arc<InMemoryQueue>,
        mailer: Arc<MemoryMailer>,
        manager: BatchManager,
        worker: DispatchWorker,
    }

    fn rig_with(queue: InMemoryQueue, config: WorkerConfig) -> Rig {
        let registry = Arc::new(InMemoryRegistry::new());
        let state = Arc::new(InMemoryStateStore::new());
        let queue = Arc::new(queue);
        let mailer = Arc::new(MemoryMailer::new());
        let manager = BatchManager::new(registry.clone(), state.clone(), queue.clone());
        let worker = DispatchWorker::new(
            registry.clone(),
            state.clone(),
            queue.clone(),
            mailer.clone(),
            config,
        );
        Rig {
            registry,
            state,
            queue,
            mailer,
            manager,
            worker,
        }
    }

    fn rig() -> Rig {
        rig_with(InMemoryQueue::new(), WorkerConfig::default())
    }

    fn actor(username: &str, role: Role) -> Actor {
        Actor {
            id: ActorId::new(),
            username: username.to_string(),
            role,
        }
    }

    fn start_request(n: usize, window_size: u32) -> StartBatch {
        StartBatch {
            source: BatchSource::NewUpload {
                file_name: "contacts.csv".into(),
                recipients: (0..n)
                    .map(|i| Recipient::new(format!("user{i}@example.com").parse().unwrap()))
                    .collect(),
            },
            draft: BatchDraft {
                name: "Release notes".into(),
                subject: "What changed this week".into(),
                body: "A rundown of everything that shipped.".into(),
                delay_ms: 0,
                window_size,
                schedule: Schedule::Now,
            },
        }
    }

    async fn drain(rig: &Rig) {
        while rig.worker.step().await.unwrap() {}
    }

    #[tokio::test]
    async fn seven_recipients_window_three_runs_in_three_windows() {
        let rig = rig();
        let alice = actor("alice", Role::User);
        let snapshot = rig
            .manager
            .start_batch(&alice, start_request(7, 3))
            .await
            .unwrap();
        let key = snapshot.batch.key;
        let batch_id = snapshot.batch.id;

        // Window one.
        drain(&rig).await;
        assert_eq!(rig.mailer.sent_count(), 3);
        let batch = rig.registry.batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Paused);
        assert_eq!(batch.sent_count, 3);
        let state = rig.state.get(batch_id).await.unwrap().unwrap();
        assert!(state.paused);
        assert_eq!(state.window_count, 0, "window counter resets at the boundary");
        assert_eq!(state.total_count, 3);

        // Window two.
        rig.manager.resume_batch(&alice, key).await.unwrap();
        drain(&rig).await;
        assert_eq!(rig.mailer.sent_count(), 6);
        let batch = rig.registry.batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Paused);
        assert_eq!(batch.sent_count, 6);

        // Final partial window completes instead of pausing.
        rig.manager.resume_batch(&alice, key).await.unwrap();
        drain(&rig).await;
        assert_eq!(rig.mailer.sent_count(), 7);
        let batch = rig.registry.batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.sent_count, 7);
        assert_eq!(batch.total_emails, 7);
        let upload = rig.registry.upload(batch.upload_id).await.unwrap().unwrap();
        assert_eq!(upload.status, UploadStatus::Completed);
        assert!(rig.state.get(batch_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn window_filling_send_that_is_also_the_last_completes() {
        let rig = rig();
        let alice = actor("alice", Role::User);
        let snapshot = rig
            .manager
            .start_batch(&alice, start_request(3, 3))
            .await
            .unwrap();

        drain(&rig).await;
        let batch = rig.registry.batch(snapshot.batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.sent_count, 3);
    }

    #[tokio::test]
    async fn pause_mid_window_then_resume_sends_each_recipient_once() {
        let config = WorkerConfig {
            pause_recheck: Duration::from_millis(50),
            ..WorkerConfig::default()
        };
        let rig = rig_with(InMemoryQueue::new(), config);
        let alice = actor("alice", Role::User);
        let snapshot = rig
            .manager
            .start_batch(&alice, start_request(5, 5))
            .await
            .unwrap();
        let key = snapshot.batch.key;

        // One send, then an operator pause mid-window.
        assert!(rig.worker.step().await.unwrap());
        rig.manager.pause_batch(&alice, key).await.unwrap();

        // Remaining jobs are claimed but only released; counters freeze.
        drain(&rig).await;
        assert_eq!(rig.mailer.sent_count(), 1);
        let state = rig.state.get(snapshot.batch.id).await.unwrap().unwrap();
        assert_eq!(state.total_count, 1);

        // Resume bumps the epoch and enqueues fresh jobs for the remaining
        // four; the released stale jobs must discard, not double-send.
        rig.manager.resume_batch(&alice, key).await.unwrap();
        drain(&rig).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        drain(&rig).await;

        let sent: Vec<String> = rig
            .mailer
            .sent()
            .into_iter()
            .map(|e| e.to.as_str().to_string())
            .collect();
        assert_eq!(sent.len(), 5, "every recipient exactly once: {sent:?}");
        let unique: HashSet<&String> = sent.iter().collect();
        assert_eq!(unique.len(), 5);

        let batch = rig.registry.batch(snapshot.batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.sent_count, 5);
    }

    #[tokio::test]
    async fn jobs_for_a_purged_batch_skip_without_side_effects() {
        let rig = rig();
        let alice = actor("alice", Role::User);
        let root = actor("root", Role::Admin);
        let snapshot = rig
            .manager
            .start_batch(&alice, start_request(3, 3))
            .await
            .unwrap();

        // Steal one job so it is in flight when the purge happens.
        let in_flight = rig.queue.claim_next().await.unwrap().unwrap();
        rig.manager
            .purge_upload(&root, snapshot.batch.upload_id)
            .await
            .unwrap();

        rig.worker.process(in_flight).await;
        drain(&rig).await;

        assert_eq!(rig.mailer.sent_count(), 0);
        let counts = rig.queue.counts().await.unwrap();
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.waiting + counts.delayed + counts.active, 0);
    }

    #[tokio::test]
    async fn transport_failure_touches_nothing_and_retries() {
        let queue = InMemoryQueue::with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));
        let rig = rig_with(queue, WorkerConfig::default());
        let alice = actor("alice", Role::User);
        let snapshot = rig
            .manager
            .start_batch(&alice, start_request(2, 2))
            .await
            .unwrap();

        rig.mailer.fail_times("user0@example.com", 1);
        drain(&rig).await;

        // Both eventually sent: the failed one on its retry.
        assert_eq!(rig.mailer.sent_count(), 2);
        let batch = rig.registry.batch(snapshot.batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.sent_count, 2, "failures never count");
    }

    #[tokio::test]
    async fn exhausted_retries_keep_the_recipient_row() {
        let queue = InMemoryQueue::with_retry_policy(RetryPolicy::no_retry());
        let rig = rig_with(queue, WorkerConfig::default());
        let alice = actor("alice", Role::User);
        let snapshot = rig
            .manager
            .start_batch(&alice, start_request(2, 2))
            .await
            .unwrap();

        rig.mailer.fail_times("user0@example.com", 1);
        drain(&rig).await;

        assert_eq!(rig.mailer.sent_count(), 1);
        let counts = rig.queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        // The failed recipient's row survives for a later batch.
        assert_eq!(
            rig.registry
                .count_pending(snapshot.batch.upload_id)
                .await
                .unwrap(),
            1
        );
        let state = rig.state.get(snapshot.batch.id).await.unwrap().unwrap();
        assert_eq!(state.total_count, 1);
    }

    #[tokio::test]
    async fn redelivered_job_sends_but_never_double_counts() {
        let rig = rig();
        let alice = actor("alice", Role::User);
        let snapshot = rig
            .manager
            .start_batch(&alice, start_request(2, 2))
            .await
            .unwrap();

        // Process the first job normally.
        assert!(rig.worker.step().await.unwrap());
        assert_eq!(rig.mailer.sent_count(), 1);

        // Simulate an at-least-once redelivery of the job just processed.
        let state = rig.state.get(snapshot.batch.id).await.unwrap().unwrap();
        let first = rig.mailer.sent()[0].to.clone();
        let records = rig
            .registry
            .pending_recipients(snapshot.batch.upload_id, 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1, "first row was consumed");
        rig.queue
            .enqueue(
                DispatchJob {
                    email: first,
                    record_id: mailforge_core::EmailRecordId::new(),
                    batch_key: snapshot.batch.key,
                    batch_id: snapshot.batch.id,
                    upload_id: snapshot.batch.upload_id,
                    subject: "What changed this week".into(),
                    body: "A rundown of everything that shipped.".into(),
                    epoch: state.epoch,
                },
                None,
            )
            .await
            .unwrap();

        drain(&rig).await;

        // Three sends total (one duplicate), but only two counted.
        assert_eq!(rig.mailer.sent_count(), 3);
        let batch = rig.registry.batch(snapshot.batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.sent_count, 2);
    }

    #[tokio::test]
    async fn live_batch_without_state_fails_the_job() {
        let queue = InMemoryQueue::with_retry_policy(RetryPolicy::no_retry());
        let rig = rig_with(queue, WorkerConfig::default());
        let alice = actor("alice", Role::User);
        let snapshot = rig
            .manager
            .start_batch(&alice, start_request(1, 1))
            .await
            .unwrap();

        // Lose the runtime state while the batch is still Processing.
        rig.state.delete(snapshot.batch.id).await.unwrap();
        drain(&rig).await;

        assert_eq!(rig.mailer.sent_count(), 0);
        assert_eq!(rig.queue.counts().await.unwrap().failed, 1);
        // The batch row is untouched for an operator to inspect.
        let batch = rig.registry.batch(snapshot.batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Processing);
    }

    #[tokio::test]
    async fn worker_task_spawns_and_shuts_down() {
        let registry = Arc::new(InMemoryRegistry::new());
        let state = Arc::new(InMemoryStateStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let mailer = Arc::new(MemoryMailer::new());
        let worker = DispatchWorker::new(
            registry,
            state,
            queue,
            mailer,
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                ..WorkerConfig::default()
            },
        );
        let handle = worker.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn every_recipient_is_delivered_exactly_once(
            n in 1usize..=20,
            window in 1u32..=6,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async move {
                let rig = rig();
                let alice = actor("alice", Role::User);
                let snapshot = rig
                    .manager
                    .start_batch(&alice, start_request(n, window))
                    .await
                    .unwrap();
                let key = snapshot.batch.key;

                let mut resumes = 0u32;
                loop {
                    drain(&rig).await;
                    let batch = rig
                        .registry
                        .batch(snapshot.batch.id)
                        .await
                        .unwrap()
                        .unwrap();
                    match batch.status {
                        BatchStatus::Completed => break,
                        BatchStatus::Paused => {
                            resumes += 1;
                            rig.manager.resume_batch(&alice, key).await.unwrap();
                        }
                        other => panic!("unexpected status {other:?}"),
                    }
                }

                let windows = (n as u32).div_ceil(window);
                prop_assert_eq!(resumes, windows - 1);

                let sent = rig.mailer.sent();
                prop_assert_eq!(sent.len(), n);
                let unique: HashSet<String> =
                    sent.iter().map(|e| e.to.as_str().to_string()).collect();
                prop_assert_eq!(unique.len(), n);

                let batch = rig
                    .registry
                    .batch(snapshot.batch.id)
                    .await
                    .unwrap()
                    .unwrap();
                prop_assert_eq!(batch.sent_count, n as u64);
                prop_assert_eq!(batch.total_emails, n as u32);
                Ok(())
            }).unwrap();
        }
    }
}
