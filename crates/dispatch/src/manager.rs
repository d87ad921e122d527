//! Batch lifecycle: start, pause, resume, delete, purge and read views.
//!
//! The manager is the only component that enqueues dispatch jobs. The
//! worker consumes them and pauses at window boundaries; every further
//! window exists because an operator (or the start call) asked for it, so
//! outstanding work never exceeds one authorized window per batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use mailforge_auth::Actor;
use mailforge_core::email::Recipient;
use mailforge_core::{BatchId, BatchKey, UploadId};
use mailforge_queue::{DispatchJob, DispatchQueue, QueueCounts};
use mailforge_registry::{
    Batch, BatchRegistry, BatchSettings, BatchStatus, NewBatch, NewUpload, Paged, Pagination,
    Upload, UploadStatus,
};
use mailforge_state::{BatchState, StateError, StateSeed, StateStore};

use crate::error::{DispatchError, DispatchResult};

/// When a batch should start dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Now,
    At(DateTime<Utc>),
}

impl Schedule {
    /// Queue delay for the first window, relative to `now`.
    fn delay_from(&self, now: DateTime<Utc>) -> DispatchResult<Option<Duration>> {
        match self {
            Schedule::Now => Ok(None),
            Schedule::At(at) if *at <= now => Err(DispatchError::InvalidSchedule),
            Schedule::At(at) => Ok(Some((*at - now).to_std().unwrap_or_default())),
        }
    }
}

/// Message and pacing settings shared by both start paths.
#[derive(Debug, Clone)]
pub struct BatchDraft {
    pub name: String,
    pub subject: String,
    pub body: String,
    pub delay_ms: u64,
    pub window_size: u32,
    pub schedule: Schedule,
}

/// Where the recipients come from.
#[derive(Debug, Clone)]
pub enum BatchSource {
    /// Store a fresh recipient list and dispatch against it.
    NewUpload {
        file_name: String,
        recipients: Vec<Recipient>,
    },
    /// Dispatch against the remaining recipients of a stored upload.
    ExistingUpload { upload_id: UploadId },
}

#[derive(Debug, Clone)]
pub struct StartBatch {
    pub source: BatchSource,
    pub draft: BatchDraft,
}

/// Live progress attached to a batch row.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    /// Recipient rows still to be sent.
    pub remaining: u64,
    /// Successful sends so far; runtime counter when present, otherwise the
    /// registry's last write-through.
    pub sent: u64,
    /// Runtime state, absent once a batch completes or is purged.
    pub state: Option<BatchState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub batch: Batch,
    pub progress: BatchProgress,
}

#[derive(Debug, Serialize)]
pub struct BatchOverview {
    pub batches: Paged<BatchSnapshot>,
    pub queue: QueueCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadWithBatch {
    pub upload: Upload,
    pub batch: Option<Batch>,
    pub remaining: u64,
}

pub struct BatchManager {
    registry: Arc<dyn BatchRegistry>,
    state: Arc<dyn StateStore>,
    queue: Arc<dyn DispatchQueue>,
}

impl BatchManager {
    pub fn new(
        registry: Arc<dyn BatchRegistry>,
        state: Arc<dyn StateStore>,
        queue: Arc<dyn DispatchQueue>,
    ) -> Self {
        Self {
            registry,
            state,
            queue,
        }
    }

    /// Start dispatching: create or reuse the upload, create or update the
    /// batch, then authorize and enqueue the first window. Status flips
    /// happen only after the window is fully enqueued, so a failed start
    /// never leaves the batch Processing with no queued work.
    #[instrument(skip(self, actor, request), fields(actor = %actor.username), err)]
    pub async fn start_batch(
        &self,
        actor: &Actor,
        request: StartBatch,
    ) -> DispatchResult<BatchSnapshot> {
        let draft = request.draft;
        if draft.window_size == 0 {
            return Err(DispatchError::validation("window size must be at least 1"));
        }
        // Schedule problems surface before any row is written.
        let schedule_delay = draft.schedule.delay_from(Utc::now())?;

        let (upload, batch) = match request.source {
            BatchSource::NewUpload {
                file_name,
                recipients,
            } => {
                if recipients.is_empty() {
                    return Err(DispatchError::validation("upload has no valid recipients"));
                }
                let upload = self
                    .registry
                    .create_upload(NewUpload {
                        file_name,
                        created_by: actor.username.clone(),
                        recipients,
                    })
                    .await?;
                let window = window_for(draft.window_size, u64::from(upload.total_emails));
                let batch = self
                    .registry
                    .create_batch(NewBatch {
                        upload_id: upload.id,
                        name: draft.name.clone(),
                        subject: draft.subject.clone(),
                        body: draft.body.clone(),
                        delay_ms: draft.delay_ms,
                        window_size: draft.window_size,
                        total_emails: window,
                        created_by: actor.username.clone(),
                    })
                    .await?;
                (upload, batch)
            }
            BatchSource::ExistingUpload { upload_id } => {
                let upload = self.require_upload(upload_id).await?;
                if upload.status == UploadStatus::Completed {
                    return Err(DispatchError::validation("upload is already completed"));
                }
                let remaining = self.registry.count_pending(upload_id).await?;
                if remaining == 0 {
                    return Err(DispatchError::validation(
                        "upload has no remaining recipients",
                    ));
                }
                let window = window_for(draft.window_size, remaining);
                let batch = match self.registry.batch_for_upload(upload_id).await? {
                    Some(existing) => {
                        if existing.status == BatchStatus::Processing {
                            return Err(DispatchError::BatchBusy);
                        }
                        self.authorize(actor, &existing.created_by)?;
                        self.registry
                            .update_batch_settings(
                                existing.id,
                                BatchSettings {
                                    name: draft.name.clone(),
                                    subject: draft.subject.clone(),
                                    body: draft.body.clone(),
                                    delay_ms: draft.delay_ms,
                                    window_size: draft.window_size,
                                },
                            )
                            .await?;
                        self.registry.grow_batch_total(existing.id, window).await?;
                        self.require_batch(existing.id).await?
                    }
                    None => {
                        self.registry
                            .create_batch(NewBatch {
                                upload_id,
                                name: draft.name.clone(),
                                subject: draft.subject.clone(),
                                body: draft.body.clone(),
                                delay_ms: draft.delay_ms,
                                window_size: draft.window_size,
                                total_emails: window,
                                created_by: actor.username.clone(),
                            })
                            .await?
                    }
                };
                (upload, batch)
            }
        };

        let enqueued = self.activate(&upload, &batch, schedule_delay).await?;
        info!(batch = %batch.key, enqueued, "batch started");
        self.snapshot(self.require_batch(batch.id).await?).await
    }

    /// Stop dispatching after the in-flight job, if any. Counters freeze;
    /// queued jobs observe the paused flag and are re-delayed untouched.
    #[instrument(skip(self, actor), fields(actor = %actor.username, batch = %batch_key), err)]
    pub async fn pause_batch(
        &self,
        actor: &Actor,
        batch_key: BatchKey,
    ) -> DispatchResult<BatchSnapshot> {
        let batch = self.require_batch_by_key(batch_key).await?;
        self.authorize(actor, &batch.created_by)?;
        if batch.status == BatchStatus::Completed {
            return Err(DispatchError::validation("batch is already completed"));
        }

        // Flag first so the worker stops pulling, then persist progress.
        match self.state.set_paused(batch.id, true).await {
            Ok(()) => {}
            // Never started or already torn down; the registry flip is all
            // there is to do.
            Err(StateError::Missing(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let sent = match self.state.get(batch.id).await? {
            Some(state) => state.total_count,
            None => batch.sent_count,
        };
        self.registry
            .set_batch_status(batch.id, BatchStatus::Paused)
            .await?;
        self.registry.record_progress(batch.id, sent).await?;
        info!(batch = %batch_key, sent, "batch paused");
        self.snapshot(self.require_batch(batch.id).await?).await
    }

    /// Authorize and enqueue the next window. Re-initializing the runtime
    /// state bumps the epoch, so jobs left over from before the pause are
    /// discarded on claim instead of double-sending.
    #[instrument(skip(self, actor), fields(actor = %actor.username, batch = %batch_key), err)]
    pub async fn resume_batch(
        &self,
        actor: &Actor,
        batch_key: BatchKey,
    ) -> DispatchResult<BatchSnapshot> {
        let batch = self.require_batch_by_key(batch_key).await?;
        self.authorize(actor, &batch.created_by)?;
        if batch.status == BatchStatus::Completed {
            return Err(DispatchError::validation("batch is already completed"));
        }
        let upload = self.require_upload(batch.upload_id).await?;
        let remaining = self.registry.count_pending(upload.id).await?;
        if remaining == 0 {
            return Err(DispatchError::validation(
                "upload has no remaining recipients",
            ));
        }

        let window = window_for(batch.window_size, remaining);
        self.registry.grow_batch_total(batch.id, window).await?;
        let batch = self.require_batch(batch.id).await?;
        let enqueued = self.activate(&upload, &batch, None).await?;
        info!(batch = %batch_key, enqueued, "batch resumed");
        self.snapshot(self.require_batch(batch.id).await?).await
    }

    /// Remove the batch and its queued work. The upload and its remaining
    /// recipient rows survive for a future batch.
    #[instrument(skip(self, actor), fields(actor = %actor.username, batch = %batch_key), err)]
    pub async fn delete_batch(&self, actor: &Actor, batch_key: BatchKey) -> DispatchResult<()> {
        let batch = self.require_batch_by_key(batch_key).await?;
        self.authorize(actor, &batch.created_by)?;

        // Queue first: a job claimed during teardown finds no runtime state
        // and no batch row, and skips without side effects.
        let removed = self.queue.remove_for_batch(batch.id).await?;
        self.state.delete(batch.id).await?;
        self.registry.delete_batch(batch.id).await?;

        if let Some(upload) = self.registry.upload(batch.upload_id).await? {
            if upload.status == UploadStatus::Processing {
                self.registry
                    .set_upload_status(upload.id, UploadStatus::Paused)
                    .await?;
            }
        }
        info!(batch = %batch_key, removed, "batch deleted");
        Ok(())
    }

    /// Admin-only full teardown of a campaign: queued jobs, runtime state,
    /// recipient rows, batch row, upload row, in that order.
    #[instrument(skip(self, actor), fields(actor = %actor.username, upload = %upload_id), err)]
    pub async fn purge_upload(&self, actor: &Actor, upload_id: UploadId) -> DispatchResult<()> {
        if !actor.role.is_admin() {
            return Err(DispatchError::permission("purge requires the admin role"));
        }
        self.require_upload(upload_id).await?;

        let batch = self.registry.batch_for_upload(upload_id).await?;
        if let Some(batch) = &batch {
            self.queue.remove_for_batch(batch.id).await?;
            self.state.delete(batch.id).await?;
            self.registry.delete_batch(batch.id).await?;
        }
        // Recipient rows go with the upload row.
        self.registry.delete_upload(upload_id).await?;
        info!(upload = %upload_id, "upload purged");
        Ok(())
    }

    /// Page of batches visible to the actor, with progress and global queue
    /// depth. Admin sees everything; users see their own.
    pub async fn batch_overview(
        &self,
        actor: &Actor,
        page: Pagination,
    ) -> DispatchResult<BatchOverview> {
        let owner = (!actor.role.is_admin()).then_some(actor.username.as_str());
        let batches = self.registry.list_batches(owner, page).await?;
        let total = batches.total;
        let mut items = Vec::with_capacity(batches.items.len());
        for batch in batches.items {
            items.push(self.snapshot(batch).await?);
        }
        let queue = self.queue.counts().await?;
        Ok(BatchOverview {
            batches: Paged { items, total },
            queue,
        })
    }

    pub async fn batch_detail(
        &self,
        actor: &Actor,
        batch_key: BatchKey,
    ) -> DispatchResult<BatchSnapshot> {
        let batch = self.require_batch_by_key(batch_key).await?;
        self.authorize(actor, &batch.created_by)?;
        self.snapshot(batch).await
    }

    /// Page of uploads joined with their batch, newest first.
    pub async fn uploads_with_batches(
        &self,
        page: Pagination,
    ) -> DispatchResult<Paged<UploadWithBatch>> {
        let uploads = self.registry.list_uploads(page).await?;
        let total = uploads.total;
        let mut items = Vec::with_capacity(uploads.items.len());
        for upload in uploads.items {
            let batch = self.registry.batch_for_upload(upload.id).await?;
            let remaining = self.registry.count_pending(upload.id).await?;
            items.push(UploadWithBatch {
                upload,
                batch,
                remaining,
            });
        }
        Ok(Paged { items, total })
    }

    /// Shared tail of every start/resume: seed runtime state (bumping the
    /// epoch), enqueue up to one window of pending recipients, then flip
    /// statuses and grow the queued counter.
    async fn activate(
        &self,
        upload: &Upload,
        batch: &Batch,
        schedule_delay: Option<Duration>,
    ) -> DispatchResult<u32> {
        let state = self
            .state
            .init(
                batch.id,
                StateSeed {
                    delay_ms: batch.delay_ms,
                    window_size: batch.window_size,
                    total_count: batch.sent_count,
                },
            )
            .await?;

        let recipients = self
            .registry
            .pending_recipients(upload.id, batch.window_size)
            .await?;
        let mut enqueued: u32 = 0;
        for record in &recipients {
            let job = DispatchJob {
                email: record.email.clone(),
                record_id: record.id,
                batch_key: batch.key,
                batch_id: batch.id,
                upload_id: upload.id,
                subject: batch.subject.clone(),
                body: batch.body.clone(),
                epoch: state.epoch,
            };
            if let Err(e) = self.queue.enqueue(job, schedule_delay).await {
                // Roll the partial window back; the batch keeps its previous
                // status and can be started again.
                let _ = self.queue.remove_for_batch(batch.id).await;
                return Err(e.into());
            }
            enqueued += 1;
        }

        self.registry
            .set_batch_status(batch.id, BatchStatus::Processing)
            .await?;
        self.registry
            .set_upload_status(upload.id, UploadStatus::Processing)
            .await?;
        self.registry.add_queued(upload.id, enqueued).await?;
        Ok(enqueued)
    }

    async fn snapshot(&self, batch: Batch) -> DispatchResult<BatchSnapshot> {
        let remaining = self.registry.count_pending(batch.upload_id).await?;
        let state = self.state.get(batch.id).await?;
        let sent = state.as_ref().map_or(batch.sent_count, |s| s.total_count);
        Ok(BatchSnapshot {
            batch,
            progress: BatchProgress {
                remaining,
                sent,
                state,
            },
        })
    }

    fn authorize(&self, actor: &Actor, owner: &str) -> DispatchResult<()> {
        if actor.can_manage(owner) {
            Ok(())
        } else {
            Err(DispatchError::permission("not the owner of this batch"))
        }
    }

    async fn require_upload(&self, id: UploadId) -> DispatchResult<Upload> {
        self.registry
            .upload(id)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("upload {id}")))
    }

    async fn require_batch(&self, id: BatchId) -> DispatchResult<Batch> {
        self.registry
            .batch(id)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("batch {id}")))
    }

    async fn require_batch_by_key(&self, key: BatchKey) -> DispatchResult<Batch> {
        self.registry
            .batch_by_key(key)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("batch {key}")))
    }
}

/// Size of the next window: never more than the remaining recipients.
fn window_for(window_size: u32, remaining: u64) -> u32 {
    u64::from(window_size).min(remaining) as u32
}
