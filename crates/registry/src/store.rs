//! Registry abstraction over uploads, batches, and recipient rows.

use mailforge_core::{BatchId, BatchKey, EmailRecordId, UploadId};

use crate::model::{
    Batch, BatchSettings, BatchStatus, EmailRecord, NewBatch, NewUpload, Paged, Pagination, Upload,
    UploadStatus,
};

/// Registry error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("upload not found: {0}")]
    UploadNotFound(UploadId),
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),
    #[error("upload {0} already has a batch")]
    DuplicateBatch(UploadId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable storage for the dispatch domain.
///
/// One batch row per upload is a registry-level constraint; callers rely on
/// `create_batch` failing with [`RegistryError::DuplicateBatch`] rather than
/// checking first.
#[async_trait::async_trait]
pub trait BatchRegistry: Send + Sync {
    /// Insert an upload and its recipient rows in one unit. Duplicate
    /// addresses within the upload are silently dropped; the returned
    /// upload's `total_emails` reflects the distinct count actually stored.
    async fn create_upload(&self, new: NewUpload) -> Result<Upload, RegistryError>;

    async fn upload(&self, id: UploadId) -> Result<Option<Upload>, RegistryError>;

    /// Uploads ordered newest first.
    async fn list_uploads(&self, page: Pagination) -> Result<Paged<Upload>, RegistryError>;

    async fn set_upload_status(
        &self,
        id: UploadId,
        status: UploadStatus,
    ) -> Result<(), RegistryError>;

    /// Grow the cumulative handed-to-queue count.
    async fn add_queued(&self, id: UploadId, n: u32) -> Result<(), RegistryError>;

    /// Remove an upload and (cascading) its recipient rows.
    async fn delete_upload(&self, id: UploadId) -> Result<(), RegistryError>;

    /// Oldest pending recipients for an upload, in stable insertion order.
    async fn pending_recipients(
        &self,
        upload_id: UploadId,
        limit: u32,
    ) -> Result<Vec<EmailRecord>, RegistryError>;

    /// Remaining recipient rows for an upload.
    async fn count_pending(&self, upload_id: UploadId) -> Result<u64, RegistryError>;

    /// Consume a recipient row. Returns whether a row was actually removed,
    /// which is what makes redelivered jobs count-once.
    async fn delete_record(&self, id: EmailRecordId) -> Result<bool, RegistryError>;

    async fn create_batch(&self, new: NewBatch) -> Result<Batch, RegistryError>;

    async fn batch(&self, id: BatchId) -> Result<Option<Batch>, RegistryError>;

    async fn batch_by_key(&self, key: BatchKey) -> Result<Option<Batch>, RegistryError>;

    async fn batch_for_upload(&self, upload_id: UploadId) -> Result<Option<Batch>, RegistryError>;

    async fn update_batch_settings(
        &self,
        id: BatchId,
        settings: BatchSettings,
    ) -> Result<(), RegistryError>;

    async fn set_batch_status(&self, id: BatchId, status: BatchStatus)
        -> Result<(), RegistryError>;

    /// Grow the cumulative per-window authorization.
    async fn grow_batch_total(&self, id: BatchId, n: u32) -> Result<(), RegistryError>;

    /// Write-through of the runtime success counter at pause/completion.
    async fn record_progress(&self, id: BatchId, sent_count: u64) -> Result<(), RegistryError>;

    /// Batches ordered newest first, optionally restricted to one owner.
    async fn list_batches(
        &self,
        owner: Option<&str>,
        page: Pagination,
    ) -> Result<Paged<Batch>, RegistryError>;

    async fn delete_batch(&self, id: BatchId) -> Result<(), RegistryError>;
}
