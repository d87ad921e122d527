//! Durable records: uploads, batches, and the recipient rows they own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailforge_core::{BatchId, BatchKey, EmailAddress, EmailRecordId, Recipient, UploadId};

/// Lifecycle of an upload (a recipient list).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// No batch is currently consuming the upload.
    Paused,
    /// A batch over this upload is dispatching.
    Processing,
    /// Every recipient has been consumed.
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Paused => "paused",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paused" => Ok(UploadStatus::Paused),
            "processing" => Ok(UploadStatus::Processing),
            "completed" => Ok(UploadStatus::Completed),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(format!("unknown upload status: {other}")),
        }
    }
}

/// Lifecycle of a batch.
///
/// `Completed` is terminal; everything else can move.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created but not yet dispatching (settings staged, nothing enqueued).
    Pending,
    /// The worker is consuming this batch's jobs.
    Processing,
    /// Stopped at a window boundary or by an operator.
    Paused,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed)
    }
}

impl core::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "paused" => Ok(BatchStatus::Paused),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

/// An uploaded recipient list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub id: UploadId,
    pub file_name: String,
    /// Distinct recipients actually stored (after dedup).
    pub total_emails: u32,
    /// Cumulative count of recipients handed to the queue. Never exceeds
    /// `total_emails`.
    pub queued_emails: u32,
    pub status: UploadStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an upload together with its recipient rows.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub file_name: String,
    pub created_by: String,
    pub recipients: Vec<Recipient>,
}

/// A send campaign over one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    /// Public identifier handed to clients.
    pub key: BatchKey,
    pub upload_id: UploadId,
    pub name: String,
    pub subject: String,
    pub body: String,
    /// Sleep between consecutive sends, in milliseconds.
    pub delay_ms: u64,
    /// Successful sends allowed per window before the batch auto-pauses.
    pub window_size: u32,
    /// Cumulative recipients authorized across windows so far.
    pub total_emails: u32,
    /// Successful sends, reconciled from runtime state at pause and
    /// completion boundaries only.
    pub sent_count: u64,
    pub status: BatchStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a batch row. Identifier, key, status, and timestamps
/// are assigned by the registry.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub upload_id: UploadId,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub delay_ms: u64,
    pub window_size: u32,
    /// First window's authorization.
    pub total_emails: u32,
    pub created_by: String,
}

/// Mutable settings of an existing batch, applied when an operator
/// reconfigures a non-processing batch.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub name: String,
    pub subject: String,
    pub body: String,
    pub delay_ms: u64,
    pub window_size: u32,
}

/// One pending recipient. The row's existence is the pending marker: a
/// successful send deletes it, so `count(rows)` is the remaining work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: EmailRecordId,
    pub upload_id: UploadId,
    pub email: EmailAddress,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Pagination parameters for listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000), // Cap at 1000 for safety
            offset: offset.unwrap_or(0),
        }
    }
}

/// A page of rows plus the unpaged total.
#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
}
