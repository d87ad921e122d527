//! Postgres-backed registry.
//!
//! Semantics mirror [`crate::memory::InMemoryRegistry`]; the interesting
//! parts here are the bulk recipient insert (UNNEST + ON CONFLICT DO
//! NOTHING) and the UNIQUE constraints that turn races into
//! [`RegistryError`] variants instead of corrupt rows.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::instrument;

use mailforge_core::{BatchId, BatchKey, EmailAddress, EmailRecordId, UploadId};

use crate::model::{
    Batch, BatchSettings, BatchStatus, EmailRecord, NewBatch, NewUpload, Paged, Pagination, Upload,
    UploadStatus,
};
use crate::store::{BatchRegistry, RegistryError};

/// Postgres-backed registry.
///
/// Uses a SQLx connection pool (thread-safe, cloneable). Multi-step writes
/// (upload + recipient rows) run in a transaction.
#[derive(Debug, Clone)]
pub struct PostgresRegistry {
    pool: Arc<PgPool>,
}

impl PostgresRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, RegistryError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(|e| RegistryError::Storage(format!("connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Apply bundled migrations.
    pub async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| RegistryError::Storage(format!("migrate: {e}")))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RegistryError {
    RegistryError::Storage(format!("{operation}: {err}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[derive(Debug)]
struct UploadRow {
    id: uuid::Uuid,
    file_name: String,
    total_emails: i32,
    queued_emails: i32,
    status: String,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for UploadRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(UploadRow {
            id: row.try_get("id")?,
            file_name: row.try_get("file_name")?,
            total_emails: row.try_get("total_emails")?,
            queued_emails: row.try_get("queued_emails")?,
            status: row.try_get("status")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<UploadRow> for Upload {
    type Error = RegistryError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        Ok(Upload {
            id: UploadId::from_uuid(row.id),
            file_name: row.file_name,
            total_emails: row.total_emails as u32,
            queued_emails: row.queued_emails as u32,
            status: UploadStatus::from_str(&row.status).map_err(RegistryError::Storage)?,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct BatchRow {
    id: uuid::Uuid,
    batch_key: uuid::Uuid,
    upload_id: uuid::Uuid,
    name: String,
    subject: String,
    body: String,
    delay_ms: i64,
    window_size: i32,
    total_emails: i32,
    sent_count: i64,
    status: String,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BatchRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(BatchRow {
            id: row.try_get("id")?,
            batch_key: row.try_get("batch_key")?,
            upload_id: row.try_get("upload_id")?,
            name: row.try_get("name")?,
            subject: row.try_get("subject")?,
            body: row.try_get("body")?,
            delay_ms: row.try_get("delay_ms")?,
            window_size: row.try_get("window_size")?,
            total_emails: row.try_get("total_emails")?,
            sent_count: row.try_get("sent_count")?,
            status: row.try_get("status")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<BatchRow> for Batch {
    type Error = RegistryError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(Batch {
            id: BatchId::from_uuid(row.id),
            key: BatchKey::from_uuid(row.batch_key),
            upload_id: UploadId::from_uuid(row.upload_id),
            name: row.name,
            subject: row.subject,
            body: row.body,
            delay_ms: row.delay_ms as u64,
            window_size: row.window_size as u32,
            total_emails: row.total_emails as u32,
            sent_count: row.sent_count as u64,
            status: BatchStatus::from_str(&row.status).map_err(RegistryError::Storage)?,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct EmailRecordRow {
    id: uuid::Uuid,
    upload_id: uuid::Uuid,
    email: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EmailRecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EmailRecordRow {
            id: row.try_get("id")?,
            upload_id: row.try_get("upload_id")?,
            email: row.try_get("email")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EmailRecordRow> for EmailRecord {
    type Error = RegistryError;

    fn try_from(row: EmailRecordRow) -> Result<Self, Self::Error> {
        Ok(EmailRecord {
            id: EmailRecordId::from_uuid(row.id),
            upload_id: UploadId::from_uuid(row.upload_id),
            email: EmailAddress::parse(&row.email)
                .map_err(|e| RegistryError::Storage(format!("stored email invalid: {e}")))?,
            name: row.name,
            created_at: row.created_at,
        })
    }
}

const UPLOAD_COLUMNS: &str =
    "id, file_name, total_emails, queued_emails, status, created_by, created_at, updated_at";
const BATCH_COLUMNS: &str = "id, batch_key, upload_id, name, subject, body, delay_ms, \
     window_size, total_emails, sent_count, status, created_by, created_at, updated_at";

#[async_trait::async_trait]
impl BatchRegistry for PostgresRegistry {
    #[instrument(skip(self, new), fields(recipients = new.recipients.len()), err)]
    async fn create_upload(&self, new: NewUpload) -> Result<Upload, RegistryError> {
        let upload_id = UploadId::new();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("create_upload.begin", e))?;

        sqlx::query(
            r#"
            INSERT INTO uploads (id, file_name, status, created_by)
            VALUES ($1, $2, 'paused', $3)
            "#,
        )
        .bind(upload_id.as_uuid())
        .bind(&new.file_name)
        .bind(&new.created_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("create_upload.insert", e))?;

        let ids: Vec<uuid::Uuid> = new.recipients.iter().map(|_| uuid::Uuid::now_v7()).collect();
        let emails: Vec<String> = new
            .recipients
            .iter()
            .map(|r| r.email.as_str().to_string())
            .collect();
        let names: Vec<Option<String>> = new.recipients.iter().map(|r| r.name.clone()).collect();

        // Bulk insert; in-file duplicates collapse on the unique constraint.
        sqlx::query(
            r#"
            INSERT INTO email_records (id, upload_id, email, name)
            SELECT rid, $1, remail, rname
            FROM UNNEST($2::uuid[], $3::text[], $4::text[]) AS t(rid, remail, rname)
            ON CONFLICT (email, upload_id) DO NOTHING
            "#,
        )
        .bind(upload_id.as_uuid())
        .bind(&ids)
        .bind(&emails)
        .bind(&names)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("create_upload.recipients", e))?;

        // Recount after dedup so total_emails is what actually landed.
        let row = sqlx::query(
            r#"
            UPDATE uploads
            SET total_emails = (SELECT COUNT(*) FROM email_records WHERE upload_id = $1),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, file_name, total_emails, queued_emails, status, created_by,
                      created_at, updated_at
            "#,
        )
        .bind(upload_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("create_upload.recount", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_upload.commit", e))?;

        let parsed: UploadRow = sqlx::FromRow::from_row(&row)
            .map_err(|e| map_sqlx_error("create_upload.decode", e))?;
        Upload::try_from(parsed)
    }

    async fn upload(&self, id: UploadId) -> Result<Option<Upload>, RegistryError> {
        let row = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upload.get", e))?;

        row.map(|r| {
            let parsed: UploadRow = sqlx::FromRow::from_row(&r)
                .map_err(|e| map_sqlx_error("upload.decode", e))?;
            Upload::try_from(parsed)
        })
        .transpose()
    }

    async fn list_uploads(&self, page: Pagination) -> Result<Paged<Upload>, RegistryError> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads \
             ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_uploads", e))?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM uploads")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_uploads.count", e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let parsed: UploadRow = sqlx::FromRow::from_row(&row)
                .map_err(|e| map_sqlx_error("list_uploads.decode", e))?;
            items.push(Upload::try_from(parsed)?);
        }
        Ok(Paged {
            items,
            total: total as u64,
        })
    }

    async fn set_upload_status(
        &self,
        id: UploadId,
        status: UploadStatus,
    ) -> Result<(), RegistryError> {
        let result = sqlx::query(
            "UPDATE uploads SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_upload_status", e))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::UploadNotFound(id));
        }
        Ok(())
    }

    async fn add_queued(&self, id: UploadId, n: u32) -> Result<(), RegistryError> {
        let result = sqlx::query(
            "UPDATE uploads SET queued_emails = queued_emails + $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(n as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_queued", e))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::UploadNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(upload = %id), err)]
    async fn delete_upload(&self, id: UploadId) -> Result<(), RegistryError> {
        // email_records go with it via ON DELETE CASCADE.
        sqlx::query("DELETE FROM uploads WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_upload", e))?;
        Ok(())
    }

    async fn pending_recipients(
        &self,
        upload_id: UploadId,
        limit: u32,
    ) -> Result<Vec<EmailRecord>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, upload_id, email, name, created_at
            FROM email_records
            WHERE upload_id = $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(upload_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_recipients", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let parsed: EmailRecordRow = sqlx::FromRow::from_row(&row)
                .map_err(|e| map_sqlx_error("pending_recipients.decode", e))?;
            records.push(EmailRecord::try_from(parsed)?);
        }
        Ok(records)
    }

    async fn count_pending(&self, upload_id: UploadId) -> Result<u64, RegistryError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM email_records WHERE upload_id = $1")
                .bind(upload_id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_pending", e))?;
        Ok(count as u64)
    }

    async fn delete_record(&self, id: EmailRecordId) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM email_records WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_record", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, new), fields(upload = %new.upload_id), err)]
    async fn create_batch(&self, new: NewBatch) -> Result<Batch, RegistryError> {
        let id = BatchId::new();
        let key = BatchKey::new();

        let row = sqlx::query(&format!(
            "INSERT INTO batches \
             (id, batch_key, upload_id, name, subject, body, delay_ms, window_size, \
              total_emails, status, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10) \
             RETURNING {BATCH_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(key.as_uuid())
        .bind(new.upload_id.as_uuid())
        .bind(&new.name)
        .bind(&new.subject)
        .bind(&new.body)
        .bind(new.delay_ms as i64)
        .bind(new.window_size as i32)
        .bind(new.total_emails as i32)
        .bind(&new.created_by)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RegistryError::DuplicateBatch(new.upload_id)
            } else {
                map_sqlx_error("create_batch", e)
            }
        })?;

        let parsed: BatchRow =
            sqlx::FromRow::from_row(&row).map_err(|e| map_sqlx_error("create_batch.decode", e))?;
        Batch::try_from(parsed)
    }

    async fn batch(&self, id: BatchId) -> Result<Option<Batch>, RegistryError> {
        self.fetch_batch("WHERE id = $1", id.as_uuid()).await
    }

    async fn batch_by_key(&self, key: BatchKey) -> Result<Option<Batch>, RegistryError> {
        self.fetch_batch("WHERE batch_key = $1", key.as_uuid()).await
    }

    async fn batch_for_upload(&self, upload_id: UploadId) -> Result<Option<Batch>, RegistryError> {
        self.fetch_batch("WHERE upload_id = $1", upload_id.as_uuid())
            .await
    }

    async fn update_batch_settings(
        &self,
        id: BatchId,
        settings: BatchSettings,
    ) -> Result<(), RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET name = $2, subject = $3, body = $4, delay_ms = $5, window_size = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(&settings.name)
        .bind(&settings.subject)
        .bind(&settings.body)
        .bind(settings.delay_ms as i64)
        .bind(settings.window_size as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_batch_settings", e))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::BatchNotFound(id));
        }
        Ok(())
    }

    async fn set_batch_status(
        &self,
        id: BatchId,
        status: BatchStatus,
    ) -> Result<(), RegistryError> {
        let result = sqlx::query(
            "UPDATE batches SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_batch_status", e))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::BatchNotFound(id));
        }
        Ok(())
    }

    async fn grow_batch_total(&self, id: BatchId, n: u32) -> Result<(), RegistryError> {
        let result = sqlx::query(
            "UPDATE batches SET total_emails = total_emails + $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(n as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("grow_batch_total", e))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::BatchNotFound(id));
        }
        Ok(())
    }

    async fn record_progress(&self, id: BatchId, sent_count: u64) -> Result<(), RegistryError> {
        let result = sqlx::query(
            "UPDATE batches SET sent_count = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(sent_count as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_progress", e))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::BatchNotFound(id));
        }
        Ok(())
    }

    async fn list_batches(
        &self,
        owner: Option<&str>,
        page: Pagination,
    ) -> Result<Paged<Batch>, RegistryError> {
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches \
             WHERE ($1::text IS NULL OR created_by = $1) \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(owner)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_batches", e))?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM batches WHERE ($1::text IS NULL OR created_by = $1)",
        )
        .bind(owner)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_batches.count", e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let parsed: BatchRow = sqlx::FromRow::from_row(&row)
                .map_err(|e| map_sqlx_error("list_batches.decode", e))?;
            items.push(Batch::try_from(parsed)?);
        }
        Ok(Paged {
            items,
            total: total as u64,
        })
    }

    async fn delete_batch(&self, id: BatchId) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM batches WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_batch", e))?;
        Ok(())
    }
}

impl PostgresRegistry {
    async fn fetch_batch(
        &self,
        where_clause: &str,
        bind: &uuid::Uuid,
    ) -> Result<Option<Batch>, RegistryError> {
        let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches {where_clause}"))
            .bind(bind)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_batch", e))?;

        row.map(|r| {
            let parsed: BatchRow =
                sqlx::FromRow::from_row(&r).map_err(|e| map_sqlx_error("fetch_batch.decode", e))?;
            Batch::try_from(parsed)
        })
        .transpose()
    }
}
