//! In-memory registry for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use mailforge_core::{BatchId, BatchKey, EmailRecordId, UploadId};

use crate::model::{
    Batch, BatchSettings, BatchStatus, EmailRecord, NewBatch, NewUpload, Paged, Pagination, Upload,
    UploadStatus,
};
use crate::store::{BatchRegistry, RegistryError};

/// In-memory registry backed by plain maps. Single source of truth for the
/// trait's semantics; the Postgres implementation mirrors it.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    uploads: RwLock<HashMap<UploadId, Upload>>,
    batches: RwLock<HashMap<BatchId, Batch>>,
    records: RwLock<HashMap<EmailRecordId, EmailRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl BatchRegistry for InMemoryRegistry {
    async fn create_upload(&self, new: NewUpload) -> Result<Upload, RegistryError> {
        let now = Utc::now();
        let upload_id = UploadId::new();

        let mut records = self.records.write().unwrap();
        let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut stored = 0u32;
        for recipient in &new.recipients {
            if !seen.insert(recipient.email.as_str()) {
                continue;
            }
            let record = EmailRecord {
                id: EmailRecordId::new(),
                upload_id,
                email: recipient.email.clone(),
                name: recipient.name.clone(),
                created_at: now,
            };
            records.insert(record.id, record);
            stored += 1;
        }

        let upload = Upload {
            id: upload_id,
            file_name: new.file_name,
            total_emails: stored,
            queued_emails: 0,
            status: UploadStatus::Paused,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        self.uploads.write().unwrap().insert(upload_id, upload.clone());
        Ok(upload)
    }

    async fn upload(&self, id: UploadId) -> Result<Option<Upload>, RegistryError> {
        Ok(self.uploads.read().unwrap().get(&id).cloned())
    }

    async fn list_uploads(&self, page: Pagination) -> Result<Paged<Upload>, RegistryError> {
        let uploads = self.uploads.read().unwrap();
        let mut items: Vec<_> = uploads.values().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Ok(Paged { items, total })
    }

    async fn set_upload_status(
        &self,
        id: UploadId,
        status: UploadStatus,
    ) -> Result<(), RegistryError> {
        let mut uploads = self.uploads.write().unwrap();
        let upload = uploads
            .get_mut(&id)
            .ok_or(RegistryError::UploadNotFound(id))?;
        upload.status = status;
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn add_queued(&self, id: UploadId, n: u32) -> Result<(), RegistryError> {
        let mut uploads = self.uploads.write().unwrap();
        let upload = uploads
            .get_mut(&id)
            .ok_or(RegistryError::UploadNotFound(id))?;
        upload.queued_emails += n;
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_upload(&self, id: UploadId) -> Result<(), RegistryError> {
        self.uploads.write().unwrap().remove(&id);
        self.records
            .write()
            .unwrap()
            .retain(|_, r| r.upload_id != id);
        Ok(())
    }

    async fn pending_recipients(
        &self,
        upload_id: UploadId,
        limit: u32,
    ) -> Result<Vec<EmailRecord>, RegistryError> {
        let records = self.records.read().unwrap();
        let mut pending: Vec<_> = records
            .values()
            .filter(|r| r.upload_id == upload_id)
            .cloned()
            .collect();
        // v7 record ids are time-ordered, so this is insertion order.
        pending.sort_by_key(|r| *r.id.as_uuid());
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn count_pending(&self, upload_id: UploadId) -> Result<u64, RegistryError> {
        let records = self.records.read().unwrap();
        Ok(records.values().filter(|r| r.upload_id == upload_id).count() as u64)
    }

    async fn delete_record(&self, id: EmailRecordId) -> Result<bool, RegistryError> {
        Ok(self.records.write().unwrap().remove(&id).is_some())
    }

    async fn create_batch(&self, new: NewBatch) -> Result<Batch, RegistryError> {
        let mut batches = self.batches.write().unwrap();
        if batches.values().any(|b| b.upload_id == new.upload_id) {
            return Err(RegistryError::DuplicateBatch(new.upload_id));
        }
        let now = Utc::now();
        let batch = Batch {
            id: BatchId::new(),
            key: BatchKey::new(),
            upload_id: new.upload_id,
            name: new.name,
            subject: new.subject,
            body: new.body,
            delay_ms: new.delay_ms,
            window_size: new.window_size,
            total_emails: new.total_emails,
            sent_count: 0,
            status: BatchStatus::Pending,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn batch(&self, id: BatchId) -> Result<Option<Batch>, RegistryError> {
        Ok(self.batches.read().unwrap().get(&id).cloned())
    }

    async fn batch_by_key(&self, key: BatchKey) -> Result<Option<Batch>, RegistryError> {
        let batches = self.batches.read().unwrap();
        Ok(batches.values().find(|b| b.key == key).cloned())
    }

    async fn batch_for_upload(&self, upload_id: UploadId) -> Result<Option<Batch>, RegistryError> {
        let batches = self.batches.read().unwrap();
        Ok(batches.values().find(|b| b.upload_id == upload_id).cloned())
    }

    async fn update_batch_settings(
        &self,
        id: BatchId,
        settings: BatchSettings,
    ) -> Result<(), RegistryError> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches.get_mut(&id).ok_or(RegistryError::BatchNotFound(id))?;
        batch.name = settings.name;
        batch.subject = settings.subject;
        batch.body = settings.body;
        batch.delay_ms = settings.delay_ms;
        batch.window_size = settings.window_size;
        batch.updated_at = Utc::now();
        Ok(())
    }

    async fn set_batch_status(
        &self,
        id: BatchId,
        status: BatchStatus,
    ) -> Result<(), RegistryError> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches.get_mut(&id).ok_or(RegistryError::BatchNotFound(id))?;
        batch.status = status;
        batch.updated_at = Utc::now();
        Ok(())
    }

    async fn grow_batch_total(&self, id: BatchId, n: u32) -> Result<(), RegistryError> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches.get_mut(&id).ok_or(RegistryError::BatchNotFound(id))?;
        batch.total_emails += n;
        batch.updated_at = Utc::now();
        Ok(())
    }

    async fn record_progress(&self, id: BatchId, sent_count: u64) -> Result<(), RegistryError> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches.get_mut(&id).ok_or(RegistryError::BatchNotFound(id))?;
        batch.sent_count = sent_count;
        batch.updated_at = Utc::now();
        Ok(())
    }

    async fn list_batches(
        &self,
        owner: Option<&str>,
        page: Pagination,
    ) -> Result<Paged<Batch>, RegistryError> {
        let batches = self.batches.read().unwrap();
        let mut items: Vec<_> = batches
            .values()
            .filter(|b| owner.map_or(true, |o| b.created_by == o))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Ok(Paged { items, total })
    }

    async fn delete_batch(&self, id: BatchId) -> Result<(), RegistryError> {
        self.batches.write().unwrap().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailforge_core::{EmailAddress, Recipient};

    fn recipient(addr: &str) -> Recipient {
        Recipient::new(EmailAddress::parse(addr).unwrap())
    }

    fn new_upload(recipients: Vec<Recipient>) -> NewUpload {
        NewUpload {
            file_name: "list.csv".to_string(),
            created_by: "carol".to_string(),
            recipients,
        }
    }

    fn new_batch(upload_id: UploadId) -> NewBatch {
        NewBatch {
            upload_id,
            name: "spring launch".to_string(),
            subject: "hello".to_string(),
            body: "longer body text".to_string(),
            delay_ms: 0,
            window_size: 3,
            total_emails: 3,
            created_by: "carol".to_string(),
        }
    }

    #[tokio::test]
    async fn upload_deduplicates_recipients() {
        let registry = InMemoryRegistry::new();
        let upload = registry
            .create_upload(new_upload(vec![
                recipient("a@example.com"),
                recipient("b@example.com"),
                recipient("a@example.com"),
            ]))
            .await
            .unwrap();

        assert_eq!(upload.total_emails, 2);
        assert_eq!(registry.count_pending(upload.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pending_recipients_keep_insertion_order() {
        let registry = InMemoryRegistry::new();
        let upload = registry
            .create_upload(new_upload(vec![
                recipient("first@example.com"),
                recipient("second@example.com"),
                recipient("third@example.com"),
            ]))
            .await
            .unwrap();

        let pending = registry.pending_recipients(upload.id, 2).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].email.as_str(), "first@example.com");
        assert_eq!(pending[1].email.as_str(), "second@example.com");
    }

    #[tokio::test]
    async fn delete_record_reports_whether_row_existed() {
        let registry = InMemoryRegistry::new();
        let upload = registry
            .create_upload(new_upload(vec![recipient("a@example.com")]))
            .await
            .unwrap();

        let pending = registry.pending_recipients(upload.id, 10).await.unwrap();
        let id = pending[0].id;

        assert!(registry.delete_record(id).await.unwrap());
        assert!(!registry.delete_record(id).await.unwrap());
        assert_eq!(registry.count_pending(upload.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_batch_for_upload_is_rejected() {
        let registry = InMemoryRegistry::new();
        let upload = registry
            .create_upload(new_upload(vec![recipient("a@example.com")]))
            .await
            .unwrap();

        registry.create_batch(new_batch(upload.id)).await.unwrap();
        let err = registry.create_batch(new_batch(upload.id)).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateBatch(_)));
    }

    #[tokio::test]
    async fn batch_lookup_by_key_and_upload() {
        let registry = InMemoryRegistry::new();
        let upload = registry
            .create_upload(new_upload(vec![recipient("a@example.com")]))
            .await
            .unwrap();
        let batch = registry.create_batch(new_batch(upload.id)).await.unwrap();

        let by_key = registry.batch_by_key(batch.key).await.unwrap().unwrap();
        assert_eq!(by_key.id, batch.id);
        let by_upload = registry
            .batch_for_upload(upload.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_upload.id, batch.id);
    }

    #[tokio::test]
    async fn list_batches_filters_by_owner_and_paginates() {
        let registry = InMemoryRegistry::new();
        for owner in ["carol", "carol", "dave"] {
            let upload = registry
                .create_upload(NewUpload {
                    file_name: "list.csv".to_string(),
                    created_by: owner.to_string(),
                    recipients: vec![recipient("a@example.com")],
                })
                .await
                .unwrap();
            let mut nb = new_batch(upload.id);
            nb.created_by = owner.to_string();
            registry.create_batch(nb).await.unwrap();
        }

        let carols = registry
            .list_batches(Some("carol"), Pagination::default())
            .await
            .unwrap();
        assert_eq!(carols.total, 2);

        let page = registry
            .list_batches(None, Pagination { limit: 2, offset: 0 })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn progress_and_totals_accumulate() {
        let registry = InMemoryRegistry::new();
        let upload = registry
            .create_upload(new_upload(vec![recipient("a@example.com")]))
            .await
            .unwrap();
        let batch = registry.create_batch(new_batch(upload.id)).await.unwrap();

        registry.grow_batch_total(batch.id, 3).await.unwrap();
        registry.record_progress(batch.id, 6).await.unwrap();
        registry.add_queued(upload.id, 3).await.unwrap();

        let batch = registry.batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.total_emails, 6);
        assert_eq!(batch.sent_count, 6);
        let upload = registry.upload(upload.id).await.unwrap().unwrap();
        assert_eq!(upload.queued_emails, 3);
    }
}
