//! Request validation and JSON mapping helpers.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use mailforge_core::{BatchKey, EmailAddress, Recipient, UploadId};
use mailforge_dispatch::{BatchDraft, BatchSource, Schedule, StartBatch};
use mailforge_registry::Pagination;

use crate::app::errors;

const NAME_LEN: std::ops::RangeInclusive<usize> = 3..=50;
const SUBJECT_LEN: std::ops::RangeInclusive<usize> = 3..=50;
const BODY_LEN: std::ops::RangeInclusive<usize> = 10..=10_000;
const MAX_WINDOW_SIZE: u32 = 100;
const MAX_DELAY_MS: u64 = 300_000;
const DEFAULT_PAGE_SIZE: u32 = 10;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct RecipientRequest {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of `POST /batches`. Exactly one of `upload_id` (dispatch over a
/// previously uploaded list) or `recipients` (upload a list inline) must be
/// present.
#[derive(Debug, Deserialize)]
pub struct StartBatchRequest {
    pub name: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    pub window_size: u32,
    /// RFC 3339; absent means dispatch immediately.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub recipients: Option<Vec<RecipientRequest>>,
}

pub fn to_start_batch(req: StartBatchRequest) -> Result<StartBatch, axum::response::Response> {
    let name = req.name.trim().to_string();
    if !NAME_LEN.contains(&name.chars().count()) {
        return Err(bad_request("name must be 3 to 50 characters"));
    }
    let subject = req.subject.trim().to_string();
    if !SUBJECT_LEN.contains(&subject.chars().count()) {
        return Err(bad_request("subject must be 3 to 50 characters"));
    }
    if !BODY_LEN.contains(&req.body.chars().count()) {
        return Err(bad_request("body must be 10 to 10000 characters"));
    }
    if req.window_size < 1 || req.window_size > MAX_WINDOW_SIZE {
        return Err(bad_request("window_size must be 1 to 100"));
    }
    let delay_ms = req.delay_ms.unwrap_or(0);
    if delay_ms > MAX_DELAY_MS {
        return Err(bad_request("delay_ms must be 0 to 300000"));
    }

    let schedule = match req.scheduled_at {
        Some(at) => Schedule::At(at),
        None => Schedule::Now,
    };

    let source = match (req.upload_id, req.recipients) {
        (Some(_), Some(_)) => {
            return Err(bad_request("provide either upload_id or recipients, not both"));
        }
        (None, None) => {
            return Err(bad_request("provide upload_id or recipients"));
        }
        (Some(raw), None) => BatchSource::ExistingUpload {
            upload_id: parse_upload_id(&raw)?,
        },
        (None, Some(raw)) => {
            if raw.is_empty() {
                return Err(bad_request("recipients must not be empty"));
            }
            let mut recipients = Vec::with_capacity(raw.len());
            for recipient in raw {
                let email = match EmailAddress::parse(&recipient.email) {
                    Ok(email) => email,
                    Err(e) => return Err(bad_request(e.to_string())),
                };
                recipients.push(Recipient {
                    email,
                    name: recipient.name,
                });
            }
            BatchSource::NewUpload {
                file_name: req
                    .file_name
                    .unwrap_or_else(|| "recipients.json".to_string()),
                recipients,
            }
        }
    };

    Ok(StartBatch {
        source,
        draft: BatchDraft {
            name,
            subject,
            body: req.body,
            delay_ms,
            window_size: req.window_size,
            schedule,
        },
    })
}

pub fn parse_batch_key(raw: &str) -> Result<BatchKey, axum::response::Response> {
    raw.parse()
        .map_err(|_| bad_request("batch_key must be a uuid"))
}

pub fn parse_upload_id(raw: &str) -> Result<UploadId, axum::response::Response> {
    raw.parse()
        .map_err(|_| bad_request("upload_id must be a uuid"))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

/// Validated pagination: the registry window plus what the response meta
/// echoes back.
#[derive(Debug, Clone, Copy)]
pub struct PageParams {
    pub page: u32,
    pub page_size: u32,
}

pub fn to_page_params(query: PageQuery) -> Result<PageParams, axum::response::Response> {
    let page = query.page.unwrap_or(1);
    if page < 1 {
        return Err(bad_request("page must be at least 1"));
    }
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page_size < 1 || page_size > MAX_PAGE_SIZE {
        return Err(bad_request("page_size must be 1 to 100"));
    }
    Ok(PageParams { page, page_size })
}

impl PageParams {
    pub fn pagination(&self) -> Pagination {
        Pagination {
            limit: self.page_size,
            offset: (self.page - 1).saturating_mul(self.page_size),
        }
    }

    pub fn meta(&self, total: u64) -> serde_json::Value {
        let total_pages = total.div_ceil(u64::from(self.page_size));
        json!({
            "current_page": self.page,
            "page_size": self.page_size,
            "total_records": total,
            "total_pages": total_pages,
            "has_next": u64::from(self.page) < total_pages,
            "has_previous": self.page > 1,
        })
    }
}

fn bad_request(message: impl Into<String>) -> axum::response::Response {
    errors::json_error(StatusCode::BAD_REQUEST, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> StartBatchRequest {
        StartBatchRequest {
            name: "October launch".to_string(),
            subject: "Hello there".to_string(),
            body: "A body long enough to pass.".to_string(),
            delay_ms: Some(1_000),
            window_size: 10,
            scheduled_at: None,
            upload_id: None,
            file_name: Some("launch.csv".to_string()),
            recipients: Some(vec![RecipientRequest {
                email: "ada@example.com".to_string(),
                name: None,
            }]),
        }
    }

    #[test]
    fn accepts_a_valid_inline_upload() {
        let started = to_start_batch(valid_request()).unwrap();
        match started.source {
            BatchSource::NewUpload { file_name, recipients } => {
                assert_eq!(file_name, "launch.csv");
                assert_eq!(recipients.len(), 1);
            }
            BatchSource::ExistingUpload { .. } => panic!("expected an inline upload"),
        }
        assert_eq!(started.draft.window_size, 10);
    }

    #[test]
    fn rejects_out_of_range_fields() {
        let mut req = valid_request();
        req.name = "ab".to_string();
        assert_eq!(to_start_batch(req).unwrap_err().status(), StatusCode::BAD_REQUEST);

        let mut req = valid_request();
        req.window_size = 0;
        assert_eq!(to_start_batch(req).unwrap_err().status(), StatusCode::BAD_REQUEST);

        let mut req = valid_request();
        req.window_size = 101;
        assert_eq!(to_start_batch(req).unwrap_err().status(), StatusCode::BAD_REQUEST);

        let mut req = valid_request();
        req.delay_ms = Some(300_001);
        assert_eq!(to_start_batch(req).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn rejects_ambiguous_source() {
        let mut req = valid_request();
        req.upload_id = Some(UploadId::new().to_string());
        assert_eq!(to_start_batch(req).unwrap_err().status(), StatusCode::BAD_REQUEST);

        let mut req = valid_request();
        req.recipients = None;
        assert_eq!(to_start_batch(req).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn rejects_invalid_recipient_addresses() {
        let mut req = valid_request();
        req.recipients = Some(vec![RecipientRequest {
            email: "not-an-address".to_string(),
            name: None,
        }]);
        assert_eq!(to_start_batch(req).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn page_params_clamp_and_translate() {
        let params = to_page_params(PageQuery::default()).unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.page_size, 10);
        assert_eq!(params.pagination().offset, 0);

        let params = to_page_params(PageQuery {
            page: Some(3),
            page_size: Some(20),
        })
        .unwrap();
        assert_eq!(params.pagination().limit, 20);
        assert_eq!(params.pagination().offset, 40);

        assert!(to_page_params(PageQuery {
            page: Some(0),
            page_size: None,
        })
        .is_err());
        assert!(to_page_params(PageQuery {
            page: None,
            page_size: Some(101),
        })
        .is_err());
    }

    #[test]
    fn page_meta_math() {
        let params = PageParams { page: 2, page_size: 10 };
        let meta = params.meta(25);
        assert_eq!(meta["total_pages"], 3);
        assert_eq!(meta["has_next"], true);
        assert_eq!(meta["has_previous"], true);

        let meta = PageParams { page: 1, page_size: 10 }.meta(0);
        assert_eq!(meta["total_pages"], 0);
        assert_eq!(meta["has_next"], false);
        assert_eq!(meta["has_previous"], false);
    }
}
