//! Batch dispatch engine: the lifecycle manager that authorizes windows of
//! work and the single worker that delivers them.

pub mod error;
pub mod manager;
pub mod worker;

pub use error::{DispatchError, DispatchResult};
pub use manager::{
    BatchDraft, BatchManager, BatchOverview, BatchProgress, BatchSnapshot, BatchSource, Schedule,
    StartBatch, UploadWithBatch,
};
pub use worker::{DispatchWorker, WorkerConfig, WorkerHandle};
