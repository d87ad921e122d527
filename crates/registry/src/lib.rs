//! `mailforge-registry` — durable storage for uploads, batches, and
//! recipient rows.
//!
//! The [`BatchRegistry`] trait is the seam; [`InMemoryRegistry`] backs
//! tests and dev, [`PostgresRegistry`] backs production.

pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use memory::InMemoryRegistry;
pub use model::{
    Batch, BatchSettings, BatchStatus, EmailRecord, NewBatch, NewUpload, Paged, Pagination, Upload,
    UploadStatus,
};
pub use postgres::PostgresRegistry;
pub use store::{BatchRegistry, RegistryError};
