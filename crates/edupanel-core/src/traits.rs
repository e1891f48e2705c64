//! Store contracts consumed by the edupanel workflows.
//!
//! The record store and the attachment store are separate systems that
//! cannot be updated atomically. Every call may fail, time out, or succeed
//! without the caller hearing about it.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// RECORD STORE
// =============================================================================

/// Persistence for typed content records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record. The store assigns the id.
    ///
    /// Fails with `InvalidInput` for a missing or wrong-kind parent and
    /// `Conflict` when `(kind, parent_id, name)` is already taken.
    async fn create(&self, new: NewRecord) -> Result<Record>;

    /// Apply a partial update and return the updated record.
    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<Record>;

    /// Fetch a record, optionally counting its child records.
    ///
    /// Returns `Error::RecordNotFound` if no record has this id.
    async fn get(&self, id: Uuid, with_dependent_count: bool) -> Result<Record>;

    /// Delete a record.
    ///
    /// Must independently fail with `Conflict` while child records exist.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// List records matching the filter, in creation order.
    async fn list(&self, req: ListRecordsRequest) -> Result<Vec<Record>>;
}

// =============================================================================
// ATTACHMENT STORE
// =============================================================================

/// Storage for opaque binary attachments addressed by reference.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Store the bytes under `key` and return a durable reference.
    ///
    /// Each call mints a new reference, even for the same key.
    async fn upload(&self, key: &AttachmentKey, file: &AttachmentFile) -> Result<String>;

    /// Remove the attachment. Deleting an unknown reference is not an error.
    async fn delete(&self, reference: &str) -> Result<()>;

    /// Check whether a reference resolves to stored bytes.
    async fn exists(&self, reference: &str) -> Result<bool>;
}
