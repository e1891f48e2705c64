//! Parent-protected deletion.
//!
//! A record is deleted only when it has no dependent records. The record
//! store's own constraint is the final backstop for the race between the
//! check and the delete.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use edupanel_core::{AttachmentStore, Error, ListRecordsRequest, Record, RecordKind, RecordStore};

use crate::batch::fan_out;
use crate::cancel::CancelSignal;
use crate::config::SagaConfig;
use crate::outcome::{BatchResult, SagaError};
use crate::saga::{call, detached};

/// A deleted record and the attachments that could not be released.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletedRecord {
    pub record: Record,
    /// References the record held whose delete failed. Left for cleanup.
    pub unreleased_attachments: Vec<String>,
}

#[derive(Clone)]
pub struct DeletionGuard {
    records: Arc<dyn RecordStore>,
    attachments: Arc<dyn AttachmentStore>,
    config: SagaConfig,
}

impl DeletionGuard {
    pub fn new(records: Arc<dyn RecordStore>, attachments: Arc<dyn AttachmentStore>) -> Self {
        Self {
            records,
            attachments,
            config: SagaConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    /// Delete a record unless it has dependents, then release its attachments.
    ///
    /// Attachment deletes are best-effort: failures are logged and listed in
    /// [`DeletedRecord::unreleased_attachments`].
    #[instrument(
        skip(self),
        fields(
            subsystem = "saga",
            component = "deletion_guard",
            op = "delete_protected",
            record_id = %id
        )
    )]
    pub async fn delete_protected(&self, id: Uuid) -> Result<DeletedRecord, SagaError> {
        let guard = self.clone();
        detached(guard.run_delete(id), |detail| Err(SagaError::Internal { detail })).await
    }

    async fn run_delete(self, id: Uuid) -> Result<DeletedRecord, SagaError> {
        let timeout = self.config.call_timeout;

        let record = call(timeout, "record get", self.records.get(id, true))
            .await
            .map_err(|e| SagaError::from_store(e, SagaError::store))?;

        let dependents = record.dependent_count.unwrap_or(0);
        if dependents > 0 {
            debug!(dependents, "Delete blocked by dependent records");
            return Err(SagaError::conflict(
                format!("{} {:?} has {} dependent records", record.kind, record.name, dependents),
                Some(dependents),
            ));
        }

        call(timeout, "record delete", self.records.delete(id))
            .await
            .map_err(|e| match e {
                Error::Conflict(detail) => SagaError::conflict(detail, None),
                other => SagaError::from_store(other, SagaError::store),
            })?;

        let mut unreleased = Vec::new();
        for reference in record.attachments.values() {
            let delete = self.attachments.delete(reference);
            if let Err(e) = call(timeout, "attachment delete", delete).await {
                warn!(
                    reference = %reference,
                    error = %e,
                    "Failed to release attachment of deleted record"
                );
                unreleased.push(reference.clone());
            }
        }

        info!(
            kind = %record.kind,
            released = record.attachments.len() - unreleased.len(),
            "Record deleted"
        );
        Ok(DeletedRecord {
            record,
            unreleased_attachments: unreleased,
        })
    }

    /// Delete every `kind` record named `name`, each independently.
    ///
    /// Fails as a whole only if the group cannot be listed or `cancel` has
    /// already fired. A name with no records yields an empty result.
    #[instrument(
        skip(self, cancel),
        fields(
            subsystem = "saga",
            component = "deletion_guard",
            op = "delete_group",
            kind = %kind
        )
    )]
    pub async fn delete_group(
        &self,
        kind: RecordKind,
        name: &str,
        cancel: &CancelSignal,
    ) -> Result<BatchResult<DeletedRecord>, SagaError> {
        if cancel.is_cancelled() {
            return Err(SagaError::Cancelled);
        }

        let members = call(
            self.config.call_timeout,
            "record list",
            self.records.list(ListRecordsRequest::of_kind(kind).named(name)),
        )
        .await
        .map_err(|e| SagaError::from_store(e, SagaError::store))?;
        let ids: Vec<Uuid> = members.iter().map(|r| r.id).collect();
        debug!(members = ids.len(), "Deleting group");

        // Members run detached: a dropped caller must not stop a delete
        // between the record and its attachments.
        let result = fan_out(&ids, self.config.batch_max_concurrent, cancel, |id| {
            let guard = self.clone();
            async move { guard.delete_protected(id).await }
        })
        .await;

        if result.is_complete_success() {
            info!(deleted = result.succeeded.len(), "Group deleted");
        } else {
            warn!(
                deleted = result.succeeded.len(),
                failed = result.failed.len(),
                "Group partially deleted"
            );
        }
        Ok(result)
    }
}
