//! Attachment saga: keep a record and its externally stored attachment
//! consistent across two stores that cannot be updated atomically.
//!
//! # Create
//!
//! 1. create the record
//! 2. upload the file under `(kind, record.id, subtype)`
//! 3. link the returned reference on the record
//!
//! An upload failure deletes the record. A link failure deletes the upload,
//! then the record.
//!
//! # Update
//!
//! 1. apply the field patch
//! 2. upload the new file
//! 3. link the new reference
//! 4. delete the superseded attachment
//!
//! The field patch is never rolled back. The old attachment is only deleted
//! once the record no longer references it.
//!
//! A link call that reports failure may still have committed (for example
//! when it timed out). Before compensating, the saga re-reads the record and
//! treats a record that already points at the new upload as linked.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use edupanel_core::{
    check_attachment, payloads, AttachmentFile, AttachmentKey, AttachmentSlot, AttachmentStore,
    Error, NewRecord, Record, RecordKind, RecordPatch, RecordStore, Result,
};

use crate::cancel::CancelSignal;
use crate::config::SagaConfig;
use crate::outcome::{Orphan, SagaError, SagaOutcome, SagaStage};

/// Run a collaborator call with the configured timeout.
///
/// Expiry is reported as [`Error::Timeout`] and handled like any other failure.
pub(crate) async fn call<T>(
    timeout: Duration,
    op: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "{} did not answer within {}ms",
            op,
            timeout.as_millis()
        ))),
    }
}

/// Run a workflow body on its own task so a dropped caller cannot stop it
/// between steps.
pub(crate) async fn detached<T, F>(fut: F, on_panic: impl FnOnce(String) -> T) -> T
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    match tokio::spawn(fut.in_current_span()).await {
        Ok(value) => value,
        Err(e) => {
            error!(subsystem = "saga", error = %e, "Workflow task failed");
            on_panic(e.to_string())
        }
    }
}

/// What a re-read after a failed link call found.
enum LinkCheck {
    Committed(Record),
    NotCommitted,
    Unknown(String),
}

/// Create and update workflows for one attachment slot of one record kind.
#[derive(Clone)]
pub struct AttachmentSaga {
    records: Arc<dyn RecordStore>,
    attachments: Arc<dyn AttachmentStore>,
    kind: RecordKind,
    slot: Option<&'static AttachmentSlot>,
    config: SagaConfig,
}

impl AttachmentSaga {
    /// Saga for the first attachment slot of `kind`, or for no slot if the
    /// kind has none.
    pub fn new(
        records: Arc<dyn RecordStore>,
        attachments: Arc<dyn AttachmentStore>,
        kind: RecordKind,
    ) -> Self {
        Self {
            records,
            attachments,
            kind,
            slot: kind.slots().first(),
            config: SagaConfig::default(),
        }
    }

    /// Select a different slot of the same kind.
    pub fn with_subtype(mut self, subtype: &str) -> std::result::Result<Self, SagaError> {
        let slot = self.kind.slot(subtype).ok_or_else(|| {
            SagaError::validation(format!("{} records have no {:?} attachment", self.kind, subtype))
        })?;
        self.slot = Some(slot);
        Ok(self)
    }

    pub fn with_config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn subtype(&self) -> Option<&'static str> {
        self.slot.map(|s| s.subtype)
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    fn check_file(&self, file: Option<&AttachmentFile>) -> std::result::Result<(), SagaError> {
        let Some(file) = file else {
            return Ok(());
        };
        if self.slot.is_none() {
            return Err(SagaError::validation(format!(
                "{} records do not take attachments",
                self.kind
            )));
        }
        check_attachment(file, self.config.max_attachment_bytes)
            .map_err(|e| SagaError::validation(e.to_string()))
    }

    // =========================================================================
    // CREATE
    // =========================================================================

    /// Create a record and, if `file` is given, attach it.
    #[instrument(
        skip(self, new, file, cancel),
        fields(
            subsystem = "saga",
            component = "attachment_saga",
            op = "create",
            kind = %self.kind,
            subtype = self.subtype().unwrap_or("-")
        )
    )]
    pub async fn create_with_attachment(
        &self,
        new: NewRecord,
        file: Option<AttachmentFile>,
        cancel: &CancelSignal,
    ) -> SagaOutcome {
        if cancel.is_cancelled() {
            return SagaOutcome::failed(SagaError::Cancelled);
        }
        if let Err(error) = self.check_create(&new, file.as_ref()) {
            debug!(error = %error, "Create rejected before any side effect");
            return SagaOutcome::failed(error);
        }

        let saga = self.clone();
        detached(saga.run_create(new, file), |detail| SagaOutcome::Failed {
            error: SagaError::Internal { detail },
            compensated: false,
        })
        .await
    }

    fn check_create(
        &self,
        new: &NewRecord,
        file: Option<&AttachmentFile>,
    ) -> std::result::Result<(), SagaError> {
        if new.kind != self.kind {
            return Err(SagaError::validation(format!(
                "saga for {} records cannot create a {}",
                self.kind, new.kind
            )));
        }
        new.validate().map_err(|e| SagaError::from_store(e, SagaError::validation))?;
        if let Some(slot) = self.slot {
            if slot.required && file.is_none() {
                return Err(SagaError::validation(format!(
                    "{} records require a {} attachment",
                    self.kind, slot.subtype
                )));
            }
        }
        self.check_file(file)
    }

    async fn run_create(self, new: NewRecord, file: Option<AttachmentFile>) -> SagaOutcome {
        let timeout = self.config.call_timeout;

        let record = match call(timeout, "record create", self.records.create(new)).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Record create failed");
                return SagaOutcome::failed(SagaError::from_store(e, SagaError::store));
            }
        };
        let record_id = record.id;
        debug!(record_id = %record_id, "Record created");

        let (Some(file), Some(slot)) = (file, self.slot) else {
            info!(record_id = %record_id, "Record created without attachment");
            return SagaOutcome::Success { record };
        };

        let key = AttachmentKey::new(self.kind, record_id, slot.subtype);
        let upload = self.attachments.upload(&key, &file);
        let reference = match call(timeout, "attachment upload", upload).await {
            Ok(reference) => reference,
            Err(e) => {
                warn!(record_id = %record_id, error = %e, "Upload failed, removing record");
                return self.compensate_upload(record_id, e.to_string()).await;
            }
        };
        debug!(record_id = %record_id, reference = %reference, "Attachment uploaded");

        let patch = RecordPatch::new().link_attachment(slot.subtype, reference.clone());
        match call(timeout, "record link", self.records.update(record_id, patch)).await {
            Ok(record) => {
                info!(
                    record_id = %record_id,
                    reference = %reference,
                    "Record created with attachment"
                );
                SagaOutcome::Success { record }
            }
            Err(e) => {
                let cause = e.to_string();
                match self.check_link(record_id, slot.subtype, &reference).await {
                    LinkCheck::Committed(record) => {
                        warn!(
                            record_id = %record_id,
                            reference = %reference,
                            error = %cause,
                            "Link reported failure but committed"
                        );
                        SagaOutcome::Success { record }
                    }
                    LinkCheck::NotCommitted => {
                        warn!(
                            record_id = %record_id,
                            reference = %reference,
                            error = %cause,
                            "Link failed, removing upload and record"
                        );
                        self.compensate_create_link(record_id, reference, cause).await
                    }
                    LinkCheck::Unknown(detail) => {
                        let orphans =
                            vec![Orphan::Attachment(reference), Orphan::Record(record_id)];
                        self.escalate(SagaStage::Link, cause, detail, orphans)
                    }
                }
            }
        }
    }

    async fn compensate_upload(&self, record_id: Uuid, cause: String) -> SagaOutcome {
        match self.delete_record(record_id).await {
            Ok(()) => SagaOutcome::failed(SagaError::Upload { detail: cause }),
            Err(e) => self.escalate(
                SagaStage::Upload,
                cause,
                e.to_string(),
                vec![Orphan::Record(record_id)],
            ),
        }
    }

    async fn compensate_create_link(
        &self,
        record_id: Uuid,
        reference: String,
        cause: String,
    ) -> SagaOutcome {
        let mut orphans = Vec::new();
        let mut failures = Vec::new();

        if let Err(e) = self.delete_attachment(&reference).await {
            failures.push(format!("attachment delete: {}", e));
            orphans.push(Orphan::Attachment(reference));
        }
        if let Err(e) = self.delete_record(record_id).await {
            failures.push(format!("record delete: {}", e));
            orphans.push(Orphan::Record(record_id));
        }

        if orphans.is_empty() {
            SagaOutcome::failed(SagaError::Link { detail: cause })
        } else {
            self.escalate(SagaStage::Link, cause, failures.join("; "), orphans)
        }
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    /// Apply `patch` and, if `file` is given, swap in a new attachment.
    ///
    /// The patch may not touch attachment links; the saga owns them.
    #[instrument(
        skip(self, patch, file, cancel),
        fields(
            subsystem = "saga",
            component = "attachment_saga",
            op = "update",
            kind = %self.kind,
            subtype = self.subtype().unwrap_or("-"),
            record_id = %id
        )
    )]
    pub async fn update_with_attachment(
        &self,
        id: Uuid,
        patch: RecordPatch,
        file: Option<AttachmentFile>,
        cancel: &CancelSignal,
    ) -> SagaOutcome {
        if cancel.is_cancelled() {
            return SagaOutcome::failed(SagaError::Cancelled);
        }
        if patch.touches_attachments() {
            return SagaOutcome::failed(SagaError::validation(
                "attachment links are managed by the saga and cannot be patched",
            ));
        }
        if let Err(error) = self.check_file(file.as_ref()) {
            debug!(error = %error, "Update rejected before any side effect");
            return SagaOutcome::failed(error);
        }

        let saga = self.clone();
        detached(saga.run_update(id, patch, file), |detail| SagaOutcome::Failed {
            error: SagaError::Internal { detail },
            compensated: false,
        })
        .await
    }

    /// Upload a new attachment for an existing record, leaving its fields alone.
    ///
    /// Retries the attachment step after a `PartialSuccess`.
    pub async fn replace_attachment(
        &self,
        id: Uuid,
        file: AttachmentFile,
        cancel: &CancelSignal,
    ) -> SagaOutcome {
        self.update_with_attachment(id, RecordPatch::new(), Some(file), cancel).await
    }

    fn check_patch(
        &self,
        current: &Record,
        patch: &RecordPatch,
    ) -> std::result::Result<(), SagaError> {
        if current.kind != self.kind {
            return Err(SagaError::validation(format!(
                "record {} is a {}, not a {}",
                current.id, current.kind, self.kind
            )));
        }
        if let Some(parent_id) = patch.parent_id {
            self.kind
                .parent_rule()
                .check(self.kind, parent_id)
                .map_err(|e| SagaError::from_store(e, SagaError::validation))?;
        }
        let name = patch.name.as_deref().unwrap_or(&current.name);
        payloads::validate_fields(self.kind, name, &patch.merged_fields(&current.fields))
            .map_err(|e| SagaError::from_store(e, SagaError::validation))
    }

    async fn run_update(
        self,
        id: Uuid,
        patch: RecordPatch,
        file: Option<AttachmentFile>,
    ) -> SagaOutcome {
        let timeout = self.config.call_timeout;

        let current = match call(timeout, "record get", self.records.get(id, false)).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Record lookup failed");
                return SagaOutcome::failed(SagaError::from_store(e, SagaError::store));
            }
        };
        if let Err(error) = self.check_patch(&current, &patch) {
            return SagaOutcome::failed(error);
        }

        let fields_committed = !patch.is_empty();
        let record = if fields_committed {
            match call(timeout, "record update", self.records.update(id, patch)).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Record update failed");
                    return SagaOutcome::failed(SagaError::from_store(e, SagaError::store));
                }
            }
        } else {
            current
        };

        let (Some(file), Some(slot)) = (file, self.slot) else {
            info!("Record updated");
            return SagaOutcome::Success { record };
        };

        let previous = record.attachment_ref(slot.subtype).map(str::to_owned);
        let key = AttachmentKey::new(self.kind, id, slot.subtype);
        let upload = self.attachments.upload(&key, &file);
        let reference = match call(timeout, "attachment upload", upload).await {
            Ok(reference) => reference,
            Err(e) => {
                let error = SagaError::Upload {
                    detail: e.to_string(),
                };
                warn!(error = %e, "Upload failed, attachment unchanged");
                return if fields_committed {
                    SagaOutcome::PartialSuccess { record, error }
                } else {
                    SagaOutcome::failed(error)
                };
            }
        };
        debug!(reference = %reference, "Attachment uploaded");

        let link = RecordPatch::new().link_attachment(slot.subtype, reference.clone());
        let record = match call(timeout, "record link", self.records.update(id, link)).await {
            Ok(record) => record,
            Err(e) => {
                let cause = e.to_string();
                match self.check_link(id, slot.subtype, &reference).await {
                    LinkCheck::Committed(record) => {
                        warn!(
                            reference = %reference,
                            error = %cause,
                            "Link reported failure but committed"
                        );
                        record
                    }
                    LinkCheck::NotCommitted => {
                        warn!(
                            reference = %reference,
                            error = %cause,
                            "Link failed, removing new upload"
                        );
                        return match self.delete_attachment(&reference).await {
                            Ok(()) => SagaOutcome::failed(SagaError::Link { detail: cause }),
                            Err(de) => self.escalate(
                                SagaStage::Link,
                                cause,
                                format!("attachment delete: {}", de),
                                vec![Orphan::Attachment(reference)],
                            ),
                        };
                    }
                    LinkCheck::Unknown(detail) => {
                        return self.escalate(
                            SagaStage::Link,
                            cause,
                            detail,
                            vec![Orphan::Attachment(reference)],
                        );
                    }
                }
            }
        };

        if let Some(old) = previous.filter(|old| *old != reference) {
            match self.delete_attachment(&old).await {
                Ok(()) => debug!(reference = %old, "Superseded attachment deleted"),
                Err(e) => {
                    warn!(reference = %old, error = %e, "Failed to delete superseded attachment")
                }
            }
        }

        info!(reference = %reference, "Record updated with new attachment");
        SagaOutcome::Success { record }
    }

    // =========================================================================
    // SHARED STEPS
    // =========================================================================

    async fn check_link(&self, record_id: Uuid, subtype: &str, reference: &str) -> LinkCheck {
        let get = self.records.get(record_id, false);
        match call(self.config.call_timeout, "record get", get).await {
            Ok(record) if record.attachment_ref(subtype) == Some(reference) => {
                LinkCheck::Committed(record)
            }
            Ok(_) => LinkCheck::NotCommitted,
            Err(Error::RecordNotFound(_)) => LinkCheck::NotCommitted,
            Err(e) => LinkCheck::Unknown(format!("link state unknown, re-read failed: {}", e)),
        }
    }

    async fn delete_record(&self, record_id: Uuid) -> Result<()> {
        let delete = self.records.delete(record_id);
        match call(self.config.call_timeout, "record delete", delete).await {
            Err(Error::RecordNotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn delete_attachment(&self, reference: &str) -> Result<()> {
        let delete = self.attachments.delete(reference);
        call(self.config.call_timeout, "attachment delete", delete).await
    }

    fn escalate(
        &self,
        stage: SagaStage,
        cause: String,
        detail: String,
        orphans: Vec<Orphan>,
    ) -> SagaOutcome {
        error!(
            stage = %stage,
            cause = %cause,
            detail = %detail,
            orphans = ?orphans,
            "Compensation failed, manual cleanup required"
        );
        SagaOutcome::Failed {
            error: SagaError::Compensation {
                stage,
                cause,
                detail,
                orphans,
            },
            compensated: false,
        }
    }
}
