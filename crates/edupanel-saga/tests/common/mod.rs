//! Shared fixtures for saga integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use edupanel_db::memory::{CallJournal, MemoryAttachmentStore, MemoryRecordStore};
use edupanel_db::{AttachmentFile, NewRecord, Record, RecordKind, RecordStore};
use edupanel_saga::{AttachmentSaga, BatchCoordinator, DeletionGuard, SagaConfig};

/// In-memory stores sharing one call journal.
pub struct Harness {
    pub journal: CallJournal,
    pub records: MemoryRecordStore,
    pub attachments: MemoryAttachmentStore,
    pub config: SagaConfig,
}

impl Harness {
    pub fn new() -> Self {
        let journal = CallJournal::new();
        Self {
            records: MemoryRecordStore::new().with_journal(journal.clone()),
            attachments: MemoryAttachmentStore::new().with_journal(journal.clone()),
            journal,
            config: SagaConfig::default().with_call_timeout(Duration::from_secs(5)),
        }
    }

    pub fn with_config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn saga(&self, kind: RecordKind) -> AttachmentSaga {
        AttachmentSaga::new(
            Arc::new(self.records.clone()),
            Arc::new(self.attachments.clone()),
            kind,
        )
        .with_config(self.config.clone())
    }

    pub fn coordinator(&self, kind: RecordKind) -> BatchCoordinator {
        BatchCoordinator::new(self.saga(kind))
    }

    pub fn guard(&self) -> DeletionGuard {
        DeletionGuard::new(
            Arc::new(self.records.clone()),
            Arc::new(self.attachments.clone()),
        )
        .with_config(self.config.clone())
    }

    /// Create a record directly in the store.
    pub async fn seed(&self, new: NewRecord) -> Record {
        self.records.create(new).await.expect("seed record")
    }

    pub async fn seed_category(&self, name: &str) -> Record {
        self.seed(NewRecord::new(RecordKind::Category, name)).await
    }

    pub async fn seed_track(&self, category: &Record, name: &str) -> Record {
        self.seed(NewRecord::new(RecordKind::Track, name).with_parent(category.id)).await
    }

    pub async fn seed_level(&self, track: &Record, name: &str) -> Record {
        self.seed(NewRecord::new(RecordKind::Level, name).with_parent(track.id)).await
    }

    /// Category -> track -> level chain, returning the level.
    pub async fn seed_level_chain(&self) -> Record {
        let category = self.seed_category("Sciences").await;
        let track = self.seed_track(&category, "Physics").await;
        self.seed_level(&track, "Terminale").await
    }
}

pub fn exam(level: &Record, name: &str) -> NewRecord {
    NewRecord::new(RecordKind::Exam, name)
        .with_parent(level.id)
        .with_field("year", 2025)
}

pub fn institution(name: &str) -> NewRecord {
    NewRecord::new(RecordKind::Institution, name).with_field("city", "Lyon")
}

pub fn pdf(name: &str) -> AttachmentFile {
    AttachmentFile::new(name, "application/pdf", b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n1 0 obj\n".to_vec())
}

pub fn png(name: &str) -> AttachmentFile {
    AttachmentFile::new(
        name,
        "image/png",
        vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D],
    )
}
