//! In-memory record and attachment stores for deterministic testing.
//!
//! Both stores enforce the same constraints as the PostgreSQL and filesystem
//! implementations, log every call to a shareable [`CallJournal`], and accept
//! injected faults so tests can fail any step of a workflow on purpose.
//!
//! ## Usage
//!
//! ```rust
//! use edupanel_db::memory::{
//!     CallJournal, Fault, MemoryAttachmentStore, MemoryRecordStore, StoreOp,
//! };
//!
//! let journal = CallJournal::new();
//! let records = MemoryRecordStore::new().with_journal(journal.clone());
//! let attachments = MemoryAttachmentStore::new().with_journal(journal.clone());
//!
//! attachments.inject_once(StoreOp::Upload, Fault::fail("bucket unavailable"));
//! ```
//!
//! Fault targets: `Create` matches the new record's parent id (or its name
//! when it has no parent); `Update`, `Get`, and `Delete` match the record id;
//! `Upload` matches the entity id; `AttachmentDelete` and `Exists` match the
//! reference.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use edupanel_core::{
    payloads, AttachmentFile, AttachmentKey, AttachmentStore, Error, ListRecordsRequest, NewRecord,
    Record, RecordKind, RecordPatch, RecordStore, Result,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// JOURNAL & FAULTS
// =============================================================================

/// Store operation, used for journaling and fault targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Update,
    Get,
    Delete,
    List,
    Upload,
    AttachmentDelete,
    Exists,
}

/// One completed store call.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub op: StoreOp,
    pub target: String,
    /// Whether the caller was told the call succeeded.
    pub ok: bool,
}

/// Ordered log of calls shared between stores.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, op: StoreOp, target: &str, ok: bool) {
        lock(&self.entries).push(JournalEntry {
            op,
            target: target.to_string(),
            ok,
        });
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        lock(&self.entries).clone()
    }

    /// Operations in call order.
    pub fn ops(&self) -> Vec<StoreOp> {
        lock(&self.entries).iter().map(|e| e.op).collect()
    }

    /// Index of the first call of `op` on `target`.
    pub fn position(&self, op: StoreOp, target: &str) -> Option<usize> {
        lock(&self.entries)
            .iter()
            .position(|e| e.op == op && e.target == target)
    }

    pub fn count(&self, op: StoreOp) -> usize {
        lock(&self.entries).iter().filter(|e| e.op == op).count()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// Injected misbehavior for a store call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Fail without side effects.
    Fail(String),
    /// Perform the call, then report failure (lost acknowledgement).
    FailAfterApply(String),
    /// Wait before answering normally.
    Delay(Duration),
}

impl Fault {
    pub fn fail(message: impl Into<String>) -> Self {
        Fault::Fail(message.into())
    }

    pub fn fail_after_apply(message: impl Into<String>) -> Self {
        Fault::FailAfterApply(message.into())
    }
}

#[derive(Debug)]
struct FaultRule {
    op: StoreOp,
    target: Option<String>,
    /// `None` keeps the rule forever.
    remaining: Option<usize>,
    fault: Fault,
}

#[derive(Debug, Clone, Default)]
struct Faults {
    rules: Arc<Mutex<Vec<FaultRule>>>,
}

impl Faults {
    fn add(&self, op: StoreOp, target: Option<String>, remaining: Option<usize>, fault: Fault) {
        lock(&self.rules).push(FaultRule {
            op,
            target,
            remaining,
            fault,
        });
    }

    fn take(&self, op: StoreOp, target: &str) -> Option<Fault> {
        let mut rules = lock(&self.rules);
        let idx = rules.iter().position(|r| {
            r.op == op && r.target.as_deref().map_or(true, |t| t == target)
        })?;
        let fault = rules[idx].fault.clone();
        if let Some(remaining) = rules[idx].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                rules.remove(idx);
            }
        }
        Some(fault)
    }

    fn clear(&self) {
        lock(&self.rules).clear();
    }
}

/// What a call should do after consulting the fault rules.
enum Gate {
    Proceed,
    Fail(String),
    ApplyThenFail(String),
}

async fn gate(faults: &Faults, op: StoreOp, target: &str) -> Gate {
    match faults.take(op, target) {
        None => Gate::Proceed,
        Some(Fault::Fail(msg)) => Gate::Fail(msg),
        Some(Fault::FailAfterApply(msg)) => Gate::ApplyThenFail(msg),
        Some(Fault::Delay(delay)) => {
            tokio::time::sleep(delay).await;
            Gate::Proceed
        }
    }
}

/// Finish a call: journal it and turn an injected failure into an error.
fn settle<T>(
    journal: &CallJournal,
    op: StoreOp,
    target: &str,
    gate: Gate,
    result: Result<T>,
) -> Result<T> {
    let result = match (gate, result) {
        (Gate::ApplyThenFail(msg), Ok(_)) => Err(Error::Storage(msg)),
        (_, result) => result,
    };
    journal.record(op, target, result.is_ok());
    result
}

macro_rules! fault_injection_api {
    () => {
        /// Share a call journal with other stores.
        pub fn with_journal(mut self, journal: CallJournal) -> Self {
            self.journal = journal;
            self
        }

        pub fn journal(&self) -> &CallJournal {
            &self.journal
        }

        /// Apply `fault` to every call of `op`.
        pub fn inject(&self, op: StoreOp, fault: Fault) {
            self.faults.add(op, None, None, fault);
        }

        /// Apply `fault` to the next call of `op` only.
        pub fn inject_once(&self, op: StoreOp, fault: Fault) {
            self.faults.add(op, None, Some(1), fault);
        }

        /// Apply `fault` to every call of `op` on `target`.
        pub fn inject_for(&self, op: StoreOp, target: impl ToString, fault: Fault) {
            self.faults.add(op, Some(target.to_string()), None, fault);
        }

        /// Remove all injected faults.
        pub fn clear_faults(&self) {
            self.faults.clear();
        }
    };
}

// =============================================================================
// RECORD STORE
// =============================================================================

#[derive(Debug, Default)]
struct RecordState {
    order: Vec<Uuid>,
    records: HashMap<Uuid, Record>,
}

impl RecordState {
    fn dependent_count(&self, id: Uuid) -> i64 {
        self.records
            .values()
            .filter(|r| r.parent_id == Some(id))
            .count() as i64
    }

    fn check_parent(&self, kind: RecordKind, parent_id: Uuid) -> Result<()> {
        let parent = self.records.get(&parent_id).ok_or_else(|| {
            Error::InvalidInput(format!("parent record {} does not exist", parent_id))
        })?;
        match kind.parent_rule().parent_kind() {
            Some(expected) if expected == parent.kind => Ok(()),
            Some(expected) => Err(Error::InvalidInput(format!(
                "{} parent must be a {}, got {}",
                kind, expected, parent.kind
            ))),
            None => Err(Error::InvalidInput(format!("{} records cannot have a parent", kind))),
        }
    }

    fn check_unique(&self, candidate: &Record) -> Result<()> {
        let taken = self.records.values().any(|r| {
            r.id != candidate.id
                && r.kind == candidate.kind
                && r.parent_id == candidate.parent_id
                && r.name == candidate.name
        });
        if taken {
            return Err(Error::Conflict(format!(
                "a {} named {:?} already exists under this parent",
                candidate.kind, candidate.name
            )));
        }
        Ok(())
    }
}

/// Record store held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    state: Arc<Mutex<RecordState>>,
    faults: Faults,
    journal: CallJournal,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fault_injection_api!();

    /// Read a record without journaling or faults.
    pub fn snapshot(&self, id: Uuid) -> Option<Record> {
        lock(&self.state).records.get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        lock(&self.state).records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn create_now(&self, new: NewRecord) -> Result<Record> {
        new.validate()?;
        let mut state = lock(&self.state);
        if let Some(parent_id) = new.parent_id {
            state.check_parent(new.kind, parent_id)?;
        }

        let now = Utc::now();
        let record = Record {
            id: Uuid::now_v7(),
            kind: new.kind,
            name: new.name,
            parent_id: new.parent_id,
            fields: new.fields,
            attachments: BTreeMap::new(),
            dependent_count: None,
            created_at: now,
            updated_at: now,
        };
        state.check_unique(&record)?;
        state.order.push(record.id);
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn update_now(&self, id: Uuid, patch: &RecordPatch) -> Result<Record> {
        let mut state = lock(&self.state);
        let current = state.records.get(&id).ok_or(Error::RecordNotFound(id))?;

        let mut updated = current.clone();
        patch.apply_to(&mut updated);
        payloads::validate_fields(updated.kind, &updated.name, &updated.fields)?;
        if patch.parent_id.is_some() {
            updated.kind.parent_rule().check(updated.kind, updated.parent_id)?;
            if let Some(parent_id) = updated.parent_id {
                if parent_id == id {
                    return Err(Error::InvalidInput(
                        "a record cannot be its own parent".to_string(),
                    ));
                }
                state.check_parent(updated.kind, parent_id)?;
            }
        }
        state.check_unique(&updated)?;

        updated.updated_at = Utc::now();
        state.records.insert(id, updated.clone());
        Ok(updated)
    }

    fn delete_now(&self, id: Uuid) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.records.contains_key(&id) {
            return Err(Error::RecordNotFound(id));
        }
        let dependents = state.dependent_count(id);
        if dependents > 0 {
            return Err(Error::Conflict(format!(
                "record {} still has {} dependent records",
                id, dependents
            )));
        }
        state.records.remove(&id);
        state.order.retain(|r| *r != id);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, new: NewRecord) -> Result<Record> {
        let target = new
            .parent_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| new.name.clone());
        let gate = gate(&self.faults, StoreOp::Create, &target).await;
        let result = match &gate {
            Gate::Fail(msg) => Err(Error::Storage(msg.clone())),
            _ => self.create_now(new),
        };
        settle(&self.journal, StoreOp::Create, &target, gate, result)
    }

    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<Record> {
        let target = id.to_string();
        let gate = gate(&self.faults, StoreOp::Update, &target).await;
        let result = match &gate {
            Gate::Fail(msg) => Err(Error::Storage(msg.clone())),
            _ => self.update_now(id, &patch),
        };
        settle(&self.journal, StoreOp::Update, &target, gate, result)
    }

    async fn get(&self, id: Uuid, with_dependent_count: bool) -> Result<Record> {
        let target = id.to_string();
        let gate = gate(&self.faults, StoreOp::Get, &target).await;
        let result = match &gate {
            Gate::Fail(msg) => Err(Error::Storage(msg.clone())),
            _ => {
                let state = lock(&self.state);
                state
                    .records
                    .get(&id)
                    .cloned()
                    .map(|mut r| {
                        if with_dependent_count {
                            r.dependent_count = Some(state.dependent_count(id));
                        }
                        r
                    })
                    .ok_or(Error::RecordNotFound(id))
            }
        };
        settle(&self.journal, StoreOp::Get, &target, gate, result)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let target = id.to_string();
        let gate = gate(&self.faults, StoreOp::Delete, &target).await;
        let result = match &gate {
            Gate::Fail(msg) => Err(Error::Storage(msg.clone())),
            _ => self.delete_now(id),
        };
        settle(&self.journal, StoreOp::Delete, &target, gate, result)
    }

    async fn list(&self, req: ListRecordsRequest) -> Result<Vec<Record>> {
        let target = req.name.clone().unwrap_or_default();
        let gate = gate(&self.faults, StoreOp::List, &target).await;
        let result = match &gate {
            Gate::Fail(msg) => Err(Error::Storage(msg.clone())),
            _ => {
                let state = lock(&self.state);
                let offset = req.offset.unwrap_or(0).max(0) as usize;
                let limit = req.limit.map_or(usize::MAX, |l| l.max(0) as usize);
                Ok(state
                    .order
                    .iter()
                    .filter_map(|id| state.records.get(id))
                    .filter(|r| req.matches(r))
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect())
            }
        };
        settle(&self.journal, StoreOp::List, &target, gate, result)
    }
}

// =============================================================================
// ATTACHMENT STORE
// =============================================================================

/// A blob held by [`MemoryAttachmentStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAttachment {
    pub key: AttachmentKey,
    pub file: AttachmentFile,
}

/// Attachment store held in process memory.
///
/// References look like `mem://{kind}/{entity_id}/{subtype}/{uuidv7}`.
#[derive(Debug, Clone, Default)]
pub struct MemoryAttachmentStore {
    objects: Arc<Mutex<BTreeMap<String, StoredAttachment>>>,
    faults: Faults,
    journal: CallJournal,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fault_injection_api!();

    pub fn contains(&self, reference: &str) -> bool {
        lock(&self.objects).contains_key(reference)
    }

    pub fn get(&self, reference: &str) -> Option<StoredAttachment> {
        lock(&self.objects).get(reference).cloned()
    }

    pub fn references(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn upload(&self, key: &AttachmentKey, file: &AttachmentFile) -> Result<String> {
        let target = key.entity_id.to_string();
        let gate = gate(&self.faults, StoreOp::Upload, &target).await;
        let result = match &gate {
            Gate::Fail(msg) => Err(Error::Storage(msg.clone())),
            _ => {
                let reference = format!("mem://{}/{}", key, Uuid::now_v7());
                lock(&self.objects).insert(
                    reference.clone(),
                    StoredAttachment {
                        key: key.clone(),
                        file: file.clone(),
                    },
                );
                Ok(reference)
            }
        };
        settle(&self.journal, StoreOp::Upload, &target, gate, result)
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        let gate = gate(&self.faults, StoreOp::AttachmentDelete, reference).await;
        let result = match &gate {
            Gate::Fail(msg) => Err(Error::Storage(msg.clone())),
            _ => {
                lock(&self.objects).remove(reference);
                Ok(())
            }
        };
        settle(&self.journal, StoreOp::AttachmentDelete, reference, gate, result)
    }

    async fn exists(&self, reference: &str) -> Result<bool> {
        let gate = gate(&self.faults, StoreOp::Exists, reference).await;
        let result = match &gate {
            Gate::Fail(msg) => Err(Error::Storage(msg.clone())),
            _ => Ok(self.contains(reference)),
        };
        settle(&self.journal, StoreOp::Exists, reference, gate, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seed_track(store: &MemoryRecordStore) -> (Record, Record) {
        let category = store
            .create(NewRecord::new(RecordKind::Category, "Science"))
            .await
            .unwrap();
        let track = store
            .create(NewRecord::new(RecordKind::Track, "Physics").with_parent(category.id))
            .await
            .unwrap();
        (category, track)
    }

    #[tokio::test]
    async fn test_create_enforces_parent_rules() {
        let store = MemoryRecordStore::new();
        let err = store
            .create(NewRecord::new(RecordKind::Track, "Orphan"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());

        let err = store
            .create(NewRecord::new(RecordKind::Track, "Ghost").with_parent(Uuid::now_v7()))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());

        let (category, _) = seed_track(&store).await;
        let err = store
            .create(NewRecord::new(RecordKind::Level, "L1").with_parent(category.id))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be a track"));
    }

    #[tokio::test]
    async fn test_create_conflicts_on_duplicate_name_under_parent() {
        let store = MemoryRecordStore::new();
        let (_, track) = seed_track(&store).await;
        store
            .create(NewRecord::new(RecordKind::Level, "L1").with_parent(track.id))
            .await
            .unwrap();
        let err = store
            .create(NewRecord::new(RecordKind::Level, "L1").with_parent(track.id))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_blocked_by_dependents() {
        let store = MemoryRecordStore::new();
        let (category, track) = seed_track(&store).await;

        let fetched = store.get(category.id, true).await.unwrap();
        assert_eq!(fetched.dependent_count, Some(1));

        let err = store.delete(category.id).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.contains(category.id));

        store.delete(track.id).await.unwrap();
        store.delete(category.id).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_validates_merged_fields() {
        let store = MemoryRecordStore::new();
        let institution = store
            .create(NewRecord::new(RecordKind::Institution, "Lycee").with_field("city", "Lyon"))
            .await
            .unwrap();

        let err = store
            .update(institution.id, RecordPatch::new().set_field("website", "not-a-url"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());

        let updated = store
            .update(
                institution.id,
                RecordPatch::new().set_field("website", "https://lycee.example"),
            )
            .await
            .unwrap();
        assert_eq!(updated.fields["city"], json!("Lyon"));
        assert_eq!(updated.fields["website"], json!("https://lycee.example"));
    }

    #[tokio::test]
    async fn test_list_filters_in_creation_order() {
        let store = MemoryRecordStore::new();
        let (_, track) = seed_track(&store).await;
        for name in ["L2", "L1", "L3"] {
            store
                .create(NewRecord::new(RecordKind::Level, name).with_parent(track.id))
                .await
                .unwrap();
        }
        let names: Vec<String> = store
            .list(ListRecordsRequest::of_kind(RecordKind::Level))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["L2", "L1", "L3"]);

        let named = store
            .list(ListRecordsRequest::of_kind(RecordKind::Level).named("L1"))
            .await
            .unwrap();
        assert_eq!(named.len(), 1);
    }

    #[tokio::test]
    async fn test_inject_once_fails_only_next_call() {
        let store = MemoryAttachmentStore::new();
        store.inject_once(StoreOp::Upload, Fault::fail("bucket unavailable"));
        let key = AttachmentKey::new(RecordKind::Ad, Uuid::now_v7(), "banner");
        let file = AttachmentFile::new("banner.png", "image/png", vec![1, 2, 3]);

        assert!(store.upload(&key, &file).await.is_err());
        let reference = store.upload(&key, &file).await.unwrap();
        assert!(store.exists(&reference).await.unwrap());
        assert_eq!(store.journal().count(StoreOp::Upload), 2);
    }

    #[tokio::test]
    async fn test_fail_after_apply_performs_the_write() {
        let store = MemoryRecordStore::new();
        let category = store
            .create(NewRecord::new(RecordKind::Category, "Arts"))
            .await
            .unwrap();
        store.inject_for(StoreOp::Update, category.id, Fault::fail_after_apply("ack lost"));

        let err = store
            .update(category.id, RecordPatch::new().link_attachment("icon", "mem://icon"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(
            store.snapshot(category.id).unwrap().attachment_ref("icon"),
            Some("mem://icon")
        );
    }

    #[tokio::test]
    async fn test_attachment_delete_is_idempotent() {
        let store = MemoryAttachmentStore::new();
        store.delete("mem://nothing").await.unwrap();
        assert!(!store.exists("mem://nothing").await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_journal_orders_calls_across_stores() {
        let journal = CallJournal::new();
        let records = MemoryRecordStore::new().with_journal(journal.clone());
        let attachments = MemoryAttachmentStore::new().with_journal(journal.clone());

        let ad = records
            .create(
                NewRecord::new(RecordKind::Ad, "Promo")
                    .with_field("target_url", "https://x.example"),
            )
            .await
            .unwrap();
        let key = AttachmentKey::new(RecordKind::Ad, ad.id, "banner");
        attachments
            .upload(&key, &AttachmentFile::new("b.png", "image/png", vec![1]))
            .await
            .unwrap();

        assert_eq!(journal.ops(), vec![StoreOp::Create, StoreOp::Upload]);
    }
}
