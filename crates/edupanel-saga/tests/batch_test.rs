//! Batch association tests.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Harness;
use edupanel_db::memory::{Fault, MemoryAttachmentStore, MemoryRecordStore, StoreOp};
use edupanel_db::{
    ListRecordsRequest, NewRecord, Record, RecordKind, RecordPatch, RecordStore, Result,
};
use edupanel_saga::{AttachmentSaga, BatchCoordinator, CancelSignal, SagaConfig, SagaError};
use uuid::Uuid;

async fn seed_tracks(h: &Harness, n: usize) -> Vec<Uuid> {
    let category = h.seed_category("Sciences").await;
    let mut ids = Vec::new();
    for i in 0..n {
        ids.push(h.seed_track(&category, &format!("Track {}", i)).await.id);
    }
    ids
}

#[tokio::test]
async fn test_one_failure_does_not_affect_siblings() {
    let h = Harness::new();
    let tracks = seed_tracks(&h, 5).await;
    h.records
        .inject_for(StoreOp::Create, tracks[2], Fault::fail("connection reset"));

    let result = h
        .coordinator(RecordKind::Level)
        .associate_many(&NewRecord::new(RecordKind::Level, "L1"), &tracks, &CancelSignal::never())
        .await;

    assert_eq!(result.succeeded.len(), 4);
    let parents: Vec<Option<Uuid>> = result.succeeded.iter().map(|r| r.parent_id).collect();
    assert_eq!(
        parents,
        vec![Some(tracks[0]), Some(tracks[1]), Some(tracks[3]), Some(tracks[4])]
    );
    assert!(result.succeeded.iter().all(|r| r.name == "L1"));
    assert_eq!(result.failed_targets(), vec![tracks[2]]);
    assert!(matches!(result.failed[0].error, SagaError::Store { .. }));

    let stored = h
        .records
        .list(ListRecordsRequest::of_kind(RecordKind::Level).named("L1"))
        .await
        .unwrap();
    assert_eq!(stored.len(), 4);
}

#[tokio::test]
async fn test_existing_name_under_one_parent_is_conflict() {
    let h = Harness::new();
    let tracks = seed_tracks(&h, 3).await;
    h.seed(NewRecord::new(RecordKind::Level, "L1").with_parent(tracks[1])).await;

    let result = h
        .coordinator(RecordKind::Level)
        .associate_many(&NewRecord::new(RecordKind::Level, "L1"), &tracks, &CancelSignal::never())
        .await;

    assert_eq!(result.succeeded.len(), 2);
    assert_eq!(result.failed_targets(), vec![tracks[1]]);
    assert!(matches!(result.failed[0].error, SagaError::Conflict { .. }));
}

#[tokio::test]
async fn test_base_parent_is_replaced_per_target() {
    let h = Harness::new();
    let tracks = seed_tracks(&h, 2).await;
    let base = NewRecord::new(RecordKind::Level, "L2")
        .with_parent(tracks[0])
        .with_field("position", 2);

    let result = h
        .coordinator(RecordKind::Level)
        .associate_many(&base, &tracks[1..], &CancelSignal::never())
        .await;

    assert!(result.is_complete_success());
    assert_eq!(result.succeeded[0].parent_id, Some(tracks[1]));
    assert_eq!(result.succeeded[0].fields["position"], 2);
    assert_eq!(base.parent_id, Some(tracks[0]));
}

#[tokio::test]
async fn test_empty_target_list() {
    let h = Harness::new();
    let result = h
        .coordinator(RecordKind::Level)
        .associate_many(&NewRecord::new(RecordKind::Level, "L1"), &[], &CancelSignal::never())
        .await;
    assert_eq!(result.total(), 0);
}

#[tokio::test]
async fn test_cancelled_batch_dispatches_nothing() {
    let h = Harness::new();
    let tracks = seed_tracks(&h, 3).await;
    h.journal.clear();
    let (handle, cancel) = CancelSignal::new();
    handle.cancel();

    let result = h
        .coordinator(RecordKind::Level)
        .associate_many(&NewRecord::new(RecordKind::Level, "L1"), &tracks, &cancel)
        .await;

    assert!(result.succeeded.is_empty());
    assert_eq!(result.failed_targets(), tracks);
    assert!(result.failed.iter().all(|f| f.error == SagaError::Cancelled));
    assert_eq!(h.journal.count(StoreOp::Create), 0);
}

/// Record store that tracks how many creates are in flight.
struct CountingStore {
    inner: MemoryRecordStore,
    in_flight: AtomicUsize,
    max_seen: AtomicUsize,
}

#[async_trait]
impl RecordStore for CountingStore {
    async fn create(&self, new: NewRecord) -> Result<Record> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = self.inner.create(new).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<Record> {
        self.inner.update(id, patch).await
    }

    async fn get(&self, id: Uuid, with_dependent_count: bool) -> Result<Record> {
        self.inner.get(id, with_dependent_count).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn list(&self, req: ListRecordsRequest) -> Result<Vec<Record>> {
        self.inner.list(req).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let h = Harness::new();
    let tracks = seed_tracks(&h, 10).await;
    let store = Arc::new(CountingStore {
        inner: h.records.clone(),
        in_flight: AtomicUsize::new(0),
        max_seen: AtomicUsize::new(0),
    });

    let saga = AttachmentSaga::new(
        store.clone(),
        Arc::new(MemoryAttachmentStore::new()),
        RecordKind::Level,
    )
    .with_config(SagaConfig::default().with_batch_max_concurrent(3));
    let result = BatchCoordinator::new(saga)
        .associate_many(&NewRecord::new(RecordKind::Level, "L1"), &tracks, &CancelSignal::never())
        .await;

    assert_eq!(result.succeeded.len(), 10);
    assert_eq!(store.max_seen.load(Ordering::SeqCst), 3);
    let parents: Vec<Option<Uuid>> = result.succeeded.iter().map(|r| r.parent_id).collect();
    assert_eq!(parents, tracks.iter().copied().map(Some).collect::<Vec<_>>());
}
