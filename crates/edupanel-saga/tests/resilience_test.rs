//! Timeouts, cancellation, lost acknowledgements, and abandoned callers.

mod common;

use std::time::Duration;

use common::{institution, png, Harness};
use edupanel_db::memory::{Fault, StoreOp};
use edupanel_db::{ListRecordsRequest, RecordKind, RecordStore};
use edupanel_saga::{CancelSignal, Orphan, SagaConfig, SagaError, SagaOutcome, SagaStage};

fn fast_timeouts() -> SagaConfig {
    SagaConfig::default().with_call_timeout(Duration::from_secs(2))
}

#[tokio::test(start_paused = true)]
async fn test_upload_timeout_compensates_record() {
    let h = Harness::new().with_config(fast_timeouts());
    h.attachments
        .inject(StoreOp::Upload, Fault::Delay(Duration::from_secs(60)));

    let outcome = h
        .saga(RecordKind::Institution)
        .create_with_attachment(
            institution("Lycee Hoche"),
            Some(png("logo.png")),
            &CancelSignal::never(),
        )
        .await;

    match outcome {
        SagaOutcome::Failed {
            error: SagaError::Upload { detail },
            compensated: true,
        } => assert!(detail.contains("did not answer"), "{}", detail),
        other => panic!("expected compensated upload failure, got {:?}", other),
    }
    assert!(h.records.is_empty());
    assert!(h.attachments.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_create_timeout_is_store_failure() {
    let h = Harness::new().with_config(fast_timeouts());
    h.records
        .inject(StoreOp::Create, Fault::Delay(Duration::from_secs(60)));

    let outcome = h
        .saga(RecordKind::Institution)
        .create_with_attachment(
            institution("Lycee Hoche"),
            Some(png("logo.png")),
            &CancelSignal::never(),
        )
        .await;

    assert!(matches!(
        outcome,
        SagaOutcome::Failed { error: SagaError::Store { .. }, compensated: true }
    ));
    assert_eq!(h.journal.count(StoreOp::Upload), 0);
}

#[tokio::test]
async fn test_link_that_committed_despite_error_is_kept() {
    let h = Harness::new();
    h.records
        .inject_once(StoreOp::Update, Fault::fail_after_apply("acknowledgement lost"));

    let outcome = h
        .saga(RecordKind::Institution)
        .create_with_attachment(
            institution("Lycee Hoche"),
            Some(png("logo.png")),
            &CancelSignal::never(),
        )
        .await;

    let record = outcome.into_result().unwrap();
    let reference = record.attachment_ref("logo").unwrap();
    assert!(h.attachments.contains(reference));
    assert!(h.records.contains(record.id));
    assert_eq!(h.journal.count(StoreOp::AttachmentDelete), 0);
    assert_eq!(h.journal.count(StoreOp::Delete), 0);
}

#[tokio::test]
async fn test_unreadable_link_state_deletes_nothing() {
    let h = Harness::new();
    h.records
        .inject_once(StoreOp::Update, Fault::fail("deadlock detected"));
    h.records.inject(StoreOp::Get, Fault::fail("connection reset"));

    let outcome = h
        .saga(RecordKind::Institution)
        .create_with_attachment(
            institution("Lycee Hoche"),
            Some(png("logo.png")),
            &CancelSignal::never(),
        )
        .await;

    let (stage, orphans) = match outcome {
        SagaOutcome::Failed {
            error: SagaError::Compensation { stage, orphans, .. },
            compensated: false,
        } => (stage, orphans),
        other => panic!("expected compensation failure, got {:?}", other),
    };
    assert_eq!(stage, SagaStage::Link);
    assert_eq!(orphans.len(), 2);
    assert!(matches!(orphans[0], Orphan::Attachment(_)));
    assert!(matches!(orphans[1], Orphan::Record(_)));
    assert_eq!(h.attachments.len(), 1);
    assert_eq!(h.records.len(), 1);
    assert_eq!(h.journal.count(StoreOp::AttachmentDelete), 0);
    assert_eq!(h.journal.count(StoreOp::Delete), 0);
}

#[tokio::test]
async fn test_cancelled_saga_has_no_side_effects() {
    let h = Harness::new();
    let (handle, cancel) = CancelSignal::new();
    handle.cancel();

    let outcome = h
        .saga(RecordKind::Institution)
        .create_with_attachment(institution("Lycee Hoche"), Some(png("logo.png")), &cancel)
        .await;

    assert_eq!(
        outcome,
        SagaOutcome::Failed {
            error: SagaError::Cancelled,
            compensated: true,
        }
    );
    assert!(h.journal.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_does_not_abandon_saga() {
    let h = Harness::new();
    h.attachments
        .inject(StoreOp::Upload, Fault::Delay(Duration::from_secs(1)));
    let saga = h.saga(RecordKind::Institution);
    let never = CancelSignal::never();

    tokio::select! {
        outcome = saga.create_with_attachment(
            institution("Lycee Hoche"),
            Some(png("logo.png")),
            &never,
        ) => {
            panic!("saga finished before the caller gave up: {:?}", outcome);
        }
        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
    }

    tokio::time::sleep(Duration::from_secs(5)).await;

    let stored = h
        .records
        .list(ListRecordsRequest::of_kind(RecordKind::Institution))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    let reference = stored[0].attachment_ref("logo").expect("saga linked the upload");
    assert!(h.attachments.contains(reference));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_does_not_abandon_group_delete() {
    let h = Harness::new();
    let record = h
        .saga(RecordKind::Institution)
        .create_with_attachment(
            institution("Lycee Hoche"),
            Some(png("logo.png")),
            &CancelSignal::never(),
        )
        .await
        .into_result()
        .unwrap();
    h.attachments
        .inject(StoreOp::AttachmentDelete, Fault::Delay(Duration::from_secs(1)));
    let guard = h.guard();
    let never = CancelSignal::never();

    tokio::select! {
        result = guard.delete_group(RecordKind::Institution, "Lycee Hoche", &never) => {
            panic!("group delete finished before the caller gave up: {:?}", result);
        }
        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
    }

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!h.records.contains(record.id));
    assert!(h.attachments.is_empty());
}
