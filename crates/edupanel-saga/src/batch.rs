//! Batch association of one logical record to many parents.
//!
//! Every sub-operation is awaited, even after others fail, and the results
//! are partitioned in input order. Nothing is rolled back across the batch.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use edupanel_core::{NewRecord, Record};

use crate::cancel::CancelSignal;
use crate::outcome::{BatchFailure, BatchResult, SagaError};
use crate::saga::AttachmentSaga;

/// Run `op` once per target with at most `max_concurrent` in flight.
///
/// Targets not yet dispatched when `cancel` fires fail with
/// [`SagaError::Cancelled`]; dispatched ones run to completion.
pub(crate) async fn fan_out<T, F, Fut>(
    targets: &[Uuid],
    max_concurrent: usize,
    cancel: &CancelSignal,
    op: F,
) -> BatchResult<T>
where
    T: Send + 'static,
    F: Fn(Uuid) -> Fut,
    Fut: Future<Output = Result<T, SagaError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut slots: Vec<Option<Result<T, SagaError>>> = (0..targets.len()).map(|_| None).collect();
    let mut tasks = JoinSet::new();

    for (idx, target) in targets.iter().copied().enumerate() {
        if cancel.is_cancelled() {
            slots[idx] = Some(Err(SagaError::Cancelled));
            continue;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                slots[idx] = Some(Err(SagaError::Internal {
                    detail: e.to_string(),
                }));
                continue;
            }
        };
        // A permit may have taken a while; cancellation could have fired meanwhile.
        if cancel.is_cancelled() {
            slots[idx] = Some(Err(SagaError::Cancelled));
            continue;
        }
        let fut = op(target);
        tasks.spawn(async move {
            let _permit = permit;
            (idx, fut.await)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, result)) => slots[idx] = Some(result),
            Err(e) => error!(
                subsystem = "saga",
                component = "batch",
                error = ?e,
                "Batch task panicked"
            ),
        }
    }

    let mut result = BatchResult::default();
    for (target, slot) in targets.iter().copied().zip(slots) {
        match slot.unwrap_or_else(|| {
            Err(SagaError::Internal {
                detail: "sub-operation task panicked".to_string(),
            })
        }) {
            Ok(value) => result.succeeded.push(value),
            Err(error) => result.failed.push(BatchFailure { target, error }),
        }
    }
    result
}

/// Creates one record per parent from a shared base.
#[derive(Clone)]
pub struct BatchCoordinator {
    saga: AttachmentSaga,
}

impl BatchCoordinator {
    pub fn new(saga: AttachmentSaga) -> Self {
        Self { saga }
    }

    /// Create a copy of `base` under each of `parent_ids`.
    ///
    /// Each copy is an independent saga run without an attachment. The
    /// `parent_id` of `base` is ignored.
    #[instrument(
        skip(self, base, parent_ids, cancel),
        fields(
            subsystem = "saga",
            component = "batch",
            op = "associate_many",
            kind = %base.kind,
            name = %base.name,
            targets = parent_ids.len()
        )
    )]
    pub async fn associate_many(
        &self,
        base: &NewRecord,
        parent_ids: &[Uuid],
        cancel: &CancelSignal,
    ) -> BatchResult<Record> {
        let base = Arc::new(base.clone());
        let max_concurrent = self.saga.config().batch_max_concurrent;
        debug!(max_concurrent, "Dispatching association batch");

        let result = fan_out(parent_ids, max_concurrent, cancel, |parent_id| {
            let saga = self.saga.clone();
            let base = Arc::clone(&base);
            async move {
                let new = NewRecord::clone(&base).with_parent(parent_id);
                saga.create_with_attachment(new, None, &CancelSignal::never())
                    .await
                    .into_result()
            }
        })
        .await;

        if result.is_complete_success() {
            info!(succeeded = result.succeeded.len(), "Association batch completed");
        } else {
            warn!(
                succeeded = result.succeeded.len(),
                failed = result.failed.len(),
                "Association batch completed with failures"
            );
        }
        result
    }
}
