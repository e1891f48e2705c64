//! # edupanel-saga
//!
//! Consistency workflows for records that own externally stored attachments.
//!
//! This crate provides:
//! - [`AttachmentSaga`]: create-then-attach and update-then-swap with compensation
//! - [`BatchCoordinator`]: bounded fan-out of one logical record to many parents
//! - [`DeletionGuard`]: dependent-checked deletion, single and grouped
//! - [`group_by_name`]: folding of records sharing a name
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use edupanel_saga::{AttachmentSaga, CancelSignal, SagaOutcome};
//!
//! let saga = AttachmentSaga::new(records, attachments, RecordKind::Exam);
//! match saga.create_with_attachment(new_exam, Some(paper), &CancelSignal::never()).await {
//!     SagaOutcome::Success { record } => println!("created {}", record.id),
//!     SagaOutcome::PartialSuccess { error, .. } => eprintln!("partial: {}", error),
//!     SagaOutcome::Failed { error, compensated } => {
//!         eprintln!("failed ({}): {}", compensated, error)
//!     }
//! }
//! ```

pub mod batch;
pub mod cancel;
pub mod config;
pub mod group;
pub mod guard;
pub mod outcome;
pub mod saga;

pub use batch::BatchCoordinator;
pub use cancel::{CancelHandle, CancelSignal};
pub use config::SagaConfig;
pub use group::{group_by_name, paginate_groups, Group, GroupMember, GroupPage};
pub use guard::{DeletedRecord, DeletionGuard};
pub use outcome::{BatchFailure, BatchResult, Orphan, SagaError, SagaOutcome, SagaStage};
pub use saga::AttachmentSaga;
