//! # edupanel-core
//!
//! Core types, traits, and abstractions for the edupanel content-administration
//! backend.
//!
//! This crate provides the record and attachment models, the per-kind field
//! payloads, and the store contracts that the other edupanel crates implement
//! or consume.

pub mod defaults;
pub mod error;
pub mod file_safety;
pub mod models;
pub mod payloads;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use file_safety::{check_attachment, detect_content_type, sanitize_filename, storage_extension};
pub use models::*;
pub use payloads::{
    AdFields, CategoryFields, EventFields, ExamFields, FieldPayload, ForumPostFields,
    InstitutionFields, LevelFields, TrackFields,
};
pub use traits::*;
