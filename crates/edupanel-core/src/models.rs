//! Record, patch, and attachment models shared across edupanel crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::payloads;

// =============================================================================
// RECORD KINDS
// =============================================================================

/// Kind of content record managed by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Category,
    Institution,
    Track,
    Level,
    Exam,
    Event,
    Ad,
    ForumPost,
}

impl RecordKind {
    pub const ALL: [RecordKind; 8] = [
        RecordKind::Category,
        RecordKind::Institution,
        RecordKind::Track,
        RecordKind::Level,
        RecordKind::Exam,
        RecordKind::Event,
        RecordKind::Ad,
        RecordKind::ForumPost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Institution => "institution",
            Self::Track => "track",
            Self::Level => "level",
            Self::Exam => "exam",
            Self::Event => "event",
            Self::Ad => "ad",
            Self::ForumPost => "forum_post",
        }
    }

    /// Attachment slots a record of this kind owns.
    pub fn slots(&self) -> &'static [AttachmentSlot] {
        match self {
            Self::Category => CATEGORY_SLOTS,
            Self::Institution => INSTITUTION_SLOTS,
            Self::Track => TRACK_SLOTS,
            Self::Level => &[],
            Self::Exam => EXAM_SLOTS,
            Self::Event => EVENT_SLOTS,
            Self::Ad => AD_SLOTS,
            Self::ForumPost => FORUM_POST_SLOTS,
        }
    }

    /// Look up one of this kind's slots by subtype.
    pub fn slot(&self, subtype: &str) -> Option<&'static AttachmentSlot> {
        self.slots().iter().find(|s| s.subtype == subtype)
    }

    /// Which parent, if any, a record of this kind hangs under.
    pub fn parent_rule(&self) -> ParentRule {
        match self {
            Self::Category => ParentRule::Optional(Self::Category),
            Self::Institution => ParentRule::None,
            Self::Track => ParentRule::Required(Self::Category),
            Self::Level => ParentRule::Required(Self::Track),
            Self::Exam => ParentRule::Required(Self::Level),
            Self::Event => ParentRule::Optional(Self::Institution),
            Self::Ad => ParentRule::None,
            Self::ForumPost => ParentRule::Optional(Self::Category),
        }
    }
}

const CATEGORY_SLOTS: &[AttachmentSlot] = &[AttachmentSlot::optional(RecordKind::Category, "icon")];
const INSTITUTION_SLOTS: &[AttachmentSlot] =
    &[AttachmentSlot::optional(RecordKind::Institution, "logo")];
const TRACK_SLOTS: &[AttachmentSlot] = &[AttachmentSlot::optional(RecordKind::Track, "cover")];
const EXAM_SLOTS: &[AttachmentSlot] = &[AttachmentSlot::required(RecordKind::Exam, "paper")];
const EVENT_SLOTS: &[AttachmentSlot] = &[
    AttachmentSlot::required(RecordKind::Event, "cover"),
    AttachmentSlot::optional(RecordKind::Event, "content"),
];
const AD_SLOTS: &[AttachmentSlot] = &[AttachmentSlot::required(RecordKind::Ad, "banner")];
const FORUM_POST_SLOTS: &[AttachmentSlot] =
    &[AttachmentSlot::optional(RecordKind::ForumPost, "image")];

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown record kind: {}", s)))
    }
}

/// Parent relationship of a record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRule {
    /// The kind never has a parent.
    None,
    /// A parent of the given kind may be set.
    Optional(RecordKind),
    /// A parent of the given kind must be set.
    Required(RecordKind),
}

impl ParentRule {
    /// Kind the parent must have, if a parent is allowed at all.
    pub fn parent_kind(&self) -> Option<RecordKind> {
        match self {
            ParentRule::None => None,
            ParentRule::Optional(k) | ParentRule::Required(k) => Some(*k),
        }
    }

    /// Check a proposed `parent_id` against this rule (presence only).
    pub fn check(&self, kind: RecordKind, parent_id: Option<Uuid>) -> Result<()> {
        match (self, parent_id) {
            (ParentRule::None, Some(_)) => Err(Error::InvalidInput(format!(
                "{} records cannot have a parent",
                kind
            ))),
            (ParentRule::Required(parent), None) => Err(Error::InvalidInput(format!(
                "{} records require a {} parent",
                kind, parent
            ))),
            _ => Ok(()),
        }
    }
}

/// One attachment slot of a record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentSlot {
    pub kind: RecordKind,
    pub subtype: &'static str,
    /// The record is invalid without an attachment in this slot.
    pub required: bool,
}

impl AttachmentSlot {
    const fn required(kind: RecordKind, subtype: &'static str) -> Self {
        Self {
            kind,
            subtype,
            required: true,
        }
    }

    const fn optional(kind: RecordKind, subtype: &'static str) -> Self {
        Self {
            kind,
            subtype,
            required: false,
        }
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// A persisted content record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub kind: RecordKind,
    pub name: String,
    pub parent_id: Option<Uuid>,
    /// Kind-specific fields, validated by [`payloads::validate_fields`].
    pub fields: JsonMap<String, JsonValue>,
    /// Linked attachment references keyed by slot subtype.
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
    /// Number of child records, populated only when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependent_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Reference linked in the given slot, if any.
    pub fn attachment_ref(&self, subtype: &str) -> Option<&str> {
        self.attachments.get(subtype).map(String::as_str)
    }
}

/// Request for creating a new record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub kind: RecordKind,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub fields: JsonMap<String, JsonValue>,
}

impl NewRecord {
    pub fn new(kind: RecordKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            parent_id: None,
            fields: JsonMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Replace the field map with the serialized form of a typed payload.
    pub fn with_fields<T: Serialize>(mut self, fields: &T) -> Result<Self> {
        self.fields = payloads::to_field_map(fields)?;
        Ok(self)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Validate the name, parent presence, and kind-specific fields.
    pub fn validate(&self) -> Result<()> {
        self.kind.parent_rule().check(self.kind, self.parent_id)?;
        payloads::validate_fields(self.kind, &self.name, &self.fields)
    }
}

/// Partial update of a record.
///
/// Only the parts that were set are written. `attachments` entries map a slot
/// subtype to `Some(reference)` (link) or `None` (unlink).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub name: Option<String>,
    pub parent_id: Option<Option<Uuid>>,
    pub set_fields: JsonMap<String, JsonValue>,
    pub remove_fields: Vec<String>,
    pub attachments: BTreeMap<String, Option<String>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn set_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        let key = key.into();
        self.remove_fields.retain(|k| k != &key);
        self.set_fields.insert(key, value.into());
        self
    }

    /// Set every key of a serialized typed payload; `None` options are skipped.
    pub fn set_fields_from<T: Serialize>(mut self, fields: &T) -> Result<Self> {
        for (key, value) in payloads::to_field_map(fields)? {
            self = self.set_field(key, value);
        }
        Ok(self)
    }

    pub fn remove_field(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.set_fields.remove(&key);
        if !self.remove_fields.contains(&key) {
            self.remove_fields.push(key);
        }
        self
    }

    pub fn link_attachment(
        mut self,
        subtype: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        self.attachments.insert(subtype.into(), Some(reference.into()));
        self
    }

    pub fn unlink_attachment(mut self, subtype: impl Into<String>) -> Self {
        self.attachments.insert(subtype.into(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.parent_id.is_none()
            && self.set_fields.is_empty()
            && self.remove_fields.is_empty()
            && self.attachments.is_empty()
    }

    pub fn touches_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Field map that results from applying this patch on top of `current`.
    pub fn merged_fields(
        &self,
        current: &JsonMap<String, JsonValue>,
    ) -> JsonMap<String, JsonValue> {
        let mut merged = current.clone();
        for key in &self.remove_fields {
            merged.remove(key);
        }
        for (key, value) in &self.set_fields {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Apply the patch in place. Used by stores that hold records in memory.
    pub fn apply_to(&self, record: &mut Record) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(parent_id) = self.parent_id {
            record.parent_id = parent_id;
        }
        record.fields = self.merged_fields(&record.fields);
        for (subtype, reference) in &self.attachments {
            match reference {
                Some(r) => {
                    record.attachments.insert(subtype.clone(), r.clone());
                }
                None => {
                    record.attachments.remove(subtype);
                }
            }
        }
    }
}

/// Request for listing records.
#[derive(Debug, Clone, Default)]
pub struct ListRecordsRequest {
    /// Filter by kind
    pub kind: Option<RecordKind>,
    /// Filter by exact name
    pub name: Option<String>,
    /// Filter by parent
    pub parent_id: Option<Uuid>,
    /// Maximum results
    pub limit: Option<i64>,
    /// Pagination offset
    pub offset: Option<i64>,
}

impl ListRecordsRequest {
    pub fn of_kind(kind: RecordKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn under(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True if `record` passes the kind/name/parent filters.
    pub fn matches(&self, record: &Record) -> bool {
        self.kind.map_or(true, |k| record.kind == k)
            && self.name.as_ref().map_or(true, |n| &record.name == n)
            && self.parent_id.map_or(true, |p| record.parent_id == Some(p))
    }
}

// =============================================================================
// ATTACHMENTS
// =============================================================================

/// Key an attachment is uploaded under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    pub kind: RecordKind,
    pub entity_id: Uuid,
    pub subtype: String,
}

impl AttachmentKey {
    pub fn new(kind: RecordKind, entity_id: Uuid, subtype: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id,
            subtype: subtype.into(),
        }
    }
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.entity_id, self.subtype)
    }
}

/// A file supplied by the caller for upload.
#[derive(Clone, PartialEq)]
pub struct AttachmentFile {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl AttachmentFile {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for AttachmentFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentFile")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> Record {
        let now = Utc::now();
        Record {
            id: Uuid::now_v7(),
            kind: RecordKind::Event,
            name: "Open day".to_string(),
            parent_id: None,
            fields: json!({"starts_at": "2026-05-01T09:00:00Z", "location": "Hall A"})
                .as_object()
                .cloned()
                .unwrap(),
            attachments: BTreeMap::from([("cover".to_string(), "attachments/old.png".to_string())]),
            dependent_count: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in RecordKind::ALL {
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
        assert_eq!("Forum-Post".parse::<RecordKind>().unwrap(), RecordKind::ForumPost);
        assert!("lesson".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_slots_lookup() {
        assert!(RecordKind::Exam.slot("paper").unwrap().required);
        assert!(!RecordKind::Institution.slot("logo").unwrap().required);
        assert!(RecordKind::Event.slot("content").is_some());
        assert!(RecordKind::Level.slots().is_empty());
        assert!(RecordKind::Ad.slot("cover").is_none());
    }

    #[test]
    fn test_slot_tables_belong_to_their_kind() {
        let slot: &'static AttachmentSlot = RecordKind::Event.slot("cover").unwrap();
        assert!(slot.required);
        for kind in RecordKind::ALL {
            assert!(kind.slots().iter().all(|s| s.kind == kind), "{}", kind);
        }
    }

    #[test]
    fn test_parent_rule_check() {
        let rule = RecordKind::Level.parent_rule();
        assert_eq!(rule.parent_kind(), Some(RecordKind::Track));
        assert!(rule.check(RecordKind::Level, None).is_err());
        assert!(rule.check(RecordKind::Level, Some(Uuid::now_v7())).is_ok());

        let none = RecordKind::Ad.parent_rule();
        assert!(none.check(RecordKind::Ad, Some(Uuid::now_v7())).is_err());
        assert!(none.check(RecordKind::Ad, None).is_ok());
    }

    #[test]
    fn test_patch_empty_and_attachment_tracking() {
        let patch = RecordPatch::new();
        assert!(patch.is_empty());
        assert!(!patch.touches_attachments());

        let patch = RecordPatch::new().link_attachment("cover", "attachments/new.png");
        assert!(!patch.is_empty());
        assert!(patch.touches_attachments());
    }

    #[test]
    fn test_set_then_remove_field_keeps_last_intent() {
        let patch = RecordPatch::new().set_field("location", "Hall B").remove_field("location");
        assert!(patch.set_fields.is_empty());
        assert_eq!(patch.remove_fields, vec!["location".to_string()]);

        let patch = RecordPatch::new().remove_field("location").set_field("location", "Hall C");
        assert!(patch.remove_fields.is_empty());
        assert_eq!(patch.set_fields["location"], json!("Hall C"));
    }

    #[test]
    fn test_apply_patch_to_record() {
        let mut record = sample_record();
        RecordPatch::new()
            .name("Open day 2026")
            .remove_field("location")
            .set_field("ends_at", "2026-05-01T17:00:00Z")
            .link_attachment("content", "attachments/programme.pdf")
            .unlink_attachment("cover")
            .apply_to(&mut record);

        assert_eq!(record.name, "Open day 2026");
        assert!(!record.fields.contains_key("location"));
        assert_eq!(record.fields["ends_at"], json!("2026-05-01T17:00:00Z"));
        assert_eq!(record.attachment_ref("content"), Some("attachments/programme.pdf"));
        assert_eq!(record.attachment_ref("cover"), None);
    }

    #[test]
    fn test_list_request_matches() {
        let record = sample_record();
        assert!(ListRecordsRequest::of_kind(RecordKind::Event).matches(&record));
        assert!(ListRecordsRequest::of_kind(RecordKind::Event)
            .named("Open day")
            .matches(&record));
        assert!(!ListRecordsRequest::of_kind(RecordKind::Ad).matches(&record));
        assert!(!ListRecordsRequest::default()
            .under(Uuid::now_v7())
            .matches(&record));
    }

    #[test]
    fn test_attachment_file_debug_hides_bytes() {
        let file = AttachmentFile::new("a.png", "image/png", vec![1u8, 2, 3]);
        let debug = format!("{:?}", file);
        assert!(debug.contains("size: 3"));
        assert!(!debug.contains("[1, 2, 3]"));
    }

    #[test]
    fn test_attachment_key_display() {
        let id = Uuid::nil();
        let key = AttachmentKey::new(RecordKind::Exam, id, "paper");
        assert_eq!(key.to_string(), format!("exam/{}/paper", id));
    }
}
