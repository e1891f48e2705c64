//! Typed field payloads for each record kind.
//!
//! Records store their kind-specific fields as a JSON object. Before anything
//! is handed to a record store, the object is deserialized into the kind's
//! payload struct (unknown keys rejected) and checked with `validate()`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::defaults::{DESCRIPTION_MAX_LEN, EXAM_YEAR_MAX, EXAM_YEAR_MIN, RECORD_NAME_MAX_LEN};
use crate::error::{Error, Result};
use crate::models::RecordKind;

/// Behavior shared by every per-kind payload.
pub trait FieldPayload: Serialize + DeserializeOwned {
    const KIND: RecordKind;

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldPayload for CategoryFields {
    const KIND: RecordKind = RecordKind::Category;

    fn validate(&self) -> Result<()> {
        check_description(self.description.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstitutionFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

impl FieldPayload for InstitutionFields {
    const KIND: RecordKind = RecordKind::Institution;

    fn validate(&self) -> Result<()> {
        match &self.website {
            Some(url) => check_http_url("website", url),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldPayload for TrackFields {
    const KIND: RecordKind = RecordKind::Track;

    fn validate(&self) -> Result<()> {
        check_description(self.description.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LevelFields {
    /// Display position within the parent track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

impl FieldPayload for LevelFields {
    const KIND: RecordKind = RecordKind::Level;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExamFields {
    pub year: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl FieldPayload for ExamFields {
    const KIND: RecordKind = RecordKind::Exam;

    fn validate(&self) -> Result<()> {
        if !(EXAM_YEAR_MIN..=EXAM_YEAR_MAX).contains(&self.year) {
            return Err(Error::InvalidInput(format!(
                "exam year {} outside {}..={}",
                self.year, EXAM_YEAR_MIN, EXAM_YEAR_MAX
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventFields {
    pub starts_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl FieldPayload for EventFields {
    const KIND: RecordKind = RecordKind::Event;

    fn validate(&self) -> Result<()> {
        if let Some(ends_at) = self.ends_at {
            if ends_at < self.starts_at {
                return Err(Error::InvalidInput(
                    "event ends_at is before starts_at".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdFields {
    pub target_url: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl FieldPayload for AdFields {
    const KIND: RecordKind = RecordKind::Ad;

    fn validate(&self) -> Result<()> {
        check_http_url("target_url", &self.target_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForumPostFields {
    pub body: String,
    pub author: String,
}

impl FieldPayload for ForumPostFields {
    const KIND: RecordKind = RecordKind::ForumPost;

    fn validate(&self) -> Result<()> {
        if self.body.trim().is_empty() {
            return Err(Error::InvalidInput("forum post body is empty".to_string()));
        }
        if self.author.trim().is_empty() {
            return Err(Error::InvalidInput("forum post author is empty".to_string()));
        }
        Ok(())
    }
}

/// Serialize a typed payload into a field map, dropping null values.
pub fn to_field_map<T: Serialize>(fields: &T) -> Result<JsonMap<String, JsonValue>> {
    match serde_json::to_value(fields)? {
        JsonValue::Object(map) => Ok(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
        other => Err(Error::InvalidInput(format!(
            "record fields must serialize to an object, got {}",
            other
        ))),
    }
}

/// Deserialize a field map into the payload type `T` and validate it.
pub fn parse_fields<T: FieldPayload>(fields: &JsonMap<String, JsonValue>) -> Result<T> {
    let parsed: T = serde_json::from_value(JsonValue::Object(fields.clone())).map_err(|e| {
        Error::InvalidInput(format!("invalid {} fields: {}", T::KIND, e))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

/// Validate a record name and its kind-specific fields.
pub fn validate_fields(
    kind: RecordKind,
    name: &str,
    fields: &JsonMap<String, JsonValue>,
) -> Result<()> {
    validate_name(name)?;
    match kind {
        RecordKind::Category => parse_fields::<CategoryFields>(fields).map(drop),
        RecordKind::Institution => parse_fields::<InstitutionFields>(fields).map(drop),
        RecordKind::Track => parse_fields::<TrackFields>(fields).map(drop),
        RecordKind::Level => parse_fields::<LevelFields>(fields).map(drop),
        RecordKind::Exam => parse_fields::<ExamFields>(fields).map(drop),
        RecordKind::Event => parse_fields::<EventFields>(fields).map(drop),
        RecordKind::Ad => parse_fields::<AdFields>(fields).map(drop),
        RecordKind::ForumPost => parse_fields::<ForumPostFields>(fields).map(drop),
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("record name is empty".to_string()));
    }
    if name.chars().count() > RECORD_NAME_MAX_LEN {
        return Err(Error::InvalidInput(format!(
            "record name exceeds {} characters",
            RECORD_NAME_MAX_LEN
        )));
    }
    Ok(())
}

fn check_description(description: Option<&str>) -> Result<()> {
    match description {
        Some(d) if d.chars().count() > DESCRIPTION_MAX_LEN => Err(Error::InvalidInput(format!(
            "description exceeds {} characters",
            DESCRIPTION_MAX_LEN
        ))),
        _ => Ok(()),
    }
}

fn check_http_url(field: &str, url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "{} must start with http:// or https://, got: {}",
            field, url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_exam_requires_year_in_range() {
        assert!(validate_fields(RecordKind::Exam, "Finals", &map(json!({"year": 2024}))).is_ok());
        assert!(validate_fields(RecordKind::Exam, "Finals", &map(json!({"year": 1800}))).is_err());
        assert!(validate_fields(RecordKind::Exam, "Finals", &map(json!({}))).is_err());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = validate_fields(
            RecordKind::Category,
            "Science",
            &map(json!({"description": "x", "colour": "red"})),
        )
        .unwrap_err();
        assert!(err.is_invalid_input());
        assert!(err.to_string().contains("category"));
    }

    #[test]
    fn test_event_end_before_start_rejected() {
        let fields = map(json!({
            "starts_at": "2026-05-01T09:00:00Z",
            "ends_at": "2026-04-30T09:00:00Z"
        }));
        assert!(validate_fields(RecordKind::Event, "Open day", &fields).is_err());
    }

    #[test]
    fn test_ad_defaults_active_and_checks_url() {
        let ad: AdFields =
            parse_fields(&map(json!({"target_url": "https://example.org"}))).unwrap();
        assert!(ad.active);
        assert!(
            validate_fields(RecordKind::Ad, "Promo", &map(json!({"target_url": "ftp://x"})))
                .is_err()
        );
    }

    #[test]
    fn test_forum_post_body_and_author_required() {
        let ok = map(json!({"body": "Hello", "author": "admin"}));
        assert!(validate_fields(RecordKind::ForumPost, "Welcome", &ok).is_ok());
        let blank = map(json!({"body": "  ", "author": "admin"}));
        assert!(validate_fields(RecordKind::ForumPost, "Welcome", &blank).is_err());
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("L1").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(RECORD_NAME_MAX_LEN + 1)).is_err());
    }

    #[test]
    fn test_to_field_map_skips_none() {
        let fields = InstitutionFields {
            city: Some("Lyon".to_string()),
            website: None,
        };
        let map = to_field_map(&fields).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["city"], json!("Lyon"));
    }

    #[test]
    fn test_to_field_map_rejects_non_objects() {
        assert!(to_field_map(&42).is_err());
    }
}
