//! Lesson data model.
//!
//! A lesson is identified by the pair `(topicId, id)`: `id` is only unique
//! within its topic. Two lessons with the same key are the same lesson,
//! whatever their titles say.

use serde::{Deserialize, Serialize};
use web_time::{SystemTime, UNIX_EPOCH};

/// A titled content unit exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub title: String,
    /// Coarse category used for interest filtering
    pub topic_id: String,
    /// Unique within `topic_id` only
    pub id: String,
    /// Username of the peer that supplied this copy (None for local lessons)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// When this copy arrived over the wire, in milliseconds since Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<u64>,
}

impl Lesson {
    /// Create a locally authored lesson.
    pub fn new(title: impl Into<String>, topic_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            topic_id: topic_id.into(),
            id: id.into(),
            source: None,
            received_at: None,
        }
    }

    /// The identity key of this lesson.
    pub fn metadata(&self) -> LessonMetadata {
        LessonMetadata {
            topic_id: self.topic_id.clone(),
            id: self.id.clone(),
        }
    }

    /// Return a copy attributed to `source` and stamped with the current time.
    pub fn stamped(&self, source: &str) -> Self {
        Self {
            source: Some(source.to_string()),
            received_at: Some(now_millis()),
            ..self.clone()
        }
    }
}

/// The advertisement unit exchanged before any full lesson is transferred.
///
/// Doubles as the identity key of a lesson.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonMetadata {
    pub topic_id: String,
    pub id: String,
}

impl LessonMetadata {
    pub fn new(topic_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            topic_id: topic_id.into(),
            id: id.into(),
        }
    }
}

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lesson_wire_format_omits_missing_stamps() {
        let lesson = Lesson::new("Intro", "2", "0");
        let json = serde_json::to_string(&lesson).unwrap();
        assert_eq!(json, r#"{"title":"Intro","topicId":"2","id":"0"}"#);
    }

    #[test]
    fn test_lesson_parses_optional_stamps() {
        let json = r#"{"title":"Intro","topicId":"2","id":"0","source":"A","receivedAt":1700000000000}"#;
        let lesson: Lesson = serde_json::from_str(json).unwrap();
        assert_eq!(lesson.source.as_deref(), Some("A"));
        assert_eq!(lesson.received_at, Some(1_700_000_000_000));
    }

    #[test]
    fn test_key_ignores_title() {
        let a = Lesson::new("Intro", "2", "0");
        let b = Lesson::new("Introduction", "2", "0");
        let c = Lesson::new("Intro", "3", "0");
        assert_eq!(a.metadata(), b.metadata());
        assert_ne!(a.metadata(), c.metadata());
    }

    #[test]
    fn test_stamped_sets_source_and_time() {
        let lesson = Lesson::new("Intro", "2", "0").stamped("alice");
        assert_eq!(lesson.source.as_deref(), Some("alice"));
        assert!(lesson.received_at.unwrap() > 0);
        assert_eq!(lesson.title, "Intro");
    }

    #[test]
    fn test_metadata_wire_format() {
        let meta = LessonMetadata::new("2", "0");
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"topicId":"2","id":"0"}"#);
    }
}
