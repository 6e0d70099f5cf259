//! Message models

use serde::{Deserialize, Serialize};

/// A row in the `messages` table.
///
/// `content` holds either message text or, when `is_image` is set, the
/// public storage URL of an uploaded image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub content: String,
    pub created_at: String,
    pub user_id: String,
    pub conversation_id: i64,
    pub is_image: bool,
}

impl Message {
    /// Timestamp formatted for terminal display (local time, HH:MM).
    pub fn short_time(&self) -> String {
        chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
            .unwrap_or_else(|_| self.created_at.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_time_falls_back_on_unparseable() {
        let msg = Message {
            id: 1,
            content: "hi".to_string(),
            created_at: "not-a-date".to_string(),
            user_id: "u".to_string(),
            conversation_id: 7,
            is_image: false,
        };
        assert_eq!(msg.short_time(), "not-a-date");
    }

    #[test]
    fn test_message_row_deserializes() {
        let json = r#"{
            "id": 42,
            "content": "hello",
            "created_at": "2024-05-01T12:00:00+00:00",
            "user_id": "abc",
            "conversation_id": 7,
            "is_image": false
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, 42);
        assert_eq!(msg.conversation_id, 7);
        assert!(!msg.is_image);
    }
}
