/// Shared types for the conversation layer
use crate::backend::Document;
use crate::error::{ChatError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

/// Transportable attachment. Images carry an inline data URL, other files
/// an ephemeral object URL that only resolves in the session that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
}

/// Frozen copy of the replied-to message, taken at send time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub target_id: String,
    pub target_content_snapshot: String,
}

/// One message of the active conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar_url: Option<String>,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub reply_ref: Option<ReplyRef>,
    /// `None` until the store has confirmed the server timestamp
    pub timestamp: Option<DateTime<Utc>>,
    pub edited: bool,
}

/// Stored layout of a message. Accepts the older flat attachment fields
/// (`imageUrl`, `fileUrl`, `fileName`) and `senderProfilePicture`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRecord {
    sender_id: String,
    #[serde(default)]
    sender_name: Option<String>,
    #[serde(default)]
    sender_avatar_url: Option<String>,
    #[serde(default)]
    sender_profile_picture: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    attachment: Option<Attachment>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    reply_ref: Option<ReplyRef>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    edited: Option<bool>,
}

/// RFC 3339 string -> confirmed; null, missing or an unresolved sentinel -> pending
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

impl Message {
    /// Decode a stored document into a message
    pub fn from_document(id: &str, fields: &Document) -> Result<Self> {
        let record: MessageRecord =
            serde_json::from_value(serde_json::Value::Object(fields.clone()))?;

        let attachment = record.attachment.or_else(|| {
            let name = record.file_name.clone().unwrap_or_default();
            match (record.image_url, record.file_url) {
                (Some(url), _) => Some(Attachment {
                    kind: AttachmentKind::Image,
                    url,
                    name,
                }),
                (None, Some(url)) => Some(Attachment {
                    kind: AttachmentKind::File,
                    url,
                    name,
                }),
                (None, None) => None,
            }
        });

        Ok(Self {
            id: id.to_string(),
            sender_id: record.sender_id,
            sender_name: record.sender_name.unwrap_or_default(),
            sender_avatar_url: record.sender_avatar_url.or(record.sender_profile_picture),
            content: record.content.unwrap_or_default(),
            attachment,
            reply_ref: record.reply_ref,
            timestamp: record.timestamp,
            edited: record.edited.unwrap_or(false),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.timestamp.is_none()
    }

    pub fn is_authored_by(&self, uid: &str) -> bool {
        self.sender_id == uid
    }

    /// Text frozen into a reply: the content, or the attachment name for
    /// attachment-only messages.
    pub fn reply_snapshot(&self) -> String {
        if self.content.trim().is_empty() {
            if let Some(att) = &self.attachment {
                return att.name.clone();
            }
        }
        self.content.clone()
    }
}

/// Public profile of a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, alias = "photoURL")]
    pub photo_url: Option<String>,
}

impl UserProfile {
    pub fn new(uid: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: display_name.into(),
            photo_url: None,
        }
    }

    pub fn from_document(uid: &str, fields: &Document) -> Result<Self> {
        let mut profile: UserProfile =
            serde_json::from_value(serde_json::Value::Object(fields.clone()))?;
        if profile.uid.is_empty() {
            profile.uid = uid.to_string();
        }
        Ok(profile)
    }
}

/// Two-party conversation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant_ids: Vec<String>,
}

impl Conversation {
    pub fn from_document(id: &str, fields: &Document) -> Result<Self> {
        let participants = fields
            .get("participants")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                ChatError::Read(format!("conversation {} has no participants", id))
            })?;

        let participant_ids = participants
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        Ok(Self {
            id: id.to_string(),
            participant_ids,
        })
    }

    /// The other participant relative to `current_uid`
    pub fn counterpart_id(&self, current_uid: &str) -> Option<&str> {
        self.participant_ids
            .iter()
            .map(String::as_str)
            .find(|id| *id != current_uid)
    }
}

/// Events delivered to the UI boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A conversation became active
    ConversationSelected {
        conversation_id: String,
        counterpart_id: Option<String>,
    },
    /// The active conversation was closed
    ConversationClosed { conversation_id: String },
    /// The ordered view was replaced by a new snapshot
    ViewUpdated {
        conversation_id: String,
        message_count: usize,
    },
    /// The live feed reported an error; the view was kept
    SubscriptionFailed {
        conversation_id: String,
        error: String,
    },
    MessageSent { message_id: String },
    MessageEdited { message_id: String },
    MessageDeleted { message_id: String },
    /// A user-initiated operation failed
    OperationFailed { operation: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_decode_structured_message() {
        let fields = doc(json!({
            "senderId": "u1",
            "senderName": "Ada",
            "senderAvatarUrl": "https://img/ada.png",
            "content": "hi",
            "attachment": { "kind": "file", "url": "blob:x", "name": "notes.txt" },
            "replyRef": { "targetId": "m0", "targetContentSnapshot": "earlier" },
            "timestamp": "2024-05-01T10:00:00Z",
            "edited": true
        }));

        let msg = Message::from_document("m1", &fields).unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.sender_name, "Ada");
        assert_eq!(msg.attachment.as_ref().unwrap().kind, AttachmentKind::File);
        assert_eq!(msg.reply_ref.as_ref().unwrap().target_content_snapshot, "earlier");
        assert!(!msg.is_pending());
        assert!(msg.edited);
    }

    #[test]
    fn test_decode_pending_and_legacy_layout() {
        let fields = doc(json!({
            "senderId": "u2",
            "senderName": "Bob",
            "senderProfilePicture": "https://img/bob.png",
            "content": "",
            "imageUrl": "data:image/png;base64,AAAA",
            "fileUrl": null,
            "fileName": "cat.png",
            "timestamp": null
        }));

        let msg = Message::from_document("m2", &fields).unwrap();
        assert!(msg.is_pending());
        assert_eq!(msg.sender_avatar_url.as_deref(), Some("https://img/bob.png"));
        let att = msg.attachment.clone().unwrap();
        assert_eq!(att.kind, AttachmentKind::Image);
        assert_eq!(att.name, "cat.png");
        assert_eq!(msg.reply_snapshot(), "cat.png");
    }

    #[test]
    fn test_null_edited_flag_decodes_as_unedited() {
        let fields = doc(json!({
            "senderId": "u1",
            "content": "x",
            "timestamp": "2024-05-01T10:00:00Z",
            "edited": null
        }));
        let msg = Message::from_document("m5", &fields).unwrap();
        assert!(!msg.edited);
    }

    #[test]
    fn test_unresolved_sentinel_is_pending() {
        let fields = doc(json!({
            "senderId": "u1",
            "content": "x",
            "timestamp": { "$serverTimestamp": true }
        }));
        assert!(Message::from_document("m3", &fields).unwrap().is_pending());
    }

    #[test]
    fn test_decode_rejects_missing_sender() {
        let fields = doc(json!({ "content": "orphan" }));
        assert!(Message::from_document("m4", &fields).is_err());
    }

    #[test]
    fn test_conversation_counterpart() {
        let conv =
            Conversation::from_document("c1", &doc(json!({ "participants": ["me", "you"] })))
                .unwrap();
        assert_eq!(conv.counterpart_id("me"), Some("you"));
        assert_eq!(conv.counterpart_id("you"), Some("me"));

        assert!(Conversation::from_document("c2", &doc(json!({}))).is_err());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = ChatEvent::MessageSent {
            message_id: "m1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message_sent");
        assert_eq!(json["message_id"], "m1");
    }
}
