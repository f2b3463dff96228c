/// Error types for conversation sync and mutations
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Live feed failed (transport or permission); the view stays at its last good state
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Create/update/delete failed; composition state is kept for retry
    #[error("Write error: {0}")]
    Write(String),

    /// Single-document read failed
    #[error("Read error: {0}")]
    Read(String),

    #[error("Attachment read error: {0}")]
    AttachmentRead(String),

    #[error("Attachment {name} is {size} bytes, inline limit is {limit}")]
    AttachmentTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("User {user_id} is not the author of message {message_id}")]
    AuthorizationViolation { message_id: String, user_id: String },

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Whether the session stays usable after this error.
    ///
    /// Only a broken configuration is fatal; every per-operation failure
    /// leaves the session in a state the user can retry from.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ChatError::Config(_))
    }

    /// Re-label a backend failure as a write failure, keeping the message.
    pub(crate) fn into_write(self) -> Self {
        match self {
            ChatError::Write(_) => self,
            other => ChatError::Write(other.to_string()),
        }
    }

    pub(crate) fn into_read(self) -> Self {
        match self {
            ChatError::Read(_) => self,
            other => ChatError::Read(other.to_string()),
        }
    }

    pub(crate) fn into_subscription(self) -> Self {
        match self {
            ChatError::Subscription(_) => self,
            other => ChatError::Subscription(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relabel_keeps_original_text() {
        let err = ChatError::Storage("disk full".to_string()).into_write();
        assert!(matches!(err, ChatError::Write(ref m) if m.contains("disk full")));

        let err = ChatError::Write("denied".to_string()).into_write();
        assert_eq!(err.to_string(), "Write error: denied");
    }

    #[test]
    fn test_only_config_errors_are_fatal() {
        assert!(ChatError::Subscription("x".into()).is_recoverable());
        assert!(ChatError::NoActiveConversation.is_recoverable());
        assert!(!ChatError::Config("bad".into()).is_recoverable());
    }
}
