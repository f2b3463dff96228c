/// Backing document store contract
///
/// The hosted database is treated as an opaque ordered-event source: a
/// subscription delivers full snapshots (never deltas) of a collection in
/// the order the store emits them, and writes come back through the same
/// subscription.
use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{json, Map, Value};

/// Field map of one stored document
pub type Document = Map<String, Value>;

/// Key of the create-time sentinel the store replaces with its own clock
pub const SERVER_TIMESTAMP_KEY: &str = "$serverTimestamp";

/// Field every message subscription is ordered by
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// A document as delivered in a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub fields: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Live feed of full ordered snapshots. Ends when the store drops it.
pub type SnapshotStream = BoxStream<'static, Result<Vec<RawDocument>>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn subscribe_ordered(
        &self,
        path: &str,
        order_field: &str,
        direction: Direction,
    ) -> Result<SnapshotStream>;

    /// Create a document, returning the id the store assigned
    async fn create_document(&self, path: &str, fields: Document) -> Result<String>;

    /// Merge `fields` into an existing document
    async fn update_document(&self, path: &str, id: &str, fields: Document) -> Result<()>;

    async fn delete_document(&self, path: &str, id: &str) -> Result<()>;

    async fn read_document(&self, path: &str, id: &str) -> Result<Option<Document>>;
}

/// Sentinel resolved to the store's clock before the confirmed snapshot
pub fn server_timestamp() -> Value {
    json!({ SERVER_TIMESTAMP_KEY: true })
}

pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .map(|o| o.len() == 1 && o.get(SERVER_TIMESTAMP_KEY) == Some(&Value::Bool(true)))
        .unwrap_or(false)
}

/// `{root}/{conversation_id}/messages`
pub fn messages_path(root: &str, conversation_id: &str) -> String {
    format!("{}/{}/messages", root, conversation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_detection() {
        assert!(is_server_timestamp(&server_timestamp()));
        assert!(!is_server_timestamp(&Value::Null));
        assert!(!is_server_timestamp(&json!({ SERVER_TIMESTAMP_KEY: true, "x": 1 })));
        assert!(!is_server_timestamp(&json!("2024-01-01T00:00:00Z")));
    }

    #[test]
    fn test_messages_path() {
        assert_eq!(messages_path("conversations", "abc"), "conversations/abc/messages");
    }
}
