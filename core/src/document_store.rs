/// Local document store backed by sled
/// Keys: <collection path>/<document id> -> JSON field map
use crate::backend::{
    is_server_timestamp, Direction, Document, DocumentStore, RawDocument, SnapshotStream,
};
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::stream::{unfold, StreamExt};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
type SnapshotSender = mpsc::UnboundedSender<Result<Vec<RawDocument>>>;

struct Subscriber {
    order_field: String,
    direction: Direction,
    tx: SnapshotSender,
}

/// Document store with live ordered subscriptions, usable as the backing
/// store of a chat session without a hosted database.
#[derive(Clone)]
pub struct LocalDocumentStore {
    db: Arc<sled::Db>,
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    clock: Clock,
    offline: Arc<AtomicBool>,
    latency_compensation: bool,
}

impl LocalDocumentStore {
    /// Open (or create) a store in the given data directory
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("documents.db");
        debug!("Opening document store at {:?}", db_path);

        let db = sled::open(&db_path).map_err(|e| {
            ChatError::Storage(format!("Failed to open document store: {}", e))
        })?;

        info!("Document store initialized at {:?}", db_path);
        Ok(Self::from_db(db))
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ChatError::Storage(format!("Failed to open temporary store: {}", e)))?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        Self {
            db: Arc::new(db),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            clock: Arc::new(Utc::now),
            offline: Arc::new(AtomicBool::new(false)),
            latency_compensation: true,
        }
    }

    /// Replace the clock used to resolve server timestamps
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// When enabled, a create is first delivered with a null timestamp and
    /// then again once the timestamp is resolved.
    pub fn with_latency_compensation(mut self, enabled: bool) -> Self {
        self.latency_compensation = enabled;
        self
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(AtomicOrdering::SeqCst)
    }

    /// Simulate losing the connection. Writes fail while offline and every
    /// live subscription gets one error; coming back re-delivers snapshots.
    pub async fn set_offline(&self, offline: bool) {
        let was = self.offline.swap(offline, AtomicOrdering::SeqCst);
        if was == offline {
            return;
        }

        if offline {
            warn!("Document store going offline");
            let subs = self.subscribers.read().await;
            for sub in subs.values().flatten() {
                let _ = sub
                    .tx
                    .send(Err(ChatError::Subscription("store offline".to_string())));
            }
        } else {
            info!("Document store back online");
            let paths: Vec<String> = self.subscribers.read().await.keys().cloned().collect();
            for path in paths {
                self.notify(&path).await;
            }
        }
    }

    /// All documents directly under `path` (nested collections excluded)
    pub fn list(&self, path: &str) -> Result<Vec<RawDocument>> {
        let prefix = format!("{}/", path);
        let mut docs = Vec::new();

        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry
                .map_err(|e| ChatError::Storage(format!("Failed to list documents: {}", e)))?;
            let key = String::from_utf8_lossy(&key);
            let id = &key[prefix.len()..];
            if id.contains('/') {
                continue;
            }
            match serde_json::from_slice::<Document>(&value) {
                Ok(fields) => docs.push(RawDocument {
                    id: id.to_string(),
                    fields,
                }),
                Err(e) => warn!("Skipping unreadable document {}: {}", key, e),
            }
        }

        Ok(docs)
    }

    /// Current ordered snapshot of a collection
    pub fn snapshot(
        &self,
        path: &str,
        order_field: &str,
        direction: Direction,
    ) -> Result<Vec<RawDocument>> {
        let mut docs = self.list(path)?;
        docs.sort_by(|a, b| {
            compare_field(a.fields.get(order_field), b.fields.get(order_field))
                .then_with(|| a.id.cmp(&b.id))
        });
        if direction == Direction::Descending {
            docs.reverse();
        }
        Ok(docs)
    }

    /// Write a document under a caller-chosen id (seeding profiles and
    /// conversation records) and notify subscribers.
    pub async fn set_document(&self, path: &str, id: &str, fields: Document) -> Result<()> {
        self.ensure_online("set")?;
        let resolved = self.resolve_sentinels(&fields, Some((self.clock)()));
        self.put(path, id, &resolved)?;
        self.notify(path).await;
        Ok(())
    }

    fn get(&self, path: &str, id: &str) -> Result<Option<Document>> {
        let key = format!("{}/{}", path, id);
        match self.db.get(key.as_bytes()) {
            Ok(Some(value)) => Ok(Some(serde_json::from_slice(&value)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ChatError::Storage(format!("Failed to fetch document: {}", e))),
        }
    }

    fn put(&self, path: &str, id: &str, fields: &Document) -> Result<()> {
        let key = format!("{}/{}", path, id);
        let value = serde_json::to_vec(fields)?;

        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| ChatError::Storage(format!("Failed to store document: {}", e)))?;

        self.db
            .flush()
            .map_err(|e| ChatError::Storage(format!("Failed to flush document store: {}", e)))?;

        Ok(())
    }

    fn ensure_online(&self, op: &str) -> Result<()> {
        if self.is_offline() {
            return Err(ChatError::Write(format!("{}: store offline", op)));
        }
        Ok(())
    }

    /// Replace top-level server timestamp sentinels with `now`, or null
    fn resolve_sentinels(&self, fields: &Document, now: Option<DateTime<Utc>>) -> Document {
        fields
            .iter()
            .map(|(k, v)| {
                let v = if is_server_timestamp(v) {
                    now.map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)))
                        .unwrap_or(Value::Null)
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect()
    }

    /// Push the current snapshot of `path` to its subscribers, pruning dead ones
    async fn notify(&self, path: &str) {
        let mut subs = self.subscribers.write().await;
        let Some(list) = subs.get_mut(path) else {
            return;
        };

        list.retain(|sub| {
            let snapshot = self.snapshot(path, &sub.order_field, sub.direction);
            sub.tx.send(snapshot).is_ok()
        });

        if list.is_empty() {
            debug!("No live subscribers left on {}", path);
            subs.remove(path);
        }
    }
}

/// Nulls and missing values sort last. Strings that both parse as RFC 3339
/// compare as instants.
fn compare_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn subscribe_ordered(
        &self,
        path: &str,
        order_field: &str,
        direction: Direction,
    ) -> Result<SnapshotStream> {
        if self.is_offline() {
            return Err(ChatError::Subscription("store offline".to_string()));
        }

        // Snapshot and registration happen under the subscriber lock so a
        // concurrent write's notify cannot fall between them
        let mut subs = self.subscribers.write().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = self.snapshot(path, order_field, direction)?;
        let _ = tx.send(Ok(initial));

        subs.entry(path.to_string()).or_default().push(Subscriber {
            order_field: order_field.to_string(),
            direction,
            tx,
        });
        drop(subs);
        debug!("New subscription on {} ordered by {}", path, order_field);

        let stream = unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn create_document(&self, path: &str, fields: Document) -> Result<String> {
        self.ensure_online("create")?;
        let id = Uuid::new_v4().simple().to_string();

        if self.latency_compensation && fields.values().any(is_server_timestamp) {
            let pending = self.resolve_sentinels(&fields, None);
            self.put(path, &id, &pending)?;
            self.notify(path).await;
        }

        let resolved = self.resolve_sentinels(&fields, Some((self.clock)()));
        self.put(path, &id, &resolved)?;
        self.notify(path).await;

        debug!("Created {}/{}", path, id);
        Ok(id)
    }

    async fn update_document(&self, path: &str, id: &str, fields: Document) -> Result<()> {
        self.ensure_online("update")?;
        let mut existing = self
            .get(path, id)?
            .ok_or_else(|| ChatError::Write(format!("document {}/{} does not exist", path, id)))?;

        let now = (self.clock)();
        for (k, v) in self.resolve_sentinels(&fields, Some(now)) {
            existing.insert(k, v);
        }
        self.put(path, id, &existing)?;
        self.notify(path).await;

        debug!("Updated {}/{}", path, id);
        Ok(())
    }

    async fn delete_document(&self, path: &str, id: &str) -> Result<()> {
        self.ensure_online("delete")?;
        let key = format!("{}/{}", path, id);

        self.db
            .remove(key.as_bytes())
            .map_err(|e| ChatError::Storage(format!("Failed to delete document: {}", e)))?;
        self.notify(path).await;

        debug!("Deleted {}", key);
        Ok(())
    }

    async fn read_document(&self, path: &str, id: &str) -> Result<Option<Document>> {
        if self.is_offline() {
            return Err(ChatError::Read("store offline".to_string()));
        }
        self.get(path, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::server_timestamp;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn fields(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_document_store_basic() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalDocumentStore::open(temp_dir.path()).unwrap();

        let id = store
            .create_document("users", fields(json!({ "displayName": "Ada" })))
            .await
            .unwrap();

        let doc = store.read_document("users", &id).await.unwrap().unwrap();
        assert_eq!(doc["displayName"], "Ada");

        store
            .update_document("users", &id, fields(json!({ "bio": "hi" })))
            .await
            .unwrap();
        let doc = store.read_document("users", &id).await.unwrap().unwrap();
        assert_eq!(doc["displayName"], "Ada");
        assert_eq!(doc["bio"], "hi");

        store.delete_document("users", &id).await.unwrap();
        assert!(store.read_document("users", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_skips_nested_collections() {
        let store = LocalDocumentStore::in_memory().unwrap();
        store
            .create_document("conversations", fields(json!({ "participants": ["a", "b"] })))
            .await
            .unwrap();
        store
            .create_document("conversations/c1/messages", fields(json!({ "content": "x" })))
            .await
            .unwrap();

        assert_eq!(store.list("conversations").unwrap().len(), 1);
        assert_eq!(store.list("conversations/c1/messages").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_server_timestamp_resolved_with_pending_first() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let store = LocalDocumentStore::in_memory().unwrap().with_clock(move || t);

        let mut stream = store
            .subscribe_ordered("c/messages", "timestamp", Direction::Ascending)
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().unwrap().is_empty());

        store
            .create_document("c/messages", fields(json!({ "timestamp": server_timestamp() })))
            .await
            .unwrap();

        let pending = stream.next().await.unwrap().unwrap();
        assert_eq!(pending[0].fields["timestamp"], Value::Null);

        let confirmed = stream.next().await.unwrap().unwrap();
        assert_eq!(confirmed[0].fields["timestamp"], "2024-05-01T10:00:00.000Z");
    }

    #[tokio::test]
    async fn test_snapshot_ordering_nulls_last() {
        let store = LocalDocumentStore::in_memory().unwrap();
        store.put("p", "b", &fields(json!({ "timestamp": "2024-01-01T10:02:00.000Z" }))).unwrap();
        store.put("p", "a", &fields(json!({ "timestamp": null }))).unwrap();
        store.put("p", "c", &fields(json!({ "timestamp": "2024-01-01T10:00:00.000Z" }))).unwrap();

        let ids: Vec<String> = store
            .snapshot("p", "timestamp", Direction::Ascending)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_timestamps_compare_as_instants() {
        let whole = json!("2024-01-01T10:00:00Z");
        let later = json!("2024-01-01T10:00:00.500Z");
        let offset = json!("2024-01-01T11:00:00.250+01:00");
        assert_eq!(compare_field(Some(&whole), Some(&later)), Ordering::Less);
        assert_eq!(compare_field(Some(&offset), Some(&later)), Ordering::Less);
        assert_eq!(compare_field(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
    }

    #[tokio::test]
    async fn test_write_during_subscribe_is_in_first_snapshot() {
        let store = LocalDocumentStore::in_memory().unwrap();

        // Park the subscriber behind the lock a writer's notify would take
        let guard = store.subscribers.write().await;
        let task = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .subscribe_ordered("p", "timestamp", Direction::Ascending)
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store
            .put("p", "m1", &fields(json!({ "timestamp": "2024-01-01T10:00:00.000Z" })))
            .unwrap();
        drop(guard);

        let mut stream = task.await.unwrap().unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "m1");
    }

    #[tokio::test]
    async fn test_offline_fails_writes_and_signals_subscribers() {
        let store = LocalDocumentStore::in_memory().unwrap();
        let mut stream = store
            .subscribe_ordered("p", "timestamp", Direction::Ascending)
            .await
            .unwrap();
        stream.next().await.unwrap().unwrap();

        store.set_offline(true).await;
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(ChatError::Subscription(_))
        ));
        let err = store.create_document("p", Document::new()).await.unwrap_err();
        assert!(matches!(err, ChatError::Write(_)));

        store.set_offline(false).await;
        assert!(stream.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let store = LocalDocumentStore::in_memory().unwrap();
        let stream = store
            .subscribe_ordered("p", "timestamp", Direction::Ascending)
            .await
            .unwrap();
        drop(stream);

        store.create_document("p", Document::new()).await.unwrap();
        assert!(store.subscribers.read().await.get("p").is_none());
    }
}
