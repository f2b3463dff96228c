/// Message store: the ordered, live view of one conversation
///
/// Every delivery from the backing store is a full snapshot. It is decoded,
/// sorted and swapped in as the whole view; nothing is patched in place.
use crate::backend::{messages_path, Direction, DocumentStore, RawDocument, TIMESTAMP_FIELD};
use crate::error::{ChatError, Result};
use crate::messenger_types::{ChatEvent, Message};
use crate::utils::event_emitter::EventEmitter;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct StoreState {
    conversation_id: Option<String>,
    /// Generation of the subscription allowed to write into the view
    active: Option<u64>,
    next_generation: u64,
    messages: Vec<Message>,
    start_date: Option<DateTime<Utc>>,
    loading: bool,
    last_error: Option<String>,
}

#[derive(Clone)]
pub struct MessageStore {
    state: Arc<RwLock<StoreState>>,
    events: EventEmitter,
}

/// Handle of an open subscription. Dropping it stops delivery as well.
pub struct Subscription {
    conversation_id: String,
    generation: u64,
    state: Arc<RwLock<StoreState>>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Close the feed. Once this returns, no delivery from it reaches the view.
    pub async fn unsubscribe(self) {
        release_generation(&mut *self.state.write().await, self.generation);
        self.task.abort();
        info!("Closed subscription for conversation {}", self.conversation_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();

        // Without an explicit unsubscribe the view must not keep claiming a feed
        let generation = self.generation;
        match self.state.try_write() {
            Ok(mut state) => release_generation(&mut state, generation),
            Err(_) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let state = self.state.clone();
                    handle.spawn(async move {
                        release_generation(&mut *state.write().await, generation);
                    });
                }
            }
        }
    }
}

fn release_generation(state: &mut StoreState, generation: u64) {
    if state.active == Some(generation) {
        state.active = None;
        state.loading = false;
    }
}

impl MessageStore {
    pub fn new(events: EventEmitter) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            events,
        }
    }

    /// Open the live feed of `conversation_id`.
    ///
    /// The view is emptied and marked loading until the first snapshot.
    /// Any subscription opened earlier stops being able to write the view.
    pub async fn subscribe(
        &self,
        backend: Arc<dyn DocumentStore>,
        collection_root: &str,
        conversation_id: &str,
    ) -> Result<Subscription> {
        let path = messages_path(collection_root, conversation_id);
        let mut stream = backend
            .subscribe_ordered(&path, TIMESTAMP_FIELD, Direction::Ascending)
            .await
            .map_err(ChatError::into_subscription)?;

        let generation = {
            let mut state = self.state.write().await;
            if state.active.is_some() {
                warn!(
                    "Replacing open subscription for {:?} with {}",
                    state.conversation_id, conversation_id
                );
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            state.active = Some(generation);
            state.conversation_id = Some(conversation_id.to_string());
            state.messages.clear();
            state.start_date = None;
            state.loading = true;
            state.last_error = None;
            generation
        };
        info!("Subscribed to {} (generation {})", path, generation);

        let store = self.clone();
        let conv = conversation_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                store.deliver(generation, &conv, item).await;
            }
            debug!("Feed for {} ended (generation {})", conv, generation);
        });

        Ok(Subscription {
            conversation_id: conversation_id.to_string(),
            generation,
            state: self.state.clone(),
            task,
        })
    }

    /// Apply one delivery if it belongs to the active subscription
    async fn deliver(&self, generation: u64, conversation_id: &str, item: Result<Vec<RawDocument>>) {
        let event = {
            let mut state = self.state.write().await;
            if state.active != Some(generation) {
                debug!("Dropping late delivery from closed generation {}", generation);
                return;
            }

            match item {
                Ok(docs) => {
                    let messages = order_view(&docs);
                    state.start_date = start_date(&messages);
                    state.messages = messages;
                    state.loading = false;
                    state.last_error = None;
                    ChatEvent::ViewUpdated {
                        conversation_id: conversation_id.to_string(),
                        message_count: state.messages.len(),
                    }
                }
                Err(e) => {
                    warn!("Subscription error on {}: {}", conversation_id, e);
                    state.loading = false;
                    state.last_error = Some(e.to_string());
                    ChatEvent::SubscriptionFailed {
                        conversation_id: conversation_id.to_string(),
                        error: e.to_string(),
                    }
                }
            }
        };
        self.events.emit(event);
    }

    /// Ordered copy of the current view
    pub async fn ordered_view(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// Earliest confirmed timestamp in view
    pub async fn conversation_start_date(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.start_date
    }

    pub async fn get(&self, message_id: &str) -> Option<Message> {
        self.state
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
    }

    pub async fn is_loading(&self) -> bool {
        self.state.read().await.loading
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_error.clone()
    }

    pub async fn conversation_id(&self) -> Option<String> {
        self.state.read().await.conversation_id.clone()
    }

    pub async fn is_subscribed(&self) -> bool {
        self.state.read().await.active.is_some()
    }

    /// Drop the view and detach from any conversation
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let next_generation = state.next_generation;
        *state = StoreState {
            next_generation,
            ..Default::default()
        };
    }
}

/// Decode a snapshot into the ordered view.
///
/// Undecodable documents are skipped; duplicate ids keep the last copy.
pub fn order_view(docs: &[RawDocument]) -> Vec<Message> {
    let mut by_id: HashMap<&str, Message> = HashMap::with_capacity(docs.len());
    for doc in docs {
        match Message::from_document(&doc.id, &doc.fields) {
            Ok(msg) => {
                by_id.insert(doc.id.as_str(), msg);
            }
            Err(e) => warn!("Skipping undecodable message {}: {}", doc.id, e),
        }
    }

    let mut messages: Vec<Message> = by_id.into_values().collect();
    messages.sort_by(compare_messages);
    messages
}

/// Ascending timestamp, pending last, ties broken by id
pub fn compare_messages(a: &Message, b: &Message) -> Ordering {
    match (a.timestamp, b.timestamp) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

fn start_date(messages: &[Message]) -> Option<DateTime<Utc>> {
    messages.iter().filter_map(|m| m.timestamp).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn raw(id: &str, timestamp: Value) -> RawDocument {
        RawDocument {
            id: id.to_string(),
            fields: json!({ "senderId": "u1", "content": id, "timestamp": timestamp })
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_out_of_order_arrival_is_sorted() {
        let view = order_view(&[
            raw("a", json!("2024-05-01T10:00:00Z")),
            raw("b", json!("2024-05-01T10:02:00Z")),
            raw("c", json!("2024-05-01T10:01:00Z")),
        ]);
        assert_eq!(ids(&view), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_pending_trails_and_ties_break_by_id() {
        let view = order_view(&[
            raw("p2", Value::Null),
            raw("z", json!("2024-05-01T10:00:00Z")),
            raw("p1", Value::Null),
            raw("y", json!("2024-05-01T10:00:00Z")),
        ]);
        assert_eq!(ids(&view), vec!["y", "z", "p1", "p2"]);

        let reversed = order_view(&[
            raw("y", json!("2024-05-01T10:00:00Z")),
            raw("p1", Value::Null),
            raw("z", json!("2024-05-01T10:00:00Z")),
            raw("p2", Value::Null),
        ]);
        assert_eq!(view, reversed);
    }

    #[test]
    fn test_bad_documents_skipped_and_duplicates_collapsed() {
        let mut broken = raw("x", json!("2024-05-01T10:00:00Z"));
        broken.fields.remove("senderId");
        let mut newer = raw("a", json!("2024-05-01T10:05:00Z"));
        newer.fields.insert("content".into(), json!("second copy"));

        let view = order_view(&[raw("a", json!("2024-05-01T10:00:00Z")), broken, newer]);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].content, "second copy");
    }

    #[test]
    fn test_start_date_ignores_pending() {
        let view = order_view(&[
            raw("b", json!("2024-05-01T10:02:00Z")),
            raw("p", Value::Null),
            raw("a", json!("2024-05-01T09:00:00Z")),
        ]);
        assert_eq!(
            start_date(&view).unwrap().to_rfc3339(),
            "2024-05-01T09:00:00+00:00"
        );
        assert_eq!(start_date(&order_view(&[raw("p", Value::Null)])), None);
        assert_eq!(start_date(&[]), None);
    }

    #[tokio::test]
    async fn test_dropped_subscription_releases_view() {
        let backend: Arc<dyn DocumentStore> =
            Arc::new(crate::document_store::LocalDocumentStore::in_memory().unwrap());
        let store = MessageStore::new(EventEmitter::new(8));

        let first = store.subscribe(backend.clone(), "conversations", "c1").await.unwrap();
        drop(first);
        assert!(!store.is_subscribed().await);
        assert!(!store.is_loading().await);

        // A stale handle dropped late leaves a newer feed alone
        let older = store.subscribe(backend.clone(), "conversations", "c1").await.unwrap();
        let newer = store.subscribe(backend, "conversations", "c2").await.unwrap();
        drop(older);
        assert!(store.is_subscribed().await);
        assert_eq!(store.conversation_id().await.as_deref(), Some("c2"));
        newer.unsubscribe().await;
        assert!(!store.is_subscribed().await);
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let store = MessageStore::new(EventEmitter::new(8));
        {
            let mut state = store.state.write().await;
            state.active = Some(1);
            state.conversation_id = Some("c".into());
        }

        store
            .deliver(0, "c", Ok(vec![raw("old", json!("2024-05-01T10:00:00Z"))]))
            .await;
        assert!(store.ordered_view().await.is_empty());

        store
            .deliver(1, "c", Ok(vec![raw("new", json!("2024-05-01T10:00:00Z"))]))
            .await;
        assert_eq!(store.ordered_view().await.len(), 1);
    }

    #[tokio::test]
    async fn test_error_keeps_last_good_view() {
        let events = EventEmitter::new(8);
        let mut rx = events.subscribe();
        let store = MessageStore::new(events);
        store.state.write().await.active = Some(0);

        let snapshot = vec![raw("a", json!("2024-05-01T10:00:00Z"))];
        store.deliver(0, "c", Ok(snapshot)).await;
        store
            .deliver(0, "c", Err(ChatError::Subscription("permission denied".into())))
            .await;

        assert_eq!(store.ordered_view().await.len(), 1);
        assert!(store.last_error().await.unwrap().contains("permission denied"));
        assert!(matches!(rx.recv().await.unwrap(), ChatEvent::ViewUpdated { .. }));
        assert!(matches!(rx.recv().await.unwrap(), ChatEvent::SubscriptionFailed { .. }));
    }
}
