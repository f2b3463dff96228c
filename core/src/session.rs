/// Conversation session: owns the lifecycle of the one active conversation
use crate::attachment::AttachmentEncoder;
use crate::backend::{messages_path, DocumentStore};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::messenger_types::{ChatEvent, Conversation, UserProfile};
use crate::message_store::{MessageStore, Subscription};
use crate::mutation::MutationEngine;
use crate::utils::event_emitter::EventEmitter;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

struct ActiveConversation {
    subscription: Subscription,
    conversation: Option<Conversation>,
    counterpart: Option<UserProfile>,
}

pub struct ChatSession {
    config: Config,
    backend: Arc<dyn DocumentStore>,
    store: MessageStore,
    engine: MutationEngine,
    encoder: AttachmentEncoder,
    events: EventEmitter,
    active: Option<ActiveConversation>,
}

impl ChatSession {
    pub fn new(config: Config, backend: Arc<dyn DocumentStore>) -> Self {
        let events = EventEmitter::new(config.event_buffer);
        let store = MessageStore::new(events.clone());
        let encoder = AttachmentEncoder::new(config.max_inline_attachment_bytes);
        let engine = MutationEngine::new(
            backend.clone(),
            store.clone(),
            config.user.clone(),
            encoder.clone(),
            events.clone(),
        );

        info!("Created chat session for user {}", config.user.uid);

        Self {
            config,
            backend,
            store,
            engine,
            encoder,
            events,
            active: None,
        }
    }

    /// Make `conversation_id` the active conversation.
    ///
    /// The previous subscription is closed before the new one is opened.
    /// If opening fails no conversation is active afterwards.
    pub async fn select_conversation(&mut self, conversation_id: &str) -> Result<()> {
        if self.conversation_id() == Some(conversation_id) {
            debug!("Conversation {} already active", conversation_id);
            return Ok(());
        }

        self.deselect_conversation().await;

        let subscription = self
            .store
            .subscribe(
                self.backend.clone(),
                &self.config.collection_root,
                conversation_id,
            )
            .await
            .map_err(|e| {
                warn!("Could not open conversation {}: {}", conversation_id, e);
                self.events.emit(ChatEvent::SubscriptionFailed {
                    conversation_id: conversation_id.to_string(),
                    error: e.to_string(),
                });
                e
            })?;

        self.engine
            .bind(messages_path(&self.config.collection_root, conversation_id));

        let (conversation, counterpart) = match self.resolve_counterpart(conversation_id).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Could not resolve counterpart of {}: {}", conversation_id, e);
                self.events.emit(ChatEvent::OperationFailed {
                    operation: "resolve_counterpart".to_string(),
                    error: e.to_string(),
                });
                (None, None)
            }
        };

        let counterpart_id = conversation
            .as_ref()
            .and_then(|c| c.counterpart_id(&self.config.user.uid))
            .map(str::to_string);

        info!(
            "Selected conversation {} (counterpart: {:?})",
            conversation_id, counterpart_id
        );
        self.events.emit(ChatEvent::ConversationSelected {
            conversation_id: conversation_id.to_string(),
            counterpart_id,
        });

        self.active = Some(ActiveConversation {
            subscription,
            conversation,
            counterpart,
        });
        Ok(())
    }

    /// Close the active conversation, if any, and clear everything derived from it
    pub async fn deselect_conversation(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let conversation_id = active.subscription.conversation_id().to_string();

        active.subscription.unsubscribe().await;
        self.store.clear().await;
        self.engine.unbind();

        self.events.emit(ChatEvent::ConversationClosed { conversation_id });
    }

    /// Read the conversation record once, then the other participant's profile
    async fn resolve_counterpart(
        &self,
        conversation_id: &str,
    ) -> Result<(Option<Conversation>, Option<UserProfile>)> {
        let Some(fields) = self
            .backend
            .read_document(&self.config.collection_root, conversation_id)
            .await
            .map_err(ChatError::into_read)?
        else {
            warn!("Conversation record {} not found", conversation_id);
            return Ok((None, None));
        };

        let conversation = Conversation::from_document(conversation_id, &fields)?;
        if conversation.participant_ids.len() != 2 {
            warn!(
                "Conversation {} has {} participants, expected 2",
                conversation_id,
                conversation.participant_ids.len()
            );
        }

        let profile = match conversation.counterpart_id(&self.config.user.uid) {
            Some(uid) => self
                .backend
                .read_document(&self.config.users_collection, uid)
                .await
                .map_err(ChatError::into_read)?
                .map(|doc| UserProfile::from_document(uid, &doc))
                .transpose()?,
            None => None,
        };

        Ok((Some(conversation), profile))
    }

    /// Create a two-party conversation record with `other_uid`
    pub async fn start_conversation(&self, other_uid: &str) -> Result<String> {
        if other_uid == self.config.user.uid {
            return Err(ChatError::Write(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        let fields = json!({ "participants": [self.config.user.uid, other_uid] })
            .as_object()
            .cloned()
            .unwrap_or_default();

        let id = self
            .backend
            .create_document(&self.config.collection_root, fields)
            .await
            .map_err(ChatError::into_write)?;
        info!("Started conversation {} with {}", id, other_uid);
        Ok(id)
    }

    /// Encode a file into the pending attachment of the composer
    pub async fn attach_file(&mut self, path: &Path) -> Result<()> {
        self.engine.attach_file(path).await
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.active
            .as_ref()
            .map(|a| a.subscription.conversation_id())
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|a| a.conversation.as_ref())
    }

    pub fn counterpart_id(&self) -> Option<&str> {
        self.conversation()
            .and_then(|c| c.counterpart_id(&self.config.user.uid))
    }

    pub fn counterpart(&self) -> Option<&UserProfile> {
        self.active.as_ref().and_then(|a| a.counterpart.as_ref())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn user(&self) -> &UserProfile {
        &self.config.user
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn engine(&self) -> &MutationEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut MutationEngine {
        &mut self.engine
    }

    pub fn encoder(&self) -> &AttachmentEncoder {
        &self.encoder
    }

    /// New listener for UI events
    pub fn events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }
}
