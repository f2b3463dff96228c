/// Mutation engine: user-initiated writes plus local composition state
///
/// The engine never touches the message view. Writes go to the backing
/// store and come back through the store's subscription.
use crate::attachment::AttachmentEncoder;
use crate::backend::{server_timestamp, Document, DocumentStore};
use crate::error::{ChatError, Result};
use crate::messenger_types::{Attachment, ChatEvent, Message, ReplyRef, UserProfile};
use crate::message_store::MessageStore;
use crate::utils::event_emitter::EventEmitter;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the composer is currently doing. Reply and edit exclude each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ComposeMode {
    #[default]
    Idle,
    Replying(Message),
    Editing(String),
}

/// Session-local composer state, never persisted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Composition {
    draft_text: String,
    pending_attachment: Option<Attachment>,
    mode: ComposeMode,
}

impl Composition {
    pub fn draft_text(&self) -> &str {
        &self.draft_text
    }

    pub fn pending_attachment(&self) -> Option<&Attachment> {
        self.pending_attachment.as_ref()
    }

    pub fn mode(&self) -> &ComposeMode {
        &self.mode
    }

    pub fn reply_target(&self) -> Option<&Message> {
        match &self.mode {
            ComposeMode::Replying(m) => Some(m),
            _ => None,
        }
    }

    pub fn edit_target(&self) -> Option<&str> {
        match &self.mode {
            ComposeMode::Editing(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.mode == ComposeMode::Idle
    }
}

/// Result of submitting the composer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Sent(String),
    Edited(String),
    /// Nothing to send
    Skipped,
}

pub struct MutationEngine {
    backend: Arc<dyn DocumentStore>,
    store: MessageStore,
    user: UserProfile,
    messages_path: Option<String>,
    composition: Composition,
    encoder: AttachmentEncoder,
    /// Object URL minted for the composer that has not been sent yet
    unsent_object: Option<String>,
    events: EventEmitter,
}

impl MutationEngine {
    pub fn new(
        backend: Arc<dyn DocumentStore>,
        store: MessageStore,
        user: UserProfile,
        encoder: AttachmentEncoder,
        events: EventEmitter,
    ) -> Self {
        Self {
            backend,
            store,
            user,
            messages_path: None,
            composition: Composition::default(),
            encoder,
            unsent_object: None,
            events,
        }
    }

    /// Point the engine at a conversation's message collection with a fresh composer
    pub fn bind(&mut self, messages_path: String) {
        debug!("Mutation engine bound to {}", messages_path);
        self.messages_path = Some(messages_path);
        self.reset_composition(None);
    }

    pub fn unbind(&mut self) {
        self.messages_path = None;
        self.reset_composition(None);
    }

    pub fn composition(&self) -> &Composition {
        &self.composition
    }

    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    // ─── Local state transitions ────────────────────────────────────────────

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.composition.draft_text = text.into();
    }

    pub fn attach(&mut self, attachment: Attachment) {
        self.release_unsent();
        self.composition.pending_attachment = Some(attachment);
    }

    /// Encode a file and make it the pending attachment.
    /// On failure the composer is left exactly as it was.
    pub async fn attach_file(&mut self, path: &Path) -> Result<()> {
        match self.encoder.encode_path(path).await {
            Ok(attachment) => {
                self.release_unsent();
                if self.encoder.owns(&attachment.url) {
                    self.unsent_object = Some(attachment.url.clone());
                }
                self.composition.pending_attachment = Some(attachment);
                Ok(())
            }
            Err(e) => {
                self.report("attach", &e);
                Err(e)
            }
        }
    }

    pub fn clear_attachment(&mut self) {
        self.release_unsent();
        self.composition.pending_attachment = None;
    }

    pub fn begin_reply(&mut self, message: &Message) {
        if matches!(self.composition.mode, ComposeMode::Editing(_)) {
            self.release_unsent();
            self.composition.draft_text.clear();
            self.composition.pending_attachment = None;
        }
        self.composition.mode = ComposeMode::Replying(message.clone());
    }

    pub fn cancel_reply(&mut self) {
        if matches!(self.composition.mode, ComposeMode::Replying(_)) {
            self.composition.mode = ComposeMode::Idle;
        }
    }

    /// Enter edit mode for one of the user's own messages, prefilling the composer
    pub fn begin_edit(&mut self, message: &Message) -> Result<()> {
        self.authorize(message)?;
        self.release_unsent();
        self.composition = Composition {
            draft_text: message.content.clone(),
            pending_attachment: message.attachment.clone(),
            mode: ComposeMode::Editing(message.id.clone()),
        };
        Ok(())
    }

    pub fn cancel_edit(&mut self) {
        if matches!(self.composition.mode, ComposeMode::Editing(_)) {
            self.reset_composition(None);
        }
    }

    // ─── Backing-store writes ───────────────────────────────────────────────

    /// Send the composer's content as a new message or as an edit,
    /// depending on the current mode.
    pub async fn submit(&mut self) -> Result<SubmitOutcome> {
        let draft = self.composition.draft_text.clone();
        let attachment = self.composition.pending_attachment.clone();

        match self.composition.mode.clone() {
            ComposeMode::Editing(id) => {
                if self.edit(&id, &draft, attachment).await? {
                    Ok(SubmitOutcome::Edited(id))
                } else {
                    Ok(SubmitOutcome::Skipped)
                }
            }
            ComposeMode::Replying(target) => {
                Ok(self
                    .send(&draft, attachment, Some(&target))
                    .await?
                    .map(SubmitOutcome::Sent)
                    .unwrap_or(SubmitOutcome::Skipped))
            }
            ComposeMode::Idle => Ok(self
                .send(&draft, attachment, None)
                .await?
                .map(SubmitOutcome::Sent)
                .unwrap_or(SubmitOutcome::Skipped)),
        }
    }

    /// Create a message. Returns `None` without writing when there is
    /// neither text nor an attachment.
    pub async fn send(
        &mut self,
        draft_text: &str,
        attachment: Option<Attachment>,
        reply_target: Option<&Message>,
    ) -> Result<Option<String>> {
        if draft_text.trim().is_empty() && attachment.is_none() {
            debug!("Ignoring empty send");
            return Ok(None);
        }
        let path = self.bound_path()?;

        let reply_ref = reply_target.map(|target| ReplyRef {
            target_id: target.id.clone(),
            target_content_snapshot: target.reply_snapshot(),
        });

        let mut fields = Document::new();
        fields.insert("senderId".into(), json!(self.user.uid));
        fields.insert("senderName".into(), json!(self.user.display_name));
        fields.insert("senderAvatarUrl".into(), json!(self.user.photo_url));
        fields.insert("content".into(), json!(draft_text));
        fields.insert("attachment".into(), to_value(&attachment)?);
        fields.insert("replyRef".into(), to_value(&reply_ref)?);
        fields.insert("timestamp".into(), server_timestamp());
        fields.insert("edited".into(), json!(false));

        match self.backend.create_document(&path, fields).await {
            Ok(id) => {
                info!("Sent message {}", id);
                self.reset_composition(attachment.as_ref());
                self.events.emit(ChatEvent::MessageSent {
                    message_id: id.clone(),
                });
                Ok(Some(id))
            }
            Err(e) => {
                let e = e.into_write();
                self.report("send", &e);
                Err(e)
            }
        }
    }

    /// Overwrite content and attachment of one of the user's messages.
    /// Returns `false` without writing when the new content is empty.
    pub async fn edit(
        &mut self,
        message_id: &str,
        new_content: &str,
        attachment: Option<Attachment>,
    ) -> Result<bool> {
        let path = self.bound_path()?;
        let target = match self.locate(&path, message_id).await {
            Ok(target) => target,
            Err(e) => {
                self.report("edit", &e);
                return Err(e);
            }
        };
        if let Err(e) = self.authorize(&target) {
            self.report("edit", &e);
            return Err(e);
        }
        if new_content.trim().is_empty() && attachment.is_none() {
            debug!("Ignoring edit of {} to empty content", message_id);
            return Ok(false);
        }

        let mut fields = Document::new();
        fields.insert("content".into(), json!(new_content));
        fields.insert("attachment".into(), to_value(&attachment)?);
        fields.insert("edited".into(), json!(true));

        match self.backend.update_document(&path, message_id, fields).await {
            Ok(()) => {
                info!("Edited message {}", message_id);
                if self.composition.edit_target() == Some(message_id) {
                    self.reset_composition(attachment.as_ref());
                }
                self.events.emit(ChatEvent::MessageEdited {
                    message_id: message_id.to_string(),
                });
                Ok(true)
            }
            Err(e) => {
                let e = e.into_write();
                self.report("edit", &e);
                Err(e)
            }
        }
    }

    /// Remove one of the user's messages. Replies to it keep their snapshot.
    pub async fn delete(&mut self, message_id: &str) -> Result<()> {
        let path = self.bound_path()?;
        let target = match self.locate(&path, message_id).await {
            Ok(target) => target,
            Err(e) => {
                self.report("delete", &e);
                return Err(e);
            }
        };
        if let Err(e) = self.authorize(&target) {
            self.report("delete", &e);
            return Err(e);
        }

        match self.backend.delete_document(&path, message_id).await {
            Ok(()) => {
                info!("Deleted message {}", message_id);
                if self.composition.edit_target() == Some(message_id) {
                    self.reset_composition(None);
                }
                self.events.emit(ChatEvent::MessageDeleted {
                    message_id: message_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                let e = e.into_write();
                self.report("delete", &e);
                Err(e)
            }
        }
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    /// Drop the composer's unsent object URL, if any
    fn release_unsent(&mut self) {
        if let Some(url) = self.unsent_object.take() {
            self.encoder.revoke(&url);
        }
    }

    /// Clear the composer. `persisted` is the attachment that just went into a
    /// stored message; its object URL stays live.
    fn reset_composition(&mut self, persisted: Option<&Attachment>) {
        if let Some(url) = self.unsent_object.take() {
            if persisted.map(|a| a.url.as_str()) != Some(url.as_str()) {
                self.encoder.revoke(&url);
            }
        }
        self.composition = Composition::default();
    }

    fn bound_path(&self) -> Result<String> {
        self.messages_path
            .clone()
            .ok_or(ChatError::NoActiveConversation)
    }

    /// Find a message in the live view, falling back to a direct read
    async fn locate(&self, path: &str, message_id: &str) -> Result<Message> {
        if let Some(msg) = self.store.get(message_id).await {
            return Ok(msg);
        }
        let fields = self
            .backend
            .read_document(path, message_id)
            .await
            .map_err(ChatError::into_read)?
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        Message::from_document(message_id, &fields)
    }

    fn authorize(&self, message: &Message) -> Result<()> {
        if !message.is_authored_by(&self.user.uid) {
            warn!(
                "User {} tried to modify message {} by {}",
                self.user.uid, message.id, message.sender_id
            );
            return Err(ChatError::AuthorizationViolation {
                message_id: message.id.clone(),
                user_id: self.user.uid.clone(),
            });
        }
        Ok(())
    }

    fn report(&self, operation: &str, error: &ChatError) {
        warn!("{} failed: {}", operation, error);
        self.events.emit(ChatEvent::OperationFailed {
            operation: operation.to_string(),
            error: error.to_string(),
        });
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
