/// chatsync - live message sync and mutation engine for one conversation
///
/// Keeps an ordered, continuously updated view of a conversation fed by a
/// document store's live snapshots, and layers user writes (send, edit,
/// delete, reply) plus local composer state on top of it.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod backend;
pub mod document_store;
pub mod attachment;
pub mod message_store;
pub mod mutation;
pub mod session;
pub mod utils;
pub mod cli_app;

pub use error::{ChatError, Result};
pub use config::Config;
pub use backend::{DocumentStore, Direction, RawDocument};
pub use document_store::LocalDocumentStore;
pub use message_store::{MessageStore, Subscription};
pub use messenger_types::{Attachment, AttachmentKind, ChatEvent, Conversation, Message, ReplyRef, UserProfile};
pub use mutation::{ComposeMode, Composition, MutationEngine, SubmitOutcome};
pub use session::ChatSession;
