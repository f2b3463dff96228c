/// Event emitter for the UI boundary
use crate::messenger_types::ChatEvent;
use tokio::sync::broadcast;
use tracing::trace;

pub struct EventEmitter {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver to every current listener. Having no listener is not an error.
    pub fn emit(&self, event: ChatEvent) {
        trace!("emit {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }
}

impl Clone for EventEmitter {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
