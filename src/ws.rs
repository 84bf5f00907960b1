//! Live-console fan-out: plain core threads publish a JSON event into a
//! broadcast channel; only the async WebSocket handlers ever await on it.

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<String>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventHub { tx }
    }

    /// Non-blocking from the caller's side: drops the event if no one is
    /// listening rather than backing up a core thread.
    pub fn publish(&self, event: &impl serde::Serialize) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = self.tx.send(json);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
