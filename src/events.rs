//! Named, best-effort broadcast to subscribers (spec section 4, "`EventBus`").
//! The only coupling between this core and a UI: the core never knows or
//! cares whether anyone is listening.

use serde::Serialize;
use tokio::sync::broadcast;

/// Event names defined in spec section 6. Not every variant is emitted by
/// this core today (e.g. `launcher:*`/`update:*`/`whisper:*` belong to
/// collaborators outside this core's scope), but the full wire vocabulary is
/// kept here so downstream consumers have one authoritative name list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventName {
    DownloadAdded,
    DownloadProgress,
    DownloadLog,
    RoadmapUpdate,
    ClipboardLinkDetected,
    AppReady,
    LauncherProgress,
    LauncherComplete,
    UpdateProgress,
    UpdateComplete,
    WhisperModelProgress,
    WhisperTranscribeProgress,
}

impl EventName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventName::DownloadAdded => "download:added",
            EventName::DownloadProgress => "download:progress",
            EventName::DownloadLog => "download:log",
            EventName::RoadmapUpdate => "roadmap:update",
            EventName::ClipboardLinkDetected => "clipboard:link-detected",
            EventName::AppReady => "app:ready",
            EventName::LauncherProgress => "launcher:progress",
            EventName::LauncherComplete => "launcher:complete",
            EventName::UpdateProgress => "update:progress",
            EventName::UpdateComplete => "update:complete",
            EventName::WhisperModelProgress => "whisper:model-progress",
            EventName::WhisperTranscribeProgress => "whisper:transcribe-progress",
        }
    }
}

/// An emitted event: a name plus a JSON payload, cheap to clone so many
/// subscribers can each hold their own copy.
#[derive(Clone, Debug)]
pub struct Event {
    pub name: EventName,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(name: EventName, payload: impl Serialize) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        Self { name, payload }
    }
}

/// Broadcast bus. Cloning an `EventBus` shares the same underlying channel
/// (it is itself cheap to clone, like `tokio::sync::broadcast::Sender`).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all events. The returned receiver sees every event
    /// emitted after this call, not before.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emit an event. Best-effort and non-blocking: if there are no
    /// subscribers (or the channel is momentarily full for a slow one), the
    /// event is simply dropped rather than blocking the caller (spec section
    /// 4.7/5: "emits should be non-blocking fire-and-forget").
    pub fn emit(&self, name: EventName, payload: impl Serialize) {
        let _ = self.sender.send(Event::new(name, payload));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events_in_order() {
        let bus = EventBus::with_capacity(16);
        let mut rx = bus.subscribe();
        bus.emit(EventName::DownloadAdded, serde_json::json!({"id": "a"}));
        bus.emit(EventName::DownloadProgress, serde_json::json!({"id": "a", "percent": 1.0}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, EventName::DownloadAdded);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.name, EventName::DownloadProgress);
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block_or_panic() {
        let bus = EventBus::with_capacity(4);
        bus.emit(EventName::AppReady, serde_json::json!(null));
    }
}
