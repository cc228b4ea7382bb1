//! A single cooperative task polling the OS clipboard for supported media
//! URLs, with adaptive backoff to minimize CPU on idle machines (spec
//! section 4.2).

use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, EventName};

const MIN_INTERVAL: Duration = Duration::from_millis(500);
const MAX_INTERVAL: Duration = Duration::from_secs(3);

/// Supported provider domains (spec section 4.2). Matched by suffix against
/// the parsed URL's host, never by regex.
const SUPPORTED_DOMAINS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "instagram.com",
    "tiktok.com",
    "twitter.com",
    "x.com",
    "facebook.com",
    "fb.watch",
    "twitch.tv",
    "vimeo.com",
    "dailymotion.com",
    "pinterest.com",
    "reddit.com",
    "threads.net",
    "soundcloud.com",
];

/// Parses `candidate` as an absolute `http(s)` URL with a non-empty host
/// that matches one of the supported provider domains.
#[must_use]
pub fn validate_media_url(candidate: &str) -> Option<String> {
    let parsed = url::Url::parse(candidate).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    let host = parsed.host_str()?;
    if host.is_empty() {
        return None;
    }
    let host = host.to_ascii_lowercase();
    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
        .then(|| candidate.to_string())
}

/// Abstraction over the OS clipboard so tests can inject a fake source
/// instead of touching the real clipboard.
pub trait ClipboardSource: Send + Sync {
    fn read(&self) -> Option<String>;
}

/// Reads the real OS clipboard via `arboard`.
pub struct SystemClipboard;

impl ClipboardSource for SystemClipboard {
    fn read(&self) -> Option<String> {
        arboard::Clipboard::new().ok()?.get_text().ok()
    }
}

/// Cooperative, single-task clipboard watcher. `start`/`stop` are each
/// idempotent (spec section 4.2/8: "`ClipboardWatcher.Stop()` called twice
/// never panics; a second Start after Stop works").
pub struct ClipboardWatcher {
    source: Box<dyn ClipboardSource>,
    bus: EventBus,
    token: Mutex<Option<CancellationToken>>,
}

impl ClipboardWatcher {
    #[must_use]
    pub fn new(source: Box<dyn ClipboardSource>, bus: EventBus) -> Self {
        Self {
            source,
            bus,
            token: Mutex::new(None),
        }
    }

    /// Idempotent: launches the polling loop if not already running.
    pub async fn start(self: std::sync::Arc<Self>) {
        let mut guard = self.token.lock().await;
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        let watcher = self.clone();
        tokio::spawn(async move { watcher.run(token).await });
    }

    /// Idempotent: safe to call repeatedly, including before `start`.
    pub async fn stop(&self) {
        if let Some(token) = self.token.lock().await.take() {
            token.cancel();
        }
    }

    async fn run(&self, token: CancellationToken) {
        let mut interval = MIN_INTERVAL;
        let mut last_seen: Option<String> = None;

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }

            match self.source.read() {
                Some(current) if Some(&current) != last_seen.as_ref() => {
                    if let Some(url) = validate_media_url(&current) {
                        self.bus.emit(EventName::ClipboardLinkDetected, url);
                    }
                    last_seen = Some(current);
                    interval = MIN_INTERVAL;
                }
                Some(_) | None => {
                    interval = interval.saturating_mul(2).min(MAX_INTERVAL);
                }
            }
        }
    }
}
