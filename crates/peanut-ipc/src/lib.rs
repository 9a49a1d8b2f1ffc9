//! Peanut IPC - adapter/core boundary
//!
//! Event bus for inbound platform messages and the outbound platform trait

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_schema_version() -> u16 {
    1
}

fn default_trace_id() -> String {
    generate_trace_id()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub channel: String,
    pub kind: MessageKind,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
    /// Unix seconds as reported by the platform.
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    #[serde(rename = "message")]
    Message {
        from: String,
        user_id: i64,
        text: String,
        #[serde(default)]
        media: Vec<MediaRef>,
    },

    #[serde(rename = "command")]
    Command {
        from: String,
        user_id: i64,
        name: String,
        args: Vec<String>,
    },

    #[serde(rename = "error")]
    Error { code: u16, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Attachment,
    Sticker,
}

/// Platform-side reference to an image or sticker, resolved lazily through [`Outbound::fetch_media`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
    pub filename: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Result of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Everything the core needs from a chat platform.
#[async_trait::async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<DeliveryHandle>;

    /// Private message; on most platforms the private chat id equals the user id.
    async fn send_direct(&self, user_id: i64, text: &str) -> anyhow::Result<DeliveryHandle> {
        self.send(user_id, text).await
    }

    async fn send_typing(&self, chat_id: i64) -> anyhow::Result<()>;

    async fn react(&self, chat_id: i64, message_id: i64, emoji: &str) -> anyhow::Result<()>;

    async fn fetch_media(&self, media: &MediaRef) -> anyhow::Result<FetchedMedia>;
}

impl Envelope {
    pub fn new(channel: &str, kind: MessageKind) -> Self {
        Self {
            schema_version: default_schema_version(),
            trace_id: generate_trace_id(),
            channel: channel.to_string(),
            kind,
            chat_id: None,
            message_id: None,
            timestamp: now_unix_secs() as i64,
        }
    }

    pub fn with_chat_id(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { inbound: inbound_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        if let Err(e) = self.inbound.send(envelope) {
            tracing::warn!("No subscriber for inbound envelope: {}", e);
            anyhow::bail!("event bus has no subscribers");
        }
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
