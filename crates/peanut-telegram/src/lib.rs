//! Peanut Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence and client recreation,
//! plus the outbound side: chunked sends with Markdown fallback, typing
//! indicator, message reactions and file download

use anyhow::{anyhow, Result};
use peanut_config::TelegramConfig;
use peanut_ipc::{
    DeliveryHandle, Envelope, EventBus, FetchedMedia, MediaKind, MediaRef, MessageKind, Outbound,
};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
const CHANNEL_NAME: &str = "telegram";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub date: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramPhotoSize>>,
    #[serde(default)]
    pub document: Option<TelegramDocument>,
    #[serde(default)]
    pub sticker: Option<TelegramSticker>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramDocument {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSticker {
    pub file_id: String,
    #[serde(default)]
    pub is_animated: bool,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<TelegramPhotoSize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Display name used when attributing collected lines.
fn author_name(user: Option<&TelegramUser>) -> String {
    user.and_then(|u| u.username.clone().or_else(|| u.first_name.clone()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// `/temp@peanut_bot 0.7` -> (`temp`, [`0.7`]).
fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
    let rest = text.strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let head = parts.next()?;
    let name = head.split('@').next().unwrap_or(head).to_lowercase();
    if name.is_empty() {
        return None;
    }
    Some((name, parts.map(str::to_string).collect()))
}

/// Photos pick the largest size; only image documents count as attachments.
/// Animated and video stickers fall back to their static thumbnail.
fn extract_media_refs(message: &TelegramMessage) -> Vec<MediaRef> {
    let mut refs = Vec::new();

    if let Some(best) = message
        .photo
        .as_ref()
        .and_then(|sizes| sizes.iter().max_by_key(|p| p.width.saturating_mul(p.height)))
    {
        refs.push(MediaRef {
            kind: MediaKind::Attachment,
            file_id: best.file_id.clone(),
            filename: format!("photo_{}.jpg", message.message_id),
            mime_type: Some("image/jpeg".to_string()),
        });
    }

    if let Some(document) = &message.document {
        if document
            .mime_type
            .as_deref()
            .is_some_and(|mime| mime.starts_with("image/"))
        {
            refs.push(MediaRef {
                kind: MediaKind::Attachment,
                file_id: document.file_id.clone(),
                filename: document
                    .file_name
                    .clone()
                    .unwrap_or_else(|| format!("image_{}", message.message_id)),
                mime_type: document.mime_type.clone(),
            });
        }
    }

    if let Some(sticker) = &message.sticker {
        if sticker.is_animated || sticker.is_video {
            if let Some(thumb) = &sticker.thumbnail {
                refs.push(MediaRef {
                    kind: MediaKind::Sticker,
                    file_id: thumb.file_id.clone(),
                    filename: format!("sticker_{}.webp", message.message_id),
                    mime_type: None,
                });
            }
        } else {
            refs.push(MediaRef {
                kind: MediaKind::Sticker,
                file_id: sticker.file_id.clone(),
                filename: format!("sticker_{}.webp", message.message_id),
                mime_type: Some("image/webp".to_string()),
            });
        }
    }

    refs
}

/// Translates a Telegram message into an inbound envelope. Messages from bots
/// and messages with neither text nor usable media produce nothing.
pub fn to_envelope(message: &TelegramMessage) -> Option<Envelope> {
    let sender = message.from.as_ref();
    if sender.is_some_and(|u| u.is_bot) {
        return None;
    }
    let from = author_name(sender);
    let user_id = sender.map(|u| u.id).unwrap_or(message.chat.id);

    let text = message
        .text
        .clone()
        .or_else(|| message.caption.clone())
        .unwrap_or_default();

    let kind = if let Some((name, args)) = message.text.as_deref().and_then(parse_command) {
        MessageKind::Command {
            from,
            user_id,
            name,
            args,
        }
    } else {
        let media = extract_media_refs(message);
        if text.trim().is_empty() && media.is_empty() {
            return None;
        }
        MessageKind::Message {
            from,
            user_id,
            text,
            media,
        }
    };

    let mut envelope = Envelope::new(CHANNEL_NAME, kind)
        .with_chat_id(message.chat.id)
        .with_message_id(message.message_id);
    if message.date > 0 {
        envelope = envelope.with_timestamp(message.date);
    }
    Some(envelope)
}

fn guess_mime(path: &str) -> &'static str {
    let ext = path
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

fn chunk_message(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

        if end < chars.len() {
            if let Some(i) = (start..end)
                .rev()
                .find(|&i| matches!(chars[i], '\n' | ' ' | '.' | '!' | '?'))
            {
                end = i + 1;
            }
        }

        chunks.push(chars[start..end].iter().collect::<String>());
        start = end;
    }

    chunks
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    api_url: String,
    file_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, data_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            client: Self::build_client()?,
            bot_token: config.bot_token.clone(),
            api_url: format!("https://api.telegram.org/bot{}", config.bot_token),
            file_url: format!("https://api.telegram.org/file/bot{}", config.bot_token),
            data_dir,
            poll_timeout_secs: config.poll_timeout_secs.unwrap_or(60),
            client_recreate_interval_secs: config.client_recreate_interval_secs.unwrap_or(60),
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn build_client() -> Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))
    }

    fn offset_path(&self) -> PathBuf {
        let bot_id = self.bot_token.split(':').next().unwrap_or("default");
        self.data_dir
            .join("runtime")
            .join(format!("telegram.{}.offset", bot_id))
    }

    async fn read_offset(&self) -> Option<i64> {
        match fs::read_to_string(self.offset_path()).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let p = self.offset_path();
        if let Some(parent) = p.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(e) = fs::write(&p, format!("{}\n", offset)).await {
            warn!("Failed to persist telegram offset: {}", e);
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        client: &Client,
        method: &str,
        payload: &serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/{}", self.api_url, method);
        let resp = client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", method, e))?;

        let status = resp.status();
        let parsed: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} decode failed (HTTP {}): {}", method, status, e))?;

        if !parsed.ok {
            return Err(anyhow!(
                "telegram {} returned ok=false: {}",
                method,
                parsed.description.unwrap_or_default()
            ));
        }
        parsed
            .result
            .ok_or_else(|| anyhow!("telegram {} returned no result", method))
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        self.call(client, "getUpdates", &payload).await
    }

    /// Used by `peanut test telegram`.
    pub async fn get_me(&self) -> Result<TelegramUser> {
        self.call(&self.client, "getMe", &serde_json::json!({})).await
    }

    /// Sends `text`, splitting at the platform limit. Returns the handle of the
    /// first message sent.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<DeliveryHandle> {
        let mut first = None;

        for chunk in chunk_message(text) {
            let payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            });
            let sent = self.send_with_markdown_fallback(payload).await?;
            first.get_or_insert(DeliveryHandle {
                chat_id,
                message_id: sent.message_id,
            });
        }

        first.ok_or_else(|| anyhow!("telegram sendMessage had nothing to send"))
    }

    async fn send_with_markdown_fallback(&self, payload: serde_json::Value) -> Result<SentMessage> {
        match self
            .call::<SentMessage>(&self.client, "sendMessage", &payload)
            .await
        {
            Ok(sent) => Ok(sent),
            Err(err) => {
                warn!(
                    "telegram sendMessage failed with Markdown payload, retrying without parse_mode: {}",
                    err
                );
                let mut fallback_payload = payload;
                if let Some(obj) = fallback_payload.as_object_mut() {
                    obj.remove("parse_mode");
                }
                self.call(&self.client, "sendMessage", &fallback_payload)
                    .await
            }
        }
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "action": action,
        });
        let _: bool = self
            .call(&self.client, "sendChatAction", &payload)
            .await?;
        Ok(())
    }

    pub async fn set_reaction(&self, chat_id: i64, message_id: i64, emoji: &str) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reaction": [{ "type": "emoji", "emoji": emoji }],
        });
        let _: bool = self
            .call(&self.client, "setMessageReaction", &payload)
            .await?;
        Ok(())
    }

    pub async fn download_file(&self, file_id: &str) -> Result<(Vec<u8>, String)> {
        let file: TelegramFile = self
            .call(
                &self.client,
                "getFile",
                &serde_json::json!({ "file_id": file_id }),
            )
            .await?;
        let file_path = file
            .file_path
            .ok_or_else(|| anyhow!("telegram getFile returned no file_path"))?;

        let resp = self
            .client
            .get(format!("{}/{}", self.file_url, file_path))
            .send()
            .await
            .map_err(|e| anyhow!("telegram file download failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram file download HTTP error: {}", e))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| anyhow!("telegram file read failed: {}", e))?;

        Ok((bytes.to_vec(), file_path))
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("Recreating HTTP client to prevent stale connections");
                client = Self::build_client()?;
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;

                if let Some(message) = &update.message {
                    self.handle_message(message);
                }
            }
        }
    }

    async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        let commands = serde_json::json!([
            { "command": "help", "description": "Show help" },
            { "command": "status", "description": "Show model settings" },
            { "command": "temp", "description": "Set temperature (0-2)" },
            { "command": "topp", "description": "Set top-p (0-1)" },
            { "command": "model", "description": "Show or switch model" },
            { "command": "prompt", "description": "Show or switch system prompt" },
            { "command": "split", "description": "Toggle split replies" },
            { "command": "history", "description": "View or clear your context" },
            { "command": "clear", "description": "Clear your context" },
            { "command": "memo", "description": "Manage shared memos" },
            { "command": "schedule", "description": "Schedule messages" },
            { "command": "weather", "description": "Weather and daily alerts" },
            { "command": "reaction", "description": "Toggle emotion reactions" }
        ]);

        let _: bool = self
            .call(
                client,
                "setMyCommands",
                &serde_json::json!({ "commands": commands }),
            )
            .await?;
        Ok(())
    }

    fn handle_message(&self, message: &TelegramMessage) {
        let Some(envelope) = to_envelope(message) else {
            debug!(chat_id = message.chat.id, "Skipping message without content");
            return;
        };

        info!(
            chat_id = message.chat.id,
            message_id = message.message_id,
            from = %author_name(message.from.as_ref()),
            "Received telegram message"
        );

        match &self.event_bus {
            Some(event_bus) => {
                if let Err(e) = event_bus.publish(envelope) {
                    warn!("Failed to publish message to event bus: {}", e);
                }
            }
            None => info!("No event bus configured, message not forwarded"),
        }
    }
}

#[async_trait::async_trait]
impl Outbound for TelegramAdapter {
    async fn send(&self, chat_id: i64, text: &str) -> Result<DeliveryHandle> {
        self.send_message(chat_id, text).await
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        self.send_chat_action(chat_id, "typing").await
    }

    async fn react(&self, chat_id: i64, message_id: i64, emoji: &str) -> Result<()> {
        self.set_reaction(chat_id, message_id, emoji).await
    }

    async fn fetch_media(&self, media: &MediaRef) -> Result<FetchedMedia> {
        let (bytes, file_path) = self.download_file(&media.file_id).await?;
        let mime_type = media
            .mime_type
            .clone()
            .unwrap_or_else(|| guess_mime(&file_path).to_string());
        Ok(FetchedMedia { bytes, mime_type })
    }
}
