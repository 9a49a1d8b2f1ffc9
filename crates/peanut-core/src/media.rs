//! Image and sticker messages skip the collector and are answered at once.
//! Only the first usable item of a message is analyzed.

use crate::dispatcher::{DeliveryReport, Dispatcher, ImageRequest};
use peanut_ipc::{MediaKind, MediaRef, Outbound};
use std::sync::Arc;
use tracing::{info, warn};

pub const STICKER_PROMPT: &str =
    "Describe this sticker and tell me what emotion or situation it expresses.";
pub const IMAGE_PROMPT: &str = "Please describe this image in detail. What do you see?";

#[derive(Debug, Clone)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Fetches every referenced item in order. Items that fail to download are omitted.
pub async fn extract_media(outbound: &dyn Outbound, refs: &[MediaRef]) -> Vec<MediaItem> {
    let mut items = Vec::with_capacity(refs.len());
    for media in refs {
        match outbound.fetch_media(media).await {
            Ok(fetched) => items.push(MediaItem {
                kind: media.kind,
                filename: media.filename.clone(),
                mime_type: media.mime_type.clone().unwrap_or(fetched.mime_type),
                bytes: fetched.bytes,
            }),
            Err(e) => warn!(file = %media.filename, "Media download failed: {}", e),
        }
    }
    items
}

pub fn default_prompt(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Sticker => STICKER_PROMPT,
        MediaKind::Attachment => IMAGE_PROMPT,
    }
}

/// History stand-in for the media: the user's text plus a tag naming the file.
pub fn history_placeholder(text: &str, item: &MediaItem) -> String {
    let tag = match item.kind {
        MediaKind::Sticker => format!("[sticker: {}]", item.filename),
        MediaKind::Attachment => format!("[image: {}]", item.filename),
    };
    if text.is_empty() {
        tag
    } else {
        format!("{}\n{}", text, tag)
    }
}

pub fn build_request(text: &str, item: MediaItem) -> ImageRequest {
    let text = text.trim();
    let prompt = if text.is_empty() {
        default_prompt(item.kind).to_string()
    } else {
        text.to_string()
    };
    ImageRequest {
        prompt,
        placeholder: history_placeholder(text, &item),
        mime_type: item.mime_type,
        bytes: item.bytes,
    }
}

pub struct MediaHandler {
    dispatcher: Arc<Dispatcher>,
    outbound: Arc<dyn Outbound>,
}

impl MediaHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            dispatcher,
            outbound,
        }
    }

    /// Silently does nothing when no item could be fetched.
    pub async fn handle(
        &self,
        channel_id: i64,
        user_id: i64,
        text: &str,
        refs: &[MediaRef],
    ) -> Option<DeliveryReport> {
        let items = extract_media(self.outbound.as_ref(), refs).await;
        let first = items.into_iter().next()?;
        info!(
            channel_id = channel_id,
            user_id = user_id,
            file = %first.filename,
            kind = ?first.kind,
            "Analyzing media"
        );
        let request = build_request(text, first);
        self.dispatcher
            .dispatch_image(channel_id, user_id, request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{SplitSettings, IMAGE_APOLOGY_TEXT};
    use crate::history::ConversationStore;
    use crate::testing::{FakeBackend, FakeOutbound};
    use peanut_providers::Turn;

    fn media_ref(kind: MediaKind, file_id: &str, filename: &str) -> MediaRef {
        MediaRef {
            kind,
            file_id: file_id.to_string(),
            filename: filename.to_string(),
            mime_type: None,
        }
    }

    fn handler(backend: Arc<FakeBackend>, outbound: Arc<FakeOutbound>) -> MediaHandler {
        let dispatcher = Arc::new(Dispatcher::new(
            backend,
            Arc::new(ConversationStore::new(20)),
            outbound.clone(),
            SplitSettings::default(),
            false,
        ));
        MediaHandler::new(dispatcher, outbound)
    }

    #[test]
    fn placeholders_name_the_file() {
        let item = MediaItem {
            kind: MediaKind::Sticker,
            filename: "wave.png".to_string(),
            mime_type: "image/png".to_string(),
            bytes: Vec::new(),
        };
        assert_eq!(history_placeholder("", &item), "[sticker: wave.png]");
        assert_eq!(history_placeholder("hey", &item), "hey\n[sticker: wave.png]");
    }

    #[test]
    fn empty_text_uses_kind_specific_prompt() {
        let item = |kind| MediaItem {
            kind,
            filename: "f.png".to_string(),
            mime_type: "image/png".to_string(),
            bytes: vec![0],
        };
        assert_eq!(build_request("  ", item(MediaKind::Sticker)).prompt, STICKER_PROMPT);
        assert_eq!(build_request("", item(MediaKind::Attachment)).prompt, IMAGE_PROMPT);
        let request = build_request("what breed?", item(MediaKind::Attachment));
        assert_eq!(request.prompt, "what breed?");
        assert_eq!(request.placeholder, "what breed?\n[image: f.png]");
    }

    #[tokio::test(start_paused = true)]
    async fn only_first_fetched_item_is_analyzed() {
        let backend = Arc::new(FakeBackend::replying("Two dogs."));
        let outbound = Arc::new(FakeOutbound::default());
        outbound.add_media("b", &[2, 2], "image/png").await;
        outbound.add_media("c", &[3, 3], "image/webp").await;
        let handler = handler(backend.clone(), outbound.clone());

        let refs = vec![
            media_ref(MediaKind::Attachment, "missing", "a.jpg"),
            media_ref(MediaKind::Attachment, "b", "b.png"),
            media_ref(MediaKind::Sticker, "c", "c.webp"),
        ];
        handler.handle(10, 1, "", &refs).await.expect("analyzed");

        let calls = backend.image_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bytes, vec![2, 2]);
        assert_eq!(calls[0].mime_type, "image/png");
        assert_eq!(calls[0].prompt, IMAGE_PROMPT);
        assert_eq!(outbound.sent_texts().await, vec!["Two dogs."]);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fetched_is_a_silent_no_op() {
        let backend = Arc::new(FakeBackend::replying("unused"));
        let outbound = Arc::new(FakeOutbound::default());
        let handler = handler(backend.clone(), outbound.clone());

        let refs = vec![media_ref(MediaKind::Sticker, "gone", "gone.webp")];
        assert!(handler.handle(10, 1, "look", &refs).await.is_none());
        assert_eq!(backend.calls().await, 0);
        assert!(outbound.sent().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn history_excludes_current_placeholder_and_failure_apologizes() {
        let backend = Arc::new(FakeBackend::failing());
        let outbound = Arc::new(FakeOutbound::default());
        outbound.add_media("s", &[9], "image/webp").await;
        let handler = handler(backend.clone(), outbound.clone());
        handler
            .dispatcher
            .history()
            .append_exchange(1, "hi", "hello")
            .await;

        let refs = vec![media_ref(MediaKind::Sticker, "s", "s.webp")];
        assert!(handler.handle(10, 1, "", &refs).await.is_none());

        let calls = backend.image_calls().await;
        assert_eq!(calls[0].history, vec![Turn::user("hi"), Turn::model("hello")]);
        assert_eq!(outbound.sent_texts().await, vec![IMAGE_APOLOGY_TEXT]);
        assert_eq!(handler.dispatcher.history().get(1).await.len(), 2);
    }
}
