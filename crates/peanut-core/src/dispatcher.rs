//! Response dispatcher
//!
//! Turns a consolidated context, or a media prompt, into one backend call and
//! the outbound delivery of its reply. History is only touched after the
//! backend succeeded, so a failed turn never lands in a user's context.

use crate::collector::{Batch, BatchSink};
use crate::history::ConversationStore;
use crate::reaction::ReactionHandler;
use crate::splitter::{normalize_newlines, smart_split};
use anyhow::Result;
use peanut_ipc::{DeliveryHandle, Outbound};
use peanut_providers::Backend;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const APOLOGY_TEXT: &str = "Oops, something went wrong... 😅";
pub const IMAGE_APOLOGY_TEXT: &str = "Oops, something went wrong while analyzing the image... 😅";

const TYPING_INTERVAL: Duration = Duration::from_secs(4);

/// Keeps the platform's typing indicator alive until dropped.
pub(crate) struct TypingHeartbeat {
    stop: Arc<AtomicBool>,
}

impl TypingHeartbeat {
    pub(crate) fn start(outbound: Arc<dyn Outbound>, chat_id: i64) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        tokio::spawn(async move {
            loop {
                if let Err(e) = outbound.send_typing(chat_id).await {
                    debug!("Typing indicator failed: {}", e);
                }
                tokio::time::sleep(TYPING_INTERVAL).await;
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
            }
        });

        Self { stop }
    }
}

impl Drop for TypingHeartbeat {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSettings {
    pub parts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            parts: 3,
            min_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<DeliveryHandle>,
    pub failed: usize,
}

/// Image request prepared by the media path.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub placeholder: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    history: Arc<ConversationStore>,
    outbound: Arc<dyn Outbound>,
    split: SplitSettings,
    split_mode: AtomicBool,
    reactions: Option<Arc<ReactionHandler>>,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn Backend>,
        history: Arc<ConversationStore>,
        outbound: Arc<dyn Outbound>,
        split: SplitSettings,
        split_mode: bool,
    ) -> Self {
        Self {
            backend,
            history,
            outbound,
            split,
            split_mode: AtomicBool::new(split_mode),
            reactions: None,
        }
    }

    pub fn with_reactions(mut self, reactions: Arc<ReactionHandler>) -> Self {
        self.reactions = Some(reactions);
        self
    }

    pub fn set_split_mode(&self, enabled: bool) {
        self.split_mode.store(enabled, Ordering::Relaxed);
        info!(enabled = enabled, "Split mode changed");
    }

    pub fn split_mode(&self) -> bool {
        self.split_mode.load(Ordering::Relaxed)
    }

    pub fn split_settings(&self) -> SplitSettings {
        self.split
    }

    pub fn history(&self) -> &Arc<ConversationStore> {
        &self.history
    }

    /// Returns `None` when the backend failed and the apology was sent instead.
    pub async fn dispatch_text(
        &self,
        channel_id: i64,
        user_id: i64,
        context: &str,
    ) -> Option<DeliveryReport> {
        let history = self.history.get(user_id).await;
        let result = {
            let _typing = TypingHeartbeat::start(Arc::clone(&self.outbound), channel_id);
            self.backend.generate(context, &history).await
        };
        self.complete(channel_id, user_id, context, result, APOLOGY_TEXT)
            .await
    }

    /// The placeholder, never the image bytes, is what enters the history.
    pub async fn dispatch_image(
        &self,
        channel_id: i64,
        user_id: i64,
        request: ImageRequest,
    ) -> Option<DeliveryReport> {
        let history = self.history.get(user_id).await;
        let result = {
            let _typing = TypingHeartbeat::start(Arc::clone(&self.outbound), channel_id);
            self.backend
                .generate_with_image(
                    &request.prompt,
                    &request.bytes,
                    &request.mime_type,
                    &history,
                )
                .await
        };
        self.complete(
            channel_id,
            user_id,
            &request.placeholder,
            result,
            IMAGE_APOLOGY_TEXT,
        )
        .await
    }

    async fn complete(
        &self,
        channel_id: i64,
        user_id: i64,
        user_turn: &str,
        result: Result<String>,
        apology: &str,
    ) -> Option<DeliveryReport> {
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                error!(
                    channel_id = channel_id,
                    user_id = user_id,
                    "Response generation failed: {}",
                    e
                );
                if let Err(e) = self.outbound.send(channel_id, apology).await {
                    warn!(channel_id = channel_id, "Failed to send apology: {}", e);
                }
                return None;
            }
        };

        self.history.append_exchange(user_id, user_turn, &reply).await;
        let report = self.deliver(channel_id, &reply).await;
        info!(
            channel_id = channel_id,
            user_id = user_id,
            delivered = report.delivered.len(),
            failed = report.failed,
            "Reply delivered"
        );

        if let (Some(reactions), Some(handle)) = (&self.reactions, report.delivered.first()) {
            let reactions = Arc::clone(reactions);
            let handle = *handle;
            let text = reply.clone();
            tokio::spawn(async move {
                reactions.react_to_reply(handle, &text).await;
            });
        }

        Some(report)
    }

    fn pacing_delay(&self) -> Duration {
        let min = self.split.min_delay.as_millis() as u64;
        let max = (self.split.max_delay.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Sends the reply whole, or as paced chunks in split mode. Every chunk is
    /// attempted; failures are counted in the report.
    pub async fn deliver(&self, channel_id: i64, reply: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        if !self.split_mode() {
            match self.outbound.send(channel_id, &normalize_newlines(reply)).await {
                Ok(handle) => report.delivered.push(handle),
                Err(e) => {
                    error!(channel_id = channel_id, "Failed to send reply: {}", e);
                    report.failed += 1;
                }
            }
            return report;
        }

        let chunks: Vec<String> = smart_split(reply, self.split.parts)
            .into_iter()
            .filter(|chunk| !chunk.trim().is_empty())
            .collect();
        let total = chunks.len();

        for (idx, chunk) in chunks.iter().enumerate() {
            match self.outbound.send(channel_id, chunk).await {
                Ok(handle) => report.delivered.push(handle),
                Err(e) => {
                    error!(
                        channel_id = channel_id,
                        chunk = idx + 1,
                        chunks = total,
                        "Failed to send reply chunk: {}",
                        e
                    );
                    report.failed += 1;
                }
            }
            if idx + 1 < total {
                tokio::time::sleep(self.pacing_delay()).await;
            }
        }

        report
    }
}

#[async_trait::async_trait]
impl BatchSink for Dispatcher {
    async fn dispatch_batch(&self, batch: Batch) {
        self.dispatch_text(batch.channel_id, batch.user_id, &batch.context)
            .await;
    }
}
