//! In-memory backend and platform used by the unit tests.

use anyhow::{bail, Result};
use peanut_ipc::{DeliveryHandle, FetchedMedia, MediaRef, Outbound};
use peanut_providers::{
    apply_settings_update, compose_system_instruction, Backend, BackendConfig, Sampling,
    SettingsUpdate, Turn,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone)]
pub struct ImageCall {
    pub prompt: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub history: Vec<Turn>,
}

pub struct FakeBackend {
    reply: Option<String>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    histories: Mutex<Vec<Vec<Turn>>>,
    image_calls: Mutex<Vec<ImageCall>>,
    config: Mutex<BackendConfig>,
    base: Mutex<String>,
    image_gate: Option<Arc<Notify>>,
}

impl FakeBackend {
    fn with_reply(reply: Option<String>) -> Self {
        Self {
            reply,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            histories: Mutex::new(Vec::new()),
            image_calls: Mutex::new(Vec::new()),
            config: Mutex::new(BackendConfig {
                model: "gemini-2.5-flash-lite".to_string(),
                temperature: 1.0,
                top_p: 0.95,
                max_output_tokens: 8192,
                system_instruction: "base".to_string(),
            }),
            base: Mutex::new("base".to_string()),
            image_gate: None,
        }
    }

    pub fn replying(reply: &str) -> Self {
        Self::with_reply(Some(reply.to_string()))
    }

    pub fn failing() -> Self {
        Self::with_reply(None)
    }

    /// Image requests wait on `gate` before they are answered.
    pub fn with_image_gate(mut self, gate: Arc<Notify>) -> Self {
        self.image_gate = Some(gate);
        self
    }

    pub async fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().await.last().cloned()
    }

    pub async fn histories(&self) -> Vec<Vec<Turn>> {
        self.histories.lock().await.clone()
    }

    pub async fn image_calls(&self) -> Vec<ImageCall> {
        self.image_calls.lock().await.clone()
    }

    async fn answer(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().await.push(prompt.to_string());
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => bail!("backend unavailable"),
        }
    }
}

#[async_trait::async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn generate(&self, context: &str, history: &[Turn]) -> Result<String> {
        self.histories.lock().await.push(history.to_vec());
        self.answer(context).await
    }

    async fn generate_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        history: &[Turn],
    ) -> Result<String> {
        if let Some(gate) = &self.image_gate {
            gate.notified().await;
        }
        self.image_calls.lock().await.push(ImageCall {
            prompt: prompt.to_string(),
            bytes: image.to_vec(),
            mime_type: mime_type.to_string(),
            history: history.to_vec(),
        });
        self.answer(prompt).await
    }

    async fn generate_oneshot(&self, prompt: &str, _sampling: Sampling) -> Result<String> {
        self.answer(prompt).await
    }

    async fn settings(&self) -> BackendConfig {
        self.config.lock().await.clone()
    }

    async fn update_settings(&self, update: SettingsUpdate) {
        apply_settings_update(&mut *self.config.lock().await, update);
    }

    async fn update_system_instruction(&self, base: &str, memory: &str) {
        *self.base.lock().await = base.to_string();
        self.config.lock().await.system_instruction = compose_system_instruction(base, memory);
    }

    async fn base_instruction(&self) -> String {
        self.base.lock().await.clone()
    }

    async fn prompt_source(&self) -> String {
        "default".to_string()
    }

    async fn load_system_prompt(&self, path: &Path) -> bool {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                *self.base.lock().await = text.clone();
                self.config.lock().await.system_instruction = text;
                true
            }
            Err(_) => false,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.reply.is_some())
    }
}

#[derive(Default)]
pub struct FakeOutbound {
    next_message_id: AtomicUsize,
    sends: AtomicUsize,
    failing_sends: Mutex<HashSet<usize>>,
    sent: Mutex<Vec<(i64, String)>>,
    direct: Mutex<Vec<(i64, String)>>,
    typing: AtomicUsize,
    reactions: Mutex<Vec<(i64, i64, String)>>,
    media: Mutex<HashMap<String, FetchedMedia>>,
}

impl FakeOutbound {
    /// Makes the `n`-th send (0-based) fail.
    pub async fn fail_send(&self, n: usize) {
        self.failing_sends.lock().await.insert(n);
    }

    pub async fn add_media(&self, file_id: &str, bytes: &[u8], mime_type: &str) {
        self.media.lock().await.insert(
            file_id.to_string(),
            FetchedMedia {
                bytes: bytes.to_vec(),
                mime_type: mime_type.to_string(),
            },
        );
    }

    pub async fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|(_, t)| t.clone()).collect()
    }

    pub async fn direct(&self) -> Vec<(i64, String)> {
        self.direct.lock().await.clone()
    }

    pub async fn reactions(&self) -> Vec<(i64, i64, String)> {
        self.reactions.lock().await.clone()
    }

    pub fn typing_count(&self) -> usize {
        self.typing.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Outbound for FakeOutbound {
    async fn send(&self, chat_id: i64, text: &str) -> Result<DeliveryHandle> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        if self.failing_sends.lock().await.contains(&n) {
            bail!("send {} rejected", n);
        }
        self.sent.lock().await.push((chat_id, text.to_string()));
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst) as i64 + 100;
        Ok(DeliveryHandle {
            chat_id,
            message_id,
        })
    }

    async fn send_direct(&self, user_id: i64, text: &str) -> Result<DeliveryHandle> {
        self.direct.lock().await.push((user_id, text.to_string()));
        Ok(DeliveryHandle {
            chat_id: user_id,
            message_id: 1,
        })
    }

    async fn send_typing(&self, _chat_id: i64) -> Result<()> {
        self.typing.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn react(&self, chat_id: i64, message_id: i64, emoji: &str) -> Result<()> {
        self.reactions
            .lock()
            .await
            .push((chat_id, message_id, emoji.to_string()));
        Ok(())
    }

    async fn fetch_media(&self, media: &MediaRef) -> Result<FetchedMedia> {
        match self.media.lock().await.get(&media.file_id) {
            Some(fetched) => Ok(fetched.clone()),
            None => bail!("file {} not found", media.file_id),
        }
    }
}
