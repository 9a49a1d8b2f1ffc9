//! Peanut LLM Providers
//!
//! Gemini `generateContent` client holding the process-wide sampling settings
//! and system instruction.

use anyhow::{anyhow, Result};
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;

/// Used when the configured prompt file cannot be read.
pub const FALLBACK_SYSTEM_INSTRUCTION: &str =
    "You are a friendly chatbot with the personality of a person called 'Peanut'.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
    pub system_instruction: String,
}

/// Partial settings change; `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsUpdate {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

/// Per-call sampling for side requests that must not use the chat settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// `history` must not contain `context`; it is appended as the trailing user turn.
    async fn generate(&self, context: &str, history: &[Turn]) -> Result<String>;

    async fn generate_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        history: &[Turn],
    ) -> Result<String>;

    /// Single prompt, current model, no system instruction.
    async fn generate_oneshot(&self, prompt: &str, sampling: Sampling) -> Result<String>;

    async fn settings(&self) -> BackendConfig;

    async fn update_settings(&self, update: SettingsUpdate);

    async fn update_system_instruction(&self, base: &str, memory: &str);

    /// Base instruction without memories.
    async fn base_instruction(&self) -> String;

    /// Prompt file currently in use, or `"default"` after a fallback.
    async fn prompt_source(&self) -> String;

    async fn load_system_prompt(&self, path: &Path) -> bool;

    async fn health_check(&self) -> Result<bool>;
}

pub fn compose_system_instruction(base: &str, memory: &str) -> String {
    if memory.is_empty() {
        base.to_string()
    } else {
        format!("{}\n\n{}", base, memory)
    }
}

pub fn apply_settings_update(config: &mut BackendConfig, update: SettingsUpdate) {
    if let Some(model) = update.model.filter(|m| !m.trim().is_empty()) {
        config.model = model;
    }
    if let Some(temperature) = update.temperature {
        config.temperature = temperature;
    }
    if let Some(top_p) = update.top_p {
        config.top_p = top_p;
    }
}

struct PromptState {
    base: String,
    memory: String,
    source: String,
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    config: RwLock<BackendConfig>,
    prompt: RwLock<PromptState>,
}

impl GeminiClient {
    pub fn new(
        api_key: String,
        base_url: String,
        config: BackendConfig,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        let base = config.system_instruction.clone();
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            config: RwLock::new(config),
            prompt: RwLock::new(PromptState {
                base,
                memory: String::new(),
                source: "default".to_string(),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn truncate_for_error(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            text.to_string()
        } else {
            let truncated: String = text.chars().take(max_chars).collect();
            format!("{}...", truncated)
        }
    }

    pub fn history_to_contents(history: &[Turn]) -> Vec<serde_json::Value> {
        history
            .iter()
            .map(|turn| {
                serde_json::json!({
                    "role": turn.role.as_str(),
                    "parts": [{ "text": turn.text }]
                })
            })
            .collect()
    }

    pub fn image_part(image: &[u8], mime_type: &str) -> serde_json::Value {
        serde_json::json!({
            "inline_data": {
                "mime_type": mime_type,
                "data": base64::engine::general_purpose::STANDARD.encode(image)
            }
        })
    }

    pub fn build_request_body(
        contents: Vec<serde_json::Value>,
        system_instruction: Option<&str>,
        sampling: Sampling,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "temperature": sampling.temperature,
                "topP": sampling.top_p,
                "maxOutputTokens": sampling.max_output_tokens
            }
        });
        if let Some(instruction) = system_instruction.filter(|s| !s.is_empty()) {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{ "text": instruction }]
            });
        }
        body
    }

    pub fn parse_response(response: serde_json::Value) -> Result<String> {
        if let Some(error) = response.get("error") {
            return Err(anyhow!("API error: {}", error));
        }

        let candidate = response
            .get("candidates")
            .and_then(|v| v.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| {
                let reason = response
                    .get("promptFeedback")
                    .and_then(|f| f.get("blockReason"))
                    .and_then(|r| r.as_str())
                    .unwrap_or("none");
                anyhow!("Missing candidates in Gemini response (blockReason={})", reason)
            })?;

        let text: String = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            let finish_reason = candidate
                .get("finishReason")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            return Err(anyhow!(
                "Empty reply from Gemini (finishReason={})",
                finish_reason
            ));
        }

        Ok(text)
    }

    async fn chat_sampling(&self) -> (String, Sampling, String) {
        let config = self.config.read().await;
        (
            config.model.clone(),
            Sampling {
                temperature: config.temperature,
                top_p: config.top_p,
                max_output_tokens: config.max_output_tokens,
            },
            config.system_instruction.clone(),
        )
    }

    async fn request_generate(&self, model: &str, body: serde_json::Value) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("Gemini request failed: {}", e))?;

        let status = response.status();
        let raw_body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "Gemini HTTP {} for model {}: {}",
                status,
                model,
                Self::truncate_for_error(&raw_body, 600)
            ));
        }

        let parsed: serde_json::Value = serde_json::from_str(&raw_body).map_err(|e| {
            anyhow!(
                "Gemini response decode failed: {} | body={}",
                e,
                Self::truncate_for_error(&raw_body, 600)
            )
        })?;
        Self::parse_response(parsed)
    }

    async fn refresh_system_instruction(&self) {
        let composed = {
            let prompt = self.prompt.read().await;
            compose_system_instruction(&prompt.base, &prompt.memory)
        };
        let len = composed.chars().count();
        self.config.write().await.system_instruction = composed;
        tracing::debug!(chars = len, "System instruction updated");
    }
}

#[async_trait::async_trait]
impl Backend for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, context: &str, history: &[Turn]) -> Result<String> {
        let (model, sampling, system) = self.chat_sampling().await;
        let mut contents = Self::history_to_contents(history);
        contents.push(serde_json::json!({
            "role": "user",
            "parts": [{ "text": context }]
        }));
        let body = Self::build_request_body(contents, Some(&system), sampling);
        self.request_generate(&model, body)
            .await
            .map_err(|e| anyhow!("Reply generation failed: {}", e))
    }

    async fn generate_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        history: &[Turn],
    ) -> Result<String> {
        let (model, sampling, system) = self.chat_sampling().await;
        let mut contents = Self::history_to_contents(history);
        contents.push(serde_json::json!({
            "role": "user",
            "parts": [{ "text": prompt }, Self::image_part(image, mime_type)]
        }));
        let body = Self::build_request_body(contents, Some(&system), sampling);
        self.request_generate(&model, body)
            .await
            .map_err(|e| anyhow!("Image analysis failed: {}", e))
    }

    async fn generate_oneshot(&self, prompt: &str, sampling: Sampling) -> Result<String> {
        let model = self.config.read().await.model.clone();
        let contents = vec![serde_json::json!({
            "role": "user",
            "parts": [{ "text": prompt }]
        })];
        let body = Self::build_request_body(contents, None, sampling);
        self.request_generate(&model, body).await
    }

    async fn settings(&self) -> BackendConfig {
        self.config.read().await.clone()
    }

    async fn update_settings(&self, update: SettingsUpdate) {
        let mut config = self.config.write().await;
        apply_settings_update(&mut config, update);
        tracing::info!(
            model = %config.model,
            temperature = config.temperature,
            top_p = config.top_p,
            "Backend settings updated"
        );
    }

    async fn update_system_instruction(&self, base: &str, memory: &str) {
        {
            let mut prompt = self.prompt.write().await;
            prompt.base = base.to_string();
            prompt.memory = memory.to_string();
        }
        self.refresh_system_instruction().await;
    }

    async fn base_instruction(&self) -> String {
        self.prompt.read().await.base.clone()
    }

    async fn prompt_source(&self) -> String {
        self.prompt.read().await.source.clone()
    }

    async fn load_system_prompt(&self, path: &Path) -> bool {
        let (base, source, loaded) = match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                tracing::info!("Loaded system prompt from {}", path.display());
                (text, path.display().to_string(), true)
            }
            Err(e) => {
                tracing::warn!(
                    "Prompt file {} unavailable ({}), using fallback instruction",
                    path.display(),
                    e
                );
                (
                    FALLBACK_SYSTEM_INSTRUCTION.to_string(),
                    "default".to_string(),
                    false,
                )
            }
        };
        {
            let mut prompt = self.prompt.write().await;
            prompt.base = base;
            prompt.source = source;
        }
        self.refresh_system_instruction().await;
        loaded
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        match self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
