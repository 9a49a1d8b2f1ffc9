//! Emotion reactions on user messages and on the bot's own replies.

use peanut_ipc::{DeliveryHandle, Outbound};
use peanut_providers::{Backend, Sampling};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const MIN_TEXT_CHARS: usize = 2;
const MAX_ANALYZED_CHARS: usize = 200;

const ANALYSIS_SAMPLING: Sampling = Sampling {
    temperature: 0.1,
    top_p: 0.9,
    max_output_tokens: 64,
};

const ANALYSIS_PROMPT: &str = r#"Analyze the emotion of the following message and respond ONLY with a JSON object.
No explanation, no markdown, no extra text. Just the JSON.

Rules:
- emotions: list of 1~3 emotion labels from this set only:
  [happy, joy, excited, love, grateful, proud, hopeful, calm, amused,
   sad, angry, frustrated, anxious, scared, disappointed, bored, confused, disgusted,
   surprised, neutral, curious, tired, sarcastic, nostalgic, determined]
- confidence: float 0.0~1.0
- If the message is too short (<3 chars) or meaningless, return: {"emotions": ["neutral"], "confidence": 0.3}

Response format:
{"emotions": ["<emotion1>", "<emotion2>"], "confidence": 0.85}

Message to analyze:
"#;

pub fn emotion_emoji(label: &str) -> Option<&'static str> {
    let emoji = match label {
        "happy" => "😊",
        "joy" => "😄",
        "excited" => "🎉",
        "love" => "❤️",
        "grateful" => "🙏",
        "proud" => "😤",
        "hopeful" => "🌟",
        "calm" => "😌",
        "amused" => "😂",
        "sad" => "😢",
        "angry" => "😡",
        "frustrated" => "😤",
        "anxious" => "😰",
        "scared" => "😱",
        "disappointed" => "😞",
        "bored" => "😒",
        "confused" => "🤔",
        "disgusted" => "🤢",
        "surprised" => "😮",
        "neutral" => "😐",
        "curious" => "🧐",
        "tired" => "😴",
        "sarcastic" => "🙃",
        "nostalgic" => "🥺",
        "determined" => "💪",
        _ => return None,
    };
    Some(emoji)
}

#[derive(Debug, Deserialize)]
struct EmotionVerdict {
    #[serde(default)]
    emotions: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

/// Strips markdown code fences the model sometimes wraps around its JSON.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

pub struct EmotionAnalyzer {
    backend: Arc<dyn Backend>,
    min_confidence: f32,
}

impl EmotionAnalyzer {
    pub fn new(backend: Arc<dyn Backend>, min_confidence: f32) -> Self {
        Self {
            backend,
            min_confidence,
        }
    }

    /// Parses a raw model verdict into emojis. Unknown labels are dropped.
    pub fn interpret(&self, raw: &str) -> Vec<&'static str> {
        let verdict: EmotionVerdict = match serde_json::from_str(strip_fences(raw)) {
            Ok(verdict) => verdict,
            Err(e) => {
                debug!("Unparseable emotion verdict: {}", e);
                return Vec::new();
            }
        };
        if verdict.confidence < self.min_confidence {
            return Vec::new();
        }
        verdict
            .emotions
            .iter()
            .filter_map(|label| emotion_emoji(label.trim()))
            .collect()
    }

    /// Any failure yields an empty list.
    pub async fn analyze(&self, text: &str) -> Vec<&'static str> {
        let text = text.trim();
        if text.chars().count() < MIN_TEXT_CHARS {
            return Vec::new();
        }
        let mut excerpt: String = text.chars().take(MAX_ANALYZED_CHARS).collect();
        if text.chars().count() > MAX_ANALYZED_CHARS {
            excerpt.push_str("...");
        }

        let prompt = format!("{}{}", ANALYSIS_PROMPT, excerpt);
        match self.backend.generate_oneshot(&prompt, ANALYSIS_SAMPLING).await {
            Ok(raw) => {
                let emojis = self.interpret(&raw);
                debug!(emojis = ?emojis, "Emotion analysis finished");
                emojis
            }
            Err(e) => {
                warn!("Emotion analysis failed (ignored): {}", e);
                Vec::new()
            }
        }
    }
}

/// Reacts with emotion emojis. Never surfaces errors to the chat pipeline.
pub struct ReactionHandler {
    analyzer: EmotionAnalyzer,
    outbound: Arc<dyn Outbound>,
    enabled: AtomicBool,
    cooldown: Duration,
    last_analyzed: Mutex<HashMap<i64, Instant>>,
}

impl ReactionHandler {
    pub fn new(
        analyzer: EmotionAnalyzer,
        outbound: Arc<dyn Outbound>,
        enabled: bool,
        cooldown: Duration,
    ) -> Self {
        Self {
            analyzer,
            outbound,
            enabled: AtomicBool::new(enabled),
            cooldown,
            last_analyzed: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled = enabled, "Emotion reactions toggled");
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Records the attempt and returns `true` when the user is outside the cooldown.
    async fn take_cooldown_slot(&self, user_id: i64) -> bool {
        let now = Instant::now();
        let mut last = self.last_analyzed.lock().await;
        if let Some(at) = last.get(&user_id) {
            if now.duration_since(*at) < self.cooldown {
                return false;
            }
        }
        last.insert(user_id, now);
        true
    }

    async fn add_reactions(&self, chat_id: i64, message_id: i64, emojis: &[&str]) -> usize {
        let mut added = 0;
        for emoji in emojis {
            match self.outbound.react(chat_id, message_id, emoji).await {
                Ok(()) => added += 1,
                Err(e) => warn!("Failed to add reaction {}: {}", emoji, e),
            }
        }
        added
    }

    /// Returns the number of reactions added.
    pub async fn react_to_message(
        &self,
        chat_id: i64,
        message_id: i64,
        user_id: i64,
        text: &str,
    ) -> usize {
        if !self.is_enabled() || text.is_empty() || text.starts_with(['/', '!', '\\']) {
            return 0;
        }
        if !self.take_cooldown_slot(user_id).await {
            debug!(user_id = user_id, "Reaction skipped during cooldown");
            return 0;
        }

        let emojis = self.analyzer.analyze(text).await;
        self.add_reactions(chat_id, message_id, &emojis).await
    }

    pub async fn react_to_reply(&self, handle: DeliveryHandle, text: &str) -> usize {
        if !self.is_enabled() || text.is_empty() {
            return 0;
        }
        let emojis = self.analyzer.analyze(text).await;
        self.add_reactions(handle.chat_id, handle.message_id, &emojis)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeOutbound};

    fn handler(reply: &str, outbound: Arc<FakeOutbound>) -> ReactionHandler {
        let backend = Arc::new(FakeBackend::replying(reply));
        ReactionHandler::new(
            EmotionAnalyzer::new(backend, 0.5),
            outbound,
            true,
            Duration::from_secs(3),
        )
    }

    #[test]
    fn fenced_json_is_accepted() {
        let analyzer = EmotionAnalyzer::new(Arc::new(FakeBackend::replying("")), 0.5);
        let raw = "```json\n{\"emotions\": [\"happy\", \"excited\"], \"confidence\": 0.9}\n```";
        assert_eq!(analyzer.interpret(raw), vec!["😊", "🎉"]);
    }

    #[test]
    fn low_confidence_and_unknown_labels_are_dropped() {
        let analyzer = EmotionAnalyzer::new(Arc::new(FakeBackend::replying("")), 0.5);
        assert!(analyzer
            .interpret(r#"{"emotions": ["happy"], "confidence": 0.3}"#)
            .is_empty());
        assert_eq!(
            analyzer.interpret(r#"{"emotions": ["ecstatic", "sad"], "confidence": 0.8}"#),
            vec!["😢"]
        );
        assert!(analyzer.interpret("not json").is_empty());
    }

    #[tokio::test]
    async fn short_text_is_not_analyzed() {
        let backend = Arc::new(FakeBackend::replying(
            r#"{"emotions": ["happy"], "confidence": 0.9}"#,
        ));
        let analyzer = EmotionAnalyzer::new(backend.clone(), 0.5);
        assert!(analyzer.analyze(" k ").await.is_empty());
        assert_eq!(backend.calls().await, 0);
    }

    #[tokio::test]
    async fn long_text_is_truncated_before_analysis() {
        let backend = Arc::new(FakeBackend::replying(
            r#"{"emotions": ["calm"], "confidence": 0.9}"#,
        ));
        let analyzer = EmotionAnalyzer::new(backend.clone(), 0.5);
        let text = "a".repeat(500);
        assert_eq!(analyzer.analyze(&text).await, vec!["😌"]);

        let prompt = backend.last_prompt().await.expect("prompt recorded");
        assert!(prompt.ends_with(&format!("{}...", "a".repeat(200))));
    }

    #[tokio::test]
    async fn backend_failure_yields_no_reactions() {
        let outbound = Arc::new(FakeOutbound::default());
        let backend = Arc::new(FakeBackend::failing());
        let handler = ReactionHandler::new(
            EmotionAnalyzer::new(backend, 0.5),
            outbound.clone(),
            true,
            Duration::from_secs(3),
        );
        assert_eq!(handler.react_to_message(10, 1, 7, "hello there").await, 0);
        assert!(outbound.reactions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_is_per_user() {
        let outbound = Arc::new(FakeOutbound::default());
        let handler = handler(r#"{"emotions": ["joy"], "confidence": 0.9}"#, outbound.clone());

        assert_eq!(handler.react_to_message(10, 1, 7, "great news!").await, 1);
        assert_eq!(handler.react_to_message(10, 2, 7, "more news!").await, 0);
        assert_eq!(handler.react_to_message(10, 3, 8, "other user").await, 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(handler.react_to_message(10, 4, 7, "later news").await, 1);

        let reactions = outbound.reactions().await;
        let ids: Vec<i64> = reactions.iter().map(|(_, id, _)| *id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn commands_and_disabled_state_are_skipped() {
        let outbound = Arc::new(FakeOutbound::default());
        let handler = handler(r#"{"emotions": ["joy"], "confidence": 0.9}"#, outbound.clone());

        assert_eq!(handler.react_to_message(10, 1, 7, "/help").await, 0);
        assert_eq!(handler.react_to_message(10, 1, 7, "\\ignored").await, 0);

        handler.set_enabled(false);
        assert_eq!(handler.react_to_message(10, 2, 8, "so happy").await, 0);
        assert_eq!(
            handler
                .react_to_reply(
                    DeliveryHandle {
                        chat_id: 10,
                        message_id: 3
                    },
                    "reply"
                )
                .await,
            0
        );
        assert!(outbound.reactions().await.is_empty());
    }

    #[tokio::test]
    async fn replies_ignore_cooldown() {
        let outbound = Arc::new(FakeOutbound::default());
        let handler = handler(r#"{"emotions": ["love"], "confidence": 0.9}"#, outbound.clone());
        let handle = DeliveryHandle {
            chat_id: 10,
            message_id: 42,
        };
        assert_eq!(handler.react_to_reply(handle, "love you").await, 1);
        assert_eq!(handler.react_to_reply(handle, "love you").await, 1);
        assert_eq!(outbound.reactions().await[0], (10, 42, "❤️".to_string()));
    }
}
