//! Peanut Configuration
//!
//! TOML configuration loading with environment variable support

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-lite";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_WEATHER_BASE_URL: &str = "https://api.openweathermap.org/data/2.5";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    pub telegram: Option<TelegramConfig>,
    pub weather: Option<WeatherConfig>,
    #[serde(default)]
    pub reaction: ReactionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
    pub prompt_file: Option<String>,
    pub memo_file: Option<String>,
    pub schedule_file: Option<String>,
    pub weather_subscription_file: Option<String>,
    #[serde(default)]
    pub prompts: Vec<PromptEntry>,
}

/// A selectable system prompt, listed by `/prompt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEntry {
    pub name: String,
    pub file: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Chats where the bot converses. Empty means every chat.
    #[serde(default)]
    pub bot_channels: Vec<i64>,
    #[serde(default = "default_collect_delay_secs")]
    pub collect_delay_secs: u64,
    #[serde(default = "default_max_history_length")]
    pub max_history_length: usize,
    #[serde(default = "default_split_parts")]
    pub split_parts: usize,
    #[serde(default = "default_split_min_delay_ms")]
    pub split_min_delay_ms: u64,
    #[serde(default = "default_split_max_delay_ms")]
    pub split_max_delay_ms: u64,
    #[serde(default)]
    pub split_mode: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bot_channels: Vec::new(),
            collect_delay_secs: default_collect_delay_secs(),
            max_history_length: default_max_history_length(),
            split_parts: default_split_parts(),
            split_min_delay_ms: default_split_min_delay_ms(),
            split_max_delay_ms: default_split_max_delay_ms(),
            split_mode: false,
        }
    }
}

impl ChatConfig {
    pub fn is_bot_channel(&self, chat_id: i64) -> bool {
        self.bot_channels.is_empty() || self.bot_channels.contains(&chat_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_available_models")]
    pub available_models: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    pub timeout_secs: Option<u64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            model: default_model(),
            available_models: default_available_models(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: None,
        }
    }
}

impl ProviderConfig {
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_GEMINI_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
    #[serde(default)]
    pub admins: Vec<i64>,
}

impl TelegramConfig {
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(default = "default_alert_hour")]
    pub alert_hour: u32,
    #[serde(default)]
    pub alert_minute: u32,
    #[serde(default = "default_weather_lang")]
    pub lang: String,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            alert_hour: default_alert_hour(),
            alert_minute: 0,
            lang: default_weather_lang(),
        }
    }
}

impl WeatherConfig {
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_WEATHER_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reaction_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl Default for ReactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: default_reaction_cooldown_secs(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_collect_delay_secs() -> u64 {
    3
}

fn default_max_history_length() -> usize {
    20
}

fn default_split_parts() -> usize {
    3
}

fn default_split_min_delay_ms() -> u64 {
    300
}

fn default_split_max_delay_ms() -> u64 {
    500
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_available_models() -> Vec<String> {
    vec![
        "gemini-3-pro-preview".to_string(),
        "gemini-2.5-flash".to_string(),
        "gemini-3-flash-preview".to_string(),
        "gemini-2.5-flash-lite".to_string(),
    ]
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    0.95
}

fn default_max_output_tokens() -> u32 {
    8192
}

fn default_alert_hour() -> u32 {
    7
}

fn default_weather_lang() -> String {
    "kr".to_string()
}

fn default_reaction_cooldown_secs() -> u64 {
    3
}

fn default_min_confidence() -> f32 {
    0.5
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("peanut").join("config.toml"))
    }

    /// Credentials from the environment take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = env_non_empty("PEANUT_TELEGRAM_TOKEN") {
            self.telegram.get_or_insert_with(TelegramConfig::default).bot_token = token;
        }
        if let Some(key) =
            env_non_empty("PEANUT_PROVIDER_API_KEY").or_else(|| env_non_empty("GOOGLE_API_KEY"))
        {
            self.provider.api_key = key;
        }
        if let Some(key) = env_non_empty("PEANUT_WEATHER_API_KEY") {
            self.weather.get_or_insert_with(WeatherConfig::default).api_key = key;
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        match self.core.data_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => dirs::home_dir()
                .map(|home| home.join(".peanut"))
                .unwrap_or_else(|| PathBuf::from(".peanut")),
        }
    }

    /// Resolves a configured file against the data dir, or falls back to `default_name` there.
    pub fn resolve_data_file(&self, configured: Option<&str>, default_name: &str) -> PathBuf {
        match configured.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => {
                let path = expand_home(value);
                if path.is_absolute() {
                    path
                } else {
                    self.data_dir().join(path)
                }
            }
            None => self.data_dir().join(default_name),
        }
    }

    pub fn prompt_path(&self) -> PathBuf {
        self.resolve_data_file(self.core.prompt_file.as_deref(), "prompts/peanut_prompt.txt")
    }

    pub fn memo_path(&self) -> PathBuf {
        self.resolve_data_file(self.core.memo_file.as_deref(), "memories/peanut_memories.json")
    }

    pub fn schedule_path(&self) -> PathBuf {
        self.resolve_data_file(self.core.schedule_file.as_deref(), "schedules.json")
    }

    pub fn weather_subscription_path(&self) -> PathBuf {
        self.resolve_data_file(
            self.core.weather_subscription_file.as_deref(),
            "weather_subscriptions.json",
        )
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.telegram
            .as_ref()
            .map(|tg| tg.is_admin(user_id))
            .unwrap_or(false)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let provider = &self.provider;
        if provider.model.trim().is_empty() {
            anyhow::bail!("provider.model cannot be empty");
        }
        if !provider.available_models.is_empty()
            && !provider.available_models.iter().any(|m| m == &provider.model)
        {
            anyhow::bail!(
                "provider.model '{}' is not listed in provider.available_models",
                provider.model
            );
        }
        if !(0.0..=2.0).contains(&provider.temperature) {
            anyhow::bail!("provider.temperature must be in range 0.0..=2.0");
        }
        if !(0.0..=1.0).contains(&provider.top_p) {
            anyhow::bail!("provider.top_p must be in range 0.0..=1.0");
        }
        if provider.max_output_tokens == 0 {
            anyhow::bail!("provider.max_output_tokens must be > 0");
        }
        if let Some(timeout) = provider.timeout_secs {
            if timeout == 0 {
                anyhow::bail!("provider.timeout_secs must be > 0");
            }
        }

        let chat = &self.chat;
        if chat.split_parts == 0 {
            anyhow::bail!("chat.split_parts must be > 0");
        }
        if chat.max_history_length == 0 {
            anyhow::bail!("chat.max_history_length must be > 0");
        }
        if chat.split_min_delay_ms > chat.split_max_delay_ms {
            anyhow::bail!("chat.split_min_delay_ms cannot exceed chat.split_max_delay_ms");
        }

        if let Some(weather) = &self.weather {
            if weather.alert_hour > 23 {
                anyhow::bail!("weather.alert_hour must be in range 0..=23");
            }
            if weather.alert_minute > 59 {
                anyhow::bail!("weather.alert_minute must be in range 0..=59");
            }
        }

        if !(0.0..=1.0).contains(&self.reaction.min_confidence) {
            anyhow::bail!("reaction.min_confidence must be in range 0.0..=1.0");
        }

        let mut prompt_names = HashSet::new();
        for prompt in &self.core.prompts {
            let name = prompt.name.trim();
            if name.is_empty() {
                anyhow::bail!("core.prompts entry name cannot be empty");
            }
            if prompt.file.trim().is_empty() {
                anyhow::bail!("core.prompts entry '{}' has an empty file", name);
            }
            if !prompt_names.insert(name.to_string()) {
                anyhow::bail!("Duplicate prompt name '{}'", name);
            }
        }

        Ok(())
    }

    /// Checks that are only required when the bot is actually started.
    pub fn validate_for_start(&self) -> anyhow::Result<()> {
        let token = self
            .telegram
            .as_ref()
            .map(|tg| tg.bot_token.trim())
            .unwrap_or("");
        if token.is_empty() {
            anyhow::bail!("telegram.bot_token is required (or set PEANUT_TELEGRAM_TOKEN)");
        }
        if self.provider.api_key.trim().is_empty() {
            anyhow::bail!("provider.api_key is required (or set PEANUT_PROVIDER_API_KEY)");
        }
        Ok(())
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse_config("");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.provider.model, DEFAULT_MODEL);
        assert_eq!(cfg.chat.collect_delay_secs, 3);
        assert_eq!(cfg.chat.max_history_length, 20);
        assert_eq!(cfg.chat.split_parts, 3);
        assert!(!cfg.chat.split_mode);
        assert!(cfg.reaction.enabled);
    }

    #[test]
    fn validate_rejects_model_outside_available_list() {
        let cfg = parse_config(
            r#"
[provider]
model = "gemini-0-unknown"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_any_model_when_list_is_empty() {
        let cfg = parse_config(
            r#"
[provider]
model = "custom-model"
available_models = []
"#,
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_sampling() {
        let cfg = parse_config(
            r#"
[provider]
temperature = 2.5
"#,
        );
        assert!(cfg.validate().is_err());

        let cfg = parse_config(
            r#"
[provider]
top_p = 1.2
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_split_delays() {
        let cfg = parse_config(
            r#"
[chat]
split_min_delay_ms = 900
split_max_delay_ms = 100
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_split_parts() {
        let cfg = parse_config(
            r#"
[chat]
split_parts = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_alert_time() {
        let cfg = parse_config(
            r#"
[weather]
api_key = "w"
alert_hour = 24
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_prompt_names() {
        let cfg = parse_config(
            r#"
[[core.prompts]]
name = "Ultimate"
file = "a.txt"

[[core.prompts]]
name = "Ultimate"
file = "b.txt"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_for_start_requires_token_and_key() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "123:abc"
"#,
        );
        assert!(cfg.validate_for_start().is_err());

        let cfg = parse_config(
            r#"
[provider]
api_key = "k"

[telegram]
bot_token = "123:abc"
"#,
        );
        assert!(cfg.validate_for_start().is_ok());
    }

    #[test]
    fn bot_channels_empty_means_all() {
        let cfg = parse_config("");
        assert!(cfg.chat.is_bot_channel(42));

        let cfg = parse_config(
            r#"
[chat]
bot_channels = [7]
"#,
        );
        assert!(cfg.chat.is_bot_channel(7));
        assert!(!cfg.chat.is_bot_channel(42));
    }

    #[test]
    fn relative_data_files_resolve_against_data_dir() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "/srv/peanut"
memo_file = "memos.json"
schedule_file = "/var/lib/schedules.json"
"#,
        );
        assert_eq!(cfg.memo_path(), PathBuf::from("/srv/peanut/memos.json"));
        assert_eq!(cfg.schedule_path(), PathBuf::from("/var/lib/schedules.json"));
        assert_eq!(
            cfg.weather_subscription_path(),
            PathBuf::from("/srv/peanut/weather_subscriptions.json")
        );
    }

    #[test]
    fn admin_check_reads_telegram_admins() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "1:x"
admins = [99]
"#,
        );
        assert!(cfg.is_admin(99));
        assert!(!cfg.is_admin(100));
    }
}
