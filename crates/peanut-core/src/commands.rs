//! Chat command router
//!
//! Everything starting with `/` lands here instead of the collector. Handlers
//! return the reply text; validation failures are [`CommandError`]s whose
//! `Display` is what the user sees.

use crate::dispatcher::Dispatcher;
use crate::history::HistoryScope;
use crate::reaction::ReactionHandler;
use chrono::{Local, NaiveDateTime};
use peanut_config::Config;
use peanut_cron::ScheduleParser;
use peanut_ipc::Outbound;
use peanut_providers::{Backend, Role, SettingsUpdate};
use peanut_storage::{Memo, MemoStore, ScheduleStore, WeatherSubscriptionStore};
use peanut_weather::{
    build_forecast_table, format_current, format_daily_alert, points_for_day,
    points_for_day_or_next, WeatherSource,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

const MEMOS_PER_PAGE: usize = 10;
const HISTORY_PREVIEW_TURNS: usize = 5;
const HISTORY_PREVIEW_CHARS: usize = 100;
const SCHEDULE_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("Temperature must be between 0.0 and 2.0")]
    TemperatureOutOfRange,
    #[error("Top-p must be between 0.0 and 1.0")]
    TopPOutOfRange,
    #[error("'{0}' is not a number")]
    InvalidNumber(String),
    #[error("Unknown model '{0}'. Send /model to see the available models")]
    UnknownModel(String),
    #[error("Prompt number must be between 1 and {0}")]
    UnknownPrompt(usize),
    #[error("Could not load prompt file {0}")]
    PromptLoadFailed(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Only admins can use this command")]
    AdminOnly,
    #[error("{0}")]
    InvalidTime(String),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("Unknown command /{0}. Send /help for the list")]
    UnknownCommand(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for CommandError {
    fn from(err: anyhow::Error) -> Self {
        CommandError::Storage(err.to_string())
    }
}

/// Who sent the command and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub channel_id: i64,
    pub user_id: i64,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub text: String,
    pub shutdown: bool,
}

impl CommandReply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            shutdown: false,
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "🟢 on"
    } else {
        "🔴 off"
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, CommandError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| CommandError::InvalidNumber(value.to_string()))
}

fn format_memo(memo: &Memo) -> String {
    format!("#{} - {}\n{}\n└ by {}", memo.id, memo.date, memo.content, memo.added_by)
}

pub fn help_text() -> String {
    [
        "🤖 Peanut commands",
        "",
        "⚙️ Settings",
        "/temp <0.0-2.0> - set temperature",
        "/topp <0.0-1.0> - set top-p",
        "/model [name] - list or switch models",
        "/prompt [n] - list or switch prompts",
        "/split on|off - split replies into several messages",
        "/reaction on|off|status - emotion reactions",
        "",
        "📚 History",
        "/history view - your recent conversation",
        "/history clear - delete your conversation",
        "/history stats - totals per user (admin)",
        "/clear - reset your context",
        "/reset - reset everyone's history (admin)",
        "",
        "🧠 Memos",
        "/memo add <text> | delete <id|text> | list [page] | search <keyword> | clear",
        "",
        "📅 Schedules",
        "/schedule add <YYYY-MM-DD HH:MM|HH:MM> <message>",
        "/schedule daily <HH:MM> <message>",
        "/schedule list | delete <id>",
        "",
        "🌤️ Weather",
        "/weather now <city> | forecast <city> | register <city> | unregister | list",
        "",
        "📊 Other",
        "/status - current settings",
        "/down - shut the bot down (admin)",
        "",
        "Messages starting with \\ are ignored by the bot.",
    ]
    .join("\n")
}

pub struct CommandRouter {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    dispatcher: Arc<Dispatcher>,
    outbound: Arc<dyn Outbound>,
    memos: Arc<Mutex<MemoStore>>,
    schedules: Arc<Mutex<ScheduleStore>>,
    subscriptions: Arc<Mutex<WeatherSubscriptionStore>>,
    weather: Option<Arc<dyn WeatherSource>>,
    reactions: Option<Arc<ReactionHandler>>,
    parser: ScheduleParser,
    shutdown: watch::Sender<bool>,
}

pub struct CommandRouterParts {
    pub config: Arc<Config>,
    pub backend: Arc<dyn Backend>,
    pub dispatcher: Arc<Dispatcher>,
    pub outbound: Arc<dyn Outbound>,
    pub memos: Arc<Mutex<MemoStore>>,
    pub schedules: Arc<Mutex<ScheduleStore>>,
    pub subscriptions: Arc<Mutex<WeatherSubscriptionStore>>,
    pub weather: Option<Arc<dyn WeatherSource>>,
    pub reactions: Option<Arc<ReactionHandler>>,
    pub shutdown: watch::Sender<bool>,
}

impl CommandRouter {
    pub fn new(parts: CommandRouterParts) -> anyhow::Result<Self> {
        Ok(Self {
            config: parts.config,
            backend: parts.backend,
            dispatcher: parts.dispatcher,
            outbound: parts.outbound,
            memos: parts.memos,
            schedules: parts.schedules,
            subscriptions: parts.subscriptions,
            weather: parts.weather,
            reactions: parts.reactions,
            parser: ScheduleParser::new()?,
            shutdown: parts.shutdown,
        })
    }

    fn require_admin(&self, ctx: &CommandContext) -> Result<(), CommandError> {
        if self.config.is_admin(ctx.user_id) {
            Ok(())
        } else {
            Err(CommandError::AdminOnly)
        }
    }

    /// Runs a command and sends its reply to the originating chat. A `/down`
    /// reply is sent before the shutdown signal fires.
    pub async fn handle(&self, ctx: &CommandContext, name: &str, args: &[String]) {
        info!(
            channel_id = ctx.channel_id,
            user_id = ctx.user_id,
            command = name,
            "Processing command"
        );
        let reply = match self.execute(ctx, name, args).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(user_id = ctx.user_id, command = name, "Command rejected: {}", e);
                CommandReply::text(format!("❌ {}", e))
            }
        };

        if let Err(e) = self.outbound.send(ctx.channel_id, &reply.text).await {
            error!(channel_id = ctx.channel_id, "Failed to send command reply: {}", e);
        }
        if reply.shutdown {
            info!(user_id = ctx.user_id, author = %ctx.author, "Shutdown requested");
            let _ = self.shutdown.send(true);
        }
    }

    pub async fn execute(
        &self,
        ctx: &CommandContext,
        name: &str,
        args: &[String],
    ) -> Result<CommandReply, CommandError> {
        let sub = args.first().map(|s| s.to_lowercase());
        let rest = args.get(1..).unwrap_or_default();

        let text = match name.to_lowercase().as_str() {
            "help" | "start" | "command" => help_text(),
            "status" => self.status(ctx).await,
            "temp" => self.set_temperature(args).await?,
            "topp" => self.set_top_p(args).await?,
            "model" => self.model(args).await?,
            "prompt" => self.prompt(args).await?,
            "split" => self.split(sub.as_deref())?,
            "history" => self.history(ctx, sub.as_deref()).await?,
            "clear" => self.clear_own(ctx).await,
            "reset" => {
                self.require_admin(ctx)?;
                let users = self.dispatcher.history().stats().await.total_users;
                self.dispatcher.history().clear(HistoryScope::All).await;
                format!("🗑️ Every user's history was reset ({} users)", users)
            }
            "memo" => self.memo(ctx, sub.as_deref(), rest).await?,
            "schedule" => self.schedule(ctx, sub.as_deref(), rest).await?,
            "weather" => self.weather(ctx, sub.as_deref(), rest).await?,
            "reaction" => self.reaction(sub.as_deref())?,
            "down" => {
                self.require_admin(ctx)?;
                return Ok(CommandReply {
                    text: "⏹️ Peanut is shutting down. It will be offline shortly.".to_string(),
                    shutdown: true,
                });
            }
            other => return Err(CommandError::UnknownCommand(other.to_string())),
        };
        Ok(CommandReply::text(text))
    }

    async fn status(&self, ctx: &CommandContext) -> String {
        let settings = self.backend.settings().await;
        let prompt = self.current_prompt_name().await;
        let memo_count = self.memos.lock().await.count();
        let own_turns = self.dispatcher.history().get(ctx.user_id).await.len();
        let stats = self.dispatcher.history().stats().await;
        let reactions = self
            .reactions
            .as_ref()
            .map(|r| on_off(r.is_enabled()))
            .unwrap_or("unavailable");

        format!(
            "⚙️ Current settings\n\n🤖 Model\nModel: {}\nPrompt: {}\nTemperature: {}\nTop-p: {}\n\n💬 Conversation\nSplit mode: {}\nReactions: {}\nSaved memos: {}\n\n📚 History\nYour turns: {}\nUsers: {}",
            settings.model,
            prompt,
            settings.temperature,
            settings.top_p,
            on_off(self.dispatcher.split_mode()),
            reactions,
            memo_count,
            own_turns,
            stats.total_users
        )
    }

    async fn current_prompt_name(&self) -> String {
        let source = self.backend.prompt_source().await;
        self.config
            .core
            .prompts
            .iter()
            .find(|p| {
                self.config
                    .resolve_data_file(Some(&p.file), &p.file)
                    .to_string_lossy()
                    == source
            })
            .map(|p| p.name.clone())
            .unwrap_or(source)
    }

    async fn set_temperature(&self, args: &[String]) -> Result<String, CommandError> {
        let value: f32 = parse_number(args.first().ok_or(CommandError::Usage("/temp <0.0-2.0>"))?)?;
        if !(0.0..=2.0).contains(&value) {
            return Err(CommandError::TemperatureOutOfRange);
        }
        self.backend
            .update_settings(SettingsUpdate {
                temperature: Some(value),
                ..Default::default()
            })
            .await;
        Ok(format!("🌡️ Temperature set to {}", value))
    }

    async fn set_top_p(&self, args: &[String]) -> Result<String, CommandError> {
        let value: f32 = parse_number(args.first().ok_or(CommandError::Usage("/topp <0.0-1.0>"))?)?;
        if !(0.0..=1.0).contains(&value) {
            return Err(CommandError::TopPOutOfRange);
        }
        self.backend
            .update_settings(SettingsUpdate {
                top_p: Some(value),
                ..Default::default()
            })
            .await;
        Ok(format!("🎯 Top-p set to {}", value))
    }

    async fn model(&self, args: &[String]) -> Result<String, CommandError> {
        let current = self.backend.settings().await.model;
        let available = &self.config.provider.available_models;

        let Some(requested) = args.first() else {
            let list = available
                .iter()
                .map(|m| format!("{} {}", if *m == current { "✅" } else { "▫️" }, m))
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(format!(
                "🤖 Models\nCurrent: {}\n\n{}\n\nSwitch with /model <name>",
                current, list
            ));
        };

        if !available.is_empty() && !available.contains(requested) {
            return Err(CommandError::UnknownModel(requested.clone()));
        }
        self.backend
            .update_settings(SettingsUpdate {
                model: Some(requested.clone()),
                ..Default::default()
            })
            .await;
        Ok(format!("🤖 Model switched to {}", requested))
    }

    async fn prompt(&self, args: &[String]) -> Result<String, CommandError> {
        let prompts = &self.config.core.prompts;
        let current = self.backend.prompt_source().await;

        let Some(choice) = args.first() else {
            if prompts.is_empty() {
                return Ok(format!("📝 Prompt in use: {}\nNo other prompts are configured.", current));
            }
            let list = prompts
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let path = self.config.resolve_data_file(Some(&p.file), &p.file);
                    let mark = if path.to_string_lossy() == current { "✅" } else { "▫️" };
                    let description = if p.description.is_empty() {
                        "No description"
                    } else {
                        p.description.as_str()
                    };
                    format!("{}. {} {}\n┗ {}", i + 1, mark, p.name, description)
                })
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(format!("📝 Prompts\n\n{}\n\nSwitch with /prompt <n>", list));
        };

        let index: usize = parse_number(choice)?;
        let entry = index
            .checked_sub(1)
            .and_then(|i| prompts.get(i))
            .ok_or(CommandError::UnknownPrompt(prompts.len()))?;
        let path = self.config.resolve_data_file(Some(&entry.file), &entry.file);

        if !self.backend.load_system_prompt(&path).await {
            return Err(CommandError::PromptLoadFailed(path.display().to_string()));
        }
        let memory = self.memos.lock().await.as_memory_text();
        let base = self.backend.base_instruction().await;
        self.backend.update_system_instruction(&base, &memory).await;
        Ok(format!("📝 Prompt switched to {}", entry.name))
    }

    fn split(&self, sub: Option<&str>) -> Result<String, CommandError> {
        match sub {
            Some("on") => {
                self.dispatcher.set_split_mode(true);
                Ok("✂️ Split mode is on".to_string())
            }
            Some("off") => {
                self.dispatcher.set_split_mode(false);
                Ok("📝 Split mode is off".to_string())
            }
            _ => Err(CommandError::Usage("/split on|off")),
        }
    }

    async fn history(
        &self,
        ctx: &CommandContext,
        sub: Option<&str>,
    ) -> Result<String, CommandError> {
        let store = self.dispatcher.history();
        match sub {
            Some("view") => {
                let history = store.get(ctx.user_id).await;
                if history.is_empty() {
                    return Ok("📝 No conversation history yet".to_string());
                }
                let total = history.len();
                let skip = total.saturating_sub(HISTORY_PREVIEW_TURNS);
                let mut lines = vec![format!("💬 Your history ({} turns)", total)];
                for (idx, turn) in history.iter().enumerate().skip(skip) {
                    let who = match turn.role {
                        Role::User => "🙋 you",
                        Role::Model => "🤖 Peanut",
                    };
                    lines.push(format!(
                        "{} (#{}): {}",
                        who,
                        idx + 1,
                        preview(&turn.text, HISTORY_PREVIEW_CHARS)
                    ));
                }
                if total > HISTORY_PREVIEW_TURNS {
                    lines.push(format!(
                        "Showing the last {} of {}",
                        HISTORY_PREVIEW_TURNS, total
                    ));
                }
                Ok(lines.join("\n"))
            }
            Some("clear") => Ok(self.clear_own(ctx).await),
            Some("stats") => {
                self.require_admin(ctx)?;
                let stats = store.stats().await;
                let mut lines = vec![
                    "📊 History stats".to_string(),
                    format!("Users: {}", stats.total_users),
                    format!("Turns: {}", stats.total_turns),
                ];
                for user in stats.users.iter().filter(|u| u.turn_count > 0) {
                    lines.push(format!("• {}: {} turns", user.user_id, user.turn_count));
                }
                Ok(lines.join("\n"))
            }
            _ => Err(CommandError::Usage("/history view|clear|stats")),
        }
    }

    async fn clear_own(&self, ctx: &CommandContext) -> String {
        let store = self.dispatcher.history();
        let count = store.get(ctx.user_id).await.len();
        if count == 0 {
            return "📝 There is no history to delete".to_string();
        }
        store.clear(HistoryScope::User(ctx.user_id)).await;
        format!("🗑️ Deleted {} turns. Your context is fresh, start a new conversation!", count)
    }

    /// Recomputes the system instruction from the current memos.
    async fn refresh_memory(&self, memos: &MemoStore) {
        let base = self.backend.base_instruction().await;
        self.backend
            .update_system_instruction(&base, &memos.as_memory_text())
            .await;
    }

    async fn memo(
        &self,
        ctx: &CommandContext,
        sub: Option<&str>,
        rest: &[String],
    ) -> Result<String, CommandError> {
        let text = rest.join(" ");
        match sub {
            Some("add") => {
                if text.trim().is_empty() {
                    return Err(CommandError::Usage("/memo add <text>"));
                }
                let mut memos = self.memos.lock().await;
                let memo = memos.add(text.trim(), &ctx.author)?;
                self.refresh_memory(&memos).await;
                Ok(format!("✅ Memo added\n#{} {}\nby {} on {}", memo.id, memo.content, memo.added_by, memo.date))
            }
            Some("delete") => {
                let target = text.trim();
                if target.is_empty() {
                    return Err(CommandError::Usage("/memo delete <id|text>"));
                }
                let mut memos = self.memos.lock().await;
                let deleted = match target.parse::<u64>() {
                    Ok(id) => memos.delete_by_id(id)?,
                    Err(_) => memos.delete_matching(target)?,
                };
                match deleted {
                    Some(memo) => {
                        self.refresh_memory(&memos).await;
                        Ok(format!("🗑️ Memo deleted\n#{} {}", memo.id, memo.content))
                    }
                    None => Ok(format!("❌ No memo matches '{}'", target)),
                }
            }
            Some("list") => {
                let page: usize = match rest.first() {
                    Some(p) => parse_number(p)?,
                    None => 1,
                };
                let memos = self.memos.lock().await;
                let all = memos.list();
                if all.is_empty() {
                    return Ok("📝 No memos saved yet".to_string());
                }
                let pages = all.len().div_ceil(MEMOS_PER_PAGE);
                let page = page.clamp(1, pages);
                let entries = all
                    .iter()
                    .skip((page - 1) * MEMOS_PER_PAGE)
                    .take(MEMOS_PER_PAGE)
                    .map(format_memo)
                    .collect::<Vec<_>>()
                    .join("\n\n");
                Ok(format!(
                    "🧠 Peanut's tastes and memories ({})\n\n{}\n\nPage {}/{}",
                    all.len(),
                    entries,
                    page,
                    pages
                ))
            }
            Some("search") => {
                let keyword = text.trim();
                if keyword.is_empty() {
                    return Err(CommandError::Usage("/memo search <keyword>"));
                }
                let results = self.memos.lock().await.search(keyword);
                if results.is_empty() {
                    return Ok(format!("🔍 No memos about '{}'", keyword));
                }
                let entries = results.iter().map(format_memo).collect::<Vec<_>>().join("\n\n");
                Ok(format!("🔍 Results for '{}' ({})\n\n{}", keyword, results.len(), entries))
            }
            Some("clear") => {
                self.require_admin(ctx)?;
                let mut memos = self.memos.lock().await;
                let removed = memos.clear()?;
                self.refresh_memory(&memos).await;
                Ok(format!("🗑️ All memos deleted ({} removed)", removed))
            }
            _ => Err(CommandError::Usage(
                "/memo add <text> | delete <id|text> | list [page] | search <keyword> | clear",
            )),
        }
    }

    /// Splits `<time> <message...>`, where the time may span two words.
    fn parse_schedule_args(
        &self,
        args: &[String],
        now: NaiveDateTime,
    ) -> Result<(NaiveDateTime, String), CommandError> {
        let usage = CommandError::Usage("/schedule add <YYYY-MM-DD HH:MM|HH:MM> <message>");
        let first = args.first().ok_or(usage.clone())?;
        let (time_text, message_start) = if first.contains('-') {
            let clock = args.get(1).ok_or(usage.clone())?;
            (format!("{} {}", first, clock), 2)
        } else {
            (first.clone(), 1)
        };
        let time = self
            .parser
            .parse(&time_text, now)
            .map_err(|e| CommandError::InvalidTime(e.to_string()))?;
        let message = args.get(message_start..).unwrap_or_default().join(" ");
        if message.trim().is_empty() {
            return Err(usage);
        }
        Ok((time, message))
    }

    async fn schedule(
        &self,
        ctx: &CommandContext,
        sub: Option<&str>,
        rest: &[String],
    ) -> Result<String, CommandError> {
        let now = Local::now().naive_local();
        match sub {
            Some(kind @ ("add" | "daily")) => {
                let repeats = kind == "daily";
                let (time, message) = self.parse_schedule_args(rest, now)?;
                let schedule = self.schedules.lock().await.add(
                    ctx.channel_id,
                    ctx.user_id,
                    time,
                    &message,
                    repeats,
                )?;
                Ok(format!(
                    "📅 Scheduled message #{}\nTime: {}{}\nMessage: {}",
                    schedule.id,
                    schedule.time.format("%Y-%m-%d %H:%M"),
                    if repeats { " (daily)" } else { "" },
                    preview(&schedule.message, SCHEDULE_PREVIEW_CHARS)
                ))
            }
            Some("list") => {
                let schedules = self.schedules.lock().await.list(Some(ctx.user_id));
                if schedules.is_empty() {
                    return Ok("📭 You have no scheduled messages".to_string());
                }
                let mut lines = vec![format!("📅 Your scheduled messages ({})", schedules.len())];
                for s in &schedules {
                    lines.push(format!(
                        "ID {} | {}{}\n{}",
                        s.id,
                        s.time.format("%Y-%m-%d %H:%M"),
                        if s.repeats { " (daily)" } else { "" },
                        preview(&s.message, SCHEDULE_PREVIEW_CHARS)
                    ));
                }
                Ok(lines.join("\n"))
            }
            Some("delete") => {
                let id: u64 = parse_number(rest.first().ok_or(CommandError::Usage("/schedule delete <id>"))?)?;
                match self.schedules.lock().await.delete(id, ctx.user_id)? {
                    Some(_) => Ok(format!("🗑️ Scheduled message {} deleted", id)),
                    None => Ok(format!("❌ No scheduled message {} of yours was found", id)),
                }
            }
            _ => Err(CommandError::Usage(
                "/schedule add <time> <message> | daily <HH:MM> <message> | list | delete <id>",
            )),
        }
    }

    fn weather_source(&self) -> Result<&Arc<dyn WeatherSource>, CommandError> {
        self.weather.as_ref().ok_or(CommandError::NotConfigured("Weather"))
    }

    fn alert_time(&self) -> String {
        self.config
            .weather
            .as_ref()
            .map(|w| format!("{:02}:{:02}", w.alert_hour, w.alert_minute))
            .unwrap_or_else(|| "07:00".to_string())
    }

    async fn weather(
        &self,
        ctx: &CommandContext,
        sub: Option<&str>,
        rest: &[String],
    ) -> Result<String, CommandError> {
        let city = rest.join(" ");
        let city = city.trim();
        let today = Local::now().date_naive();

        match sub {
            Some("now") => {
                if city.is_empty() {
                    return Err(CommandError::Usage("/weather now <city>"));
                }
                match self.weather_source()?.fetch_current(city).await {
                    Some(snapshot) => Ok(format_current(&snapshot)),
                    None => Ok(format!("❌ Could not get the weather for '{}'", city)),
                }
            }
            Some("forecast") => {
                if city.is_empty() {
                    return Err(CommandError::Usage("/weather forecast <city>"));
                }
                let Some(forecast) = self.weather_source()?.fetch_forecast(city).await else {
                    return Ok(format!("❌ Could not get the forecast for '{}'", city));
                };
                let points = points_for_day(&forecast, today);
                if points.is_empty() {
                    return Ok(format!("⚠️ No forecast left for today in '{}'", city));
                }
                Ok(format!(
                    "🌤️ Today's weather - {}\n```\n{}\n```",
                    city,
                    build_forecast_table(&points)
                ))
            }
            Some("register") => {
                if city.is_empty() {
                    return Err(CommandError::Usage("/weather register <city>"));
                }
                let Some(forecast) = self.weather_source()?.fetch_forecast(city).await else {
                    return Ok(format!(
                        "❌ '{}' is not a valid city or its forecast is unavailable",
                        city
                    ));
                };
                self.subscriptions.lock().await.add(ctx.user_id, city)?;

                let points = points_for_day_or_next(&forecast, today);
                let alert = format_daily_alert(city, &build_forecast_table(&points));
                let delivery = match self.outbound.send_direct(ctx.user_id, &alert).await {
                    Ok(_) => "The first forecast was sent to you privately.".to_string(),
                    Err(e) => {
                        warn!(user_id = ctx.user_id, "Direct forecast failed: {}", e);
                        format!("Private messages are blocked, here it is:\n\n{}", alert)
                    }
                };
                Ok(format!(
                    "✅ Weather alert registered\nCity: {}\nTime: every day at {}\nDelivery: private message\n\n{}",
                    city,
                    self.alert_time(),
                    delivery
                ))
            }
            Some("unregister") => {
                if self.subscriptions.lock().await.remove(ctx.user_id)? {
                    Ok("🔕 Weather alert removed".to_string())
                } else {
                    Ok("⚠️ You have no weather alert".to_string())
                }
            }
            Some("list") => match self.subscriptions.lock().await.get(ctx.user_id) {
                Some(sub) => Ok(format!(
                    "📋 Your weather alert\nCity: {}\nDelivery: private message\nRegistered: {}\nSent every day at {}",
                    sub.city,
                    sub.created_at.get(..10).unwrap_or(sub.created_at.as_str()),
                    self.alert_time()
                )),
                None => Ok(
                    "📭 You have no weather alert.\nRegister with /weather register <city>"
                        .to_string(),
                ),
            },
            _ => Err(CommandError::Usage(
                "/weather now <city> | forecast <city> | register <city> | unregister | list",
            )),
        }
    }

    fn reaction(&self, sub: Option<&str>) -> Result<String, CommandError> {
        let reactions = self
            .reactions
            .as_ref()
            .ok_or(CommandError::NotConfigured("Emotion reactions"))?;
        match sub {
            Some("on") => {
                reactions.set_enabled(true);
                Ok("😊 Emotion reactions are on".to_string())
            }
            Some("off") => {
                reactions.set_enabled(false);
                Ok("😶 Emotion reactions are off".to_string())
            }
            Some("status") | None => Ok(format!(
                "😊 Emotion reactions: {}\n• user messages get emoji reactions\n• Peanut's replies get reactions too\n• cooldown: {}s per user",
                on_off(reactions.is_enabled()),
                reactions.cooldown().as_secs()
            )),
            _ => Err(CommandError::Usage("/reaction on|off|status")),
        }
    }
}
