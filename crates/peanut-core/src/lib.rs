//! Peanut Core
//!
//! Message collection and response dispatch, plus the runtime that wires the
//! stores, the backend, the command layer and the background schedulers
//! together in one place.

pub mod collector;
pub mod commands;
pub mod dispatcher;
pub mod history;
pub mod media;
pub mod reaction;
pub mod splitter;

#[cfg(test)]
pub(crate) mod testing;

pub use collector::{Batch, BatchSink, ChannelCollector};
pub use commands::{CommandContext, CommandError, CommandReply, CommandRouter};
pub use dispatcher::{DeliveryReport, Dispatcher, SplitSettings, APOLOGY_TEXT};
pub use history::{ConversationStore, HistoryScope, HistoryStats, UserStat};
pub use media::MediaHandler;
pub use reaction::{EmotionAnalyzer, ReactionHandler};
pub use splitter::{normalize_newlines, smart_split};

use anyhow::{anyhow, Result};
use commands::CommandRouterParts;
use peanut_config::Config;
use peanut_cron::{DailyTrigger, ScheduleExecutor};
use peanut_ipc::{Envelope, EventBus, MediaRef, MessageKind, Outbound};
use peanut_providers::Backend;
use peanut_storage::{MemoStore, ScheduleStore, WeatherSubscriptionStore};
use peanut_weather::{WeatherAlerter, WeatherSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

const MAX_COMMAND_CONCURRENCY: usize = 8;

/// Work that may wait on the network and therefore leaves the receive loop.
enum Deferred {
    Media {
        chat_id: i64,
        user_id: i64,
        text: String,
        media: Vec<MediaRef>,
    },
    Command {
        ctx: CommandContext,
        name: String,
        args: Vec<String>,
    },
}

/// Everything a single inbound envelope may touch.
struct Pipeline {
    config: Arc<Config>,
    collector: Arc<ChannelCollector>,
    media: MediaHandler,
    commands: CommandRouter,
    reactions: Option<Arc<ReactionHandler>>,
}

impl Pipeline {
    /// Filters the envelope and queues plain text into the collector before
    /// returning, so a channel's messages are collected in arrival order.
    async fn route(&self, envelope: Envelope) -> Option<Deferred> {
        let Some(chat_id) = envelope.chat_id else {
            warn!(trace_id = %envelope.trace_id, "Envelope without chat id dropped");
            return None;
        };

        match envelope.kind {
            MessageKind::Message {
                from,
                user_id,
                text,
                media,
            } => {
                if !self.config.chat.is_bot_channel(chat_id) {
                    debug!(chat_id = chat_id, "Message outside bot channels ignored");
                    return None;
                }
                if text.starts_with('\\') || text.starts_with('/') {
                    return None;
                }

                if let (Some(reactions), Some(message_id)) =
                    (&self.reactions, envelope.message_id)
                {
                    if !text.trim().is_empty() {
                        let reactions = Arc::clone(reactions);
                        let text = text.clone();
                        tokio::spawn(async move {
                            reactions
                                .react_to_message(chat_id, message_id, user_id, &text)
                                .await;
                        });
                    }
                }

                if !media.is_empty() {
                    return Some(Deferred::Media {
                        chat_id,
                        user_id,
                        text,
                        media,
                    });
                }
                if !text.trim().is_empty() {
                    self.collector
                        .on_message(chat_id, &from, user_id, &text, envelope.timestamp)
                        .await;
                }
                None
            }
            MessageKind::Command {
                from,
                user_id,
                name,
                args,
            } => Some(Deferred::Command {
                ctx: CommandContext {
                    channel_id: chat_id,
                    user_id,
                    author: from,
                },
                name,
                args,
            }),
            MessageKind::Error { code, message } => {
                warn!(chat_id = chat_id, code = code, "Platform error: {}", message);
                None
            }
        }
    }

    async fn finish(&self, work: Deferred) {
        match work {
            Deferred::Media {
                chat_id,
                user_id,
                text,
                media,
            } => {
                self.media.handle(chat_id, user_id, &text, &media).await;
            }
            Deferred::Command { ctx, name, args } => {
                self.commands.handle(&ctx, &name, &args).await;
            }
        }
    }
}

pub struct PeanutRuntime {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    dispatcher: Arc<Dispatcher>,
    outbound: Arc<dyn Outbound>,
    schedules: Arc<Mutex<ScheduleStore>>,
    subscriptions: Arc<Mutex<WeatherSubscriptionStore>>,
    weather: Option<Arc<dyn WeatherSource>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PeanutRuntime {
    /// Builds every component in dependency order: stores, backend prompt,
    /// dispatcher, collector, command router.
    pub async fn new(
        config: Config,
        backend: Arc<dyn Backend>,
        outbound: Arc<dyn Outbound>,
        weather: Option<Arc<dyn WeatherSource>>,
    ) -> Result<Self> {
        let config = Arc::new(config);

        let memos = MemoStore::open(config.memo_path())
            .map_err(|e| anyhow!("Failed to open memo store: {}", e))?;
        let schedules = Arc::new(Mutex::new(
            ScheduleStore::open(config.schedule_path())
                .map_err(|e| anyhow!("Failed to open schedule store: {}", e))?,
        ));
        let subscriptions = Arc::new(Mutex::new(
            WeatherSubscriptionStore::open(config.weather_subscription_path())
                .map_err(|e| anyhow!("Failed to open weather subscriptions: {}", e))?,
        ));

        if !backend.load_system_prompt(&config.prompt_path()).await {
            warn!("Using fallback system instruction");
        }
        let base = backend.base_instruction().await;
        backend
            .update_system_instruction(&base, &memos.as_memory_text())
            .await;
        info!(memos = memos.count(), "System instruction ready");
        let memos = Arc::new(Mutex::new(memos));

        let reactions = Arc::new(ReactionHandler::new(
            EmotionAnalyzer::new(Arc::clone(&backend), config.reaction.min_confidence),
            Arc::clone(&outbound),
            config.reaction.enabled,
            Duration::from_secs(config.reaction.cooldown_secs),
        ));

        let history = Arc::new(ConversationStore::new(config.chat.max_history_length));
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&backend),
                history,
                Arc::clone(&outbound),
                SplitSettings {
                    parts: config.chat.split_parts,
                    min_delay: Duration::from_millis(config.chat.split_min_delay_ms),
                    max_delay: Duration::from_millis(config.chat.split_max_delay_ms),
                },
                config.chat.split_mode,
            )
            .with_reactions(Arc::clone(&reactions)),
        );

        let collector = Arc::new(ChannelCollector::new(
            Duration::from_secs(config.chat.collect_delay_secs),
            Arc::clone(&dispatcher) as Arc<dyn BatchSink>,
        ));
        let media = MediaHandler::new(Arc::clone(&dispatcher), Arc::clone(&outbound));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let commands = CommandRouter::new(CommandRouterParts {
            config: Arc::clone(&config),
            backend,
            dispatcher: Arc::clone(&dispatcher),
            outbound: Arc::clone(&outbound),
            memos,
            schedules: Arc::clone(&schedules),
            subscriptions: Arc::clone(&subscriptions),
            weather: weather.clone(),
            reactions: Some(Arc::clone(&reactions)),
            shutdown: shutdown_tx,
        })?;

        let pipeline = Arc::new(Pipeline {
            config: Arc::clone(&config),
            collector,
            media,
            commands,
            reactions: Some(reactions),
        });

        Ok(Self {
            config,
            pipeline,
            dispatcher,
            outbound,
            schedules,
            subscriptions,
            weather,
            shutdown_rx,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Resolves once an admin issued `/down`.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Handles one envelope to completion on the caller's task.
    pub async fn process(&self, envelope: Envelope) {
        if let Some(work) = self.pipeline.route(envelope).await {
            self.pipeline.finish(work).await;
        }
    }

    fn spawn_schedulers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        let schedules = Arc::clone(&self.schedules);
        let outbound = Arc::clone(&self.outbound);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = ScheduleExecutor::new().run(schedules, outbound).await {
                error!("Schedule executor stopped: {}", e);
            }
        }));

        match (&self.weather, &self.config.weather) {
            (Some(source), Some(weather_config)) => {
                match DailyTrigger::new(weather_config.alert_hour, weather_config.alert_minute) {
                    Ok(trigger) => {
                        let alerter = WeatherAlerter::new(
                            trigger,
                            Arc::clone(source),
                            Arc::clone(&self.subscriptions),
                            Arc::clone(&self.outbound),
                        );
                        tasks.push(tokio::spawn(async move { alerter.run().await }));
                    }
                    Err(e) => error!("Weather alerts disabled: {}", e),
                }
            }
            _ => info!("Weather not configured, daily alerts disabled"),
        }

        tasks
    }

    /// Consumes the event bus until it closes or a shutdown is requested.
    /// Text is collected inline; media replies and commands run on their own
    /// tasks, with commands bounded by a semaphore.
    pub async fn run(&self, bus: &EventBus) -> Result<()> {
        info!("Peanut runtime starting...");

        let mut inbound_rx = bus.subscribe();
        let mut shutdown_rx = self.shutdown_signal();
        let semaphore = Arc::new(Semaphore::new(MAX_COMMAND_CONCURRENCY));
        let schedulers = self.spawn_schedulers();

        loop {
            tokio::select! {
                result = inbound_rx.recv() => {
                    match result {
                        Ok(envelope) => {
                            let trace_id = envelope.trace_id.clone();
                            let Some(work) = self.pipeline.route(envelope).await else {
                                continue;
                            };
                            let pipeline = Arc::clone(&self.pipeline);
                            match work {
                                Deferred::Media { .. } => {
                                    tokio::spawn(async move { pipeline.finish(work).await });
                                }
                                Deferred::Command { .. } => {
                                    let semaphore = Arc::clone(&semaphore);
                                    tokio::spawn(async move {
                                        let _permit = match semaphore.acquire_owned().await {
                                            Ok(permit) => permit,
                                            Err(err) => {
                                                error!(
                                                    "Command semaphore closed (trace_id={}): {}",
                                                    trace_id, err
                                                );
                                                return;
                                            }
                                        };
                                        pipeline.finish(work).await;
                                    });
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event bus closed, stopping message processor");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event bus lagged by {} messages", n);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown requested, stopping message processor");
                        break;
                    }
                }
            }
        }

        for task in schedulers {
            task.abort();
        }
        info!("Peanut runtime stopped");
        Ok(())
    }
}
