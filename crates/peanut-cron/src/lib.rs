//! Peanut Cron - scheduled messages in chat
//!
//! Parses `/schedule` times, delivers due messages every minute and computes
//! sleeps for daily time-of-day jobs.

use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use peanut_ipc::Outbound;
use peanut_storage::ScheduleStore;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub struct ScheduleParser {
    absolute_re: Regex,
    time_only_re: Regex,
}

impl ScheduleParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            absolute_re: Regex::new(r"^\s*(\d{4})-(\d{1,2})-(\d{1,2})\s+(\d{1,2}):(\d{2})\s*$")?,
            time_only_re: Regex::new(r"^\s*(\d{1,2}):(\d{2})\s*$")?,
        })
    }

    /// Accepts `YYYY-MM-DD HH:MM`, or `HH:MM` meaning today (tomorrow once passed).
    /// Absolute times in the past are rejected.
    pub fn parse(&self, input: &str, now: NaiveDateTime) -> Result<NaiveDateTime> {
        if let Some(caps) = self.absolute_re.captures(input) {
            let field = |i: usize| -> Result<u32> {
                caps.get(i)
                    .ok_or_else(|| anyhow!("missing time field"))?
                    .as_str()
                    .parse::<u32>()
                    .map_err(|e| anyhow!("invalid number: {}", e))
            };
            let year = field(1)? as i32;
            let date = NaiveDate::from_ymd_opt(year, field(2)?, field(3)?)
                .ok_or_else(|| anyhow!("Invalid date '{}'", input.trim()))?;
            let time = Self::time_of_day(field(4)?, field(5)?)?;
            let target = date.and_time(time);
            if target < now {
                anyhow::bail!("The time {} is already in the past", target.format("%Y-%m-%d %H:%M"));
            }
            return Ok(target);
        }

        if let Some(caps) = self.time_only_re.captures(input) {
            let hour: u32 = caps[1].parse()?;
            let minute: u32 = caps[2].parse()?;
            let time = Self::time_of_day(hour, minute)?;
            let mut target = now.date().and_time(time);
            if target <= now {
                target += ChronoDuration::days(1);
            }
            return Ok(target);
        }

        Err(anyhow!(
            "Unrecognized time '{}'. Use YYYY-MM-DD HH:MM or HH:MM",
            input.trim()
        ))
    }

    fn time_of_day(hour: u32, minute: u32) -> Result<NaiveTime> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| anyhow!("Invalid time {:02}:{:02}", hour, minute))
    }
}

/// Fires once a day at a fixed local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTrigger {
    pub hour: u32,
    pub minute: u32,
}

impl DailyTrigger {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| anyhow!("Invalid daily time {:02}:{:02}", hour, minute))?;
        Ok(Self { hour, minute })
    }

    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN);
        let today = now.date().and_time(time);
        if today > now {
            today
        } else {
            today + ChronoDuration::days(1)
        }
    }

    pub fn delay_until_next(&self, now: NaiveDateTime) -> Duration {
        (self.next_after(now) - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60))
    }
}

pub struct ScheduleExecutor {
    check_interval_secs: u64,
}

impl ScheduleExecutor {
    pub fn new() -> Self {
        Self {
            check_interval_secs: 60,
        }
    }

    pub async fn run(
        &self,
        store: Arc<Mutex<ScheduleStore>>,
        outbound: Arc<dyn Outbound>,
    ) -> Result<()> {
        info!("Schedule executor started");

        loop {
            let now = Local::now().naive_local();
            let sent = Self::run_due(&store, outbound.as_ref(), now).await;
            if sent > 0 {
                info!(sent = sent, "Delivered scheduled messages");
            }
            tokio::time::sleep(Duration::from_secs(self.check_interval_secs)).await;
        }
    }

    /// Sends every message due at `now` and retires executed one-shots.
    /// Returns the number of successful sends.
    pub async fn run_due(
        store: &Mutex<ScheduleStore>,
        outbound: &dyn Outbound,
        now: NaiveDateTime,
    ) -> usize {
        let due = store.lock().await.due(now);
        let mut sent = 0;

        for schedule in due {
            match outbound.send(schedule.channel_id, &schedule.message).await {
                Ok(_) => {
                    sent += 1;
                    info!(
                        schedule_id = schedule.id,
                        channel_id = schedule.channel_id,
                        "Scheduled message sent"
                    );
                }
                Err(e) => {
                    tracing::error!("Failed to send scheduled message {}: {}", schedule.id, e);
                }
            }

            if let Err(e) = store.lock().await.remove_executed(schedule.id) {
                tracing::error!("Failed to retire scheduled message {}: {}", schedule.id, e);
            }
        }

        sent
    }
}

impl Default for ScheduleExecutor {
    fn default() -> Self {
        Self::new()
    }
}
