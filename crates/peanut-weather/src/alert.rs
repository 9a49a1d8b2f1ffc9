use crate::{build_forecast_table, points_for_day, WeatherSource};
use chrono::{Local, NaiveDate};
use peanut_cron::DailyTrigger;
use peanut_ipc::Outbound;
use peanut_storage::WeatherSubscriptionStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub fn format_daily_alert(city: &str, table: &str) -> String {
    format!(
        "🌤️ Today's weather - {}\n```\n{}\n```\nDaily alert | /weather unregister to stop",
        city, table
    )
}

/// Sends each subscriber today's forecast once a day.
pub struct WeatherAlerter {
    trigger: DailyTrigger,
    source: Arc<dyn WeatherSource>,
    subscriptions: Arc<Mutex<WeatherSubscriptionStore>>,
    outbound: Arc<dyn Outbound>,
}

impl WeatherAlerter {
    pub fn new(
        trigger: DailyTrigger,
        source: Arc<dyn WeatherSource>,
        subscriptions: Arc<Mutex<WeatherSubscriptionStore>>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            trigger,
            source,
            subscriptions,
            outbound,
        }
    }

    pub async fn run(&self) {
        info!(
            hour = self.trigger.hour,
            minute = self.trigger.minute,
            "Weather alerter started"
        );
        loop {
            let delay = self.trigger.delay_until_next(Local::now().naive_local());
            tokio::time::sleep(delay).await;
            let sent = self.send_alerts(Local::now().date_naive()).await;
            info!(sent = sent, "Daily weather alerts delivered");
        }
    }

    /// One direct message per subscriber; failures are logged and skipped.
    pub async fn send_alerts(&self, today: NaiveDate) -> usize {
        let subscriptions = self.subscriptions.lock().await.list().to_vec();
        let mut sent = 0;

        for sub in subscriptions {
            let Some(forecast) = self.source.fetch_forecast(&sub.city).await else {
                warn!(user_id = sub.user_id, city = %sub.city, "No forecast for subscriber");
                continue;
            };
            let today_points = points_for_day(&forecast, today);
            if today_points.is_empty() {
                continue;
            }

            let text = format_daily_alert(&sub.city, &build_forecast_table(&today_points));
            match self.outbound.send_direct(sub.user_id, &text).await {
                Ok(_) => {
                    sent += 1;
                    info!(user_id = sub.user_id, city = %sub.city, "Weather alert sent");
                }
                Err(e) => {
                    warn!("Weather alert to {} failed: {}", sub.user_id, e);
                }
            }
        }

        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ForecastPoint, WeatherSnapshot};
    use anyhow::Result;
    use peanut_ipc::{DeliveryHandle, FetchedMedia, MediaRef};

    struct FixedSource {
        day: NaiveDate,
    }

    #[async_trait::async_trait]
    impl WeatherSource for FixedSource {
        async fn fetch_current(&self, _city: &str) -> Option<WeatherSnapshot> {
            None
        }

        async fn fetch_forecast(&self, city: &str) -> Option<Vec<ForecastPoint>> {
            if city == "Atlantis" {
                return None;
            }
            Some(vec![ForecastPoint {
                time: self.day.and_hms_opt(9, 0, 0)?,
                temp: 5.0,
                condition_text: "☀️ Clear".to_string(),
                rain_3h: 0.0,
                wind_text: "calm 😴".to_string(),
                pop: 0,
            }])
        }
    }

    #[derive(Default)]
    struct DirectOutbound {
        direct: std::sync::Mutex<Vec<(i64, String)>>,
    }

    #[async_trait::async_trait]
    impl Outbound for DirectOutbound {
        async fn send(&self, chat_id: i64, text: &str) -> Result<DeliveryHandle> {
            if chat_id == 3 {
                anyhow::bail!("user blocked the bot");
            }
            self.direct
                .lock()
                .expect("lock")
                .push((chat_id, text.to_string()));
            Ok(DeliveryHandle {
                chat_id,
                message_id: 1,
            })
        }

        async fn send_typing(&self, _chat_id: i64) -> Result<()> {
            Ok(())
        }

        async fn react(&self, _chat_id: i64, _message_id: i64, _emoji: &str) -> Result<()> {
            Ok(())
        }

        async fn fetch_media(&self, _media: &MediaRef) -> Result<FetchedMedia> {
            anyhow::bail!("no media")
        }
    }

    #[tokio::test]
    async fn alerts_skip_failures_and_continue() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!("peanut-weather-alert-{}.json", ts));
        let mut store = WeatherSubscriptionStore::open(&path).expect("open");
        store.add(1, "Seoul").expect("add");
        store.add(2, "Atlantis").expect("add");
        store.add(3, "Busan").expect("add");

        let day = NaiveDate::from_ymd_opt(2026, 2, 20).expect("date");
        let outbound = Arc::new(DirectOutbound::default());
        let alerter = WeatherAlerter::new(
            DailyTrigger::new(7, 0).expect("trigger"),
            Arc::new(FixedSource { day }),
            Arc::new(Mutex::new(store)),
            outbound.clone(),
        );

        assert_eq!(alerter.send_alerts(day).await, 1);
        let direct = outbound.direct.lock().expect("lock").clone();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].0, 1);
        assert!(direct[0].1.contains("Today's weather - Seoul"));

        let other_day = NaiveDate::from_ymd_opt(2026, 2, 21).expect("date");
        assert_eq!(alerter.send_alerts(other_day).await, 0);

        let _ = std::fs::remove_file(&path);
    }
}
