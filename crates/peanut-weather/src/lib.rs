//! Peanut Weather
//!
//! OpenWeatherMap client, human-readable interpretations, the forecast table
//! and the daily alert sent to subscribers.

mod alert;
mod table;

pub use alert::{format_daily_alert, WeatherAlerter};
pub use table::{build_forecast_table, points_for_day, points_for_day_or_next};

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime, TimeZone};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub city: String,
    pub country: String,
    pub temp: f64,
    pub feels_like: f64,
    pub temp_min: f64,
    pub temp_max: f64,
    pub humidity: i64,
    pub pressure: i64,
    pub wind_speed: f64,
    pub wind_text: String,
    pub clouds: i64,
    pub clouds_text: String,
    pub condition: String,
    pub description: String,
    pub condition_text: String,
    pub rain_1h: f64,
    pub snow_1h: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    /// Local wall-clock time of the 3-hour slot.
    pub time: NaiveDateTime,
    pub temp: f64,
    pub condition_text: String,
    pub rain_3h: f64,
    pub wind_text: String,
    /// Probability of precipitation, percent.
    pub pop: u32,
}

#[async_trait::async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch_current(&self, city: &str) -> Option<WeatherSnapshot>;
    async fn fetch_forecast(&self, city: &str) -> Option<Vec<ForecastPoint>>;
}

pub fn interpret_wind_speed(speed_ms: f64) -> &'static str {
    if speed_ms < 1.0 {
        "calm 😴"
    } else if speed_ms < 3.0 {
        "light breeze 🍃"
    } else if speed_ms < 5.0 {
        "a little breezy 🌬️"
    } else if speed_ms < 8.0 {
        "fairly windy 💨"
    } else if speed_ms < 11.0 {
        "strong wind 🌪️"
    } else if speed_ms < 14.0 {
        "very strong! ⚠️"
    } else {
        "dangerous! 🚨"
    }
}

pub fn interpret_clouds(percent: i64) -> &'static str {
    if percent < 20 {
        "clear ☀️"
    } else if percent < 50 {
        "partly cloudy ⛅"
    } else if percent < 80 {
        "cloudy ☁️"
    } else {
        "overcast 🌥️"
    }
}

pub fn interpret_condition(main: &str) -> String {
    match main {
        "Clear" => "☀️ Clear".to_string(),
        "Clouds" => "☁️ Clouds".to_string(),
        "Rain" => "🌧️ Rain".to_string(),
        "Drizzle" => "🌦️ Drizzle".to_string(),
        "Thunderstorm" => "⛈️ Thunder".to_string(),
        "Snow" => "❄️ Snow".to_string(),
        "Mist" => "🌫️ Mist".to_string(),
        "Fog" => "🌫️ Fog".to_string(),
        "Haze" => "🌁 Haze".to_string(),
        other => format!("🌈 {}", other),
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn f64_at(value: &serde_json::Value, pointer: &str) -> Option<f64> {
    value.pointer(pointer).and_then(|v| v.as_f64())
}

pub struct WeatherClient {
    client: Client,
    api_key: String,
    base_url: String,
    lang: String,
}

impl WeatherClient {
    pub fn new(api_key: String, base_url: String, lang: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            lang,
        }
    }

    async fn get_json(&self, endpoint: &str, city: &str) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("q", city),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
                ("lang", self.lang.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Weather HTTP {} for '{}'", status, city));
        }
        Ok(response.json().await?)
    }

    pub fn parse_current(data: &serde_json::Value) -> Result<WeatherSnapshot> {
        let main = |key: &str| {
            f64_at(data, &format!("/main/{}", key))
                .ok_or_else(|| anyhow!("Missing main.{} in weather response", key))
        };
        let wind_speed = f64_at(data, "/wind/speed").unwrap_or(0.0);
        let clouds = data.pointer("/clouds/all").and_then(|v| v.as_i64()).unwrap_or(0);
        let condition = data
            .pointer("/weather/0/main")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string();

        Ok(WeatherSnapshot {
            city: data
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("Missing city name in weather response"))?
                .to_string(),
            country: data
                .pointer("/sys/country")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            temp: round1(main("temp")?),
            feels_like: round1(main("feels_like")?),
            temp_min: round1(main("temp_min")?),
            temp_max: round1(main("temp_max")?),
            humidity: data.pointer("/main/humidity").and_then(|v| v.as_i64()).unwrap_or(0),
            pressure: data.pointer("/main/pressure").and_then(|v| v.as_i64()).unwrap_or(0),
            wind_speed,
            wind_text: interpret_wind_speed(wind_speed).to_string(),
            clouds,
            clouds_text: interpret_clouds(clouds).to_string(),
            condition_text: interpret_condition(&condition),
            condition,
            description: data
                .pointer("/weather/0/description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            rain_1h: f64_at(data, "/rain/1h").unwrap_or(0.0),
            snow_1h: f64_at(data, "/snow/1h").unwrap_or(0.0),
        })
    }

    pub fn parse_forecast(data: &serde_json::Value) -> Result<Vec<ForecastPoint>> {
        let list = data
            .get("list")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("Missing 'list' array in forecast response"))?;

        let mut points = Vec::with_capacity(list.len());
        for item in list {
            let Some(dt) = item.get("dt").and_then(|v| v.as_i64()) else {
                continue;
            };
            let Some(time) = Local.timestamp_opt(dt, 0).single() else {
                continue;
            };
            let condition = item
                .pointer("/weather/0/main")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");
            points.push(ForecastPoint {
                time: time.naive_local(),
                temp: round1(f64_at(item, "/main/temp").unwrap_or(0.0)),
                condition_text: interpret_condition(condition),
                rain_3h: f64_at(item, "/rain/3h").unwrap_or(0.0),
                wind_text: interpret_wind_speed(f64_at(item, "/wind/speed").unwrap_or(0.0))
                    .to_string(),
                pop: (f64_at(item, "/pop").unwrap_or(0.0) * 100.0).round() as u32,
            });
        }
        Ok(points)
    }
}

#[async_trait::async_trait]
impl WeatherSource for WeatherClient {
    async fn fetch_current(&self, city: &str) -> Option<WeatherSnapshot> {
        match self
            .get_json("weather", city)
            .await
            .and_then(|data| Self::parse_current(&data))
        {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::error!("Weather lookup failed for '{}': {}", city, e);
                None
            }
        }
    }

    async fn fetch_forecast(&self, city: &str) -> Option<Vec<ForecastPoint>> {
        match self
            .get_json("forecast", city)
            .await
            .and_then(|data| Self::parse_forecast(&data))
        {
            Ok(points) => Some(points),
            Err(e) => {
                tracing::error!("Forecast lookup failed for '{}': {}", city, e);
                None
            }
        }
    }
}

/// Multi-line summary used by `/weather now`.
pub fn format_current(snapshot: &WeatherSnapshot) -> String {
    format!(
        "🌤️ Current weather - {}, {}\nWeather: {}\nTemperature: {}°C (feels like {}°C)\nHumidity: {}%\nWind: {}\nClouds: {}",
        snapshot.city,
        snapshot.country,
        snapshot.condition_text,
        snapshot.temp,
        snapshot.feels_like,
        snapshot.humidity,
        snapshot.wind_text,
        snapshot.clouds_text
    )
}
