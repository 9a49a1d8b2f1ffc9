use crate::ForecastPoint;
use chrono::{Duration, NaiveDate};

const TEMP_JUMP: f64 = 5.0;

pub fn points_for_day(points: &[ForecastPoint], day: NaiveDate) -> Vec<ForecastPoint> {
    points
        .iter()
        .filter(|p| p.time.date() == day)
        .cloned()
        .collect()
}

/// Today's slots, or the first eight slots of tomorrow late in the evening.
pub fn points_for_day_or_next(points: &[ForecastPoint], day: NaiveDate) -> Vec<ForecastPoint> {
    let today = points_for_day(points, day);
    if !today.is_empty() {
        return today;
    }
    let mut tomorrow = points_for_day(points, day + Duration::days(1));
    tomorrow.truncate(8);
    tomorrow
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// One row per 3-hour slot. A slot where rain begins, or where the temperature
/// moved by 5°C or more since the previous slot, is flagged instead of showing
/// the plain condition.
pub fn build_forecast_table(points: &[ForecastPoint]) -> String {
    if points.is_empty() {
        return "No forecast data".to_string();
    }

    let mut lines = vec![
        "Time  | Weather   | Temp   | Rain | Wind".to_string(),
        "------|-----------|--------|------|------".to_string(),
    ];

    let mut prev_temp: Option<f64> = None;
    let mut prev_rain = false;

    for point in points {
        let time = point.time.format("%H:%M");
        let rain = point.rain_3h > 0.0;
        let wind = clip(&point.wind_text, 6);
        let label = if rain && !prev_rain {
            "⚠️ rain starts!".to_string()
        } else if let Some(prev) = prev_temp.filter(|prev| (point.temp - prev).abs() >= TEMP_JUMP) {
            let arrow = if point.temp > prev { "↑" } else { "↓" };
            format!("{} sudden change!", arrow)
        } else {
            format!("{:9}", clip(&point.condition_text, 6))
        };

        lines.push(format!(
            "{} | {} | {}°C | {}% | {}",
            time, label, point.temp, point.pop, wind
        ));

        prev_temp = Some(point.temp);
        prev_rain = rain;
    }

    lines.join("\n")
}
