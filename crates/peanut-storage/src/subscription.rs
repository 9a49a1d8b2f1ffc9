use crate::{load_json, now_iso, save_json};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherSubscription {
    pub user_id: i64,
    pub city: String,
    pub created_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionFile {
    #[serde(default)]
    subscriptions: Vec<WeatherSubscription>,
}

/// One daily-alert city per user.
pub struct WeatherSubscriptionStore {
    path: PathBuf,
    subscriptions: Vec<WeatherSubscription>,
}

impl WeatherSubscriptionStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file: SubscriptionFile = load_json(&path);
        tracing::info!("Loaded {} weather subscriptions", file.subscriptions.len());
        Ok(Self {
            path,
            subscriptions: file.subscriptions,
        })
    }

    pub fn save(&self) -> Result<()> {
        save_json(
            &self.path,
            &SubscriptionFile {
                subscriptions: self.subscriptions.clone(),
            },
        )
    }

    /// Registers `city` for the user, replacing any previous subscription.
    pub fn add(&mut self, user_id: i64, city: &str) -> Result<WeatherSubscription> {
        self.subscriptions.retain(|s| s.user_id != user_id);
        let sub = WeatherSubscription {
            user_id,
            city: city.to_string(),
            created_at: now_iso(),
        };
        self.subscriptions.push(sub.clone());
        self.save()?;
        Ok(sub)
    }

    pub fn remove(&mut self, user_id: i64) -> Result<bool> {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.user_id != user_id);
        if self.subscriptions.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn get(&self, user_id: i64) -> Option<&WeatherSubscription> {
        self.subscriptions.iter().find(|s| s.user_id == user_id)
    }

    pub fn list(&self) -> &[WeatherSubscription] {
        &self.subscriptions
    }
}
