//! Peanut Storage
//!
//! Flat JSON-file persistence for memos, scheduled messages and weather
//! subscriptions. Each store keeps its records in memory and rewrites the
//! whole file after every mutation.

mod memo;
mod schedule;
mod subscription;

pub use memo::{Memo, MemoStore, EMPTY_MEMORY_TEXT, MEMORY_HEADER};
pub use schedule::{ScheduleStore, ScheduledMessage};
pub use subscription::{WeatherSubscription, WeatherSubscriptionStore};

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Reads a store file, treating a missing or unreadable file as empty.
pub(crate) fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("read {}: {}", path.display(), e))
        .and_then(|raw| {
            serde_json::from_str(&raw).map_err(|e| anyhow!("parse {}: {}", path.display(), e))
        });
    match parsed {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Store file unusable, starting empty: {}", e);
            T::default()
        }
    }
}

pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let raw = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)
        .map_err(|e| anyhow!("replace {}: {}", path.display(), e))?;
    Ok(())
}

/// `max(existing, default 0) + 1`. Ids below the current maximum are never
/// reused; deleting the highest id frees it for the next call.
pub(crate) fn next_id(ids: impl Iterator<Item = u64>) -> u64 {
    ids.max().unwrap_or(0) + 1
}

pub(crate) fn now_iso() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

#[cfg(test)]
pub(crate) fn temp_store_path(name: &str) -> std::path::PathBuf {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir()
        .join(format!("peanut-storage-{}-{}", name, ts))
        .join("store.json")
}
