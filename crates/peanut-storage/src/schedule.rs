use crate::{load_json, next_id, now_iso, save_json};
use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: u64,
    pub channel_id: i64,
    pub user_id: i64,
    /// Local wall-clock time the message is due.
    pub time: NaiveDateTime,
    pub message: String,
    pub created_at: String,
    #[serde(default)]
    pub repeats: bool,
}

impl ScheduledMessage {
    /// Due from `time` until one minute past it.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        self.time <= now && now <= self.time + Duration::minutes(1)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    schedules: Vec<ScheduledMessage>,
}

pub struct ScheduleStore {
    path: PathBuf,
    schedules: Vec<ScheduledMessage>,
}

impl ScheduleStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file: ScheduleFile = load_json(&path);
        tracing::info!("Loaded {} scheduled messages", file.schedules.len());
        Ok(Self {
            path,
            schedules: file.schedules,
        })
    }

    pub fn save(&self) -> Result<()> {
        save_json(
            &self.path,
            &ScheduleFile {
                schedules: self.schedules.clone(),
            },
        )
    }

    pub fn add(
        &mut self,
        channel_id: i64,
        user_id: i64,
        time: NaiveDateTime,
        message: &str,
        repeats: bool,
    ) -> Result<ScheduledMessage> {
        let schedule = ScheduledMessage {
            id: next_id(self.schedules.iter().map(|s| s.id)),
            channel_id,
            user_id,
            time,
            message: message.to_string(),
            created_at: now_iso(),
            repeats,
        };
        self.schedules.push(schedule.clone());
        self.save()?;
        Ok(schedule)
    }

    /// Only the owner may delete; returns `None` when missing or owned by someone else.
    pub fn delete(&mut self, id: u64, user_id: i64) -> Result<Option<ScheduledMessage>> {
        let Some(idx) = self
            .schedules
            .iter()
            .position(|s| s.id == id && s.user_id == user_id)
        else {
            return Ok(None);
        };
        let removed = self.schedules.remove(idx);
        self.save()?;
        Ok(Some(removed))
    }

    pub fn list(&self, user_id: Option<i64>) -> Vec<ScheduledMessage> {
        self.schedules
            .iter()
            .filter(|s| user_id.map_or(true, |uid| s.user_id == uid))
            .cloned()
            .collect()
    }

    pub fn due(&self, now: NaiveDateTime) -> Vec<ScheduledMessage> {
        self.schedules
            .iter()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect()
    }

    /// Drops an executed one-shot; a repeating message moves to the same time tomorrow.
    pub fn remove_executed(&mut self, id: u64) -> Result<()> {
        let Some(idx) = self.schedules.iter().position(|s| s.id == id) else {
            return Ok(());
        };
        if self.schedules[idx].repeats {
            self.schedules[idx].time += Duration::days(1);
        } else {
            self.schedules.remove(idx);
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_store_path;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 20)
            .and_then(|d| d.and_hms_opt(h, m, 0))
            .expect("valid time")
    }

    #[test]
    fn due_window_is_one_minute() {
        let path = temp_store_path("schedule-due");
        let mut store = ScheduleStore::open(&path).expect("open");
        store.add(1, 10, at(9, 0), "good morning", false).expect("add");

        assert!(store.due(at(8, 59)).is_empty());
        assert_eq!(store.due(at(9, 0)).len(), 1);
        assert_eq!(store.due(at(9, 1)).len(), 1);
        assert!(store.due(at(9, 2)).is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn delete_requires_owner() {
        let path = temp_store_path("schedule-owner");
        let mut store = ScheduleStore::open(&path).expect("open");
        let s = store.add(1, 10, at(9, 0), "hi", false).expect("add");

        assert!(store.delete(s.id, 11).expect("delete").is_none());
        assert_eq!(store.list(None).len(), 1);
        assert!(store.delete(s.id, 10).expect("delete").is_some());
        assert!(store.list(None).is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn list_filters_by_user() {
        let path = temp_store_path("schedule-list");
        let mut store = ScheduleStore::open(&path).expect("open");
        store.add(1, 10, at(9, 0), "a", false).expect("add");
        store.add(1, 20, at(9, 5), "b", false).expect("add");

        assert_eq!(store.list(Some(20)).len(), 1);
        assert_eq!(store.list(None).len(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn executed_one_shot_is_removed_and_repeating_advances() {
        let path = temp_store_path("schedule-exec");
        let mut store = ScheduleStore::open(&path).expect("open");
        let once = store.add(1, 10, at(9, 0), "once", false).expect("add");
        let daily = store.add(1, 10, at(9, 0), "daily", true).expect("add");

        store.remove_executed(once.id).expect("remove");
        store.remove_executed(daily.id).expect("remove");

        let remaining = store.list(None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, daily.id);
        assert_eq!(remaining[0].time, at(9, 0) + Duration::days(1));

        let reopened = ScheduleStore::open(&path).expect("reopen");
        assert_eq!(reopened.list(None), remaining);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ids_follow_max_after_delete() {
        let path = temp_store_path("schedule-ids");
        let mut store = ScheduleStore::open(&path).expect("open");
        store.add(1, 10, at(9, 0), "a", false).expect("add");
        let b = store.add(1, 10, at(9, 0), "b", false).expect("add");
        store.delete(1, 10).expect("delete");
        let c = store.add(1, 10, at(9, 0), "c", false).expect("add");
        assert_eq!(b.id, 2);
        assert_eq!(c.id, 3);

        let _ = std::fs::remove_file(&path);
    }
}
