//! Per-user bounded conversation history.

use peanut_providers::{Role, Turn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryScope {
    User(i64),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStat {
    pub user_id: i64,
    pub turn_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub total_users: usize,
    pub total_turns: usize,
    pub users: Vec<UserStat>,
}

/// Sliding window of the most recent `max_len` turns per user, independent of channel.
/// Histories are memory-only and lost on restart.
pub struct ConversationStore {
    max_len: usize,
    histories: Mutex<HashMap<i64, VecDeque<Turn>>>,
}

impl ConversationStore {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            histories: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn push_trimmed(history: &mut VecDeque<Turn>, turn: Turn, max_len: usize) {
        history.push_back(turn);
        while history.len() > max_len {
            history.pop_front();
        }
    }

    pub async fn append(&self, user_id: i64, role: Role, text: &str) {
        let mut histories = self.histories.lock().await;
        let history = histories.entry(user_id).or_default();
        Self::push_trimmed(
            history,
            Turn {
                role,
                text: text.to_string(),
            },
            self.max_len,
        );
    }

    /// Appends a user turn and the model's reply under one lock, so a failed
    /// exchange never leaves a dangling user turn behind.
    pub async fn append_exchange(&self, user_id: i64, user_text: &str, model_text: &str) {
        let mut histories = self.histories.lock().await;
        let history = histories.entry(user_id).or_default();
        Self::push_trimmed(history, Turn::user(user_text), self.max_len);
        Self::push_trimmed(history, Turn::model(model_text), self.max_len);
    }

    pub async fn get(&self, user_id: i64) -> Vec<Turn> {
        self.histories
            .lock()
            .await
            .get(&user_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear(&self, scope: HistoryScope) {
        let mut histories = self.histories.lock().await;
        match scope {
            HistoryScope::User(user_id) => {
                if let Some(history) = histories.get_mut(&user_id) {
                    history.clear();
                }
                tracing::info!(user_id = user_id, "Conversation history cleared");
            }
            HistoryScope::All => {
                histories.clear();
                tracing::info!("All conversation histories cleared");
            }
        }
    }

    pub async fn stats(&self) -> HistoryStats {
        let histories = self.histories.lock().await;
        let mut users: Vec<UserStat> = histories
            .iter()
            .map(|(user_id, history)| UserStat {
                user_id: *user_id,
                turn_count: history.len(),
            })
            .collect();
        users.sort_by_key(|u| u.user_id);
        HistoryStats {
            total_users: users.len(),
            total_turns: users.iter().map(|u| u.turn_count).sum(),
            users,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oldest_turns_are_evicted_first() {
        let store = ConversationStore::new(20);
        for i in 0..25 {
            store.append(1, Role::User, &format!("turn {}", i)).await;
        }
        let history = store.get(1).await;
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].text, "turn 5");
        assert_eq!(history[19].text, "turn 24");
    }

    #[tokio::test]
    async fn length_is_min_of_appends_and_limit() {
        let store = ConversationStore::new(4);
        for n in 1..=6 {
            store.append(7, Role::Model, "x").await;
            assert_eq!(store.get(7).await.len(), n.min(4));
        }
    }

    #[tokio::test]
    async fn exchange_appends_user_then_model() {
        let store = ConversationStore::new(20);
        store.append_exchange(1, "hello", "hi!").await;
        assert_eq!(
            store.get(1).await,
            vec![Turn::user("hello"), Turn::model("hi!")]
        );
    }

    #[tokio::test]
    async fn users_are_isolated_and_clearable() {
        let store = ConversationStore::new(20);
        store.append_exchange(1, "a", "b").await;
        store.append_exchange(2, "c", "d").await;
        assert!(store.get(3).await.is_empty());

        store.clear(HistoryScope::User(1)).await;
        assert!(store.get(1).await.is_empty());
        assert_eq!(store.get(2).await.len(), 2);

        store.clear(HistoryScope::All).await;
        assert!(store.get(2).await.is_empty());
    }

    #[tokio::test]
    async fn stats_report_per_user_counts() {
        let store = ConversationStore::new(20);
        store.append_exchange(2, "a", "b").await;
        store.append(1, Role::User, "c").await;

        let stats = store.stats().await;
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.total_turns, 3);
        assert_eq!(
            stats.users,
            vec![
                UserStat {
                    user_id: 1,
                    turn_count: 1
                },
                UserStat {
                    user_id: 2,
                    turn_count: 2
                },
            ]
        );
    }
}
