//! Per-channel debounce collector.
//!
//! Messages arriving in a channel while a debounce timer is in flight join the
//! pending batch. When the timer fires the batch is drained in one step and
//! handed to the [`BatchSink`] as `"author: content"` lines, attributed to the
//! last author.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub author: String,
    pub content: String,
    pub user_id: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CollectState {
    #[default]
    Idle,
    Collecting,
}

#[derive(Debug, Default)]
struct ChannelBuffer {
    pending: Vec<PendingMessage>,
    state: CollectState,
    last_user_id: Option<i64>,
}

/// A drained debounce window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub channel_id: i64,
    pub user_id: i64,
    pub context: String,
    pub messages: usize,
}

#[async_trait::async_trait]
pub trait BatchSink: Send + Sync {
    async fn dispatch_batch(&self, batch: Batch);
}

pub struct ChannelCollector {
    delay: Duration,
    channels: Mutex<HashMap<i64, ChannelBuffer>>,
    sink: Arc<dyn BatchSink>,
}

impl ChannelCollector {
    pub fn new(delay: Duration, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            delay,
            channels: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Queues a message. Returns `true` when this call started the channel's
    /// debounce timer, `false` when it joined a batch already being collected.
    pub async fn on_message(
        self: &Arc<Self>,
        channel_id: i64,
        author: &str,
        user_id: i64,
        content: &str,
        timestamp: i64,
    ) -> bool {
        {
            let mut channels = self.channels.lock().await;
            let buffer = channels.entry(channel_id).or_default();
            buffer.pending.push(PendingMessage {
                author: author.to_string(),
                content: content.to_string(),
                user_id,
                timestamp,
            });
            buffer.last_user_id = Some(user_id);
            if buffer.state == CollectState::Collecting {
                debug!(channel_id = channel_id, "Message joined pending batch");
                return false;
            }
            buffer.state = CollectState::Collecting;
        }

        let collector = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(collector.delay).await;
            if let Some(batch) = collector.take_batch(channel_id).await {
                debug!(
                    channel_id = batch.channel_id,
                    user_id = batch.user_id,
                    messages = batch.messages,
                    "Debounce window closed"
                );
                collector.sink.dispatch_batch(batch).await;
            }
        });
        true
    }

    /// Returns the channel to idle and drains its batch.
    async fn take_batch(&self, channel_id: i64) -> Option<Batch> {
        let mut channels = self.channels.lock().await;
        let buffer = channels.get_mut(&channel_id)?;
        buffer.state = CollectState::Idle;
        let user_id = buffer.last_user_id?;
        if buffer.pending.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut buffer.pending);
        let context = pending
            .iter()
            .map(|m| format!("{}: {}", m.author, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        Some(Batch {
            channel_id,
            user_id,
            context,
            messages: pending.len(),
        })
    }

    pub async fn is_collecting(&self, channel_id: i64) -> bool {
        self.channels
            .lock()
            .await
            .get(&channel_id)
            .map(|b| b.state == CollectState::Collecting)
            .unwrap_or(false)
    }

    pub async fn pending_count(&self, channel_id: i64) -> usize {
        self.channels
            .lock()
            .await
            .get(&channel_id)
            .map(|b| b.pending.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Batch>>,
    }

    #[async_trait::async_trait]
    impl BatchSink for RecordingSink {
        async fn dispatch_batch(&self, batch: Batch) {
            self.batches.lock().await.push(batch);
        }
    }

    fn collector(sink: Arc<RecordingSink>) -> Arc<ChannelCollector> {
        Arc::new(ChannelCollector::new(Duration::from_secs(3), sink))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_becomes_one_batch_attributed_to_last_author() {
        let sink = Arc::new(RecordingSink::default());
        let collector = collector(sink.clone());

        assert!(collector.on_message(10, "alice", 1, "hi", 100).await);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!collector.on_message(10, "bob", 2, "hello", 101).await);
        assert!(!collector.on_message(10, "alice", 1, "anyone?", 102).await);
        assert!(!collector.on_message(10, "carol", 3, "me!", 103).await);
        assert_eq!(collector.pending_count(10).await, 4);

        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;

        let batches = sink.batches.lock().await.clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].user_id, 3);
        assert_eq!(batches[0].messages, 4);
        assert_eq!(
            batches[0].context,
            "alice: hi\nbob: hello\nalice: anyone?\ncarol: me!"
        );
        assert!(!collector.is_collecting(10).await);
        assert_eq!(collector.pending_count(10).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_messages_start_exactly_one_timer() {
        let sink = Arc::new(RecordingSink::default());
        let collector = collector(sink.clone());

        let (a, b) = tokio::join!(
            collector.on_message(10, "alice", 1, "one", 1),
            collector.on_message(10, "bob", 2, "two", 2),
        );
        assert!(a ^ b, "exactly one call must win the guard");
        assert!(collector.is_collecting(10).await);

        tokio::time::sleep(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;

        let batches = sink.batches.lock().await.clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].messages, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn channels_are_independent() {
        let sink = Arc::new(RecordingSink::default());
        let collector = collector(sink.clone());

        assert!(collector.on_message(10, "alice", 1, "in ten", 1).await);
        assert!(collector.on_message(20, "bob", 2, "in twenty", 2).await);

        tokio::time::sleep(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;

        let mut batches = sink.batches.lock().await.clone();
        batches.sort_by_key(|b| b.channel_id);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].context, "alice: in ten");
        assert_eq!(batches[1].context, "bob: in twenty");
    }

    #[tokio::test(start_paused = true)]
    async fn next_window_starts_after_previous_closes() {
        let sink = Arc::new(RecordingSink::default());
        let collector = collector(sink.clone());

        assert!(collector.on_message(10, "alice", 1, "first", 1).await);
        tokio::time::sleep(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(collector.on_message(10, "bob", 2, "second", 2).await);
        tokio::time::sleep(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;

        let batches = sink.batches.lock().await.clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].context, "bob: second");
        assert_eq!(batches[1].user_id, 2);
    }
}
