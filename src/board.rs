//! Board / Channels.
//!
//! `BoardThread`s are the persisted, queryable record of a conversation;
//! [`Channel`] adapters are how a [`crate::models::Message`] additionally
//! reaches a human-facing surface. The core never assumes a particular
//! channel exists — [`ChannelManager`] broadcasts best-effort to whatever
//! adapters are registered and reports per-adapter success: the data
//! model is first-class, a delivery surface is an extension point.

use crate::error::CoordError;
use crate::ids::{AgentId, ThreadId};
use crate::kv::{keys, KvBackend};
use crate::models::{BoardThread, Message, MessagePriority, MessageType, Post};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Board {
    kv: Arc<dyn KvBackend>,
}

impl Board {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    async fn write(&self, thread: &BoardThread) -> Result<()> {
        let payload = serde_json::to_string(thread)?;
        self.kv.set(&keys::board_thread(thread.id), &payload).await
    }

    pub async fn get_thread(&self, id: ThreadId) -> Result<Option<BoardThread>> {
        match self.kv.get(&keys::board_thread(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Creates a new thread on `channel`.
    pub async fn create_thread(
        &self,
        channel: impl Into<String>,
        title: impl Into<String>,
        created_by: AgentId,
    ) -> Result<ThreadId> {
        let thread = BoardThread {
            id: ThreadId::new(),
            channel: channel.into(),
            title: title.into(),
            created_by,
            created_at: Utc::now(),
            posts: Vec::new(),
            pinned: false,
        };
        let id = thread.id;
        self.write(&thread).await?;
        self.kv.sadd(keys::BOARD_THREADS_INDEX, &id.to_string()).await?;
        info!(thread_id = %id, "board thread created");
        Ok(id)
    }

    /// Appends a post to an existing thread.
    pub async fn reply(&self, thread_id: ThreadId, author: AgentId, body: impl Into<String>, priority: MessagePriority) -> Result<()> {
        let mut thread = self
        .get_thread(thread_id)
        .await?
        .ok_or_else(|| CoordError::Internal(anyhow::anyhow!("unknown thread {thread_id}")))?;
        thread.posts.push(Post {
                author,
                timestamp: Utc::now(),
                body: body.into(),
                priority,
        });
        self.write(&thread).await
    }

    pub async fn set_pinned(&self, thread_id: ThreadId, pinned: bool) -> Result<()> {
        let mut thread = self
        .get_thread(thread_id)
        .await?
        .ok_or_else(|| CoordError::Internal(anyhow::anyhow!("unknown thread {thread_id}")))?;
        thread.pinned = pinned;
        self.write(&thread).await
    }

    /// CLI listing surface.
    pub async fn list_threads(&self, channel: Option<&str>) -> Result<Vec<BoardThread>> {
        let ids = self.kv.smembers(keys::BOARD_THREADS_INDEX).await?;
        let mut out = Vec::new();
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<ThreadId>() else {
                continue;
            };
            if let Some(thread) = self.get_thread(id).await? {
                let matches = match channel {
                    Some(c) => c == thread.channel,
                    None => true,
                };
                if matches {
                    out.push(thread);
                }
            }
        }
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }
}

/// A human- or system-facing delivery surface for [`Message`]s. The core
/// never depends on a specific implementation; adapters are registered
/// with [`ChannelManager`] at startup by whatever binary wires the crate
/// together.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    async fn post(&self, message: &Message) -> Result<()>;
    async fn dm(&self, message: &Message) -> Result<()>;
    /// Notify this adapter that a new board thread was opened. Default is a
    /// no-op: an adapter that can't represent a thread of its own (the `log`
    /// adapter, for instance) just flattens every reply into `post`/`dm`
    /// instead. An adapter that can should also report it via
    /// `supports_feature("threads")`.
    async fn create_thread(&self, _title: &str, _channel: &str) -> Result<()> {
        Ok(())
    }
    /// Notify this adapter of a reply within an existing thread. Default
    /// forwards to `post`, the same flattening fallback as `create_thread`.
    async fn reply(&self, message: &Message) -> Result<()> {
        self.post(message).await
    }
    fn supports_feature(&self, feature: &str) -> bool;
}

/// Broadcasts every outgoing message to all registered adapters,
/// tolerating individual adapter failures rather than letting one bad
/// channel block delivery to the rest.
#[derive(Clone, Default)]
pub struct ChannelManager {
    channels: Vec<Arc<dyn Channel>>,
}

pub struct DeliveryReport {
    pub channel: String,
    pub delivered: bool,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self { channels: Vec::new() }
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels.push(channel);
    }

    pub async fn broadcast(&self, message: &Message) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let delivered = if message.to_agent.is_some() {
                channel.dm(message).await
            } else {
                channel.post(message).await
            };
            match delivered {
                Ok(()) => reports.push(DeliveryReport {
                        channel: channel.name().to_string(),
                        delivered: true,
                }),
                Err(e) => {
                    warn!(channel = channel.name(), error = %e, "channel delivery failed");
                    reports.push(DeliveryReport {
                            channel: channel.name().to_string(),
                            delivered: false,
                    });
                }
            }
        }
        reports
    }
}

/// Renders messages through `tracing` — the always-available fallback
/// adapter so the board has somewhere to go even with no real integration
/// configured.
pub struct LogChannel;

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn post(&self, message: &Message) -> Result<()> {
        match message.message_type {
            MessageType::Error => {
                tracing::error!(from = %message.from_agent, channel = ?message.channel, "{}", message.content)
            }
            MessageType::Question | MessageType::Announcement => {
                tracing::info!(from = %message.from_agent, channel = ?message.channel, "{}", message.content)
            }
            _ => tracing::debug!(from = %message.from_agent, channel = ?message.channel, "{}", message.content),
        }
        Ok(())
    }

    async fn dm(&self, message: &Message) -> Result<()> {
        tracing::info!(from = %message.from_agent, to = ?message.to_agent, "{}", message.content);
        Ok(())
    }

    fn supports_feature(&self, _feature: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FileBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn board() -> Board {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(FileBackend::open(dir.into_path()).await.unwrap());
        Board::new(kv)
    }

    #[tokio::test]
    async fn thread_accumulates_replies_in_order() {
        let b = board().await;
        let author = AgentId::new();
        let id = b.create_thread("general", "kickoff", author).await.unwrap();
        b.reply(id, author, "first", MessagePriority::Normal).await.unwrap();
        b.reply(id, author, "second", MessagePriority::Normal).await.unwrap();
        let thread = b.get_thread(id).await.unwrap().unwrap();
        assert_eq!(thread.posts.len(), 2);
        assert_eq!(thread.posts[0].body, "first");
        assert_eq!(thread.posts[1].body, "second");
    }

    #[tokio::test]
    async fn list_threads_filters_by_channel() {
        let b = board().await;
        let author = AgentId::new();
        b.create_thread("general", "a", author).await.unwrap();
        b.create_thread("backend", "b", author).await.unwrap();
        let general = b.list_threads(Some("general")).await.unwrap();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].channel, "general");
    }

    struct CountingChannel {
        count: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Channel for CountingChannel {
        fn name(&self) -> &str {
            "counting"
        }
        async fn post(&self, _message: &Message) -> Result<()> {
            if self.fail {
                return Err(CoordError::Internal(anyhow::anyhow!("boom")));
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn dm(&self, _message: &Message) -> Result<()> {
            Ok(())
        }
        fn supports_feature(&self, _feature: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn broadcast_tolerates_one_failing_adapter() {
        let mut manager = ChannelManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        manager.register(Arc::new(CountingChannel { count: count.clone(), fail: false }));
        manager.register(Arc::new(CountingChannel { count: count.clone(), fail: true }));
        manager.register(Arc::new(LogChannel));

        let message = Message {
            content: "hello".to_string(),
            from_agent: AgentId::new(),
            to_agent: None,
            channel: Some("general".to_string()),
            priority: MessagePriority::Normal,
            message_type: MessageType::Status,
            thread_id: None,
            timestamp: Utc::now(),
            metadata: Default::default(),
        };
        let reports = manager.broadcast(&message).await;
        assert_eq!(reports.len(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(reports.iter().any(|r| !r.delivered));
    }
}
