use std::{fmt::Display, path::Path, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type GuildId = u64;
pub type ChannelId = u64;
pub type UserId = u64;
/// Message ids are monotonically increasing within a channel; "newer"
/// comparisons rely on that.
pub type MessageId = u64;

/// Handle to a message the service has sent and may later edit or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

/// Error classes of the chat platform, collapsed to what the dispatch and
/// player paths actually branch on.
#[derive(Debug, Clone)]
pub enum ChatError {
    /// 404 class: the target message/channel no longer exists. Non-fatal
    /// for edits and deletes; the caller forgets the handle.
    NotFound,
    /// 5xx class: worth retrying on the next tick.
    Transient(Arc<str>),
    Other(Arc<str>),
}

impl ChatError {
    pub fn transient(msg: impl Into<Arc<str>>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn other(msg: impl Into<Arc<str>>) -> Self {
        Self::Other(msg.into())
    }
}

impl Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Transient(msg) => write!(f, "transient chat error: {msg}"),
            Self::Other(msg) => write!(f, "chat error: {msg}"),
        }
    }
}

impl std::error::Error for ChatError {}

/// The message surface of the chat platform. All operations have
/// at-most-once-success semantics; retrying after a transport error is the
/// caller's responsibility and is idempotent on the platform side.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send(&self, channel_id: ChannelId, text: &str) -> Result<MessageRef, ChatError>;
    async fn edit(&self, message: &MessageRef, text: &str) -> Result<(), ChatError>;
    async fn delete(&self, message: &MessageRef) -> Result<(), ChatError>;
    /// Most recent messages in a channel, newest first.
    async fn fetch_recent(
        &self,
        channel_id: ChannelId,
        limit: usize,
    ) -> Result<Vec<MessageId>, ChatError>;
    /// The voice channel the user currently sits in, if any.
    async fn voice_channel_of(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<Option<ChannelId>, ChatError>;
    /// Number of non-bot members currently in the voice channel.
    async fn voice_member_count(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<usize, ChatError>;
}

/// Why a playback future resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// The track ran to its natural end.
    Finished,
    /// `stop` was called (skip, stop command, shutdown).
    Stopped,
}

#[async_trait]
pub trait VoiceClient: Send + Sync {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>, ChatError>;
}

/// One live voice connection. `play` resolves when the track ends or is
/// stopped; exactly one track plays at a time per connection.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    async fn play(&self, path: &Path) -> Result<PlaybackEnd, ChatError>;
    async fn pause(&self) -> Result<(), ChatError>;
    async fn resume(&self) -> Result<(), ChatError>;
    /// Aborts the in-flight `play`, resolving it with `Stopped`.
    async fn stop(&self);
    async fn close(&self);
}
