//! Console stand-ins for the chat platform and voice transport, so the
//! whole pipeline can run end-to-end on a development machine without the
//! real collaborator.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::chat::{
    ChannelId, ChatClient, ChatError, GuildId, MessageId, MessageRef, PlaybackEnd, UserId,
    VoiceClient, VoiceConnection,
};

/// Pretend playback length of every track.
const SIMULATED_TRACK_LENGTH: Duration = Duration::from_secs(5);
const SIMULATED_VOICE_CHANNEL: ChannelId = 1;

/// Chat client that logs every operation and keeps messages in memory so
/// edits and deletes behave like the real platform.
#[derive(Default)]
pub struct ConsoleChat {
    next_id: AtomicU64,
    channels: Mutex<HashMap<ChannelId, Vec<(MessageId, String)>>>,
}

#[async_trait]
impl ChatClient for ConsoleChat {
    async fn send(&self, channel_id: ChannelId, text: &str) -> Result<MessageRef, ChatError> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.channels
            .lock()
            .expect("console chat lock poisoned")
            .entry(channel_id)
            .or_default()
            .push((message_id, text.to_owned()));
        log::info!("[chat #{channel_id}] SEND {message_id}:\n{text}");
        Ok(MessageRef {
            channel_id,
            message_id,
        })
    }

    async fn edit(&self, message: &MessageRef, text: &str) -> Result<(), ChatError> {
        let mut channels = self.channels.lock().expect("console chat lock poisoned");
        let messages = channels
            .get_mut(&message.channel_id)
            .ok_or(ChatError::NotFound)?;
        let slot = messages
            .iter_mut()
            .find(|(id, _)| *id == message.message_id)
            .ok_or(ChatError::NotFound)?;
        slot.1 = text.to_owned();
        log::info!(
            "[chat #{channel}] EDIT {id}:\n{text}",
            channel = message.channel_id,
            id = message.message_id
        );
        Ok(())
    }

    async fn delete(&self, message: &MessageRef) -> Result<(), ChatError> {
        let mut channels = self.channels.lock().expect("console chat lock poisoned");
        let messages = channels
            .get_mut(&message.channel_id)
            .ok_or(ChatError::NotFound)?;
        let before = messages.len();
        messages.retain(|(id, _)| *id != message.message_id);
        if messages.len() == before {
            return Err(ChatError::NotFound);
        }
        log::info!(
            "[chat #{channel}] DELETE {id}",
            channel = message.channel_id,
            id = message.message_id
        );
        Ok(())
    }

    async fn fetch_recent(
        &self,
        channel_id: ChannelId,
        limit: usize,
    ) -> Result<Vec<MessageId>, ChatError> {
        let channels = self.channels.lock().expect("console chat lock poisoned");
        let mut ids: Vec<MessageId> = channels
            .get(&channel_id)
            .map(|messages| messages.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.truncate(limit);
        Ok(ids)
    }

    async fn voice_channel_of(
        &self,
        _guild_id: GuildId,
        _user_id: UserId,
    ) -> Result<Option<ChannelId>, ChatError> {
        Ok(Some(SIMULATED_VOICE_CHANNEL))
    }

    async fn voice_member_count(
        &self,
        _guild_id: GuildId,
        _channel_id: ChannelId,
    ) -> Result<usize, ChatError> {
        // always occupied, so players never idle out during local runs
        Ok(1)
    }
}

/// Voice transport that "plays" by sleeping.
#[derive(Default)]
pub struct ConsoleVoice;

#[async_trait]
impl VoiceClient for ConsoleVoice {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>, ChatError> {
        log::info!("[voice] joined guild {guild_id} channel {channel_id}");
        Ok(Arc::new(ConsoleVoiceConnection {
            guild_id,
            stop: Notify::new(),
        }))
    }
}

struct ConsoleVoiceConnection {
    guild_id: GuildId,
    stop: Notify,
}

#[async_trait]
impl VoiceConnection for ConsoleVoiceConnection {
    async fn play(&self, path: &Path) -> Result<PlaybackEnd, ChatError> {
        log::info!(
            "[voice] guild {guild} playing {path}",
            guild = self.guild_id,
            path = path.display()
        );
        tokio::select! {
            _ = self.stop.notified() => Ok(PlaybackEnd::Stopped),
            _ = tokio::time::sleep(SIMULATED_TRACK_LENGTH) => Ok(PlaybackEnd::Finished),
        }
    }

    async fn pause(&self) -> Result<(), ChatError> {
        log::info!("[voice] guild {guild} paused", guild = self.guild_id);
        Ok(())
    }

    async fn resume(&self) -> Result<(), ChatError> {
        log::info!("[voice] guild {guild} resumed", guild = self.guild_id);
        Ok(())
    }

    async fn stop(&self) {
        self.stop.notify_waiters();
    }

    async fn close(&self) {
        log::info!("[voice] guild {guild} disconnected", guild = self.guild_id);
        self.stop.notify_waiters();
    }
}
