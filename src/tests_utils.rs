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

/// In-memory chat platform for tests: messages live per channel in send
/// order, ids increase monotonically, and every operation is recorded.
#[derive(Default)]
pub struct RecordingChat {
    next_id: AtomicU64,
    ops: Mutex<u64>,
    sends: Mutex<u64>,
    channels: Mutex<HashMap<ChannelId, Vec<(MessageId, String)>>>,
    pub user_voice_channels: Mutex<HashMap<(GuildId, UserId), ChannelId>>,
    pub voice_members: Mutex<HashMap<(GuildId, ChannelId), usize>>,
}

impl RecordingChat {
    pub fn texts_in(&self, channel_id: ChannelId) -> Vec<String> {
        self.channels
            .lock()
            .unwrap()
            .get(&channel_id)
            .map(|msgs| msgs.iter().map(|(_, text)| text.clone()).collect())
            .unwrap_or_default()
    }

    pub fn op_count(&self) -> u64 {
        *self.ops.lock().unwrap()
    }

    pub fn send_count(&self) -> u64 {
        *self.sends.lock().unwrap()
    }

    /// Simulates a foreign deletion: the n-th message of the channel
    /// disappears without the dispatcher knowing.
    pub fn drop_message(&self, channel_id: ChannelId, index: usize) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(msgs) = channels.get_mut(&channel_id) {
            if index < msgs.len() {
                msgs.remove(index);
            }
        }
    }

    pub fn put_user_in_voice(&self, guild_id: GuildId, user_id: UserId, channel_id: ChannelId) {
        self.user_voice_channels
            .lock()
            .unwrap()
            .insert((guild_id, user_id), channel_id);
        let mut members = self.voice_members.lock().unwrap();
        *members.entry((guild_id, channel_id)).or_insert(0) += 1;
    }

    pub fn set_voice_members(&self, guild_id: GuildId, channel_id: ChannelId, count: usize) {
        self.voice_members
            .lock()
            .unwrap()
            .insert((guild_id, channel_id), count);
    }

    fn bump_ops(&self) {
        *self.ops.lock().unwrap() += 1;
    }
}

#[async_trait]
impl ChatClient for RecordingChat {
    async fn send(&self, channel_id: ChannelId, text: &str) -> Result<MessageRef, ChatError> {
        self.bump_ops();
        *self.sends.lock().unwrap() += 1;
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.channels
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .push((message_id, text.to_owned()));
        Ok(MessageRef {
            channel_id,
            message_id,
        })
    }

    async fn edit(&self, message: &MessageRef, text: &str) -> Result<(), ChatError> {
        self.bump_ops();
        let mut channels = self.channels.lock().unwrap();
        let msgs = channels
            .get_mut(&message.channel_id)
            .ok_or(ChatError::NotFound)?;
        let slot = msgs
            .iter_mut()
            .find(|(id, _)| *id == message.message_id)
            .ok_or(ChatError::NotFound)?;
        slot.1 = text.to_owned();
        Ok(())
    }

    async fn delete(&self, message: &MessageRef) -> Result<(), ChatError> {
        self.bump_ops();
        let mut channels = self.channels.lock().unwrap();
        let msgs = channels
            .get_mut(&message.channel_id)
            .ok_or(ChatError::NotFound)?;
        let before = msgs.len();
        msgs.retain(|(id, _)| *id != message.message_id);
        if msgs.len() == before {
            return Err(ChatError::NotFound);
        }
        Ok(())
    }

    async fn fetch_recent(
        &self,
        channel_id: ChannelId,
        limit: usize,
    ) -> Result<Vec<MessageId>, ChatError> {
        let channels = self.channels.lock().unwrap();
        let mut ids: Vec<MessageId> = channels
            .get(&channel_id)
            .map(|msgs| msgs.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.truncate(limit);
        Ok(ids)
    }

    async fn voice_channel_of(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<Option<ChannelId>, ChatError> {
        Ok(self
            .user_voice_channels
            .lock()
            .unwrap()
            .get(&(guild_id, user_id))
            .copied())
    }

    async fn voice_member_count(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<usize, ChatError> {
        Ok(self
            .voice_members
            .lock()
            .unwrap()
            .get(&(guild_id, channel_id))
            .copied()
            .unwrap_or(0))
    }
}

/// Voice transport for tests. Tracks play by default until `stop`; with
/// `auto_finish` each track "plays" for that long and ends naturally.
pub struct FakeVoice {
    pub auto_finish: Option<Duration>,
    pub fail_joins: Mutex<u32>,
    connections: Mutex<Vec<Arc<FakeVoiceConnection>>>,
}

impl Default for FakeVoice {
    fn default() -> Self {
        Self {
            auto_finish: None,
            fail_joins: Mutex::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }
}

impl FakeVoice {
    pub fn auto_finishing(after: Duration) -> Self {
        Self {
            auto_finish: Some(after),
            ..Default::default()
        }
    }

    pub fn connection(&self, index: usize) -> Option<Arc<FakeVoiceConnection>> {
        self.connections.lock().unwrap().get(index).cloned()
    }
}

#[async_trait]
impl VoiceClient for FakeVoice {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>, ChatError> {
        {
            let mut fail_joins = self.fail_joins.lock().unwrap();
            if *fail_joins > 0 {
                *fail_joins -= 1;
                return Err(ChatError::transient("voice gateway unavailable"));
            }
        }

        let connection = Arc::new(FakeVoiceConnection {
            guild_id,
            channel_id,
            auto_finish: self.auto_finish,
            stop: Notify::new(),
            fail: Notify::new(),
            played: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        });
        self.connections.lock().unwrap().push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct FakeVoiceConnection {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    auto_finish: Option<Duration>,
    stop: Notify,
    fail: Notify,
    played: Mutex<Vec<String>>,
    closed: Mutex<bool>,
}

impl FakeVoiceConnection {
    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    /// Makes the in-flight `play` resolve with a transport error, as if
    /// the voice stream died mid-track.
    pub async fn fail_current_play(&self) {
        self.fail.notify_waiters();
    }
}

#[async_trait]
impl VoiceConnection for FakeVoiceConnection {
    async fn play(&self, path: &Path) -> Result<PlaybackEnd, ChatError> {
        self.played
            .lock()
            .unwrap()
            .push(path.to_string_lossy().into_owned());

        match self.auto_finish {
            Some(after) => {
                tokio::select! {
                    _ = self.stop.notified() => Ok(PlaybackEnd::Stopped),
                    _ = self.fail.notified() => Err(ChatError::transient("voice stream died")),
                    _ = tokio::time::sleep(after) => Ok(PlaybackEnd::Finished),
                }
            }
            None => {
                tokio::select! {
                    _ = self.stop.notified() => Ok(PlaybackEnd::Stopped),
                    _ = self.fail.notified() => Err(ChatError::transient("voice stream died")),
                }
            }
        }
    }

    async fn pause(&self) -> Result<(), ChatError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), ChatError> {
        Ok(())
    }

    async fn stop(&self) {
        self.stop.notify_waiters();
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
        self.stop.notify_waiters();
    }
}
