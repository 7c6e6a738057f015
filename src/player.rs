use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use actix::{
    fut::wrap_future, Actor, ActorContext, ActorFutureExt, AsyncContext, Context, Handler,
    Message, Recipient, ResponseActFuture,
};
use rand::seq::SliceRandom;

use crate::{
    chat::{ChannelId, ChatClient, GuildId, PlaybackEnd, UserId, VoiceClient, VoiceConnection},
    config::PlayerConfig,
    dispatch::{DispatchBoard, Notice},
    error::{AppError, AppErrorKind},
    history::HistoryItem,
    media::{MediaDownload, MediaMetadata},
};

const QUEUE_PAGE_ROWS: usize = 15;
const RECENT_BUNDLE_TTL: Duration = Duration::from_secs(120);

pub fn play_order_key(guild_id: GuildId) -> String {
    format!("play-order-{guild_id}")
}

fn recent_key(guild_id: GuildId) -> String {
    format!("history-{guild_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Joining,
    Playing,
    Paused,
    ShuttingDown,
}

/// Why a delivery was refused; the orchestrator maps these onto bundle
/// rows (queue-full is FAILED, a dying player is DISCARDED).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    QueueFull,
    TooLong,
    ShuttingDown,
}

/// Player lifecycle notifications consumed by the orchestrator.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub enum PlayerEvent {
    Joined {
        guild_id: GuildId,
        voice_channel_id: ChannelId,
    },
    Stopped {
        guild_id: GuildId,
    },
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct JoinVoice {
    pub user_id: UserId,
}

#[derive(Debug, Message)]
#[rtype(result = "Result<(), DeliverError>")]
pub struct Deliver {
    pub download: MediaDownload,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "Result<(), AppError>")]
pub enum PlayerCommand {
    Skip,
    Pause,
    Resume,
    Stop,
    Remove { index: usize },
    Bump { index: usize },
    Shuffle,
    Clear,
    ShowQueue,
    ShowRecent,
    MoveMessages { channel_id: ChannelId },
}

#[derive(Debug, Message)]
#[rtype(result = "()")]
struct PlaybackFinished {
    result: Result<PlaybackEnd, crate::chat::ChatError>,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct OccupancyReport {
    pub human_count: usize,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct ShutdownPlayer {
    pub reason: Arc<str>,
}

/// Per-guild playback state machine.
///
/// Owns the voice connection, the bounded local play queue, and the
/// sticky play-order bundle. Mutated only by orchestrator commands and by
/// its own playback futures; nothing else holds a reference.
pub struct GuildPlayer {
    guild_id: GuildId,
    text_channel_id: ChannelId,
    voice_channel_id: Option<ChannelId>,
    state: PlayerState,
    connection: Option<Arc<dyn VoiceConnection>>,
    queue: VecDeque<MediaDownload>,
    now_playing: Option<MediaDownload>,
    recent: VecDeque<MediaMetadata>,
    config: PlayerConfig,
    chat: Arc<dyn ChatClient>,
    voice: Arc<dyn VoiceClient>,
    board: Arc<DispatchBoard>,
    orchestrator: Recipient<PlayerEvent>,
    history_tx: tokio::sync::mpsc::UnboundedSender<HistoryItem>,
    empty_since: Option<Instant>,
    reconnect_attempted: bool,
}

impl GuildPlayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guild_id: GuildId,
        text_channel_id: ChannelId,
        config: PlayerConfig,
        chat: Arc<dyn ChatClient>,
        voice: Arc<dyn VoiceClient>,
        board: Arc<DispatchBoard>,
        orchestrator: Recipient<PlayerEvent>,
        history_tx: tokio::sync::mpsc::UnboundedSender<HistoryItem>,
    ) -> Self {
        Self {
            guild_id,
            text_channel_id,
            voice_channel_id: None,
            state: PlayerState::Idle,
            connection: None,
            queue: VecDeque::new(),
            now_playing: None,
            recent: VecDeque::new(),
            config,
            chat,
            voice,
            board,
            orchestrator,
            history_tx,
            empty_since: None,
            reconnect_attempted: false,
        }
    }

    fn notice(&self, text: impl Into<String>) {
        self.board.notice(Notice {
            channel_id: self.text_channel_id,
            text: text.into(),
            delete_after: Some(Duration::from_secs(60)),
        });
    }

    fn publish_queue(&self) {
        let key = play_order_key(self.guild_id);
        if !self.board.is_registered(&key) {
            return;
        }

        let mut lines = Vec::with_capacity(self.queue.len() + 2);
        match &self.now_playing {
            Some(download) => lines.push(format!(
                "Now playing: {title} (requested by {requester})",
                title = download.metadata.display_title(),
                requester = download.request.requester_name
            )),
            None => lines.push("Nothing playing".to_owned()),
        }
        if self.state == PlayerState::Paused {
            lines.push("(paused)".to_owned());
        }
        if !self.queue.is_empty() {
            lines.push("Up next:".to_owned());
            for (i, download) in self.queue.iter().enumerate() {
                lines.push(format!(
                    "{n}. {title} [{duration}]",
                    n = i + 1,
                    title = download.metadata.display_title(),
                    duration = format_duration(download.metadata.duration_s)
                ));
            }
        }

        self.board.publish(&key, paginate_lines(&lines, QUEUE_PAGE_ROWS));
    }

    fn start_next(&mut self, ctx: &mut Context<Self>) {
        if self.now_playing.is_some() || self.state == PlayerState::ShuttingDown {
            return;
        }
        let Some(connection) = self.connection.clone() else {
            return;
        };

        let Some(download) = self.queue.pop_front() else {
            self.state = PlayerState::Idle;
            self.publish_queue();
            return;
        };

        log::info!(
            "playback started, GUILD: {guild}, TITLE: {title}",
            guild = self.guild_id,
            title = download.metadata.display_title()
        );

        let path = download.local_path.clone();
        self.now_playing = Some(download);
        self.state = PlayerState::Playing;

        ctx.spawn(
            wrap_future(async move { connection.play(&path).await }).map(
                |result, _act: &mut Self, ctx| {
                    ctx.notify(PlaybackFinished { result });
                },
            ),
        );

        self.publish_queue();
    }

    fn begin_shutdown(&mut self, ctx: &mut Context<Self>, reason: &str) {
        if self.state == PlayerState::ShuttingDown {
            return;
        }
        self.state = PlayerState::ShuttingDown;
        log::info!(
            "player shutting down, GUILD: {guild}, REASON: {reason}",
            guild = self.guild_id
        );

        let mut doomed_files: Vec<std::path::PathBuf> =
            self.queue.drain(..).map(|d| d.local_path).collect();
        if let Some(playing) = self.now_playing.take() {
            doomed_files.push(playing.local_path);
        }
        let connection = self.connection.take();
        actix_rt::spawn(async move {
            if let Some(connection) = connection {
                connection.close().await;
            }
            for path in doomed_files {
                let _ = tokio::fs::remove_file(path).await;
            }
        });

        self.board.retire(&play_order_key(self.guild_id));
        self.notice("Disconnected from voice");
        self.orchestrator.do_send(PlayerEvent::Stopped {
            guild_id: self.guild_id,
        });
        ctx.stop();
    }

    fn record_history(&mut self, download: &MediaDownload) {
        self.recent
            .push_front(download.metadata.clone());
        self.recent.truncate(self.config.history_max_size);

        if download.request.from_history {
            return;
        }
        let item = HistoryItem {
            guild_id: self.guild_id,
            url: download.url.to_string(),
            title: download.metadata.title.clone(),
            duration_s: download.metadata.duration_s,
            cache_hit: download.cache_hit,
        };
        if self.history_tx.send(item).is_err() {
            log::error!("history writer is gone, GUILD: {guild}", guild = self.guild_id);
        }
    }

    fn with_connection<F>(&self, ctx: &mut Context<Self>, f: F)
    where
        F: FnOnce(Arc<dyn VoiceConnection>) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = ()> + Send>,
            > + 'static,
    {
        if let Some(connection) = self.connection.clone() {
            ctx.spawn(wrap_future(f(connection)));
        }
    }
}

impl Actor for GuildPlayer {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        log::info!("started new 'GuildPlayer', GUILD: {guild}", guild = self.guild_id);
        self.board
            .register(play_order_key(self.guild_id), self.text_channel_id, true);
    }
}

impl Handler<JoinVoice> for GuildPlayer {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, msg: JoinVoice, _ctx: &mut Self::Context) -> Self::Result {
        if self.connection.is_some() || self.state == PlayerState::Joining {
            return Box::pin(actix::fut::ready(()));
        }
        self.state = PlayerState::Joining;

        let chat = Arc::clone(&self.chat);
        let voice = Arc::clone(&self.voice);
        let guild_id = self.guild_id;

        Box::pin(
            wrap_future(async move {
                let channel = match chat.voice_channel_of(guild_id, msg.user_id).await {
                    Ok(Some(channel)) => channel,
                    Ok(None) => return Err("you need to be in a voice channel".to_owned()),
                    Err(err) => return Err(format!("failed to find your voice channel: {err}")),
                };

                // one retry on a transient gateway failure
                let connection = match voice.join(guild_id, channel).await {
                    Ok(connection) => connection,
                    Err(first_err) => {
                        log::error!(
                            "voice join failed, retrying once, GUILD: {guild_id}, ERROR: {first_err}"
                        );
                        voice
                            .join(guild_id, channel)
                            .await
                            .map_err(|err| format!("could not join voice: {err}"))?
                    }
                };
                Ok((channel, connection))
            })
            .map(|result, act: &mut Self, ctx| match result {
                Ok((channel, connection)) => {
                    act.voice_channel_id = Some(channel);
                    act.connection = Some(connection);
                    act.reconnect_attempted = false;
                    act.empty_since = None;
                    act.state = PlayerState::Idle;
                    act.orchestrator.do_send(PlayerEvent::Joined {
                        guild_id: act.guild_id,
                        voice_channel_id: channel,
                    });
                    act.start_next(ctx);
                }
                Err(reason) => {
                    // back to idle; the queue survives for the next join
                    // attempt
                    act.notice(reason);
                    act.state = PlayerState::Idle;
                }
            }),
        )
    }
}

impl Handler<Deliver> for GuildPlayer {
    type Result = Result<(), DeliverError>;

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) -> Self::Result {
        if self.state == PlayerState::ShuttingDown {
            return Err(DeliverError::ShuttingDown);
        }
        if self.queue.len() >= self.config.queue_max_size {
            return Err(DeliverError::QueueFull);
        }
        if let Some(duration_s) = msg.download.metadata.duration_s {
            if duration_s > self.config.max_song_length_s as i64 {
                return Err(DeliverError::TooLong);
            }
        }

        self.queue.push_back(msg.download);
        if self.now_playing.is_none() && self.state != PlayerState::Joining {
            self.start_next(ctx);
        } else {
            self.publish_queue();
        }
        Ok(())
    }
}

impl Handler<PlayerCommand> for GuildPlayer {
    type Result = Result<(), AppError>;

    fn handle(&mut self, msg: PlayerCommand, ctx: &mut Self::Context) -> Self::Result {
        match msg {
            PlayerCommand::Skip => {
                if self.now_playing.is_none() {
                    return Err(AppError::new(
                        AppErrorKind::Queue,
                        "nothing is playing",
                        &[],
                    ));
                }
                self.with_connection(ctx, |connection| {
                    Box::pin(async move { connection.stop().await })
                });
                Ok(())
            }
            PlayerCommand::Pause => {
                if self.state != PlayerState::Playing {
                    return Err(AppError::new(AppErrorKind::Queue, "nothing to pause", &[]));
                }
                self.state = PlayerState::Paused;
                self.with_connection(ctx, |connection| {
                    Box::pin(async move {
                        if let Err(err) = connection.pause().await {
                            log::error!("pause failed, ERROR: {err}");
                        }
                    })
                });
                self.publish_queue();
                Ok(())
            }
            PlayerCommand::Resume => {
                if self.state != PlayerState::Paused {
                    return Err(AppError::new(AppErrorKind::Queue, "nothing to resume", &[]));
                }
                self.state = PlayerState::Playing;
                self.with_connection(ctx, |connection| {
                    Box::pin(async move {
                        if let Err(err) = connection.resume().await {
                            log::error!("resume failed, ERROR: {err}");
                        }
                    })
                });
                self.publish_queue();
                Ok(())
            }
            PlayerCommand::Stop => {
                self.begin_shutdown(ctx, "stop command");
                Ok(())
            }
            PlayerCommand::Remove { index } => {
                if index >= self.queue.len() {
                    return Err(AppError::new(
                        AppErrorKind::Queue,
                        "no queue entry at that position",
                        &[&format!("INDEX: {index}")],
                    ));
                }
                let removed = self.queue.remove(index).expect("bounds checked");
                actix_rt::spawn(async move {
                    let _ = tokio::fs::remove_file(removed.local_path).await;
                });
                self.publish_queue();
                Ok(())
            }
            PlayerCommand::Bump { index } => {
                if index >= self.queue.len() {
                    return Err(AppError::new(
                        AppErrorKind::Queue,
                        "no queue entry at that position",
                        &[&format!("INDEX: {index}")],
                    ));
                }
                let bumped = self.queue.remove(index).expect("bounds checked");
                self.queue.push_front(bumped);
                self.publish_queue();
                Ok(())
            }
            PlayerCommand::Shuffle => {
                let mut items: Vec<MediaDownload> = self.queue.drain(..).collect();
                items.shuffle(&mut rand::thread_rng());
                self.queue = items.into();
                self.publish_queue();
                Ok(())
            }
            PlayerCommand::Clear => {
                let doomed: Vec<std::path::PathBuf> =
                    self.queue.drain(..).map(|d| d.local_path).collect();
                actix_rt::spawn(async move {
                    for path in doomed {
                        let _ = tokio::fs::remove_file(path).await;
                    }
                });
                self.publish_queue();
                Ok(())
            }
            PlayerCommand::ShowQueue => {
                self.publish_queue();
                Ok(())
            }
            PlayerCommand::ShowRecent => {
                let key = recent_key(self.guild_id);
                self.board.register(key.as_str(), self.text_channel_id, false);

                let mut lines = vec!["Recently played:".to_owned()];
                if self.recent.is_empty() {
                    lines.push("(nothing yet)".to_owned());
                }
                for (i, metadata) in self.recent.iter().enumerate() {
                    lines.push(format!(
                        "{n}. {title} [{duration}]",
                        n = i + 1,
                        title = metadata.display_title(),
                        duration = format_duration(metadata.duration_s)
                    ));
                }
                self.board.publish(&key, paginate_lines(&lines, QUEUE_PAGE_ROWS));

                let board = Arc::clone(&self.board);
                ctx.run_later(RECENT_BUNDLE_TTL, move |_act, _ctx| {
                    board.retire(&key);
                });
                Ok(())
            }
            PlayerCommand::MoveMessages { channel_id } => {
                self.text_channel_id = channel_id;
                self.board
                    .move_channel(&play_order_key(self.guild_id), channel_id);
                Ok(())
            }
        }
    }
}

impl Handler<PlaybackFinished> for GuildPlayer {
    type Result = ();

    fn handle(&mut self, msg: PlaybackFinished, ctx: &mut Self::Context) -> Self::Result {
        if self.state == PlayerState::ShuttingDown {
            return;
        }

        let finished = self.now_playing.take();
        if let Some(download) = &finished {
            let path = download.local_path.clone();
            actix_rt::spawn(async move {
                let _ = tokio::fs::remove_file(path).await;
            });
        }

        match msg.result {
            Ok(_end) => {
                if let Some(download) = &finished {
                    self.record_history(download);
                }
                self.reconnect_attempted = false;
                self.start_next(ctx);
            }
            Err(err) => {
                log::error!(
                    "voice stream failed, GUILD: {guild}, ERROR: {err}",
                    guild = self.guild_id
                );
                if self.reconnect_attempted {
                    self.begin_shutdown(ctx, "voice connection lost");
                    return;
                }
                self.reconnect_attempted = true;
                self.connection = None;

                let Some(channel) = self.voice_channel_id else {
                    self.begin_shutdown(ctx, "voice connection lost");
                    return;
                };
                let voice = Arc::clone(&self.voice);
                let guild_id = self.guild_id;
                ctx.spawn(
                    wrap_future(async move { voice.join(guild_id, channel).await }).map(
                        |result, act: &mut Self, ctx| match result {
                            Ok(connection) => {
                                act.connection = Some(connection);
                                act.start_next(ctx);
                            }
                            Err(err) => {
                                log::error!(
                                    "voice reconnect failed, GUILD: {guild}, ERROR: {err}",
                                    guild = act.guild_id
                                );
                                act.begin_shutdown(ctx, "voice reconnect failed");
                            }
                        },
                    ),
                );
            }
        }
    }
}

impl Handler<OccupancyReport> for GuildPlayer {
    type Result = ();

    fn handle(&mut self, msg: OccupancyReport, ctx: &mut Self::Context) -> Self::Result {
        if self.state == PlayerState::ShuttingDown || self.connection.is_none() {
            return;
        }

        if msg.human_count > 0 {
            self.empty_since = None;
            return;
        }

        let since = *self.empty_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= Duration::from_secs(self.config.empty_channel_timeout_s) {
            self.begin_shutdown(ctx, "voice channel empty past timeout");
        }
    }
}

impl Handler<ShutdownPlayer> for GuildPlayer {
    type Result = ();

    fn handle(&mut self, msg: ShutdownPlayer, ctx: &mut Self::Context) -> Self::Result {
        self.begin_shutdown(ctx, &msg.reason);
    }
}

fn format_duration(duration_s: Option<i64>) -> String {
    match duration_s {
        Some(total) if total >= 0 => {
            let minutes = total / 60;
            let seconds = total % 60;
            format!("{minutes}:{seconds:02}")
        }
        _ => "?:??".to_owned(),
    }
}

fn paginate_lines(lines: &[String], per_page: usize) -> Vec<String> {
    if lines.is_empty() {
        return vec![String::new()];
    }
    lines
        .chunks(per_page)
        .map(|chunk| chunk.join("\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        media::{MediaRequest, SearchKind},
        tests_utils::{FakeVoice, RecordingChat},
    };
    use actix::Actor;
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = 11;
    const TEXT_CHANNEL: ChannelId = 22;
    const VOICE_CHANNEL: ChannelId = 33;
    const USER: UserId = 44;

    struct EventSink;

    impl Actor for EventSink {
        type Context = Context<Self>;
    }

    impl Handler<PlayerEvent> for EventSink {
        type Result = ();
        fn handle(&mut self, _msg: PlayerEvent, _ctx: &mut Self::Context) {}
    }

    struct Rig {
        addr: actix::Addr<GuildPlayer>,
        chat: Arc<RecordingChat>,
        voice: Arc<FakeVoice>,
        board: Arc<DispatchBoard>,
        history_rx: tokio::sync::mpsc::UnboundedReceiver<HistoryItem>,
    }

    fn rig_with(config: PlayerConfig, voice: FakeVoice) -> Rig {
        let chat = Arc::new(RecordingChat::default());
        chat.put_user_in_voice(GUILD, USER, VOICE_CHANNEL);
        let voice = Arc::new(voice);
        let board = Arc::new(DispatchBoard::default());
        let (history_tx, history_rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink.start();

        let player = GuildPlayer::new(
            GUILD,
            TEXT_CHANNEL,
            config,
            chat.clone(),
            voice.clone(),
            board.clone(),
            sink.recipient(),
            history_tx,
        );

        Rig {
            addr: player.start(),
            chat,
            voice,
            board,
            history_rx,
        }
    }

    fn download(title: &str) -> MediaDownload {
        let request = MediaRequest::new(GUILD, TEXT_CHANNEL, USER, "tester", title, SearchKind::FreeText);
        MediaDownload {
            request,
            url: format!("https://www.youtube.com/watch?v={title}").into(),
            source_path: format!("/tmp/nonexistent/source-{title}.mp3").into(),
            local_path: format!("/tmp/nonexistent/use-{title}.mp3").into(),
            metadata: MediaMetadata {
                title: Some(title.to_owned()),
                uploader: None,
                duration_s: Some(61),
            },
            cache_hit: false,
            created_at: chrono::Utc::now(),
        }
    }

    async fn settle() {
        actix_rt::time::sleep(Duration::from_millis(30)).await;
    }

    #[actix_rt::test]
    async fn test_join_then_deliver_plays_in_order() {
        let mut rig = rig_with(
            PlayerConfig::default(),
            FakeVoice::auto_finishing(Duration::from_millis(20)),
        );

        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;

        rig.addr
            .send(Deliver {
                download: download("first"),
            })
            .await
            .unwrap()
            .unwrap();
        rig.addr
            .send(Deliver {
                download: download("second"),
            })
            .await
            .unwrap()
            .unwrap();

        actix_rt::time::sleep(Duration::from_millis(120)).await;

        let connection = rig.voice.connection(0).unwrap();
        let played = connection.played();
        assert_eq!(played.len(), 2);
        assert!(played[0].contains("first"));
        assert!(played[1].contains("second"));

        // both plays were recorded for the history writer
        let first = rig.history_rx.try_recv().unwrap();
        assert_eq!(first.guild_id, GUILD);
        assert!(rig.history_rx.try_recv().is_ok());
    }

    #[actix_rt::test]
    async fn test_queue_full_and_too_long_are_refused() {
        let config = PlayerConfig {
            queue_max_size: 1,
            ..PlayerConfig::default()
        };
        // no auto-finish: the first track occupies the player forever
        let mut rig = rig_with(config, FakeVoice::default());
        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;

        // first occupies now_playing, second fills the queue
        assert_eq!(
            rig.addr
                .send(Deliver {
                    download: download("a")
                })
                .await
                .unwrap(),
            Ok(())
        );
        assert_eq!(
            rig.addr
                .send(Deliver {
                    download: download("b")
                })
                .await
                .unwrap(),
            Ok(())
        );
        assert_eq!(
            rig.addr
                .send(Deliver {
                    download: download("c")
                })
                .await
                .unwrap(),
            Err(DeliverError::QueueFull)
        );

        let mut long = download("long");
        long.metadata.duration_s = Some(100_000);
        // remove the queued item to make room, then length still refuses
        rig.addr
            .send(PlayerCommand::Remove { index: 0 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            rig.addr.send(Deliver { download: long }).await.unwrap(),
            Err(DeliverError::TooLong)
        );
        let _ = rig.history_rx.try_recv();
    }

    #[actix_rt::test]
    async fn test_skip_advances_the_queue() {
        let mut rig = rig_with(PlayerConfig::default(), FakeVoice::default());
        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;

        rig.addr
            .send(Deliver {
                download: download("first"),
            })
            .await
            .unwrap()
            .unwrap();
        rig.addr
            .send(Deliver {
                download: download("second"),
            })
            .await
            .unwrap()
            .unwrap();
        settle().await;

        rig.addr.send(PlayerCommand::Skip).await.unwrap().unwrap();
        settle().await;

        let connection = rig.voice.connection(0).unwrap();
        assert_eq!(connection.played().len(), 2);
        // a skipped track still counts as played
        assert!(rig.history_rx.try_recv().is_ok());
    }

    #[actix_rt::test]
    async fn test_bump_and_shuffle_and_clear_manipulate_queue() {
        let rig = rig_with(PlayerConfig::default(), FakeVoice::default());
        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;

        for title in ["hold", "a", "b", "c"] {
            rig.addr
                .send(Deliver {
                    download: download(title),
                })
                .await
                .unwrap()
                .unwrap();
        }
        settle().await;

        // "hold" is playing; queue is [a, b, c]; bump c to the front
        rig.addr
            .send(PlayerCommand::Bump { index: 2 })
            .await
            .unwrap()
            .unwrap();

        rig.addr.send(PlayerCommand::Skip).await.unwrap().unwrap();
        settle().await;
        let connection = rig.voice.connection(0).unwrap();
        assert!(connection.played()[1].contains("-c."));

        rig.addr.send(PlayerCommand::Clear).await.unwrap().unwrap();
        rig.addr.send(PlayerCommand::Skip).await.unwrap().unwrap();
        settle().await;
        // nothing left to play after clear
        assert_eq!(connection.played().len(), 2);

        assert!(rig
            .addr
            .send(PlayerCommand::Remove { index: 5 })
            .await
            .unwrap()
            .is_err());
    }

    #[actix_rt::test]
    async fn test_empty_channel_timeout_shuts_down() {
        let config = PlayerConfig {
            empty_channel_timeout_s: 0,
            ..PlayerConfig::default()
        };
        let rig = rig_with(config, FakeVoice::default());
        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;

        rig.addr.send(OccupancyReport { human_count: 0 }).await.unwrap();
        settle().await;

        let connection = rig.voice.connection(0).unwrap();
        assert!(connection.is_closed());
        assert!(!rig.addr.connected());
    }

    #[actix_rt::test]
    async fn test_occupied_channel_keeps_player_alive() {
        let config = PlayerConfig {
            empty_channel_timeout_s: 0,
            ..PlayerConfig::default()
        };
        let rig = rig_with(config, FakeVoice::default());
        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;

        rig.addr.send(OccupancyReport { human_count: 2 }).await.unwrap();
        settle().await;
        assert!(rig.addr.connected());
    }

    #[actix_rt::test]
    async fn test_failed_join_leaves_player_idle_with_queue_intact() {
        let rig = rig_with(PlayerConfig::default(), FakeVoice::default());
        // the gateway refuses the join and its internal retry
        *rig.voice.fail_joins.lock().unwrap() = 2;

        rig.addr
            .send(Deliver {
                download: download("kept"),
            })
            .await
            .unwrap()
            .unwrap();
        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;

        // the player survives the failed join
        assert!(rig.addr.connected());

        // no disconnect notice; only the join-failure reason
        let dispatcher =
            crate::dispatch::MessageDispatcher::new(rig.chat.clone(), rig.board.clone(), 5);
        for _ in 0..4 {
            dispatcher.test_tick().await;
        }
        let texts = rig.chat.texts_in(TEXT_CHANNEL);
        assert!(!texts.iter().any(|t| t.contains("Disconnected from voice")));
        assert!(texts.iter().any(|t| t.contains("could not join voice")));

        // the queued item survived and plays once a join succeeds
        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;
        let connection = rig.voice.connection(0).unwrap();
        assert!(connection.played()[0].contains("kept"));
    }

    #[actix_rt::test]
    async fn test_voice_loss_reconnects_once_then_shuts_down() {
        let rig = rig_with(PlayerConfig::default(), FakeVoice::default());
        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;

        rig.addr
            .send(Deliver {
                download: download("track"),
            })
            .await
            .unwrap()
            .unwrap();
        settle().await;

        // force the in-flight play to fail by making the next join fail
        // after the stream error
        *rig.voice.fail_joins.lock().unwrap() = 1;
        let connection = rig.voice.connection(0).unwrap();
        connection.fail_current_play().await;
        settle().await;

        assert!(!rig.addr.connected());
    }

    #[actix_rt::test]
    async fn test_move_messages_retargets_status_channel() {
        let rig = rig_with(PlayerConfig::default(), FakeVoice::default());
        rig.addr.send(JoinVoice { user_id: USER }).await.unwrap();
        settle().await;

        rig.addr
            .send(PlayerCommand::MoveMessages { channel_id: 777 })
            .await
            .unwrap()
            .unwrap();
        rig.addr.send(PlayerCommand::Stop).await.unwrap().unwrap();
        settle().await;

        // drain the board: the disconnect notice must land in the new
        // channel, not the original one
        let dispatcher =
            crate::dispatch::MessageDispatcher::new(rig.chat.clone(), rig.board.clone(), 5);
        for _ in 0..4 {
            dispatcher.test_tick().await;
        }
        assert!(rig.chat.texts_in(TEXT_CHANNEL).is_empty());
        assert_eq!(rig.chat.texts_in(777), vec!["Disconnected from voice"]);
    }
}
