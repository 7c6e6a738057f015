use std::{collections::HashMap, sync::Arc, time::Duration};

use actix::{Actor, Addr, AsyncContext, Context, Handler, Message, MessageResponse};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::{
    bundle::BundleRegistry,
    cache::DownloadCache,
    chat::{ChannelId, ChatClient, GuildId, UserId, VoiceClient},
    config::Config,
    dispatch::{DispatchBoard, MessageDispatcher, Notice},
    extractor::Downloader,
    health::Heartbeats,
    history::{self, HistoryItem, HistoryStore},
    media::{MediaDownload, RequestOrigin, RequestStage, SearchKind},
    player::{
        DeliverError, GuildPlayer, JoinVoice, PlayerCommand, PlayerEvent, ShutdownPlayer,
    },
    queues::DistributedQueue,
    resolver::SearchResolver,
};

pub mod loops;

use loops::Pipeline;

const NOTICE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_RANDOM_PLAY_COUNT: usize = 5;

/// The structured command record handed over by the chat collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandContext {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub user_display_name: Arc<str>,
}

impl CommandContext {
    fn origin(&self) -> RequestOrigin {
        RequestOrigin {
            guild_id: self.guild_id,
            channel_id: self.channel_id,
            user_id: self.user_id,
            user_display_name: Arc::clone(&self.user_display_name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MusicAction {
    Join,
    Play(PlayParams),
    Skip,
    Pause,
    Resume,
    Stop,
    Remove(QueuePositionParams),
    Bump(QueuePositionParams),
    Shuffle,
    ShowQueue,
    ShowHistory,
    MoveMessages,
    Playlist(PlaylistAction),
    RandomPlay(RandomPlayParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayParams {
    pub query: String,
}

/// 1-based position as users see it in the queue display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePositionParams {
    pub position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaylistAction {
    Create { name: String },
    List,
    Show { name: String },
    ItemAdd { name: String, query: String },
    ItemRemove { name: String, position: usize },
    Delete { name: String },
    Queue { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomPlayParams {
    #[serde(default)]
    pub cache_only: bool,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct MusicCommand {
    pub context: CommandContext,
    pub action: MusicAction,
}

/// A realized download heading for a guild's play queue. Sent by the
/// download loop and the cache-hit path.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub struct DeliverDownload {
    pub download: MediaDownload,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "ActivePlayers")]
pub struct GetActivePlayers;

#[derive(Debug, MessageResponse)]
pub struct ActivePlayers(pub Vec<PlayerProbe>);

#[derive(Debug, Clone)]
pub struct PlayerProbe {
    pub guild_id: GuildId,
    pub voice_channel_id: Option<ChannelId>,
    pub addr: Addr<GuildPlayer>,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct ShutdownSystem;

struct PlayerHandle {
    addr: Addr<GuildPlayer>,
    voice_channel_id: Option<ChannelId>,
}

/// Top-level owner of the guild players, the distributed queues, and all
/// background loops; sole entry point for commands.
pub struct MusicOrchestrator {
    config: Arc<Config>,
    chat: Arc<dyn ChatClient>,
    voice: Arc<dyn VoiceClient>,
    resolver: Arc<SearchResolver>,
    cache: Arc<DownloadCache>,
    downloader: Arc<Downloader>,
    board: Arc<DispatchBoard>,
    bundles: Arc<BundleRegistry>,
    history_store: Arc<HistoryStore>,
    heartbeats: Arc<Heartbeats>,
    search_queue: DistributedQueue<crate::media::MediaRequest>,
    download_queue: DistributedQueue<crate::media::MediaRequest>,
    players: HashMap<GuildId, PlayerHandle>,
    history_tx: mpsc::UnboundedSender<HistoryItem>,
    history_rx: Option<mpsc::UnboundedReceiver<HistoryItem>>,
    shutdown_tx: watch::Sender<bool>,
    pipeline: Option<Arc<Pipeline>>,
}

impl MusicOrchestrator {
    pub fn new(
        config: Arc<Config>,
        chat: Arc<dyn ChatClient>,
        voice: Arc<dyn VoiceClient>,
        resolver: Arc<SearchResolver>,
        cache: Arc<DownloadCache>,
        downloader: Arc<Downloader>,
        history_store: Arc<HistoryStore>,
    ) -> Self {
        let priorities: HashMap<GuildId, i32> = config
            .queues
            .priorities
            .iter()
            .filter_map(|(key, priority)| key.parse().ok().map(|guild| (guild, *priority)))
            .collect();

        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            search_queue: DistributedQueue::new(config.queues.search_capacity, priorities.clone()),
            download_queue: DistributedQueue::new(config.queues.download_capacity, priorities),
            config,
            chat,
            voice,
            resolver,
            cache,
            downloader,
            board: Arc::new(DispatchBoard::default()),
            bundles: Arc::new(BundleRegistry::default()),
            history_store,
            heartbeats: Arc::new(Heartbeats::default()),
            players: HashMap::new(),
            history_tx,
            history_rx: Some(history_rx),
            shutdown_tx,
            pipeline: None,
        }
    }

    pub fn heartbeats(&self) -> Arc<Heartbeats> {
        Arc::clone(&self.heartbeats)
    }

    fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(self.pipeline.as_ref().expect("pipeline set in started()"))
    }

    fn notice(&self, channel_id: ChannelId, text: impl Into<String>) {
        self.board.notice(Notice {
            channel_id,
            text: text.into(),
            delete_after: Some(NOTICE_TTL),
        });
    }

    fn player_or_notice(&self, context: &CommandContext) -> Option<&PlayerHandle> {
        let handle = self.players.get(&context.guild_id);
        if handle.is_none() {
            self.notice(context.channel_id, "nothing is playing in this server");
        }
        handle
    }

    fn get_or_create_player(
        &mut self,
        ctx: &mut Context<Self>,
        context: &CommandContext,
    ) -> Addr<GuildPlayer> {
        if let Some(handle) = self.players.get(&context.guild_id) {
            return handle.addr.clone();
        }

        let player = GuildPlayer::new(
            context.guild_id,
            context.channel_id,
            self.config.player.clone(),
            Arc::clone(&self.chat),
            Arc::clone(&self.voice),
            Arc::clone(&self.board),
            ctx.address().recipient(),
            self.history_tx.clone(),
        );
        let addr = player.start();
        self.players.insert(
            context.guild_id,
            PlayerHandle {
                addr: addr.clone(),
                voice_channel_id: None,
            },
        );
        addr.do_send(JoinVoice {
            user_id: context.user_id,
        });
        addr
    }

    /// Forwards a queue-level command to the guild's player, surfacing
    /// the player's refusal as a notice.
    fn forward_player_command(&self, context: &CommandContext, command: PlayerCommand) {
        let Some(handle) = self.player_or_notice(context) else {
            return;
        };
        let addr = handle.addr.clone();
        let board = Arc::clone(&self.board);
        let channel_id = context.channel_id;
        actix_rt::spawn(async move {
            match addr.send(command).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    board.notice(Notice {
                        channel_id,
                        text: err.info().to_owned(),
                        delete_after: Some(NOTICE_TTL),
                    });
                }
                Err(err) => log::error!("player command undeliverable, ERROR: {err}"),
            }
        });
    }

    fn handle_playlist_action(&mut self, context: CommandContext, action: PlaylistAction) {
        let pipeline = self.pipeline();
        let store = Arc::clone(&self.history_store);
        let channel_id = context.channel_id;
        let guild_id = context.guild_id;

        match action {
            PlaylistAction::Create { name } => {
                actix_rt::spawn(async move {
                    let text = match store.create_playlist(guild_id, &name).await {
                        Ok(()) => format!("created playlist '{name}'"),
                        Err(err) => err.info().to_owned(),
                    };
                    pipeline.board.notice(Notice {
                        channel_id,
                        text,
                        delete_after: Some(NOTICE_TTL),
                    });
                });
            }
            PlaylistAction::List => {
                actix_rt::spawn(async move {
                    match store.list_playlists(guild_id).await {
                        Ok(playlists) if playlists.is_empty() => {
                            pipeline.board.notice(Notice {
                                channel_id,
                                text: "no playlists yet".to_owned(),
                                delete_after: Some(NOTICE_TTL),
                            });
                        }
                        Ok(playlists) => {
                            let mut lines = vec!["Playlists:".to_owned()];
                            lines.extend(
                                playlists.iter().map(|p| format!("- {name}", name = p.name)),
                            );
                            pipeline.publish_transient(
                                format!("playlists-{guild_id}"),
                                channel_id,
                                vec![lines.join("\n")],
                            );
                        }
                        Err(err) => {
                            pipeline.board.notice(Notice {
                                channel_id,
                                text: err.info().to_owned(),
                                delete_after: Some(NOTICE_TTL),
                            });
                        }
                    }
                });
            }
            PlaylistAction::Show { name } => {
                actix_rt::spawn(async move {
                    match store.playlist_items(guild_id, &name).await {
                        Ok(items) => {
                            let mut lines = vec![format!("Playlist '{name}':")];
                            if items.is_empty() {
                                lines.push("(empty)".to_owned());
                            }
                            lines.extend(items.iter().enumerate().map(|(i, item)| {
                                format!(
                                    "{n}. {title}",
                                    n = i + 1,
                                    title = item.title.as_deref().unwrap_or(&item.url)
                                )
                            }));
                            pipeline.publish_transient(
                                format!("playlist-show-{guild_id}"),
                                channel_id,
                                vec![lines.join("\n")],
                            );
                        }
                        Err(err) => {
                            pipeline.board.notice(Notice {
                                channel_id,
                                text: err.info().to_owned(),
                                delete_after: Some(NOTICE_TTL),
                            });
                        }
                    }
                });
            }
            PlaylistAction::ItemAdd { name, query } => {
                let origin = context.origin();
                actix_rt::spawn(async move {
                    // the playlist must exist before we spend a download on it
                    if let Err(err) = store.playlist_items(guild_id, &name).await {
                        pipeline.board.notice(Notice {
                            channel_id,
                            text: err.info().to_owned(),
                            delete_after: Some(NOTICE_TTL),
                        });
                        return;
                    }

                    match pipeline.resolver.resolve_play(&origin, &query).await {
                        Ok(resolved) if !resolved.requests.is_empty() => {
                            let mut requests = resolved.requests;
                            for request in &mut requests {
                                request.save_to_playlist = Some(name.as_str().into());
                            }
                            pipeline
                                .preresolved_flow(
                                    origin,
                                    format!("add to '{name}'"),
                                    requests,
                                )
                                .await;
                        }
                        Ok(_) => {
                            pipeline.board.notice(Notice {
                                channel_id,
                                text: "nothing found".to_owned(),
                                delete_after: Some(NOTICE_TTL),
                            });
                        }
                        Err(err) => {
                            pipeline.board.notice(Notice {
                                channel_id,
                                text: err.info().to_owned(),
                                delete_after: Some(NOTICE_TTL),
                            });
                        }
                    }
                });
            }
            PlaylistAction::ItemRemove { name, position } => {
                actix_rt::spawn(async move {
                    let index = position.saturating_sub(1);
                    let text = match store.remove_playlist_item(guild_id, &name, index).await {
                        Ok(()) => format!("removed item {position} from '{name}'"),
                        Err(err) => err.info().to_owned(),
                    };
                    pipeline.board.notice(Notice {
                        channel_id,
                        text,
                        delete_after: Some(NOTICE_TTL),
                    });
                });
            }
            PlaylistAction::Delete { name } => {
                actix_rt::spawn(async move {
                    let text = match store.delete_playlist(guild_id, &name).await {
                        Ok(()) => format!("deleted playlist '{name}'"),
                        Err(err) => err.info().to_owned(),
                    };
                    pipeline.board.notice(Notice {
                        channel_id,
                        text,
                        delete_after: Some(NOTICE_TTL),
                    });
                });
            }
            PlaylistAction::Queue { name } => {
                let origin = context.origin();
                actix_rt::spawn(async move {
                    match store.playlist_items(guild_id, &name).await {
                        Ok(items) if items.is_empty() => {
                            pipeline.board.notice(Notice {
                                channel_id,
                                text: format!("playlist '{name}' is empty"),
                                delete_after: Some(NOTICE_TTL),
                            });
                        }
                        Ok(items) => {
                            if let Err(err) = store.mark_playlist_queued(guild_id, &name).await
                            {
                                log::error!("failed to stamp queued_at, ERROR: {err}");
                            }
                            let requests = items
                                .into_iter()
                                .map(|item| {
                                    origin.media_request(item.url, SearchKind::VideoUrl)
                                })
                                .collect();
                            pipeline
                                .preresolved_flow(origin, format!("playlist '{name}'"), requests)
                                .await;
                        }
                        Err(err) => {
                            pipeline.board.notice(Notice {
                                channel_id,
                                text: err.info().to_owned(),
                                delete_after: Some(NOTICE_TTL),
                            });
                        }
                    }
                });
            }
        }
    }
}

impl Actor for MusicOrchestrator {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!("started new 'MusicOrchestrator'");

        let pipeline = Arc::new(Pipeline {
            orchestrator: ctx.address(),
            config: Arc::clone(&self.config),
            chat: Arc::clone(&self.chat),
            resolver: Arc::clone(&self.resolver),
            cache: Arc::clone(&self.cache),
            downloader: Arc::clone(&self.downloader),
            board: Arc::clone(&self.board),
            bundles: Arc::clone(&self.bundles),
            history_store: Arc::clone(&self.history_store),
            search_queue: self.search_queue.clone(),
            download_queue: self.download_queue.clone(),
            heartbeats: Arc::clone(&self.heartbeats),
        });
        self.pipeline = Some(Arc::clone(&pipeline));

        let dispatcher = MessageDispatcher::new(
            Arc::clone(&self.chat),
            Arc::clone(&self.board),
            self.config.dispatch.sticky_recent_window,
        );
        actix_rt::spawn(dispatcher.run(self.shutdown_tx.subscribe(), self.heartbeats()));

        actix_rt::spawn(loops::run_search_loop(
            Arc::clone(&pipeline),
            self.shutdown_tx.subscribe(),
        ));
        actix_rt::spawn(loops::run_download_loop(
            Arc::clone(&pipeline),
            self.shutdown_tx.subscribe(),
        ));
        actix_rt::spawn(loops::run_player_cleanup(
            Arc::clone(&pipeline),
            self.shutdown_tx.subscribe(),
        ));
        actix_rt::spawn(loops::run_cache_cleanup(
            Arc::clone(&pipeline),
            self.shutdown_tx.subscribe(),
        ));

        let history_rx = self.history_rx.take().expect("history receiver unclaimed");
        actix_rt::spawn(history::run_history_writer(
            Arc::clone(&self.history_store),
            history_rx,
            self.config.history.clone(),
            self.shutdown_tx.subscribe(),
            self.heartbeats(),
        ));
    }
}

impl Handler<MusicCommand> for MusicOrchestrator {
    type Result = ();

    fn handle(&mut self, msg: MusicCommand, ctx: &mut Self::Context) -> Self::Result {
        let MusicCommand { context, action } = msg;
        log::info!(
            "command received, GUILD: {guild}, ACTION: {action:?}",
            guild = context.guild_id
        );

        match action {
            MusicAction::Join => {
                self.get_or_create_player(ctx, &context);
            }
            MusicAction::Play(params) => {
                self.get_or_create_player(ctx, &context);
                let pipeline = self.pipeline();
                let origin = context.origin();
                actix_rt::spawn(async move {
                    pipeline.play_flow(origin, params.query).await;
                });
            }
            MusicAction::Skip => self.forward_player_command(&context, PlayerCommand::Skip),
            MusicAction::Pause => self.forward_player_command(&context, PlayerCommand::Pause),
            MusicAction::Resume => self.forward_player_command(&context, PlayerCommand::Resume),
            MusicAction::Stop => self.forward_player_command(&context, PlayerCommand::Stop),
            MusicAction::Remove(params) => self.forward_player_command(
                &context,
                PlayerCommand::Remove {
                    index: params.position.saturating_sub(1),
                },
            ),
            MusicAction::Bump(params) => self.forward_player_command(
                &context,
                PlayerCommand::Bump {
                    index: params.position.saturating_sub(1),
                },
            ),
            MusicAction::Shuffle => self.forward_player_command(&context, PlayerCommand::Shuffle),
            MusicAction::ShowQueue => {
                self.forward_player_command(&context, PlayerCommand::ShowQueue)
            }
            MusicAction::ShowHistory => {
                if self.players.contains_key(&context.guild_id) {
                    self.forward_player_command(&context, PlayerCommand::ShowRecent);
                    return;
                }
                // no live player; render from the persistent history
                let pipeline = self.pipeline();
                let guild_id = context.guild_id;
                let channel_id = context.channel_id;
                actix_rt::spawn(async move {
                    match pipeline.history_store.history_items(guild_id).await {
                        Ok(items) if items.is_empty() => {
                            pipeline.board.notice(Notice {
                                channel_id,
                                text: "nothing played yet".to_owned(),
                                delete_after: Some(NOTICE_TTL),
                            });
                        }
                        Ok(items) => {
                            let mut lines = vec!["Recently played:".to_owned()];
                            lines.extend(items.iter().rev().enumerate().map(|(i, item)| {
                                format!(
                                    "{n}. {title}",
                                    n = i + 1,
                                    title = item.title.as_deref().unwrap_or(&item.url)
                                )
                            }));
                            pipeline.publish_transient(
                                format!("history-store-{guild_id}"),
                                channel_id,
                                vec![lines.join("\n")],
                            );
                        }
                        Err(err) => {
                            pipeline.board.notice(Notice {
                                channel_id,
                                text: err.info().to_owned(),
                                delete_after: Some(NOTICE_TTL),
                            });
                        }
                    }
                });
            }
            MusicAction::MoveMessages => self.forward_player_command(
                &context,
                PlayerCommand::MoveMessages {
                    channel_id: context.channel_id,
                },
            ),
            MusicAction::Playlist(playlist_action) => {
                self.handle_playlist_action(context, playlist_action)
            }
            MusicAction::RandomPlay(params) => {
                self.get_or_create_player(ctx, &context);
                let pipeline = self.pipeline();
                let origin = context.origin();
                let count = params.count.unwrap_or(DEFAULT_RANDOM_PLAY_COUNT);
                let cache_only = params.cache_only;
                actix_rt::spawn(async move {
                    let requests =
                        loops::random_play_requests(&pipeline, &origin, cache_only, count).await;
                    let display = if cache_only {
                        format!("{count} random cached tracks")
                    } else {
                        format!("{count} random tracks from history")
                    };
                    pipeline.preresolved_flow(origin, display, requests).await;
                });
            }
        }
    }
}

impl Handler<DeliverDownload> for MusicOrchestrator {
    type Result = ();

    fn handle(&mut self, msg: DeliverDownload, _ctx: &mut Self::Context) -> Self::Result {
        let download = msg.download;
        let pipeline = self.pipeline();
        let bundle_id = download.request.bundle_id;
        let request_id = download.request.id;
        let local_path = download.local_path.clone();

        let Some(handle) = self.players.get(&download.request.guild_id) else {
            // the player went away before delivery: administrative, not a
            // failure
            pipeline.update_row(bundle_id, request_id, RequestStage::Discarded, None);
            actix_rt::spawn(async move {
                let _ = tokio::fs::remove_file(local_path).await;
            });
            return;
        };

        let addr = handle.addr.clone();
        actix_rt::spawn(async move {
            let verdict = addr.send(crate::player::Deliver { download }).await;
            let (stage, reason, doomed) = match verdict {
                Ok(Ok(())) => (RequestStage::Completed, None, false),
                Ok(Err(DeliverError::QueueFull)) => (
                    RequestStage::Failed,
                    Some("play queue is full".to_owned()),
                    true,
                ),
                Ok(Err(DeliverError::TooLong)) => (
                    RequestStage::Failed,
                    Some("exceeds the length limit".to_owned()),
                    true,
                ),
                Ok(Err(DeliverError::ShuttingDown)) | Err(_) => {
                    (RequestStage::Discarded, None, true)
                }
            };
            pipeline.update_row(bundle_id, request_id, stage, reason);
            if doomed {
                let _ = tokio::fs::remove_file(local_path).await;
            }
        });
    }
}

impl Handler<PlayerEvent> for MusicOrchestrator {
    type Result = ();

    fn handle(&mut self, msg: PlayerEvent, _ctx: &mut Self::Context) -> Self::Result {
        match msg {
            PlayerEvent::Joined {
                guild_id,
                voice_channel_id,
            } => {
                if let Some(handle) = self.players.get_mut(&guild_id) {
                    handle.voice_channel_id = Some(voice_channel_id);
                }
            }
            PlayerEvent::Stopped { guild_id } => {
                self.players.remove(&guild_id);
            }
        }
    }
}

impl Handler<GetActivePlayers> for MusicOrchestrator {
    type Result = ActivePlayers;

    fn handle(&mut self, _msg: GetActivePlayers, _ctx: &mut Self::Context) -> Self::Result {
        ActivePlayers(
            self.players
                .iter()
                .map(|(guild_id, handle)| PlayerProbe {
                    guild_id: *guild_id,
                    voice_channel_id: handle.voice_channel_id,
                    addr: handle.addr.clone(),
                })
                .collect(),
        )
    }
}

impl Handler<ShutdownSystem> for MusicOrchestrator {
    type Result = ();

    fn handle(&mut self, _msg: ShutdownSystem, _ctx: &mut Self::Context) -> Self::Result {
        log::info!("shutdown requested; stopping loops and players");
        let _ = self.shutdown_tx.send(true);
        for handle in self.players.values() {
            handle.addr.do_send(ShutdownPlayer {
                reason: "shutting down".into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        media::MediaMetadata,
        resolver::VideoCatalog,
        tests_utils::{FakeVoice, RecordingChat},
    };
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    const GUILD: GuildId = 5;
    const TEXT_CHANNEL: ChannelId = 50;
    const VOICE_CHANNEL: ChannelId = 51;
    const USER: UserId = 52;
    const URL: &str = "https://www.youtube.com/watch?v=cached123";

    struct Rig {
        orchestrator: Addr<MusicOrchestrator>,
        chat: Arc<RecordingChat>,
        voice: Arc<FakeVoice>,
        cache: Arc<DownloadCache>,
        _dir: TempDir,
    }

    async fn rig() -> Rig {
        let dir = TempDir::new().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let config = Arc::new(Config {
            work_dir: dir.path().to_path_buf(),
            database_url: "sqlite::memory:".to_owned(),
            queues: Default::default(),
            backoff: Default::default(),
            cache: Default::default(),
            extractor: Default::default(),
            player: Default::default(),
            bundle: Default::default(),
            dispatch: Default::default(),
            history: Default::default(),
            catalog: Default::default(),
        });

        let chat = Arc::new(RecordingChat::default());
        chat.put_user_in_voice(GUILD, USER, VOICE_CHANNEL);
        let voice = Arc::new(FakeVoice::auto_finishing(Duration::from_millis(30)));

        let cache = Arc::new(DownloadCache::new(
            pool.clone(),
            config.cache.clone(),
            config.cache_dir(),
            config.guilds_dir(),
            None,
        ));
        let resolver = Arc::new(SearchResolver::new(
            VideoCatalog::new(reqwest::Client::new(), "test-key"),
            None,
        ));
        let downloader = Arc::new(Downloader::new(
            config.extractor.clone(),
            config.tmp_dir(),
        ));
        let history_store = Arc::new(HistoryStore::new(pool));

        let orchestrator = MusicOrchestrator::new(
            Arc::clone(&config),
            chat.clone(),
            voice.clone(),
            resolver,
            Arc::clone(&cache),
            downloader,
            history_store,
        )
        .start();

        Rig {
            orchestrator,
            chat,
            voice,
            cache,
            _dir: dir,
        }
    }

    fn context() -> CommandContext {
        CommandContext {
            guild_id: GUILD,
            channel_id: TEXT_CHANNEL,
            user_id: USER,
            user_display_name: "tester".into(),
        }
    }

    async fn seed_cache(rig: &Rig) {
        let scratch = rig._dir.path().join("seed.mp3");
        tokio::fs::write(&scratch, b"audio").await.unwrap();
        rig.cache
            .insert(
                URL,
                &scratch,
                &MediaMetadata {
                    title: Some("Cached Song".to_owned()),
                    uploader: Some("Someone".to_owned()),
                    duration_s: Some(90),
                },
            )
            .await
            .unwrap();
    }

    #[actix_rt::test]
    async fn test_play_cached_url_end_to_end() {
        let rig = rig().await;
        seed_cache(&rig).await;

        rig.orchestrator.do_send(MusicCommand {
            context: context(),
            action: MusicAction::Play(PlayParams {
                query: URL.to_owned(),
            }),
        });

        // join + resolve + cache hit + deliver + playback, no extractor
        actix_rt::time::sleep(Duration::from_millis(400)).await;

        let connection = rig.voice.connection(0).expect("player joined voice");
        assert_eq!(connection.played().len(), 1);

        // the bundle finished and the dispatcher pushed the summary
        let texts = rig.chat.texts_in(TEXT_CHANNEL).join("\n");
        assert!(
            texts.contains("Completed processing"),
            "missing summary in: {texts}"
        );
    }

    #[actix_rt::test]
    async fn test_play_same_url_twice_uses_distinct_per_use_paths() {
        let rig = rig().await;
        seed_cache(&rig).await;

        for _ in 0..2 {
            rig.orchestrator.do_send(MusicCommand {
                context: context(),
                action: MusicAction::Play(PlayParams {
                    query: URL.to_owned(),
                }),
            });
        }
        actix_rt::time::sleep(Duration::from_millis(500)).await;

        let connection = rig.voice.connection(0).expect("player joined voice");
        let played = connection.played();
        assert_eq!(played.len(), 2);
        assert_ne!(played[0], played[1], "per-use paths must be distinct");
    }

    #[actix_rt::test]
    async fn test_terminal_sentinel_short_circuits_to_failed() {
        let rig = rig().await;
        rig.cache
            .record_terminal_failure(URL, "age_restricted")
            .await
            .unwrap();

        rig.orchestrator.do_send(MusicCommand {
            context: context(),
            action: MusicAction::Play(PlayParams {
                query: URL.to_owned(),
            }),
        });
        actix_rt::time::sleep(Duration::from_millis(400)).await;

        let texts = rig.chat.texts_in(TEXT_CHANNEL).join("\n");
        assert!(
            texts.contains("age_restricted") || texts.contains("1 failed"),
            "terminal failure not surfaced: {texts}"
        );

        // no playback happened
        if let Some(connection) = rig.voice.connection(0) {
            assert!(connection.played().is_empty());
        }
    }

    #[actix_rt::test]
    async fn test_retry_budget_exhaustion_fails_the_row_once() {
        let dir = TempDir::new().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        // zero base wait and a broken extractor: every attempt fails
        // retryably and instantly
        let config = Arc::new(Config {
            work_dir: dir.path().to_path_buf(),
            database_url: "sqlite::memory:".to_owned(),
            backoff: crate::config::BackoffConfig {
                base_wait_s: 0,
                ..Default::default()
            },
            extractor: crate::config::ExtractorConfig {
                binary_path: Some(dir.path().join("no-such-extractor")),
                download_retries: 2,
                ..Default::default()
            },
            queues: Default::default(),
            cache: Default::default(),
            player: Default::default(),
            bundle: Default::default(),
            dispatch: Default::default(),
            history: Default::default(),
            catalog: Default::default(),
        });

        let chat = Arc::new(RecordingChat::default());
        chat.put_user_in_voice(GUILD, USER, VOICE_CHANNEL);
        let voice = Arc::new(FakeVoice::default());
        let cache = Arc::new(DownloadCache::new(
            pool.clone(),
            config.cache.clone(),
            config.cache_dir(),
            config.guilds_dir(),
            None,
        ));
        let resolver = Arc::new(SearchResolver::new(
            VideoCatalog::new(reqwest::Client::new(), "test-key"),
            None,
        ));
        let downloader = Arc::new(Downloader::new(config.extractor.clone(), config.tmp_dir()));
        let history_store = Arc::new(HistoryStore::new(pool));

        let orchestrator = MusicOrchestrator::new(
            Arc::clone(&config),
            chat.clone(),
            voice,
            resolver,
            cache,
            downloader,
            history_store,
        )
        .start();

        orchestrator.do_send(MusicCommand {
            context: context(),
            action: MusicAction::Play(PlayParams {
                query: URL.to_owned(),
            }),
        });

        // initial attempt + 2 retries, all with zero backoff
        actix_rt::time::sleep(Duration::from_millis(600)).await;

        let texts = chat.texts_in(TEXT_CHANNEL).join("\n");
        assert!(
            texts.contains("1 failed"),
            "retry exhaustion not surfaced: {texts}"
        );
    }

    #[actix_rt::test]
    async fn test_stop_command_disconnects_player() {
        let rig = rig().await;
        seed_cache(&rig).await;

        rig.orchestrator.do_send(MusicCommand {
            context: context(),
            action: MusicAction::Play(PlayParams {
                query: URL.to_owned(),
            }),
        });
        actix_rt::time::sleep(Duration::from_millis(300)).await;

        rig.orchestrator.do_send(MusicCommand {
            context: context(),
            action: MusicAction::Stop,
        });
        actix_rt::time::sleep(Duration::from_millis(200)).await;

        let connection = rig.voice.connection(0).expect("player joined voice");
        assert!(connection.is_closed());

        let probes = rig.orchestrator.send(GetActivePlayers).await.unwrap();
        assert!(probes.0.is_empty());
    }
}
