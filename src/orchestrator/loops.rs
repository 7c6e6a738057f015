use std::{sync::Arc, time::Duration};

use actix::Addr;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    backoff::FailureBackoffTracker,
    bundle::{BundleRegistry, ProgressBundle},
    cache::{CacheLookup, CachedMedia, DownloadCache},
    chat::{ChannelId, ChatClient},
    config::Config,
    dispatch::DispatchBoard,
    extractor::{DownloadError, Downloader},
    history::HistoryStore,
    media::{MediaDownload, MediaRequest, RequestOrigin, RequestStage, SearchKind},
    queues::DistributedQueue,
    resolver::SearchResolver,
};

use super::{DeliverDownload, GetActivePlayers, MusicOrchestrator};

const PLAYER_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const BACKUP_BATCH: i64 = 20;
pub const TRANSIENT_PAGES_TTL: Duration = Duration::from_secs(120);

/// Shared dependency bundle of the orchestrator's command flows and
/// background loops. Everything here is cheaply cloneable and owned
/// nowhere else.
pub struct Pipeline {
    pub orchestrator: Addr<MusicOrchestrator>,
    pub config: Arc<Config>,
    pub chat: Arc<dyn ChatClient>,
    pub resolver: Arc<SearchResolver>,
    pub cache: Arc<DownloadCache>,
    pub downloader: Arc<Downloader>,
    pub board: Arc<DispatchBoard>,
    pub bundles: Arc<BundleRegistry>,
    pub history_store: Arc<HistoryStore>,
    pub search_queue: DistributedQueue<MediaRequest>,
    pub download_queue: DistributedQueue<MediaRequest>,
    pub heartbeats: Arc<crate::health::Heartbeats>,
}

impl Pipeline {
    /// Applies one stage transition to the request's bundle row and
    /// republishes the rendered pages. Requests without a bundle (none
    /// currently exist) are a no-op.
    pub fn update_row(
        &self,
        bundle_id: Option<Uuid>,
        request_id: Uuid,
        stage: RequestStage,
        reason: Option<String>,
    ) {
        let Some(bundle_id) = bundle_id else { return };
        let Some(bundle) = self.bundles.get(bundle_id) else {
            return;
        };

        let mut bundle = bundle.lock().expect("bundle lock poisoned");
        let outcome = bundle.update(request_id, stage, reason);
        if outcome.changed || outcome.finished_now {
            self.board.publish(&bundle.board_key(), bundle.render());
        }
        let finished = outcome.finished_now;
        drop(bundle);
        if finished {
            self.bundles.mark_finished(bundle_id);
        }
    }

    /// The full play-command flow: progress bundle up first, catalog
    /// resolution, frozen rows, then per-request routing.
    pub async fn play_flow(&self, origin: RequestOrigin, query: String) {
        let bundle = ProgressBundle::new(
            origin.guild_id,
            origin.channel_id,
            query.clone(),
            self.config.bundle.page_char_limit,
        );
        let bundle_id = bundle.id;
        let key = bundle.board_key();
        self.board.register(key.as_str(), origin.channel_id, false);
        let bundle = self.bundles.insert(bundle);
        self.publish_bundle(&bundle);

        let resolved = match self.resolver.resolve_play(&origin, &query).await {
            Ok(resolved) if resolved.requests.is_empty() => Err("nothing found".to_owned()),
            Ok(resolved) => Ok(resolved),
            Err(err) => Err(err.info().to_owned()),
        };

        let requests = match resolved {
            Err(reason) => {
                let mut locked = bundle.lock().expect("bundle lock poisoned");
                locked.set_error(reason);
                self.board.publish(&locked.board_key(), locked.render());
                drop(locked);
                self.bundles.mark_finished(bundle_id);
                return;
            }
            Ok(mut resolved) => {
                let mut locked = bundle.lock().expect("bundle lock poisoned");
                locked.set_input(&resolved.display);
                for request in &mut resolved.requests {
                    request.bundle_id = Some(bundle_id);
                    let initial = if request.kind.needs_search() {
                        RequestStage::Searching
                    } else {
                        RequestStage::Queued
                    };
                    locked.add_request(request, initial);
                }
                locked.freeze();
                self.board.publish(&locked.board_key(), locked.render());
                resolved.requests
            }
        };

        for request in requests {
            self.route_request(request).await;
        }
    }

    /// Bundle flow for pre-resolved URL lists (playlist queueing,
    /// random-play).
    pub async fn preresolved_flow(
        &self,
        origin: RequestOrigin,
        display: String,
        mut requests: Vec<MediaRequest>,
    ) {
        if requests.is_empty() {
            self.board.notice(crate::dispatch::Notice {
                channel_id: origin.channel_id,
                text: format!("'{display}' has nothing to queue"),
                delete_after: Some(Duration::from_secs(60)),
            });
            return;
        }

        let bundle = ProgressBundle::new(
            origin.guild_id,
            origin.channel_id,
            display,
            self.config.bundle.page_char_limit,
        );
        let bundle_id = bundle.id;
        self.board.register(bundle.board_key(), origin.channel_id, false);
        let bundle = self.bundles.insert(bundle);

        {
            let mut locked = bundle.lock().expect("bundle lock poisoned");
            for request in &mut requests {
                request.bundle_id = Some(bundle_id);
                let initial = if request.kind.needs_search() {
                    RequestStage::Searching
                } else {
                    RequestStage::Queued
                };
                locked.add_request(request, initial);
            }
            locked.freeze();
            self.board.publish(&locked.board_key(), locked.render());
        }

        for request in requests {
            self.route_request(request).await;
        }
    }

    fn publish_bundle(&self, bundle: &std::sync::Mutex<ProgressBundle>) {
        let locked = bundle.lock().expect("bundle lock poisoned");
        self.board.publish(&locked.board_key(), locked.render());
    }

    /// First routing decision for a request: search stage for free text
    /// and streaming tracks, cache/download for everything already
    /// carrying a canonical URL.
    pub async fn route_request(&self, request: MediaRequest) {
        if request.kind.needs_search() && !request.is_resolved() {
            let bundle_id = request.bundle_id;
            let request_id = request.id;
            let guild_id = request.guild_id;
            if let Err(err) = self.search_queue.put(guild_id, request) {
                log::error!("search queue rejected request, ERROR: {err}");
                self.update_row(
                    bundle_id,
                    request_id,
                    RequestStage::Failed,
                    Some("search queue is full".to_owned()),
                );
            }
            return;
        }

        self.route_resolved(request).await;
    }

    /// Routing once a canonical URL exists: serve from cache, fail fast
    /// on a terminal sentinel, or queue the download.
    pub async fn route_resolved(&self, request: MediaRequest) {
        let url = request.resolved_search.to_string();

        match self.cache.lookup(&url).await {
            Ok(CacheLookup::Hit(media)) => {
                self.deliver_from_cache(request, media).await;
            }
            Ok(CacheLookup::TerminalFailure(kind)) => {
                self.update_row(
                    request.bundle_id,
                    request.id,
                    RequestStage::Failed,
                    Some(kind),
                );
            }
            Ok(CacheLookup::Miss) | Err(_) => {
                let bundle_id = request.bundle_id;
                let request_id = request.id;
                let guild_id = request.guild_id;
                if let Err(err) = self.download_queue.put(guild_id, request) {
                    log::error!("download queue rejected request, ERROR: {err}");
                    self.update_row(
                        bundle_id,
                        request_id,
                        RequestStage::Failed,
                        Some("download queue is full".to_owned()),
                    );
                } else {
                    self.update_row(bundle_id, request_id, RequestStage::Queued, None);
                }
            }
        }
    }

    async fn deliver_from_cache(&self, request: MediaRequest, media: CachedMedia) {
        self.cache.retain(&media.url);
        let link = self
            .cache
            .link_for_use(request.guild_id, &media.source_path)
            .await;
        self.cache.release(&media.url);

        match link {
            Ok(local_path) => {
                if let Some(playlist) = request.save_to_playlist.clone() {
                    let _ = tokio::fs::remove_file(&local_path).await;
                    self.save_to_playlist(&request, &media.url, media.metadata.title.as_deref(), &playlist)
                        .await;
                    return;
                }

                let download = MediaDownload {
                    url: media.url.clone().into(),
                    source_path: media.source_path,
                    local_path,
                    metadata: media.metadata,
                    cache_hit: true,
                    created_at: chrono::Utc::now(),
                    request,
                };
                self.orchestrator.do_send(DeliverDownload { download });
            }
            Err(err) => {
                self.update_row(
                    request.bundle_id,
                    request.id,
                    RequestStage::Failed,
                    Some(format!("file error: {}", err.info())),
                );
            }
        }
    }

    pub async fn save_to_playlist(
        &self,
        request: &MediaRequest,
        url: &str,
        title: Option<&str>,
        playlist: &str,
    ) {
        match self
            .history_store
            .add_playlist_item(request.guild_id, playlist, url, title)
            .await
        {
            Ok(()) => {
                self.update_row(request.bundle_id, request.id, RequestStage::Completed, None);
            }
            Err(err) => {
                self.update_row(
                    request.bundle_id,
                    request.id,
                    RequestStage::Failed,
                    Some(err.info().to_owned()),
                );
            }
        }
    }

    /// Registers, publishes, and later retires a short-lived read-only
    /// bundle (history listings, playlist listings).
    pub fn publish_transient(&self, key: String, channel_id: ChannelId, pages: Vec<String>) {
        self.board.register(key.as_str(), channel_id, false);
        self.board.publish(&key, pages);

        let board = Arc::clone(&self.board);
        actix_rt::spawn(async move {
            actix_rt::time::sleep(TRANSIENT_PAGES_TTL).await;
            board.retire(&key);
        });
    }
}

/// Drains the search queue: memoized or live free-text resolution to a
/// canonical URL, then on to the download routing.
pub async fn run_search_loop(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    log::info!("search loop started");

    loop {
        pipeline.heartbeats.beat("search");

        let (_guild_id, mut request) = tokio::select! {
            _ = shutdown.changed() => break,
            item = pipeline.search_queue.get() => item,
        };

        let query = request.raw_search.to_string();
        let memoized = pipeline.cache.search_lookup(&query).await.unwrap_or(None);

        let url = match memoized {
            Some(url) => Some(url),
            None => match pipeline.resolver.canonical_video_url(&query).await {
                Ok(Some(url)) => {
                    if let Err(err) = pipeline.cache.search_insert(&query, &url).await {
                        log::error!("failed to memoize search, ERROR: {err}");
                    }
                    Some(url)
                }
                Ok(None) => None,
                Err(err) => {
                    pipeline.update_row(
                        request.bundle_id,
                        request.id,
                        RequestStage::Failed,
                        Some(format!("search failed: {}", err.info())),
                    );
                    continue;
                }
            },
        };

        match url {
            Some(url) => {
                request.resolved_search = url.into();
                pipeline.route_resolved(request).await;
            }
            None => {
                pipeline.update_row(
                    request.bundle_id,
                    request.id,
                    RequestStage::Failed,
                    Some("no results".to_owned()),
                );
            }
        }
    }

    for (_guild_id, request) in pipeline.search_queue.drain_all() {
        pipeline.update_row(request.bundle_id, request.id, RequestStage::Discarded, None);
    }
    log::info!("search loop stopped");
}

/// Drains the download queue one request at a time: adaptive backoff
/// wait, cache recheck, extraction, then delivery or retry bookkeeping.
pub async fn run_download_loop(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    log::info!("download loop started");

    let backoff_config = &pipeline.config.backoff;
    let base_wait = Duration::from_secs(backoff_config.base_wait_s);
    let mut tracker = FailureBackoffTracker::new(
        backoff_config.max_size,
        Duration::from_secs(backoff_config.max_age_s),
    );

    loop {
        pipeline.heartbeats.beat("download");

        let (guild_id, mut request) = tokio::select! {
            _ = shutdown.changed() => break,
            item = pipeline.download_queue.get() => item,
        };

        let wait = tracker.wait_for(base_wait);
        pipeline.update_row(request.bundle_id, request.id, RequestStage::Backoff, None);
        let cancelled = tokio::select! {
            _ = shutdown.changed() => true,
            _ = tokio::time::sleep(wait) => false,
        };
        if cancelled {
            pipeline.update_row(request.bundle_id, request.id, RequestStage::Discarded, None);
            break;
        }

        pipeline.update_row(request.bundle_id, request.id, RequestStage::InProgress, None);
        let url = request.resolved_search.to_string();

        // another request may have populated the cache in the meantime
        match pipeline.cache.lookup(&url).await {
            Ok(CacheLookup::Hit(media)) => {
                pipeline.deliver_from_cache(request, media).await;
                continue;
            }
            Ok(CacheLookup::TerminalFailure(kind)) => {
                pipeline.update_row(
                    request.bundle_id,
                    request.id,
                    RequestStage::Failed,
                    Some(kind),
                );
                continue;
            }
            Ok(CacheLookup::Miss) | Err(_) => {}
        }

        match pipeline.downloader.download(&url).await {
            Ok(extracted) => {
                tracker.record_success();
                finish_download(&pipeline, request, &url, extracted).await;
            }
            Err(err) if err.is_retryable() => {
                tracker.record_failure();
                retry_or_fail(&pipeline, guild_id, request, &err).await;
            }
            Err(err) => {
                if let DownloadError::Terminal { kind, .. } = &err {
                    if let Err(db_err) = pipeline
                        .cache
                        .record_terminal_failure(&url, kind.as_str())
                        .await
                    {
                        log::error!("failed to record terminal sentinel, ERROR: {db_err}");
                    }
                }
                pipeline.update_row(
                    request.bundle_id,
                    request.id,
                    RequestStage::Failed,
                    Some(err.user_reason()),
                );
            }
        }
    }

    for (_guild_id, request) in pipeline.download_queue.drain_all() {
        pipeline.update_row(request.bundle_id, request.id, RequestStage::Discarded, None);
    }
    log::info!("download loop stopped");
}

async fn finish_download(
    pipeline: &Pipeline,
    request: MediaRequest,
    url: &str,
    extracted: crate::extractor::ExtractedAudio,
) {
    let source_path = match pipeline
        .cache
        .insert(url, &extracted.path, &extracted.metadata)
        .await
    {
        Ok(path) => path,
        Err(err) => {
            pipeline.update_row(
                request.bundle_id,
                request.id,
                RequestStage::Failed,
                Some(format!("file error: {}", err.info())),
            );
            return;
        }
    };

    if let Some(playlist) = request.save_to_playlist.clone() {
        pipeline
            .save_to_playlist(&request, url, extracted.metadata.title.as_deref(), &playlist)
            .await;
        return;
    }

    pipeline.cache.retain(url);
    let link = pipeline
        .cache
        .link_for_use(request.guild_id, &source_path)
        .await;
    pipeline.cache.release(url);

    match link {
        Ok(local_path) => {
            let download = MediaDownload {
                url: url.to_owned().into(),
                source_path,
                local_path,
                metadata: extracted.metadata,
                cache_hit: false,
                created_at: chrono::Utc::now(),
                request,
            };
            pipeline.orchestrator.do_send(DeliverDownload { download });
        }
        Err(err) => {
            pipeline.update_row(
                request.bundle_id,
                request.id,
                RequestStage::Failed,
                Some(format!("file error: {}", err.info())),
            );
        }
    }
}

async fn retry_or_fail(
    pipeline: &Pipeline,
    guild_id: crate::chat::GuildId,
    mut request: MediaRequest,
    err: &DownloadError,
) {
    let retries = pipeline.config.extractor.download_retries;
    if request.retry_count >= retries {
        pipeline.update_row(
            request.bundle_id,
            request.id,
            RequestStage::Failed,
            Some(format!("{} (retries exhausted)", err.user_reason())),
        );
        return;
    }

    request.retry_count += 1;
    let bundle_id = request.bundle_id;
    let request_id = request.id;
    let attempt = request.retry_count;
    // requeued at the tail; the frozen row keeps its display position
    if pipeline.download_queue.put(guild_id, request).is_err() {
        pipeline.update_row(
            bundle_id,
            request_id,
            RequestStage::Failed,
            Some("download queue is full".to_owned()),
        );
        return;
    }
    pipeline.update_row(
        bundle_id,
        request_id,
        RequestStage::Queued,
        Some(format!("will retry ({attempt}/{retries})")),
    );
}

/// Sweeps players for empty voice channels and retires bundles whose
/// finished state has outlasted the grace period.
pub async fn run_player_cleanup(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    log::info!("player cleanup loop started");
    let grace = Duration::from_secs(pipeline.config.bundle.finished_grace_s);

    loop {
        pipeline.heartbeats.beat("cleanup-players");

        let stopped = tokio::select! {
            _ = shutdown.changed() => true,
            _ = tokio::time::sleep(PLAYER_SWEEP_INTERVAL) => false,
        };
        if stopped {
            break;
        }

        let probes = match pipeline.orchestrator.send(GetActivePlayers).await {
            Ok(probes) => probes.0,
            Err(err) => {
                log::error!("failed to list players, ERROR: {err}");
                continue;
            }
        };

        for probe in probes {
            let Some(voice_channel_id) = probe.voice_channel_id else {
                continue;
            };
            match pipeline
                .chat
                .voice_member_count(probe.guild_id, voice_channel_id)
                .await
            {
                Ok(human_count) => {
                    probe
                        .addr
                        .do_send(crate::player::OccupancyReport { human_count });
                }
                Err(err) => {
                    log::error!(
                        "failed to count voice members, GUILD: {guild}, ERROR: {err}",
                        guild = probe.guild_id
                    );
                }
            }
        }

        for key in pipeline.bundles.sweep_finished(grace) {
            pipeline.board.retire(&key);
        }
    }

    log::info!("player cleanup loop stopped");
}

/// LRU marking, safe collection/deletion, search-table cap, then the
/// backup sweep.
pub async fn run_cache_cleanup(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    log::info!("cache cleanup loop started");

    loop {
        pipeline.heartbeats.beat("cache-cleanup");

        let stopped = tokio::select! {
            _ = shutdown.changed() => true,
            _ = tokio::time::sleep(CACHE_SWEEP_INTERVAL) => false,
        };
        if stopped {
            break;
        }

        match pipeline.cache.mark_lru_for_delete().await {
            Ok(marked) if marked > 0 => log::info!("marked {marked} cache entries for delete"),
            Ok(_) => {}
            Err(err) => log::error!("cache LRU mark failed, ERROR: {err}"),
        }

        match pipeline.cache.collect_deletable().await {
            Ok(rows) => {
                for row in rows {
                    if let Err(err) = pipeline.cache.purge(&row).await {
                        log::error!("cache purge failed, URL: {url}, ERROR: {err}", url = row.url);
                    }
                }
            }
            Err(err) => log::error!("cache collect failed, ERROR: {err}"),
        }

        if let Err(err) = pipeline.cache.enforce_search_cap().await {
            log::error!("search cap enforcement failed, ERROR: {err}");
        }

        match pipeline.cache.backup_sweep(BACKUP_BATCH).await {
            Ok(uploaded) if uploaded > 0 => log::info!("backed up {uploaded} cache entries"),
            Ok(_) => {}
            Err(err) => log::error!("backup sweep failed, ERROR: {err}"),
        }
    }

    log::info!("cache cleanup loop stopped");
}

/// Builds the request list for `random-play`.
pub async fn random_play_requests(
    pipeline: &Pipeline,
    origin: &RequestOrigin,
    cache_only: bool,
    count: usize,
) -> Vec<MediaRequest> {
    if cache_only {
        match pipeline.cache.random_cached(count).await {
            Ok(media) => media
                .into_iter()
                .map(|m| {
                    let mut request = origin.media_request(m.url, SearchKind::VideoUrl);
                    request.from_history = true;
                    request
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    } else {
        match pipeline
            .history_store
            .random_history(origin.guild_id, count)
            .await
        {
            Ok(items) => items
                .into_iter()
                .map(|item| {
                    let mut request = origin.media_request(item.url, SearchKind::VideoUrl);
                    request.from_history = true;
                    request.history_item_id = Some(item.id);
                    request
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
