use std::{path::PathBuf, sync::Arc, time::Duration};

use actix::Actor;
use anyhow::Context as AnyhowContext;
use clap::Parser;
use log::LevelFilter;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use guild_audio_server::{
    cache::{DirObjectStore, DownloadCache, ObjectStore},
    config::Config,
    extractor::Downloader,
    fake_chat::{ConsoleChat, ConsoleVoice},
    history::HistoryStore,
    orchestrator::{MusicOrchestrator, ShutdownSystem},
    resolver::{SearchResolver, StreamingCatalog, VideoCatalog},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(about = "Multi-tenant music playback and request orchestration service")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    match &args.log_file {
        Some(path) => simple_logging::log_to_file(path, LevelFilter::Info)
            .with_context(|| format!("failed to open log file {}", path.display()))?,
        None => simple_logging::log_to_stderr(LevelFilter::Info),
    }

    let config = Arc::new(Config::load(&args.config)?);

    for dir in [
        config.work_dir.clone(),
        config.cache_dir(),
        config.guilds_dir(),
        config.tmp_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(
                    config
                        .database_url
                        .strip_prefix("sqlite://")
                        .unwrap_or(&config.database_url),
                )
                .create_if_missing(true),
        )
        .await
        .context("failed to open the database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let http = reqwest::Client::new();

    let video_api_key = std::env::var(&config.catalog.video_api_key_env).unwrap_or_else(|_| {
        log::error!(
            "env var '{var}' is unset; catalog lookups will fail",
            var = config.catalog.video_api_key_env
        );
        String::new()
    });
    let video_catalog = VideoCatalog::new(http.clone(), video_api_key);

    let streaming_catalog = match (
        std::env::var(&config.catalog.streaming_client_id_env),
        std::env::var(&config.catalog.streaming_client_secret_env),
    ) {
        (Ok(client_id), Ok(client_secret)) => {
            Some(StreamingCatalog::new(http, client_id, client_secret))
        }
        _ => {
            log::info!("streaming credentials unset; streaming catalog disabled");
            None
        }
    };
    let resolver = Arc::new(SearchResolver::new(video_catalog, streaming_catalog));

    let backup_store: Option<Arc<dyn ObjectStore>> =
        config.cache.backup_bucket.as_ref().map(|bucket| {
            Arc::new(DirObjectStore::new(PathBuf::from(bucket))) as Arc<dyn ObjectStore>
        });

    let cache = Arc::new(DownloadCache::new(
        pool.clone(),
        config.cache.clone(),
        config.cache_dir(),
        config.guilds_dir(),
        backup_store,
    ));
    let downloader = Arc::new(Downloader::new(config.extractor.clone(), config.tmp_dir()));
    let history_store = Arc::new(HistoryStore::new(pool));

    let chat = Arc::new(ConsoleChat::default());
    let voice = Arc::new(ConsoleVoice);

    let orchestrator = MusicOrchestrator::new(
        config,
        chat,
        voice,
        resolver,
        cache,
        downloader,
        history_store,
    )
    .start();

    log::info!("guild-audio-server is up; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    log::info!("shutting down");
    orchestrator
        .send(ShutdownSystem)
        .await
        .context("orchestrator unreachable during shutdown")?;
    actix_rt::time::sleep(SHUTDOWN_GRACE).await;

    Ok(())
}
