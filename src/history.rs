use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{prelude::FromRow, SqlitePool};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::{
    chat::GuildId,
    config::HistoryConfig,
    error::{AppError, AppErrorKind, IntoAppError},
    health::Heartbeats,
};

/// Reserved name of the per-guild history playlist; user playlists get a
/// different `kind`, so the name cannot collide.
pub const HISTORY_PLAYLIST_NAME: &str = "__history__";

pub const KIND_USER: &str = "user";
pub const KIND_HISTORY: &str = "history";

/// One finished playback, queued for the history writer.
#[derive(Debug, Clone)]
pub struct HistoryItem {
    pub guild_id: GuildId,
    pub url: String,
    pub title: Option<String>,
    pub duration_s: Option<i64>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct PlaylistRow {
    pub id: String,
    pub guild_id: i64,
    pub name: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PlaylistItemRow {
    pub id: i64,
    pub playlist_id: String,
    pub url: String,
    pub title: Option<String>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromRow)]
pub struct GuildAnalytics {
    pub total_plays: i64,
    pub total_duration_s: i64,
    pub cached_plays: i64,
}

/// Persistent store behind the history writer and the `playlist` command
/// family: per-guild analytics counters, the bounded history playlist,
/// and user playlists.
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Applies one finished playback: bumps the analytics counters,
    /// appends to the history playlist, and evicts the oldest items past
    /// `history_max_items`.
    pub async fn record_play(
        &self,
        item: &HistoryItem,
        history_max_items: usize,
    ) -> Result<(), AppError> {
        let guild_id = item.guild_id as i64;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO guild_analytics
                (guild_id, total_plays, total_duration_s, cached_plays, updated_at)
            VALUES (?1, 1, ?2, ?3, ?4)
            ON CONFLICT (guild_id) DO UPDATE SET
                total_plays = total_plays + 1,
                total_duration_s = total_duration_s + excluded.total_duration_s,
                cached_plays = cached_plays + excluded.cached_plays,
                updated_at = excluded.updated_at",
        )
        .bind(guild_id)
        .bind(item.duration_s.unwrap_or(0))
        .bind(i64::from(item.cache_hit))
        .bind(now)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to update guild analytics",
            AppErrorKind::Database,
            &[&format!("GUILD: {guild_id}")],
        )?;

        let playlist_id = self.ensure_history_playlist(item.guild_id).await?;

        sqlx::query(
            "INSERT INTO playlist_item (playlist_id, url, title, added_at)
            VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&playlist_id)
        .bind(&item.url)
        .bind(&item.title)
        .bind(now)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to append history item",
            AppErrorKind::Database,
            &[&format!("GUILD: {guild_id}")],
        )?;

        sqlx::query(
            "DELETE FROM playlist_item
            WHERE playlist_id = ?1 AND id NOT IN (
                SELECT id FROM playlist_item
                WHERE playlist_id = ?1
                ORDER BY added_at DESC, id DESC
                LIMIT ?2
            )",
        )
        .bind(&playlist_id)
        .bind(history_max_items as i64)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to trim history playlist",
            AppErrorKind::Database,
            &[&format!("GUILD: {guild_id}")],
        )
    }

    async fn ensure_history_playlist(&self, guild_id: GuildId) -> Result<String, AppError> {
        if let Some(row) = self.find_playlist(guild_id, KIND_HISTORY, None).await? {
            return Ok(row.id);
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO playlist (id, guild_id, name, kind, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT DO NOTHING",
        )
        .bind(&id)
        .bind(guild_id as i64)
        .bind(HISTORY_PLAYLIST_NAME)
        .bind(KIND_HISTORY)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to create history playlist",
            AppErrorKind::Database,
            &[&format!("GUILD: {guild_id}")],
        )?;

        let row = self
            .find_playlist(guild_id, KIND_HISTORY, None)
            .await?
            .ok_or_else(|| {
                AppError::new(
                    AppErrorKind::Database,
                    "history playlist vanished after insert",
                    &[&format!("GUILD: {guild_id}")],
                )
            })?;
        Ok(row.id)
    }

    async fn find_playlist(
        &self,
        guild_id: GuildId,
        kind: &str,
        name: Option<&str>,
    ) -> Result<Option<PlaylistRow>, AppError> {
        let result = match name {
            Some(name) => {
                sqlx::query_as::<_, PlaylistRow>(
                    "SELECT * FROM playlist WHERE guild_id = ?1 AND kind = ?2 AND name = ?3",
                )
                .bind(guild_id as i64)
                .bind(kind)
                .bind(name)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, PlaylistRow>(
                    "SELECT * FROM playlist WHERE guild_id = ?1 AND kind = ?2",
                )
                .bind(guild_id as i64)
                .bind(kind)
                .fetch_optional(&self.pool)
                .await
            }
        };

        result.into_app_err(
            "failed to find playlist",
            AppErrorKind::Database,
            &[&format!("GUILD: {guild_id}"), &format!("KIND: {kind}")],
        )
    }

    pub async fn create_playlist(&self, guild_id: GuildId, name: &str) -> Result<(), AppError> {
        if self
            .find_playlist(guild_id, KIND_USER, Some(name))
            .await?
            .is_some()
        {
            return Err(AppError::new(
                AppErrorKind::Database,
                format!("playlist '{name}' already exists"),
                &[&format!("GUILD: {guild_id}")],
            ));
        }

        sqlx::query(
            "INSERT INTO playlist (id, guild_id, name, kind, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(guild_id as i64)
        .bind(name)
        .bind(KIND_USER)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to create playlist",
            AppErrorKind::Database,
            &[&format!("GUILD: {guild_id}"), &format!("NAME: {name}")],
        )
    }

    pub async fn list_playlists(&self, guild_id: GuildId) -> Result<Vec<PlaylistRow>, AppError> {
        sqlx::query_as::<_, PlaylistRow>(
            "SELECT * FROM playlist WHERE guild_id = ?1 AND kind = ?2 ORDER BY name",
        )
        .bind(guild_id as i64)
        .bind(KIND_USER)
        .fetch_all(&self.pool)
        .await
        .into_app_err(
            "failed to list playlists",
            AppErrorKind::Database,
            &[&format!("GUILD: {guild_id}")],
        )
    }

    fn user_playlist_required(
        row: Option<PlaylistRow>,
        name: &str,
    ) -> Result<PlaylistRow, AppError> {
        row.ok_or_else(|| {
            AppError::new(
                AppErrorKind::Database,
                format!("no playlist named '{name}'"),
                &[],
            )
        })
    }

    pub async fn playlist_items(
        &self,
        guild_id: GuildId,
        name: &str,
    ) -> Result<Vec<PlaylistItemRow>, AppError> {
        let playlist = Self::user_playlist_required(
            self.find_playlist(guild_id, KIND_USER, Some(name)).await?,
            name,
        )?;
        self.items_of(&playlist.id).await
    }

    pub async fn history_items(&self, guild_id: GuildId) -> Result<Vec<PlaylistItemRow>, AppError> {
        match self.find_playlist(guild_id, KIND_HISTORY, None).await? {
            Some(playlist) => self.items_of(&playlist.id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn items_of(&self, playlist_id: &str) -> Result<Vec<PlaylistItemRow>, AppError> {
        sqlx::query_as::<_, PlaylistItemRow>(
            "SELECT * FROM playlist_item
            WHERE playlist_id = ?1
            ORDER BY added_at ASC, id ASC",
        )
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await
        .into_app_err(
            "failed to list playlist items",
            AppErrorKind::Database,
            &[&format!("PLAYLIST: {playlist_id}")],
        )
    }

    pub async fn add_playlist_item(
        &self,
        guild_id: GuildId,
        name: &str,
        url: &str,
        title: Option<&str>,
    ) -> Result<(), AppError> {
        let playlist = Self::user_playlist_required(
            self.find_playlist(guild_id, KIND_USER, Some(name)).await?,
            name,
        )?;

        sqlx::query(
            "INSERT INTO playlist_item (playlist_id, url, title, added_at)
            VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&playlist.id)
        .bind(url)
        .bind(title)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to add playlist item",
            AppErrorKind::Database,
            &[&format!("NAME: {name}"), &format!("URL: {url}")],
        )
    }

    /// Removes the n-th item (0-based, in display order) of a *user*
    /// playlist. The history playlist is append-only and rejects this.
    pub async fn remove_playlist_item(
        &self,
        guild_id: GuildId,
        name: &str,
        index: usize,
    ) -> Result<(), AppError> {
        if name == HISTORY_PLAYLIST_NAME {
            return Err(AppError::new(
                AppErrorKind::Database,
                "the history playlist cannot be edited",
                &[],
            ));
        }

        let items = self.playlist_items(guild_id, name).await?;
        let Some(item) = items.get(index) else {
            return Err(AppError::new(
                AppErrorKind::Database,
                format!("no item at position {index} in '{name}'"),
                &[],
            ));
        };

        sqlx::query("DELETE FROM playlist_item WHERE id = ?1")
            .bind(item.id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .into_app_err(
                "failed to remove playlist item",
                AppErrorKind::Database,
                &[&format!("NAME: {name}"), &format!("INDEX: {index}")],
            )
    }

    pub async fn delete_playlist(&self, guild_id: GuildId, name: &str) -> Result<(), AppError> {
        let playlist = Self::user_playlist_required(
            self.find_playlist(guild_id, KIND_USER, Some(name)).await?,
            name,
        )?;

        sqlx::query("DELETE FROM playlist_item WHERE playlist_id = ?1")
            .bind(&playlist.id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .into_app_err(
                "failed to delete playlist items",
                AppErrorKind::Database,
                &[&format!("NAME: {name}")],
            )?;

        sqlx::query("DELETE FROM playlist WHERE id = ?1")
            .bind(&playlist.id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .into_app_err(
                "failed to delete playlist",
                AppErrorKind::Database,
                &[&format!("NAME: {name}")],
            )
    }

    pub async fn mark_playlist_queued(
        &self,
        guild_id: GuildId,
        name: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE playlist SET queued_at = ?1
            WHERE guild_id = ?2 AND kind = ?3 AND name = ?4",
        )
        .bind(Utc::now())
        .bind(guild_id as i64)
        .bind(KIND_USER)
        .bind(name)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to mark playlist queued",
            AppErrorKind::Database,
            &[&format!("NAME: {name}")],
        )
    }

    /// Random sample of the guild's history playlist, the default pool of
    /// `random-play`.
    pub async fn random_history(
        &self,
        guild_id: GuildId,
        limit: usize,
    ) -> Result<Vec<PlaylistItemRow>, AppError> {
        let Some(playlist) = self.find_playlist(guild_id, KIND_HISTORY, None).await? else {
            return Ok(Vec::new());
        };

        sqlx::query_as::<_, PlaylistItemRow>(
            "SELECT * FROM playlist_item
            WHERE playlist_id = ?1
            ORDER BY RANDOM()
            LIMIT ?2",
        )
        .bind(&playlist.id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .into_app_err(
            "failed to sample history",
            AppErrorKind::Database,
            &[&format!("GUILD: {guild_id}")],
        )
    }

    pub async fn analytics(&self, guild_id: GuildId) -> Result<GuildAnalytics, AppError> {
        let row = sqlx::query_as::<_, GuildAnalytics>(
            "SELECT total_plays, total_duration_s, cached_plays
            FROM guild_analytics WHERE guild_id = ?1",
        )
        .bind(guild_id as i64)
        .fetch_optional(&self.pool)
        .await
        .into_app_err(
            "failed to read guild analytics",
            AppErrorKind::Database,
            &[&format!("GUILD: {guild_id}")],
        )?;
        Ok(row.unwrap_or_default())
    }
}

/// Drains the history queue into the store. Exits once the shutdown
/// signal fires and the queue is empty.
pub async fn run_history_writer(
    store: Arc<HistoryStore>,
    mut rx: mpsc::UnboundedReceiver<HistoryItem>,
    config: HistoryConfig,
    mut shutdown: watch::Receiver<bool>,
    heartbeats: Arc<Heartbeats>,
) {
    log::info!("history writer started");

    loop {
        heartbeats.beat("history-write");

        let item = tokio::select! {
            item = rx.recv() => item,
            _ = shutdown.changed() => {
                // drain whatever is already queued, then stop
                while let Ok(item) = rx.try_recv() {
                    write_one(&store, &item, &config).await;
                }
                break;
            }
        };

        match item {
            Some(item) => write_one(&store, &item, &config).await,
            None => break,
        }

        if *shutdown.borrow() && rx.is_empty() {
            break;
        }
    }

    log::info!("history writer stopped");
}

async fn write_one(store: &HistoryStore, item: &HistoryItem, config: &HistoryConfig) {
    if let Err(err) = store
        .record_play(item, config.history_playlist_max_items)
        .await
    {
        log::error!(
            "failed to record play, GUILD: {guild}, ERROR: {err}",
            guild = item.guild_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> HistoryStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        HistoryStore::new(pool)
    }

    fn play(guild_id: GuildId, url: &str, cached: bool) -> HistoryItem {
        HistoryItem {
            guild_id,
            url: url.to_owned(),
            title: Some(format!("title of {url}")),
            duration_s: Some(100),
            cache_hit: cached,
        }
    }

    #[actix_rt::test]
    async fn test_record_play_updates_analytics_and_history() {
        let store = store().await;

        store.record_play(&play(1, "u1", false), 10).await.unwrap();
        store.record_play(&play(1, "u2", true), 10).await.unwrap();

        let analytics = store.analytics(1).await.unwrap();
        assert_eq!(analytics.total_plays, 2);
        assert_eq!(analytics.total_duration_s, 200);
        assert_eq!(analytics.cached_plays, 1);

        let items = store.history_items(1).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "u1");
        assert_eq!(items[1].url, "u2");

        // other guilds are untouched
        assert_eq!(store.analytics(2).await.unwrap(), GuildAnalytics::default());
    }

    #[actix_rt::test]
    async fn test_history_playlist_is_bounded() {
        let store = store().await;

        for i in 0..5 {
            store
                .record_play(&play(1, &format!("u{i}"), false), 3)
                .await
                .unwrap();
        }

        let items = store.history_items(1).await.unwrap();
        assert_eq!(items.len(), 3);
        // the oldest two were evicted
        let urls: Vec<&str> = items.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["u2", "u3", "u4"]);
    }

    #[actix_rt::test]
    async fn test_user_playlist_crud() {
        let store = store().await;

        store.create_playlist(1, "bangers").await.unwrap();
        assert!(store.create_playlist(1, "bangers").await.is_err());

        store
            .add_playlist_item(1, "bangers", "u1", Some("one"))
            .await
            .unwrap();
        store
            .add_playlist_item(1, "bangers", "u2", Some("two"))
            .await
            .unwrap();

        let items = store.playlist_items(1, "bangers").await.unwrap();
        assert_eq!(items.len(), 2);

        store.remove_playlist_item(1, "bangers", 0).await.unwrap();
        let items = store.playlist_items(1, "bangers").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "u2");

        assert!(store.remove_playlist_item(1, "bangers", 7).await.is_err());

        store.delete_playlist(1, "bangers").await.unwrap();
        assert!(store.playlist_items(1, "bangers").await.is_err());
        assert!(store.list_playlists(1).await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn test_history_playlist_is_append_only() {
        let store = store().await;
        store.record_play(&play(1, "u1", false), 10).await.unwrap();

        assert!(store
            .remove_playlist_item(1, HISTORY_PLAYLIST_NAME, 0)
            .await
            .is_err());
        assert_eq!(store.history_items(1).await.unwrap().len(), 1);
    }

    #[actix_rt::test]
    async fn test_random_history_sample() {
        let store = store().await;
        for i in 0..10 {
            store
                .record_play(&play(1, &format!("u{i}"), false), 20)
                .await
                .unwrap();
        }

        let sample = store.random_history(1, 4).await.unwrap();
        assert_eq!(sample.len(), 4);

        // empty guild yields empty sample
        assert!(store.random_history(9, 4).await.unwrap().is_empty());
    }
}
