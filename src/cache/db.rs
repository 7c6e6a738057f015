use chrono::{DateTime, Utc};
use sqlx::{prelude::FromRow, SqlitePool};

use crate::{
    error::{AppError, AppErrorKind, IntoAppError},
    media::MediaMetadata,
};

/// Persistent row for one cached download, or for a terminal-failure
/// sentinel (`path` is NULL, `failure_kind` set).
#[derive(Debug, Clone, FromRow)]
pub struct VideoCacheRow {
    pub url: String,
    pub path: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration_s: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_iterated_at: DateTime<Utc>,
    pub marked_for_delete: bool,
    pub backup_key: Option<String>,
    pub failure_kind: Option<String>,
    pub failure_at: Option<DateTime<Utc>>,
}

impl VideoCacheRow {
    pub fn metadata(&self) -> MediaMetadata {
        MediaMetadata {
            title: self.title.clone(),
            uploader: self.uploader.clone(),
            duration_s: self.duration_s,
        }
    }
}

/// Metadata store of the download cache. All queries are serialized per
/// entry by the single writer discipline of the calling loops.
pub struct CacheDb {
    pool: SqlitePool,
}

impl CacheDb {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, url: &str) -> Result<Option<VideoCacheRow>, AppError> {
        sqlx::query_as::<_, VideoCacheRow>("SELECT * FROM video_cache WHERE url = ?1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .into_app_err(
                "failed to fetch cache entry",
                AppErrorKind::Database,
                &[&format!("URL: {url}")],
            )
    }

    pub async fn touch(&self, url: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE video_cache SET last_iterated_at = ?1 WHERE url = ?2")
            .bind(Utc::now())
            .bind(url)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .into_app_err(
                "failed to touch cache entry",
                AppErrorKind::Database,
                &[&format!("URL: {url}")],
            )
    }

    /// Idempotent on URL: a second insert only refreshes
    /// `last_iterated_at` (and un-marks a pending delete, since the entry
    /// is evidently wanted again).
    pub async fn upsert(
        &self,
        url: &str,
        path: &str,
        metadata: &MediaMetadata,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO video_cache
                (url, path, title, uploader, duration_s, created_at, last_iterated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT (url) DO UPDATE SET
                last_iterated_at = excluded.last_iterated_at,
                marked_for_delete = 0",
        )
        .bind(url)
        .bind(path)
        .bind(&metadata.title)
        .bind(&metadata.uploader)
        .bind(metadata.duration_s)
        .bind(now)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to store cache entry",
            AppErrorKind::Database,
            &[&format!("URL: {url}")],
        )
    }

    /// Terminal download failures are remembered so repeat requests fail
    /// fast without invoking the extractor again.
    pub async fn record_terminal_failure(&self, url: &str, kind: &str) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO video_cache
                (url, created_at, last_iterated_at, failure_kind, failure_at)
            VALUES (?1, ?2, ?2, ?3, ?2)
            ON CONFLICT (url) DO UPDATE SET
                failure_kind = excluded.failure_kind,
                failure_at = excluded.failure_at,
                last_iterated_at = excluded.last_iterated_at",
        )
        .bind(url)
        .bind(now)
        .bind(kind)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to record terminal failure",
            AppErrorKind::Database,
            &[&format!("URL: {url}"), &format!("KIND: {kind}")],
        )
    }

    pub async fn live_entry_count(&self) -> Result<i64, AppError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM video_cache
            WHERE marked_for_delete = 0 AND failure_kind IS NULL AND path IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await
        .into_app_err("failed to count cache entries", AppErrorKind::Database, &[])
    }

    pub async fn lru_candidates(&self, limit: i64) -> Result<Vec<VideoCacheRow>, AppError> {
        sqlx::query_as::<_, VideoCacheRow>(
            "SELECT * FROM video_cache
            WHERE marked_for_delete = 0 AND failure_kind IS NULL AND path IS NOT NULL
            ORDER BY last_iterated_at ASC
            LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .into_app_err(
            "failed to select LRU candidates",
            AppErrorKind::Database,
            &[&format!("LIMIT: {limit}")],
        )
    }

    pub async fn mark_for_delete(&self, url: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE video_cache SET marked_for_delete = 1 WHERE url = ?1")
            .bind(url)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .into_app_err(
                "failed to mark cache entry for delete",
                AppErrorKind::Database,
                &[&format!("URL: {url}")],
            )
    }

    pub async fn marked_entries(&self) -> Result<Vec<VideoCacheRow>, AppError> {
        sqlx::query_as::<_, VideoCacheRow>(
            "SELECT * FROM video_cache WHERE marked_for_delete = 1",
        )
        .fetch_all(&self.pool)
        .await
        .into_app_err(
            "failed to fetch marked cache entries",
            AppErrorKind::Database,
            &[],
        )
    }

    pub async fn delete_row(&self, url: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM video_cache WHERE url = ?1")
            .bind(url)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .into_app_err(
                "failed to delete cache row",
                AppErrorKind::Database,
                &[&format!("URL: {url}")],
            )
    }

    pub async fn backup_pending(&self, limit: i64) -> Result<Vec<VideoCacheRow>, AppError> {
        sqlx::query_as::<_, VideoCacheRow>(
            "SELECT * FROM video_cache
            WHERE backup_key IS NULL AND marked_for_delete = 0
                AND failure_kind IS NULL AND path IS NOT NULL
            ORDER BY created_at ASC
            LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .into_app_err(
            "failed to fetch backup-pending entries",
            AppErrorKind::Database,
            &[],
        )
    }

    pub async fn set_backup_key(&self, url: &str, key: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE video_cache SET backup_key = ?1 WHERE url = ?2")
            .bind(key)
            .bind(url)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .into_app_err(
                "failed to record backup key",
                AppErrorKind::Database,
                &[&format!("URL: {url}"), &format!("KEY: {key}")],
            )
    }

    pub async fn search_lookup(&self, query_normalized: &str) -> Result<Option<String>, AppError> {
        let url = sqlx::query_scalar::<_, String>(
            "SELECT url FROM search_string WHERE query_normalized = ?1",
        )
        .bind(query_normalized)
        .fetch_optional(&self.pool)
        .await
        .into_app_err(
            "failed to look up search string",
            AppErrorKind::Database,
            &[&format!("QUERY: {query_normalized}")],
        )?;

        if url.is_some() {
            sqlx::query(
                "UPDATE search_string SET last_iterated_at = ?1 WHERE query_normalized = ?2",
            )
            .bind(Utc::now())
            .bind(query_normalized)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .into_app_err(
                "failed to touch search string",
                AppErrorKind::Database,
                &[&format!("QUERY: {query_normalized}")],
            )?;
        }

        Ok(url)
    }

    pub async fn search_upsert(&self, query_normalized: &str, url: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO search_string (query_normalized, url, last_iterated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (query_normalized) DO UPDATE SET
                url = excluded.url,
                last_iterated_at = excluded.last_iterated_at",
        )
        .bind(query_normalized)
        .bind(url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to store search string",
            AppErrorKind::Database,
            &[&format!("QUERY: {query_normalized}")],
        )
    }

    pub async fn search_count(&self) -> Result<i64, AppError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM search_string")
            .fetch_one(&self.pool)
            .await
            .into_app_err(
                "failed to count search strings",
                AppErrorKind::Database,
                &[],
            )
    }

    pub async fn search_evict_lru(&self, excess: i64) -> Result<(), AppError> {
        sqlx::query(
            "DELETE FROM search_string WHERE query_normalized IN (
                SELECT query_normalized FROM search_string
                ORDER BY last_iterated_at ASC
                LIMIT ?1
            )",
        )
        .bind(excess)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .into_app_err(
            "failed to evict search strings",
            AppErrorKind::Database,
            &[&format!("EXCESS: {excess}")],
        )
    }

    /// Random live entries, the pool behind `random-play cache`.
    pub async fn random_entries(&self, limit: i64) -> Result<Vec<VideoCacheRow>, AppError> {
        sqlx::query_as::<_, VideoCacheRow>(
            "SELECT * FROM video_cache
            WHERE marked_for_delete = 0 AND failure_kind IS NULL AND path IS NOT NULL
            ORDER BY RANDOM()
            LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .into_app_err(
            "failed to fetch random cache entries",
            AppErrorKind::Database,
            &[],
        )
    }
}
