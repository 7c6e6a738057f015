use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    chat::GuildId,
    config::CacheConfig,
    error::{AppError, AppErrorKind, IntoAppError},
    media::{cache_uid, MediaMetadata},
};

pub mod backup;
pub mod db;

pub use backup::{DirObjectStore, ObjectStore};
pub use db::VideoCacheRow;

use db::CacheDb;

const DEFAULT_AUDIO_EXT: &str = "mp3";

/// Outcome of a cache probe for one canonical URL.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(CachedMedia),
    /// The URL previously failed terminally; callers fail fast instead of
    /// re-downloading.
    TerminalFailure(String),
    Miss,
}

#[derive(Debug, Clone)]
pub struct CachedMedia {
    pub url: String,
    pub source_path: PathBuf,
    pub metadata: MediaMetadata,
}

/// Content-addressed file store keyed by canonical URL.
///
/// Bytes live under the cache directory, one file per URL; metadata lives
/// in SQLite. Playback never touches the source file directly: every use
/// gets its own hard link (copy when linking fails) that the player
/// deletes freely. The in-transit reference counts bridge the window
/// between a lookup deciding to use an entry and the per-use link
/// existing, so the LRU sweep can never pull a file out from under an
/// active request.
pub struct DownloadCache {
    db: CacheDb,
    config: CacheConfig,
    cache_dir: PathBuf,
    guilds_dir: PathBuf,
    in_transit: Mutex<HashMap<String, usize>>,
    store: Option<Arc<dyn ObjectStore>>,
}

impl DownloadCache {
    pub fn new(
        pool: SqlitePool,
        config: CacheConfig,
        cache_dir: PathBuf,
        guilds_dir: PathBuf,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        Self {
            db: CacheDb::new(pool),
            config,
            cache_dir,
            guilds_dir,
            in_transit: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Pins a URL against deletion while a request is using it.
    pub fn retain(&self, url: &str) {
        let mut in_transit = self.in_transit.lock().expect("in-transit lock poisoned");
        *in_transit.entry(url.to_owned()).or_insert(0) += 1;
    }

    pub fn release(&self, url: &str) {
        let mut in_transit = self.in_transit.lock().expect("in-transit lock poisoned");
        match in_transit.get_mut(url) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                in_transit.remove(url);
            }
            None => log::error!("released un-retained cache entry, URL: {url}"),
        }
    }

    fn is_in_transit(&self, url: &str) -> bool {
        self.in_transit
            .lock()
            .expect("in-transit lock poisoned")
            .contains_key(url)
    }

    /// Probes the cache. Live hits refresh `last_iterated_at`; entries
    /// whose local file vanished are restored from backup when possible
    /// and forgotten otherwise.
    pub async fn lookup(&self, url: &str) -> Result<CacheLookup, AppError> {
        if !self.config.enabled {
            return Ok(CacheLookup::Miss);
        }

        let Some(row) = self.db.fetch(url).await? else {
            return Ok(CacheLookup::Miss);
        };

        if let Some(kind) = &row.failure_kind {
            self.db.touch(url).await?;
            return Ok(CacheLookup::TerminalFailure(kind.clone()));
        }

        if row.marked_for_delete {
            return Ok(CacheLookup::Miss);
        }

        let Some(path) = row.path.clone() else {
            return Ok(CacheLookup::Miss);
        };
        let source_path = PathBuf::from(&path);

        let on_disk = tokio::fs::try_exists(&source_path).await.unwrap_or(false);
        if !on_disk {
            if !self.restore_from_backup(&row, &source_path).await? {
                log::error!("cache entry lost its file and has no backup, URL: {url}");
                self.db.delete_row(url).await?;
                return Ok(CacheLookup::Miss);
            }
        }

        self.db.touch(url).await?;
        Ok(CacheLookup::Hit(CachedMedia {
            url: row.url.clone(),
            source_path,
            metadata: row.metadata(),
        }))
    }

    async fn restore_from_backup(
        &self,
        row: &VideoCacheRow,
        source_path: &Path,
    ) -> Result<bool, AppError> {
        let (Some(store), Some(key)) = (&self.store, &row.backup_key) else {
            return Ok(false);
        };

        log::info!(
            "restoring cache entry from backup, URL: {url}, KEY: {key}",
            url = row.url
        );
        let bytes = store.get(key).await?;
        if let Some(parent) = source_path.parent() {
            tokio::fs::create_dir_all(parent).await.into_app_err(
                "failed to create cache directory",
                AppErrorKind::LocalData,
                &[],
            )?;
        }
        tokio::fs::write(source_path, bytes).await.into_app_err(
            "failed to write restored cache file",
            AppErrorKind::LocalData,
            &[&format!("PATH: {}", source_path.display())],
        )?;
        Ok(true)
    }

    /// Moves a freshly extracted file into the cache and upserts its row.
    /// Returns the content-addressed source path.
    pub async fn insert(
        &self,
        url: &str,
        downloaded: &Path,
        metadata: &MediaMetadata,
    ) -> Result<PathBuf, AppError> {
        let ext = downloaded
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(DEFAULT_AUDIO_EXT);
        let source_path = self.cache_dir.join(format!("{}.{ext}", cache_uid(url)));

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .into_app_err(
                "failed to create cache directory",
                AppErrorKind::LocalData,
                &[],
            )?;
        move_file(downloaded, &source_path).await.into_app_err(
            "failed to move download into cache",
            AppErrorKind::LocalData,
            &[
                &format!("FROM: {}", downloaded.display()),
                &format!("TO: {}", source_path.display()),
            ],
        )?;

        if self.config.enabled {
            self.db
                .upsert(url, &source_path.to_string_lossy(), metadata)
                .await?;
        }

        Ok(source_path)
    }

    /// Produces a per-use path the caller may delete without affecting the
    /// cached source: a hard link when the filesystem allows it, a copy
    /// otherwise.
    pub async fn link_for_use(
        &self,
        guild_id: GuildId,
        source_path: &Path,
    ) -> Result<PathBuf, AppError> {
        let guild_dir = self.guilds_dir.join(guild_id.to_string());
        tokio::fs::create_dir_all(&guild_dir).await.into_app_err(
            "failed to create guild directory",
            AppErrorKind::LocalData,
            &[&format!("GUILD: {guild_id}")],
        )?;

        let ext = source_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(DEFAULT_AUDIO_EXT);
        let local_path = guild_dir.join(format!("{}.{ext}", Uuid::new_v4()));

        if tokio::fs::hard_link(source_path, &local_path).await.is_err() {
            tokio::fs::copy(source_path, &local_path)
                .await
                .into_app_err(
                    "failed to produce per-use copy",
                    AppErrorKind::LocalData,
                    &[
                        &format!("FROM: {}", source_path.display()),
                        &format!("TO: {}", local_path.display()),
                    ],
                )?;
        }

        Ok(local_path)
    }

    pub async fn record_terminal_failure(&self, url: &str, kind: &str) -> Result<(), AppError> {
        if !self.config.enabled {
            return Ok(());
        }
        self.db.record_terminal_failure(url, kind).await
    }

    /// Marks the least-recently-iterated excess over `max_entries` for
    /// deletion, skipping anything in transit. Returns how many were
    /// marked.
    pub async fn mark_lru_for_delete(&self) -> Result<usize, AppError> {
        if !self.config.enabled {
            return Ok(0);
        }

        let live = self.db.live_entry_count().await?;
        let excess = live - self.config.max_entries as i64;
        if excess <= 0 {
            return Ok(0);
        }

        // the excess oldest entries, minus anything in transit; skipped
        // entries are picked up by a later sweep once released
        let candidates = self.db.lru_candidates(excess).await?;
        let mut marked = 0usize;
        for row in candidates {
            if self.is_in_transit(&row.url) {
                continue;
            }
            self.db.mark_for_delete(&row.url).await?;
            marked += 1;
        }

        Ok(marked)
    }

    /// Marked entries that are safe to delete right now.
    pub async fn collect_deletable(&self) -> Result<Vec<VideoCacheRow>, AppError> {
        let marked = self.db.marked_entries().await?;
        Ok(marked
            .into_iter()
            .filter(|row| !self.is_in_transit(&row.url))
            .collect())
    }

    /// Deletes the entry's file and row. The per-use links derived from it
    /// keep working; only the shared source goes away.
    pub async fn purge(&self, row: &VideoCacheRow) -> Result<(), AppError> {
        if let Some(path) = &row.path {
            if let Err(err) = tokio::fs::remove_file(path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(err).into_app_err(
                        "failed to delete cached file",
                        AppErrorKind::LocalData,
                        &[&format!("PATH: {path}")],
                    );
                }
            }
        }
        self.db.delete_row(&row.url).await
    }

    /// Uploads up to `limit` un-backed-up entries to the object store.
    /// Upload failures leave the entry pending for the next sweep.
    pub async fn backup_sweep(&self, limit: i64) -> Result<usize, AppError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let pending = self.db.backup_pending(limit).await?;
        let mut uploaded = 0usize;
        for row in pending {
            let Some(path) = &row.path else { continue };
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::error!(
                        "failed to read cache file for backup, URL: {url}, ERROR: {err}",
                        url = row.url
                    );
                    continue;
                }
            };

            let key = Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| cache_uid(&row.url));

            if let Err(err) = store.put(&key, bytes).await {
                log::error!(
                    "backup upload failed, retried next sweep, URL: {url}, ERROR: {err}",
                    url = row.url
                );
                continue;
            }
            self.db.set_backup_key(&row.url, &key).await?;
            uploaded += 1;
        }

        Ok(uploaded)
    }

    /// Memoized free-text resolution. Queries are normalized so trivially
    /// different spellings share an entry.
    pub async fn search_lookup(&self, raw_query: &str) -> Result<Option<String>, AppError> {
        if !self.config.enabled {
            return Ok(None);
        }
        self.db.search_lookup(&normalize_query(raw_query)).await
    }

    pub async fn search_insert(&self, raw_query: &str, url: &str) -> Result<(), AppError> {
        if !self.config.enabled {
            return Ok(());
        }
        self.db.search_upsert(&normalize_query(raw_query), url).await
    }

    pub async fn enforce_search_cap(&self) -> Result<(), AppError> {
        if !self.config.enabled {
            return Ok(());
        }
        let count = self.db.search_count().await?;
        let excess = count - self.config.max_search_entries as i64;
        if excess > 0 {
            self.db.search_evict_lru(excess).await?;
        }
        Ok(())
    }

    pub async fn random_cached(&self, limit: usize) -> Result<Vec<CachedMedia>, AppError> {
        let rows = self.db.random_entries(limit as i64).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                row.path.as_ref().map(|path| CachedMedia {
                    url: row.url.clone(),
                    source_path: PathBuf::from(path),
                    metadata: row.metadata(),
                })
            })
            .collect())
    }
}

/// Rename first, copy-and-remove when the rename crosses filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

pub fn normalize_query(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn test_cache(config: CacheConfig, store: Option<Arc<dyn ObjectStore>>) -> (DownloadCache, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = DownloadCache::new(
            test_pool().await,
            config,
            dir.path().join("cache"),
            dir.path().join("guilds"),
            store,
        );
        (cache, dir)
    }

    fn metadata(title: &str) -> MediaMetadata {
        MediaMetadata {
            title: Some(title.to_owned()),
            uploader: Some("uploader".to_owned()),
            duration_s: Some(180),
        }
    }

    async fn scratch_file(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, b"audio-bytes").await.unwrap();
        path
    }

    const URL: &str = "https://www.youtube.com/watch?v=abc123";

    #[actix_rt::test]
    async fn test_insert_twice_is_idempotent() {
        let (cache, dir) = test_cache(CacheConfig::default(), None).await;

        let first = scratch_file(&dir, "dl1.mp3").await;
        let path1 = cache.insert(URL, &first, &metadata("t")).await.unwrap();
        let row1 = cache.db.fetch(URL).await.unwrap().unwrap();

        let second = scratch_file(&dir, "dl2.mp3").await;
        let path2 = cache.insert(URL, &second, &metadata("t")).await.unwrap();
        let row2 = cache.db.fetch(URL).await.unwrap().unwrap();

        assert_eq!(path1, path2);
        assert_eq!(row1.created_at, row2.created_at);
        assert!(row2.last_iterated_at >= row1.last_iterated_at);
        assert_eq!(cache.db.live_entry_count().await.unwrap(), 1);
    }

    #[actix_rt::test]
    async fn test_lookup_hit_and_terminal_sentinel() {
        let (cache, dir) = test_cache(CacheConfig::default(), None).await;

        assert!(matches!(
            cache.lookup(URL).await.unwrap(),
            CacheLookup::Miss
        ));

        let file = scratch_file(&dir, "dl.mp3").await;
        cache.insert(URL, &file, &metadata("hit me")).await.unwrap();
        match cache.lookup(URL).await.unwrap() {
            CacheLookup::Hit(media) => {
                assert_eq!(media.metadata.title.as_deref(), Some("hit me"))
            }
            other => panic!("expected hit, got {other:?}"),
        }

        let bad = "https://www.youtube.com/watch?v=agegate";
        cache
            .record_terminal_failure(bad, "age_restricted")
            .await
            .unwrap();
        match cache.lookup(bad).await.unwrap() {
            CacheLookup::TerminalFailure(kind) => assert_eq!(kind, "age_restricted"),
            other => panic!("expected terminal failure, got {other:?}"),
        }
    }

    #[actix_rt::test]
    async fn test_per_use_links_are_independent() {
        let (cache, dir) = test_cache(CacheConfig::default(), None).await;
        let file = scratch_file(&dir, "dl.mp3").await;
        let source = cache.insert(URL, &file, &metadata("t")).await.unwrap();

        let use1 = cache.link_for_use(10, &source).await.unwrap();
        let use2 = cache.link_for_use(10, &source).await.unwrap();
        assert_ne!(use1, use2);

        tokio::fs::remove_file(&use1).await.unwrap();
        assert!(tokio::fs::try_exists(&use2).await.unwrap());
        assert!(tokio::fs::try_exists(&source).await.unwrap());
    }

    #[actix_rt::test]
    async fn test_lru_mark_skips_in_transit() {
        let config = CacheConfig {
            max_entries: 1,
            ..CacheConfig::default()
        };
        let (cache, dir) = test_cache(config, None).await;

        let old_url = "https://www.youtube.com/watch?v=old";
        let new_url = "https://www.youtube.com/watch?v=new";
        let f1 = scratch_file(&dir, "a.mp3").await;
        cache.insert(old_url, &f1, &metadata("old")).await.unwrap();
        let f2 = scratch_file(&dir, "b.mp3").await;
        cache.insert(new_url, &f2, &metadata("new")).await.unwrap();

        // the LRU victim is pinned; nothing may be marked
        cache.retain(old_url);
        assert_eq!(cache.mark_lru_for_delete().await.unwrap(), 0);

        cache.release(old_url);
        assert_eq!(cache.mark_lru_for_delete().await.unwrap(), 1);

        // pin again between mark and collect: nothing is deletable
        cache.retain(old_url);
        assert!(cache.collect_deletable().await.unwrap().is_empty());

        cache.release(old_url);
        let deletable = cache.collect_deletable().await.unwrap();
        assert_eq!(deletable.len(), 1);
        assert_eq!(deletable[0].url, old_url);

        cache.purge(&deletable[0]).await.unwrap();
        assert!(matches!(
            cache.lookup(old_url).await.unwrap(),
            CacheLookup::Miss
        ));
    }

    #[actix_rt::test]
    async fn test_search_memoization_round_trip() {
        let (cache, _dir) = test_cache(CacheConfig::default(), None).await;

        assert_eq!(cache.search_lookup("Hello  World").await.unwrap(), None);
        cache.search_insert("Hello  World", URL).await.unwrap();
        assert_eq!(
            cache.search_lookup("hello world").await.unwrap(),
            Some(URL.to_owned())
        );
        // repeated insert stays a single row
        cache.search_insert("HELLO WORLD", URL).await.unwrap();
        assert_eq!(cache.db.search_count().await.unwrap(), 1);
    }

    #[actix_rt::test]
    async fn test_search_cap_evicts_lru() {
        let config = CacheConfig {
            max_search_entries: 2,
            ..CacheConfig::default()
        };
        let (cache, _dir) = test_cache(config, None).await;

        cache.search_insert("one", "u1").await.unwrap();
        cache.search_insert("two", "u2").await.unwrap();
        cache.search_insert("three", "u3").await.unwrap();
        // refresh "one" so "two" is the LRU
        cache.search_lookup("one").await.unwrap();

        cache.enforce_search_cap().await.unwrap();
        assert_eq!(cache.db.search_count().await.unwrap(), 2);
        assert_eq!(cache.search_lookup("two").await.unwrap(), None);
        assert!(cache.search_lookup("one").await.unwrap().is_some());
    }

    #[actix_rt::test]
    async fn test_backup_sweep_and_restore() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(DirObjectStore::new(dir.path().join("objects")));
        let cache = DownloadCache::new(
            test_pool().await,
            CacheConfig::default(),
            dir.path().join("cache"),
            dir.path().join("guilds"),
            Some(Arc::clone(&store)),
        );

        let file = dir.path().join("dl.mp3");
        tokio::fs::write(&file, b"audio-bytes").await.unwrap();
        let source = cache.insert(URL, &file, &metadata("t")).await.unwrap();

        assert_eq!(cache.backup_sweep(10).await.unwrap(), 1);
        let row = cache.db.fetch(URL).await.unwrap().unwrap();
        let key = row.backup_key.clone().unwrap();
        assert!(store.exists(&key).await.unwrap());

        // second sweep has nothing left to do
        assert_eq!(cache.backup_sweep(10).await.unwrap(), 0);

        // lose the local file; lookup restores it from the backup
        tokio::fs::remove_file(&source).await.unwrap();
        match cache.lookup(URL).await.unwrap() {
            CacheLookup::Hit(media) => {
                assert!(tokio::fs::try_exists(&media.source_path).await.unwrap());
                assert_eq!(
                    tokio::fs::read(&media.source_path).await.unwrap(),
                    b"audio-bytes"
                );
            }
            other => panic!("expected restored hit, got {other:?}"),
        }
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  FOO   Bar baz "), "foo bar baz");
    }
}
