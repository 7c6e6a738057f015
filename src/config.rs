use std::{collections::HashMap, path::PathBuf};

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::chat::GuildId;

/// Top-level service configuration, deserialized from a TOML file.
///
/// Every section has complete defaults so a minimal file only needs
/// `work_dir` and `database_url`. Secrets (catalog API keys) are not read
/// from the file; each catalog section names the environment variable that
/// holds its credential.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub work_dir: PathBuf,
    pub database_url: String,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// Bounded capacity of each guild's download partition.
    pub download_capacity: usize,
    /// Bounded capacity of each guild's search partition.
    pub search_capacity: usize,
    /// Optional per-guild priority overrides; higher is served first.
    /// Keys are guild ids (TOML table keys are strings).
    pub priorities: HashMap<String, i32>,
}

impl QueuesConfig {
    pub fn priority_for(&self, guild_id: GuildId) -> i32 {
        self.priorities
            .get(&guild_id.to_string())
            .copied()
            .unwrap_or(0)
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            download_capacity: 50,
            search_capacity: 500,
            priorities: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_wait_s: u64,
    pub max_size: usize,
    pub max_age_s: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_wait_s: 30,
            max_size: 100,
            max_age_s: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Overrides `<work_dir>/cache` when set.
    pub local_directory: Option<PathBuf>,
    pub max_entries: usize,
    pub max_search_entries: usize,
    /// Object-storage bucket for backups; `None` disables the backup sweep.
    pub backup_bucket: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_directory: None,
            max_entries: 2000,
            max_search_entries: 5000,
            backup_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Overrides the `yt-dlp` found on PATH.
    pub binary_path: Option<PathBuf>,
    pub max_duration_s: u64,
    pub enable_post_processing: bool,
    pub download_retries: u32,
    pub timeout_s: u64,
    /// Extra flags handed to the extractor verbatim, e.g. rate limits.
    pub extra_options: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            max_duration_s: 3600,
            enable_post_processing: false,
            download_retries: 3,
            timeout_s: 600,
            extra_options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub queue_max_size: usize,
    pub history_max_size: usize,
    pub empty_channel_timeout_s: u64,
    pub max_song_length_s: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            queue_max_size: 50,
            history_max_size: 50,
            empty_channel_timeout_s: 300,
            max_song_length_s: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Hard character cap per rendered page; platform message limit.
    pub page_char_limit: usize,
    /// Seconds a finished bundle stays on screen before its messages are
    /// deleted.
    pub finished_grace_s: u64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            page_char_limit: 2000,
            finished_grace_s: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How many recent channel messages a sticky bundle inspects when
    /// deciding whether it has been overtaken.
    pub sticky_recent_window: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sticky_recent_window: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub history_playlist_max_items: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            history_playlist_max_items: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Env var holding the video-site Data API key.
    pub video_api_key_env: String,
    /// Env vars holding the streaming-platform client credentials. The
    /// streaming catalog is disabled when either is unset at startup.
    pub streaming_client_id_env: String,
    pub streaming_client_secret_env: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            video_api_key_env: "VIDEO_API_KEY".to_owned(),
            streaming_client_id_env: "STREAMING_CLIENT_ID".to_owned(),
            streaming_client_secret_env: "STREAMING_CLIENT_SECRET".to_owned(),
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Fatal configuration errors must surface before any loop starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            return Err(anyhow!("'database_url' must not be empty"));
        }
        if self.queues.download_capacity == 0 || self.queues.search_capacity == 0 {
            return Err(anyhow!("queue capacities must be greater than zero"));
        }
        if self.player.queue_max_size == 0 {
            return Err(anyhow!("'player.queue_max_size' must be greater than zero"));
        }
        if self.bundle.page_char_limit < crate::bundle::MAX_ROW_WIDTH + 1 {
            return Err(anyhow!(
                "'bundle.page_char_limit' must fit at least one row (>= {})",
                crate::bundle::MAX_ROW_WIDTH + 1
            ));
        }
        if self.backoff.max_size == 0 {
            return Err(anyhow!("'backoff.max_size' must be greater than zero"));
        }
        for key in self.queues.priorities.keys() {
            if key.parse::<GuildId>().is_err() {
                return Err(anyhow!("'queues.priorities' key '{key}' is not a guild id"));
            }
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .local_directory
            .clone()
            .unwrap_or_else(|| self.work_dir.join("cache"))
    }

    pub fn guilds_dir(&self) -> PathBuf {
        self.work_dir.join("guilds")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.work_dir.join("tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            work_dir = "/tmp/gas"
            database_url = "sqlite::memory:"
            "#,
        )
        .unwrap();

        assert_eq!(config.backoff.base_wait_s, 30);
        assert_eq!(config.backoff.max_size, 100);
        assert_eq!(config.backoff.max_age_s, 300);
        assert_eq!(config.extractor.download_retries, 3);
        assert_eq!(config.bundle.page_char_limit, 2000);
        assert!(config.cache.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            work_dir = "/tmp/gas"
            database_url = "sqlite::memory:"

            [queues]
            download_capacity = 0
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_priority_map_is_read() {
        let config: Config = toml::from_str(
            r#"
            work_dir = "/tmp/gas"
            database_url = "sqlite::memory:"

            [queues.priorities]
            123456 = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.queues.priority_for(123456), 2);
        assert_eq!(config.queues.priority_for(999), 0);
    }
}
