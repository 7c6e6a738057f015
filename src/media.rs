use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::{ChannelId, GuildId, UserId};

/// How the resolver classified the user's input for one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchKind {
    /// A track from a streaming-platform album/playlist/track URL;
    /// `raw_search` is "<artist> <title>" and still needs the search stage.
    StreamingTrack,
    /// A single video-site URL; already canonical.
    VideoUrl,
    /// One member of an expanded video-site playlist; already canonical.
    VideoPlaylistMember,
    /// A direct media URL outside the video site.
    DirectUrl,
    /// Free text that the search stage turns into a canonical URL.
    FreeText,
    Other,
}

impl SearchKind {
    /// Whether this request must pass through the search queue before the
    /// download queue.
    pub fn needs_search(&self) -> bool {
        matches!(self, Self::StreamingTrack | Self::FreeText)
    }
}

/// Lifecycle stage of one media request, as shown in its bundle row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStage {
    Searching,
    Queued,
    Backoff,
    InProgress,
    Completed,
    Failed,
    Discarded,
}

impl RequestStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Discarded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Searching => "searching",
            Self::Queued => "queued",
            Self::Backoff => "waiting",
            Self::InProgress => "downloading",
            Self::Completed => "done",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }
}

/// One user-intended track flowing through the search and download stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRequest {
    pub id: Uuid,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub requester_id: UserId,
    pub requester_name: Arc<str>,
    /// The user-typed or URL-extracted string; never rewritten.
    pub raw_search: Arc<str>,
    /// Equals `raw_search` until the search stage rewrites it to a
    /// canonical media URL.
    pub resolved_search: Arc<str>,
    pub kind: SearchKind,
    pub bundle_id: Option<Uuid>,
    pub retry_count: u32,
    /// Requests replayed out of the history playlist are not written back
    /// to it.
    pub from_history: bool,
    pub history_item_id: Option<i64>,
    /// When set, a successful download is appended to this named playlist
    /// instead of being delivered to the play queue.
    pub save_to_playlist: Option<Arc<str>>,
}

impl MediaRequest {
    pub fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        requester_id: UserId,
        requester_name: impl Into<Arc<str>>,
        raw_search: impl Into<Arc<str>>,
        kind: SearchKind,
    ) -> Self {
        let raw_search = raw_search.into();
        Self {
            id: Uuid::new_v4(),
            guild_id,
            channel_id,
            requester_id,
            requester_name: requester_name.into(),
            resolved_search: Arc::clone(&raw_search),
            raw_search,
            kind,
            bundle_id: None,
            retry_count: 0,
            from_history: false,
            history_item_id: None,
            save_to_playlist: None,
        }
    }

    /// True once `resolved_search` carries something the extractor can
    /// fetch directly.
    pub fn is_resolved(&self) -> bool {
        !self.kind.needs_search() || self.resolved_search != self.raw_search
    }
}

/// Where a command came from; stamped onto every media request it spawns.
#[derive(Debug, Clone)]
pub struct RequestOrigin {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub user_display_name: Arc<str>,
}

impl RequestOrigin {
    pub fn media_request(&self, raw_search: impl Into<Arc<str>>, kind: SearchKind) -> MediaRequest {
        MediaRequest::new(
            self.guild_id,
            self.channel_id,
            self.user_id,
            Arc::clone(&self.user_display_name),
            raw_search,
            kind,
        )
    }
}

/// Title/uploader/duration triple attached to cache entries and downloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration_s: Option<i64>,
}

impl MediaMetadata {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("unknown title")
    }
}

/// A realized, on-disk audio artifact ready for one playback.
///
/// `source_path` is the shared content-addressed file owned by the cache;
/// `local_path` is this use's own link to it and is deleted right after
/// playback (or on shutdown). The source outlives the link; deleting one
/// never affects the other.
#[derive(Debug, Clone)]
pub struct MediaDownload {
    pub request: MediaRequest,
    pub url: Arc<str>,
    pub source_path: PathBuf,
    pub local_path: PathBuf,
    pub metadata: MediaMetadata,
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
}

/// Content address of a canonical URL inside the cache directory, the
/// stem of its file name.
pub fn cache_uid(url: &str) -> String {
    format!("media_audio_{}", hex::encode(url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_needs_search() {
        assert!(SearchKind::FreeText.needs_search());
        assert!(SearchKind::StreamingTrack.needs_search());
        assert!(!SearchKind::VideoUrl.needs_search());
        assert!(!SearchKind::VideoPlaylistMember.needs_search());
        assert!(!SearchKind::DirectUrl.needs_search());
    }

    #[test]
    fn test_resolution_tracking() {
        let mut req = MediaRequest::new(1, 2, 3, "tester", "hello world", SearchKind::FreeText);
        assert!(!req.is_resolved());

        req.resolved_search = "https://www.youtube.com/watch?v=abc123".into();
        assert!(req.is_resolved());

        let direct = MediaRequest::new(
            1,
            2,
            3,
            "tester",
            "https://www.youtube.com/watch?v=abc123",
            SearchKind::VideoUrl,
        );
        assert!(direct.is_resolved());
    }

    #[test]
    fn test_cache_uid_is_hex_stable() {
        let uid = cache_uid("https://a/b");
        assert_eq!(uid, format!("media_audio_{}", hex::encode("https://a/b")));
        assert_eq!(uid, cache_uid("https://a/b"));
    }
}
