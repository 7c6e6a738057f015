use std::sync::Arc;

use anyhow::anyhow;
use serde::Deserialize;

use crate::media::MediaMetadata;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const WATCH_BASE: &str = "https://www.youtube.com/watch?v=";
const PLAYLIST_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoContentType {
    Video,
    Playlist,
    Invalid,
}

pub fn video_content_type<'a>(value: impl Into<&'a str>) -> VideoContentType {
    let value = value.into();

    match value {
        s if s.starts_with("https://www.youtube.com/watch?v=") => VideoContentType::Video,
        s if s.starts_with("https://youtu.be/") => VideoContentType::Video,
        s if s.starts_with("https://www.youtube.com/playlist?list=") => {
            VideoContentType::Playlist
        }
        _ => VideoContentType::Invalid,
    }
}

/// Data-API client of the video site: playlist expansion, single-video
/// metadata, and free-text search.
pub struct VideoCatalog {
    client: reqwest::Client,
    api_key: Arc<str>,
}

impl VideoCatalog {
    pub fn new(client: reqwest::Client, api_key: impl Into<Arc<str>>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }

    /// Canonical watch URLs of every video in a playlist, in playlist
    /// order.
    pub async fn playlist_video_urls(&self, url: &str) -> anyhow::Result<Vec<String>> {
        let Some(playlist_id) = extract_playlist_id(url) else {
            log::error!("failed to extract playlist id from url {url}");
            return Err(anyhow!("not a playlist url: {url}"));
        };

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PlaylistItems {
            items: Vec<PlaylistItem>,
            next_page_token: Option<String>,
        }

        #[derive(Debug, Deserialize)]
        struct PlaylistItem {
            snippet: PlaylistItemSnippet,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PlaylistItemSnippet {
            resource_id: PlaylistItemResourceId,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PlaylistItemResourceId {
            video_id: String,
        }

        let mut urls = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("part".to_owned(), "snippet".to_owned()),
                ("playlistId".to_owned(), playlist_id.to_owned()),
                ("maxResults".to_owned(), PLAYLIST_PAGE_SIZE.to_string()),
                ("key".to_owned(), self.api_key.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken".to_owned(), token.clone()));
            }

            let resp_text = self
                .client
                .get(format!("{API_BASE}/playlistItems"))
                .query(&query)
                .send()
                .await?
                .text()
                .await?;

            let page: PlaylistItems = serde_json::from_str(&resp_text)?;
            urls.extend(page.items.into_iter().map(|item| {
                format!("{WATCH_BASE}{id}", id = item.snippet.resource_id.video_id)
            }));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(urls)
    }

    pub async fn video_metadata(&self, url: &str) -> anyhow::Result<MediaMetadata> {
        let Some(watch_id) = extract_watch_id(url) else {
            log::error!("failed to extract watch id from url {url}");
            return Err(anyhow!("not a video url: {url}"));
        };

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VideoItems {
            items: Vec<VideoItem>,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VideoItem {
            snippet: VideoSnippet,
            content_details: VideoContentDetails,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VideoSnippet {
            title: String,
            channel_title: String,
        }

        #[derive(Debug, Deserialize)]
        struct VideoContentDetails {
            duration: String,
        }

        let resp_text = self
            .client
            .get(format!("{API_BASE}/videos"))
            .query(&[
                ("part", "snippet,contentDetails"),
                ("id", watch_id),
                ("key", self.api_key.as_ref()),
            ])
            .send()
            .await?
            .text()
            .await?;

        let videos: VideoItems = serde_json::from_str(&resp_text)?;
        let Some(video) = videos.items.into_iter().next() else {
            return Err(anyhow!("no video found for id {watch_id}"));
        };

        Ok(MediaMetadata {
            title: Some(video.snippet.title),
            uploader: Some(video.snippet.channel_title),
            duration_s: parse_iso8601_duration_s(&video.content_details.duration),
        })
    }

    /// First search result for a free-text query as a canonical watch URL.
    pub async fn search_video(&self, query: &str) -> anyhow::Result<Option<String>> {
        #[derive(Debug, Deserialize)]
        struct SearchItems {
            items: Vec<SearchItem>,
        }

        #[derive(Debug, Deserialize)]
        struct SearchItem {
            id: SearchItemId,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SearchItemId {
            video_id: Option<String>,
        }

        let resp_text = self
            .client
            .get(format!("{API_BASE}/search"))
            .query(&[
                ("part", "snippet"),
                ("type", "video"),
                ("maxResults", "1"),
                ("q", query),
                ("key", self.api_key.as_ref()),
            ])
            .send()
            .await?
            .text()
            .await?;

        let results: SearchItems = serde_json::from_str(&resp_text)?;
        Ok(results
            .items
            .into_iter()
            .filter_map(|item| item.id.video_id)
            .next()
            .map(|id| format!("{WATCH_BASE}{id}")))
    }
}

fn extract_playlist_id(url: &str) -> Option<&str> {
    url.split_once("playlist?list=")
        .map(|s| s.1)
        .map(|id| id.split('&').next().unwrap_or(id))
}

fn extract_watch_id(url: &str) -> Option<&str> {
    if let Some((_, rest)) = url.split_once("watch?v=") {
        return Some(rest.split('&').next().unwrap_or(rest));
    }
    if let Some((_, rest)) = url.split_once("youtu.be/") {
        return Some(rest.split(['?', '&']).next().unwrap_or(rest));
    }
    None
}

/// ISO-8601 durations ("PT4M13S") rewritten into the unit-suffixed form
/// `parse_duration` understands.
fn parse_iso8601_duration_s(duration: &str) -> Option<i64> {
    let normalized = duration
        .trim_start_matches('P')
        .trim_start_matches('T')
        .replace('T', "")
        .to_lowercase();

    match parse_duration::parse(&normalized) {
        Ok(parsed) => Some(parsed.as_secs() as i64),
        Err(err) => {
            log::error!("failed to parse duration {duration}, ERROR: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_video_content_type() {
        assert_eq!(
            video_content_type("https://www.youtube.com/watch?v=HYd9B6YvIHM"),
            VideoContentType::Video
        );

        assert_eq!(
            video_content_type("https://youtu.be/HYd9B6YvIHM"),
            VideoContentType::Video
        );

        assert_eq!(
            video_content_type(
                "https://www.youtube.com/playlist?list=PLGK-2zLAFymBMRyVJCmS2jg8x-P2I4Y-J"
            ),
            VideoContentType::Playlist
        );

        assert_eq!(
            video_content_type("https://www.yt.com/watch?v=HYd9B6YvIHM"),
            VideoContentType::Invalid
        );

        assert_eq!(
            video_content_type("some free text"),
            VideoContentType::Invalid
        );
    }

    #[test]
    fn test_extract_watch_id_strips_trailing_params() {
        assert_eq!(
            extract_watch_id("https://www.youtube.com/watch?v=JogLvpzvn4Q&list=PLx&index=2"),
            Some("JogLvpzvn4Q")
        );
        assert_eq!(
            extract_watch_id("https://youtu.be/JogLvpzvn4Q?t=17"),
            Some("JogLvpzvn4Q")
        );
        assert_eq!(extract_watch_id("https://example.com/thing"), None);
    }

    #[test]
    fn test_extract_playlist_id() {
        assert_eq!(
            extract_playlist_id("https://www.youtube.com/playlist?list=PLabc&feature=share"),
            Some("PLabc")
        );
        assert_eq!(
            extract_playlist_id("https://www.youtube.com/watch?v=x"),
            None
        );
    }

    #[test]
    fn test_parse_iso8601_duration() {
        assert_eq!(parse_iso8601_duration_s("PT4M13S"), Some(253));
        assert_eq!(parse_iso8601_duration_s("PT1H2M3S"), Some(3723));
        assert_eq!(parse_iso8601_duration_s("PT45S"), Some(45));
        assert_eq!(parse_iso8601_duration_s("garbage"), None);
    }
}
