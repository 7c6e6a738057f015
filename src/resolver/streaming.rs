use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use serde::Deserialize;
use tokio::sync::Mutex;

const ACCOUNTS_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";
const TRACK_PAGE_SIZE: u32 = 50;
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(30);

/// A recognized streaming-platform URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingRef {
    Track(String),
    Album(String),
    Playlist(String),
}

pub fn parse_streaming_url(url: &str) -> Option<StreamingRef> {
    let rest = url.strip_prefix("https://open.spotify.com/")?;
    let (kind, rest) = rest.split_once('/')?;
    let id = rest.split(['?', '/']).next()?;
    if id.is_empty() {
        return None;
    }

    match kind {
        "track" => Some(StreamingRef::Track(id.to_owned())),
        "album" => Some(StreamingRef::Album(id.to_owned())),
        "playlist" => Some(StreamingRef::Playlist(id.to_owned())),
        _ => None,
    }
}

/// One catalog track, rendered as the "<artist> <title>" search string the
/// search stage later resolves to a canonical video URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingTrack {
    pub artist: String,
    pub title: String,
}

impl StreamingTrack {
    pub fn search_string(&self) -> String {
        format!("{} {}", self.artist, self.title)
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Streaming-platform catalog client with client-credentials auth. The
/// access token is cached until shortly before expiry.
pub struct StreamingCatalog {
    client: reqwest::Client,
    client_id: Arc<str>,
    client_secret: Arc<str>,
    token: Mutex<Option<CachedToken>>,
}

impl StreamingCatalog {
    pub fn new(
        client: reqwest::Client,
        client_id: impl Into<Arc<str>>,
        client_secret: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        }
    }

    async fn token(&self) -> anyhow::Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        #[derive(Debug, Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let resp_text = self
            .client
            .post(ACCOUNTS_TOKEN_URL)
            .basic_auth(self.client_id.as_ref(), Some(self.client_secret.as_ref()))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?
            .text()
            .await?;

        let token: TokenResponse = serde_json::from_str(&resp_text)?;
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in)
                - TOKEN_EXPIRY_SLACK,
        });

        Ok(value)
    }

    /// Resolves a streaming reference into its display name and track
    /// list; a single track yields a one-element list.
    pub async fn tracks_for(
        &self,
        reference: &StreamingRef,
    ) -> anyhow::Result<(String, Vec<StreamingTrack>)> {
        match reference {
            StreamingRef::Track(id) => self.track(id).await,
            StreamingRef::Album(id) => self.album_tracks(id).await,
            StreamingRef::Playlist(id) => self.playlist_tracks(id).await,
        }
    }

    async fn track(&self, id: &str) -> anyhow::Result<(String, Vec<StreamingTrack>)> {
        #[derive(Debug, Deserialize)]
        struct Track {
            name: String,
            artists: Vec<Artist>,
        }

        #[derive(Debug, Deserialize)]
        struct Artist {
            name: String,
        }

        let token = self.token().await?;
        let resp_text = self
            .client
            .get(format!("{API_BASE}/tracks/{id}"))
            .bearer_auth(&token)
            .send()
            .await?
            .text()
            .await?;

        let track: Track = serde_json::from_str(&resp_text)?;
        let artist = track
            .artists
            .into_iter()
            .next()
            .map(|a| a.name)
            .unwrap_or_default();

        let display = track.name.clone();
        Ok((
            display,
            vec![StreamingTrack {
                artist,
                title: track.name,
            }],
        ))
    }

    async fn album_tracks(&self, id: &str) -> anyhow::Result<(String, Vec<StreamingTrack>)> {
        #[derive(Debug, Deserialize)]
        struct Album {
            name: String,
            tracks: AlbumTracks,
        }

        #[derive(Debug, Deserialize)]
        struct AlbumTracks {
            items: Vec<AlbumTrack>,
        }

        #[derive(Debug, Deserialize)]
        struct AlbumTrack {
            name: String,
            artists: Vec<Artist>,
        }

        #[derive(Debug, Deserialize)]
        struct Artist {
            name: String,
        }

        let token = self.token().await?;
        let resp_text = self
            .client
            .get(format!("{API_BASE}/albums/{id}"))
            .query(&[("limit", TRACK_PAGE_SIZE.to_string())])
            .bearer_auth(&token)
            .send()
            .await?
            .text()
            .await?;

        let album: Album = serde_json::from_str(&resp_text)?;
        let tracks = album
            .tracks
            .items
            .into_iter()
            .map(|track| StreamingTrack {
                artist: track
                    .artists
                    .into_iter()
                    .next()
                    .map(|a| a.name)
                    .unwrap_or_default(),
                title: track.name,
            })
            .collect();

        Ok((album.name, tracks))
    }

    async fn playlist_tracks(&self, id: &str) -> anyhow::Result<(String, Vec<StreamingTrack>)> {
        #[derive(Debug, Deserialize)]
        struct Playlist {
            name: String,
            tracks: PlaylistTracks,
        }

        #[derive(Debug, Deserialize)]
        struct PlaylistTracks {
            items: Vec<PlaylistEntry>,
        }

        #[derive(Debug, Deserialize)]
        struct PlaylistEntry {
            track: Option<PlaylistTrack>,
        }

        #[derive(Debug, Deserialize)]
        struct PlaylistTrack {
            name: String,
            artists: Vec<Artist>,
        }

        #[derive(Debug, Deserialize)]
        struct Artist {
            name: String,
        }

        let token = self.token().await?;
        let resp_text = self
            .client
            .get(format!("{API_BASE}/playlists/{id}"))
            .query(&[("limit", TRACK_PAGE_SIZE.to_string())])
            .bearer_auth(&token)
            .send()
            .await?
            .text()
            .await?;

        let playlist: Playlist = serde_json::from_str(&resp_text)?;
        let tracks: Vec<StreamingTrack> = playlist
            .tracks
            .items
            .into_iter()
            .filter_map(|entry| entry.track)
            .map(|track| StreamingTrack {
                artist: track
                    .artists
                    .into_iter()
                    .next()
                    .map(|a| a.name)
                    .unwrap_or_default(),
                title: track.name,
            })
            .collect();

        if tracks.is_empty() {
            return Err(anyhow!("playlist {id} has no playable tracks"));
        }

        Ok((playlist.name, tracks))
    }
}
