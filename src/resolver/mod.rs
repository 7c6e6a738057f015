use rand::seq::SliceRandom;

use crate::{
    error::{AppError, AppErrorKind, IntoAppError},
    media::{MediaRequest, RequestOrigin, SearchKind},
};

pub mod streaming;
pub mod video_site;

pub use streaming::{parse_streaming_url, StreamingCatalog, StreamingRef};
pub use video_site::{video_content_type, VideoCatalog, VideoContentType};

/// Output of resolving one play command: a display string for the bundle
/// header and zero or more media requests.
#[derive(Debug)]
pub struct ResolvedPlay {
    pub display: String,
    pub requests: Vec<MediaRequest>,
}

/// Classifies user input and expands it against the catalogs into media
/// requests. Free-text and streaming-track requests still need the search
/// stage afterwards; everything else leaves here with a canonical URL.
pub struct SearchResolver {
    video: VideoCatalog,
    streaming: Option<StreamingCatalog>,
}

impl SearchResolver {
    pub fn new(video: VideoCatalog, streaming: Option<StreamingCatalog>) -> Self {
        Self { video, streaming }
    }

    pub async fn resolve_play(
        &self,
        origin: &RequestOrigin,
        text: &str,
    ) -> Result<ResolvedPlay, AppError> {
        let (core, shuffle, limit) = parse_play_tokens(text);
        if core.is_empty() {
            return Err(AppError::new(
                AppErrorKind::Catalog,
                "nothing to play",
                &[&format!("INPUT: {text}")],
            ));
        }

        let mut resolved = self.classify_and_expand(origin, &core).await?;

        if shuffle {
            resolved.requests.shuffle(&mut rand::thread_rng());
        }
        if let Some(limit) = limit {
            resolved.requests.truncate(limit);
        }

        Ok(resolved)
    }

    async fn classify_and_expand(
        &self,
        origin: &RequestOrigin,
        core: &str,
    ) -> Result<ResolvedPlay, AppError> {
        if let Some(reference) = parse_streaming_url(core) {
            let Some(streaming) = &self.streaming else {
                return Err(AppError::new(
                    AppErrorKind::Catalog,
                    "streaming catalog is not configured",
                    &[&format!("URL: {core}")],
                ));
            };

            let (name, tracks) = streaming.tracks_for(&reference).await.into_app_err(
                "failed to list streaming tracks",
                AppErrorKind::Catalog,
                &[&format!("URL: {core}")],
            )?;

            let requests = tracks
                .into_iter()
                .map(|track| {
                    origin.media_request(track.search_string(), SearchKind::StreamingTrack)
                })
                .collect();
            return Ok(ResolvedPlay {
                display: name,
                requests,
            });
        }

        match video_content_type(core) {
            VideoContentType::Playlist => {
                let urls = self.video.playlist_video_urls(core).await.into_app_err(
                    "failed to expand video playlist",
                    AppErrorKind::Catalog,
                    &[&format!("URL: {core}")],
                )?;

                let requests = urls
                    .into_iter()
                    .map(|url| origin.media_request(url, SearchKind::VideoPlaylistMember))
                    .collect();
                Ok(ResolvedPlay {
                    display: core.to_owned(),
                    requests,
                })
            }
            VideoContentType::Video => Ok(ResolvedPlay {
                display: core.to_owned(),
                requests: vec![origin.media_request(core.to_owned(), SearchKind::VideoUrl)],
            }),
            VideoContentType::Invalid => {
                let kind = if core.starts_with("http://") || core.starts_with("https://") {
                    SearchKind::DirectUrl
                } else {
                    SearchKind::FreeText
                };
                Ok(ResolvedPlay {
                    display: core.to_owned(),
                    requests: vec![origin.media_request(core.to_owned(), kind)],
                })
            }
        }
    }

    /// Second resolution step for free-text and streaming-track requests.
    pub async fn canonical_video_url(&self, query: &str) -> Result<Option<String>, AppError> {
        self.video.search_video(query).await.into_app_err(
            "music search failed",
            AppErrorKind::Catalog,
            &[&format!("QUERY: {query}")],
        )
    }
}

/// Strips the trailing `shuffle` / numeric-limit tokens, which may appear
/// in either order after the query or URL.
fn parse_play_tokens(text: &str) -> (String, bool, Option<usize>) {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    let mut shuffle = false;
    let mut limit = None;

    loop {
        match tokens.last() {
            Some(&"shuffle") if !shuffle => {
                shuffle = true;
                tokens.pop();
            }
            Some(last) if limit.is_none() && last.parse::<usize>().is_ok() => {
                limit = last.parse().ok();
                tokens.pop();
            }
            _ => break,
        }
    }

    (tokens.join(" "), shuffle, limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn origin() -> RequestOrigin {
        RequestOrigin {
            guild_id: 1,
            channel_id: 2,
            user_id: 3,
            user_display_name: "tester".into(),
        }
    }

    fn resolver() -> SearchResolver {
        SearchResolver::new(
            VideoCatalog::new(reqwest::Client::new(), "test-key"),
            None,
        )
    }

    #[test]
    fn test_parse_play_tokens() {
        assert_eq!(
            parse_play_tokens("some song name"),
            ("some song name".to_owned(), false, None)
        );
        assert_eq!(
            parse_play_tokens("https://x playlist shuffle"),
            ("https://x playlist".to_owned(), true, None)
        );
        assert_eq!(
            parse_play_tokens("https://x 5 shuffle"),
            ("https://x".to_owned(), true, Some(5))
        );
        assert_eq!(
            parse_play_tokens("https://x shuffle 5"),
            ("https://x".to_owned(), true, Some(5))
        );
    }

    #[actix_rt::test]
    async fn test_video_url_resolves_without_search_stage() {
        let url = "https://www.youtube.com/watch?v=HYd9B6YvIHM";
        let resolved = resolver().resolve_play(&origin(), url).await.unwrap();

        assert_eq!(resolved.requests.len(), 1);
        let request = &resolved.requests[0];
        assert_eq!(request.kind, SearchKind::VideoUrl);
        assert_eq!(request.raw_search.as_ref(), url);
        assert_eq!(request.resolved_search.as_ref(), url);
        assert!(request.is_resolved());
    }

    #[actix_rt::test]
    async fn test_free_text_needs_search_stage() {
        let resolved = resolver()
            .resolve_play(&origin(), "hello world")
            .await
            .unwrap();

        assert_eq!(resolved.requests.len(), 1);
        let request = &resolved.requests[0];
        assert_eq!(request.kind, SearchKind::FreeText);
        assert!(!request.is_resolved());
    }

    #[actix_rt::test]
    async fn test_direct_url_is_classified() {
        let resolved = resolver()
            .resolve_play(&origin(), "https://files.example.com/audio.mp3")
            .await
            .unwrap();

        assert_eq!(resolved.requests[0].kind, SearchKind::DirectUrl);
    }

    #[actix_rt::test]
    async fn test_streaming_url_without_catalog_errors() {
        let result = resolver()
            .resolve_play(
                &origin(),
                "https://open.spotify.com/album/6akEvsycLGftJxYudPjmqK",
            )
            .await;

        assert!(result.is_err());
    }

    #[actix_rt::test]
    async fn test_empty_input_is_rejected() {
        assert!(resolver().resolve_play(&origin(), "  ").await.is_err());
        // "shuffle" alone leaves no query
        assert!(resolver().resolve_play(&origin(), "shuffle").await.is_err());
    }
}
