use std::{path::PathBuf, process::Stdio, time::Duration};

use serde::Deserialize;
use tokio::process::Command;
use uuid::Uuid;

use crate::{config::ExtractorConfig, media::MediaMetadata};

const EXTRACTOR_BIN: &str = "yt-dlp";
const POST_PROCESSOR_BIN: &str = "ffmpeg";
const AUDIO_FORMAT: &str = "mp3";

/// Loudness target plus leading/trailing silence trim, applied in one
/// filter pass.
const POST_PROCESS_FILTER: &str = "loudnorm=I=-16:TP=-1.5:LRA=11,\
    silenceremove=start_periods=1:start_threshold=-50dB,areverse,\
    silenceremove=start_periods=1:start_threshold=-50dB,areverse";

/// Transient failure classes; these feed the backoff tracker and the
/// request is retried until its budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableKind {
    Timeout,
    Transport,
    Throttled,
    Unknown,
}

/// Content-class failures; retrying can never succeed, so the cache
/// remembers them as sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    AgeRestricted,
    Private,
    Unavailable,
    InvalidFormat,
    TooLong,
}

impl TerminalKind {
    /// Stable name stored in the cache's `failure_kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgeRestricted => "age_restricted",
            Self::Private => "private",
            Self::Unavailable => "unavailable",
            Self::InvalidFormat => "invalid_format",
            Self::TooLong => "too_long",
        }
    }
}

#[derive(Debug, Clone)]
pub enum DownloadError {
    Retryable {
        kind: RetryableKind,
        message: String,
    },
    Terminal {
        kind: TerminalKind,
        message: String,
    },
}

impl DownloadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Short reason for the bundle row.
    pub fn user_reason(&self) -> String {
        match self {
            Self::Retryable { kind, .. } => match kind {
                RetryableKind::Timeout => "download timed out".to_owned(),
                RetryableKind::Transport => "network error".to_owned(),
                RetryableKind::Throttled => "source is throttling".to_owned(),
                RetryableKind::Unknown => "download failed".to_owned(),
            },
            Self::Terminal { kind, .. } => match kind {
                TerminalKind::AgeRestricted => "age-restricted".to_owned(),
                TerminalKind::Private => "private or inaccessible".to_owned(),
                TerminalKind::Unavailable => "video unavailable".to_owned(),
                TerminalKind::InvalidFormat => "no usable audio format".to_owned(),
                TerminalKind::TooLong => "exceeds the length limit".to_owned(),
            },
        }
    }
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable { kind, message } => {
                write!(f, "retryable download failure ({kind:?}): {message}")
            }
            Self::Terminal { kind, message } => {
                write!(f, "terminal download failure ({kind:?}): {message}")
            }
        }
    }
}

impl std::error::Error for DownloadError {}

/// A finished extraction: the audio file (post-processed when enabled)
/// and the metadata the extractor reported.
#[derive(Debug, Clone)]
pub struct ExtractedAudio {
    pub path: PathBuf,
    pub metadata: MediaMetadata,
}

/// Wraps the external audio extractor and normalizes its error surface.
///
/// Safe for concurrent calls on distinct URLs, but the download loop runs
/// exactly one extraction at a time; the extractor binary is effectively
/// single-threaded per process.
pub struct Downloader {
    config: ExtractorConfig,
    tmp_dir: PathBuf,
}

impl Downloader {
    pub fn new(config: ExtractorConfig, tmp_dir: PathBuf) -> Self {
        Self { config, tmp_dir }
    }

    pub async fn download(&self, url: &str) -> Result<ExtractedAudio, DownloadError> {
        if let Err(err) = tokio::fs::create_dir_all(&self.tmp_dir).await {
            return Err(DownloadError::Retryable {
                kind: RetryableKind::Unknown,
                message: format!("failed to create scratch directory: {err}"),
            });
        }

        let stem = Uuid::new_v4().to_string();
        let template = self.tmp_dir.join(format!("{stem}.%(ext)s"));
        let out_path = self.tmp_dir.join(format!("{stem}.{AUDIO_FORMAT}"));

        let binary = self
            .config
            .binary_path
            .clone()
            .unwrap_or_else(|| EXTRACTOR_BIN.into());
        let mut command = Command::new(binary);
        command
            .arg("-f")
            .arg("bestaudio")
            .arg("-x")
            .arg("--audio-format")
            .arg(AUDIO_FORMAT)
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--print-json")
            .arg("-o")
            .arg(&template)
            .args(&self.config.extra_options)
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::info!("download started, URL: {url}");
        let timeout = Duration::from_secs(self.config.timeout_s);
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(DownloadError::Retryable {
                    kind: RetryableKind::Unknown,
                    message: format!("failed to spawn extractor: {err}"),
                });
            }
            Err(_) => {
                return Err(DownloadError::Retryable {
                    kind: RetryableKind::Timeout,
                    message: format!("extractor exceeded {}s", self.config.timeout_s),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_extractor_failure(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let metadata = parse_extractor_metadata(&stdout);

        if let Some(duration_s) = metadata.duration_s {
            if duration_s > self.config.max_duration_s as i64 {
                let _ = tokio::fs::remove_file(&out_path).await;
                return Err(DownloadError::Terminal {
                    kind: TerminalKind::TooLong,
                    message: format!(
                        "duration {duration_s}s exceeds limit {}s",
                        self.config.max_duration_s
                    ),
                });
            }
        }

        if !tokio::fs::try_exists(&out_path).await.unwrap_or(false) {
            return Err(DownloadError::Retryable {
                kind: RetryableKind::Unknown,
                message: format!("extractor produced no file at {}", out_path.display()),
            });
        }

        let path = if self.config.enable_post_processing {
            self.post_process(&out_path).await
        } else {
            out_path
        };

        Ok(ExtractedAudio { path, metadata })
    }

    /// Loudness normalization and edge-silence trim. A post-processing
    /// failure falls back to the raw download.
    async fn post_process(&self, raw: &PathBuf) -> PathBuf {
        let processed = raw.with_extension(format!("norm.{AUDIO_FORMAT}"));

        let result = Command::new(POST_PROCESSOR_BIN)
            .arg("-y")
            .arg("-i")
            .arg(raw)
            .arg("-af")
            .arg(POST_PROCESS_FILTER)
            .arg(&processed)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                let _ = tokio::fs::remove_file(raw).await;
                processed
            }
            Ok(output) => {
                log::error!(
                    "post-processing failed, using raw audio, ERROR: {stderr}",
                    stderr = String::from_utf8_lossy(&output.stderr)
                );
                raw.clone()
            }
            Err(err) => {
                log::error!("failed to spawn post-processor, using raw audio, ERROR: {err}");
                raw.clone()
            }
        }
    }
}

fn parse_extractor_metadata(stdout: &str) -> MediaMetadata {
    #[derive(Debug, Deserialize)]
    struct ExtractorInfo {
        title: Option<String>,
        uploader: Option<String>,
        channel: Option<String>,
        duration: Option<f64>,
    }

    let Some(line) = stdout.lines().find(|line| line.starts_with('{')) else {
        log::error!("extractor emitted no metadata line");
        return MediaMetadata::default();
    };

    match serde_json::from_str::<ExtractorInfo>(line) {
        Ok(info) => MediaMetadata {
            title: info.title,
            uploader: info.uploader.or(info.channel),
            duration_s: info.duration.map(|d| d as i64),
        },
        Err(err) => {
            log::error!("failed to parse extractor metadata, ERROR: {err}");
            MediaMetadata::default()
        }
    }
}

/// Maps the extractor's stderr onto the retryable/terminal taxonomy.
/// Unrecognized failures count as retryable so a flaky network never
/// poisons a URL permanently.
pub fn classify_extractor_failure(stderr: &str) -> DownloadError {
    let lowered = stderr.to_lowercase();
    let message = stderr.trim().to_owned();

    let terminal = [
        (
            TerminalKind::AgeRestricted,
            &["sign in to confirm your age", "age-restricted", "age restricted"][..],
        ),
        (
            TerminalKind::Private,
            &["private video", "this video is private", "members-only"][..],
        ),
        (
            TerminalKind::Unavailable,
            &[
                "video unavailable",
                "has been removed",
                "account associated with this video has been terminated",
                "no longer available",
            ][..],
        ),
        (
            TerminalKind::InvalidFormat,
            &["requested format is not available", "unsupported url"][..],
        ),
    ];
    for (kind, needles) in terminal {
        if needles.iter().any(|needle| lowered.contains(needle)) {
            return DownloadError::Terminal { kind, message };
        }
    }

    let retryable = [
        (
            RetryableKind::Throttled,
            &[
                "http error 429",
                "too many requests",
                "sign in to confirm you're not a bot",
                "rate-limited",
            ][..],
        ),
        (
            RetryableKind::Timeout,
            &["timed out", "timeout"][..],
        ),
        (
            RetryableKind::Transport,
            &[
                "connection reset",
                "connection refused",
                "network is unreachable",
                "ssl",
                "tls",
                "temporary failure in name resolution",
            ][..],
        ),
    ];
    for (kind, needles) in retryable {
        if needles.iter().any(|needle| lowered.contains(needle)) {
            return DownloadError::Retryable { kind, message };
        }
    }

    DownloadError::Retryable {
        kind: RetryableKind::Unknown,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classify(stderr: &str) -> DownloadError {
        classify_extractor_failure(stderr)
    }

    #[test]
    fn test_terminal_classification() {
        let cases = [
            (
                "ERROR: Sign in to confirm your age. This video may be inappropriate.",
                TerminalKind::AgeRestricted,
            ),
            ("ERROR: Private video. Sign in.", TerminalKind::Private),
            ("ERROR: Video unavailable", TerminalKind::Unavailable),
            (
                "ERROR: This video has been removed by the uploader",
                TerminalKind::Unavailable,
            ),
            (
                "ERROR: requested format is not available",
                TerminalKind::InvalidFormat,
            ),
        ];

        for (stderr, expected) in cases {
            match classify(stderr) {
                DownloadError::Terminal { kind, .. } => assert_eq!(kind, expected),
                other => panic!("expected terminal for {stderr:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_retryable_classification() {
        let cases = [
            ("ERROR: HTTP Error 429: Too Many Requests", RetryableKind::Throttled),
            (
                "ERROR: Sign in to confirm you're not a bot",
                RetryableKind::Throttled,
            ),
            ("ERROR: The read operation timed out", RetryableKind::Timeout),
            (
                "ERROR: [Errno 104] Connection reset by peer",
                RetryableKind::Transport,
            ),
            ("ERROR: SSL: UNEXPECTED_EOF_WHILE_READING", RetryableKind::Transport),
            ("ERROR: something nobody has seen before", RetryableKind::Unknown),
        ];

        for (stderr, expected) in cases {
            match classify(stderr) {
                DownloadError::Retryable { kind, .. } => assert_eq!(kind, expected),
                other => panic!("expected retryable for {stderr:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_metadata_parsing() {
        let stdout = r#"{"title": "A Song", "uploader": "An Artist", "duration": 253.4}"#;
        let metadata = parse_extractor_metadata(stdout);
        assert_eq!(metadata.title.as_deref(), Some("A Song"));
        assert_eq!(metadata.uploader.as_deref(), Some("An Artist"));
        assert_eq!(metadata.duration_s, Some(253));
    }

    #[test]
    fn test_metadata_parsing_falls_back_to_channel() {
        let stdout = r#"{"title": "A Song", "channel": "A Channel", "duration": 10}"#;
        let metadata = parse_extractor_metadata(stdout);
        assert_eq!(metadata.uploader.as_deref(), Some("A Channel"));
    }

    #[test]
    fn test_metadata_parsing_tolerates_garbage() {
        assert_eq!(parse_extractor_metadata("not json"), MediaMetadata::default());
        assert_eq!(parse_extractor_metadata(""), MediaMetadata::default());
    }

    #[test]
    fn test_user_reason_is_short() {
        let err = classify("ERROR: Video unavailable");
        assert_eq!(err.user_reason(), "video unavailable");
        assert!(!err.is_retryable());
    }
}
