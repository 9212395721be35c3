//! Subtitle provider adapters.
//!
//! Every external source implements [`SubtitleProvider`] and normalizes its
//! results into [`SubtitleCandidate`]. Candidates carry a provider-prefixed
//! `file_id` so a later download request can be routed back to the owning
//! adapter without any shared lookup state.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;

pub mod archive;
pub mod language;
pub mod opensubtitles;
pub mod request_client;
pub mod subdl;
pub mod subsource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenSubtitles,
    Subdl,
    SubSource,
}

impl ProviderKind {
    /// Stable tag used as the `file_id` prefix.
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderKind::OpenSubtitles => "os",
            ProviderKind::Subdl => "subdl",
            ProviderKind::SubSource => "subsource",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "os" => Some(ProviderKind::OpenSubtitles),
            "subdl" => Some(ProviderKind::Subdl),
            "subsource" => Some(ProviderKind::SubSource),
            _ => None,
        }
    }

    pub fn file_id(&self, raw_id: impl std::fmt::Display) -> String {
        format!("{}:{}", self.tag(), raw_id)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Splits a provider-prefixed file id into its owning provider and the
/// provider-private remainder.
pub fn split_file_id(file_id: &str) -> Option<(ProviderKind, &str)> {
    let (tag, rest) = file_id.split_once(':')?;
    Some((ProviderKind::from_tag(tag)?, rest))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EpisodeRange {
    pub first: u16,
    pub last: u16,
}

impl EpisodeRange {
    pub fn contains(&self, episode: u16) -> bool {
        (self.first..=self.last).contains(&episode)
    }
}

/// Picks an `E01-E10` style range out of a season pack release name.
pub fn episode_range_from_name(name: &str) -> Option<EpisodeRange> {
    let lowered = name.to_lowercase();
    let bytes = lowered.as_bytes();
    for (i, window) in bytes.windows(2).enumerate() {
        if window[0] != b'e' || !window[1].is_ascii_digit() {
            continue;
        }
        let first_digits: String = lowered[i + 1..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let rest = &lowered[i + 1 + first_digits.len()..];
        let Some(rest) = rest.strip_prefix('-') else {
            continue;
        };
        let rest = rest.strip_prefix('e').unwrap_or(rest);
        let last_digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if last_digits.is_empty() {
            continue;
        }
        let (Ok(first), Ok(last)) = (first_digits.parse(), last_digits.parse()) else {
            continue;
        };
        if first < last {
            return Some(EpisodeRange { first, last });
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitleCandidate {
    pub file_id: String,
    /// Language tag as the provider reported it.
    pub language: String,
    /// Normalized ISO-639-2/B code. Candidates that cannot be normalized
    /// never leave the provider adapter.
    pub language_code: String,
    pub release_name: String,
    pub downloads: u64,
    pub rating: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<OffsetDateTime>,
    pub provider: ProviderKind,
    pub hearing_impaired: bool,
    pub foreign_parts_only: bool,
    pub machine_translated: bool,
    /// Set when the artifact covers multiple episodes of a season.
    pub is_season_pack: bool,
    /// Episode range of a season pack, when the provider declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_range: Option<EpisodeRange>,
    /// Filled in by the ranker, only meaningful within one search response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_score: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Episode,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Episode => "episode",
        }
    }
}

impl FromStr for MediaType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movie" => Ok(MediaType::Movie),
            "episode" | "series" => Ok(MediaType::Episode),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    pub imdb_id: String,
    pub media_type: MediaType,
    pub season: Option<u16>,
    pub episode: Option<u16>,
    /// Normalized ISO-639-2/B codes.
    pub languages: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rejected credentials")]
    Auth,
    #[error("subtitle not found")]
    NotFound,
    #[error("provider rate limited the request")]
    RateLimited,
    #[error("provider unavailable")]
    Unavailable,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected provider payload: {0}")]
    InvalidPayload(String),
}

impl ProviderError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited | ProviderError::Unavailable | ProviderError::Transport(_)
        )
    }

    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 | 403 => Some(ProviderError::Auth),
            404 => Some(ProviderError::NotFound),
            429 => Some(ProviderError::RateLimited),
            502 | 503 | 504 => Some(ProviderError::Unavailable),
            other => Some(ProviderError::Transport(format!("status {other}"))),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if let Some(mapped) = ProviderError::from_status(status.as_u16()) {
                return mapped;
            }
        }
        ProviderError::Transport(err.to_string())
    }
}

#[async_trait::async_trait]
pub trait SubtitleProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Searches the provider. Transport failures are surfaced as errors
    /// here; the aggregator degrades them to an empty contribution.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SubtitleCandidate>, ProviderError>;

    /// Downloads and decodes one subtitle. `file_id` is the provider-private
    /// remainder, without the routing prefix. Unusable payloads come back as
    /// [`archive::DecodedDownload::Rejected`] sentinel cues, not errors.
    async fn download(&self, file_id: &str) -> Result<archive::DecodedDownload, ProviderError>;
}

/// Providers registered at startup, addressed by the `file_id` prefix.
pub struct ProviderRegistry {
    providers: Vec<&'static (dyn SubtitleProvider)>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<&'static (dyn SubtitleProvider)>) -> Self {
        Self { providers }
    }

    pub fn all(&self) -> &[&'static (dyn SubtitleProvider)] {
        &self.providers
    }

    pub fn by_kind(&self, kind: ProviderKind) -> Option<&'static (dyn SubtitleProvider)> {
        self.providers.iter().copied().find(|p| p.kind() == kind)
    }

    /// Routes a prefixed file id to its owning provider and downloads it.
    pub async fn download(&self, file_id: &str) -> Result<archive::DecodedDownload, ProviderError> {
        let (kind, raw_id) = split_file_id(file_id).ok_or_else(|| {
            ProviderError::InvalidPayload(format!("malformed file id: {file_id}"))
        })?;
        let provider = self
            .by_kind(kind)
            .ok_or_else(|| ProviderError::InvalidPayload(format!("provider {kind} not enabled")))?;
        provider.download(raw_id).await
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<_> = self.providers.iter().map(|p| p.kind().tag()).collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &kinds)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

/// Search calls retry more aggressively than downloads: a lost search
/// degrades the whole listing while a lost download is user-retryable.
pub const SEARCH_RETRY: RetryPolicy = RetryPolicy {
    attempts: 3,
    base_delay: Duration::from_millis(500),
};

pub const DOWNLOAD_RETRY: RetryPolicy = RetryPolicy {
    attempts: 2,
    base_delay: Duration::from_millis(1000),
};

/// Runs `op` with exponential backoff and jitter on retryable provider
/// errors (429, 5xx, transport).
pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() && attempt + 1 < policy.attempts => {
                let backoff = policy.base_delay * 2u32.pow(attempt);
                let jitter = Duration::from_millis(rand::rng().random_range(0..250));
                tracing::debug!(
                    op = op_name,
                    attempt,
                    delay = ?(backoff + jitter),
                    "Retrying provider call: {err}"
                );
                tokio::time::sleep(backoff + jitter).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_round_trip() {
        let id = ProviderKind::OpenSubtitles.file_id(123456);
        assert_eq!(id, "os:123456");
        assert_eq!(
            split_file_id(&id),
            Some((ProviderKind::OpenSubtitles, "123456"))
        );
        assert_eq!(split_file_id("unknown:1"), None);
        assert_eq!(split_file_id("no-prefix"), None);
    }

    #[test]
    fn episode_ranges() {
        assert_eq!(
            episode_range_from_name("Show.S01E01-E10.1080p.WEB"),
            Some(EpisodeRange { first: 1, last: 10 })
        );
        assert_eq!(
            episode_range_from_name("Show.S01.E03-12.Complete"),
            Some(EpisodeRange { first: 3, last: 12 })
        );
        assert_eq!(episode_range_from_name("Show.S01E05.WEB-DL"), None);
        assert_eq!(episode_range_from_name("Show Season 1"), None);
        assert!(EpisodeRange { first: 1, last: 10 }.contains(5));
        assert!(!EpisodeRange { first: 1, last: 10 }.contains(11));
    }

    #[test]
    fn media_type_parsing() {
        assert_eq!(MediaType::from_str("movie"), Ok(MediaType::Movie));
        assert_eq!(MediaType::from_str("series"), Ok(MediaType::Episode));
        assert_eq!(MediaType::from_str("episode"), Ok(MediaType::Episode));
        assert!(MediaType::from_str("channel").is_err());
    }

    #[tokio::test]
    async fn retries_stop_on_terminal_errors() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(SEARCH_RETRY, "test", || {
            calls += 1;
            async { Err(ProviderError::Auth) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Auth)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retries_exhaust_on_retryable_errors() {
        let fast = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result: Result<(), _> = with_retries(fast, "test", || {
            calls += 1;
            async { Err(ProviderError::RateLimited) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::RateLimited)));
        assert_eq!(calls, 3);
    }
}
