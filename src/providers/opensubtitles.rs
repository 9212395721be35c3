//! OpenSubtitles REST API (v1) adapter.
//!
//! Runs with an API key when one is configured and falls back to anonymous
//! access (shared download quota) otherwise.

use std::time::Duration;

use reqwest::{Client, Url};
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config;

use super::{
    DOWNLOAD_RETRY, ProviderError, ProviderKind, SEARCH_RETRY, SearchQuery, SubtitleCandidate,
    SubtitleProvider, archive, language, request_client::LimitedRequestClient, with_retries,
};

const USER_AGENT: &str = concat!("subtitle-server v", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub struct OpenSubtitlesApi {
    client: LimitedRequestClient,
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl OpenSubtitlesApi {
    pub fn new(http: Client, api_key: Option<String>) -> Self {
        let client = LimitedRequestClient::new(http.clone(), 4, Duration::from_secs(1));
        let base_url = Url::parse("https://api.opensubtitles.com/api/v1/").unwrap();
        Self {
            client,
            http,
            base_url,
            api_key,
        }
    }

    fn request(
        &self,
        builder: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Request, ProviderError> {
        let mut builder = builder
            .header("User-Agent", USER_AGENT)
            .timeout(timeout);
        if let Some(key) = &self.api_key {
            builder = builder.header("Api-Key", key);
        }
        builder
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }

    async fn search_page(&self, query: &SearchQuery) -> Result<SearchResponse, ProviderError> {
        let timeout = Duration::from_secs(config::CONFIG.get_value::<config::SearchTimeoutSecs>().0);
        let mut url = self.base_url.join("subtitles").unwrap();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("imdb_id", query.imdb_id.trim_start_matches("tt"));
            // the API wants its language list sorted
            let mut tags: Vec<&str> = query
                .languages
                .iter()
                .filter_map(|code| language::to_opensubtitles_tag(code))
                .collect();
            tags.sort_unstable();
            tags.dedup();
            pairs.append_pair("languages", &tags.join(","));
            pairs.append_pair("type", query.media_type.as_str());
            if let Some(season) = query.season {
                pairs.append_pair("season_number", &season.to_string());
            }
            if let Some(episode) = query.episode {
                pairs.append_pair("episode_number", &episode.to_string());
            }
        }
        let request = self.request(self.http.get(url), timeout)?;
        self.client.request(request).await
    }
}

#[async_trait::async_trait]
impl SubtitleProvider for OpenSubtitlesApi {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenSubtitles
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SubtitleCandidate>, ProviderError> {
        let response = with_retries(SEARCH_RETRY, "opensubtitles search", || {
            self.search_page(query)
        })
        .await?;
        let candidates = response
            .data
            .into_iter()
            .filter_map(|result| result.into_candidate(query))
            .collect();
        Ok(candidates)
    }

    async fn download(&self, file_id: &str) -> Result<archive::DecodedDownload, ProviderError> {
        let file_id: i64 = file_id
            .parse()
            .map_err(|_| ProviderError::InvalidPayload(format!("bad file id: {file_id}")))?;
        let timeout =
            Duration::from_secs(config::CONFIG.get_value::<config::DownloadTimeoutSecs>().0);

        let info: DownloadResponse = with_retries(DOWNLOAD_RETRY, "opensubtitles download", || async {
            let request = self.request(
                self.http
                    .post(self.base_url.join("download").unwrap())
                    .json(&serde_json::json!({ "file_id": file_id })),
                timeout,
            )?;
            self.client.request(request).await
        })
        .await?;

        let bytes = with_retries(DOWNLOAD_RETRY, "opensubtitles download file", || async {
            let request = self.request(self.http.get(&info.link), timeout)?;
            self.client.request_bytes(request).await
        })
        .await?;

        let min_size = config::CONFIG.get_value::<config::MinSubtitleSizeBytes>().0;
        Ok(archive::decode_download(&bytes, min_size))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    data: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct Attributes {
    language: Option<String>,
    download_count: Option<u64>,
    ratings: Option<f64>,
    hearing_impaired: Option<bool>,
    foreign_parts_only: Option<bool>,
    machine_translated: Option<bool>,
    ai_translated: Option<bool>,
    upload_date: Option<String>,
    release: Option<String>,
    files: Vec<SubtitleFile>,
    feature_details: Option<FeatureDetails>,
}

#[derive(Debug, Deserialize)]
struct SubtitleFile {
    file_id: i64,
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeatureDetails {
    season_number: Option<u16>,
    episode_number: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    link: String,
}

impl SearchResult {
    fn into_candidate(self, query: &SearchQuery) -> Option<SubtitleCandidate> {
        let attributes = self.attributes;
        let raw_language = attributes.language?;
        let language_code = language::normalize(&raw_language)?;
        let file = attributes.files.into_iter().next()?;

        // The API happily returns neighbouring episodes for fuzzy matches,
        // drop anything that disagrees with the request.
        if let (Some(requested), Some(details)) = (query.episode, &attributes.feature_details) {
            if details.episode_number.is_some_and(|e| e != requested) {
                return None;
            }
            if let (Some(season), Some(declared)) = (query.season, details.season_number) {
                if season != declared {
                    return None;
                }
            }
        }

        let release_name = attributes
            .release
            .or(file.file_name)
            .unwrap_or_default();
        let upload_date = attributes
            .upload_date
            .as_deref()
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok());

        Some(SubtitleCandidate {
            file_id: ProviderKind::OpenSubtitles.file_id(file.file_id),
            language: raw_language,
            language_code: language_code.to_string(),
            release_name,
            downloads: attributes.download_count.unwrap_or(0),
            rating: attributes.ratings.unwrap_or(0.0),
            upload_date,
            provider: ProviderKind::OpenSubtitles,
            hearing_impaired: attributes.hearing_impaired.unwrap_or(false),
            foreign_parts_only: attributes.foreign_parts_only.unwrap_or(false),
            machine_translated: attributes.machine_translated.unwrap_or(false)
                || attributes.ai_translated.unwrap_or(false),
            is_season_pack: false,
            episode_range: None,
            match_score: None,
        })
    }
}
