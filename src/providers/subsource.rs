//! SubSource adapter. No credentials, generous quotas, ZIP downloads.

use std::time::Duration;

use reqwest::{Client, Url};
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config;

use super::{
    DOWNLOAD_RETRY, ProviderError, ProviderKind, SEARCH_RETRY, SearchQuery, SubtitleCandidate,
    SubtitleProvider, archive, episode_range_from_name, language,
    request_client::LimitedRequestClient, with_retries,
};

#[derive(Debug)]
pub struct SubsourceApi {
    client: LimitedRequestClient,
    http: Client,
    base_url: Url,
}

impl SubsourceApi {
    pub fn new(http: Client) -> Self {
        let client = LimitedRequestClient::new(http.clone(), 2, Duration::from_secs(1));
        Self {
            client,
            http,
            base_url: Url::parse("https://api.subsource.net/v1/").unwrap(),
        }
    }

    async fn search_page(&self, query: &SearchQuery) -> Result<SearchResponse, ProviderError> {
        let timeout = Duration::from_secs(config::CONFIG.get_value::<config::SearchTimeoutSecs>().0);
        let mut url = self.base_url.join("subtitles").unwrap();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("imdb_id", &query.imdb_id);
            pairs.append_pair("languages", &query.languages.join(","));
            if let Some(season) = query.season {
                pairs.append_pair("season", &season.to_string());
            }
            if let Some(episode) = query.episode {
                pairs.append_pair("episode", &episode.to_string());
            }
        }
        let request = self
            .http
            .get(url)
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        self.client.request(request).await
    }
}

#[async_trait::async_trait]
impl SubtitleProvider for SubsourceApi {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SubSource
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SubtitleCandidate>, ProviderError> {
        let response =
            with_retries(SEARCH_RETRY, "subsource search", || self.search_page(query)).await?;
        Ok(response
            .subtitles
            .into_iter()
            .filter_map(|subtitle| subtitle.into_candidate(query))
            .collect())
    }

    async fn download(&self, file_id: &str) -> Result<archive::DecodedDownload, ProviderError> {
        let id: u64 = file_id
            .parse()
            .map_err(|_| ProviderError::InvalidPayload(format!("bad file id: {file_id}")))?;
        let timeout =
            Duration::from_secs(config::CONFIG.get_value::<config::DownloadTimeoutSecs>().0);
        let url = self
            .base_url
            .join(&format!("subtitle/{id}/download"))
            .unwrap();
        let bytes = with_retries(DOWNLOAD_RETRY, "subsource download", || async {
            let request = self
                .http
                .get(url.clone())
                .timeout(timeout)
                .build()
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
            self.client.request_bytes(request).await
        })
        .await?;

        let min_size = config::CONFIG.get_value::<config::MinSubtitleSizeBytes>().0;
        Ok(archive::decode_download(&bytes, min_size))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    subtitles: Vec<SubsourceSubtitle>,
}

#[derive(Debug, Deserialize)]
struct SubsourceSubtitle {
    id: u64,
    language: Option<String>,
    release_name: Option<String>,
    #[serde(default)]
    downloads: u64,
    rating: Option<f64>,
    upload_date: Option<String>,
    #[serde(default)]
    hearing_impaired: bool,
    #[serde(default)]
    foreign_parts_only: bool,
    #[serde(default)]
    machine_translated: bool,
    season: Option<u16>,
    episode: Option<u16>,
    #[serde(default)]
    full_season: bool,
}

impl SubsourceSubtitle {
    fn into_candidate(self, query: &SearchQuery) -> Option<SubtitleCandidate> {
        let raw_language = self.language?;
        let language_code = language::normalize(&raw_language)?;
        let release_name = self.release_name.unwrap_or_default();

        if let Some(season) = query.season {
            if self.season.is_some_and(|s| s != season) {
                return None;
            }
        }
        if !self.full_season {
            if let Some(episode) = query.episode {
                if self.episode.is_some_and(|e| e != episode) {
                    return None;
                }
            }
        }

        let upload_date = self
            .upload_date
            .as_deref()
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok());
        let episode_range = if self.full_season {
            episode_range_from_name(&release_name)
        } else {
            None
        };

        Some(SubtitleCandidate {
            file_id: ProviderKind::SubSource.file_id(self.id),
            language: raw_language,
            language_code: language_code.to_string(),
            release_name,
            downloads: self.downloads,
            rating: self.rating.unwrap_or(0.0),
            upload_date,
            provider: ProviderKind::SubSource,
            hearing_impaired: self.hearing_impaired,
            foreign_parts_only: self.foreign_parts_only,
            machine_translated: self.machine_translated,
            is_season_pack: self.full_season,
            episode_range,
            match_score: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MediaType;

    #[test]
    fn candidate_mapping() {
        let query = SearchQuery {
            imdb_id: "tt1234567".to_string(),
            media_type: MediaType::Movie,
            season: None,
            episode: None,
            languages: vec!["spa".to_string()],
        };
        let subtitle = SubsourceSubtitle {
            id: 991,
            language: Some("spanish".to_string()),
            release_name: Some("Movie.2021.1080p.BluRay".to_string()),
            downloads: 10,
            rating: Some(9.0),
            upload_date: Some("2024-01-02T03:04:05Z".to_string()),
            hearing_impaired: true,
            foreign_parts_only: false,
            machine_translated: false,
            season: None,
            episode: None,
            full_season: false,
        };
        let candidate = subtitle.into_candidate(&query).unwrap();
        assert_eq!(candidate.file_id, "subsource:991");
        assert_eq!(candidate.language_code, "spa");
        assert!(candidate.hearing_impaired);
    }
}
