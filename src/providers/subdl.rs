//! SubDL adapter. Search hits `api.subdl.com`, downloads come as ZIP files
//! from the `dl.subdl.com` mirror.

use std::time::Duration;

use reqwest::{Client, Url};
use serde::Deserialize;

use crate::config;

use super::{
    DOWNLOAD_RETRY, ProviderError, ProviderKind, SEARCH_RETRY, SearchQuery, SubtitleCandidate,
    SubtitleProvider, archive, episode_range_from_name, language,
    request_client::LimitedRequestClient, with_retries,
};

#[derive(Debug)]
pub struct SubdlApi {
    client: LimitedRequestClient,
    http: Client,
    api_url: Url,
    download_url: Url,
    api_key: String,
}

impl SubdlApi {
    pub fn new(http: Client, api_key: String) -> Self {
        let client = LimitedRequestClient::new(http.clone(), 2, Duration::from_secs(1));
        Self {
            client,
            http,
            api_url: Url::parse("https://api.subdl.com/api/v1/subtitles").unwrap(),
            download_url: Url::parse("https://dl.subdl.com/").unwrap(),
            api_key,
        }
    }

    /// SubDL wants upper case 2-letter tags with `_` regional suffixes
    /// (`PT_BR`).
    fn language_tag(code: &str) -> Option<String> {
        let tag = match code {
            "pob" => "pt-br",
            other => language::to_opensubtitles_tag(other)?,
        };
        Some(tag.replace('-', "_").to_uppercase())
    }

    async fn search_page(&self, query: &SearchQuery) -> Result<SearchResponse, ProviderError> {
        let timeout = Duration::from_secs(config::CONFIG.get_value::<config::SearchTimeoutSecs>().0);
        let mut url = self.api_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("api_key", &self.api_key);
            pairs.append_pair("imdb_id", &query.imdb_id);
            let tags: Vec<String> = query
                .languages
                .iter()
                .filter_map(|code| Self::language_tag(code))
                .collect();
            pairs.append_pair("languages", &tags.join(","));
            pairs.append_pair("subs_per_page", "30");
            if let Some(season) = query.season {
                pairs.append_pair("season_number", &season.to_string());
            }
            if let Some(episode) = query.episode {
                pairs.append_pair("episode_number", &episode.to_string());
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
impl SubtitleProvider for SubdlApi {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Subdl
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SubtitleCandidate>, ProviderError> {
        let response =
            with_retries(SEARCH_RETRY, "subdl search", || self.search_page(query)).await?;
        if !response.status {
            return Err(ProviderError::InvalidPayload(
                response.error.unwrap_or_else(|| "status false".to_string()),
            ));
        }
        Ok(response
            .subtitles
            .into_iter()
            .filter_map(|subtitle| subtitle.into_candidate(query))
            .collect())
    }

    async fn download(&self, file_id: &str) -> Result<archive::DecodedDownload, ProviderError> {
        let timeout =
            Duration::from_secs(config::CONFIG.get_value::<config::DownloadTimeoutSecs>().0);
        let url = self
            .download_url
            .join(file_id.trim_start_matches('/'))
            .map_err(|e| ProviderError::InvalidPayload(format!("bad download path: {e}")))?;
        let bytes = with_retries(DOWNLOAD_RETRY, "subdl download", || async {
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
    status: bool,
    error: Option<String>,
    #[serde(default)]
    subtitles: Vec<SubdlSubtitle>,
}

#[derive(Debug, Deserialize)]
struct SubdlSubtitle {
    release_name: Option<String>,
    name: Option<String>,
    lang: Option<String>,
    /// Download path under `dl.subdl.com`, e.g. `/subtitle/123-456.zip`
    url: Option<String>,
    season: Option<u16>,
    episode: Option<u16>,
    #[serde(default)]
    hi: bool,
    #[serde(default)]
    full_season: bool,
}

impl SubdlSubtitle {
    fn into_candidate(self, query: &SearchQuery) -> Option<SubtitleCandidate> {
        let raw_language = self.lang?;
        let language_code = language::normalize(&raw_language.replace('_', "-"))?;
        let url = self.url?;
        let release_name = self.release_name.or(self.name).unwrap_or_default();

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

        let episode_range = if self.full_season {
            episode_range_from_name(&release_name)
        } else {
            None
        };

        Some(SubtitleCandidate {
            file_id: ProviderKind::Subdl.file_id(url),
            language: raw_language,
            language_code: language_code.to_string(),
            release_name,
            downloads: 0,
            rating: 0.0,
            upload_date: None,
            provider: ProviderKind::Subdl,
            hearing_impaired: self.hi,
            foreign_parts_only: false,
            machine_translated: false,
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

    fn sample_query() -> SearchQuery {
        SearchQuery {
            imdb_id: "tt0903747".to_string(),
            media_type: MediaType::Episode,
            season: Some(2),
            episode: Some(5),
            languages: vec!["eng".to_string(), "pob".to_string()],
        }
    }

    fn subtitle(lang: &str, episode: Option<u16>, full_season: bool) -> SubdlSubtitle {
        SubdlSubtitle {
            release_name: Some("Show.S02E01-E13.1080p.WEB".to_string()),
            name: None,
            lang: Some(lang.to_string()),
            url: Some("/subtitle/123-456.zip".to_string()),
            season: Some(2),
            episode,
            hi: false,
            full_season,
        }
    }

    #[test]
    fn season_pack_carries_range() {
        let candidate = subtitle("EN", None, true)
            .into_candidate(&sample_query())
            .unwrap();
        assert!(candidate.is_season_pack);
        assert_eq!(
            candidate.episode_range,
            Some(crate::providers::EpisodeRange { first: 1, last: 13 })
        );
        assert_eq!(candidate.file_id, "subdl:/subtitle/123-456.zip");
    }

    #[test]
    fn brazilian_portuguese_tag() {
        let candidate = subtitle("PT_BR", Some(5), false)
            .into_candidate(&sample_query())
            .unwrap();
        assert_eq!(candidate.language_code, "pob");
    }

    #[test]
    fn wrong_episode_is_dropped() {
        assert!(subtitle("EN", Some(6), false)
            .into_candidate(&sample_query())
            .is_none());
    }

    #[test]
    fn language_tags_for_api() {
        assert_eq!(SubdlApi::language_tag("eng").as_deref(), Some("EN"));
        assert_eq!(SubdlApi::language_tag("pob").as_deref(), Some("PT_BR"));
    }
}
