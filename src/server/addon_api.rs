//! Addon HTTP handlers.
//!
//! The listing endpoint speaks the player's `{subtitles: [{id, lang, url}]}`
//! dialect; the download and translate endpoints always answer with
//! subtitle text, sentinel cues included, so the player never sees an
//! error page.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use crate::app_state::{AppError, AppState};
use crate::config;
use crate::providers::{MediaType, ProviderError, SubtitleCandidate, language};
use crate::scoring;
use crate::search::SearchParams;
use crate::srt;
use crate::orchestrator::TranslationRequest;

use super::{
    BASE_URL_TOKEN, VideoRef, encode_segment, parse_extra, request_base_url, strip_json_suffix,
    strip_srt_suffix,
};

#[derive(Debug, Serialize)]
pub struct SubtitleEntry {
    pub id: String,
    pub lang: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct SubtitlesResponse {
    pub subtitles: Vec<SubtitleEntry>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AddonQuery {
    /// Opaque per-user identity tag.
    pub cfg: Option<String>,
}

pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": config::AppResources::APP_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn manifest() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "id": "org.subtitle-server",
        "version": env!("CARGO_PKG_VERSION"),
        "name": "Subtitle Server",
        "description": "Subtitle search across providers with on-demand translation",
        "resources": ["subtitles"],
        "types": ["movie", "series"],
        "idPrefixes": ["tt"],
        "catalogs": [],
    }))
}

pub async fn list_subtitles(
    State(state): State<AppState>,
    Path((media_type, id)): Path<(String, String)>,
    Query(query): Query<AddonQuery>,
    headers: HeaderMap,
) -> Result<Json<SubtitlesResponse>, AppError> {
    list_impl(state, media_type, id, None, query, headers).await
}

pub async fn list_subtitles_with_extra(
    State(state): State<AppState>,
    Path((media_type, id, extra)): Path<(String, String, String)>,
    Query(query): Query<AddonQuery>,
    headers: HeaderMap,
) -> Result<Json<SubtitlesResponse>, AppError> {
    list_impl(state, media_type, id, Some(extra), query, headers).await
}

async fn list_impl(
    state: AppState,
    media_type: String,
    id: String,
    extra: Option<String>,
    query: AddonQuery,
    headers: HeaderMap,
) -> Result<Json<SubtitlesResponse>, AppError> {
    let media_type: MediaType = media_type
        .parse()
        .map_err(|_| AppError::bad_request(format!("unsupported media type: {media_type}")))?;
    let video = VideoRef::parse(strip_json_suffix(&id))?;
    let extras = extra.as_deref().map(parse_extra).unwrap_or_default();
    let stream_filename = extras
        .get("filename")
        .or_else(|| extras.get("videoFilename"))
        .cloned();
    let user_hash = query.cfg.clone().or_else(|| extras.get("cfg").cloned());

    let source_languages = normalized_languages(
        config::CONFIG.get_value::<config::SourceLanguages>().0,
    );
    let target_languages = normalized_languages(
        config::CONFIG.get_value::<config::TargetLanguages>().0,
    );
    let mut languages = source_languages.clone();
    languages.extend(target_languages.iter().cloned());
    languages.sort_unstable();
    languages.dedup();

    let params = SearchParams {
        imdb_id: video.imdb_id.clone(),
        media_type,
        season: video.season,
        episode: video.episode,
        languages,
        stream_filename: stream_filename.clone(),
        per_language_quota: scoring::LISTING_QUOTA,
    };
    let listing = state.aggregator.search(params.clone()).await;
    tracing::debug!(
        imdb_id = video.imdb_id,
        results = listing.len(),
        "Built subtitle listing"
    );

    let mut subtitles: Vec<SubtitleEntry> = listing
        .iter()
        .map(|candidate| SubtitleEntry {
            id: candidate.file_id.clone(),
            lang: candidate.language_code.clone(),
            url: format!(
                "{BASE_URL_TOKEN}/subtitle/{}/{}.srt",
                encode_segment(&candidate.file_id),
                candidate.language_code
            ),
        })
        .collect();

    if !target_languages.is_empty() {
        // the translation selector ranks deeper than the listing
        let selector = state
            .aggregator
            .search(SearchParams {
                per_language_quota: scoring::SELECTOR_QUOTA,
                ..params
            })
            .await;
        let cfg_suffix = user_hash
            .as_ref()
            .map(|hash| format!("?cfg={hash}"))
            .unwrap_or_default();
        for target in &target_languages {
            let label = language::display_name(target)
                .map(|name| format!("Make {name}"))
                .unwrap_or_else(|| format!("Make {target}"));
            for candidate in translation_sources(&selector, &source_languages, target) {
                subtitles.push(SubtitleEntry {
                    id: format!("translate_{}_to_{}", candidate.file_id, target),
                    lang: label.clone(),
                    url: format!(
                        "{BASE_URL_TOKEN}/translate/{}/{}.srt{}",
                        encode_segment(&candidate.file_id),
                        target,
                        cfg_suffix
                    ),
                });
            }
        }
    }

    if config::CONFIG.get_value::<config::ActionEntriesEnabled>().0 {
        subtitles.push(SubtitleEntry {
            id: "action_sync".to_string(),
            lang: "Sync Subtitles".to_string(),
            url: format!("{BASE_URL_TOKEN}/"),
        });
        subtitles.push(SubtitleEntry {
            id: "action_translate_srt".to_string(),
            lang: "Translate SRT".to_string(),
            url: format!("{BASE_URL_TOKEN}/"),
        });
    }

    let base_url = request_base_url(&headers);
    for entry in &mut subtitles {
        entry.url = entry.url.replace(BASE_URL_TOKEN, &base_url);
    }

    Ok(Json(SubtitlesResponse { subtitles }))
}

/// Candidates worth offering as translation sources for `target`.
fn translation_sources<'a>(
    ranked: &'a [SubtitleCandidate],
    source_languages: &'a [String],
    target: &'a str,
) -> impl Iterator<Item = &'a SubtitleCandidate> {
    ranked.iter().filter(move |candidate| {
        candidate.language_code != target
            && source_languages.contains(&candidate.language_code)
            && !candidate.machine_translated
    })
}

pub async fn cache_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "cache": state.cache.metrics().snapshot(),
    }))
}

pub async fn download_subtitle(
    State(state): State<AppState>,
    Path((file_id, _lang)): Path<(String, String)>,
) -> impl IntoResponse {
    let body = match state.registry.download(&file_id).await {
        Ok(decoded) => decoded.into_text(),
        Err(ProviderError::NotFound) => {
            srt::download_failed("The subtitle is no longer available at the provider.")
        }
        Err(e) => {
            tracing::warn!(file_id, "Subtitle download failed: {e}");
            srt::download_failed("The provider could not deliver this subtitle.")
        }
    };
    subtitle_response(body)
}

pub async fn translate_subtitle(
    State(state): State<AppState>,
    Path((file_id, lang)): Path<(String, String)>,
    Query(query): Query<AddonQuery>,
) -> impl IntoResponse {
    let lang = strip_srt_suffix(&lang);
    let target = language::normalize(lang).unwrap_or(lang);
    let request = TranslationRequest::from_config(file_id, target.to_string(), query.cfg);
    let body = state.orchestrator.handle_translation(request).await;
    subtitle_response(body)
}

fn subtitle_response(body: String) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}

fn normalized_languages(raw: Vec<String>) -> Vec<String> {
    raw.iter()
        .filter_map(|tag| language::normalize(tag))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    fn candidate(id: &str, code: &str, machine: bool) -> SubtitleCandidate {
        SubtitleCandidate {
            file_id: format!("os:{id}"),
            language: code.to_string(),
            language_code: code.to_string(),
            release_name: String::new(),
            downloads: 0,
            rating: 0.0,
            upload_date: None,
            provider: ProviderKind::OpenSubtitles,
            hearing_impaired: false,
            foreign_parts_only: false,
            machine_translated: machine,
            is_season_pack: false,
            episode_range: None,
            match_score: None,
        }
    }

    #[test]
    fn translation_sources_filter() {
        let ranked = vec![
            candidate("1", "eng", false),
            candidate("2", "spa", false),
            candidate("3", "eng", true),
            candidate("4", "ger", false),
        ];
        let sources = vec!["eng".to_string(), "ger".to_string()];
        let picked: Vec<_> = translation_sources(&ranked, &sources, "spa")
            .map(|c| c.file_id.clone())
            .collect();
        // machine translations and non-source languages are skipped
        assert_eq!(picked, vec!["os:1", "os:4"]);

        // a candidate already in the target language is never a source
        let picked: Vec<_> = translation_sources(&ranked, &sources, "eng")
            .map(|c| c.file_id.clone())
            .collect();
        assert_eq!(picked, vec!["os:4"]);
    }

    #[test]
    fn language_normalization_for_config() {
        let normalized = normalized_languages(vec![
            "en".to_string(),
            "eng".to_string(),
            "pt-br".to_string(),
            "unknown".to_string(),
        ]);
        assert_eq!(normalized, vec!["eng", "eng", "pob"]);
    }
}
