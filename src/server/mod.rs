use std::collections::HashMap;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::get;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::app_state::{AppError, AppState};

pub mod addon_api;

/// Placeholder the facade swaps for the public base URL of the addon.
pub const BASE_URL_TOKEN: &str = "{BASE_URL}";

/// Characters that must not appear raw inside one URL path segment. File
/// ids may carry slashes (SubDL download paths do).
const SEGMENT_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'/')
    .add(b'%')
    .add(b'?')
    .add(b'#')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub fn encode_segment(raw: &str) -> String {
    utf8_percent_encode(raw, SEGMENT_ESCAPES).to_string()
}

pub fn app_router() -> Router<AppState> {
    Router::new()
        .route("/", get(addon_api::root))
        .route("/manifest.json", get(addon_api::manifest))
        .route("/subtitles/{media_type}/{id}", get(addon_api::list_subtitles))
        .route(
            "/subtitles/{media_type}/{id}/{extra}",
            get(addon_api::list_subtitles_with_extra),
        )
        .route("/subtitle/{file_id}/{lang}", get(addon_api::download_subtitle))
        .route("/translate/{file_id}/{lang}", get(addon_api::translate_subtitle))
        .route("/debug/cache", get(addon_api::cache_metrics))
}

/// Video identity taken from the addon path: `tt0111161` for movies,
/// `tt0903747:2:5` for episodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRef {
    pub imdb_id: String,
    pub season: Option<u16>,
    pub episode: Option<u16>,
}

impl VideoRef {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let mut parts = raw.split(':');
        let imdb_id = parts
            .next()
            .filter(|id| id.starts_with("tt") && id.len() > 2)
            .ok_or_else(|| AppError::bad_request(format!("not an imdb id: {raw}")))?
            .to_string();
        let season = parts
            .next()
            .map(|s| s.parse())
            .transpose()
            .map_err(|_| AppError::bad_request(format!("bad season in: {raw}")))?;
        let episode = parts
            .next()
            .map(|e| e.parse())
            .transpose()
            .map_err(|_| AppError::bad_request(format!("bad episode in: {raw}")))?;
        Ok(Self {
            imdb_id,
            season,
            episode,
        })
    }
}

pub fn strip_json_suffix(raw: &str) -> &str {
    raw.strip_suffix(".json").unwrap_or(raw)
}

pub fn strip_srt_suffix(raw: &str) -> &str {
    raw.strip_suffix(".srt").unwrap_or(raw)
}

/// Decodes the `key=value&key=value` extra path segment the player appends
/// to subtitle requests.
pub fn parse_extra(raw: &str) -> HashMap<String, String> {
    strip_json_suffix(raw)
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value = percent_decode_str(value).decode_utf8().ok()?;
            Some((key.to_string(), value.into_owned()))
        })
        .collect()
}

/// Public base this request reached us on, honoring reverse-proxy headers.
pub fn request_base_url(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_ref_parsing() {
        assert_eq!(
            VideoRef::parse("tt0111161").unwrap(),
            VideoRef {
                imdb_id: "tt0111161".to_string(),
                season: None,
                episode: None
            }
        );
        assert_eq!(
            VideoRef::parse("tt0903747:2:5").unwrap(),
            VideoRef {
                imdb_id: "tt0903747".to_string(),
                season: Some(2),
                episode: Some(5)
            }
        );
        assert!(VideoRef::parse("not-imdb").is_err());
        assert!(VideoRef::parse("tt0903747:x:5").is_err());
    }

    #[test]
    fn extra_segment_parsing() {
        let extras = parse_extra("filename=Show.S01E01.1080p.WEB-DL.mkv&videoSize=730000000.json");
        assert_eq!(
            extras.get("filename").map(String::as_str),
            Some("Show.S01E01.1080p.WEB-DL.mkv")
        );
        assert_eq!(extras.get("videoSize").map(String::as_str), Some("730000000"));

        let encoded = parse_extra("filename=Some%20Movie%20%282020%29.mkv");
        assert_eq!(
            encoded.get("filename").map(String::as_str),
            Some("Some Movie (2020).mkv")
        );
    }

    #[test]
    fn segment_encoding_round_trips_through_decoding() {
        let raw = "subdl:/subtitle/123-456.zip";
        let encoded = encode_segment(raw);
        assert!(!encoded.contains('/'));
        let decoded = percent_decode_str(&encoded).decode_utf8().unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn suffix_stripping() {
        assert_eq!(strip_json_suffix("tt1:1:2.json"), "tt1:1:2");
        assert_eq!(strip_json_suffix("tt1:1:2"), "tt1:1:2");
        assert_eq!(strip_srt_suffix("spa.srt"), "spa");
    }
}
