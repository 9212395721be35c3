//! Candidate-to-release match scoring and ranking.
//!
//! The score is a weighted comparison of the facets extracted by
//! [`crate::release`], tuned for one question: how likely is this subtitle
//! to be in sync with the stream the player is about to play.

use crate::providers::SubtitleCandidate;
use crate::release::{self, Resolution, VideoCodec};

/// Per-language cap for the subtitle listing path.
pub const LISTING_QUOTA: usize = 12;
/// Per-language cap when picking translation sources.
pub const SELECTOR_QUOTA: usize = 20;

const EXACT_MATCH: u32 = 10_000;

fn is_year(token: &str) -> bool {
    token.len() == 4
        && (token.starts_with("19") || token.starts_with("20"))
        && token.chars().all(|c| c.is_ascii_digit())
}

fn is_season_episode(token: &str) -> bool {
    let bytes = token.as_bytes();
    if bytes.first() == Some(&b's') {
        if let Some(e) = token.find('e') {
            return token[1..e].chars().all(|c| c.is_ascii_digit())
                && e > 1
                && token[e + 1..].chars().all(|c| c.is_ascii_digit())
                && token.len() > e + 1;
        }
    }
    if let Some(x) = token.find('x') {
        return x > 0
            && token[..x].chars().all(|c| c.is_ascii_digit())
            && !token[x + 1..].is_empty()
            && token[x + 1..].chars().all(|c| c.is_ascii_digit());
    }
    false
}

fn is_edition_marker(token: &str) -> bool {
    matches!(
        token,
        "extended" | "unrated" | "directors" | "theatrical" | "imax" | "remastered" | "cut"
    )
}

fn tokenize(name: &str) -> Vec<String> {
    release::strip_extension(name)
        .to_lowercase()
        .split(release::SEPARATORS)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// The part of the name before the year / season marker / first quality
/// facet, with separators flattened to spaces.
fn title_base(name: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for token in release::strip_extension(name)
        .split(['.', '_', ' '])
        .filter(|t| !t.is_empty())
    {
        let lowered = token.to_lowercase();
        let bare = lowered.trim_matches(|c| c == '(' || c == ')' || c == '[' || c == ']');
        if is_year(bare) || is_season_episode(bare) || is_facet_marker(&lowered) {
            break;
        }
        out.push(token);
    }
    out.join(" ").to_lowercase()
}

fn is_facet_marker(token: &str) -> bool {
    let facets = release::parse(token);
    facets.resolution.is_some()
        || facets.rip.is_some()
        || facets.video_codec.is_some()
        || facets.proper
}

fn resolution_points(stream: Option<Resolution>, candidate: Option<Resolution>) -> i64 {
    let (Some(stream), Some(candidate)) = (stream, candidate) else {
        return 0;
    };
    if stream == candidate {
        1000
    } else if matches!(
        (stream.height(), candidate.height()),
        (720, 1080) | (1080, 720)
    ) {
        400
    } else if candidate.height() > stream.height() {
        200
    } else {
        -200
    }
}

fn token_bonus(token: &str) -> i64 {
    if is_season_episode(token) {
        4
    } else if is_year(token) {
        3
    } else if token.chars().all(|c| c.is_ascii_digit()) {
        2
    } else if is_edition_marker(token) {
        2
    } else {
        1
    }
}

/// Scores `candidate_name` against the release the player reported.
/// Deterministic and pure. Zero means "different work, do not offer".
pub fn score(stream_filename: &str, candidate_name: &str) -> u32 {
    let stream_norm = release::strip_extension(stream_filename).to_lowercase();
    let candidate_norm = release::strip_extension(candidate_name).to_lowercase();
    if !stream_norm.is_empty() && stream_norm == candidate_norm {
        return EXACT_MATCH;
    }

    let stream_title = title_base(stream_filename);
    let candidate_title = title_base(candidate_name);
    if !stream_title.contains(&candidate_title) && !candidate_title.contains(&stream_title) {
        return 0;
    }

    let stream_facets = release::parse(stream_filename);
    let candidate_facets = release::parse(candidate_name);

    let mut points: i64 = 500;

    match (&stream_facets.release_group, &candidate_facets.release_group) {
        (Some(a), Some(b)) if a == b && candidate_facets.is_popular_group => points += 5000,
        (Some(a), Some(b)) if a == b => points += 4000,
        (Some(_), Some(_)) => points -= 100,
        (None, Some(_)) if candidate_facets.is_popular_group => points += 200,
        _ => {}
    }

    if let (Some(a), Some(b)) = (stream_facets.rip, candidate_facets.rip) {
        points += match (a.tier() - b.tier()).abs() {
            0 => 2500,
            1 => 800,
            2 => 300,
            _ => -500,
        };
    }

    if let (Some(a), Some(b)) = (stream_facets.platform, candidate_facets.platform) {
        points += if a == b { 1200 } else { -200 };
    }

    points += resolution_points(stream_facets.resolution, candidate_facets.resolution);

    if let (Some(a), Some(b)) = (stream_facets.video_codec, candidate_facets.video_codec) {
        if a == b {
            points += 500;
        } else if matches!(
            (a, b),
            (VideoCodec::Avc, VideoCodec::Hevc) | (VideoCodec::Hevc, VideoCodec::Avc)
        ) {
            points += 200;
        }
    }

    if let (Some(a), Some(b)) = (stream_facets.audio_codec, candidate_facets.audio_codec) {
        if a == b {
            points += 400;
        }
    }

    if let (Some(a), Some(b)) = (stream_facets.hdr, candidate_facets.hdr) {
        points += if a == b { 600 } else { -150 };
    }

    let stream_tokens = tokenize(stream_filename);
    let candidate_tokens = tokenize(candidate_name);
    let shared_bonus: i64 = candidate_tokens
        .iter()
        .filter(|t| stream_tokens.contains(t))
        .map(|t| token_bonus(t))
        .sum();
    points += shared_bonus * 100;

    points += match (stream_facets.edition, candidate_facets.edition) {
        (Some(a), Some(b)) if a == b => 1500,
        (Some(_), Some(_)) => -1000,
        (Some(_), None) | (None, Some(_)) => -300,
        (None, None) => 0,
    };

    match (stream_facets.proper, candidate_facets.proper) {
        (true, true) => points += 800,
        (true, false) | (false, true) => points -= 400,
        (false, false) => {}
    }

    let mut result = points as f64;

    if !stream_tokens.is_empty() && !candidate_tokens.is_empty() {
        let ratio = stream_tokens.len().min(candidate_tokens.len()) as f64
            / stream_tokens.len().max(candidate_tokens.len()) as f64;
        if ratio > 0.8 {
            result *= 1.3;
        } else if ratio > 0.6 {
            result *= 1.15;
        }
    }

    let critical_matches = [
        stream_facets.release_group.is_some()
            && stream_facets.release_group == candidate_facets.release_group,
        stream_facets.rip.is_some() && stream_facets.rip == candidate_facets.rip,
        stream_facets.resolution.is_some()
            && stream_facets.resolution == candidate_facets.resolution,
    ]
    .into_iter()
    .filter(|m| *m)
    .count();
    if critical_matches >= 3 {
        result *= 1.5;
    } else if critical_matches == 2 {
        result *= 1.25;
    }

    if candidate_tokens.len() < 2 {
        result *= 0.5;
    }

    result.round().max(0.0) as u32
}

/// Scores, sorts (descending, stable) and applies the per-language quota.
/// Candidates keep their computed score in `match_score`.
pub fn rank_candidates(
    stream_filename: &str,
    candidates: Vec<SubtitleCandidate>,
    per_language_quota: usize,
) -> Vec<SubtitleCandidate> {
    let mut scored: Vec<SubtitleCandidate> = candidates
        .into_iter()
        .map(|mut candidate| {
            candidate.match_score = Some(score(stream_filename, &candidate.release_name));
            candidate
        })
        .collect();
    scored.sort_by_key(|c| std::cmp::Reverse(c.match_score.unwrap_or(0)));

    let mut kept = Vec::with_capacity(scored.len());
    let mut per_language: std::collections::HashMap<String, usize> = Default::default();
    for candidate in scored {
        let count = per_language
            .entry(candidate.language_code.clone())
            .or_default();
        if *count < per_language_quota {
            *count += 1;
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderKind, SubtitleCandidate};

    #[test]
    fn exact_match_is_terminal() {
        assert_eq!(
            score(
                "Show.S02E05.1080p.WEB-DL.x265-RARBG.mkv",
                "Show.S02E05.1080p.WEB-DL.x265-RARBG.srt"
            ),
            10_000
        );
    }

    #[test]
    fn different_work_scores_zero() {
        assert_eq!(score("Alpha (2018) 1080p", "Omega (2019) 1080p"), 0);
    }

    #[test]
    fn same_group_outranks_different_group() {
        let stream = "Show.S01E01.REPACK.1080p.WEB-DL.x264-RARBG.mkv";
        let same = score(stream, "Show.S01E01.1080p.WEB-DL.x264-RARBG.srt");
        let other = score(stream, "Show.S01E01.1080p.WEB-DL.x264-NTG.srt");
        assert!(same > other, "{same} vs {other}");
    }

    #[test]
    fn adjacent_rip_tier_beats_distant() {
        let stream = "Show.S01E01.1080p.WEB-DL.x264.mkv";
        let adjacent = score(stream, "Show.S01E01.1080p.WEBRip.x264.srt");
        let distant = score(stream, "Show.S01E01.1080p.HDTV.x264.srt");
        assert!(adjacent > distant, "{adjacent} vs {distant}");
    }

    #[test]
    fn scoring_is_pure() {
        let a = score("Show.S01E01.720p.HDTV.mkv", "Show.S01E01.HDTV.srt");
        let b = score("Show.S01E01.720p.HDTV.mkv", "Show.S01E01.HDTV.srt");
        assert_eq!(a, b);
    }

    #[test]
    fn short_candidates_are_penalized() {
        let stream = "Show.S01E01.1080p.WEB-DL.mkv";
        let descriptive = score(stream, "Show.S01E01.1080p.srt");
        let bare = score(stream, "Show.srt");
        assert!(descriptive > bare, "{descriptive} vs {bare}");
    }

    fn candidate(id: &str, language_code: &str, release_name: &str) -> SubtitleCandidate {
        SubtitleCandidate {
            file_id: format!("os:{id}"),
            language: language_code.to_string(),
            language_code: language_code.to_string(),
            release_name: release_name.to_string(),
            downloads: 0,
            rating: 0.0,
            upload_date: None,
            provider: ProviderKind::OpenSubtitles,
            hearing_impaired: false,
            foreign_parts_only: false,
            machine_translated: false,
            is_season_pack: false,
            episode_range: None,
            match_score: None,
        }
    }

    #[test]
    fn ranking_sorts_and_applies_quota() {
        let stream = "Show.S01E01.1080p.WEB-DL.x264-RARBG.mkv";
        let mut pool = Vec::new();
        for i in 0..15 {
            pool.push(candidate(&format!("e{i}"), "eng", "Show.S01E01.1080p.HDTV.srt"));
        }
        pool.push(candidate("best", "eng", "Show.S01E01.1080p.WEB-DL.x264-RARBG.srt"));
        pool.push(candidate("spa", "spa", "Show.S01E01.1080p.WEB-DL.srt"));

        let ranked = rank_candidates(stream, pool, 12);
        assert_eq!(ranked.first().unwrap().file_id, "os:best");
        let english = ranked.iter().filter(|c| c.language_code == "eng").count();
        assert_eq!(english, 12);
        assert_eq!(ranked.iter().filter(|c| c.language_code == "spa").count(), 1);
        for pair in ranked.windows(2) {
            if pair[0].language_code == pair[1].language_code {
                assert!(pair[0].match_score >= pair[1].match_score);
            }
        }
    }

    #[test]
    fn ties_keep_input_order() {
        let stream = "Show.S01E01.1080p.mkv";
        let pool = vec![
            candidate("first", "eng", "Show.S01E01.1080p.srt"),
            candidate("second", "eng", "Show.S01E01.1080p.srt"),
        ];
        let ranked = rank_candidates(stream, pool, 12);
        assert_eq!(ranked[0].file_id, "os:first");
        assert_eq!(ranked[1].file_id, "os:second");
    }
}
