//! Release name facet extraction.
//!
//! Everything here is a pure, case-insensitive token scan over the release
//! filename. Specific markers are tried before generic ones (`web-dl`
//! before `web`, `hdr10+` before `hdr10`).

use serde::Serialize;

pub const SEPARATORS: &[char] = &['.', '_', ' ', '-'];

/// Groups whose releases are common enough that matching one is a strong
/// sync signal.
const POPULAR_GROUPS: &[&str] = &[
    "rarbg", "yts", "yify", "eztv", "ettv", "sparks", "geckos", "tigole", "qxr", "psa",
    "rartv", "evo", "ntb", "flux", "cmrg", "ion10", "successfulcrab", "megusta", "minx",
    "galaxytv", "tgx", "fgt", "amiable", "drones", "dimension", "killers", "lol", "batv",
];

/// Tokens that show up in the trailing position but are facet markers, not
/// release groups.
const GROUP_STOPLIST: &[&str] = &[
    "dl", "rip", "ray", "srt", "mkv", "mp4", "avi", "sub", "subs", "hd", "uhd", "remux",
    "x264", "x265", "h264", "h265", "hevc", "avc", "av1", "xvid", "divx", "aac", "ac3",
    "eac3", "dts", "ddp", "flac", "opus", "atmos", "truehd", "hdr", "hdr10", "dv", "sdr",
    "proper", "repack", "internal", "multi", "dual", "web", "webrip", "bluray", "hdtv",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    #[serde(rename = "4k")]
    R2160,
    #[serde(rename = "1080p")]
    R1080,
    #[serde(rename = "720p")]
    R720,
    #[serde(rename = "480p")]
    R480,
    #[serde(rename = "360p")]
    R360,
}

impl Resolution {
    pub fn height(&self) -> u32 {
        match self {
            Resolution::R2160 => 2160,
            Resolution::R1080 => 1080,
            Resolution::R720 => 720,
            Resolution::R480 => 480,
            Resolution::R360 => 360,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RipType {
    WebDl,
    WebRip,
    Web,
    Bluray,
    BdRip,
    BdRemux,
    Hdtv,
    Pdtv,
    DvdRip,
    DvdScr,
    HdRip,
    Cam,
    Telesync,
    Screener,
}

impl RipType {
    /// Ordinal sync-compatibility tier, 1 is best.
    pub fn tier(&self) -> i32 {
        match self {
            RipType::WebDl => 1,
            RipType::WebRip => 2,
            RipType::Web => 3,
            RipType::Bluray => 4,
            RipType::BdRip => 5,
            RipType::BdRemux => 6,
            RipType::Hdtv => 7,
            RipType::Pdtv => 8,
            RipType::DvdRip => 9,
            RipType::DvdScr | RipType::Screener => 10,
            RipType::HdRip => 11,
            RipType::Cam | RipType::Telesync => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Hevc,
    Avc,
    Av1,
    Xvid,
    Divx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Atmos,
    TrueHd,
    DtsHd,
    Dts,
    Eac3,
    Ac3,
    Aac,
    Flac,
    Opus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Hdr {
    DolbyVision,
    Hdr10Plus,
    Hdr10,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Edition {
    Extended,
    Unrated,
    DirectorsCut,
    Theatrical,
    Imax,
    Remastered,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReleaseFacets {
    pub resolution: Option<Resolution>,
    pub rip: Option<RipType>,
    pub video_codec: Option<VideoCodec>,
    pub audio_codec: Option<AudioCodec>,
    pub hdr: Option<Hdr>,
    pub platform: Option<&'static str>,
    pub release_group: Option<String>,
    pub is_popular_group: bool,
    pub edition: Option<Edition>,
    pub proper: bool,
}

/// True when `token` occurs in `haystack` delimited by non-alphanumerics.
/// Tokens may contain punctuation themselves (`web-dl`, `hdr10+`).
fn contains_token(haystack: &str, token: &str) -> bool {
    let bytes = haystack.as_bytes();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(token) {
        let start = from + pos;
        let end = start + token.len();
        let left_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let right_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if left_ok && right_ok {
            return true;
        }
        from = start + 1;
    }
    false
}

fn find_marker<T: Copy>(haystack: &str, table: &[(&str, T)]) -> Option<T> {
    table
        .iter()
        .find(|(token, _)| contains_token(haystack, token))
        .map(|(_, value)| *value)
}

const RESOLUTIONS: &[(&str, Resolution)] = &[
    ("2160p", Resolution::R2160),
    ("4k", Resolution::R2160),
    ("uhd", Resolution::R2160),
    ("1080p", Resolution::R1080),
    ("1080i", Resolution::R1080),
    ("720p", Resolution::R720),
    ("480p", Resolution::R480),
    ("360p", Resolution::R360),
];

const RIP_TYPES: &[(&str, RipType)] = &[
    ("web-dl", RipType::WebDl),
    ("webdl", RipType::WebDl),
    ("web.dl", RipType::WebDl),
    ("webrip", RipType::WebRip),
    ("web-rip", RipType::WebRip),
    ("bdremux", RipType::BdRemux),
    ("remux", RipType::BdRemux),
    ("bdrip", RipType::BdRip),
    ("brrip", RipType::BdRip),
    ("blu-ray", RipType::Bluray),
    ("bluray", RipType::Bluray),
    ("hdtv", RipType::Hdtv),
    ("pdtv", RipType::Pdtv),
    ("dvdrip", RipType::DvdRip),
    ("dvdscr", RipType::DvdScr),
    ("screener", RipType::Screener),
    ("hdrip", RipType::HdRip),
    ("telesync", RipType::Telesync),
    ("hdts", RipType::Telesync),
    ("camrip", RipType::Cam),
    ("cam", RipType::Cam),
    // plain `web` only after the specific web markers failed
    ("web", RipType::Web),
];

const VIDEO_CODECS: &[(&str, VideoCodec)] = &[
    ("x265", VideoCodec::Hevc),
    ("h265", VideoCodec::Hevc),
    ("h.265", VideoCodec::Hevc),
    ("hevc", VideoCodec::Hevc),
    ("x264", VideoCodec::Avc),
    ("h264", VideoCodec::Avc),
    ("h.264", VideoCodec::Avc),
    ("avc", VideoCodec::Avc),
    ("av1", VideoCodec::Av1),
    ("xvid", VideoCodec::Xvid),
    ("divx", VideoCodec::Divx),
];

const AUDIO_CODECS: &[(&str, AudioCodec)] = &[
    ("atmos", AudioCodec::Atmos),
    ("truehd", AudioCodec::TrueHd),
    ("dts-hd", AudioCodec::DtsHd),
    ("dtshd", AudioCodec::DtsHd),
    ("dts", AudioCodec::Dts),
    ("eac3", AudioCodec::Eac3),
    ("e-ac3", AudioCodec::Eac3),
    ("ddp", AudioCodec::Eac3),
    ("dd+", AudioCodec::Eac3),
    ("ac3", AudioCodec::Ac3),
    ("aac", AudioCodec::Aac),
    ("flac", AudioCodec::Flac),
    ("opus", AudioCodec::Opus),
];

const HDR_MARKERS: &[(&str, Hdr)] = &[
    ("dolby.vision", Hdr::DolbyVision),
    ("dolby-vision", Hdr::DolbyVision),
    ("dovi", Hdr::DolbyVision),
    ("dv", Hdr::DolbyVision),
    ("hdr10+", Hdr::Hdr10Plus),
    ("hdr10plus", Hdr::Hdr10Plus),
    ("hdr10", Hdr::Hdr10),
    ("hdr", Hdr::Generic),
];

const PLATFORMS: &[(&str, &str)] = &[
    ("netflix", "netflix"),
    ("nf", "netflix"),
    ("amazon", "amazon"),
    ("amzn", "amazon"),
    ("disney", "disney"),
    ("dsnp", "disney"),
    ("hmax", "hbo-max"),
    ("hbo", "hbo-max"),
    ("hulu", "hulu"),
    ("atvp", "apple-tv"),
    ("aptv", "apple-tv"),
    ("pmtp", "paramount"),
    ("pcok", "peacock"),
    ("crunchyroll", "crunchyroll"),
    ("itunes", "itunes"),
];

const EDITIONS: &[(&str, Edition)] = &[
    ("directors.cut", Edition::DirectorsCut),
    ("directors cut", Edition::DirectorsCut),
    ("directors-cut", Edition::DirectorsCut),
    ("dircut", Edition::DirectorsCut),
    ("extended", Edition::Extended),
    ("unrated", Edition::Unrated),
    ("theatrical", Edition::Theatrical),
    ("imax", Edition::Imax),
    ("remastered", Edition::Remastered),
];

pub fn parse(filename: &str) -> ReleaseFacets {
    let lowered = filename.to_lowercase();
    let (release_group, is_popular_group) = extract_group(&lowered);
    ReleaseFacets {
        resolution: find_marker(&lowered, RESOLUTIONS),
        rip: find_marker(&lowered, RIP_TYPES),
        video_codec: find_marker(&lowered, VIDEO_CODECS),
        audio_codec: find_marker(&lowered, AUDIO_CODECS),
        hdr: find_marker(&lowered, HDR_MARKERS),
        platform: find_marker(&lowered, PLATFORMS),
        release_group,
        is_popular_group,
        edition: find_marker(&lowered, EDITIONS),
        proper: contains_token(&lowered, "proper")
            || contains_token(&lowered, "repack")
            || contains_token(&lowered, "rerip"),
    }
}

pub fn strip_extension(name: &str) -> &str {
    const EXTENSIONS: &[&str] = &[
        ".srt", ".vtt", ".ass", ".ssa", ".sub", ".mkv", ".mp4", ".avi", ".m4v", ".ts", ".webm",
    ];
    let lowered = name.to_lowercase();
    for ext in EXTENSIONS {
        if lowered.ends_with(ext) {
            return &name[..name.len() - ext.len()];
        }
    }
    name
}

fn valid_group_token(token: &str) -> bool {
    token.len() >= 2
        && token.chars().all(|c| c.is_ascii_alphanumeric())
        && !GROUP_STOPLIST.contains(&token)
        && !token.chars().all(|c| c.is_ascii_digit())
}

/// Extraction order: `[GROUP]`, `(GROUP)`, trailing `-GROUP`, trailing bare
/// token. Input is already lowercased.
fn extract_group(lowered: &str) -> (Option<String>, bool) {
    let name = strip_extension(lowered);

    for (open, close) in [('[', ']'), ('(', ')')] {
        let mut rest = name;
        while let Some(start) = rest.find(open) {
            let after = &rest[start + 1..];
            let Some(end) = after.find(close) else {
                break;
            };
            let inner = &after[..end];
            if valid_group_token(inner) {
                return (Some(inner.to_string()), POPULAR_GROUPS.contains(&inner));
            }
            rest = &after[end + 1..];
        }
    }

    if let Some(pos) = name.rfind('-') {
        let tail = name[pos + 1..].trim();
        if valid_group_token(tail) {
            return (Some(tail.to_string()), POPULAR_GROUPS.contains(&tail));
        }
    }

    if let Some(tail) = name.rsplit(SEPARATORS).next() {
        let tail = tail.trim();
        if valid_group_token(tail) {
            return (Some(tail.to_string()), POPULAR_GROUPS.contains(&tail));
        }
    }

    (None, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(cases: &[(&str, ReleaseFacets)]) {
        for (name, expected) in cases {
            assert_eq!(&parse(name), expected, "parsing {name}");
        }
    }

    #[test]
    fn typical_web_releases() {
        check(&[
            (
                "Show.S02E05.1080p.WEB-DL.x265-RARBG.mkv",
                ReleaseFacets {
                    resolution: Some(Resolution::R1080),
                    rip: Some(RipType::WebDl),
                    video_codec: Some(VideoCodec::Hevc),
                    release_group: Some("rarbg".into()),
                    is_popular_group: true,
                    ..Default::default()
                },
            ),
            (
                "shogun.2024.s01e05.2160p.NF.web.h265-successfulcrab",
                ReleaseFacets {
                    resolution: Some(Resolution::R2160),
                    rip: Some(RipType::Web),
                    video_codec: Some(VideoCodec::Hevc),
                    platform: Some("netflix"),
                    release_group: Some("successfulcrab".into()),
                    is_popular_group: true,
                    ..Default::default()
                },
            ),
        ]);
    }

    #[test]
    fn specific_markers_win_over_generic() {
        let facets = parse("Movie.2020.WEB-DL.HDR10+.2160p.mkv");
        assert_eq!(facets.rip, Some(RipType::WebDl));
        assert_eq!(facets.hdr, Some(Hdr::Hdr10Plus));

        let facets = parse("Movie.2020.WEBRip.HDR10.1080p.mkv");
        assert_eq!(facets.rip, Some(RipType::WebRip));
        assert_eq!(facets.hdr, Some(Hdr::Hdr10));
    }

    #[test]
    fn bracketed_group() {
        let facets = parse("[SubsPlease] Some Show - 05 (1080p).mkv");
        assert_eq!(facets.release_group.as_deref(), Some("subsplease"));
        assert!(!facets.is_popular_group);
    }

    #[test]
    fn edition_and_proper() {
        let facets = parse("Movie.2019.Directors.Cut.REPACK.1080p.BluRay.DTS.x264-AMIABLE.mkv");
        assert_eq!(facets.edition, Some(Edition::DirectorsCut));
        assert!(facets.proper);
        assert_eq!(facets.rip, Some(RipType::Bluray));
        assert_eq!(facets.audio_codec, Some(AudioCodec::Dts));
        assert_eq!(facets.release_group.as_deref(), Some("amiable"));
        assert!(facets.is_popular_group);
    }

    #[test]
    fn cam_requires_token_boundary() {
        assert_eq!(parse("Camelot.S01E01.720p.HDTV.x264").rip, Some(RipType::Hdtv));
        assert_eq!(parse("Movie.2024.CAM.x264").rip, Some(RipType::Cam));
    }

    #[test]
    fn no_facets_in_plain_title() {
        let facets = parse("Plain Movie Title");
        assert_eq!(facets.resolution, None);
        assert_eq!(facets.rip, None);
        assert!(!facets.proper);
    }

    #[test]
    fn group_stoplist_rejects_facet_tokens() {
        // trailing token after the last dash is `DL`, which is not a group
        let facets = parse("Movie.2020.1080p.WEB-DL");
        assert_eq!(facets.release_group, None);
    }

    #[test]
    fn parse_is_deterministic() {
        let name = "Show.S01E01.720p.HDTV.x264-KILLERS.mkv";
        assert_eq!(parse(name), parse(name));
    }
}
