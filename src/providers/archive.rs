//! Archive sniffing and extraction for provider download payloads.
//!
//! Providers hand out anything from bare SRT text to nested gzip+tar
//! bundles. Payloads are identified by magic bytes, never by content type
//! headers, because several providers lie about those.

use std::io::{Cursor, Read};

use crate::srt;

/// Archives above this size are refused outright.
pub const MAX_ARCHIVE_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Rar,
    Gzip,
    SevenZip,
    Tar,
}

impl ArchiveKind {
    fn label(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Rar => "rar",
            ArchiveKind::Gzip => "gzip",
            ArchiveKind::SevenZip => "7z",
            ArchiveKind::Tar => "tar",
        }
    }
}

pub fn sniff(bytes: &[u8]) -> Option<ArchiveKind> {
    if bytes.starts_with(b"PK\x03\x04") {
        return Some(ArchiveKind::Zip);
    }
    if bytes.starts_with(b"Rar!\x1a\x07") {
        return Some(ArchiveKind::Rar);
    }
    if bytes.starts_with(&[0x1f, 0x8b]) {
        return Some(ArchiveKind::Gzip);
    }
    if bytes.starts_with(b"7z\xbc\xaf\x27\x1c") {
        return Some(ArchiveKind::SevenZip);
    }
    if bytes.len() > 262 && &bytes[257..262] == b"ustar" {
        return Some(ArchiveKind::Tar);
    }
    None
}

/// Lower is better. `.srt` wins, then formats we can convert or pass
/// through.
fn subtitle_priority(name: &str) -> Option<u8> {
    let lowered = name.to_lowercase();
    if lowered.ends_with(".srt") {
        Some(0)
    } else if lowered.ends_with(".vtt") {
        Some(1)
    } else if lowered.ends_with(".ass") {
        Some(2)
    } else if lowered.ends_with(".ssa") {
        Some(3)
    } else {
        None
    }
}

/// Outcome of decoding a download payload. A rejected payload still yields
/// servable subtitle text (a sentinel cue), but callers that need a real
/// translation source must not treat it as one.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedDownload {
    Subtitle(String),
    Rejected(String),
}

impl DecodedDownload {
    pub fn into_text(self) -> String {
        match self {
            DecodedDownload::Subtitle(text) | DecodedDownload::Rejected(text) => text,
        }
    }

    pub fn subtitle(self) -> Option<String> {
        match self {
            DecodedDownload::Subtitle(text) => Some(text),
            DecodedDownload::Rejected(_) => None,
        }
    }
}

struct ExtractedFile {
    name: String,
    data: Vec<u8>,
}

fn extract_zip(bytes: &[u8]) -> Option<ExtractedFile> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).ok()?;
    let mut best: Option<(u8, usize)> = None;
    for i in 0..archive.len() {
        let Ok(file) = archive.by_index(i) else {
            continue;
        };
        if let Some(priority) = subtitle_priority(file.name()) {
            if best.is_none_or(|(p, _)| priority < p) {
                best = Some((priority, i));
            }
        }
    }
    let (_, index) = best?;
    let mut file = archive.by_index(index).ok()?;
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data).ok()?;
    Some(ExtractedFile {
        name: file.name().to_string(),
        data,
    })
}

fn extract_tar(bytes: &[u8]) -> Option<ExtractedFile> {
    let mut best: Option<ExtractedFile> = None;
    let mut best_priority = u8::MAX;
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries().ok()? {
        let Ok(mut entry) = entry else { continue };
        let name = match entry.path() {
            Ok(path) => path.to_string_lossy().to_string(),
            Err(_) => continue,
        };
        let Some(priority) = subtitle_priority(&name) else {
            continue;
        };
        if priority >= best_priority {
            continue;
        }
        let mut data = Vec::new();
        if entry.read_to_end(&mut data).is_err() {
            continue;
        }
        best_priority = priority;
        best = Some(ExtractedFile { name, data });
    }
    best
}

fn extract_gzip(bytes: &[u8]) -> Option<ExtractedFile> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut data = Vec::new();
    decoder.read_to_end(&mut data).ok()?;
    // .tgz bundles show up as gzip on the outside
    if sniff(&data) == Some(ArchiveKind::Tar) {
        return extract_tar(&data);
    }
    Some(ExtractedFile {
        name: "subtitle.srt".to_string(),
        data,
    })
}

fn decode_text(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    text.trim_start_matches('\u{feff}').to_string()
}

/// Turns a raw download payload into servable subtitle text. Unusable
/// payloads come back as [`DecodedDownload::Rejected`] sentinel cues so the
/// viewer learns why instead of getting a player error.
pub fn decode_download(bytes: &[u8], min_subtitle_size: u64) -> DecodedDownload {
    if (bytes.len() as u64) < min_subtitle_size {
        return DecodedDownload::Rejected(srt::invalid_source(&format!(
            "The source is {} bytes, below the {} byte minimum.",
            bytes.len(),
            min_subtitle_size
        )));
    }

    let Some(kind) = sniff(bytes) else {
        return finish_text(decode_text(bytes), min_subtitle_size);
    };

    if bytes.len() > MAX_ARCHIVE_BYTES {
        return DecodedDownload::Rejected(srt::invalid_source(&format!(
            "The provider returned a {} archive larger than 25 MiB.",
            kind.label()
        )));
    }

    let extracted = match kind {
        ArchiveKind::Zip => extract_zip(bytes),
        ArchiveKind::Gzip => extract_gzip(bytes),
        ArchiveKind::Tar => extract_tar(bytes),
        ArchiveKind::Rar | ArchiveKind::SevenZip => {
            return DecodedDownload::Rejected(srt::invalid_source(&format!(
                "The provider returned a {} archive, which is not supported.",
                kind.label()
            )));
        }
    };

    let Some(file) = extracted else {
        return DecodedDownload::Rejected(srt::invalid_source(&format!(
            "No subtitle file was found inside the {} archive.",
            kind.label()
        )));
    };

    let text = decode_text(&file.data);
    let lowered = file.name.to_lowercase();
    let text = if lowered.ends_with(".ass") || lowered.ends_with(".ssa") {
        match srt::ass_to_srt(&text) {
            Some(converted) => converted,
            None => {
                return DecodedDownload::Rejected(srt::invalid_source(
                    "The archived ASS subtitle had no dialogue events.",
                ));
            }
        }
    } else {
        text
    };
    finish_text(text, min_subtitle_size)
}

fn finish_text(text: String, min_subtitle_size: u64) -> DecodedDownload {
    if (text.len() as u64) < min_subtitle_size {
        return DecodedDownload::Rejected(srt::invalid_source(&format!(
            "The decoded subtitle is {} bytes, below the {} byte minimum.",
            text.len(),
            min_subtitle_size
        )));
    }
    // Bare ASS files sometimes arrive outside any archive
    if text.contains("[Script Info]") && text.contains("Dialogue:") {
        if let Some(converted) = srt::ass_to_srt(&text) {
            return DecodedDownload::Subtitle(converted);
        }
    }
    DecodedDownload::Subtitle(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_SRT: &str = "1\n00:00:01,000 --> 00:00:02,000\nHello archive\n\n\
                              2\n00:00:03,000 --> 00:00:04,000\nSecond cue here\n";

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn sniffs_magic_bytes() {
        assert_eq!(sniff(b"PK\x03\x04rest"), Some(ArchiveKind::Zip));
        assert_eq!(sniff(b"Rar!\x1a\x07\x00"), Some(ArchiveKind::Rar));
        assert_eq!(sniff(&[0x1f, 0x8b, 0x08]), Some(ArchiveKind::Gzip));
        assert_eq!(sniff(b"7z\xbc\xaf\x27\x1c"), Some(ArchiveKind::SevenZip));
        assert_eq!(sniff(b"1\n00:00:01,000"), None);
    }

    #[test]
    fn plain_srt_passes_through() {
        let out = decode_download(SAMPLE_SRT.as_bytes(), 10);
        assert_eq!(out, DecodedDownload::Subtitle(SAMPLE_SRT.to_string()));
    }

    #[test]
    fn tiny_payload_is_refused() {
        let DecodedDownload::Rejected(out) = decode_download(b"hi", 200) else {
            panic!("tiny payload must be rejected");
        };
        assert!(out.contains("below the 200 byte minimum"));
        assert_eq!(srt::parse(&out).len(), 1);
    }

    #[test]
    fn zip_extracts_srt_over_other_formats() {
        let bytes = zip_with(&[
            ("readme.txt", "not a subtitle"),
            ("movie.ass", "[Script Info]\n"),
            ("movie.srt", SAMPLE_SRT),
        ]);
        let out = decode_download(&bytes, 10);
        assert_eq!(out.subtitle().as_deref(), Some(SAMPLE_SRT));
    }

    #[test]
    fn zip_falls_back_to_ass_and_converts() {
        let ass = "[Script Info]\n[Events]\n\
            Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n\
            Dialogue: 0,0:00:01.00,0:00:02.00,Default,,0,0,0,,Converted dialogue line\n";
        let bytes = zip_with(&[("movie.ass", ass)]);
        let out = decode_download(&bytes, 10).subtitle().unwrap();
        let entries = srt::parse(&out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "Converted dialogue line");
    }

    #[test]
    fn gzip_round_trip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(SAMPLE_SRT.as_bytes()).unwrap();
        let bytes = encoder.finish().unwrap();
        let out = decode_download(&bytes, 10);
        assert_eq!(out.subtitle().as_deref(), Some(SAMPLE_SRT));
    }

    #[test]
    fn rar_is_refused_with_sentinel() {
        let mut bytes = b"Rar!\x1a\x07\x00".to_vec();
        bytes.resize(1024, 0);
        let DecodedDownload::Rejected(out) = decode_download(&bytes, 10) else {
            panic!("rar must be rejected");
        };
        assert!(out.contains("not supported"));
    }

    #[test]
    fn empty_zip_is_refused() {
        let bytes = zip_with(&[("readme.txt", "nothing useful in here")]);
        let DecodedDownload::Rejected(out) = decode_download(&bytes, 10) else {
            panic!("zip without subtitles must be rejected");
        };
        assert!(out.contains("No subtitle file"));
    }

    #[test]
    fn vtt_is_preserved_verbatim() {
        let vtt = "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nCue body text here\n";
        let bytes = zip_with(&[("movie.vtt", vtt)]);
        let out = decode_download(&bytes, 10);
        assert_eq!(out.subtitle().as_deref(), Some(vtt));
    }
}
