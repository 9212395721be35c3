//! SubRip parsing, rendering and the synthesized cues the server speaks
//! through the normal subtitle channel.

use std::fmt::Display;

/// End time used by synthesized cues so they stay visible wherever the
/// viewer seeks. This is a sentinel, not a claim about media duration.
pub const SENTINEL_END: Timestamp = Timestamp::from_millis(4 * 60 * 60 * 1000);

pub const PROGRESS_TAIL_TEXT: &str =
    "TRANSLATION IN PROGRESS\nReload this subtitle later to get more";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    millis: u64,
}

impl Timestamp {
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Parses `HH:MM:SS,mmm`. The `.` millisecond separator used by WebVTT
    /// is accepted too.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (clock, millis) = raw
            .rsplit_once(',')
            .or_else(|| raw.rsplit_once('.'))
            .unwrap_or((raw, "0"));
        let mut parts = clock.split(':');
        let hours: u64 = parts.next()?.trim().parse().ok()?;
        let minutes: u64 = parts.next()?.trim().parse().ok()?;
        let seconds: u64 = parts.next()?.trim().parse().ok()?;
        if parts.next().is_some() || minutes > 59 || seconds > 59 {
            return None;
        }
        let millis: u64 = millis.trim().parse().ok()?;
        if millis > 999 {
            return None;
        }
        Some(Self::from_millis(
            ((hours * 60 + minutes) * 60 + seconds) * 1000 + millis,
        ))
    }

    /// Parses the `H:MM:SS.cc` centisecond form used by ASS/SSA events.
    pub fn parse_ass(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (clock, centis) = raw.rsplit_once('.')?;
        let mut parts = clock.split(':');
        let hours: u64 = parts.next()?.parse().ok()?;
        let minutes: u64 = parts.next()?.parse().ok()?;
        let seconds: u64 = parts.next()?.parse().ok()?;
        let centis: u64 = centis.parse().ok()?;
        Some(Self::from_millis(
            ((hours * 60 + minutes) * 60 + seconds) * 1000 + centis * 10,
        ))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let millis = self.millis % 1000;
        let seconds = self.millis / 1000;
        write!(
            f,
            "{:02}:{:02}:{:02},{:03}",
            seconds / 3600,
            seconds / 60 % 60,
            seconds % 60,
            millis
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtEntry {
    pub index: usize,
    pub start: Timestamp,
    pub end: Timestamp,
    pub text: String,
}

impl SrtEntry {
    pub fn new(index: usize, start: Timestamp, end: Timestamp, text: impl Into<String>) -> Self {
        Self {
            index,
            start,
            end,
            text: text.into(),
        }
    }
}

/// Tolerant SubRip parser. Blocks without a parseable timecode line are
/// skipped, so WebVTT headers and NOTE blocks fall through silently.
pub fn parse(text: &str) -> Vec<SrtEntry> {
    let normalized = normalize_newlines(text);
    let mut entries = Vec::new();
    for block in normalized.split("\n\n") {
        let mut lines = block.lines().filter(|l| !l.trim().is_empty()).peekable();
        let index = match lines.peek() {
            Some(first) if first.trim().chars().all(|c| c.is_ascii_digit()) => {
                let index = first.trim().parse().unwrap_or(entries.len() + 1);
                lines.next();
                index
            }
            _ => entries.len() + 1,
        };
        let Some((start, end)) = lines.next().and_then(parse_timecode_line) else {
            continue;
        };
        let text: Vec<&str> = lines.collect();
        entries.push(SrtEntry {
            index,
            start,
            end,
            text: text.join("\n"),
        });
    }
    entries
}

fn parse_timecode_line(line: &str) -> Option<(Timestamp, Timestamp)> {
    let (start, end) = line.split_once("-->")?;
    // WebVTT cue settings may trail the end timestamp
    let end = end.trim().split_whitespace().next()?;
    Some((Timestamp::parse(start)?, Timestamp::parse(end)?))
}

pub fn render(entries: &[SrtEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            entry.index, entry.start, entry.end, entry.text
        ));
    }
    out
}

/// Renumbers entries sequentially from 1, keeping their order.
pub fn reindex(entries: &mut [SrtEntry]) {
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.index = i + 1;
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Strips markdown fences the model likes to wrap output in and normalizes
/// line endings.
pub fn cleanup_model_output(raw: &str) -> String {
    let mut text = normalize_newlines(raw);
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        let without_open = match trimmed.split_once('\n') {
            Some((_fence, rest)) => rest,
            None => "",
        };
        let without_close = without_open
            .trim_end()
            .strip_suffix("```")
            .unwrap_or(without_open);
        text = without_close.to_string();
    }
    text.trim().to_string()
}

/// Final pass over merged translation output: drop entries the model
/// emptied or broke, remove timecodes it inlined into dialogue and
/// renumber from 1.
pub fn normalize_translated(merged: &str) -> String {
    let mut entries: Vec<SrtEntry> = parse(merged)
        .into_iter()
        .filter_map(|mut entry| {
            let text = strip_inline_timecodes(&entry.text);
            if text.trim().is_empty() {
                return None;
            }
            entry.text = text;
            Some(entry)
        })
        .collect();
    reindex(&mut entries);
    render(&entries)
}

/// Removes stray `HH:MM:SS,mmm` tokens and `-->` lines that leaked from the
/// prompt into translated dialogue.
fn strip_inline_timecodes(text: &str) -> String {
    let lines: Vec<String> = text
        .lines()
        .filter(|line| !(line.contains("-->") && parse_timecode_line(line).is_some()))
        .map(|line| {
            line.split_whitespace()
                .filter(|token| Timestamp::parse(token).is_none() || token.len() < 8)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.trim().is_empty())
        .collect();
    lines.join("\n")
}

/// Converts ASS/SSA events to SubRip. Returns `None` when no dialogue line
/// survives.
pub fn ass_to_srt(text: &str) -> Option<String> {
    let mut entries = Vec::new();
    for line in normalize_newlines(text).lines() {
        let Some(event) = line.trim().strip_prefix("Dialogue:") else {
            continue;
        };
        // Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text
        let fields: Vec<&str> = event.splitn(10, ',').collect();
        if fields.len() != 10 {
            continue;
        }
        let (Some(start), Some(end)) = (
            Timestamp::parse_ass(fields[1]),
            Timestamp::parse_ass(fields[2]),
        ) else {
            continue;
        };
        let dialogue = strip_ass_tags(fields[9]);
        if dialogue.trim().is_empty() {
            continue;
        }
        entries.push(SrtEntry::new(0, start, end, dialogue));
    }
    if entries.is_empty() {
        return None;
    }
    entries.sort_by_key(|e| e.start);
    reindex(&mut entries);
    Some(render(&entries))
}

fn strip_ass_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            '\\' if depth == 0 => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('h') => {
                    chars.next();
                    out.push(' ');
                }
                _ => out.push(c),
            },
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

// Synthesized cues. Each one spans the whole sentinel timeline so the
// viewer sees it regardless of seek position.

fn single_cue(text: &str) -> String {
    render(&[SrtEntry::new(
        1,
        Timestamp::from_millis(500),
        SENTINEL_END,
        text,
    )])
}

pub fn loading() -> String {
    single_cue(
        "Translation in progress...\n\
         The subtitle is being translated in the background.\n\
         Select this subtitle again in a minute to load the result.",
    )
}

pub fn too_many_translations() -> String {
    single_cue(
        "Too many concurrent translations.\n\
         Wait for one of your running translations to finish, then try again.",
    )
}

pub fn invalid_source(detail: &str) -> String {
    single_cue(&format!(
        "This subtitle could not be used as a translation source.\n{detail}\n\
         Pick another subtitle and try again."
    ))
}

pub fn download_failed(detail: &str) -> String {
    single_cue(&format!(
        "Subtitle download failed.\n{detail}\nPick another subtitle or try again later."
    ))
}

pub fn translation_error(error_type: &str, message: &str) -> String {
    let explanation = match error_type {
        "429" => "The translation service is rate limited right now.",
        "503" => "The translation service is overloaded right now.",
        "SAFETY" => "The translation was blocked by the provider's safety filter.",
        "RECITATION" => "The translation was blocked as recitation of protected content.",
        "MAX_TOKENS" => "The subtitle is too large for the selected model.",
        "INVALID_SOURCE" => "The source subtitle looks empty or malformed.",
        _ => "The translation failed.",
    };
    let mut text = format!("Translation error ({error_type}).\n{explanation}");
    if !message.is_empty() {
        text.push('\n');
        text.push_str(message);
    }
    text.push_str("\nSelect this subtitle again to retry.");
    single_cue(&text)
}

/// Prepares an in-flight snapshot for serving: reparse what we have,
/// renumber and append a trailing cue telling the viewer more is coming.
/// Raw text without a single parseable entry gets a short tail block
/// appended instead.
pub fn with_progress_tail(partial: &str) -> String {
    let mut entries = parse(partial);
    if entries.is_empty() {
        let mut out = partial.trim_end().to_string();
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!(
            "1\n00:00:00,500 --> {SENTINEL_END}\n{PROGRESS_TAIL_TEXT}\n"
        ));
        return out;
    }
    reindex(&mut entries);
    let last_end = entries.last().map(|e| e.end).unwrap_or(Timestamp::from_millis(0));
    let tail_start = if last_end < SENTINEL_END {
        last_end
    } else {
        Timestamp::from_millis(0)
    };
    entries.push(SrtEntry::new(
        entries.len() + 1,
        tail_start,
        SENTINEL_END,
        PROGRESS_TAIL_TEXT,
    ));
    render(&entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1\n00:00:01,000 --> 00:00:02,500\nHello there\n\n\
                          2\n00:00:03,000 --> 00:00:04,000\nSecond line\nwith continuation\n";

    #[test]
    fn parse_sample() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].start, Timestamp::from_millis(1000));
        assert_eq!(entries[0].end, Timestamp::from_millis(2500));
        assert_eq!(entries[1].text, "Second line\nwith continuation");
    }

    #[test]
    fn parse_is_render_stable() {
        let first = parse(SAMPLE);
        let second = parse(&render(&first));
        assert_eq!(first, second);
    }

    #[test]
    fn parse_accepts_crlf_and_missing_index() {
        let raw = "00:00:01,000 --> 00:00:02,000\r\nNo index\r\n\r\n";
        let entries = parse(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[0].text, "No index");
    }

    #[test]
    fn parse_skips_vtt_header() {
        let raw = "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nCue text\n";
        let entries = parse(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "Cue text");
    }

    #[test]
    fn timestamp_formats() {
        assert_eq!(Timestamp::parse("01:02:03,456").unwrap().millis(), 3_723_456);
        assert_eq!(Timestamp::parse("00:00:01.500").unwrap().millis(), 1500);
        assert!(Timestamp::parse("garbage").is_none());
        assert_eq!(Timestamp::from_millis(3_723_456).to_string(), "01:02:03,456");
    }

    #[test]
    fn cleanup_strips_code_fence() {
        let raw = "```srt\n1\n00:00:01,000 --> 00:00:02,000\nHola\n```";
        let cleaned = cleanup_model_output(raw);
        assert!(cleaned.starts_with('1'));
        assert!(!cleaned.contains("```"));
    }

    #[test]
    fn normalize_drops_empty_entries_and_reindexes() {
        let raw = "7\n00:00:01,000 --> 00:00:02,000\nKept\n\n\
                   9\n00:00:03,000 --> 00:00:04,000\n\n\n\
                   11\n00:00:05,000 --> 00:00:06,000\nAlso kept\n";
        let entries = parse(&normalize_translated(raw));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[1].index, 2);
        assert_eq!(entries[1].text, "Also kept");
    }

    #[test]
    fn normalize_strips_inline_timecodes() {
        let raw = "1\n00:00:01,000 --> 00:00:02,000\n00:00:09,000 --> 00:00:10,000\nActual text\n";
        let out = normalize_translated(raw);
        let entries = parse(&out);
        assert_eq!(entries[0].text, "Actual text");
    }

    #[test]
    fn ass_conversion() {
        let ass = "[Events]\n\
            Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n\
            Dialogue: 0,0:00:01.00,0:00:02.50,Default,,0,0,0,,{\\i1}Hello{\\i0} there\\Nsecond line\n";
        let srt = ass_to_srt(ass).unwrap();
        let entries = parse(&srt);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "Hello there\nsecond line");
        assert_eq!(entries[0].start, Timestamp::from_millis(1000));
        assert_eq!(entries[0].end, Timestamp::from_millis(2500));
    }

    #[test]
    fn progress_tail_appends_sentinel_cue() {
        let partial = "1\n00:00:01,000 --> 00:00:02,000\nTranslated\n";
        let entries = parse(&with_progress_tail(partial));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].end, SENTINEL_END);
        assert!(entries[1].text.contains("TRANSLATION IN PROGRESS"));
    }

    #[test]
    fn progress_tail_on_unparseable_text() {
        let out = with_progress_tail("not srt yet");
        assert!(out.starts_with("not srt yet"));
        assert!(out.contains(PROGRESS_TAIL_TEXT.lines().next().unwrap()));
    }

    #[test]
    fn sentinel_cues_parse() {
        for srt in [
            loading(),
            too_many_translations(),
            invalid_source("too small"),
            translation_error("429", "slow down"),
        ] {
            let entries = parse(&srt);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].end, SENTINEL_END);
        }
    }
}
