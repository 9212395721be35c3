//! Token estimation and chunk planning for large subtitle files.

use crate::srt::{self, SrtEntry};

/// Above this estimated input size the engine always chunks.
pub const SINGLE_SHOT_TOKEN_LIMIT: u64 = 25_000;
/// Chunked mode also kicks in when the input would eat this share of the
/// model's output budget.
pub const OUTPUT_CAP_SHARE: f64 = 0.4;
/// Token budget one chunk aims for.
pub const CHUNK_TOKEN_TARGET: u64 = 12_000;
/// Budget used after a near-empty `MAX_TOKENS` response asked for smaller
/// chunks.
pub const REDUCED_CHUNK_TOKEN_TARGET: u64 = 6_000;

const PACK_TOLERANCE: f64 = 1.2;
const OVERSIZE_FACTOR: f64 = 1.5;

pub const CONTEXT_BEFORE: usize = 6;
pub const CONTEXT_AFTER: usize = 3;

/// Character-count estimate: roughly one token per three bytes, padded 10%
/// because subtitle text skews short-token.
pub fn estimate_tokens(text: &str) -> u64 {
    let thirds = (text.len() as u64).div_ceil(3);
    (thirds as f64 * 1.1).ceil() as u64
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub entries: Vec<SrtEntry>,
    /// Surrounding entries shipped as do-not-translate context.
    pub before: Vec<SrtEntry>,
    pub after: Vec<SrtEntry>,
}

fn entry_tokens(entry: &SrtEntry) -> u64 {
    estimate_tokens(&srt::render(std::slice::from_ref(entry)))
}

/// Greedy packing by token budget. A chunk closes when the next entry would
/// push it past `target * 1.2`; single entries above `target * 1.5` travel
/// alone.
pub fn split_entries(entries: &[SrtEntry], target_tokens: u64) -> Vec<Chunk> {
    let limit = (target_tokens as f64 * PACK_TOLERANCE) as u64;
    let oversize = (target_tokens as f64 * OVERSIZE_FACTOR) as u64;

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;
    let mut current_tokens = 0u64;
    for (i, entry) in entries.iter().enumerate() {
        let tokens = entry_tokens(entry);
        if tokens > oversize {
            if start < i {
                ranges.push((start, i));
            }
            ranges.push((i, i + 1));
            start = i + 1;
            current_tokens = 0;
            continue;
        }
        if start < i && current_tokens + tokens > limit {
            ranges.push((start, i));
            start = i;
            current_tokens = 0;
        }
        current_tokens += tokens;
    }
    if start < entries.len() {
        ranges.push((start, entries.len()));
    }

    ranges
        .into_iter()
        .map(|(from, to)| Chunk {
            entries: entries[from..to].to_vec(),
            before: entries[from.saturating_sub(CONTEXT_BEFORE)..from].to_vec(),
            after: entries[to..(to + CONTEXT_AFTER).min(entries.len())].to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srt::Timestamp;

    fn entry(index: usize, text: &str) -> SrtEntry {
        SrtEntry::new(
            index,
            Timestamp::from_millis(index as u64 * 2000),
            Timestamp::from_millis(index as u64 * 2000 + 1500),
            text,
        )
    }

    #[test]
    fn token_estimate_shape() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 2); // ceil(1 * 1.1)
        let long = "x".repeat(3000);
        assert_eq!(estimate_tokens(&long), 1100);
    }

    #[test]
    fn everything_fits_one_chunk() {
        let entries: Vec<_> = (1..=5).map(|i| entry(i, "short line")).collect();
        let chunks = split_entries(&entries, CHUNK_TOKEN_TARGET);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].entries.len(), 5);
        assert!(chunks[0].before.is_empty());
        assert!(chunks[0].after.is_empty());
    }

    #[test]
    fn packing_respects_budget_and_order() {
        let entries: Vec<_> = (1..=30).map(|i| entry(i, &"dialogue ".repeat(20))).collect();
        // each entry is ~70 tokens; with a target of 100 every chunk holds
        // one or two entries
        let chunks = split_entries(&entries, 100);
        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.entries.len()).sum();
        assert_eq!(total, 30);
        // order is preserved across chunk boundaries
        let indices: Vec<usize> = chunks
            .iter()
            .flat_map(|c| c.entries.iter().map(|e| e.index))
            .collect();
        let expected: Vec<usize> = (1..=30).collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn oversize_entry_travels_alone() {
        let mut entries: Vec<_> = (1..=4).map(|i| entry(i, "short")).collect();
        entries.insert(2, entry(99, &"monologue ".repeat(100)));
        let chunks = split_entries(&entries, 100);
        let lone = chunks
            .iter()
            .find(|c| c.entries.len() == 1 && c.entries[0].index == 99)
            .expect("oversize entry gets its own chunk");
        assert_eq!(lone.entries[0].index, 99);
    }

    #[test]
    fn context_windows_surround_chunks() {
        let entries: Vec<_> = (1..=30).map(|i| entry(i, &"dialogue ".repeat(20))).collect();
        let chunks = split_entries(&entries, 100);
        assert!(chunks.len() >= 3);
        let middle = &chunks[1];
        assert!(!middle.before.is_empty());
        assert!(!middle.after.is_empty());
        assert!(middle.before.len() <= CONTEXT_BEFORE);
        assert!(middle.after.len() <= CONTEXT_AFTER);
        // context is contiguous with the chunk body
        let first_index = middle.entries.first().unwrap().index;
        assert_eq!(middle.before.last().unwrap().index, first_index - 1);
        let last_index = middle.entries.last().unwrap().index;
        assert_eq!(middle.after.first().unwrap().index, last_index + 1);
    }
}
