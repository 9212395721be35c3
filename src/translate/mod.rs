//! Subtitle translation engine.
//!
//! Decides between single-shot and chunked translation by token budget,
//! drives the model with surrounding-context prompts, cleans up what comes
//! back and reassembles a well-formed SRT. Large jobs stream partial
//! content through a progress callback so the orchestrator can persist
//! snapshots.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::providers::language;
use crate::srt;

pub mod chunk;
pub mod gemini;

pub use gemini::{FinishReason, GeminiClient, LlmClient, LlmError};

/// Streaming mode kicks in above this estimated input size.
const STREAMING_TOKEN_LIMIT: u64 = 50_000;
const CHUNK_ATTEMPTS: u32 = 3;
/// Output shorter than this share of the source is not worth keeping after
/// a `MAX_TOKENS` stop.
const PARTIAL_ACCEPT_SHARE: f64 = 0.3;
/// A `MAX_TOKENS` response with less text than this asks for smaller
/// chunks, not just chunking.
const NEAR_EMPTY_OUTPUT_BYTES: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("translation blocked by safety filter")]
    Safety,
    #[error("translation blocked as recitation")]
    Recitation,
    #[error("model ran out of output tokens")]
    MaxTokens {
        should_chunk: bool,
        needs_smaller_chunks: bool,
    },
    #[error("translation service rate limited")]
    RateLimited,
    #[error("translation service unavailable")]
    Unavailable,
    #[error("source subtitle unusable: {0}")]
    InvalidSource(String),
    #[error("translation failed: {0}")]
    Other(String),
}

impl TranslateError {
    /// Wire tag stored in error cache entries and shown in error cues.
    pub fn error_type(&self) -> &'static str {
        match self {
            TranslateError::Safety => "SAFETY",
            TranslateError::Recitation => "RECITATION",
            TranslateError::MaxTokens { .. } => "MAX_TOKENS",
            TranslateError::RateLimited => "429",
            TranslateError::Unavailable => "503",
            TranslateError::InvalidSource(_) => "INVALID_SOURCE",
            TranslateError::Other(_) => "other",
        }
    }
}

impl From<LlmError> for TranslateError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited => TranslateError::RateLimited,
            LlmError::Unavailable => TranslateError::Unavailable,
            LlmError::MissingKey => {
                TranslateError::Other("translation api key is not configured".to_string())
            }
            LlmError::Transport(msg) | LlmError::InvalidResponse(msg) => {
                TranslateError::Other(msg)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum TranslationProgress {
    /// Full translation so far, including the partially streamed current
    /// chunk. Monotonically growing.
    Partial { content: String },
    /// A chunk finished; `content` is every completed chunk merged.
    ChunkCompleted {
        completed: usize,
        total: usize,
        content: String,
    },
}

pub type ProgressFn = Arc<dyn Fn(TranslationProgress) + Send + Sync>;

const CONTEXT_BEFORE_MARKER: &str = "=== CONTEXT BEFORE (DO NOT TRANSLATE) ===";
const TRANSLATE_MARKER: &str = "=== TRANSLATE ONLY THIS SECTION ===";
const CONTEXT_AFTER_MARKER: &str = "=== CONTEXT AFTER (DO NOT TRANSLATE) ===";
const END_MARKER: &str = "=== END ===";

pub struct TranslationEngine {
    client: Arc<dyn LlmClient>,
    chunk_pacing: Duration,
    retry_base: Duration,
}

impl std::fmt::Debug for TranslationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationEngine").finish()
    }
}

impl TranslationEngine {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            chunk_pacing: Duration::from_millis(500),
            retry_base: Duration::from_secs(2),
        }
    }

    /// Test constructor with compressed delays.
    pub fn with_timing(client: Arc<dyn LlmClient>, pacing: Duration, retry_base: Duration) -> Self {
        Self {
            client,
            chunk_pacing: pacing,
            retry_base,
        }
    }

    /// Translates SRT text into `target_language` (ISO-639-2/B code).
    pub async fn translate(
        &self,
        source: &str,
        target_language: &str,
        progress: Option<ProgressFn>,
    ) -> Result<String, TranslateError> {
        let entries = srt::parse(source);
        if entries.is_empty() {
            return Err(TranslateError::InvalidSource(
                "no parseable subtitle entries".to_string(),
            ));
        }

        let estimated = chunk::estimate_tokens(source);
        let output_cap = self.client.output_token_cap();
        let needs_chunks = estimated > chunk::SINGLE_SHOT_TOKEN_LIMIT
            || estimated as f64 > output_cap as f64 * chunk::OUTPUT_CAP_SHARE;
        tracing::debug!(
            estimated,
            output_cap,
            chunked = needs_chunks,
            "Planned translation"
        );

        if !needs_chunks {
            match self.single_shot(source, target_language).await {
                Err(TranslateError::MaxTokens {
                    should_chunk: true,
                    needs_smaller_chunks,
                }) => {
                    tracing::warn!("Single-shot hit the output cap, retrying chunked");
                    let target = if needs_smaller_chunks {
                        chunk::REDUCED_CHUNK_TOKEN_TARGET
                    } else {
                        chunk::CHUNK_TOKEN_TARGET
                    };
                    return self
                        .chunked(&entries, target_language, target, estimated, progress)
                        .await;
                }
                other => return other,
            }
        }

        self.chunked(
            &entries,
            target_language,
            chunk::CHUNK_TOKEN_TARGET,
            estimated,
            progress,
        )
        .await
    }

    async fn single_shot(
        &self,
        source: &str,
        target_language: &str,
    ) -> Result<String, TranslateError> {
        let prompt = single_prompt(source, target_language);
        let result = self.client.generate(&prompt).await?;
        match result.finish_reason {
            FinishReason::Safety => Err(TranslateError::Safety),
            FinishReason::Recitation => Err(TranslateError::Recitation),
            FinishReason::MaxTokens => {
                if result.text.len() as f64 >= source.len() as f64 * PARTIAL_ACCEPT_SHARE {
                    tracing::warn!("Accepting truncated translation past the output cap");
                    finish_output(&result.text)
                } else {
                    Err(TranslateError::MaxTokens {
                        should_chunk: true,
                        needs_smaller_chunks: result.text.trim().len() < NEAR_EMPTY_OUTPUT_BYTES,
                    })
                }
            }
            FinishReason::Stop | FinishReason::Other => finish_output(&result.text),
        }
    }

    async fn chunked(
        &self,
        entries: &[srt::SrtEntry],
        target_language: &str,
        chunk_target: u64,
        estimated_tokens: u64,
        progress: Option<ProgressFn>,
    ) -> Result<String, TranslateError> {
        let chunks = chunk::split_entries(entries, chunk_target);
        let total = chunks.len();
        let streaming = estimated_tokens > STREAMING_TOKEN_LIMIT;
        tracing::info!(total, streaming, "Translating in chunks");

        let mut completed_parts: Vec<String> = Vec::new();
        for (i, part) in chunks.iter().enumerate() {
            let prompt = chunk_prompt(part, target_language);
            let chunk_source_len = srt::render(&part.entries).len();
            let result = self
                .run_chunk(&prompt, streaming, &completed_parts, progress.as_ref())
                .await?;

            let text = match result.finish_reason {
                FinishReason::Safety => return Err(TranslateError::Safety),
                FinishReason::Recitation => return Err(TranslateError::Recitation),
                FinishReason::MaxTokens
                    if (result.text.len() as f64)
                        < chunk_source_len as f64 * PARTIAL_ACCEPT_SHARE =>
                {
                    return Err(TranslateError::MaxTokens {
                        should_chunk: false,
                        needs_smaller_chunks: true,
                    });
                }
                _ => result.text,
            };

            completed_parts.push(srt::cleanup_model_output(&text));
            if let Some(progress) = &progress {
                progress(TranslationProgress::ChunkCompleted {
                    completed: i + 1,
                    total,
                    content: completed_parts.join("\n\n"),
                });
            }
            if i + 1 < total {
                let pacing =
                    self.chunk_pacing + Duration::from_millis(rand::rng().random_range(0..=500));
                tokio::time::sleep(pacing).await;
            }
        }

        finish_output(&completed_parts.join("\n\n"))
    }

    /// One chunk with backoff retries on transient model failures.
    async fn run_chunk(
        &self,
        prompt: &str,
        streaming: bool,
        completed_parts: &[String],
        progress: Option<&ProgressFn>,
    ) -> Result<gemini::GenerationResult, TranslateError> {
        let prefix = completed_parts.join("\n\n");
        let mut attempt = 0;
        loop {
            let outcome = if streaming {
                let accumulated = Mutex::new(String::new());
                let on_delta = |delta: &str| {
                    let mut accumulated = accumulated.lock().unwrap();
                    accumulated.push_str(delta);
                    if let Some(progress) = progress {
                        let current = srt::cleanup_model_output(&accumulated);
                        let content = if prefix.is_empty() {
                            current
                        } else {
                            format!("{prefix}\n\n{current}")
                        };
                        progress(TranslationProgress::Partial { content });
                    }
                };
                self.client.generate_streaming(prompt, &on_delta).await
            } else {
                self.client.generate(prompt).await
            };

            match outcome {
                Ok(result) => return Ok(result),
                Err(err @ (LlmError::Unavailable | LlmError::Transport(_)))
                    if attempt + 1 < CHUNK_ATTEMPTS =>
                {
                    let delay = self.retry_base * 2u32.pow(attempt);
                    tracing::warn!(attempt, delay = ?delay, "Chunk translation failed, retrying: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Cleanup + reassembly shared by both translation modes.
fn finish_output(raw: &str) -> Result<String, TranslateError> {
    let cleaned = srt::cleanup_model_output(raw);
    let normalized = srt::normalize_translated(&cleaned);
    if srt::parse(&normalized).is_empty() {
        return Err(TranslateError::Other(
            "model output contained no subtitle entries".to_string(),
        ));
    }
    Ok(normalized)
}

fn language_name(code: &str) -> &str {
    language::display_name(code).unwrap_or(code)
}

fn single_prompt(source: &str, target_language: &str) -> String {
    format!(
        "You are a professional subtitle translator. Translate the SubRip \
         subtitles below into {language}.\n\
         Rules:\n\
         - Keep every entry index and timecode exactly as it is.\n\
         - Keep the number of entries and their line breaks.\n\
         - Translate only the dialogue text.\n\
         - Output nothing but the translated SRT entries.\n\n\
         {translate_marker}\n{source}\n{end_marker}",
        language = language_name(target_language),
        translate_marker = TRANSLATE_MARKER,
        end_marker = END_MARKER,
    )
}

fn chunk_prompt(part: &chunk::Chunk, target_language: &str) -> String {
    let mut prompt = format!(
        "You are a professional subtitle translator. Translate one section \
         of a SubRip file into {language}.\n\
         Rules:\n\
         - Keep every entry index and timecode exactly as it is.\n\
         - Keep the number of entries and their line breaks.\n\
         - The context sections exist only for continuity. Do not translate \
         them and do not repeat them in the output.\n\
         - Output nothing but the translated entries of the marked section.\n\n",
        language = language_name(target_language),
    );
    if !part.before.is_empty() {
        prompt.push_str(CONTEXT_BEFORE_MARKER);
        prompt.push('\n');
        prompt.push_str(&srt::render(&part.before));
        prompt.push('\n');
    }
    prompt.push_str(TRANSLATE_MARKER);
    prompt.push('\n');
    prompt.push_str(&srt::render(&part.entries));
    prompt.push('\n');
    if !part.after.is_empty() {
        prompt.push_str(CONTEXT_AFTER_MARKER);
        prompt.push('\n');
        prompt.push_str(&srt::render(&part.after));
        prompt.push('\n');
    }
    prompt.push_str(END_MARKER);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemini::GenerationResult;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted model: translates by uppercasing the dialogue of the marked
    /// section. Optional failures before success.
    struct EchoClient {
        cap: u64,
        calls: AtomicU32,
        fail_first: AtomicU32,
        max_tokens_first: bool,
    }

    impl EchoClient {
        fn new(cap: u64) -> Self {
            Self {
                cap,
                calls: AtomicU32::new(0),
                fail_first: AtomicU32::new(0),
                max_tokens_first: false,
            }
        }

        fn translate_section(prompt: &str) -> String {
            let start = prompt
                .find(TRANSLATE_MARKER)
                .map(|i| i + TRANSLATE_MARKER.len())
                .unwrap_or(0);
            let rest = &prompt[start..];
            let end = rest
                .find(CONTEXT_AFTER_MARKER)
                .or_else(|| rest.find(END_MARKER))
                .unwrap_or(rest.len());
            let mut entries = srt::parse(&rest[..end]);
            for entry in &mut entries {
                entry.text = entry.text.to_uppercase();
            }
            srt::render(&entries)
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for EchoClient {
        fn output_token_cap(&self) -> u64 {
            self.cap
        }

        async fn generate(&self, prompt: &str) -> Result<GenerationResult, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > call {
                return Err(LlmError::Unavailable);
            }
            if self.max_tokens_first && call == 0 {
                return Ok(GenerationResult {
                    text: "1\n".to_string(),
                    finish_reason: FinishReason::MaxTokens,
                });
            }
            Ok(GenerationResult {
                text: Self::translate_section(prompt),
                finish_reason: FinishReason::Stop,
            })
        }

        async fn generate_streaming(
            &self,
            prompt: &str,
            on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        ) -> Result<GenerationResult, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = Self::translate_section(prompt);
            let mid = text.len() / 2;
            // split on a char boundary near the middle
            let mid = (mid..text.len()).find(|i| text.is_char_boundary(*i)).unwrap();
            on_delta(&text[..mid]);
            on_delta(&text[mid..]);
            Ok(GenerationResult {
                text,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn source(entries: usize, line: &str) -> String {
        let entries: Vec<srt::SrtEntry> = (0..entries)
            .map(|i| {
                srt::SrtEntry::new(
                    i + 1,
                    srt::Timestamp::from_millis(i as u64 * 2000),
                    srt::Timestamp::from_millis(i as u64 * 2000 + 1500),
                    format!("{line} {i}"),
                )
            })
            .collect();
        srt::render(&entries)
    }

    fn engine(client: Arc<dyn LlmClient>) -> TranslationEngine {
        TranslationEngine::with_timing(
            client,
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn single_shot_translation() {
        let client = Arc::new(EchoClient::new(65_536));
        let engine = engine(client.clone());
        let out = engine
            .translate(&source(3, "hello there"), "spa", None)
            .await
            .unwrap();
        let entries = srt::parse(&out);
        assert_eq!(entries.len(), 3);
        assert!(entries[0].text.contains("HELLO THERE"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_source_is_invalid() {
        let client = Arc::new(EchoClient::new(65_536));
        let engine = engine(client);
        let err = engine.translate("not srt at all", "spa", None).await.unwrap_err();
        assert_eq!(err.error_type(), "INVALID_SOURCE");
    }

    #[tokio::test]
    async fn large_input_is_chunked_and_reindexed() {
        let client = Arc::new(EchoClient::new(8_192));
        let engine = engine(client.clone());
        // ~400 entries of ~40 tokens force several chunks against the
        // 8k-cap threshold
        let source = source(400, &"long dialogue line that keeps going ".repeat(3));
        let out = engine.translate(&source, "fre", None).await.unwrap();
        let entries = srt::parse(&out);
        assert_eq!(entries.len(), 400);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.index, i + 1);
        }
        assert!(client.calls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn chunk_progress_is_monotone() {
        let client = Arc::new(EchoClient::new(8_192));
        let engine = engine(client);
        let source = source(400, &"long dialogue line that keeps going ".repeat(3));
        let seen: Arc<Mutex<Vec<(usize, usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressFn = Arc::new(move |event| {
            if let TranslationProgress::ChunkCompleted {
                completed,
                total,
                content,
            } = event
            {
                sink.lock().unwrap().push((completed, total, content.len()));
            }
        });
        engine.translate(&source, "ger", Some(progress)).await.unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen.len() > 1);
        for pair in seen.windows(2) {
            assert_eq!(pair[0].0 + 1, pair[1].0);
            assert_eq!(pair[0].1, pair[1].1);
            assert!(pair[0].2 < pair[1].2, "partial content must grow");
        }
        assert_eq!(seen.last().unwrap().0, seen.last().unwrap().1);
    }

    #[tokio::test]
    async fn max_tokens_single_shot_falls_back_to_chunks() {
        let client = Arc::new(EchoClient {
            cap: 65_536,
            calls: AtomicU32::new(0),
            fail_first: AtomicU32::new(0),
            max_tokens_first: true,
        });
        let engine = engine(client.clone());
        let out = engine
            .translate(&source(5, "fallback line"), "ita", None)
            .await
            .unwrap();
        assert_eq!(srt::parse(&out).len(), 5);
        assert!(client.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn transient_unavailability_is_retried() {
        let client = Arc::new(EchoClient {
            cap: 8_192,
            calls: AtomicU32::new(0),
            fail_first: AtomicU32::new(2),
            max_tokens_first: false,
        });
        let engine = engine(client.clone());
        let source = source(400, &"long dialogue line that keeps going ".repeat(3));
        let out = engine.translate(&source, "spa", None).await.unwrap();
        assert_eq!(srt::parse(&out).len(), 400);
    }

    #[tokio::test]
    async fn streaming_emits_partial_events() {
        let client = Arc::new(EchoClient::new(1_000_000));
        let engine = engine(client);
        // push the estimate past the streaming threshold
        let source = source(1200, &"very long dialogue that keeps going on ".repeat(4));
        assert!(chunk::estimate_tokens(&source) > 50_000);
        let partials = Arc::new(AtomicU32::new(0));
        let sink = partials.clone();
        let progress: ProgressFn = Arc::new(move |event| {
            if matches!(event, TranslationProgress::Partial { .. }) {
                sink.fetch_add(1, Ordering::SeqCst);
            }
        });
        engine.translate(&source, "por", Some(progress)).await.unwrap();
        assert!(partials.load(Ordering::SeqCst) > 0);
    }
}
