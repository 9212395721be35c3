//! Translation orchestration.
//!
//! Every translate request resolves to exactly one of: a cached result, a
//! partial snapshot of someone else's in-flight work, a freshly started
//! background translation (served as a loading cue) or a sentinel
//! explaining why nothing happened. Background work is never tied to the
//! request that started it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio_util::task::TaskTracker;

use crate::cache::{CacheEntry, CachePartition, CacheStore};
use crate::config;
use crate::providers::{ProviderError, ProviderRegistry, archive::DecodedDownload};
use crate::srt;
use crate::translate::{
    ProgressFn, TranslateError, TranslationEngine, TranslationProgress,
};

pub const MAX_CONCURRENT_TRANSLATIONS_PER_USER: u32 = 3;

const IN_FLIGHT_CAP: usize = 512;
/// Orphaned futures must not block a key forever.
const IN_FLIGHT_TTL: Duration = Duration::from_secs(30 * 60);
const STATUS_CAP: usize = 1024;
const STATUS_TTL: Duration = Duration::from_secs(10 * 60);
const USER_COUNT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const PARTIAL_TTL: time::Duration = time::Duration::hours(1);
const ERROR_ENTRY_TTL: time::Duration = time::Duration::hours(1);

/// Per-request view of the translation configuration. The facade builds
/// this from the config store and the caller's identity.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub source_file_id: String,
    pub target_language: String,
    /// Opaque caller identity, `"anonymous"` when the client sent none.
    pub user_hash: String,
    pub cache_enabled: bool,
    pub bypass: bool,
    pub bypass_ttl: time::Duration,
    pub min_subtitle_size: u64,
}

impl TranslationRequest {
    pub fn from_config(
        source_file_id: impl Into<String>,
        target_language: impl Into<String>,
        user_hash: Option<String>,
    ) -> Self {
        Self {
            source_file_id: source_file_id.into(),
            target_language: target_language.into(),
            user_hash: user_hash.unwrap_or_else(|| "anonymous".to_string()),
            cache_enabled: config::CONFIG
                .get_value::<config::TranslationCacheEnabled>()
                .0,
            bypass: config::CONFIG.get_value::<config::BypassCacheEnabled>().0,
            bypass_ttl: time::Duration::hours(
                config::CONFIG
                    .get_value::<config::BypassCacheDurationHours>()
                    .0 as i64,
            ),
            min_subtitle_size: config::CONFIG.get_value::<config::MinSubtitleSizeBytes>().0,
        }
    }

    /// Bypass entries are isolated per user, the shared cache is not.
    fn cache_key(&self) -> String {
        let base = format!("{}_{}", self.source_file_id, self.target_language);
        if self.bypass {
            format!("{}__u_{}", base, self.user_hash)
        } else {
            base
        }
    }

    fn partition(&self) -> CachePartition {
        if self.bypass {
            CachePartition::Bypass
        } else {
            CachePartition::Translation
        }
    }

    fn final_ttl(&self) -> Option<time::Duration> {
        self.bypass.then_some(self.bypass_ttl)
    }
}

#[derive(Debug, Clone)]
struct StatusEntry {
    in_progress: bool,
    started_at: Instant,
    user_hash: String,
}

struct OrchestratorInner {
    registry: &'static ProviderRegistry,
    engine: TranslationEngine,
    cache: Arc<CacheStore>,
    tracker: TaskTracker,
    in_flight: Mutex<LruCache<String, Instant>>,
    status: Mutex<LruCache<String, StatusEntry>>,
    user_counts: Mutex<HashMap<String, (u32, Instant)>>,
}

#[derive(Clone)]
pub struct TranslationOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for TranslationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationOrchestrator").finish()
    }
}

impl TranslationOrchestrator {
    pub fn new(
        registry: &'static ProviderRegistry,
        engine: TranslationEngine,
        cache: Arc<CacheStore>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                registry,
                engine,
                cache,
                tracker,
                in_flight: Mutex::new(LruCache::new(NonZeroUsize::new(IN_FLIGHT_CAP).unwrap())),
                status: Mutex::new(LruCache::new(NonZeroUsize::new(STATUS_CAP).unwrap())),
                user_counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Always answers with a parseable SRT, whatever the state of the
    /// translation.
    pub async fn handle_translation(&self, request: TranslationRequest) -> String {
        let key = request.cache_key();

        if request.cache_enabled || request.bypass {
            if let Some(served) = self.serve_cached(&key, &request).await {
                return served;
            }
        }

        if self.is_in_flight(&key) {
            return self.serve_in_progress(&key, &request).await;
        }

        if !self.acquire_user_slot(&request.user_hash) {
            tracing::info!(
                user = request.user_hash,
                "Refusing translation, concurrency cap reached"
            );
            return srt::too_many_translations();
        }

        // Reservation is re-checked under the lock: two identical requests
        // may both have missed the peek above.
        let already_reserved = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            match in_flight.peek(&key) {
                Some(started) if started.elapsed() < IN_FLIGHT_TTL => true,
                _ => {
                    in_flight.put(key.clone(), Instant::now());
                    false
                }
            }
        };
        if already_reserved {
            self.release_user_slot(&request.user_hash);
            return self.serve_in_progress(&key, &request).await;
        }
        self.inner.status.lock().unwrap().put(
            key.clone(),
            StatusEntry {
                in_progress: true,
                started_at: Instant::now(),
                user_hash: request.user_hash.clone(),
            },
        );

        tracing::info!(
            source = request.source_file_id,
            target = request.target_language,
            "Starting background translation"
        );
        let inner = self.inner.clone();
        let task_key = key.clone();
        self.inner.tracker.spawn(async move {
            run_translation(inner, task_key, request).await;
        });

        srt::loading()
    }

    /// True when a background translation currently owns this key.
    fn is_in_flight(&self, key: &str) -> bool {
        {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            match in_flight.peek(key) {
                Some(started) if started.elapsed() < IN_FLIGHT_TTL => return true,
                Some(_) => {
                    in_flight.pop(key);
                }
                None => {}
            }
        }
        // capacity pressure can evict a live in-flight entry, the status
        // map backs it up
        let status = self.inner.status.lock().unwrap();
        match status.peek(key) {
            Some(entry) if entry.in_progress && entry.started_at.elapsed() < STATUS_TTL => {
                tracing::debug!(key, user = entry.user_hash, "Key still owned per status map");
                true
            }
            _ => false,
        }
    }

    /// Serves a cached final entry. Error entries render their cue and are
    /// deleted so that the next click retries.
    async fn serve_cached(&self, key: &str, request: &TranslationRequest) -> Option<String> {
        let partition = request.partition();
        let entry = self.inner.cache.get(key, partition).await?;
        if request.bypass && entry.config_hash.as_deref() != Some(request.user_hash.as_str()) {
            // wrong or missing owner: miss for security
            return None;
        }
        if entry.is_error {
            self.inner.cache.delete(key, partition).await;
            tracing::debug!(key, "Served cached translation error, cleared for retry");
            return Some(srt::translation_error(
                entry.error_type.as_deref().unwrap_or("other"),
                entry.error_message.as_deref().unwrap_or(""),
            ));
        }
        Some(entry.content)
    }

    /// A translation for this key is already running. Never waits: final
    /// cache, then partial snapshot, then a loading cue.
    async fn serve_in_progress(&self, key: &str, request: &TranslationRequest) -> String {
        if request.cache_enabled || request.bypass {
            if let Some(served) = self.serve_cached(key, request).await {
                return served;
            }
        }
        if let Some(partial) = self.inner.cache.get(key, CachePartition::Partial).await {
            let owned = !request.bypass
                || partial.config_hash.as_deref() == Some(request.user_hash.as_str());
            if owned && !partial.content.is_empty() {
                tracing::debug!(key, "Serving partial translation");
                return partial.content;
            }
        }
        srt::loading()
    }

    fn acquire_user_slot(&self, user_hash: &str) -> bool {
        let mut counts = self.inner.user_counts.lock().unwrap();
        counts.retain(|_, (count, touched)| {
            *count > 0 || touched.elapsed() < USER_COUNT_TTL
        });
        let (count, touched) = counts
            .entry(user_hash.to_string())
            .or_insert((0, Instant::now()));
        if *count >= MAX_CONCURRENT_TRANSLATIONS_PER_USER {
            return false;
        }
        *count += 1;
        *touched = Instant::now();
        true
    }

    fn release_user_slot(&self, user_hash: &str) {
        let mut counts = self.inner.user_counts.lock().unwrap();
        if let Some((count, touched)) = counts.get_mut(user_hash) {
            *count = count.saturating_sub(1);
            *touched = Instant::now();
        }
    }

    #[cfg(test)]
    fn active_for_user(&self, user_hash: &str) -> u32 {
        self.inner
            .user_counts
            .lock()
            .unwrap()
            .get(user_hash)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }
}

/// The background job. Owns the in-flight reservation and the user slot,
/// both released on the way out whatever happens.
async fn run_translation(inner: Arc<OrchestratorInner>, key: String, request: TranslationRequest) {
    let sink = Arc::new(PartialSink {
        cache: inner.cache.clone(),
        key: key.clone(),
        request: request.clone(),
        version: AtomicU64::new(0),
        written: Arc::new(tokio::sync::Mutex::new(0)),
    });

    let outcome = translate_job(&inner, &request, sink.clone()).await;
    sink.close().await;

    match outcome {
        Ok(content) => {
            tracing::info!(key, bytes = content.len(), "Translation finished");
            if request.cache_enabled || request.bypass {
                let mut entry = CacheEntry::new(
                    key.clone(),
                    content,
                    request.source_file_id.clone(),
                    request.target_language.clone(),
                    request.final_ttl(),
                );
                if request.bypass {
                    entry = entry.with_config_hash(request.user_hash.clone());
                }
                if let Err(e) = inner.cache.set(&entry, request.partition()).await {
                    tracing::error!(key, "Failed to store finished translation: {e}");
                }
            }
            // final store happens before the partial goes away
            inner.cache.delete(&key, CachePartition::Partial).await;
        }
        Err(err) => {
            tracing::warn!(key, kind = err.error_type(), "Translation failed: {err}");
            if request.cache_enabled || request.bypass {
                let ttl = request.final_ttl().or(Some(ERROR_ENTRY_TTL));
                let mut entry = CacheEntry::new(
                    key.clone(),
                    String::new(),
                    request.source_file_id.clone(),
                    request.target_language.clone(),
                    ttl,
                )
                .into_error(err.error_type(), err.to_string());
                if request.bypass {
                    entry = entry.with_config_hash(request.user_hash.clone());
                }
                if let Err(e) = inner.cache.set(&entry, request.partition()).await {
                    tracing::error!(key, "Failed to store translation error: {e}");
                }
            }
            inner.cache.delete(&key, CachePartition::Partial).await;
        }
    }

    inner.in_flight.lock().unwrap().pop(&key);
    if let Some(status) = inner.status.lock().unwrap().get_mut(&key) {
        status.in_progress = false;
    }
    let mut counts = inner.user_counts.lock().unwrap();
    if let Some((count, touched)) = counts.get_mut(&request.user_hash) {
        *count = count.saturating_sub(1);
        *touched = Instant::now();
    }
}

async fn translate_job(
    inner: &Arc<OrchestratorInner>,
    request: &TranslationRequest,
    sink: Arc<PartialSink>,
) -> Result<String, TranslateError> {
    let source = match inner.registry.download(&request.source_file_id).await {
        Ok(DecodedDownload::Subtitle(text)) => text,
        Ok(DecodedDownload::Rejected(_)) => {
            return Err(TranslateError::InvalidSource(
                "the source download was rejected".to_string(),
            ));
        }
        Err(ProviderError::NotFound) => {
            return Err(TranslateError::InvalidSource(
                "the source subtitle is no longer available".to_string(),
            ));
        }
        Err(ProviderError::RateLimited) => return Err(TranslateError::RateLimited),
        Err(ProviderError::Unavailable) => return Err(TranslateError::Unavailable),
        Err(e) => return Err(TranslateError::Other(e.to_string())),
    };

    if (source.len() as u64) < request.min_subtitle_size {
        return Err(TranslateError::InvalidSource(format!(
            "source is {} bytes, below the {} byte minimum",
            source.len(),
            request.min_subtitle_size
        )));
    }

    let progress: ProgressFn = {
        let sink = sink.clone();
        Arc::new(move |event| sink.clone().handle(event))
    };
    inner
        .engine
        .translate(&source, &request.target_language, Some(progress))
        .await
}

/// Persists in-flight snapshots to the partial partition. Every chunk
/// completion and every streaming delta flushes immediately; each event
/// carries a superset of the previous one, and writes are versioned so a
/// slow flush can never roll an earlier snapshot over a later one.
struct PartialSink {
    cache: Arc<CacheStore>,
    key: String,
    request: TranslationRequest,
    version: AtomicU64,
    written: Arc<tokio::sync::Mutex<u64>>,
}

impl PartialSink {
    fn handle(self: Arc<Self>, event: TranslationProgress) {
        let content = match event {
            TranslationProgress::ChunkCompleted { content, .. } => content,
            TranslationProgress::Partial { content } => content,
        };
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = self.clone();
        tokio::spawn(async move {
            let mut written = sink.written.lock().await;
            if *written >= version {
                // a newer snapshot already reached the disk
                return;
            }
            *written = version;
            let entry = CacheEntry::new(
                sink.key.clone(),
                srt::with_progress_tail(&content),
                sink.request.source_file_id.clone(),
                sink.request.target_language.clone(),
                Some(PARTIAL_TTL),
            )
            .with_config_hash(sink.request.user_hash.clone());
            if let Err(e) = sink.cache.set(&entry, CachePartition::Partial).await {
                tracing::warn!(key = sink.key, "Partial flush failed: {e}");
            }
        });
    }

    /// Blocks any flush that has not hit the disk yet. Called before the
    /// final result replaces the partial entry.
    async fn close(&self) {
        *self.written.lock().await = u64::MAX;
    }
}
