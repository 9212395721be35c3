//! Multi-provider search fan-out with request coalescing.
//!
//! Identical queries share one in-flight future, completed queries are
//! served from an age-refreshed LRU. The fan-out itself is all-settled: a
//! provider that fails or times out contributes an empty list and the
//! search still answers.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use tokio::task::JoinSet;

use crate::config;
use crate::providers::{MediaType, ProviderRegistry, SearchQuery, SubtitleCandidate};
use crate::scoring;

const COMPLETED_CACHE_CAP: usize = 5000;
const COMPLETED_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const IN_FLIGHT_CAP: usize = 200;
const IN_FLIGHT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub imdb_id: String,
    pub media_type: MediaType,
    pub season: Option<u16>,
    pub episode: Option<u16>,
    /// Union of configured source and target languages, normalized.
    pub languages: Vec<String>,
    pub stream_filename: Option<String>,
    pub per_language_quota: usize,
}

/// Cache identity of a search. The stream filename is deliberately not part
/// of the key: ranking happens on the way out, so every release of the same
/// episode shares one provider round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SearchKey {
    imdb_id: String,
    media_type: MediaType,
    season: Option<u16>,
    episode: Option<u16>,
    languages: Vec<String>,
}

impl SearchKey {
    fn new(params: &SearchParams) -> Self {
        let mut languages = params.languages.clone();
        languages.sort_unstable();
        languages.dedup();
        Self {
            imdb_id: params.imdb_id.clone(),
            media_type: params.media_type,
            season: params.season,
            episode: params.episode,
            languages,
        }
    }
}

type SharedSearch = Shared<BoxFuture<'static, Vec<SubtitleCandidate>>>;

struct AggregatorInner {
    registry: &'static ProviderRegistry,
    completed: Mutex<LruCache<SearchKey, (Instant, Vec<SubtitleCandidate>)>>,
    in_flight: Mutex<LruCache<SearchKey, (Instant, SharedSearch)>>,
}

#[derive(Clone)]
pub struct SearchAggregator {
    inner: Arc<AggregatorInner>,
}

impl std::fmt::Debug for SearchAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchAggregator").finish()
    }
}

impl SearchAggregator {
    pub fn new(registry: &'static ProviderRegistry) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                registry,
                completed: Mutex::new(LruCache::new(
                    NonZeroUsize::new(COMPLETED_CACHE_CAP).unwrap(),
                )),
                in_flight: Mutex::new(LruCache::new(NonZeroUsize::new(IN_FLIGHT_CAP).unwrap())),
            }),
        }
    }

    pub async fn search(&self, params: SearchParams) -> Vec<SubtitleCandidate> {
        let key = SearchKey::new(&params);

        {
            let mut completed = self.inner.completed.lock().unwrap();
            match completed.get_mut(&key) {
                Some((cached_at, results)) if cached_at.elapsed() < COMPLETED_CACHE_TTL => {
                    *cached_at = Instant::now();
                    let results = results.clone();
                    drop(completed);
                    tracing::debug!(imdb_id = params.imdb_id, "Search served from cache");
                    return finalize(&params, results);
                }
                Some(_) => {
                    completed.pop(&key);
                }
                None => {}
            }
        }

        let shared = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            match in_flight.get(&key) {
                Some((started_at, shared)) if started_at.elapsed() < IN_FLIGHT_TTL => {
                    tracing::debug!(imdb_id = params.imdb_id, "Joining in-flight search");
                    shared.clone()
                }
                _ => {
                    let inner = self.inner.clone();
                    let fan_out_key = key.clone();
                    let shared: SharedSearch = async move {
                        let results = fan_out(inner.registry, &fan_out_key).await;
                        inner
                            .completed
                            .lock()
                            .unwrap()
                            .put(fan_out_key.clone(), (Instant::now(), results.clone()));
                        inner.in_flight.lock().unwrap().pop(&fan_out_key);
                        results
                    }
                    .boxed()
                    .shared();
                    in_flight.put(key.clone(), (Instant::now(), shared.clone()));
                    shared
                }
            }
        };

        let results = shared.await;
        finalize(&params, results)
    }
}

/// Launches every registered provider in parallel and merges whatever comes
/// back in time. Results are language-filtered and deduplicated but not yet
/// ranked, so all callers can share them.
async fn fan_out(registry: &'static ProviderRegistry, key: &SearchKey) -> Vec<SubtitleCandidate> {
    let timeout = Duration::from_secs(config::CONFIG.get_value::<config::SearchTimeoutSecs>().0);
    let query = SearchQuery {
        imdb_id: key.imdb_id.clone(),
        media_type: key.media_type,
        season: key.season,
        episode: key.episode,
        languages: key.languages.clone(),
    };

    let mut handles = JoinSet::new();
    for provider in registry.all() {
        let provider = *provider;
        let query = query.clone();
        handles
            .spawn(async move { tokio::time::timeout(timeout, provider.search(&query)).await });
    }

    let mut merged = Vec::new();
    while let Some(result) = handles.join_next().await {
        match result {
            Ok(Ok(Ok(candidates))) => merged.extend(candidates),
            Ok(Ok(Err(e))) => tracing::warn!("Subtitle provider returned an error: {e}"),
            Ok(Err(_)) => tracing::warn!("Subtitle provider timed out"),
            Err(e) => tracing::error!("Subtitle provider task panicked: {e}"),
        }
    }

    let requested: HashSet<&str> = key.languages.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    merged.retain(|candidate| {
        requested.contains(candidate.language_code.as_str())
            && seen.insert(candidate.file_id.clone())
    });
    merged
}

/// Per-request view of a cached result set: configuration filters, then
/// ranking and the per-language quota when the player told us its release.
fn finalize(params: &SearchParams, mut candidates: Vec<SubtitleCandidate>) -> Vec<SubtitleCandidate> {
    let exclude_hi = config::CONFIG.get_value::<config::ExcludeHearingImpaired>().0;
    let season_packs = config::CONFIG.get_value::<config::EnableSeasonPacks>().0;
    candidates.retain(|candidate| {
        if exclude_hi && candidate.hearing_impaired {
            return false;
        }
        if candidate.is_season_pack {
            if !season_packs {
                return false;
            }
            // a pack that declares its range must cover the request
            if let (Some(episode), Some(range)) = (params.episode, candidate.episode_range) {
                if !range.contains(episode) {
                    return false;
                }
            }
        }
        true
    });

    match &params.stream_filename {
        Some(filename) if !filename.is_empty() => {
            scoring::rank_candidates(filename, candidates, params.per_language_quota)
        }
        _ => candidates,
    }
}
