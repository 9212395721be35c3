use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use subtitle_server::app_state::AppState;
use subtitle_server::cache::CacheStore;
use subtitle_server::config::{self, APP_RESOURCES, AppResources, Args, ConfigFile};
use subtitle_server::orchestrator::TranslationOrchestrator;
use subtitle_server::providers::opensubtitles::OpenSubtitlesApi;
use subtitle_server::providers::subdl::SubdlApi;
use subtitle_server::providers::subsource::SubsourceApi;
use subtitle_server::providers::{ProviderRegistry, SubtitleProvider};
use subtitle_server::search::SearchAggregator;
use subtitle_server::server;
use subtitle_server::tracing::init_tracer;
use subtitle_server::translate::{GeminiClient, TranslationEngine};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() {
    Args::parse().apply_configuration();
    if let Err(err) = AppResources::initiate() {
        panic!("Could not initiate app resources: {err}");
    };
    init_tracer(tracing::Level::INFO);

    if let Ok(path) = dotenv() {
        tracing::info!("Loaded env variables from: {}", path.display());
    } else {
        tracing::debug!("No dotfile with env variables found");
    }

    match ConfigFile::open_and_read().await {
        Ok(toml) => config::CONFIG.apply_toml_settings(toml),
        Err(err) => tracing::error!("Error reading config file: {err}"),
    };

    let cancellation_token = CancellationToken::new();

    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    // one pooled client behind every provider and the translation backend
    let http = reqwest::Client::builder()
        .tcp_keepalive(Duration::from_secs(30))
        .build()
        .expect("http client to build");

    let mut providers: Vec<&'static (dyn SubtitleProvider)> = Vec::new();
    if config::CONFIG.get_value::<config::OpensubtitlesEnabled>().0 {
        let key = config::CONFIG.get_value::<config::OpensubtitlesApiKey>().0;
        if key.is_none() {
            tracing::warn!("OpenSubtitles runs anonymously, downloads share a public quota");
        }
        providers.push(Box::leak(Box::new(OpenSubtitlesApi::new(http.clone(), key))));
    }
    if config::CONFIG.get_value::<config::SubdlEnabled>().0 {
        match config::CONFIG.get_value::<config::SubdlApiKey>().0 {
            Some(key) => providers.push(Box::leak(Box::new(SubdlApi::new(http.clone(), key)))),
            None => tracing::warn!("SubDL is enabled but has no api key, skipping it"),
        }
    }
    if config::CONFIG.get_value::<config::SubsourceEnabled>().0 {
        providers.push(Box::leak(Box::new(SubsourceApi::new(http.clone()))));
    }
    if providers.is_empty() {
        tracing::warn!("No subtitle providers are enabled, every search will be empty");
    }
    let registry: &'static ProviderRegistry =
        Box::leak(Box::new(ProviderRegistry::new(providers)));
    tracing::info!(?registry, "Initialized subtitle providers");

    let cache_cap_bytes = config::CONFIG.get_value::<config::TranslationCacheSizeGb>().0
        * 1024
        * 1024
        * 1024;
    let cache = match CacheStore::init(&APP_RESOURCES.cache_path, cache_cap_bytes).await {
        Ok(cache) => Arc::new(cache),
        Err(err) => panic!("Could not initiate translation cache: {err}"),
    };
    {
        let cache = cache.clone();
        let cancellation_token = cancellation_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = cache.sweep().await {
                            tracing::error!("Periodic cache sweep failed: {e}");
                        }
                    }
                    _ = cancellation_token.cancelled() => break,
                }
            }
        });
    }

    let aggregator = SearchAggregator::new(registry);

    let gemini_key = config::CONFIG
        .get_value::<config::GeminiKey>()
        .0
        .unwrap_or_else(|| {
            tracing::warn!(
                "Missing gemini api key, translations will fail until one is configured ({} environment variable)",
                "GEMINI_API_KEY"
            );
            String::new()
        });
    let model = config::CONFIG.get_value::<config::GeminiModel>().0;
    let engine = TranslationEngine::new(Arc::new(GeminiClient::new(
        http.clone(),
        gemini_key,
        model,
    )));

    let tracker = TaskTracker::new();
    let orchestrator =
        TranslationOrchestrator::new(registry, engine, cache.clone(), tracker.clone());

    let app_state = AppState {
        aggregator,
        orchestrator,
        registry,
        cache,
        cancellation_token: cancellation_token.clone(),
    };

    let app = server::app_router().layer(cors).with_state(app_state);

    let port: config::Port = config::CONFIG.get_value();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port.0);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to start server on port {}: {e}", port.0);
            return;
        }
    };
    tracing::info!("Starting server on port {}", port.0);

    {
        let cancellation_token = cancellation_token.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(cancellation_token.cancelled_owned())
                .await
                .unwrap();
        });
    }
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            cancellation_token.cancel();
        }
        _ = cancellation_token.cancelled() => {}
    }
    tracing::trace!("Waiting for background translations to finish");
    tracker.close();
    tracker.wait().await;
    tracing::info!("Gracefully shut down");
}
