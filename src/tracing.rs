use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Fmt subscriber with `RUST_LOG` override. Providers log request URLs at
/// trace level only, credentials never enter spans.
pub fn init_tracer(max_level: Level) {
    let default_filter = format!("subtitle_server={max_level},tower_http=info,warn");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
