use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_api_key,
    clock::{Clock, SystemClock},
    gifts::GiftRelay,
    handlers::{
        clear_gifts, clear_partition_gifts, create_key, delete_key, describe_key, drain_gifts,
        drain_partition_gifts, health, heartbeat_key, ingest_gift, ingest_partition_gift,
        list_keys, sweep_keys, verify_key,
    },
    keys::{ActivationWindowPolicy, KeyManager, LifecycleConfig},
    reaper::{spawn_reaper, REAPER_INTERVAL},
    store::Store,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub reaper_interval: Duration,
    pub cors_origins: Option<String>,
    pub lifecycle: LifecycleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let lifecycle = lifecycle_from_vars(|name| std::env::var(name).ok());

        Self {
            host: std::env::var("GIFTKEY_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("GIFTKEY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            api_key: std::env::var("GIFTKEY_API_KEY").ok(),
            data_dir: std::env::var("GIFTKEY_DATA_DIR").ok().map(PathBuf::from),
            reaper_interval: REAPER_INTERVAL,
            cors_origins: std::env::var("GIFTKEY_CORS_ORIGINS").ok(),
            lifecycle,
        }
    }
}

/// Lifecycle settings from `GIFTKEY_*` variables. Invalid values are logged
/// and the default is kept.
fn lifecycle_from_vars(var: impl Fn(&str) -> Option<String>) -> LifecycleConfig {
    let mut lifecycle = LifecycleConfig::default();
    if let Some(raw) = var("GIFTKEY_ACTIVATION_WINDOW") {
        match raw.parse::<ActivationWindowPolicy>() {
            Ok(policy) => lifecycle.window_policy = policy,
            Err(e) => warn!(
                error = %e,
                fallback = %lifecycle.window_policy,
                "ignoring invalid GIFTKEY_ACTIVATION_WINDOW"
            ),
        }
    }
    if let Some(raw) = var("GIFTKEY_DEFAULT_DURATION_DAYS") {
        match raw.trim().parse::<u32>() {
            Ok(days) if days > 0 => lifecycle.default_duration_days = days,
            _ => warn!(
                value = %raw,
                fallback = lifecycle.default_duration_days,
                "ignoring invalid GIFTKEY_DEFAULT_DURATION_DAYS"
            ),
        }
    }
    lifecycle
}

/// Resolve the data directory: an explicit path (created if missing) or the
/// platform default.
pub fn resolve_data_dir(explicit: Option<&PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Open the store at `data_dir/giftkey.db`. Failure here means the process
/// must not serve.
pub fn open_store(data_dir: &std::path::Path) -> Result<Store> {
    let db_path = data_dir.join("giftkey.db");
    Store::open(&db_path).with_context(|| format!("open store at {}", db_path.display()))
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = Arc::new(open_store(&data_dir)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let keys = KeyManager::new(store.clone(), cfg.lifecycle);
    let gifts = GiftRelay::new(store);

    info!(
        activation_window = %cfg.lifecycle.window_policy,
        liveness_timeout_secs = cfg.lifecycle.liveness_timeout.as_secs(),
        default_duration_days = cfg.lifecycle.default_duration_days,
        "license key lifecycle configured"
    );

    // The store is reachable; start the reaper.
    let reaper = spawn_reaper(keys.clone(), clock.clone(), cfg.reaper_interval);
    info!(interval_secs = cfg.reaper_interval.as_secs(), "reaper started");

    let state = AppState {
        keys,
        gifts,
        clock,
        api_key: cfg.api_key,
    };
    let app = build_router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "giftkey server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    reaper.stop().await;
    info!("giftkey server stopped");
    served
}

pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    // Public routes: the webhook producer, the polling consumer, and clients
    // verifying their keys.
    let public = Router::new()
        .route("/health", get(health))
        .route("/tiktok-event", post(ingest_gift))
        .route("/get-latest-gifts", get(drain_gifts))
        .route(
            "/gifts/{partition}",
            get(drain_partition_gifts).post(ingest_partition_gift),
        )
        .route("/keys/verify", post(verify_key))
        .route("/keys/heartbeat", post(heartbeat_key));

    // Administrative routes (API key required if configured).
    let protected = Router::new()
        .route("/clear-gifts", post(clear_gifts))
        .route("/gifts/{partition}/clear", post(clear_partition_gifts))
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/sweep", post(sweep_keys))
        .route("/keys/{id}", get(describe_key).delete(delete_key))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn lifecycle_reads_valid_values() {
        let cfg = lifecycle_from_vars(vars(&[
            ("GIFTKEY_ACTIVATION_WINDOW", "creation"),
            ("GIFTKEY_DEFAULT_DURATION_DAYS", "30"),
        ]));
        assert_eq!(cfg.window_policy, ActivationWindowPolicy::StartsAtCreation);
        assert_eq!(cfg.default_duration_days, 30);
    }

    #[test]
    fn lifecycle_keeps_defaults_on_invalid_values() {
        let cfg = lifecycle_from_vars(vars(&[
            ("GIFTKEY_ACTIVATION_WINDOW", "tomorrow"),
            ("GIFTKEY_DEFAULT_DURATION_DAYS", "0"),
        ]));
        let defaults = LifecycleConfig::default();
        assert_eq!(cfg.window_policy, defaults.window_policy);
        assert_eq!(cfg.default_duration_days, defaults.default_duration_days);

        let cfg = lifecycle_from_vars(vars(&[("GIFTKEY_DEFAULT_DURATION_DAYS", "a week")]));
        assert_eq!(cfg.default_duration_days, defaults.default_duration_days);
    }
}
