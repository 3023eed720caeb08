pub mod auth;
pub mod clock;
pub mod dirs;
pub mod error;
pub mod gifts;
pub mod handlers;
pub mod keys;
pub mod reaper;
pub mod server;
pub mod store;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub keys: keys::KeyManager,
    pub gifts: gifts::GiftRelay,
    pub clock: Arc<dyn clock::Clock>,
    /// Optional API key guarding administrative routes.
    pub api_key: Option<String>,
}

pub use error::{Error, Result};
pub use server::{build_router, resolve_data_dir, run, ServerConfig};
