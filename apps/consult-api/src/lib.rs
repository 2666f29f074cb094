pub mod auth;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use gateway::relay::SignalingRelay;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KeyValueStore>,
    pub config: Arc<Config>,
    pub relay: Arc<SignalingRelay>,
}
