//! Shared application state.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::crypto::SecretBox;
use crate::storage::Storage;
use crate::upstream::BotApi;

pub struct AppState {
    pub storage: Storage,
    pub secrets: SecretBox,
    pub api: Arc<BotApi>,
    /// Externally reachable base URL, for upstream webhook registration.
    pub public_url: Option<String>,
}

pub type SharedState = Arc<Mutex<AppState>>;
