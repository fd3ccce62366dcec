//! botmirror server: HTTP surface over the synchronization core.
//!
//! Hosts the tenant management API, receives webhook deliveries, and
//! proxies Bot API method calls, with all observed traffic feeding the
//! entity catalog in SQLite.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod utils;

use std::sync::Arc;

use clap::Parser;

use crate::crypto::SecretBox;
use crate::storage::Storage;
use crate::upstream::BotApi;

use config::{Cli, Config, UPSTREAM_TIMEOUT_SECS};
use state::{AppState, SharedState};

/// Entry point: parse CLI, open storage, start server.
pub async fn run() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    crate::logging::init();

    crate::mlog!("botmirror starting");
    crate::mlog!("  database: {}", config.db_path.display());
    crate::mlog!("  remote api: {}", config.api_url);
    match &config.public_url {
        Some(url) => crate::mlog!("  public url: {}", url),
        None => crate::mlog!("  public url: none configured (webhook registration disabled)"),
    }

    let master_key = config
        .master_key
        .expect("BOTMIRROR_MASTER_KEY (or --master-key) is required");
    let secrets = SecretBox::from_secret(&master_key);

    let storage = Storage::open(&config.db_path).expect("failed to open database");
    let api = Arc::new(BotApi::new(
        &config.api_url,
        &config.api_url,
        UPSTREAM_TIMEOUT_SECS,
    ));

    let state: SharedState = Arc::new(tokio::sync::Mutex::new(AppState {
        storage,
        secrets,
        api,
        public_url: config.public_url,
    }));

    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    crate::mlog!("botmirror listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await.expect("server error");
}
