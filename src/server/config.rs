//! Configuration types and constants for the botmirror server.

use std::path::PathBuf;

use clap::Parser;

/// Timeout for calls the proxy makes to the remote Bot API.
pub(crate) const UPSTREAM_TIMEOUT_SECS: u64 = 30;
/// Timeout for best-effort webhook redirect delivery.
pub(crate) const REDIRECT_TIMEOUT_SECS: u64 = 10;

/// Multi-tenant Bot API proxy with an entity catalog.
///
/// Forwards method calls and webhook events for registered bots while
/// recording every observed user, chat, message, and file into SQLite.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "botmirror", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: BOTMIRROR_BIND] [default: 127.0.0.1:8080]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// SQLite database path [env: BOTMIRROR_DB] [default: botmirror.db]
    #[arg(long, short = 'd')]
    pub db: Option<PathBuf>,

    /// Remote Bot API base URL [env: BOTMIRROR_API_URL] [default: https://api.telegram.org]
    #[arg(long)]
    pub api_url: Option<String>,

    /// Externally reachable base URL of this proxy, used as the webhook
    /// target when registering with the upstream [env: BOTMIRROR_PUBLIC_URL]
    #[arg(long)]
    pub public_url: Option<String>,

    /// Master secret for credential encryption at rest [env: BOTMIRROR_MASTER_KEY]
    #[arg(long)]
    pub master_key: Option<String>,
}

pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub api_url: String,
    pub public_url: Option<String>,
    pub master_key: Option<String>,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("BOTMIRROR_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let db_path = cli
            .db
            .or_else(|| std::env::var("BOTMIRROR_DB").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("botmirror.db"));

        let api_url = cli
            .api_url
            .or_else(|| std::env::var("BOTMIRROR_API_URL").ok())
            .unwrap_or_else(|| "https://api.telegram.org".to_string());

        let public_url = cli
            .public_url
            .or_else(|| std::env::var("BOTMIRROR_PUBLIC_URL").ok());

        let master_key = cli
            .master_key
            .or_else(|| std::env::var("BOTMIRROR_MASTER_KEY").ok());

        Self {
            bind_addr,
            db_path,
            api_url,
            public_url,
            master_key,
        }
    }
}
