//! Server configuration, loaded from the environment.
//!
//! Values come from `.env` (loaded in `main`) or the process environment.
//! RPC endpoints are per-network; unset networks are simply not served.

use clap::Parser;
use std::net::IpAddr;
use url::Url;

use crate::types::Network;

/// Environment-backed configuration for the geotrigger server.
#[derive(Parser, Debug, Clone)]
#[command(name = "geotrigger-rs")]
#[command(about = "Location-triggered Soroban contract execution engine")]
pub struct Config {
    /// Address to bind the HTTP listener on.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to bind the HTTP listener on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Maximum Postgres pool size.
    #[arg(long, env = "DATABASE_POOL_SIZE", default_value_t = 10)]
    pub database_pool_size: u32,

    /// Soroban RPC endpoint for testnet.
    #[arg(
        long,
        env = "SOROBAN_RPC_URL_TESTNET",
        default_value = "https://soroban-testnet.stellar.org"
    )]
    pub soroban_rpc_url_testnet: Url,

    /// Soroban RPC endpoint for mainnet.
    #[arg(
        long,
        env = "SOROBAN_RPC_URL_MAINNET",
        default_value = "https://soroban-rpc.mainnet.stellar.gateway.fm"
    )]
    pub soroban_rpc_url_mainnet: Url,

    /// HMAC secret for JWT bearer tokens.
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: String,

    /// Per-statement database timeout, in seconds.
    #[arg(long, env = "DB_STATEMENT_TIMEOUT_SECS", default_value_t = 10)]
    pub db_statement_timeout_secs: u64,

    /// Maximum attempts when polling a submitted transaction.
    #[arg(long, env = "TX_POLL_ATTEMPTS", default_value_t = 30)]
    pub tx_poll_attempts: u32,

    /// Delay between transaction poll attempts, in seconds.
    #[arg(long, env = "TX_POLL_INTERVAL_SECS", default_value_t = 2)]
    pub tx_poll_interval_secs: u64,
}

impl Config {
    /// Parses configuration from CLI arguments and the environment.
    pub fn load() -> Result<Self, clap::Error> {
        Config::try_parse()
    }

    pub fn rpc_url(&self, network: Network) -> &Url {
        match network {
            Network::Testnet => &self.soroban_rpc_url_testnet,
            Network::Mainnet => &self.soroban_rpc_url_mainnet,
        }
    }
}
