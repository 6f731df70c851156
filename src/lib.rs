//! geotrigger-rs: a location-triggered smart contract execution engine for
//! Stellar/Soroban.
//!
//! Operators register external contracts and define geofenced execution rules
//! over them; incoming device location updates are matched against those
//! rules, queued, de-duplicated, rate-limited, and dispatched as contract
//! invocations — signed directly or routed through a WebAuthn-gated smart
//! wallet — with an idempotent pending → completed/rejected lifecycle.

pub mod auth;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod geo;
pub mod handlers;
pub mod history;
pub mod lifecycle;
pub mod matcher;
pub mod projections;
pub mod queue;
pub mod rules;
pub mod shutdown;
pub mod state;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use error::ApiError;
pub use state::AppState;
