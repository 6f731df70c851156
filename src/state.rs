//! Shared application state handed to every handler.

use sqlx::PgPool;
use std::sync::Arc;

use crate::chain::ChainRegistry;
use crate::config::Config;
use crate::executor::Executor;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub chains: ChainRegistry,
    pub executor: Executor,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: PgPool, chains: ChainRegistry, executor: Executor, config: Config) -> Self {
        AppState {
            db,
            chains,
            executor,
            config: Arc::new(config),
        }
    }
}
