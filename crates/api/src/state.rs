//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use stratabill_core::EngineServices;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub engine: Arc<EngineServices>,
    pub config: Config,
}

impl AppState {
    pub fn new(pool: PgPool, engine: EngineServices, config: Config) -> Self {
        Self {
            pool,
            engine: Arc::new(engine),
            config,
        }
    }
}
