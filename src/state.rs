use crate::cdn::CdnClient;
use crate::config::Config;
use crate::db::Database;
use crate::rate_limit::FixedWindowLimiter;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub cdn: CdnClient,
    /// Global per-IP limiter applied in middleware ahead of routing.
    pub rate_limiter: FixedWindowLimiter,
    /// Separate window for the download proxy so gallery browsing and bulk
    /// downloads do not share a budget.
    pub download_limiter: FixedWindowLimiter,
}

impl AppState {
    pub fn new(config: Arc<Config>, db: Database, cdn: CdnClient) -> Self {
        Self {
            config,
            db,
            cdn,
            rate_limiter: FixedWindowLimiter::new(),
            download_limiter: FixedWindowLimiter::new(),
        }
    }
}
