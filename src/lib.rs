pub mod config;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod proctoring;
pub mod routes;
pub mod services;
pub mod store;
pub mod utils;

use std::sync::Arc;

use crate::services::attempt_service::{AttemptPolicy, AttemptService};
use crate::services::seb_service::SebService;
use crate::services::session_service::{SessionPolicy, SessionService};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub attempts: AttemptService,
    pub sessions: SessionService,
    pub seb: SebService,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let config = crate::config::get_config();

        let attempts = AttemptService::new(
            store.clone(),
            AttemptPolicy {
                cooldown_days: config.attempt_cooldown_days,
                result_delay_secs: config.result_delay_secs,
                ..AttemptPolicy::default()
            },
        );
        let sessions = SessionService::new(
            store.clone(),
            attempts.clone(),
            SessionPolicy {
                suspend_risk_threshold: config.suspend_risk_threshold,
                heartbeat_max_missed: config.heartbeat_max_missed,
                store_retry_limit: config.store_retry_limit,
                ..SessionPolicy::default()
            },
        );
        let seb = SebService::new(
            config.seb_signing_secret.clone(),
            config.seb_public_url.clone(),
            config.seb_token_ttl_secs as i64,
        );

        Self {
            store,
            attempts,
            sessions,
            seb,
        }
    }
}
