use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use proctor_backend::config::{get_config, init_config};
use proctor_backend::services::monitor_service::HeartbeatMonitor;
use proctor_backend::store::{MemoryStore, PostgresStore, Store};
use proctor_backend::{middleware, routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proctor_backend=info,tower_http=info".into()),
        )
        .init();
    init_config()?;
    let config = get_config();

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pg = PostgresStore::connect(url).await?;
            pg.migrate().await?;
            info!("using postgres storage");
            Arc::new(pg)
        }
        None => {
            info!("DATABASE_URL not set, using in-memory storage");
            Arc::new(MemoryStore::new())
        }
    };

    let app_state = AppState::new(store);

    {
        let monitor = HeartbeatMonitor::new(
            app_state.sessions.clone(),
            config.monitor_tick_secs,
            config.heartbeat_timeout_secs as i64,
        );
        tokio::spawn(monitor.run());
    }

    let base_routes = Router::new()
        .route("/health", get(routes::health::health))
        // Fetched by the lockdown browser with the signed URL as its only
        // credential.
        .route(
            "/api/exam-sessions/session/:id/seb-config",
            get(routes::session_routes::seb_config_download),
        )
        .route(
            "/api/mock-tests/results/:exam_id",
            get(routes::attempt_routes::check_results),
        );

    let session_api = Router::new()
        .route(
            "/api/exam-sessions/create",
            post(routes::session_routes::create_session),
        )
        .route(
            "/api/exam-sessions/violation",
            post(routes::session_routes::record_violation),
        )
        .route(
            "/api/exam-sessions/heartbeat",
            post(routes::session_routes::heartbeat),
        )
        .route(
            "/api/exam-sessions/metrics",
            post(routes::session_routes::update_metrics),
        )
        .route(
            "/api/exam-sessions/end",
            post(routes::session_routes::end_session),
        )
        .route(
            "/api/exam-sessions/session/:id",
            get(routes::session_routes::get_session),
        )
        .route(
            "/api/exam-sessions/session/:id/seb-config-url",
            get(routes::session_routes::seb_config_url),
        );

    let attempt_api = Router::new()
        .route(
            "/api/mock-tests/initialize",
            post(routes::attempt_routes::initialize_attempt),
        )
        .route(
            "/api/mock-tests/attempt-info",
            get(routes::attempt_routes::attempt_info),
        )
        .route(
            "/api/mock-tests/:id",
            get(routes::attempt_routes::get_attempt),
        )
        .route(
            "/api/mock-tests/:id/subjects",
            post(routes::attempt_routes::update_subjects),
        )
        .route(
            "/api/mock-tests/:id/start",
            post(routes::attempt_routes::start_attempt),
        )
        .route(
            "/api/mock-tests/:id/response",
            post(routes::attempt_routes::save_response),
        )
        .route(
            "/api/mock-tests/:id/progress",
            post(routes::attempt_routes::update_progress),
        )
        .route(
            "/api/mock-tests/:id/submit",
            post(routes::attempt_routes::submit_attempt),
        )
        .route(
            "/api/mock-tests/:id/request-unlock",
            post(routes::attempt_routes::request_unlock),
        );

    let public_api = session_api
        .merge(attempt_api)
        .layer(axum::middleware::from_fn(
            middleware::auth::require_bearer_auth,
        ))
        .layer(axum::middleware::from_fn_with_state(
            middleware::rate_limit::new_rps_state(config.public_rps),
            middleware::rate_limit::rps_middleware,
        ));

    let admin_api = Router::new()
        .route(
            "/api/exam-sessions/flagged",
            get(routes::session_routes::list_flagged),
        )
        .route(
            "/api/exam-sessions/session/:id/review",
            post(routes::session_routes::review_session),
        )
        .route(
            "/api/mock-tests/:id/unlock-requests/:request_id/review",
            post(routes::attempt_routes::review_unlock),
        )
        .layer(axum::middleware::from_fn(middleware::auth::require_admin))
        .layer(axum::middleware::from_fn_with_state(
            middleware::rate_limit::new_rps_state(config.admin_rps),
            middleware::rate_limit::rps_middleware,
        ));

    let app = base_routes
        .merge(public_api)
        .merge(admin_api)
        .with_state(app_state)
        .layer(middleware::cors::permissive_cors())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024));

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
