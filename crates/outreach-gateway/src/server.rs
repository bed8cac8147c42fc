//! HTTP server implementation using Axum.

use axum::Router;
use axum::routing::{get, post};
use outreach_engine::{Engine, WorkerPool};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Queue consumers running in this process, if any.
    pub workers: Option<Arc<WorkerPool>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, workers: Option<Arc<WorkerPool>>) -> Self {
        Self {
            engine,
            workers,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        .route("/health", get(routes::health_check))
        // Scheduler trigger, authenticated by the cron secret
        .route("/cron/run", get(routes::cron_run).post(routes::cron_run))
        .route("/cron/lock", get(routes::cron_lock))
        // Provider callbacks
        .route("/webhooks/status", post(routes::provider_status))
        // Leads and contacts
        .route("/leads/inbound", post(routes::inbound_lead))
        .route("/leads/{id}/convert", post(routes::convert_lead))
        .route("/contacts/route", post(routes::route_contact))
        .route("/contacts/schedule", post(routes::schedule_contact))
        .route("/send/test", post(routes::send_test))
        .route("/integrations/{channel}/test", get(routes::test_integration))
        // Sequences and enrollments
        .route("/sequences", post(routes::create_sequence))
        .route("/sequences/{id}", get(routes::get_sequence))
        .route("/sequences/{id}/enroll", post(routes::enroll_lead))
        .route("/sequences/{id}/{action}", post(routes::sequence_action))
        .route("/enrollments/{id}/{action}", post(routes::enrollment_action))
        // A/B tests
        .route("/ab-tests", post(routes::create_ab_test))
        .route("/ab-tests/{id}", get(routes::evaluate_ab_test))
        .route("/ab-tests/{id}/auto-end", post(routes::auto_end_ab_test))
        // Operations
        .route("/queues/stats", get(routes::queue_stats))
        .route("/dead-letters", get(routes::dead_letters))
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve until `shutdown` resolves.
pub async fn start<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!(
        "{}:{}",
        state.engine.config.server.host, state.engine.config.server.port
    );
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("🌐 Gateway stopped");
    Ok(())
}
