use axum::{
    routing::{get, post, put},
    Router,
};
use moka::future::Cache;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use loan_crm::config::Config;
use loan_crm::db::Database;
use loan_crm::handlers::{self, AppState};
use loan_crm::playbook_client::PlaybookClient;
use loan_crm::webhook_client::WebhookClient;
use loan_crm::{cron_handler, obs, playbook_handler};

/// Main entry point for the application.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - Database connection and migrations.
/// - Dialer and webhook clients.
/// - HTTP routes and middleware (CORS, Rate Limiting).
///
/// It then starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    obs::init_tracing();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");
    db.migrate().await?;
    tracing::info!("Migrations applied");

    // In-flight guard for auto-assignment; entries are removed when the
    // request finishes, the TTL only covers crashed requests.
    let assigning_leads = Cache::builder()
        .time_to_live(Duration::from_secs(120))
        .max_capacity(10_000)
        .build();

    let playbook_client = match (&config.playbook_api_url, &config.playbook_api_key) {
        (Some(url), Some(key)) => match PlaybookClient::new(url.clone(), key.clone()) {
            Ok(client) => {
                tracing::info!("✓ Dialer client initialized: {}", url);
                Some(client)
            }
            Err(e) => {
                tracing::error!("Failed to initialize dialer client: {}", e);
                None
            }
        },
        _ => {
            tracing::warn!("PLAYBOOK_API_URL/PLAYBOOK_API_KEY not set, dialer sync disabled");
            None
        }
    };

    let webhook_client = match &config.appointment_webhook_url {
        Some(url) => match WebhookClient::new(url.clone()) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::error!("Failed to initialize webhook client: {}", e);
                None
            }
        },
        None => None,
    };

    let app_state = Arc::new(AppState {
        db: db.pool.clone(),
        config: config.clone(),
        playbook_client,
        webhook_client,
        assigning_leads,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        // Appointments
        .route("/api/v1/appointments", post(handlers::create_appointment))
        .route(
            "/api/v1/appointments/sweep",
            post(handlers::sweep_appointments),
        )
        .route(
            "/api/v1/appointments/:kind/:id",
            get(handlers::get_appointment)
                .patch(handlers::update_appointment)
                .delete(handlers::delete_appointment),
        )
        .route(
            "/api/v1/appointments/:kind/:id/status",
            put(handlers::update_appointment_status),
        )
        // Lead / borrower status
        .route("/api/v1/subjects/:kind/:id", get(handlers::get_subject))
        .route(
            "/api/v1/subjects/:kind/:id/appointments",
            get(handlers::list_subject_appointments),
        )
        .route(
            "/api/v1/subjects/:kind/:id/terminal-status",
            post(handlers::apply_terminal_status),
        )
        .route(
            "/api/v1/subjects/:kind/:id/follow-up",
            post(handlers::schedule_follow_up),
        )
        .route(
            "/api/v1/subjects/:kind/:id/no-answer",
            post(handlers::mark_no_answer),
        )
        .route(
            "/api/v1/subjects/:kind/:id/status",
            put(handlers::set_subject_status),
        )
        // Timeslots
        .route("/api/v1/timeslots", get(handlers::list_timeslots))
        .route(
            "/api/v1/timeslots/generate",
            post(handlers::generate_timeslots),
        )
        .route(
            "/api/v1/timeslots/:id/disabled",
            put(handlers::set_timeslot_disabled),
        )
        // Auto-assignment
        .route("/api/v1/assignment/check-in", post(handlers::check_in))
        .route("/api/v1/assignment/check-out", post(handlers::check_out))
        .route(
            "/api/v1/assignment/agents",
            get(handlers::list_checked_in_agents),
        )
        .route(
            "/api/v1/assignment/settings",
            get(handlers::get_assignment_settings).put(handlers::update_assignment_settings),
        )
        .route(
            "/api/v1/assignment/leads/:id",
            post(handlers::auto_assign_lead),
        )
        .route("/api/v1/assignment/bulk", post(handlers::auto_assign_bulk))
        .route(
            "/api/v1/assignment/even-split",
            post(handlers::assign_even_split),
        )
        .route(
            "/api/v1/assignment/preview",
            get(handlers::assignment_preview),
        )
        .route(
            "/api/v1/leads/:id/assign",
            post(handlers::assign_lead_manually),
        )
        .route(
            "/api/v1/leads/:id/assignment-history",
            get(handlers::lead_assignment_history),
        )
        // Shared-secret routes for the external scheduler and dialer admin
        .route(
            "/api/cron/appointment-status",
            post(cron_handler::appointment_status),
        )
        .route(
            "/api/cron/generate-timeslots",
            post(cron_handler::generate_timeslots),
        )
        .route(
            "/api/cron/requeue-no-answer",
            post(cron_handler::requeue_no_answer),
        )
        .route(
            "/api/cron/sync-playbooks",
            post(cron_handler::sync_playbooks),
        )
        .route(
            "/api/playbooks/:id",
            post(playbook_handler::playbook_action).delete(playbook_handler::delete_playbook),
        )
        .route(
            "/api/playbooks/:id/sync",
            post(playbook_handler::sync_playbook),
        )
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB max payload
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
