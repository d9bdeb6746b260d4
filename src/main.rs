// Race Weather API v0.1
use axum::http::HeaderName;
use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod helpers;
mod routes;
mod services;

use config::{AppConfig, LogFormat};
use db::queries::PgStore;
use routes::forecasts::{AppState, STALE_HEADER};
use services::forecast::ForecastService;
use services::freshness::{CacheFreshnessManager, FreshnessPolicy};
use services::history::HistoryWriter;
use services::pacing::PacingModel;
use services::poller::{BackgroundPoller, PollerState, SharedPollerState};
use services::yr::{UpstreamError, YrClient};

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 2;

/// OpenAPI document served by Swagger UI.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Race Weather API",
        version = "0.1.0",
        description = "Race-day weather forecasts for endurance ski race checkpoints. \
            Caches yr.no timeseries per checkpoint honouring Expires / Last-Modified, \
            resolves forecasts at explicit instants or at pacing-derived arrival times, \
            and records every model run so forecast evolution can be charted.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Forecasts", description = "Weather forecast retrieval and history"),
        (name = "Poller", description = "Background forecast poller status"),
    ),
    paths(
        routes::health::health_check,
        routes::forecasts::get_checkpoint_forecast,
        routes::forecasts::get_checkpoint_forecast_history,
        routes::forecasts::get_race_forecast,
        routes::poller::get_poller_status,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::forecasts::Weather,
            routes::forecasts::ForecastResponse,
            routes::forecasts::ForecastHistoryEntry,
            routes::forecasts::ForecastHistoryResponse,
            routes::forecasts::RaceForecastCheckpoint,
            routes::forecasts::RaceForecastResponse,
            services::poller::PollerState,
            services::poller::PollerPhase,
            services::poller::PollOutcome,
            services::poller::CheckpointPollStatus,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("failed to connect to database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to run database migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("failed to build yr.no client: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "race_weather_api=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    let config = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(config.log_format);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "race weather api stopped");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<(), StartupError> {
    // Set up database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!().run(&pool).await?;
    tracing::info!("Database migrations completed");

    let store = PgStore::new(pool);
    let shared = Arc::new(store.clone());

    let yr_client = Arc::new(YrClient::new(&config.yr)?);
    let freshness = CacheFreshnessManager::new(
        shared.clone(),
        yr_client,
        FreshnessPolicy::from(&config.yr),
    );

    let app_state = AppState {
        service: ForecastService::new(
            shared.clone(),
            shared.clone(),
            freshness.clone(),
            PacingModel::new(config.pacing),
        ),
    };

    let poller_state: SharedPollerState =
        Arc::new(RwLock::new(PollerState::new(config.poller.enabled)));
    if config.poller.enabled {
        let poller = BackgroundPoller::new(
            shared.clone(),
            shared.clone(),
            freshness,
            HistoryWriter::new(shared),
            config.poller.clone(),
            poller_state.clone(),
        );
        tokio::spawn(poller.run());
    } else {
        tracing::info!("Background poller disabled");
    }

    // CORS: read-only API, GET only; expose the stale marker to browsers
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(STALE_HEADER)]);

    let forecast_routes = Router::new()
        .route(
            "/api/v1/forecasts/checkpoint/:checkpoint_id",
            get(routes::forecasts::get_checkpoint_forecast),
        )
        .route(
            "/api/v1/forecasts/checkpoint/:checkpoint_id/history",
            get(routes::forecasts::get_checkpoint_forecast_history),
        )
        .route(
            "/api/v1/forecasts/race/:race_id",
            get(routes::forecasts::get_race_forecast),
        )
        .with_state(app_state);

    // Health check pings the database directly
    let health_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .with_state(store);

    let poller_routes = Router::new()
        .route(
            "/api/v1/poller/status",
            get(routes::poller::get_poller_status),
        )
        .with_state(poller_state);

    let app = Router::new()
        .merge(health_routes)
        .merge(forecast_routes)
        .merge(poller_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
