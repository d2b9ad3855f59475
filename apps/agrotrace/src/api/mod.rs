//! # AgroTrace HTTP API Module
//!
//! This module implements the HTTP REST API server using axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /status` - Store counts
//! - `POST /vti`, `GET /vti/{id}` - Create and fetch VTIs
//! - `POST /vti/harvest` - Create a farm batch from a field's pre-harvest events
//! - `PATCH /vti/{id}/metadata`, `PUT /vti/{id}/status`, `POST /vti/{id}/links`
//! - `GET /vti/{id}/trace` - Upstream provenance
//! - `POST /events`, `GET /events/{id}`, `GET /vti/{id}/events` - Event ledger
//! - `POST /factors`, `GET /factors`, `PUT /factors/{id}/active`,
//!   `GET /factors/resolve` - Emission factor administration
//! - `POST /carbon-footprint` - Calculate a submitted event
//! - `GET /pending` - Calculations awaiting a transport model
//! - `GET /dashboard?period=month|quarter|year` - The caller's summary
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `AGROTRACE_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `AGROTRACE_RATE_LIMIT`: Requests per second (default: 100, 0 to disable)
//! - `AGROTRACE_API_KEY`: If set, requires a Bearer token on every endpoint but /health

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{API_KEY_ENV, AuthConfig, Caller, get_api_key_from_env};
pub use middleware::{RATE_LIMIT_ENV, create_rate_limiter, get_rate_limit_from_env};
pub use types::{
    AppendEventRequest, CarbonFootprintResponse, CarbonFootprintSubmission, CreateVtiRequest,
    DashboardResponse, ErrorResponse, EventJson, EventListResponse, EventResponse, FactorJson,
    FactorListResponse, FactorResponse, HarvestBatchRequest, HealthResponse, LinkRequest,
    PendingJson, PendingListResponse, StatusResponse, TraceResponse, VtiJson, VtiResponse,
    attributes_from_json, attributes_to_json,
};

use crate::config::Config;
use crate::trigger::{Delivery, Pipeline, SharedStore};
use agrotrace_core::{Calculator, Clock, Resolver, StorageBackend, SystemClock, TraceError};
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, patch, post, put},
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Environment variable holding the allowed CORS origins.
pub const CORS_ORIGINS_ENV: &str = "AGROTRACE_CORS_ORIGINS";

/// Maximum request body size (2 MiB).
const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// The ledger store, shared with the calculation pipeline.
    pub store: SharedStore,
    pub pipeline: Arc<Pipeline>,
    pub delivery: Delivery,
    pub config: Arc<Config>,
}

impl AppState {
    /// State on the wall clock with inline calculation.
    #[must_use]
    pub fn new(store: StorageBackend, config: Config) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// State on an explicit clock with inline calculation.
    #[must_use]
    pub fn with_clock(store: StorageBackend, config: Config, clock: Arc<dyn Clock>) -> Self {
        let store: SharedStore = Arc::new(RwLock::new(store));
        let pipeline = Pipeline {
            store: Arc::clone(&store),
            clock,
            calculator: Calculator::new(Resolver::new(config.engine.tie_break)),
            regions: crate::regions::StaticRegions::new(config.regions.clone()),
            region_timeout: config.engine.region_timeout(),
            max_attempts: config.trigger.max_attempts,
            retry_backoff: config.trigger.retry_backoff(),
        };
        Self {
            store,
            pipeline: Arc::new(pipeline),
            delivery: Delivery::Inline,
            config: Arc::new(config),
        }
    }

    /// Route appended events through `delivery` instead of calculating inline.
    #[must_use]
    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build CORS layer from `AGROTRACE_CORS_ORIGINS`.
///
/// - "*": allows all origins
/// - unset: localhost only
/// - otherwise: comma-separated list of allowed origins
fn build_cors_layer() -> CorsLayer {
    let origins_env = std::env::var(CORS_ORIGINS_ENV).ok();

    match origins_env.as_deref() {
        Some("*") => {
            tracing::warn!(
                "CORS: Allowing ALL origins (AGROTRACE_CORS_ORIGINS=*). This is insecure for production!"
            );
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: Allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: Invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::warn!(
                    "CORS: No valid origins in AGROTRACE_CORS_ORIGINS, defaulting to localhost only"
                );
                build_localhost_cors()
            } else {
                cors_for(allowed_origins)
            }
        }
        None => {
            tracing::info!("CORS: No AGROTRACE_CORS_ORIGINS set, defaulting to localhost only");
            build_localhost_cors()
        }
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();
    cors_for(origins)
}

fn cors_for(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing - logs all requests
/// 2. CORS - handles preflight requests
/// 3. Body limit
/// 4. Rate Limiting (if enabled)
/// 5. Authentication - identifies the caller, enforces the API key if set
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer();

    let rate_limit = get_rate_limit_from_env();
    let rate_limiter = if rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", rate_limit);
        Some(create_rate_limiter(rate_limit))
    } else {
        tracing::info!("Rate limiting disabled");
        None
    };

    let auth = Arc::new(AuthConfig::from_env(&state.config.tokens));
    if auth.requires_key() {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED - all endpoints are publicly accessible! \
             Set AGROTRACE_API_KEY environment variable to enable authentication."
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/vti", post(handlers::create_vti_handler))
        .route("/vti/harvest", post(handlers::harvest_handler))
        .route("/vti/{id}", get(handlers::get_vti_handler))
        .route("/vti/{id}/metadata", patch(handlers::update_metadata_handler))
        .route("/vti/{id}/status", put(handlers::update_status_handler))
        .route("/vti/{id}/links", post(handlers::link_handler))
        .route("/vti/{id}/trace", get(handlers::trace_handler))
        .route("/vti/{id}/events", get(handlers::vti_events_handler))
        .route("/events", post(handlers::append_event_handler))
        .route("/events/{id}", get(handlers::get_event_handler))
        .route(
            "/factors",
            post(handlers::register_factor_handler).get(handlers::list_factors_handler),
        )
        .route("/factors/resolve", get(handlers::resolve_factor_handler))
        .route(
            "/factors/{id}/active",
            put(handlers::set_factor_active_handler),
        )
        .route("/carbon-footprint", post(handlers::carbon_footprint_handler))
        .route("/pending", get(handlers::pending_handler))
        .route("/dashboard", get(handlers::dashboard_handler))
        .layer(axum_middleware::from_fn_with_state(
            auth,
            auth::auth_middleware,
        ));

    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Start the HTTP server and run until Ctrl-C.
pub async fn run_server(addr: &str, state: AppState) -> Result<(), TraceError> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| TraceError::Storage(format!("Bind failed: {e}")))?;

    tracing::info!("AgroTrace HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| TraceError::Storage(format!("Server error: {e}")))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
