//! # Server Configuration
//!
//! Router, shared state and OpenAPI document for the audience-sync API.

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::access::{AccessPolicy, StaticAccessPolicy};
use crate::auth::auth_middleware;
use crate::background_fetch::BackgroundFetchWorker;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::handlers;
use crate::http_fetcher::HttpFetcher;
use crate::repositories::{CustomAudienceRepository, QuantityLimits, ScheduledUpdateRepository};
use crate::schedule_update::ScheduleCustomAudienceUpdateService;
use crate::scheduled_updates::{ScheduledUpdatesHandler, ScheduledUpdatesWorker};
use crate::telemetry::{TraceContext, with_trace_context};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub schedule_service: Arc<ScheduleCustomAudienceUpdateService>,
    pub background_fetch: Arc<BackgroundFetchWorker>,
    pub scheduled_updates: Arc<ScheduledUpdatesWorker>,
}

impl AppState {
    /// Wires repositories, services and workers over one connection pool.
    pub fn build(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        fetcher: Arc<dyn HttpFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy: Arc<dyn AccessPolicy> = Arc::new(StaticAccessPolicy::from_config(&config));

        let audiences = Arc::new(
            CustomAudienceRepository::new(db.clone())
                .with_access_policy(Arc::clone(&policy))
                .with_quantity_limits(QuantityLimits::from_limits(&config.limits))
                .with_update_interval(chrono::Duration::seconds(
                    config.background_fetch.update_interval_seconds as i64,
                )),
        );
        let updates = Arc::new(ScheduledUpdateRepository::new(db.clone()));

        let schedule_service = Arc::new(ScheduleCustomAudienceUpdateService::new(
            Arc::clone(&config),
            updates.clone(),
            Arc::clone(&policy),
            Arc::clone(&clock),
        ));

        let background_fetch = Arc::new(BackgroundFetchWorker::new(
            Arc::clone(&config),
            audiences.clone(),
            Arc::clone(&fetcher),
            Arc::clone(&clock),
        ));

        let handler = Arc::new(ScheduledUpdatesHandler::new(
            Arc::clone(&config),
            audiences,
            updates,
            fetcher,
            policy,
            Arc::clone(&clock),
        ));
        let scheduled_updates = Arc::new(ScheduledUpdatesWorker::new(
            Arc::clone(&config),
            handler,
            clock,
        ));

        Self {
            config,
            db,
            schedule_service,
            background_fetch,
            scheduled_updates,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/v1/scheduled-updates",
            post(handlers::scheduled_updates::schedule_update),
        )
        .route(
            "/v1/jobs/background-fetch",
            post(handlers::jobs::trigger_background_fetch),
        )
        .route(
            "/v1/jobs/scheduled-updates",
            post(handlers::jobs::trigger_scheduled_updates),
        )
        .route("/v1/jobs/{job}/stop", post(handlers::jobs::stop_job))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Runs each request inside a fresh trace context.
async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let context = TraceContext::generate();
    request.extensions_mut().insert(context.clone());
    with_trace_context(context, next.run(request)).await
}

/// Serves `state` until `shutdown` fires
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

struct BearerAuthAddon;

impl Modify for BearerAuthAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::scheduled_updates::schedule_update,
        crate::handlers::jobs::trigger_background_fetch,
        crate::handlers::jobs::trigger_scheduled_updates,
        crate::handlers::jobs::stop_job,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::scheduled_updates::ScheduleUpdateRequest,
            crate::handlers::scheduled_updates::ScheduleUpdateResponse,
            crate::handlers::jobs::StopJobResponse,
            crate::schedule_update::ScheduleResultCode,
            crate::background_fetch::BackgroundFetchRunStats,
            crate::scheduled_updates::ScheduledUpdateRunStats,
        )
    ),
    modifiers(&BearerAuthAddon),
    info(
        title = "Audience Sync API",
        description = "Scheduled custom audience updates and background refresh jobs",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
