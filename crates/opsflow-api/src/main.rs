// Opsflow platform-core API server: boots the workflow engine, recovers
// locally owned workflows, starts the scanners and serves the process
// endpoints.

mod auth;
mod instances;
mod preview;
mod response;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{middleware, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use opsflow_engine::{
    CorrelationIndex, EngineDeps, HttpEntityResolver, HttpPluginInvoker, ProcessService,
    Scheduler, WorkflowRegistry,
};
use opsflow_models::EngineConfig;
use opsflow_storage::{PostgresRepository, ProcessRepository};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    host: String,
}

#[derive(Clone)]
struct HealthState {
    host: String,
}

async fn health(
    axum::extract::State(state): axum::extract::State<HealthState>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        host: state.host.clone(),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        instances::start_instance,
        instances::list_instances,
        instances::instance_detail,
        instances::submit_operation,
        instances::instance_callback,
        preview::build_preview,
        preview::start_events,
    ),
    components(schemas(
        instances::StartInstanceRequest,
        instances::OperationParam,
        preview::StartEventParam,
    )),
    tags(
        (name = "process", description = "Process instance execution endpoints"),
        (name = "preview", description = "Entity graph preview endpoints")
    ),
    info(
        title = "Opsflow Platform Core",
        version = "0.3.0",
        description = "Workflow execution engine for DevOps/CMDB orchestration"
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsflow_api=debug,opsflow_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    tracing::info!(host = %config.host_ip, port = config.http_port, "opsflow-api starting");

    let repo = PostgresRepository::from_dsn(&config.db_dsn)
        .await
        .context("failed to connect to database")?;
    tracing::info!("connected to database");

    let plugin_gateway = std::env::var("OPSFLOW_PLUGIN_GATEWAY_URL")
        .context("OPSFLOW_PLUGIN_GATEWAY_URL environment variable required")?;
    let cmdb_url = std::env::var("OPSFLOW_CMDB_URL")
        .context("OPSFLOW_CMDB_URL environment variable required")?;

    let mut invoker = HttpPluginInvoker::new(plugin_gateway);
    if let Ok(risk_url) = std::env::var("OPSFLOW_RISK_SERVICE_URL") {
        tracing::info!(%risk_url, "risk-check service armed");
        invoker = invoker.with_risk_url(risk_url);
    }

    let deps = Arc::new(EngineDeps {
        repo: Arc::new(repo) as Arc<dyn ProcessRepository>,
        invoker: Arc::new(invoker),
        resolver: Arc::new(HttpEntityResolver::new(cmdb_url)),
        correlation: CorrelationIndex::new(),
        registry: WorkflowRegistry::new(),
        config: config.clone(),
    });

    // Rehydrate everything this host still owns before the scanners start.
    let recovered = opsflow_engine::recovery::recover_local_workflows(&deps)
        .await
        .context("boot recovery failed")?;
    tracing::info!(recovered, "boot recovery done");

    let _scheduler = Scheduler::start(Arc::clone(&deps));

    let service = ProcessService::new(deps);
    let state = instances::AppState { service };
    let auth_state = auth::AuthState::new(&config.jwt_signing_key);
    let health_state = HealthState {
        host: config.host_ip.clone(),
    };

    let protected = Router::new()
        .merge(instances::routes(state.clone()))
        .merge(preview::routes(state))
        .route_layer(middleware::from_fn_with_state(
            auth_state,
            auth::require_bearer,
        ));

    let app = Router::new()
        .route("/health", get(health).with_state(health_state))
        .merge(protected)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
