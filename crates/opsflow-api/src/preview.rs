// Preview routes: the entity graph shown before starting an instance, and
// the preview-only start-events endpoint.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use opsflow_models::PreviewData;

use crate::auth::Operator;
use crate::instances::AppState;
use crate::response::{ApiError, ApiResponse};

/// Start-event payload: definition key plus the root entity data id.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartEventParam {
    pub operation_key: String,
    pub operation_data: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/process/definitions/:proc_def_id/preview/:entity_data_id",
            get(build_preview),
        )
        .route("/process/start-events", post(start_events))
        .with_state(state)
}

/// GET /process/definitions/{proc_def_id}/preview/{entity_data_id}
#[utoipa::path(
    get,
    path = "/process/definitions/{proc_def_id}/preview/{entity_data_id}",
    params(
        ("proc_def_id" = Uuid, Path, description = "Process definition ID"),
        ("entity_data_id" = String, Path, description = "Root entity data ID")
    ),
    responses(
        (status = 200, description = "Preview graph built and persisted"),
        (status = 404, description = "Definition or root entity not found")
    ),
    tag = "preview"
)]
pub async fn build_preview(
    State(state): State<AppState>,
    Path((proc_def_id, entity_data_id)): Path<(Uuid, String)>,
    Extension(Operator(operator)): Extension<Operator>,
) -> Result<Json<ApiResponse<PreviewData>>, ApiError> {
    let data = state
        .service
        .build_preview(proc_def_id, &entity_data_id, &operator)
        .await?;
    Ok(ApiResponse::ok(data))
}

/// POST /process/start-events: computes and persists a preview for the
/// latest deployed definition of the given key, then returns without
/// starting an instance. Preview-only by design.
#[utoipa::path(
    post,
    path = "/process/start-events",
    request_body = StartEventParam,
    responses(
        (status = 200, description = "Preview computed"),
        (status = 404, description = "No deployed definition for the key")
    ),
    tag = "preview"
)]
pub async fn start_events(
    State(state): State<AppState>,
    Extension(Operator(operator)): Extension<Operator>,
    Json(param): Json<StartEventParam>,
) -> Result<Json<ApiResponse<PreviewData>>, ApiError> {
    let data = state
        .service
        .preview_start_event(&param.operation_key, &param.operation_data, &operator)
        .await?;
    Ok(ApiResponse::ok(data))
}
