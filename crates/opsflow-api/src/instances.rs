// Process-instance HTTP routes: start, list, detail, operations, callback.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use opsflow_engine::{OperationRequest, ProcessService};
use opsflow_models::{InstanceDetail, ProcInstance};

use crate::auth::Operator;
use crate::response::{ApiError, ApiResponse};

#[derive(Clone)]
pub struct AppState {
    pub service: ProcessService,
}

/// Request body for starting an instance.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartInstanceRequest {
    /// Data id of the root entity the instance operates on.
    pub entity_data_id: String,
}

/// Operator command payload.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationParam {
    pub proc_inst_id: Uuid,
    pub node_inst_id: Option<Uuid>,
    /// One of `retry | skip | kill | approve | stop | continue`.
    pub act: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/process/definitions/:proc_def_id/instances/start",
            post(start_instance),
        )
        .route("/process/instances", get(list_instances))
        .route("/process/instances/callback", post(instance_callback))
        .route("/process/instances/:proc_ins_id", get(instance_detail))
        .route(
            "/process/instances/:proc_ins_id/operations",
            post(submit_operation),
        )
        .with_state(state)
}

/// POST /process/definitions/{proc_def_id}/instances/start
#[utoipa::path(
    post,
    path = "/process/definitions/{proc_def_id}/instances/start",
    params(("proc_def_id" = Uuid, Path, description = "Process definition ID")),
    request_body = StartInstanceRequest,
    responses(
        (status = 200, description = "Instance created and started"),
        (status = 400, description = "Definition not startable"),
        (status = 404, description = "Definition not found")
    ),
    tag = "process"
)]
pub async fn start_instance(
    State(state): State<AppState>,
    Path(proc_def_id): Path<Uuid>,
    Extension(Operator(operator)): Extension<Operator>,
    Json(req): Json<StartInstanceRequest>,
) -> Result<Json<ApiResponse<InstanceDetail>>, ApiError> {
    let detail = state
        .service
        .start_instance(proc_def_id, &req.entity_data_id, &operator)
        .await?;
    Ok(ApiResponse::ok(detail))
}

/// GET /process/instances
#[utoipa::path(
    get,
    path = "/process/instances",
    responses((status = 200, description = "Instances visible to the caller")),
    tag = "process"
)]
pub async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<ProcInstance>>>, ApiError> {
    let rows = state.service.list_instances().await?;
    Ok(ApiResponse::ok(rows))
}

/// GET /process/instances/{proc_ins_id}
#[utoipa::path(
    get,
    path = "/process/instances/{proc_ins_id}",
    params(("proc_ins_id" = Uuid, Path, description = "Process instance ID")),
    responses(
        (status = 200, description = "Instance detail with node states"),
        (status = 404, description = "Instance not found")
    ),
    tag = "process"
)]
pub async fn instance_detail(
    State(state): State<AppState>,
    Path(proc_ins_id): Path<Uuid>,
) -> Result<Json<ApiResponse<InstanceDetail>>, ApiError> {
    let detail = state.service.instance_detail(proc_ins_id).await?;
    Ok(ApiResponse::ok(detail))
}

/// POST /process/instances/{proc_ins_id}/operations
#[utoipa::path(
    post,
    path = "/process/instances/{proc_ins_id}/operations",
    params(("proc_ins_id" = Uuid, Path, description = "Process instance ID")),
    request_body = OperationParam,
    responses(
        (status = 200, description = "Operation enqueued"),
        (status = 400, description = "Invalid operation"),
        (status = 404, description = "Instance not found")
    ),
    tag = "process"
)]
pub async fn submit_operation(
    State(state): State<AppState>,
    Path(proc_ins_id): Path<Uuid>,
    Extension(Operator(operator)): Extension<Operator>,
    Json(param): Json<OperationParam>,
) -> Result<Json<ApiResponse<i64>>, ApiError> {
    if param.proc_inst_id != proc_ins_id {
        return Err(opsflow_engine::EngineError::Validation(
            "body procInstId does not match the path".to_string(),
        )
        .into());
    }
    let op_id = state
        .service
        .submit_operation(OperationRequest {
            proc_ins_id,
            node_ins_id: param.node_inst_id,
            act: param.act,
            operator,
        })
        .await?;
    Ok(ApiResponse::ok(op_id))
}

/// POST /process/instances/callback: asynchronous plugin result. The body
/// carries `{ results: { requestId, … } }`; the engine enqueues an approve
/// operation for the waiting node.
#[utoipa::path(
    post,
    path = "/process/instances/callback",
    responses(
        (status = 200, description = "Callback routed"),
        (status = 400, description = "Unroutable callback")
    ),
    tag = "process"
)]
pub async fn instance_callback(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ApiResponse<i64>>, ApiError> {
    let op_id = state.service.handle_callback(body).await?;
    Ok(ApiResponse::ok(op_id))
}
