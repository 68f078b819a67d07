use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::project::{CreateProject, Project};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

pub async fn create_project(
    State(state): State<AppState>,
    axum::Json(payload): axum::Json<CreateProject>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    let project = Project::create(&state.db.pool, &payload, Uuid::new_v4()).await?;
    Ok(ResponseJson(ApiResponse::success(project)))
}

pub async fn list_projects(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<Project>>>, ApiError> {
    let projects = Project::find_all(&state.db.pool).await?;
    Ok(ResponseJson(ApiResponse::success(projects)))
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    let project = Project::find_by_id(&state.db.pool, project_id)
        .await?
        .ok_or(ApiError::NotFound("project"))?;
    Ok(ResponseJson(ApiResponse::success(project)))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/projects",
        Router::new()
            .route("/", get(list_projects).post(create_project))
            .route("/{project_id}", get(get_project)),
    )
}
