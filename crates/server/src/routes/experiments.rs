use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    assignment::{Assignment, VariantAssignmentCount},
    experiment::{CreateExperiment, Experiment, ExperimentStatus, UpdateExperiment},
    project::Project,
};
use sqlx::SqlitePool;
use tracing::info;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

/// Load an experiment and check it belongs to the project in the path.
async fn load_scoped(
    pool: &SqlitePool,
    project_id: Uuid,
    experiment_id: Uuid,
) -> Result<Experiment, ApiError> {
    let experiment = Experiment::find_by_id(pool, experiment_id)
        .await?
        .ok_or(ApiError::NotFound("experiment"))?;
    if experiment.project_id != project_id {
        return Err(ApiError::NotFound("experiment"));
    }
    Ok(experiment)
}

pub async fn create_experiment(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    axum::Json(payload): axum::Json<CreateExperiment>,
) -> Result<ResponseJson<ApiResponse<Experiment>>, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    Project::find_by_id(&state.db.pool, project_id)
        .await?
        .ok_or(ApiError::NotFound("project"))?;

    let experiment =
        Experiment::create(&state.db.pool, project_id, &payload, Uuid::new_v4()).await?;
    info!(
        project_id = %project_id,
        experiment_id = %experiment.id,
        "experiment created"
    );
    Ok(ResponseJson(ApiResponse::success(experiment)))
}

pub async fn list_experiments(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<Experiment>>>, ApiError> {
    Project::find_by_id(&state.db.pool, project_id)
        .await?
        .ok_or(ApiError::NotFound("project"))?;
    let experiments = Experiment::find_by_project_id(&state.db.pool, project_id).await?;
    Ok(ResponseJson(ApiResponse::success(experiments)))
}

pub async fn get_experiment(
    State(state): State<AppState>,
    Path((project_id, experiment_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<Experiment>>, ApiError> {
    let experiment = load_scoped(&state.db.pool, project_id, experiment_id).await?;
    Ok(ResponseJson(ApiResponse::success(experiment)))
}

pub async fn update_experiment(
    State(state): State<AppState>,
    Path((project_id, experiment_id)): Path<(Uuid, Uuid)>,
    axum::Json(payload): axum::Json<UpdateExperiment>,
) -> Result<ResponseJson<ApiResponse<Experiment>>, ApiError> {
    load_scoped(&state.db.pool, project_id, experiment_id).await?;
    let experiment = Experiment::update(&state.db.pool, experiment_id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(experiment)))
}

async fn transition(
    state: &AppState,
    project_id: Uuid,
    experiment_id: Uuid,
    target: ExperimentStatus,
) -> Result<ResponseJson<ApiResponse<Experiment>>, ApiError> {
    let experiment = load_scoped(&state.db.pool, project_id, experiment_id).await?;
    if !experiment.status.can_transition_to(&target) {
        return Err(ApiError::Validation(format!(
            "cannot move experiment from {} to {}",
            experiment.status, target
        )));
    }
    let updated = Experiment::update_status(&state.db.pool, experiment_id, target.clone()).await?;
    info!(
        experiment_id = %experiment_id,
        status = %target,
        "experiment status changed"
    );
    Ok(ResponseJson(ApiResponse::success(updated)))
}

pub async fn start_experiment(
    State(state): State<AppState>,
    Path((project_id, experiment_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<Experiment>>, ApiError> {
    transition(&state, project_id, experiment_id, ExperimentStatus::Running).await
}

pub async fn pause_experiment(
    State(state): State<AppState>,
    Path((project_id, experiment_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<Experiment>>, ApiError> {
    transition(&state, project_id, experiment_id, ExperimentStatus::Paused).await
}

pub async fn complete_experiment(
    State(state): State<AppState>,
    Path((project_id, experiment_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<Experiment>>, ApiError> {
    transition(&state, project_id, experiment_id, ExperimentStatus::Completed).await
}

pub async fn archive_experiment(
    State(state): State<AppState>,
    Path((project_id, experiment_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<Experiment>>, ApiError> {
    transition(&state, project_id, experiment_id, ExperimentStatus::Archived).await
}

pub async fn experiment_results(
    State(state): State<AppState>,
    Path((project_id, experiment_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<Vec<VariantAssignmentCount>>>, ApiError> {
    load_scoped(&state.db.pool, project_id, experiment_id).await?;
    let counts = Assignment::count_by_variant(&state.db.pool, experiment_id).await?;
    Ok(ResponseJson(ApiResponse::success(counts)))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/projects/{project_id}/experiments",
        Router::new()
            .route("/", get(list_experiments).post(create_experiment))
            .route(
                "/{experiment_id}",
                get(get_experiment).put(update_experiment),
            )
            .route("/{experiment_id}/start", post(start_experiment))
            .route("/{experiment_id}/pause", post(pause_experiment))
            .route("/{experiment_id}/complete", post(complete_experiment))
            .route("/{experiment_id}/archive", post(archive_experiment))
            .route("/{experiment_id}/results", get(experiment_results)),
    )
}
