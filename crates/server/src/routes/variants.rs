use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::{
    models::{
        experiment::Experiment,
        variant::{CreateVariant, UpdateVariant, Variant},
    },
    percent::Percent,
};
use sqlx::SqlitePool;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

/// Load a variant and check it belongs to the experiment in the path.
async fn load_scoped(
    pool: &SqlitePool,
    experiment_id: Uuid,
    variant_id: Uuid,
) -> Result<Variant, ApiError> {
    let variant = Variant::find_by_id(pool, variant_id)
        .await?
        .ok_or(ApiError::NotFound("variant"))?;
    if variant.experiment_id != experiment_id {
        return Err(ApiError::NotFound("variant"));
    }
    Ok(variant)
}

/// Reject a change that would push the active traffic sum past 100%.
async fn check_traffic_sum(
    pool: &SqlitePool,
    experiment_id: Uuid,
    exclude: Option<Uuid>,
    added: Percent,
) -> Result<(), ApiError> {
    let current = Variant::active_traffic_total(pool, experiment_id, exclude).await?;
    if current + added.hundredths() > Percent::FULL.hundredths() {
        return Err(ApiError::Validation(format!(
            "active variant traffic would exceed 100%: {} + {}",
            Percent::from_hundredths(current),
            added
        )));
    }
    Ok(())
}

pub async fn create_variant(
    State(state): State<AppState>,
    Path(experiment_id): Path<Uuid>,
    axum::Json(payload): axum::Json<CreateVariant>,
) -> Result<ResponseJson<ApiResponse<Variant>>, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    Experiment::find_by_id(&state.db.pool, experiment_id)
        .await?
        .ok_or(ApiError::NotFound("experiment"))?;

    check_traffic_sum(
        &state.db.pool,
        experiment_id,
        None,
        payload.traffic_percentage,
    )
    .await?;

    let variant = Variant::create(&state.db.pool, experiment_id, &payload, Uuid::new_v4()).await?;
    Ok(ResponseJson(ApiResponse::success(variant)))
}

pub async fn list_variants(
    State(state): State<AppState>,
    Path(experiment_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<Variant>>>, ApiError> {
    Experiment::find_by_id(&state.db.pool, experiment_id)
        .await?
        .ok_or(ApiError::NotFound("experiment"))?;
    let variants = Variant::find_by_experiment_id(&state.db.pool, experiment_id).await?;
    Ok(ResponseJson(ApiResponse::success(variants)))
}

pub async fn update_variant(
    State(state): State<AppState>,
    Path((experiment_id, variant_id)): Path<(Uuid, Uuid)>,
    axum::Json(payload): axum::Json<UpdateVariant>,
) -> Result<ResponseJson<ApiResponse<Variant>>, ApiError> {
    let variant = load_scoped(&state.db.pool, experiment_id, variant_id).await?;

    if let Some(traffic_percentage) = payload.traffic_percentage {
        if variant.is_active {
            check_traffic_sum(
                &state.db.pool,
                experiment_id,
                Some(variant_id),
                traffic_percentage,
            )
            .await?;
        }
    }

    let updated = Variant::update(&state.db.pool, variant_id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(updated)))
}

pub async fn activate_variant(
    State(state): State<AppState>,
    Path((experiment_id, variant_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<Variant>>, ApiError> {
    let variant = load_scoped(&state.db.pool, experiment_id, variant_id).await?;
    if !variant.is_active {
        check_traffic_sum(
            &state.db.pool,
            experiment_id,
            Some(variant_id),
            variant.traffic_percentage,
        )
        .await?;
    }
    let updated = Variant::set_active(&state.db.pool, variant_id, true).await?;
    Ok(ResponseJson(ApiResponse::success(updated)))
}

pub async fn deactivate_variant(
    State(state): State<AppState>,
    Path((experiment_id, variant_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<Variant>>, ApiError> {
    load_scoped(&state.db.pool, experiment_id, variant_id).await?;
    let updated = Variant::set_active(&state.db.pool, variant_id, false).await?;
    Ok(ResponseJson(ApiResponse::success(updated)))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/experiments/{experiment_id}/variants",
        Router::new()
            .route("/", get(list_variants).post(create_variant))
            .route("/{variant_id}", axum::routing::put(update_variant))
            .route("/{variant_id}/activate", post(activate_variant))
            .route("/{variant_id}/deactivate", post(deactivate_variant)),
    )
}
