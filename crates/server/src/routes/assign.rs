//! Visitor-facing allocation endpoint.
//!
//! Called by third-party browser JavaScript embedded on external sites, so
//! this router carries permissive CORS and answers preflight requests.

use axum::{Router, extract::State, response::Json as ResponseJson, routing::post};
use db::models::variant::Variant;
use serde::{Deserialize, Serialize};
use services::services::allocator::{AllocationError, AllocatorService};
use tower_http::cors::CorsLayer;
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct AssignRequest {
    pub visitor_id: String,
    pub experiment_id: Uuid,
}

/// Public fields of the chosen variant.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct AssignedVariant {
    pub id: Uuid,
    pub name: String,
    pub is_control: bool,
}

/// `variant: null` means the visitor falls outside the experiment's
/// allocated traffic and should see the default experience.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct AssignResponse {
    pub assignment_id: Option<Uuid>,
    pub variant: Option<AssignedVariant>,
}

pub async fn assign(
    State(state): State<AppState>,
    axum::Json(payload): axum::Json<AssignRequest>,
) -> Result<ResponseJson<ApiResponse<AssignResponse>>, ApiError> {
    if payload.visitor_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "visitor_id must not be empty".to_string(),
        ));
    }

    match AllocatorService::assign(
        &state.db.pool,
        payload.experiment_id,
        &payload.visitor_id,
    )
    .await
    {
        Ok(assignment) => {
            let variant = Variant::find_by_id(&state.db.pool, assignment.variant_id)
                .await?
                .ok_or(ApiError::Database(sqlx::Error::RowNotFound))?;
            Ok(ResponseJson(ApiResponse::success(AssignResponse {
                assignment_id: Some(assignment.id),
                variant: Some(AssignedVariant {
                    id: variant.id,
                    name: variant.name,
                    is_control: variant.is_control,
                }),
            })))
        }
        Err(AllocationError::NoVariantForBucket) => {
            Ok(ResponseJson(ApiResponse::success(AssignResponse {
                assignment_id: None,
                variant: None,
            })))
        }
        Err(err) => Err(err.into()),
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/assign", post(assign))
        .layer(CorsLayer::permissive())
}
