//! API error type and HTTP status mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use services::services::allocator::AllocationError;
use tracing::error;
use utils::response::ApiResponse;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Validation(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Database(sqlx::Error::RowNotFound) => {
                (StatusCode::NOT_FOUND, "not found".to_string())
            }
            ApiError::Database(err) => {
                error!(error = %err, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            ApiError::Allocation(AllocationError::ExperimentNotEligible(_)) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ApiError::Allocation(AllocationError::NoActiveVariants(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            // The assign route answers this with a null variant before it
            // can reach here.
            ApiError::Allocation(AllocationError::NoVariantForBucket) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            ApiError::Allocation(AllocationError::Storage(err)) => {
                error!(error = %err, "allocation storage error");
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Validation(message) => (StatusCode::UNPROCESSABLE_ENTITY, message.clone()),
        };
        (status, Json(ApiResponse::<()>::error(message))).into_response()
    }
}
