//! Error kinds surfaced by the account service and their HTTP rendering.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;
use tracing::error;

use crate::db::RepositoryError;
use crate::models::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Authentication(String),
    #[error("{0}")]
    InvalidToken(String),
    #[error("Refresh token is expired or used")]
    ExpiredOrReusedToken,
    #[error("{0}")]
    NotFound(String),
    #[error("Too many requests. Please try again later.")]
    TooManyRequests,
    #[error("{0}")]
    Upload(String),
    /// Detail is logged where the failure happens and never sent to clients.
    #[error("Something went wrong")]
    Internal,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Authentication(_)
            | ApiError::InvalidToken(_)
            | ApiError::ExpiredOrReusedToken => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upload(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        ApiResponse::new(self.status_code(), serde_json::Value::Null, self.to_string()).into()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Conflict(_) => {
                ApiError::Conflict("User with email or username already exists".to_string())
            }
            RepositoryError::NotFound => ApiError::NotFound("User does not exist".to_string()),
            other => {
                error!(error = %other, "User store failure");
                ApiError::Internal
            }
        }
    }
}
