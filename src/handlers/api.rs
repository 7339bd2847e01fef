use crate::config::AppConfig;
use crate::db::Database;
use crate::models::response::ApiResponse;
use actix_web::{http::StatusCode, web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    pub database: bool,
    pub token_secrets_distinct: bool,
}

/// Public health check endpoint with dependency checks
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is degraded", body = HealthResponse)
    ),
    tag = "Health"
)]
pub async fn health(db: web::Data<Database>, config: web::Data<AppConfig>) -> HttpResponse {
    let checks = HealthChecks {
        database: db.is_healthy(),
        token_secrets_distinct: config.tokens.access_secret != config.tokens.refresh_secret,
    };

    if !checks.token_secrets_distinct {
        warn!("Health check: access and refresh tokens share a secret");
    }

    let (status, code) = if checks.database && checks.token_secrets_distinct {
        ("healthy", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    let response = HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks,
    };

    ApiResponse::new(code, response, status).into()
}
