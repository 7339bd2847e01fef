mod config;
mod db;
mod errors;
mod handlers;
mod middleware;
mod models;
mod services;
mod utils;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use config::AppConfig;
use db::user_repository::UserRepository;
use db::Database;
use dotenv::dotenv;
use middleware::{auth::AuthMiddleware, rate_limit::RateLimitMiddleware};
use services::media::HttpMediaHost;
use services::session::SessionService;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_actix_web::TracingLogger;
use utils::auth::TokenIssuer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

const RATE_LIMIT_PRUNE_SECS: u64 = 300;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::api::health,
        handlers::users::register,
        handlers::users::login,
        handlers::users::logout,
        handlers::users::refresh_access_token,
        handlers::users::change_password,
        handlers::users::current_user,
        handlers::users::update_account,
        handlers::users::update_avatar,
        handlers::users::update_cover_image,
    ),
    components(
        schemas(
            handlers::api::HealthResponse,
            handlers::api::HealthChecks,
            handlers::users::RegisterUpload,
            handlers::users::AvatarUpload,
            handlers::users::CoverImageUpload,
            handlers::users::LoginRequest,
            handlers::users::LoginResponse,
            handlers::users::RefreshRequest,
            handlers::users::ChangePasswordRequest,
            handlers::users::UpdateAccountRequest,
            models::user::UserResponse,
            models::user::TokenPair,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Users", description = "Registration, sessions and profile endpoints")
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some(
                            "Access token. The accessToken cookie is accepted as well.",
                        ))
                        .build(),
                ),
            );
        }
    }
}

/// A wildcard origin cannot carry credentials, so browsers on another
/// origin only get the bearer-token flow. Cookie sessions need an explicit
/// `CORS_ORIGIN`.
fn cors(origin: &str) -> Cors {
    let cors = if origin == "*" {
        Cors::default().allow_any_origin()
    } else {
        Cors::default().allowed_origin(origin).supports_credentials()
    };

    cors.allowed_methods(vec!["GET", "POST", "PATCH"])
        .allowed_headers(vec![
            actix_web::http::header::AUTHORIZATION,
            actix_web::http::header::ACCEPT,
            actix_web::http::header::CONTENT_TYPE,
        ])
        .max_age(3600)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize tracing subscriber for structured logging
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .json()
        .init();

    let config = AppConfig::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;

    let database = Database::new(&config.db_path).map_err(std::io::Error::other)?;
    info!(db_path = %config.db_path, "Database initialized");

    let tokens = TokenIssuer::new(&config.tokens);
    let session = web::Data::new(SessionService::new(
        UserRepository::new(database.clone()),
        tokens.clone(),
        Arc::new(HttpMediaHost::new(&config.media)),
    ));
    let auth = AuthMiddleware::new(tokens);
    let limiter = RateLimitMiddleware::new(config.auth_rate_limit_per_minute);
    let pruned = limiter.clone();
    actix_web::rt::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(RATE_LIMIT_PRUNE_SECS));
        loop {
            ticker.tick().await;
            pruned.prune();
            debug!(clients = pruned.tracked_clients(), "Pruned rate limiter state");
        }
    });
    let bind_address = config.bind_address();
    if config.cors_origin == "*" {
        warn!("CORS_ORIGIN is '*'; cross-origin browsers will not send session cookies");
    }

    info!(bind_address = %bind_address, "Starting account service");
    info!(
        swagger_url = format!("http://{}/swagger-ui/", bind_address),
        "Swagger UI available"
    );

    let database = web::Data::new(database);
    let shared_config = web::Data::new(config);

    HttpServer::new(move || {
        let openapi = ApiDoc::openapi();

        App::new()
            .app_data(session.clone())
            .app_data(database.clone())
            .app_data(shared_config.clone())
            .wrap(TracingLogger::default())
            .wrap(cors(&shared_config.cors_origin))
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi))
            .route("/api/health", web::get().to(handlers::api::health))
            .service(web::scope("/api/v1").service(handlers::users::scope(
                auth.clone(),
                limiter.clone(),
                shared_config.upload_limit_bytes,
            )))
    })
    .bind(&bind_address)?
    .run()
    .await
}
