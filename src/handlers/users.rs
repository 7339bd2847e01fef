use crate::errors::ApiError;
use crate::middleware::{auth::AuthMiddleware, rate_limit::RateLimitMiddleware};
use crate::models::response::ApiResponse;
use crate::models::user::{Claims, TokenPair, UserResponse};
use crate::services::media::LocalFile;
use crate::services::session::{ChangePasswordInput, LoginInput, RegisterInput, SessionService};
use actix_multipart::form::{tempfile::TempFile, text::Text, MultipartForm, MultipartFormConfig};
use actix_web::{
    cookie::{time::Duration as CookieDuration, Cookie, SameSite},
    http::StatusCode,
    web, HttpRequest, HttpResponse, Scope,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const ACCESS_TOKEN_COOKIE: &str = "accessToken";
pub const REFRESH_TOKEN_COOKIE: &str = "refreshToken";

#[derive(MultipartForm)]
pub struct RegisterForm {
    pub username: Option<Text<String>>,
    pub email: Option<Text<String>>,
    pub password: Option<Text<String>>,
    pub fullname: Option<Text<String>>,
    pub avatar: Option<TempFile>,
    #[multipart(rename = "coverImage")]
    pub cover_image: Option<TempFile>,
}

#[derive(MultipartForm)]
pub struct AvatarForm {
    pub avatar: Option<TempFile>,
}

#[derive(MultipartForm)]
pub struct CoverImageForm {
    #[multipart(rename = "coverImage")]
    pub cover_image: Option<TempFile>,
}

/// Documentation shape of the registration form.
#[allow(dead_code)]
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUpload {
    pub username: String,
    pub email: String,
    pub password: String,
    pub fullname: String,
    #[schema(value_type = String, format = Binary)]
    pub avatar: Vec<u8>,
    #[schema(value_type = Option<String>, format = Binary)]
    pub cover_image: Option<Vec<u8>>,
}

#[allow(dead_code)]
#[derive(Deserialize, ToSchema)]
pub struct AvatarUpload {
    #[schema(value_type = String, format = Binary)]
    pub avatar: Vec<u8>,
}

#[allow(dead_code)]
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CoverImageUpload {
    #[schema(value_type = String, format = Binary)]
    pub cover_image: Vec<u8>,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: UserResponse,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub new_password: String,
    #[serde(default)]
    pub confirm_password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateAccountRequest {
    pub email: Option<String>,
    pub fullname: Option<String>,
}

fn session_cookie(name: &'static str, value: String) -> Cookie<'static> {
    Cookie::build(name, value)
        .http_only(true)
        .same_site(SameSite::None)
        .secure(true)
        .path("/")
        .finish()
}

fn removal_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build(name, "")
        .http_only(true)
        .same_site(SameSite::None)
        .secure(true)
        .path("/")
        .max_age(CookieDuration::seconds(0))
        .finish()
}

fn token_cookies(tokens: &TokenPair) -> [Cookie<'static>; 2] {
    [
        session_cookie(ACCESS_TOKEN_COOKIE, tokens.access_token.clone()),
        session_cookie(REFRESH_TOKEN_COOKIE, tokens.refresh_token.clone()),
    ]
}

fn text(field: Option<Text<String>>) -> String {
    field.map(|t| t.0).unwrap_or_default()
}

/// An empty part counts as no file at all.
fn local_file(file: &Option<TempFile>) -> Option<LocalFile> {
    let file = file.as_ref().filter(|f| f.size > 0)?;
    Some(LocalFile {
        path: file.file.path().to_path_buf(),
        file_name: file
            .file_name
            .clone()
            .unwrap_or_else(|| "upload".to_string()),
        content_type: file.content_type.as_ref().map(|m| m.to_string()),
    })
}

/// Routes under `/users`. Public endpoints share one rate limiter, the rest
/// require an access token.
pub fn scope(auth: AuthMiddleware, limiter: RateLimitMiddleware, upload_limit: usize) -> Scope {
    let json_config = web::JsonConfig::default()
        .error_handler(|err, _req| ApiError::Validation(err.to_string()).into());
    let multipart_config = MultipartFormConfig::default()
        .total_limit(upload_limit)
        .error_handler(|err, _req| ApiError::Validation(err.to_string()).into());

    web::scope("/users")
        .app_data(json_config)
        .app_data(multipart_config)
        .service(
            web::resource("/register")
                .wrap(limiter.clone())
                .route(web::post().to(register)),
        )
        .service(
            web::resource("/login")
                .wrap(limiter.clone())
                .route(web::post().to(login)),
        )
        .service(
            web::resource("/refresh-token")
                .wrap(limiter)
                .route(web::post().to(refresh_access_token)),
        )
        .service(
            web::resource("/logout")
                .wrap(auth.clone())
                .route(web::post().to(logout)),
        )
        .service(
            web::resource("/password")
                .wrap(auth.clone())
                .route(web::patch().to(change_password)),
        )
        .service(
            web::resource("/me")
                .wrap(auth.clone())
                .route(web::get().to(current_user)),
        )
        .service(
            web::resource("/account")
                .wrap(auth.clone())
                .route(web::patch().to(update_account)),
        )
        .service(
            web::resource("/avatar")
                .wrap(auth.clone())
                .route(web::patch().to(update_avatar)),
        )
        .service(
            web::resource("/cover-image")
                .wrap(auth)
                .route(web::patch().to(update_cover_image)),
        )
}

/// Register a new user
#[utoipa::path(
    post,
    path = "/api/v1/users/register",
    request_body(content = RegisterUpload, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "User registered successfully", body = UserResponse),
        (status = 400, description = "Missing field or avatar"),
        (status = 409, description = "Username or email already taken"),
        (status = 500, description = "Avatar upload failed")
    ),
    tag = "Users"
)]
pub async fn register(
    service: web::Data<SessionService>,
    form: MultipartForm<RegisterForm>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    let avatar = local_file(&form.avatar);
    let cover_image = local_file(&form.cover_image);
    let input = RegisterInput {
        username: text(form.username),
        email: text(form.email),
        password: text(form.password),
        fullname: text(form.fullname),
        avatar,
        cover_image,
    };

    let user = service.register(input).await?;
    Ok(ApiResponse::new(StatusCode::CREATED, user, "User registered successfully").into())
}

/// Log in with username or email
#[utoipa::path(
    post,
    path = "/api/v1/users/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in, session cookies set", body = LoginResponse),
        (status = 400, description = "Missing identifier or password"),
        (status = 401, description = "Invalid username or password")
    ),
    tag = "Users"
)]
pub async fn login(
    service: web::Data<SessionService>,
    payload: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let payload = payload.into_inner();
    let outcome = service
        .login(LoginInput {
            username: payload.username,
            email: payload.email,
            password: payload.password,
        })
        .await?;

    let cookies = token_cookies(&outcome.tokens);
    let body = LoginResponse {
        user: outcome.user,
        access_token: outcome.tokens.access_token,
        refresh_token: outcome.tokens.refresh_token,
    };
    Ok(ApiResponse::new(StatusCode::OK, body, "User logged in successfully").with_cookies(cookies))
}

/// Log out and revoke the stored refresh token
#[utoipa::path(
    post,
    path = "/api/v1/users/logout",
    responses(
        (status = 200, description = "Logged out, session cookies cleared"),
        (status = 401, description = "Unauthorized")
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn logout(
    service: web::Data<SessionService>,
    claims: web::ReqData<Claims>,
) -> Result<HttpResponse, ApiError> {
    service.logout(&claims.sub).await?;

    let cookies = [
        removal_cookie(ACCESS_TOKEN_COOKIE),
        removal_cookie(REFRESH_TOKEN_COOKIE),
    ];
    Ok(ApiResponse::new(StatusCode::OK, serde_json::json!({}), "User logged out").with_cookies(cookies))
}

/// Exchange a refresh token for a new token pair
#[utoipa::path(
    post,
    path = "/api/v1/users/refresh-token",
    request_body(content = RefreshRequest, description = "Only read when no refreshToken cookie is sent"),
    responses(
        (status = 200, description = "New token pair issued", body = TokenPair),
        (status = 400, description = "No refresh token supplied"),
        (status = 401, description = "Invalid, expired or reused refresh token")
    ),
    tag = "Users"
)]
pub async fn refresh_access_token(
    service: web::Data<SessionService>,
    req: HttpRequest,
    payload: Option<web::Json<RefreshRequest>>,
) -> Result<HttpResponse, ApiError> {
    let from_cookie = req
        .cookie(REFRESH_TOKEN_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty());
    let presented = from_cookie.or_else(|| payload.and_then(|p| p.into_inner().refresh_token));

    let tokens = service.refresh(presented.as_deref()).await?;
    let cookies = token_cookies(&tokens);
    Ok(ApiResponse::new(StatusCode::OK, tokens, "Access token refreshed").with_cookies(cookies))
}

/// Change the current user's password
#[utoipa::path(
    patch,
    path = "/api/v1/users/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed"),
        (status = 400, description = "New password blank or not confirmed"),
        (status = 401, description = "Unauthorized or incorrect current password")
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn change_password(
    service: web::Data<SessionService>,
    claims: web::ReqData<Claims>,
    payload: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, ApiError> {
    let payload = payload.into_inner();
    service
        .change_password(
            &claims.sub,
            ChangePasswordInput {
                password: payload.password,
                new_password: payload.new_password,
                confirm_password: payload.confirm_password,
            },
        )
        .await?;

    Ok(ApiResponse::new(StatusCode::OK, serde_json::json!({}), "Password changed successfully").into())
}

/// Get the current user
#[utoipa::path(
    get,
    path = "/api/v1/users/me",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn current_user(
    service: web::Data<SessionService>,
    claims: web::ReqData<Claims>,
) -> Result<HttpResponse, ApiError> {
    let user = service.current_user(&claims.sub).await?;
    Ok(ApiResponse::new(StatusCode::OK, user, "Current user fetched successfully").into())
}

/// Update email and full name
#[utoipa::path(
    patch,
    path = "/api/v1/users/account",
    request_body = UpdateAccountRequest,
    responses(
        (status = 200, description = "Account details updated", body = UserResponse),
        (status = 400, description = "Missing field"),
        (status = 401, description = "Unauthorized"),
        (status = 409, description = "Email already in use")
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn update_account(
    service: web::Data<SessionService>,
    claims: web::ReqData<Claims>,
    payload: web::Json<UpdateAccountRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = service
        .update_account(&claims.sub, payload.email.as_deref(), payload.fullname.as_deref())
        .await?;
    Ok(ApiResponse::new(StatusCode::OK, user, "Account details updated successfully").into())
}

/// Replace the avatar
#[utoipa::path(
    patch,
    path = "/api/v1/users/avatar",
    request_body(content = AvatarUpload, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Avatar updated", body = UserResponse),
        (status = 400, description = "Avatar file missing"),
        (status = 401, description = "Unauthorized"),
        (status = 500, description = "Upload failed")
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn update_avatar(
    service: web::Data<SessionService>,
    claims: web::ReqData<Claims>,
    form: MultipartForm<AvatarForm>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    let file = local_file(&form.avatar);
    let user = service.update_avatar(&claims.sub, file.as_ref()).await?;
    Ok(ApiResponse::new(StatusCode::OK, user, "Avatar updated successfully").into())
}

/// Replace the cover image
#[utoipa::path(
    patch,
    path = "/api/v1/users/cover-image",
    request_body(content = CoverImageUpload, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Cover image updated", body = UserResponse),
        (status = 400, description = "Cover image file missing"),
        (status = 401, description = "Unauthorized"),
        (status = 500, description = "Upload failed")
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn update_cover_image(
    service: web::Data<SessionService>,
    claims: web::ReqData<Claims>,
    form: MultipartForm<CoverImageForm>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    let file = local_file(&form.cover_image);
    let user = service.update_cover_image(&claims.sub, file.as_ref()).await?;
    Ok(ApiResponse::new(StatusCode::OK, user, "Cover image updated successfully").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::db::{user_repository::UserRepository, Database};
    use crate::services::media::testing::InMemoryMediaHost;
    use crate::utils::auth::TokenIssuer;
    use actix_web::{http::header, test, App};
    use chrono::Duration as ChronoDuration;
    use serde_json::{json, Value};
    use std::sync::Arc;

    const BOUNDARY: &str = "vidshare-test-boundary";

    struct Harness {
        service: web::Data<SessionService>,
        tokens: TokenIssuer,
        users: UserRepository,
    }

    fn harness() -> Harness {
        let db = Database::in_memory().unwrap();
        let tokens = TokenIssuer::new(&TokenConfig {
            access_secret: "handler-access-secret".to_string(),
            access_ttl: ChronoDuration::minutes(15),
            refresh_secret: "handler-refresh-secret".to_string(),
            refresh_ttl: ChronoDuration::days(10),
        });
        let service = SessionService::new(
            UserRepository::new(db.clone()),
            tokens.clone(),
            Arc::new(InMemoryMediaHost::default()),
        );
        Harness {
            service: web::Data::new(service),
            tokens,
            users: UserRepository::new(db),
        }
    }

    macro_rules! init_app {
        ($h:expr) => {
            test::init_service(
                App::new().app_data($h.service.clone()).service(
                    web::scope("/api/v1").service(scope(
                        AuthMiddleware::new($h.tokens.clone()),
                        RateLimitMiddleware::new(1000),
                        1024 * 1024,
                    )),
                ),
            )
            .await
        };
    }

    async fn register_ava(h: &Harness) -> UserResponse {
        h.service
            .register(RegisterInput {
                username: "ava".to_string(),
                email: "a@x.com".to_string(),
                password: "p1".to_string(),
                fullname: "Ava A".to_string(),
                avatar: Some(LocalFile {
                    path: std::env::temp_dir().join("ava.png"),
                    file_name: "ava.png".to_string(),
                    content_type: None,
                }),
                cover_image: None,
            })
            .await
            .unwrap()
    }

    fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (name, file_name, bytes) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(uri: &str, body: Vec<u8>) -> test::TestRequest {
        test::TestRequest::post()
            .uri(uri)
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(body)
    }

    #[actix_web::test]
    async fn test_register_multipart() {
        let h = harness();
        let app = init_app!(h);

        let fields = [
            ("username", "Ava"),
            ("email", "a@x.com"),
            ("password", "p1"),
            ("fullname", "Ava A"),
        ];
        let body = multipart_body(&fields, &[("avatar", "ava.png", b"\x89PNG-data")]);
        let res = test::call_service(&app, multipart_request("/api/v1/users/register", body).to_request()).await;
        assert_eq!(res.status(), StatusCode::CREATED);

        let json: Value = test::read_body_json(res).await;
        assert_eq!(json["statusCode"], 201);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["username"], "ava");
        assert!(json["data"].get("password").is_none());
        assert!(json["data"].get("refreshToken").is_none());
        assert!(json["data"]["avatar"].as_str().unwrap().ends_with("/ava.png"));

        let duplicate = multipart_body(&fields, &[("avatar", "ava.png", b"\x89PNG-data")]);
        let res = test::call_service(&app, multipart_request("/api/v1/users/register", duplicate).to_request()).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn test_register_without_avatar() {
        let h = harness();
        let app = init_app!(h);

        let body = multipart_body(
            &[
                ("username", "ava"),
                ("email", "a@x.com"),
                ("password", "p1"),
                ("fullname", "Ava A"),
            ],
            &[],
        );
        let res = test::call_service(&app, multipart_request("/api/v1/users/register", body).to_request()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let json: Value = test::read_body_json(res).await;
        assert_eq!(json["success"], false);
        assert!(json["data"].is_null());
    }

    #[actix_web::test]
    async fn test_login_sets_cookies_and_logout_clears_them() {
        let h = harness();
        register_ava(&h).await;
        let app = init_app!(h);

        let req = test::TestRequest::post()
            .uri("/api/v1/users/login")
            .set_json(json!({ "username": "ava", "password": "p1" }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);

        let cookies: Vec<Cookie<'static>> = res
            .response()
            .cookies()
            .map(|c| c.into_owned())
            .collect();
        let access = cookies.iter().find(|c| c.name() == ACCESS_TOKEN_COOKIE).unwrap().clone();
        let refresh = cookies.iter().find(|c| c.name() == REFRESH_TOKEN_COOKIE).unwrap().clone();
        assert_eq!(access.http_only(), Some(true));
        assert_eq!(access.secure(), Some(true));
        assert_eq!(access.same_site(), Some(SameSite::None));
        assert_eq!(refresh.same_site(), Some(SameSite::None));
        assert!(access.max_age().is_none());

        let json: Value = test::read_body_json(res).await;
        assert_eq!(json["data"]["accessToken"], access.value());
        assert_eq!(json["data"]["refreshToken"], refresh.value());
        assert!(json["data"]["user"].get("password").is_none());
        assert!(json["data"]["user"].get("refreshToken").is_none());

        let req = test::TestRequest::post()
            .uri("/api/v1/users/logout")
            .cookie(access.clone())
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let cleared: Vec<Cookie<'static>> = res
            .response()
            .cookies()
            .map(|c| c.into_owned())
            .collect();
        assert_eq!(cleared.len(), 2);
        assert!(cleared.iter().all(|c| c.value().is_empty()));
        assert!(cleared.iter().all(|c| c.same_site() == Some(SameSite::None)));

        // stale refresh token after logout
        let req = test::TestRequest::post()
            .uri("/api/v1/users/refresh-token")
            .set_json(json!({ "refreshToken": refresh.value() }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let json: Value = test::read_body_json(res).await;
        assert_eq!(json["message"], "Refresh token is expired or used");
    }

    #[actix_web::test]
    async fn test_refresh_from_cookie_rotates() {
        let h = harness();
        let user = register_ava(&h).await;
        let tokens = h.service.issue_tokens(&user.id).await.unwrap();
        let app = init_app!(h);

        let req = test::TestRequest::post()
            .uri("/api/v1/users/refresh-token")
            .cookie(Cookie::new(REFRESH_TOKEN_COOKIE, tokens.refresh_token.clone()))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.response().cookies().count(), 2);

        let json: Value = test::read_body_json(res).await;
        let rotated = json["data"]["refreshToken"].as_str().unwrap();
        assert_ne!(rotated, tokens.refresh_token);

        let stored = h.users.get_by_id(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some(rotated));
    }

    #[actix_web::test]
    async fn test_refresh_without_token() {
        let h = harness();
        let app = init_app!(h);

        let req = test::TestRequest::post().uri("/api/v1/users/refresh-token").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_protected_routes_require_access_token() {
        let h = harness();
        let user = register_ava(&h).await;
        let tokens = h.service.issue_tokens(&user.id).await.unwrap();
        let app = init_app!(h);

        let req = test::TestRequest::get().uri("/api/v1/users/me").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        // a refresh token is not an access token
        let req = test::TestRequest::get()
            .uri("/api/v1/users/me")
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", tokens.refresh_token)))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get()
            .uri("/api/v1/users/me")
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", tokens.access_token)))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let json: Value = test::read_body_json(res).await;
        assert_eq!(json["data"]["id"], user.id.as_str());
    }

    #[actix_web::test]
    async fn test_change_password_and_update_account() {
        let h = harness();
        let user = register_ava(&h).await;
        let tokens = h.service.issue_tokens(&user.id).await.unwrap();
        let app = init_app!(h);
        let bearer = format!("Bearer {}", tokens.access_token);

        let req = test::TestRequest::patch()
            .uri("/api/v1/users/password")
            .insert_header((header::AUTHORIZATION, bearer.clone()))
            .set_json(json!({ "password": "p1", "newPassword": "p2", "confirmPassword": "p3" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::patch()
            .uri("/api/v1/users/password")
            .insert_header((header::AUTHORIZATION, bearer.clone()))
            .set_json(json!({ "password": "p1", "newPassword": "p2", "confirmPassword": "p2" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        let stored = h.users.get_by_id(&user.id).await.unwrap().unwrap();
        assert!(stored.is_password_correct("p2"));

        let req = test::TestRequest::patch()
            .uri("/api/v1/users/account")
            .insert_header((header::AUTHORIZATION, bearer))
            .set_json(json!({ "email": "ava@new.com", "fullname": "Ava Avery" }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let json: Value = test::read_body_json(res).await;
        assert_eq!(json["data"]["email"], "ava@new.com");
        assert_eq!(json["data"]["fullname"], "Ava Avery");
    }

    #[actix_web::test]
    async fn test_update_avatar_multipart() {
        let h = harness();
        let user = register_ava(&h).await;
        let tokens = h.service.issue_tokens(&user.id).await.unwrap();
        let app = init_app!(h);

        let body = multipart_body(&[], &[("avatar", "fresh.png", b"\x89PNG-new")]);
        let req = multipart_request("/api/v1/users/avatar", body)
            .method(actix_web::http::Method::PATCH)
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", tokens.access_token)))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);

        let json: Value = test::read_body_json(res).await;
        assert!(json["data"]["avatar"].as_str().unwrap().ends_with("/fresh.png"));
    }

    #[actix_web::test]
    async fn test_malformed_json_is_a_validation_error() {
        let h = harness();
        let app = init_app!(h);

        let req = test::TestRequest::post()
            .uri("/api/v1/users/login")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{not json")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let json: Value = test::read_body_json(res).await;
        assert_eq!(json["statusCode"], 400);
    }
}
