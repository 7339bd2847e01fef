use crate::errors::ApiError;
use crate::handlers::users::ACCESS_TOKEN_COOKIE;
use crate::utils::auth::TokenIssuer;
use actix_web::{
    body::{BoxBody, EitherBody},
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error, HttpMessage, ResponseError,
};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};
use tracing::debug;

/// Verifies the access token and exposes its `Claims` to handlers through
/// `web::ReqData<Claims>`.
#[derive(Clone)]
pub struct AuthMiddleware {
    tokens: TokenIssuer,
}

impl AuthMiddleware {
    pub fn new(tokens: TokenIssuer) -> Self {
        AuthMiddleware { tokens }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddlewareService {
            service,
            tokens: self.tokens.clone(),
        }))
    }
}

pub struct AuthMiddlewareService<S> {
    service: S,
    tokens: TokenIssuer,
}

/// Cookie first, then `Authorization: Bearer`.
fn access_token(req: &ServiceRequest) -> Option<String> {
    if let Some(cookie) = req.cookie(ACCESS_TOKEN_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }

    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let verified = match access_token(&req) {
            Some(token) => self
                .tokens
                .verify_access_token(&token)
                .map_err(|_| ApiError::InvalidToken("Invalid access token".to_string())),
            None => Err(ApiError::InvalidToken("Unauthorized request".to_string())),
        };

        let claims = match verified {
            Ok(claims) => claims,
            Err(e) => {
                debug!(path = %req.path(), "Rejected request without a valid access token");
                let (req, _pl) = req.into_parts();
                let res = e.error_response();
                return Box::pin(async move {
                    Ok(ServiceResponse::new(req, res).map_into_right_body())
                });
            }
        };

        req.extensions_mut().insert(claims);

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_left_body())
        })
    }
}
