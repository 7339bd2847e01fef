use actix_web::{cookie::Cookie, http::StatusCode, HttpResponse};
use serde::Serialize;

/// Envelope shared by every response body, successful or not.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T: Serialize> {
    pub status_code: u16,
    pub data: T,
    pub message: String,
    pub success: bool,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(status: StatusCode, data: T, message: impl Into<String>) -> Self {
        ApiResponse {
            status_code: status.as_u16(),
            data,
            message: message.into(),
            success: status.as_u16() < 400,
        }
    }

    pub fn with_cookies<'c>(self, cookies: impl IntoIterator<Item = Cookie<'c>>) -> HttpResponse {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);
        let mut builder = HttpResponse::build(status);
        for cookie in cookies {
            builder.cookie(cookie);
        }
        builder.json(self)
    }
}

impl<T: Serialize> From<ApiResponse<T>> for HttpResponse {
    fn from(body: ApiResponse<T>) -> Self {
        body.with_cookies(Vec::new())
    }
}
