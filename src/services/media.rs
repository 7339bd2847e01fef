//! Client for the third-party media host that stores avatars and cover
//! images.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::config::MediaConfig;

/// A file received from a client and spooled to local disk.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to read local file: {0}")]
    Io(#[from] std::io::Error),
    #[error("media host request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("media host responded with status {0}")]
    Rejected(u16),
    #[error("media host response did not contain a url")]
    MissingUrl,
}

#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Uploads the file and returns its hosted URL.
    async fn upload(&self, file: &LocalFile) -> Result<String, MediaError>;

    async fn delete(&self, url: &str) -> Result<(), MediaError>;
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    url: Option<String>,
}

pub struct HttpMediaHost {
    client: reqwest::Client,
    upload_url: String,
    api_key: Option<String>,
}

impl HttpMediaHost {
    pub fn new(config: &MediaConfig) -> Self {
        HttpMediaHost {
            client: reqwest::Client::new(),
            upload_url: config.upload_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl MediaUploader for HttpMediaHost {
    async fn upload(&self, file: &LocalFile) -> Result<String, MediaError> {
        let bytes = tokio::fs::read(&file.path).await?;
        let size = bytes.len();
        let mut part = Part::bytes(bytes).file_name(file.file_name.clone());
        if let Some(content_type) = &file.content_type {
            part = part.mime_str(content_type)?;
        }

        let response = self
            .authorized(self.client.post(&self.upload_url))
            .multipart(Form::new().part("file", part))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MediaError::Rejected(response.status().as_u16()));
        }

        let body: UploadResponse = response.json().await?;
        let url = [body.secure_url, body.url]
            .into_iter()
            .flatten()
            .find(|u| !u.is_empty())
            .ok_or(MediaError::MissingUrl)?;

        info!(file_name = %file.file_name, size, url = %url, "File uploaded to media host");
        Ok(url)
    }

    async fn delete(&self, url: &str) -> Result<(), MediaError> {
        let response = self
            .authorized(self.client.delete(&self.upload_url))
            .query(&[("url", url)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MediaError::Rejected(response.status().as_u16()));
        }

        info!(url = %url, "Media asset deleted");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{dev::ServerHandle, http::header, web, App, HttpRequest, HttpResponse, HttpServer};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Seen {
        method: Mutex<String>,
        authorization: Mutex<Option<String>>,
        query: Mutex<String>,
        body: Mutex<Vec<u8>>,
    }

    struct StubReply {
        status: u16,
        body: Value,
        seen: Arc<Seen>,
    }

    async fn record(req: HttpRequest, body: web::Bytes, stub: web::Data<StubReply>) -> HttpResponse {
        *stub.seen.method.lock().unwrap() = req.method().to_string();
        *stub.seen.authorization.lock().unwrap() = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *stub.seen.query.lock().unwrap() = req.query_string().to_string();
        *stub.seen.body.lock().unwrap() = body.to_vec();

        let status = actix_web::http::StatusCode::from_u16(stub.status).unwrap();
        HttpResponse::build(status).json(&stub.body)
    }

    /// Serves one canned reply on an ephemeral port and records what it got.
    fn stub_host(status: u16, body: Value) -> (String, Arc<Seen>, ServerHandle) {
        let seen = Arc::new(Seen::default());
        let reply = web::Data::new(StubReply {
            status,
            body,
            seen: seen.clone(),
        });
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(reply.clone())
                .default_service(web::to(record))
        })
        .workers(1)
        .listen(listener)
        .unwrap()
        .run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        (format!("http://{addr}/upload"), seen, handle)
    }

    fn host(upload_url: String, api_key: Option<&str>) -> HttpMediaHost {
        HttpMediaHost::new(&MediaConfig {
            upload_url,
            api_key: api_key.map(str::to_string),
        })
    }

    fn spooled(name: &str) -> LocalFile {
        let path = std::env::temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), name));
        std::fs::write(&path, b"\x89PNG-bytes").unwrap();
        LocalFile {
            path,
            file_name: name.to_string(),
            content_type: Some("image/png".to_string()),
        }
    }

    #[actix_web::test]
    async fn test_upload_prefers_secure_url_and_sends_key() {
        let (url, seen, handle) = stub_host(
            200,
            json!({ "secure_url": "https://cdn.test/s.png", "url": "http://cdn.test/p.png" }),
        );
        let file = spooled("ava.png");

        let hosted = host(url, Some("key-1")).upload(&file).await.unwrap();
        assert_eq!(hosted, "https://cdn.test/s.png");
        assert_eq!(*seen.method.lock().unwrap(), "POST");
        assert_eq!(seen.authorization.lock().unwrap().as_deref(), Some("Bearer key-1"));

        let body = String::from_utf8_lossy(&seen.body.lock().unwrap()).to_string();
        assert!(body.contains("name=\"file\""));
        assert!(body.contains("filename=\"ava.png\""));
        assert!(body.contains("PNG-bytes"));

        std::fs::remove_file(&file.path).ok();
        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_upload_falls_back_to_plain_url() {
        let (url, seen, handle) = stub_host(200, json!({ "secure_url": "", "url": "http://cdn.test/p.png" }));
        let file = spooled("cover.png");

        let hosted = host(url, None).upload(&file).await.unwrap();
        assert_eq!(hosted, "http://cdn.test/p.png");
        assert!(seen.authorization.lock().unwrap().is_none());

        std::fs::remove_file(&file.path).ok();
        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_upload_without_url_fails() {
        let (url, _seen, handle) = stub_host(200, json!({ "public_id": "abc" }));
        let file = spooled("ava.png");

        let err = host(url, None).upload(&file).await.unwrap_err();
        assert!(matches!(err, MediaError::MissingUrl));

        std::fs::remove_file(&file.path).ok();
        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_upload_rejected_status() {
        let (url, _seen, handle) = stub_host(502, json!({ "error": "busy" }));
        let file = spooled("ava.png");

        let err = host(url, None).upload(&file).await.unwrap_err();
        assert!(matches!(err, MediaError::Rejected(502)));

        std::fs::remove_file(&file.path).ok();
        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_upload_missing_local_file() {
        let (url, _seen, handle) = stub_host(200, json!({ "url": "http://cdn.test/p.png" }));
        let file = LocalFile {
            path: std::env::temp_dir().join(format!("{}-gone.png", uuid::Uuid::new_v4())),
            file_name: "gone.png".to_string(),
            content_type: None,
        };

        let err = host(url, None).upload(&file).await.unwrap_err();
        assert!(matches!(err, MediaError::Io(_)));

        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_delete_sends_url_query() {
        let (url, seen, handle) = stub_host(200, json!({ "result": "ok" }));

        host(url, Some("key-2"))
            .delete("https://cdn.test/old.png")
            .await
            .unwrap();
        assert_eq!(*seen.method.lock().unwrap(), "DELETE");
        assert_eq!(*seen.query.lock().unwrap(), "url=https%3A%2F%2Fcdn.test%2Fold.png");
        assert_eq!(seen.authorization.lock().unwrap().as_deref(), Some("Bearer key-2"));

        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_delete_rejected_status() {
        let (url, _seen, handle) = stub_host(404, json!({ "result": "not found" }));

        let err = host(url, None).delete("https://cdn.test/old.png").await.unwrap_err();
        assert!(matches!(err, MediaError::Rejected(404)));

        handle.stop(true).await;
    }
}
