use std::env;

use chrono::Duration as ChronoDuration;
use thiserror::Error;
use tracing::warn;

const MIN_SECRET_LEN: usize = 32;
// Ten years
const MAX_TOKEN_TTL_SECS: i64 = 315_360_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Signing material and lifetimes for the two token kinds.
#[derive(Clone, Debug)]
pub struct TokenConfig {
    pub access_secret: String,
    pub access_ttl: ChronoDuration,
    pub refresh_secret: String,
    pub refresh_ttl: ChronoDuration,
}

#[derive(Clone, Debug)]
pub struct MediaConfig {
    pub upload_url: String,
    pub api_key: Option<String>,
}

/// Process configuration, read once at startup and handed to every
/// component that needs it.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    /// `*` allows any origin without credentials.
    pub cors_origin: String,
    pub tokens: TokenConfig,
    pub media: MediaConfig,
    pub auth_rate_limit_per_minute: u32,
    pub upload_limit_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_secret = required("ACCESS_TOKEN_SECRET")?;
        let refresh_secret = required("REFRESH_TOKEN_SECRET")?;
        for (name, secret) in [
            ("ACCESS_TOKEN_SECRET", &access_secret),
            ("REFRESH_TOKEN_SECRET", &refresh_secret),
        ] {
            if secret.len() < MIN_SECRET_LEN {
                warn!(variable = name, "Token secret is shorter than {} bytes", MIN_SECRET_LEN);
            }
        }

        Ok(AppConfig {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: number("PORT", 8080)?,
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "./data/users.sled".to_string()),
            cors_origin: env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".to_string()),
            tokens: TokenConfig {
                access_secret,
                access_ttl: ttl("ACCESS_TOKEN_TTL_SECS", 86_400)?,
                refresh_secret,
                refresh_ttl: ttl("REFRESH_TOKEN_TTL_SECS", 864_000)?,
            },
            media: MediaConfig {
                upload_url: required("MEDIA_UPLOAD_URL")?,
                api_key: env::var("MEDIA_API_KEY").ok().filter(|k| !k.is_empty()),
            },
            auth_rate_limit_per_minute: number("AUTH_RATE_LIMIT_PER_MINUTE", 10)?,
            upload_limit_bytes: number("UPLOAD_LIMIT_BYTES", 10 * 1024 * 1024)?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn number<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(default),
    }
}

/// Token lifetime in seconds, between one second and [`MAX_TOKEN_TTL_SECS`].
fn ttl(name: &'static str, default: i64) -> Result<ChronoDuration, ConfigError> {
    let secs = number(name, default)?;
    (1..=MAX_TOKEN_TTL_SECS)
        .contains(&secs)
        .then(|| ChronoDuration::try_seconds(secs))
        .flatten()
        .ok_or(ConfigError::InvalidNumber {
            name,
            value: secs.to_string(),
        })
}
