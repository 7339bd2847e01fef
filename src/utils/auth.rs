use crate::config::TokenConfig;
use crate::models::user::{Claims, TokenKind, User};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Duration as ChronoDuration;
use jsonwebtoken::{decode, encode, errors::Error as JwtError, DecodingKey, EncodingKey, Header, Validation};
use rand_core::OsRng;
use std::sync::Arc;

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(password_hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(password_hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    let argon2 = Argon2::default();

    argon2
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: ChronoDuration,
}

impl SigningKeys {
    fn new(secret: &str, ttl: ChronoDuration) -> Self {
        SigningKeys {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }
}

/// Mints and verifies access and refresh tokens. Each kind has its own
/// secret, and a token of one kind never verifies as the other.
#[derive(Clone)]
pub struct TokenIssuer {
    access: Arc<SigningKeys>,
    refresh: Arc<SigningKeys>,
}

impl TokenIssuer {
    pub fn new(config: &TokenConfig) -> Self {
        TokenIssuer {
            access: Arc::new(SigningKeys::new(&config.access_secret, config.access_ttl)),
            refresh: Arc::new(SigningKeys::new(&config.refresh_secret, config.refresh_ttl)),
        }
    }

    pub fn create_access_token(&self, user: &User) -> Result<String, JwtError> {
        self.sign(user, TokenKind::Access)
    }

    pub fn create_refresh_token(&self, user: &User) -> Result<String, JwtError> {
        self.sign(user, TokenKind::Refresh)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims, JwtError> {
        self.verify(token, TokenKind::Access)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<Claims, JwtError> {
        self.verify(token, TokenKind::Refresh)
    }

    fn keys(&self, kind: TokenKind) -> &SigningKeys {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    fn sign(&self, user: &User, kind: TokenKind) -> Result<String, JwtError> {
        let keys = self.keys(kind);
        let now = chrono::Utc::now();
        let claims = Claims {
            sub: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            token_type: kind,
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now.timestamp() as usize,
            exp: now
                .checked_add_signed(keys.ttl)
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
                .timestamp()
                .max(0) as usize,
        };

        encode(&Header::default(), &claims, &keys.encoding)
    }

    fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, JwtError> {
        let mut validation = Validation::default();
        validation.leeway = 0;

        let token_data = decode::<Claims>(token, &self.keys(kind).decoding, &validation)?;
        if token_data.claims.token_type != kind {
            return Err(jsonwebtoken::errors::ErrorKind::InvalidToken.into());
        }

        Ok(token_data.claims)
    }
}
