//! Account and session lifecycle: register, login, token refresh, logout,
//! password change and profile updates.
//!
//! Every operation is a sequence of awaited store, signing and media-host
//! calls with no background work. Failures surface as [`ApiError`] kinds
//! without retries.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::db::user_repository::UserRepository;
use crate::db::RepositoryError;
use crate::errors::ApiError;
use crate::models::user::{Claims, NewUser, TokenPair, User, UserResponse};
use crate::services::media::{LocalFile, MediaUploader};
use crate::utils::auth::TokenIssuer;

const INVALID_CREDENTIALS: &str = "invalid username or password";
const INVALID_ACCESS_TOKEN: &str = "Invalid access token";

pub struct RegisterInput {
    pub username: String,
    pub email: String,
    pub password: String,
    pub fullname: String,
    pub avatar: Option<LocalFile>,
    pub cover_image: Option<LocalFile>,
}

#[derive(Default)]
pub struct LoginInput {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

pub struct ChangePasswordInput {
    pub password: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[derive(Debug)]
pub struct LoginOutcome {
    pub user: UserResponse,
    pub tokens: TokenPair,
}

#[derive(Clone, Copy, Debug)]
enum MediaSlot {
    Avatar,
    CoverImage,
}

impl MediaSlot {
    fn label(self) -> &'static str {
        match self {
            MediaSlot::Avatar => "avatar",
            MediaSlot::CoverImage => "cover image",
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub struct SessionService {
    users: UserRepository,
    tokens: TokenIssuer,
    media: Arc<dyn MediaUploader>,
}

impl SessionService {
    pub fn new(users: UserRepository, tokens: TokenIssuer, media: Arc<dyn MediaUploader>) -> Self {
        SessionService { users, tokens, media }
    }

    /// Signs a fresh pair for `user_id` and stores the refresh half on the
    /// user record.
    pub async fn issue_tokens(&self, user_id: &str) -> Result<TokenPair, ApiError> {
        let user = match self.users.get_by_id(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err(ApiError::NotFound("User does not exist".to_string())),
            Err(e) => {
                error!(error = %e, user_id = %user_id, "Failed to load user for token issue");
                return Err(ApiError::Internal);
            }
        };

        let pair = self.sign_pair(&user)?;
        if let Err(e) = self
            .users
            .set_refresh_token(&user.id, Some(&pair.refresh_token))
            .await
        {
            error!(error = %e, user_id = %user.id, "Failed to persist refresh token");
            return Err(ApiError::Internal);
        }

        Ok(pair)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<Claims, ApiError> {
        self.tokens
            .verify_refresh_token(token)
            .map_err(|_| ApiError::InvalidToken("Invalid refresh token".to_string()))
    }

    fn sign_pair(&self, user: &User) -> Result<TokenPair, ApiError> {
        let sign = || -> Result<TokenPair, jsonwebtoken::errors::Error> {
            Ok(TokenPair {
                access_token: self.tokens.create_access_token(user)?,
                refresh_token: self.tokens.create_refresh_token(user)?,
            })
        };
        sign().map_err(|e| {
            error!(error = ?e, user_id = %user.id, "Failed to sign tokens");
            ApiError::Internal
        })
    }

    pub async fn register(&self, input: RegisterInput) -> Result<UserResponse, ApiError> {
        let fields = [
            non_blank(Some(input.username.as_str())),
            non_blank(Some(input.email.as_str())),
            non_blank(Some(input.password.as_str())),
            non_blank(Some(input.fullname.as_str())),
        ];
        let [Some(username), Some(email), Some(_), Some(fullname)] = fields else {
            warn!("Registration failed: blank required field");
            return Err(ApiError::Validation("All fields are required".to_string()));
        };

        info!(username = %username, email = %email, "Registration attempt");

        if self.users.exists(username, email).await? {
            warn!(username = %username, email = %email, "Registration failed: user already exists");
            return Err(ApiError::Conflict(
                "User with email or username already exists".to_string(),
            ));
        }

        let Some(avatar_file) = &input.avatar else {
            return Err(ApiError::Validation("Avatar file is required".to_string()));
        };

        let avatar = self.media.upload(avatar_file).await.map_err(|e| {
            warn!(error = %e, username = %username, "Avatar upload failed");
            ApiError::Upload("Failed to upload avatar".to_string())
        })?;

        let cover_image = match &input.cover_image {
            Some(file) => match self.media.upload(file).await {
                Ok(url) => url,
                Err(e) => {
                    warn!(error = %e, username = %username, "Cover image upload failed, continuing without it");
                    String::new()
                }
            },
            None => String::new(),
        };

        let uploaded = [avatar.clone(), cover_image.clone()];
        let created = match self
            .users
            .create(NewUser {
                username: username.to_string(),
                email: email.to_string(),
                fullname: fullname.to_string(),
                password: input.password.clone(),
                avatar,
                cover_image,
            })
            .await
        {
            Ok(created) => created,
            Err(e) => {
                for url in uploaded.iter().filter(|u| !u.is_empty()) {
                    if let Err(delete_err) = self.media.delete(url).await {
                        warn!(error = %delete_err, url = %url, "Failed to delete media of rejected registration");
                    }
                }
                return Err(e.into());
            }
        };

        let user = self.sanitized(&created.id).await?;
        info!(user_id = %user.id, username = %user.username, "User registered successfully");

        Ok(user)
    }

    pub async fn login(&self, input: LoginInput) -> Result<LoginOutcome, ApiError> {
        let username = non_blank(input.username.as_deref());
        let email = non_blank(input.email.as_deref());
        if username.is_none() && email.is_none() {
            return Err(ApiError::Validation("username or email is required".to_string()));
        }
        let Some(password) = input.password.as_deref().filter(|p| !p.is_empty()) else {
            return Err(ApiError::Validation("password is required".to_string()));
        };

        info!(username = ?username, email = ?email, "Login attempt");

        let mut found = None;
        if let Some(username) = username {
            found = self.users.get_by_username(username).await?;
        }
        if found.is_none() {
            if let Some(email) = email {
                found = self.users.get_by_email(email).await?;
            }
        }

        // Unknown identifier and wrong password look the same to the caller
        let user = match found {
            Some(user) if user.is_password_correct(password) => user,
            Some(user) => {
                warn!(user_id = %user.id, "Login failed: invalid password");
                return Err(ApiError::Authentication(INVALID_CREDENTIALS.to_string()));
            }
            None => {
                warn!(username = ?username, email = ?email, "Login failed: user not found");
                return Err(ApiError::Authentication(INVALID_CREDENTIALS.to_string()));
            }
        };

        let tokens = self.issue_tokens(&user.id).await?;
        let user = self.sanitized(&user.id).await?;

        info!(user_id = %user.id, "User logged in successfully");

        Ok(LoginOutcome { user, tokens })
    }

    pub async fn logout(&self, user_id: &str) -> Result<(), ApiError> {
        self.users.set_refresh_token(user_id, None).await?;
        info!(user_id = %user_id, "User logged out");
        Ok(())
    }

    /// Exchanges the current refresh token for a new pair. The stored token
    /// is replaced only if it still equals the presented one, so a stale or
    /// concurrently rotated token is refused.
    pub async fn refresh(&self, presented: Option<&str>) -> Result<TokenPair, ApiError> {
        let Some(presented) = non_blank(presented) else {
            return Err(ApiError::Validation("Refresh token is required".to_string()));
        };

        let claims = self.verify_refresh_token(presented)?;
        let Some(user) = self.users.get_by_id(&claims.sub).await? else {
            warn!(user_id = %claims.sub, "Refresh failed: user no longer exists");
            return Err(ApiError::InvalidToken("Invalid refresh token".to_string()));
        };

        if user.refresh_token.as_deref() != Some(presented) {
            warn!(user_id = %user.id, "Refresh failed: token does not match the stored one");
            return Err(ApiError::ExpiredOrReusedToken);
        }

        let pair = self.rotate(&user, presented).await?;
        info!(user_id = %user.id, "Access token refreshed");
        Ok(pair)
    }

    /// Signs a new pair for `user` and stores it only if `presented` is still
    /// the stored refresh token.
    async fn rotate(&self, user: &User, presented: &str) -> Result<TokenPair, ApiError> {
        let pair = self.sign_pair(user)?;
        let swapped = self
            .users
            .swap_refresh_token(&user.id, presented, &pair.refresh_token)
            .await
            .map_err(|e| {
                error!(error = %e, user_id = %user.id, "Failed to rotate refresh token");
                ApiError::Internal
            })?;
        if !swapped {
            warn!(user_id = %user.id, "Refresh failed: token rotated concurrently");
            return Err(ApiError::ExpiredOrReusedToken);
        }

        Ok(pair)
    }

    pub async fn change_password(
        &self,
        user_id: &str,
        input: ChangePasswordInput,
    ) -> Result<(), ApiError> {
        if input.new_password.trim().is_empty() {
            return Err(ApiError::Validation("New password is required".to_string()));
        }
        if input.new_password != input.confirm_password {
            return Err(ApiError::Validation(
                "New password and confirmation do not match".to_string(),
            ));
        }

        let user = self.user(user_id).await?;
        if !user.is_password_correct(&input.password) {
            warn!(user_id = %user_id, "Password change failed: incorrect current password");
            return Err(ApiError::Authentication("Invalid old password".to_string()));
        }

        self.users.update_password(user_id, &input.new_password).await?;
        info!(user_id = %user_id, "User changed password");
        Ok(())
    }

    pub async fn current_user(&self, user_id: &str) -> Result<UserResponse, ApiError> {
        Ok(self.user(user_id).await?.into())
    }

    pub async fn update_account(
        &self,
        user_id: &str,
        email: Option<&str>,
        fullname: Option<&str>,
    ) -> Result<UserResponse, ApiError> {
        let (Some(email), Some(fullname)) = (non_blank(email), non_blank(fullname)) else {
            return Err(ApiError::Validation("All fields are required".to_string()));
        };

        let updated = match self.users.update_account(user_id, email, fullname).await {
            Ok(user) => user,
            Err(RepositoryError::Conflict(_)) => {
                return Err(ApiError::Conflict("Email is already in use".to_string()))
            }
            Err(RepositoryError::NotFound) => {
                return Err(ApiError::InvalidToken(INVALID_ACCESS_TOKEN.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(updated.into())
    }

    pub async fn update_avatar(
        &self,
        user_id: &str,
        file: Option<&LocalFile>,
    ) -> Result<UserResponse, ApiError> {
        self.replace_media(user_id, file, MediaSlot::Avatar).await
    }

    pub async fn update_cover_image(
        &self,
        user_id: &str,
        file: Option<&LocalFile>,
    ) -> Result<UserResponse, ApiError> {
        self.replace_media(user_id, file, MediaSlot::CoverImage).await
    }

    /// Uploads the new file, stores its URL, then deletes the asset it
    /// replaced. A failed delete leaves an orphan on the media host but does
    /// not fail the update.
    async fn replace_media(
        &self,
        user_id: &str,
        file: Option<&LocalFile>,
        slot: MediaSlot,
    ) -> Result<UserResponse, ApiError> {
        let Some(file) = file else {
            return Err(ApiError::Validation(format!("{} file is missing", slot.label())));
        };
        let user = self.user(user_id).await?;

        let url = self.media.upload(file).await.map_err(|e| {
            warn!(error = %e, user_id = %user_id, slot = slot.label(), "Media upload failed");
            ApiError::Upload(format!("Error while uploading {}", slot.label()))
        })?;

        let (previous, updated) = match slot {
            MediaSlot::Avatar => (user.avatar, self.users.set_avatar(user_id, &url).await?),
            MediaSlot::CoverImage => (
                user.cover_image,
                self.users.set_cover_image(user_id, &url).await?,
            ),
        };

        if !previous.is_empty() && previous != url {
            if let Err(e) = self.media.delete(&previous).await {
                warn!(error = %e, url = %previous, "Failed to delete replaced media asset");
            }
        }

        info!(user_id = %user_id, slot = slot.label(), "Profile media updated");
        Ok(updated.into())
    }

    async fn user(&self, user_id: &str) -> Result<User, ApiError> {
        self.users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::InvalidToken(INVALID_ACCESS_TOKEN.to_string()))
    }

    /// Re-reads a user that was just written. Absence here is a store fault.
    async fn sanitized(&self, user_id: &str) -> Result<UserResponse, ApiError> {
        match self.users.get_by_id(user_id).await {
            Ok(Some(user)) => Ok(user.into()),
            Ok(None) => {
                error!(user_id = %user_id, "User missing right after write");
                Err(ApiError::Internal)
            }
            Err(e) => {
                error!(error = %e, user_id = %user_id, "Failed to re-read user");
                Err(ApiError::Internal)
            }
        }
    }
}
