use crate::db::{Database, RepositoryError};
use crate::models::user::{NewUser, User};
use crate::utils::auth::hash_password;
use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};
use std::str;
use tracing::info;

const USERS_TREE: &str = "users";
const USERNAME_INDEX_TREE: &str = "username_index";
const EMAIL_INDEX_TREE: &str = "email_index";

#[derive(Debug, Clone, Encode, Decode)]
struct StoredUser {
    id: String,
    username: String,
    email: String,
    fullname: String,
    avatar: String,
    cover_image: String,
    password_hash: String,
    refresh_token: Option<String>,
    created_at: i64, // millis since epoch
    updated_at: i64,
}

impl From<StoredUser> for User {
    fn from(stored: StoredUser) -> Self {
        User {
            id: stored.id,
            username: stored.username,
            email: stored.email,
            fullname: stored.fullname,
            avatar: stored.avatar,
            cover_image: stored.cover_image,
            password_hash: stored.password_hash,
            refresh_token: stored.refresh_token,
            created_at: from_millis(stored.created_at),
            updated_at: from_millis(stored.updated_at),
        }
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

fn encode(user: &StoredUser) -> Result<Vec<u8>, RepositoryError> {
    Ok(bincode::encode_to_vec(user, bincode::config::standard())?)
}

fn decode(data: &[u8]) -> Result<StoredUser, RepositoryError> {
    let (stored, _): (StoredUser, usize) =
        bincode::decode_from_slice(data, bincode::config::standard())?;
    Ok(stored)
}

/// Index key for an email. Uniqueness is case-insensitive, the stored
/// address keeps the caller's casing.
fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

fn username_key(username: &str) -> String {
    username.trim().to_lowercase()
}

/// User documents keyed by id, plus username and email indexes.
///
/// Writes touching a single document go through compare-and-swap, so a
/// concurrent write to the same user is never silently lost.
pub struct UserRepository {
    db: Database,
}

impl UserRepository {
    pub fn new(db: Database) -> Self {
        UserRepository { db }
    }

    fn tree(&self, name: &str) -> Result<Tree, RepositoryError> {
        Ok(self.db.db.open_tree(name)?)
    }

    /// Hashes the password and inserts the user with both index entries in
    /// one transaction.
    pub async fn create(&self, new_user: NewUser) -> Result<User, RepositoryError> {
        let password_hash =
            hash_password(&new_user.password).map_err(|e| RepositoryError::Hash(e.to_string()))?;
        let now = Utc::now().timestamp_millis();
        let stored = StoredUser {
            id: uuid::Uuid::new_v4().to_string(),
            username: username_key(&new_user.username),
            email: new_user.email.trim().to_string(),
            fullname: new_user.fullname,
            avatar: new_user.avatar,
            cover_image: new_user.cover_image,
            password_hash,
            refresh_token: None,
            created_at: now,
            updated_at: now,
        };
        let encoded = encode(&stored)?;
        let name_key = stored.username.clone();
        let mail_key = email_key(&stored.email);

        let users = self.tree(USERS_TREE)?;
        let usernames = self.tree(USERNAME_INDEX_TREE)?;
        let emails = self.tree(EMAIL_INDEX_TREE)?;

        let result = (&users, &usernames, &emails).transaction(|(users, usernames, emails)| {
            if usernames.get(name_key.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(RepositoryError::Conflict(
                    "username",
                )));
            }
            if emails.get(mail_key.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(RepositoryError::Conflict(
                    "email",
                )));
            }
            users.insert(stored.id.as_bytes(), encoded.as_slice())?;
            usernames.insert(name_key.as_bytes(), stored.id.as_bytes())?;
            emails.insert(mail_key.as_bytes(), stored.id.as_bytes())?;
            Ok(())
        });
        flatten(result)?;

        info!(user_id = %stored.id, username = %stored.username, "User created in database");

        Ok(stored.into())
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<User>, RepositoryError> {
        match self.tree(USERS_TREE)?.get(id.as_bytes())? {
            Some(data) => Ok(Some(decode(&data)?.into())),
            None => Ok(None),
        }
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError> {
        self.get_by_index(USERNAME_INDEX_TREE, &username_key(username))
            .await
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        self.get_by_index(EMAIL_INDEX_TREE, &email_key(email)).await
    }

    async fn get_by_index(&self, index: &str, key: &str) -> Result<Option<User>, RepositoryError> {
        match self.tree(index)?.get(key.as_bytes())? {
            Some(user_id) => {
                let id = str::from_utf8(&user_id).map_err(|_| RepositoryError::NotFound)?;
                self.get_by_id(id).await
            }
            None => Ok(None),
        }
    }

    /// True when either the username or the email is already taken.
    pub async fn exists(&self, username: &str, email: &str) -> Result<bool, RepositoryError> {
        let taken_name = self
            .tree(USERNAME_INDEX_TREE)?
            .contains_key(username_key(username).as_bytes())?;
        if taken_name {
            return Ok(true);
        }
        Ok(self
            .tree(EMAIL_INDEX_TREE)?
            .contains_key(email_key(email).as_bytes())?)
    }

    /// Overwrites the stored refresh token. `None` logs the user out.
    pub async fn set_refresh_token(
        &self,
        id: &str,
        token: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.modify(id, |user| {
            user.refresh_token = token.map(str::to_string);
            true
        })?;
        Ok(())
    }

    /// Replaces the refresh token only if the stored one is still
    /// `expected`. Returns false when it was rotated or cleared meanwhile.
    pub async fn swap_refresh_token(
        &self,
        id: &str,
        expected: &str,
        replacement: &str,
    ) -> Result<bool, RepositoryError> {
        let swapped = self.modify(id, |user| {
            if user.refresh_token.as_deref() != Some(expected) {
                return false;
            }
            user.refresh_token = Some(replacement.to_string());
            true
        })?;
        Ok(swapped.is_some())
    }

    pub async fn update_password(&self, id: &str, new_password: &str) -> Result<(), RepositoryError> {
        let new_hash =
            hash_password(new_password).map_err(|e| RepositoryError::Hash(e.to_string()))?;
        self.modify(id, |user| {
            user.password_hash = new_hash.clone();
            true
        })?;

        info!(user_id = %id, "User password updated in database");

        Ok(())
    }

    pub async fn set_avatar(&self, id: &str, url: &str) -> Result<User, RepositoryError> {
        self.modify(id, |user| {
            user.avatar = url.to_string();
            true
        })?
        .ok_or(RepositoryError::NotFound)
    }

    pub async fn set_cover_image(&self, id: &str, url: &str) -> Result<User, RepositoryError> {
        self.modify(id, |user| {
            user.cover_image = url.to_string();
            true
        })?
        .ok_or(RepositoryError::NotFound)
    }

    /// Changes email and full name, moving the email index entry when the
    /// address changes.
    pub async fn update_account(
        &self,
        id: &str,
        email: &str,
        fullname: &str,
    ) -> Result<User, RepositoryError> {
        let users = self.tree(USERS_TREE)?;
        let emails = self.tree(EMAIL_INDEX_TREE)?;
        let new_key = email_key(email);
        let email = email.trim();

        let result = (&users, &emails).transaction(|(users, emails)| {
            let Some(current) = users.get(id.as_bytes())? else {
                return Err(ConflictableTransactionError::Abort(RepositoryError::NotFound));
            };
            let mut stored = decode(&current).map_err(ConflictableTransactionError::Abort)?;

            if let Some(owner) = emails.get(new_key.as_bytes())? {
                if owner.as_ref() != id.as_bytes() {
                    return Err(ConflictableTransactionError::Abort(RepositoryError::Conflict(
                        "email",
                    )));
                }
            }
            let old_key = email_key(&stored.email);
            if old_key != new_key {
                emails.remove(old_key.as_bytes())?;
                emails.insert(new_key.as_bytes(), id.as_bytes())?;
            }

            stored.email = email.to_string();
            stored.fullname = fullname.to_string();
            stored.updated_at = Utc::now().timestamp_millis();
            let encoded = encode(&stored).map_err(ConflictableTransactionError::Abort)?;
            users.insert(id.as_bytes(), encoded)?;
            Ok(stored)
        });
        let stored = flatten(result)?;

        info!(user_id = %id, "User account details updated");

        Ok(stored.into())
    }

    /// Read-modify-write on one document. `apply` returning false leaves the
    /// document untouched and yields `None`. Retries when another writer got
    /// in between the read and the swap.
    fn modify<F>(&self, id: &str, mut apply: F) -> Result<Option<User>, RepositoryError>
    where
        F: FnMut(&mut StoredUser) -> bool,
    {
        let users = self.tree(USERS_TREE)?;
        loop {
            let current = users
                .get(id.as_bytes())?
                .ok_or(RepositoryError::NotFound)?;
            let mut stored = decode(&current)?;
            if !apply(&mut stored) {
                return Ok(None);
            }
            stored.updated_at = Utc::now().timestamp_millis();
            let encoded = encode(&stored)?;

            if users
                .compare_and_swap(id.as_bytes(), Some(current), Some(encoded))?
                .is_ok()
            {
                return Ok(Some(stored.into()));
            }
        }
    }
}

fn flatten<T>(result: Result<T, TransactionError<RepositoryError>>) -> Result<T, RepositoryError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => RepositoryError::Storage(e),
    })
}
