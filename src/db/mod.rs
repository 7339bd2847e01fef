pub mod user_repository;

use thiserror::Error;

#[derive(Clone)]
pub struct Database {
    pub db: sled::Db,
}

impl Database {
    pub fn new(path: &str) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Database { db })
    }

    /// Throwaway store removed when the last handle is dropped.
    #[allow(dead_code)]
    pub fn in_memory() -> Result<Self, sled::Error> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Database { db })
    }

    pub fn is_healthy(&self) -> bool {
        self.db.size_on_disk().is_ok()
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("user not found")]
    NotFound,
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode user: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode user: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("failed to hash password: {0}")]
    Hash(String),
}
