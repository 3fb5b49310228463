use std::io;
use std::sync::PoisonError;

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("{name}: not alive")]
    NotAlive { name: String },

    #[error("cache {name} already exists")]
    AlreadyExists { name: String },

    #[error("File I/O error")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    ConfigurationMissing(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl CacheError {
    pub fn not_alive(name: impl Into<String>) -> CacheError {
        CacheError::NotAlive { name: name.into() }
    }

    pub fn serialization<T: ToString>(value: T) -> CacheError {
        CacheError::Serialization(value.to_string())
    }
}

impl<T> From<PoisonError<T>> for CacheError {
    fn from(_value: PoisonError<T>) -> Self {
        CacheError::LockPoisoned
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

// For error checking
impl PartialEq for CacheError {
    fn eq(&self, other: &CacheError) -> bool {
        match (self, other) {
            (CacheError::Io(ref e1), CacheError::Io(ref e2)) => e1.kind() == e2.kind(),
            (CacheError::NotAlive { name: n1 }, CacheError::NotAlive { name: n2 }) => n1 == n2,
            (CacheError::AlreadyExists { name: n1 }, CacheError::AlreadyExists { name: n2 }) => n1 == n2,
            _ => false,
        }
    }
}
