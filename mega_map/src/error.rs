use thiserror::Error;
use tier_cache::CacheError;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MegaMapError {
    #[error("invalid map name: {0}")]
    InvalidName(String),

    #[error("MegaMap with name '{0}' already exists")]
    AlreadyExists(String),

    #[error("MegaMap '{0}' is active")]
    Active(String),

    #[error("MegaMap has been shut down")]
    ShutDown,

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl<T> From<std::sync::PoisonError<T>> for MegaMapError {
    fn from(_value: std::sync::PoisonError<T>) -> Self {
        MegaMapError::Cache(CacheError::LockPoisoned)
    }
}

pub type Result<T> = std::result::Result<T, MegaMapError>;
