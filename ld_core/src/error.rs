use std::fmt;

/// Machine-readable code attached to storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    NotFound,
    Conflict,
    InvalidReference,
    NotSupported,
}

impl StorageErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::InvalidReference => "INVALID_REFERENCE",
            Self::NotSupported => "NOT_SUPPORTED",
        }
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage-layer error carrying a code alongside the message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({code})")]
pub struct StorageError {
    pub message: String,
    pub code: StorageErrorCode,
}

impl StorageError {
    pub fn new(message: impl Into<String>, code: StorageErrorCode) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::new(message, StorageErrorCode::InvalidReference)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(message, StorageErrorCode::NotSupported)
    }
}

/// Core error type for ludari
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Whether this error signals an optimistic-concurrency collision.
    ///
    /// Typed variants are checked first; the message markers cover storage
    /// back ends that only surface stringly-typed conflicts.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Storage(e) if e.code == StorageErrorCode::Conflict => true,
            other => {
                let message = other.to_string().to_lowercase();
                message.contains("version mismatch")
                    || message.contains("optimistic lock")
                    || message.contains("concurrent modification")
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
            || matches!(self, Self::Storage(e) if e.code == StorageErrorCode::NotFound)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
