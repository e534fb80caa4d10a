use thiserror::Error;

use crate::transaction::TransactionError;

/// Result type used across the storage core.
pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("log corruption: {0}")]
    Corruption(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl DbError {
    /// True when retrying the same operation can never succeed because the
    /// target simply is not there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::NotFound("page 42".to_string());
        assert_eq!(err.to_string(), "not found: page 42");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: DbError = io.into();
        assert!(matches!(err, DbError::Io(_)));
    }
}
