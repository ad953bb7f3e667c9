use thiserror::Error;

/// Main error type for Harvestgraph
#[derive(Error, Debug)]
pub enum HarvestError {
    /// Metadata cache errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding of checkpoint artifacts or snapshots
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream API answered with a non-success status
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Upstream API could not be reached (connect failure, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream API response could not be understood
    #[error("Parse error: {0}")]
    Parse(String),

    /// The per-run (or daily) request budget is spent
    #[error("Request budget exhausted after {0} requests")]
    BudgetExhausted(u32),

    /// Checkpoint artifacts exist but disagree with each other
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// A snapshot failed validation and was not recorded
    #[error("Backup rejected: {0}")]
    BackupRejected(String),

    /// Backup archive read/write/compression errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<zip::result::ZipError> for HarvestError {
    fn from(err: zip::result::ZipError) -> Self {
        HarvestError::Archive(err.to_string())
    }
}

impl HarvestError {
    /// True for the corruption failure mode, which must never be answered with
    /// an overwrite of the existing checkpoint.
    pub fn is_corruption(&self) -> bool {
        matches!(self, HarvestError::CorruptCheckpoint(_))
    }
}

/// Convenient Result type using HarvestError
pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarvestError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_api_error_display_carries_status() {
        let err = HarvestError::Api { status: 429, message: "slow down".to_string() };
        assert_eq!(err.to_string(), "API error 429: slow down");
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: HarvestError = rusqlite_err.into();
        assert!(matches!(err, HarvestError::Database(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HarvestError = io_err.into();
        assert!(matches!(err, HarvestError::Io(_)));
    }

    #[test]
    fn test_corruption_flag() {
        assert!(HarvestError::CorruptCheckpoint("x".into()).is_corruption());
        assert!(!HarvestError::BudgetExhausted(3).is_corruption());
    }
}
