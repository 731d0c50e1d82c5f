//! Error types shared across the loader crates

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, BundleError>;

/// Errors raised outside the database layer while reading and parsing
/// bundles.
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown bundle type: {0}")]
    UnknownBundleType(String),

    #[error("Bundle not found: {0}")]
    BundleNotFound(String),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: i64, message: String },
}

impl BundleError {
    pub fn parse(line: i64, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = BundleError::parse(42, "missing id");
        assert_eq!(err.to_string(), "Parse error at line 42: missing id");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BundleError = io.into();
        assert!(matches!(err, BundleError::Io(_)));
    }
}
