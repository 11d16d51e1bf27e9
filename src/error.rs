//! Unified error handling for the marker-cluster library.
//!
//! Clustering and spiderfy operations never fail: out-of-range zooms are
//! clamped, stale cluster ids yield empty results and malformed regions
//! produce no zoom level. Errors are reserved for configuration validation
//! and decoding host-provided JSON.

use thiserror::Error;

/// Unified error type for marker-cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Configuration values are out of their valid range
    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },

    /// A point could not be ingested
    #[error("Point '{id}' is invalid: {message}")]
    InvalidPoint { id: String, message: String },

    /// Host JSON could not be decoded or encoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        ClusterError::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Result type alias for marker-cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClusterError::InvalidPoint {
            id: "cafe-1".to_string(),
            message: "latitude out of range".to_string(),
        };
        assert!(err.to_string().contains("cafe-1"));
        assert!(err.to_string().contains("latitude"));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<Vec<u32>, _> = serde_json::from_str("[1,");
        let err: ClusterError = parse.unwrap_err().into();
        assert!(matches!(err, ClusterError::Json(_)));
        assert!(err.to_string().starts_with("JSON error"));
    }
}
