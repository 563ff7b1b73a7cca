//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  BadRequest             │ │
//! │  │  MissingInstance│  │  Timeout        │  │  SerializationFailed    │ │
//! │  │  InvalidUrl     │  │  HttpStatus     │  │  DeserializationFailed  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Auth           │  │  Persistence    │  │  Integrity              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Unauthorized   │  │  DatabaseError  │  │  IntegrityViolation     │ │
//! │  │  Forbidden      │  │  NotFound       │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │  Relay / Crypto │  │  Internal       │                              │
//! │  │                 │  │                 │                              │
//! │  │  RelayRole      │  │  ShuttingDown   │                              │
//! │  │  Encryption     │  │  ChannelError   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport errors are retried with backoff, application conflicts never
//! surface here (the resolver handles them), integrity violations are hard
//! errors and persistence errors abort only the record being applied.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Instance id is required on every node.
    #[error("Instance ID not configured. Set INSTANCE_ID or node.instance_id.")]
    MissingInstanceId,

    /// Invalid route or base URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Could not reach the peer.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request or sync task exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Peer answered with a non-success status.
    #[error("Peer returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Every configured route is degraded.
    #[error("No usable sync route")]
    NoRoute,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed request from a peer.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Failed to serialize message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// Missing or invalid credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Valid credentials that do not permit the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Requested row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Equal clocks with different content.
    #[error("Integrity violation for {entity_type}/{entity_id}: {reason}")]
    IntegrityViolation {
        entity_type: String,
        entity_id: String,
        reason: String,
    },

    // =========================================================================
    // Relay / Crypto Errors
    // =========================================================================
    /// Operation not available for this node role.
    #[error("Not available on a {role} node: {operation}")]
    RoleMismatch { role: String, operation: String },

    /// Envelope could not be sealed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Envelope could not be opened (wrong key or tampered).
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Envelope larger than the relay accepts.
    #[error("Packet of {size} bytes exceeds limit of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<stockmesh_db::DbError> for SyncError {
    fn from(err: stockmesh_db::DbError) -> Self {
        if err.is_not_found() {
            SyncError::NotFound(err.to_string())
        } else {
            SyncError::DatabaseError(err.to_string())
        }
    }
}

impl From<stockmesh_core::CoreError> for SyncError {
    fn from(err: stockmesh_core::CoreError) -> Self {
        SyncError::BadRequest(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if err.is_decode() {
            SyncError::DeserializationFailed(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::HttpStatus {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<jsonwebtoken::errors::Error> for SyncError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        SyncError::Unauthorized(format!("Invalid token: {}", err))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        SyncError::Timeout(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Connection failures (network issues)
    /// - Timeouts
    /// - HTTP 5xx from the peer
    ///
    /// ## Non-Retryable Errors
    /// - HTTP 4xx (rejected, auth failure)
    /// - Configuration errors
    /// - Integrity violations
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectionFailed(_) | SyncError::Timeout(_) => true,
            SyncError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingInstanceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true for equal-clock, different-content violations.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, SyncError::IntegrityViolation { .. })
    }

    /// Returns true if the peer rejected our credentials.
    pub fn is_auth_error(&self) -> bool {
        match self {
            SyncError::Unauthorized(_) | SyncError::Forbidden(_) => true,
            SyncError::HttpStatus { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }

    /// HTTP status used when this error answers a mesh request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SyncError::Forbidden(_) => StatusCode::FORBIDDEN,
            SyncError::BadRequest(_)
            | SyncError::DeserializationFailed(_)
            | SyncError::SerializationFailed(_)
            | SyncError::DecryptionFailed(_) => StatusCode::BAD_REQUEST,
            SyncError::PacketTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::RoleMismatch { .. } => StatusCode::CONFLICT,
            SyncError::IntegrityViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            SyncError::Unauthorized(_) => "unauthorized",
            SyncError::Forbidden(_) => "forbidden",
            SyncError::NotFound(_) => "not_found",
            SyncError::RoleMismatch { .. } => "role_mismatch",
            SyncError::IntegrityViolation { .. } => "integrity_violation",
            SyncError::PacketTooLarge { .. } => "packet_too_large",
            e if e.status_code() == StatusCode::BAD_REQUEST => "bad_request",
            _ => "internal",
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Mesh request failed");
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("refused".into()).is_retryable());
        assert!(SyncError::Timeout("10s".into()).is_retryable());
        assert!(SyncError::HttpStatus { status: 503, body: String::new() }.is_retryable());

        assert!(!SyncError::HttpStatus { status: 401, body: String::new() }.is_retryable());
        assert!(!SyncError::HttpStatus { status: 422, body: String::new() }.is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::IntegrityViolation {
            entity_type: "locations".into(),
            entity_id: "Shelf A".into(),
            reason: "hash mismatch".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(SyncError::Unauthorized("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(SyncError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(SyncError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            SyncError::RoleMismatch { role: "blind_relay".into(), operation: "pull".into() }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            SyncError::DatabaseError("disk".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_categories() {
        assert!(SyncError::MissingInstanceId.is_config_error());
        assert!(SyncError::HttpStatus { status: 403, body: String::new() }.is_auth_error());
        assert!(SyncError::IntegrityViolation {
            entity_type: "tracking".into(),
            entity_id: "TEST-1".into(),
            reason: String::new(),
        }
        .is_integrity_error());
    }

    #[test]
    fn test_db_not_found_maps_to_not_found() {
        let err: SyncError = stockmesh_db::DbError::not_found("Conflict", "c1").into();
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
