//! Error types for the object-store gateway
//!
//! Provides structured error handling using thiserror for every failure the
//! gateway can report: configuration validation, secret resolution,
//! credential construction and refresh, and remote storage calls.

use http::StatusCode;
use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A configuration key is unknown, missing or carries an invalid value
    #[error("Configuration error: {0}")]
    ConfigValidation(String),

    /// A required secret is absent, or the secrets file could not be read
    #[error("Secrets error: {0}")]
    SecretsResolution(String),

    /// Credential could not be built, refreshed or used for signing
    #[error("Credential error: {0}")]
    Credential(String),

    /// The blob service rejected a call, or the call never reached it
    #[error("Storage error for {key}: {}", describe_remote(.status, .code, .message))]
    StorageService {
        /// Object key (or container for listings) the call was about
        key: String,
        /// HTTP status returned by the service, if any response arrived
        status: Option<StatusCode>,
        /// Service error code from the `x-ms-error-code` header or body
        code: Option<String>,
        message: String,
    },

    /// The object key cannot be addressed as a blob path
    #[error("Invalid object key {0:?}: `.` and `..` segments are not allowed")]
    InvalidObjectKey(String),

    /// An operation was invoked before a successful `init`
    #[error("Gateway is not initialized")]
    NotInitialized,
}

fn describe_remote(status: &Option<StatusCode>, code: &Option<String>, message: &str) -> String {
    match (status, code) {
        (Some(status), Some(code)) => format!("HTTP {} {} - {}", status.as_u16(), code, message),
        (Some(status), None) => format!("HTTP {} - {}", status.as_u16(), message),
        (None, Some(code)) => format!("{} - {}", code, message),
        (None, None) => message.to_string(),
    }
}

impl GatewayError {
    /// Build a storage error from a service response
    pub fn remote(
        key: impl Into<String>,
        status: StatusCode,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        GatewayError::StorageService {
            key: key.into(),
            status: Some(status),
            code,
            message: message.into(),
        }
    }

    /// Build a storage error for a call that produced no service response
    pub fn transport(key: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::StorageService {
            key: key.into(),
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// True when the service reported that the object (or container) does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            GatewayError::StorageService { status, .. } => *status == Some(StatusCode::NOT_FOUND),
            _ => false,
        }
    }

    /// True when the service does not implement the requested call path
    pub fn is_unsupported(&self) -> bool {
        match self {
            GatewayError::StorageService { status, code, .. } => {
                *status == Some(StatusCode::NOT_IMPLEMENTED)
                    || matches!(
                        code.as_deref(),
                        Some("FeatureNotSupported") | Some("NotImplemented")
                    )
            }
            _ => false,
        }
    }

    /// Service error code, when the failure came from the blob service
    pub fn service_code(&self) -> Option<&str> {
        match self {
            GatewayError::StorageService { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GatewayError>;
