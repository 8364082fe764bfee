//! Error kinds for deploy and lifecycle operations, plus their JSON form

use hyper::StatusCode;
use serde::Serialize;

/// Failure returned by every deploy, lifecycle and allocation operation.
///
/// Build and install failures never surface here; the pipeline records them
/// as warnings.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Bad application name, bad remote reference, missing upload
    #[error("{0}")]
    InvalidInput(String),

    /// The normalized name is already used by another application
    #[error("application name \"{0}\" is already in use")]
    NameConflict(String),

    /// Every port in the configured range is taken or not bindable
    #[error("no port available in range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },

    /// Clone, network, auth or extraction failure
    #[error("failed to acquire source: {0}")]
    AcquisitionFailure(String),

    /// Unknown application name
    #[error("application \"{0}\" not found")]
    NotFound(String),

    /// Caller already owns as many applications as their quota allows
    #[error("application limit reached ({used}/{max})")]
    QuotaExceeded { used: usize, max: usize },

    /// Storage or filesystem failure outside of any cleanup path
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    pub fn invalid(message: impl Into<String>) -> Self {
        HostError::InvalidInput(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            HostError::InvalidInput(_) => ErrorCode::InvalidInput,
            HostError::NameConflict(_) => ErrorCode::NameConflict,
            HostError::NoPortAvailable { .. } => ErrorCode::NoPortAvailable,
            HostError::AcquisitionFailure(_) => ErrorCode::AcquisitionFailure,
            HostError::NotFound(_) => ErrorCode::NotFound,
            HostError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            HostError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Structured body for API responses
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError::Internal(err.into())
    }
}

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    NameConflict,
    NoPortAvailable,
    AcquisitionFailure,
    NotFound,
    QuotaExceeded,
    Unauthorized,
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::NameConflict => StatusCode::CONFLICT,
            ErrorCode::NoPortAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::AcquisitionFailure => StatusCode::BAD_GATEWAY,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::QuotaExceeded => StatusCode::FORBIDDEN,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::NameConflict => "NAME_CONFLICT",
            ErrorCode::NoPortAvailable => "NO_PORT_AVAILABLE",
            ErrorCode::AcquisitionFailure => "ACQUISITION_FAILURE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: ErrorCode,
    /// Human-readable error message
    pub error: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: code.status_code().as_u16(),
            code,
            error: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","error":"{}","status":{}}}"#,
                self.code.as_str(),
                self.error.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_statuses() {
        assert_eq!(
            HostError::invalid("bad").code().status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HostError::NameConflict("x".into()).code().status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            HostError::NotFound("x".into()).code().status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HostError::QuotaExceeded { used: 3, max: 3 }.code().status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_error_response_json() {
        let json = HostError::NoPortAvailable { min: 3001, max: 3002 }
            .to_response()
            .to_json();

        assert!(json.contains("\"code\":\"NO_PORT_AVAILABLE\""));
        assert!(json.contains("\"error\":\"no port available in range 3001-3002\""));
        assert!(json.contains("\"status\":503"));
        assert!(json.contains("\"success\":false"));
    }

    #[test]
    fn test_header_values_match_serde() {
        let value = serde_json::to_value(ErrorCode::AcquisitionFailure).unwrap();
        assert_eq!(value, ErrorCode::AcquisitionFailure.as_str());
    }
}
