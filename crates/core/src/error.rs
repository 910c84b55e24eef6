//! API error taxonomy shared by the registry, REST handlers, HTTP surface and client.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FieldErrorKind {
    Required,
    Invalid,
    TooLong,
    NotSupported,
}

/// One field-level validation failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path, e.g. `metadata.labels[app]`.
    pub field: String,
    pub kind: FieldErrorKind,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub detail: String,
}

impl FieldError {
    pub fn required(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { field: field.into(), kind: FieldErrorKind::Required, value: String::new(), detail: detail.into() }
    }

    pub fn invalid(field: impl Into<String>, value: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { field: field.into(), kind: FieldErrorKind::Invalid, value: value.into(), detail: detail.into() }
    }

    pub fn too_long(field: impl Into<String>, value: impl Into<String>, max: usize) -> Self {
        Self { field: field.into(), kind: FieldErrorKind::TooLong, value: value.into(), detail: format!("must have at most {} characters", max) }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            FieldErrorKind::Required => "Required value",
            FieldErrorKind::Invalid => "Invalid value",
            FieldErrorKind::TooLong => "Too long",
            FieldErrorKind::NotSupported => "Unsupported value",
        };
        if self.value.is_empty() {
            write!(f, "{}: {}: {}", self.field, what, self.detail)
        } else {
            write!(f, "{}: {}: {:?}: {}", self.field, what, self.value, self.detail)
        }
    }
}

fn join_causes(causes: &[FieldError]) -> String {
    causes.iter().map(|c| c.to_string()).collect::<Vec<_>>().join("; ")
}

/// API errors, serializable so they can travel inside a `Status` body.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("operation cannot be fulfilled on {kind} {name:?}: {message}")]
    Conflict { kind: String, name: String, message: String },
    #[error("operation cannot be fulfilled on {kind} {name:?}: resourceVersion {expected} does not match current {actual}; re-read and retry")]
    VersionMismatch { kind: String, name: String, expected: String, actual: String },
    #[error("{kind} {name:?} is invalid: {}", join_causes(causes))]
    Invalid { kind: String, name: String, causes: Vec<FieldError> },
    #[error("invalid object type: expected {expected}, got {got:?}")]
    InvalidObjectType { expected: String, got: String },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("gone: {0}")]
    Gone(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::NotFound { kind: kind.to_string(), name: name.to_string() }
    }

    pub fn already_exists(kind: &str, name: &str) -> Self {
        Self::AlreadyExists { kind: kind.to_string(), name: name.to_string() }
    }

    pub fn conflict(kind: &str, name: &str, message: impl Into<String>) -> Self {
        Self::Conflict { kind: kind.to_string(), name: name.to_string(), message: message.into() }
    }

    pub fn invalid(kind: &str, name: &str, causes: Vec<FieldError>) -> Self {
        Self::Invalid { kind: kind.to_string(), name: name.to_string(), causes }
    }

    /// HTTP status code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } | Self::Conflict { .. } | Self::VersionMismatch { .. } => 409,
            Self::Invalid { .. } => 422,
            Self::InvalidObjectType { .. } | Self::BadRequest(_) => 400,
            Self::Gone(_) => 410,
            Self::Timeout(_) => 504,
            Self::Cancelled => 499,
            Self::Internal(_) => 500,
        }
    }

    /// Short machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::Conflict { .. } | Self::VersionMismatch { .. } => "Conflict",
            Self::Invalid { .. } => "Invalid",
            Self::InvalidObjectType { .. } | Self::BadRequest(_) => "BadRequest",
            Self::Gone(_) => "Gone",
            Self::Timeout(_) => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Internal(_) => "InternalError",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Error body returned by the HTTP surface and carried by watch `ERROR` frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Status {
    pub kind: String,
    pub code: u16,
    pub reason: String,
    pub message: String,
    pub error: ApiError,
}

impl From<ApiError> for Status {
    fn from(error: ApiError) -> Self {
        Self { kind: "Status".to_string(), code: error.code(), reason: error.reason().to_string(), message: error.to_string(), error }
    }
}
