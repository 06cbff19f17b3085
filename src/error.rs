//! Error types for the registry
//!
//! Every rejected write surfaces one of these variants. The taxonomy
//! variants carry the literal, stable message callers pattern-match on,
//! so their `Display` is the message itself with no prefix.

use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Missing required attribute, wrong type, bad enum value, unknown extension
    #[error("{0}")]
    SchemaViolation(String),

    /// ID mismatch on write or case-insensitive duplicate on create
    #[error("{0}")]
    IdentityConflict(String),

    /// Client-supplied epoch doesn't match the stored one
    #[error("{0}")]
    ConcurrencyConflict(String),

    #[error("{0}")]
    NotFound(String),

    /// xref vs versions, content channels, default-version targets
    #[error("{0}")]
    StructuralConflict(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    #[error("{0}")]
    ReadOnlyViolation(String),

    /// Malformed request options, paths or model documents
    #[error("{0}")]
    BadRequest(String),

    #[error("Error fetching \"{url}\": {reason}")]
    Fetch { url: String, reason: String },

    #[error("Database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers that branch on the kind of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SchemaViolation,
    IdentityConflict,
    ConcurrencyConflict,
    NotFound,
    StructuralConflict,
    MethodNotAllowed,
    ReadOnlyViolation,
    BadRequest,
    Upstream,
    Internal,
}

impl RegistryError {
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaViolation(msg.into())
    }

    pub fn identity(msg: impl Into<String>) -> Self {
        Self::IdentityConflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn structural(msg: impl Into<String>) -> Self {
        Self::StructuralConflict(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// `Attribute "epoch"(<got>) doesn't match existing value (<current>)`
    pub fn epoch_mismatch(got: &serde_json::Value, current: u64) -> Self {
        Self::ConcurrencyConflict(format!(
            "Attribute \"epoch\"({}) doesn't match existing value ({})",
            crate::validate::display_value(got),
            current
        ))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaViolation(_) => ErrorKind::SchemaViolation,
            Self::IdentityConflict(_) => ErrorKind::IdentityConflict,
            Self::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::StructuralConflict(_) => ErrorKind::StructuralConflict,
            Self::MethodNotAllowed(_) => ErrorKind::MethodNotAllowed,
            Self::ReadOnlyViolation(_) => ErrorKind::ReadOnlyViolation,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Fetch { .. } => ErrorKind::Upstream,
            Self::Persistence(_) | Self::Json(_) | Self::Config(_) | Self::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// HTTP status the excluded transport layer should answer with
    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::SchemaViolation
            | ErrorKind::IdentityConflict
            | ErrorKind::StructuralConflict
            | ErrorKind::BadRequest => 400,
            ErrorKind::ConcurrencyConflict => 409,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotAllowed | ErrorKind::ReadOnlyViolation => 405,
            ErrorKind::Upstream => 502,
            ErrorKind::Internal => 500,
        }
    }
}
