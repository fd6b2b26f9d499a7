//! # Error Handling
//!
//! Crate-wide error type for the meshroot certificate lifecycle subsystem.
//! Every fallible operation returns [`Result`], built on `thiserror`.

/// Custom result type for meshroot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for meshroot
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration, including issuer configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input or configuration failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A certificate backend failed; tagged with the issuer that produced it
    #[error("Issuer '{issuer_id}' failed: {source}")]
    Issuer {
        issuer_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Raw failure reported by a certificate provider backend
    #[error("{0}")]
    Backend(String),

    /// Resource not found
    #[error("{resource_type} '{id}' not found")]
    NotFound { resource_type: String, id: String },

    /// Optimistic-concurrency conflict on a shared resource
    #[error("Conflict updating {resource_type} '{name}': the object has been modified")]
    Conflict { resource_type: String, name: String },

    /// Operation did not complete in time
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend(message.into())
    }

    /// Tag an error with the ID of the issuer that produced it
    pub fn issuer<S: Into<String>>(issuer_id: S, source: Error) -> Self {
        Self::Issuer { issuer_id: issuer_id.into(), source: Box::new(source) }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a conflict error
    pub fn conflict<R: Into<String>, N: Into<String>>(resource_type: R, name: N) -> Self {
        Self::Conflict { resource_type: resource_type.into(), name: name.into() }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error is an optimistic-concurrency conflict that should be retried
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Issuer { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Whether this error is transient
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Conflict { .. } | Error::Timeout { .. } | Error::Io(_) => true,
            Error::Issuer { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error reports a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Self::Config(format!("Configuration loading failed: {}", error))
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}
