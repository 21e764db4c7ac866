//! Error types for nosqlgate
//!
//! Every error maps to a stable MongoDB error code so the client gets a
//! structured `{ok: 0, code, codeName, errmsg}` reply. Only protocol and IO
//! errors end the connection.

use crate::storage::BackendError;
use thiserror::Error;

/// The main error type for gateway operations
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Codec Errors
    // ==========================================================================
    #[error("Malformed document: {message}")]
    Codec { message: String },

    #[error("Document nesting exceeds the maximum depth of {max}")]
    DepthExceeded { max: usize },

    #[error("Document of {size} bytes exceeds the maximum of {max} bytes")]
    DocumentTooLarge { size: usize, max: usize },

    // ==========================================================================
    // Translation Errors
    // ==========================================================================
    #[error("{message}")]
    Translation { message: String },

    // ==========================================================================
    // Command Errors
    // ==========================================================================
    #[error("{message}")]
    BadCommand { message: String },

    #[error("Invalid namespace '{name}': {reason}")]
    InvalidNamespace { name: String, reason: String },

    #[error("Performing an update on the path '_id' would modify the immutable field '_id'")]
    ImmutableField,

    #[error("cursor id {id} not found")]
    CursorNotFound { id: i64 },

    #[error("operation exceeded time limit")]
    Timeout,

    // ==========================================================================
    // Backend Errors
    // ==========================================================================
    #[error("E11000 duplicate key error collection: {namespace} dup key: {{ _id: {key} }}")]
    DuplicateKey { namespace: String, key: String },

    #[error("Backend failure: {0}")]
    Backend(#[from] BackendError),

    // ==========================================================================
    // Unsupported
    // ==========================================================================
    #[error("Command '{command}' is not supported")]
    NotSupported { command: String },

    #[error("no such command: '{command}'")]
    CommandNotFound { command: String },

    // ==========================================================================
    // Protocol Errors (fatal to the connection)
    // ==========================================================================
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connection IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Codec,
    Translation,
    Backend,
    Protocol,
    NotSupported,
}

impl Error {
    pub fn codec(message: impl Into<String>) -> Self {
        Error::Codec { message: message.into() }
    }

    pub fn bad_command(message: impl Into<String>) -> Self {
        Error::BadCommand { message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol { message: message.into() }
    }

    /// The taxonomy bucket this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Codec { .. } | Error::DepthExceeded { .. } | Error::DocumentTooLarge { .. } => {
                ErrorKind::Codec
            }
            Error::Translation { .. }
            | Error::BadCommand { .. }
            | Error::InvalidNamespace { .. }
            | Error::ImmutableField
            | Error::CursorNotFound { .. } => ErrorKind::Translation,
            Error::Backend(_) | Error::DuplicateKey { .. } | Error::Timeout => ErrorKind::Backend,
            Error::NotSupported { .. } | Error::CommandNotFound { .. } => ErrorKind::NotSupported,
            Error::Protocol { .. } | Error::Io(_) => ErrorKind::Protocol,
        }
    }

    /// Stable MongoDB error code
    pub fn code(&self) -> i32 {
        match self {
            Error::Codec { .. } | Error::DepthExceeded { .. } => 22,
            Error::DocumentTooLarge { .. } => 10334,
            Error::Translation { .. } => 2,
            Error::BadCommand { .. } => 9,
            Error::InvalidNamespace { .. } => 73,
            Error::ImmutableField => 66,
            Error::CursorNotFound { .. } => 43,
            Error::Timeout => 50,
            Error::DuplicateKey { .. } => 11000,
            Error::Backend(_) => 1,
            Error::NotSupported { .. } => 115,
            Error::CommandNotFound { .. } => 59,
            Error::Protocol { .. } | Error::Io(_) => 17,
        }
    }

    /// Name paired with [`Error::code`]
    pub fn code_name(&self) -> &'static str {
        match self.code() {
            22 => "InvalidBSON",
            10334 => "BSONObjectTooLarge",
            2 => "BadValue",
            9 => "FailedToParse",
            73 => "InvalidNamespace",
            66 => "ImmutableField",
            43 => "CursorNotFound",
            50 => "MaxTimeMSExpired",
            11000 => "DuplicateKey",
            115 => "CommandNotSupported",
            59 => "CommandNotFound",
            17 => "ProtocolError",
            _ => "InternalError",
        }
    }

    /// Returns true if the connection must be closed after this error
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

// =============================================================================
// Conversions from external error types
// =============================================================================

impl From<mql::ParseError> for Error {
    fn from(err: mql::ParseError) -> Self {
        Error::Translation {
            message: err.to_string(),
        }
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        Error::codec(err.to_string())
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        Error::codec(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::codec(format!("invalid JSON payload: {}", err))
    }
}

impl From<crate::validation::ValidationError> for Error {
    fn from(err: crate::validation::ValidationError) -> Self {
        use crate::validation::ValidationError;
        match err {
            ValidationError::InvalidIdentifier(name, reason) => Error::InvalidNamespace {
                name,
                reason: reason.to_string(),
            },
            ValidationError::TooLong(name, max) => Error::InvalidNamespace {
                name,
                reason: format!("exceeds maximum length of {}", max),
            },
            ValidationError::Empty => Error::InvalidNamespace {
                name: String::new(),
                reason: "cannot be empty".to_string(),
            },
            ValidationError::Reserved(name) => Error::InvalidNamespace {
                name,
                reason: "reserved name".to_string(),
            },
        }
    }
}
