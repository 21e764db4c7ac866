//! Input validation for nosqlgate
//!
//! Collection names become table names, so they are checked before any SQL
//! is built from them.

use thiserror::Error;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid identifier '{0}': {1}")]
    InvalidIdentifier(String, &'static str),

    #[error("Identifier '{0}' is too long (max {1} characters)")]
    TooLong(String, usize),

    #[error("Identifier cannot be empty")]
    Empty,

    #[error("Reserved name: '{0}'")]
    Reserved(String),
}

/// Maximum length for identifiers
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Prefixes owned by MongoDB or by the relational engine
const RESERVED_PREFIXES: &[&str] = &["system.", "sqlite_"];

/// Validate a collection name
///
/// Rules:
/// - Must be 1-255 characters
/// - Only alphanumeric, underscore, hyphen and dot allowed
/// - Cannot start with a dot or hyphen
/// - Cannot use a reserved prefix (case-insensitive)
pub fn validate_collection_name(name: &str) -> Result<(), ValidationError> {
    validate_identifier(name, true)
}

/// Validate a database name
///
/// Same rules as collection names, without dots
pub fn validate_database_name(name: &str) -> Result<(), ValidationError> {
    validate_identifier(name, false)
}

/// Core identifier validation
fn validate_identifier(name: &str, allow_dot: bool) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong(name.to_string(), MAX_IDENTIFIER_LENGTH));
    }

    for (i, c) in name.chars().enumerate() {
        let allowed = c.is_ascii_alphanumeric() || c == '_' || c == '-' || (allow_dot && c == '.');
        if !allowed {
            return Err(ValidationError::InvalidIdentifier(
                name.to_string(),
                "contains invalid characters",
            ));
        }
        if i == 0 && (c == '-' || c == '.') {
            return Err(ValidationError::InvalidIdentifier(
                name.to_string(),
                "cannot start with hyphen or dot",
            ));
        }
    }

    let lower = name.to_lowercase();
    if RESERVED_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Err(ValidationError::Reserved(name.to_string()));
    }

    Ok(())
}
