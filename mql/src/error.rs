//! Error types for MQL parsing

use std::fmt;

/// Error that occurred while parsing a filter, update, projection or sort
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    /// Field path the error was found under, if any
    pub path: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn unknown_operator(op: &str) -> Self {
        Self::new(format!("unknown operator: {}", op))
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(path) = &self.path {
            write!(f, " (at '{}')", path)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

impl From<nom::Err<nom::error::Error<&str>>> for ParseError {
    fn from(err: nom::Err<nom::error::Error<&str>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => ParseError::new("incomplete field path"),
            nom::Err::Error(e) | nom::Err::Failure(e) => ParseError::new(format!(
                "invalid field path near: {:?}",
                e.input.chars().take(20).collect::<String>()
            )),
        }
    }
}
