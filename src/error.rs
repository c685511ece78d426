//! Error types for parsing and rendering.

use std::path::PathBuf;

pub type ElSqlResult<T> = std::result::Result<T, ElSqlError>;

/// An error produced while parsing elsql resource text.
///
/// Carries the index of the resource within the layered input (zero-based)
/// and the one-based line number the parser was looking at.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error in resource {resource} at line {line}: {message}")]
pub struct ParseError {
    pub resource: usize,
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(resource: usize, line: usize, message: impl Into<String>) -> Self {
        ParseError {
            resource,
            line,
            message: message.into(),
        }
    }
}

/// Errors surfaced by bundle loading, parsing and rendering.
///
/// Nothing is retried and there are no partial results; every error is
/// fatal to the current parse or render call.
#[derive(Debug, thiserror::Error)]
pub enum ElSqlError {
    /// The mandatory base resource file could not be located.
    #[error("resource not found: {}", path.display())]
    ResourceNotFound { path: PathBuf },

    /// Reading a resource failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The resource text could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A fragment name was requested that no resource defines.
    #[error("unknown fragment name: {name}")]
    UnknownFragment { name: String },

    /// A directive referenced a parameter the source does not provide.
    #[error("missing parameter: {name}")]
    MissingVariable { name: String },

    /// A parameter was present but of an unusable type.
    #[error("parameter '{name}' is not {expected}")]
    TypeError { name: String, expected: &'static str },

    /// An `@INCLUDE` chain returned to a fragment already being rendered.
    #[error("cyclic include of fragment: {name}")]
    CyclicInclude { name: String },
}
