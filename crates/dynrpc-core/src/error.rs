//! Error types for the marshalling engine.
//!
//! Every failure that happens before, around, or instead of the native call is
//! reported here. A non-zero status returned by the native function itself is
//! not an error: it travels on the wire as `{"e": code}`.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for descriptor loading and call marshalling.
#[derive(Debug, Error)]
pub enum DynRpcError {
    // Transport/parse errors
    #[error("Malformed {what}: {message}")]
    Parse {
        what: &'static str,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Reply for '{signature}' has no result entry")]
    MissingResult { signature: String },

    // Resolution errors
    #[error("Cannot find method with signature '{signature}'")]
    MethodNotFound { signature: String },

    #[error("Method '{signature}' returns '{found}'; only native int status returns are supported")]
    UnsupportedReturnType { signature: String, found: String },

    #[error("Service has no function at index {index} (table holds {len})")]
    MissingFunction { index: usize, len: usize },

    // Marshalling errors
    #[error("Cannot marshal argument {index} of '{signature}': {message}")]
    Argument {
        signature: String,
        index: usize,
        message: String,
    },

    #[error("Cannot marshal value of type '{descriptor}': {message}")]
    Codec { descriptor: String, message: String },

    #[error("Native allocation of {size} bytes failed")]
    Allocation { size: usize },

    // Descriptor errors
    #[error("Invalid descriptor at line {line}: {message}")]
    Descriptor { line: usize, message: String },

    #[error("Invalid type descriptor '{descriptor}': {message}")]
    TypeDescriptor { descriptor: String, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for marshalling operations.
pub type Result<T> = std::result::Result<T, DynRpcError>;

/// Broad failure category, used by callers to tell "could not reach the
/// method" apart from "the method could not be marshalled".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request or reply text, missing envelope fields.
    Transport,
    /// Unknown signature, unsupported return type, missing function pointer.
    Resolution,
    /// Argument or result (de)serialization failure.
    Marshalling,
    /// Interface or type descriptor rejected at load time.
    Descriptor,
    Io,
}

impl From<std::io::Error> for DynRpcError {
    fn from(err: std::io::Error) -> Self {
        DynRpcError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl DynRpcError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        DynRpcError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Wrap a JSON parse failure of a request or reply text.
    pub(crate) fn parse(what: &'static str, err: serde_json::Error) -> Self {
        DynRpcError::Parse {
            what,
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// A request or reply that is valid JSON but not a valid envelope.
    pub(crate) fn malformed(what: &'static str, message: impl Into<String>) -> Self {
        DynRpcError::Parse {
            what,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn codec(descriptor: impl Into<String>, message: impl Into<String>) -> Self {
        DynRpcError::Codec {
            descriptor: descriptor.into(),
            message: message.into(),
        }
    }

    pub(crate) fn type_descriptor(descriptor: impl Into<String>, message: impl Into<String>) -> Self {
        DynRpcError::TypeDescriptor {
            descriptor: descriptor.into(),
            message: message.into(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DynRpcError::Parse { .. } | DynRpcError::MissingResult { .. } => ErrorKind::Transport,

            DynRpcError::MethodNotFound { .. }
            | DynRpcError::UnsupportedReturnType { .. }
            | DynRpcError::MissingFunction { .. } => ErrorKind::Resolution,

            DynRpcError::Argument { .. }
            | DynRpcError::Codec { .. }
            | DynRpcError::Allocation { .. } => ErrorKind::Marshalling,

            DynRpcError::Descriptor { .. } | DynRpcError::TypeDescriptor { .. } => {
                ErrorKind::Descriptor
            }

            DynRpcError::Io { .. } => ErrorKind::Io,
        }
    }
}
