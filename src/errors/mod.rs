//! Error taxonomy for the shim
//!
//! Every fallible operation returns [`Result`]. Errors that originate inside
//! the interpreter carry the text it printed for the pending exception.

use std::fmt;

/// Container kinds the shim allocates on the foreign side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Tuple,
    List,
    Dict,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tuple => write!(f, "tuple"),
            Self::List => write!(f, "list"),
            Self::Dict => write!(f, "dict"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to import module '{module}': {message}")]
    Import { module: String, message: String },

    #[error("unsupported type for conversion: {type_name}")]
    UnsupportedType { type_name: String },

    #[error("could not allocate foreign {kind}")]
    NullContainer { kind: ContainerKind },

    #[error("failed to insert element {index} into foreign container")]
    ElementInsertion { index: usize },

    #[error("failed to save attribute '{name}': {message}")]
    AttributeSave { name: String, message: String },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("invalid string: {0}")]
    InvalidString(String),

    /// Exception raised inside the interpreter, formatted as it would print it
    #[error("python raised: {0}")]
    Exception(String),

    #[error("an interpreter handle is already open on this thread")]
    HandleActive,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn unsupported(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }

    /// Text reported by the interpreter, if this error came from it
    pub fn foreign_message(&self) -> Option<&str> {
        match self {
            Self::Import { message, .. } | Self::AttributeSave { message, .. } => Some(message),
            Self::Exception(message) => Some(message),
            _ => None,
        }
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(err: std::ffi::NulError) -> Self {
        Self::InvalidString(format!("interior NUL byte at {}", err.nul_position()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
