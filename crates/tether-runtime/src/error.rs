//! Runtime errors
//!
//! [`BridgeError`] covers recoverable call-time failures. At the per-call
//! boundary it becomes a [`ScriptError`](crate::script::ScriptError), which
//! script code can catch.

use thiserror::Error;

use tether_meta::TypeKind;

/// Errors that can occur while loading libraries and resolving symbols
#[derive(Debug, Error)]
pub enum LoadError {
    /// Library file not found or could not be loaded
    #[error("Library not found: {path}")]
    NotFound {
        /// Path that was attempted
        path: String,
    },

    /// Symbol not found in any loaded image
    #[error("Symbol not found: {symbol} in {library}")]
    SymbolNotFound {
        /// Symbol name that was not found
        symbol: String,
        /// Library path
        library: String,
    },

    /// Platform-specific error
    #[error("Platform error: {0}")]
    PlatformError(String),

    /// Invalid path encoding
    #[error("Invalid UTF-8 in path: {0}")]
    InvalidPath(String),
}

/// Call-time errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Wrong number of script arguments
    #[error("Actual arguments count: \"{actual}\". Expected: \"{expected}\".")]
    ArgumentCount { expected: usize, actual: usize },

    /// A script value cannot be converted to the native type
    #[error("Cannot marshal {value} as {kind:?}")]
    TypeMismatch { kind: TypeKind, value: String },

    /// The encoding has no native representation in this position
    #[error("Unsupported type encoding {0:?}")]
    UnsupportedEncoding(TypeKind),

    /// The native callee reported an error through its out-parameter
    #[error("{0}")]
    NativeError(String),

    /// No metadata for a name
    #[error("Unknown declaration '{0}'")]
    UnknownDeclaration(String),

    /// The receiver does not implement a selector
    #[error("Unrecognized selector '{selector}' sent to instance of {class}")]
    UnrecognizedSelector { selector: String, class: String },

    /// A wrapper was used after disposal
    #[error("Object has been disposed")]
    Disposed,

    /// The value has no wrapper of the required kind
    #[error("Expected {0}")]
    InvalidReceiver(&'static str),

    /// Native class could not be created
    #[error("Class creation failed: {0}")]
    ClassCreation(String),

    /// A native callback could not be prepared
    #[error("Cannot create native callback: {0}")]
    Callback(String),

    /// Symbol or library loading failed
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn mismatch(kind: TypeKind, value: impl std::fmt::Display) -> Self {
        BridgeError::TypeMismatch {
            kind,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let error = BridgeError::ArgumentCount {
            expected: 2,
            actual: 1,
        };
        assert_eq!(
            error.to_string(),
            "Actual arguments count: \"1\". Expected: \"2\"."
        );
        let error: BridgeError = LoadError::SymbolNotFound {
            symbol: "CGPointMake".into(),
            library: "<process>".into(),
        }
        .into();
        assert_eq!(error.to_string(), "Symbol not found: CGPointMake in <process>");
    }
}
