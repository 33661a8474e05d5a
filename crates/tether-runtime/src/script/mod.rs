//! Script engine seam
//!
//! A small object model standing in for the embedding script engine:
//! values, objects with prototypes and accessors, host functions and the
//! per-object wrapper slot. Identity is `Rc` identity.

mod object;
mod value;

pub use object::{NativeFunction, ObjectBuilder, ObjectRef, Property, ScriptObject};
pub use value::ScriptValue;

use thiserror::Error;

use crate::error::BridgeError;

/// A thrown script error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("Error: {0}")]
    Error(String),

    #[error("TypeError: {0}")]
    TypeError(String),

    #[error("RangeError: {0}")]
    RangeError(String),

    /// Error reported by native code; carries the native description
    #[error("NativeError: {0}")]
    Native(String),
}

impl ScriptError {
    pub fn type_error(message: impl Into<String>) -> Self {
        ScriptError::TypeError(message.into())
    }

    /// Message without the error name
    pub fn message(&self) -> &str {
        match self {
            ScriptError::Error(m)
            | ScriptError::TypeError(m)
            | ScriptError::RangeError(m)
            | ScriptError::Native(m) => m,
        }
    }
}

impl From<BridgeError> for ScriptError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::NativeError(description) => ScriptError::Native(description),
            e @ (BridgeError::ArgumentCount { .. }
            | BridgeError::TypeMismatch { .. }
            | BridgeError::UnsupportedEncoding(_)
            | BridgeError::InvalidReceiver(_)) => ScriptError::TypeError(e.to_string()),
            e => ScriptError::Error(e.to_string()),
        }
    }
}

/// Result type for script-visible operations
pub type ScriptResult<T> = Result<T, ScriptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_conversion() {
        let error: ScriptError = BridgeError::NativeError("The file is missing".into()).into();
        assert_eq!(error, ScriptError::Native("The file is missing".into()));
        assert_eq!(error.message(), "The file is missing");

        let error: ScriptError = BridgeError::ArgumentCount {
            expected: 1,
            actual: 0,
        }
        .into();
        assert!(matches!(error, ScriptError::TypeError(_)));
        assert!(error.to_string().starts_with("TypeError: "));
    }
}
