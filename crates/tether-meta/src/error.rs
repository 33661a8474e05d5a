//! Metadata build errors
//!
//! A [`CreationError`] describes why one declaration could not be turned into
//! a record. Soft errors drop the declaration; hard errors abort the build.
//! Errors chain: a declaration that depends on a failed one wraps the inner
//! error and renders as `outer --> inner`.

use thiserror::Error;

/// Identity of the declaration an error was raised for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarationInfo {
    pub name: String,
    pub js_name: String,
    pub module: String,
}

/// Failure to create a record from a declaration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.message_chain())]
pub struct CreationError {
    message: String,
    hard: bool,
    declaration: Option<DeclarationInfo>,
    cause: Option<Box<CreationError>>,
}

/// Result type for metadata creation
pub type CreationResult<T> = Result<T, CreationError>;

impl CreationError {
    /// A soft error: the declaration is skipped
    pub fn soft(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hard: false,
            declaration: None,
            cause: None,
        }
    }

    /// A hard error: the whole build fails
    pub fn hard(message: impl Into<String>) -> Self {
        Self {
            hard: true,
            ..Self::soft(message)
        }
    }

    /// Wrap `inner` with an outer message. Severity is inherited.
    pub fn chain(message: impl Into<String>, inner: CreationError) -> Self {
        Self {
            message: message.into(),
            hard: inner.hard,
            declaration: None,
            cause: Some(Box::new(inner)),
        }
    }

    /// Attach the originating declaration
    pub fn with_declaration(mut self, declaration: DeclarationInfo) -> Self {
        self.declaration = Some(declaration);
        self
    }

    pub fn is_hard(&self) -> bool {
        self.hard
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn declaration(&self) -> Option<&DeclarationInfo> {
        self.declaration.as_ref()
    }

    pub fn cause(&self) -> Option<&CreationError> {
        self.cause.as_deref()
    }

    /// `outer --> inner --> ...`
    pub fn message_chain(&self) -> String {
        match &self.cause {
            Some(inner) => format!("{} --> {}", self.message, inner.message_chain()),
            None => self.message.clone(),
        }
    }

    /// The chain prefixed with the declaration identity
    pub fn detailed_message(&self) -> String {
        match &self.declaration {
            Some(decl) => format!(
                "[Name: '{}', JsName: '{}', Module: '{}'] : {}",
                decl.name,
                decl.js_name,
                decl.module,
                self.message_chain()
            ),
            None => self.message_chain(),
        }
    }
}
