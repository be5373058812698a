//! Diagnostic reporting for the lowering library.
//!
//! Lowering errors are emitter bugs, not user-program bugs: a construct
//! with no marker, a combine function that was never finished, a reduce
//! over a type with no zero. The `Diagnostic` type keeps these readable
//! (message plus an optional hint) without dragging in source spans the
//! library never sees; the front-end owns source locations.

use std::error::Error;
use std::fmt;

#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Primary error message describing the issue
    pub message: String,
    /// Optional additional context or suggestion
    pub note: Option<String>,
}

impl Diagnostic {
    /// Creates a simple diagnostic with only an error message.
    pub fn simple(msg: impl Into<String>) -> Self {
        Diagnostic {
            message: msg.into(),
            note: None,
        }
    }

    /// Creates a diagnostic with an attached note.
    pub fn with_note(msg: impl Into<String>, note: impl Into<String>) -> Self {
        Diagnostic {
            message: msg.into(),
            note: Some(note.into()),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: {}", self.message)?;
        if let Some(note) = &self.note {
            write!(f, "\nnote: {}", note)?;
        }
        Ok(())
    }
}

impl Error for Diagnostic {}

impl From<inkwell::builder::BuilderError> for Diagnostic {
    fn from(err: inkwell::builder::BuilderError) -> Self {
        Diagnostic::simple(format!("IR builder error: {}", err))
    }
}

/// Result alias used across the construct and lowering code.
pub type LowerResult<T> = Result<T, Diagnostic>;
