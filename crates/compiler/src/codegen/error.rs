//! Emitter error type
//!
//! The emitter does not surface user errors; by the time it runs, semantic
//! analysis and CFG construction have validated the program. A `Logic` error
//! here is an internal invariant violation and aborts compilation with a
//! diagnostic.

/// Error type for IL generation.
///
/// Allows proper error propagation with `?` for both invariant violations
/// and formatting errors (write failures into the output buffer).
#[derive(Debug)]
pub enum CodeGenError {
    /// An internal invariant violation (missing block, dangling symbol, ...)
    Logic(String),
    /// A formatting error while writing IL text
    Format(std::fmt::Error),
}

impl std::fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeGenError::Logic(s) => write!(f, "{}", s),
            CodeGenError::Format(e) => write!(f, "IL generation error: {}", e),
        }
    }
}

impl std::error::Error for CodeGenError {}

impl From<String> for CodeGenError {
    fn from(s: String) -> Self {
        CodeGenError::Logic(s)
    }
}

impl From<std::fmt::Error> for CodeGenError {
    fn from(e: std::fmt::Error) -> Self {
        CodeGenError::Format(e)
    }
}
