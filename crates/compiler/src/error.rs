//! Compilation errors
//!
//! One taxonomy for the whole pipeline. Front-end and CFG errors carry the
//! source line they were raised at; diagnostics are rendered to stderr by the
//! CLI with that location.

use thiserror::Error;

use crate::cfg::CfgError;
use crate::codegen::CodeGenError;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("line {line}: syntax error: {message}")]
    Syntax { line: u32, message: String },

    #[error("line {line}: {message}")]
    Semantic { line: u32, message: String },

    #[error(transparent)]
    Cfg(#[from] CfgError),

    #[error("internal error: {0}")]
    CodeGen(#[from] CodeGenError),

    #[error("{0}")]
    Io(String),

    #[error("backend failed: {0}")]
    Backend(String),
}

impl CompileError {
    pub fn syntax(line: u32, message: impl Into<String>) -> Self {
        CompileError::Syntax {
            line,
            message: message.into(),
        }
    }

    pub fn semantic(line: u32, message: impl Into<String>) -> Self {
        CompileError::Semantic {
            line,
            message: message.into(),
        }
    }
}
