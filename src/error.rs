//! Error, warning and internal-error types shared across the pipeline.
//!
//! Every stage returns `Result<T, CompileError>`. `Diagnostic` and `Ice`
//! abort processing of the current translation unit; `Warning`s are
//! collected on the side and never stop the pipeline.

use std::fmt;

use crate::token::SourcePos;

/// A single user-visible diagnostic, tied to a source position.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{pos}: {message}")]
pub struct Diagnostic {
    pub pos: SourcePos,
    pub message: String,
}

impl Diagnostic {
    pub fn new(pos: SourcePos, message: impl Into<String>) -> Self {
        Diagnostic {
            pos,
            message: message.into(),
        }
    }
}

/// A recoverable anomaly: reported, but does not stop compilation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{pos}: warning: {message}")]
pub struct Warning {
    pub pos: SourcePos,
    pub message: String,
}

impl Warning {
    pub fn new(pos: SourcePos, message: impl Into<String>) -> Self {
        Warning {
            pos,
            message: message.into(),
        }
    }
}

/// Top-level error type for the compiler.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// Bad source: syntax error, undefined reference, type error, ...
    #[error(transparent)]
    Diagnostic(#[from] Diagnostic),

    /// An invariant the compiler itself must maintain was violated.
    /// Reported with the *compiler's* file/line, not the user's source.
    #[error("internal compiler error at {site}: {message}")]
    Ice { site: &'static str, message: String },

    /// A language feature that is recognized but not implemented.
    #[error("not implemented at {site}: {feature}")]
    NotImplemented {
        site: &'static str,
        feature: String,
    },

    #[error("{0}")]
    Io(String),
}

impl CompileError {
    pub fn diag(pos: SourcePos, message: impl Into<String>) -> Self {
        CompileError::Diagnostic(Diagnostic::new(pos, message))
    }
}

/// Raise an internal compiler error, recording the call site.
#[macro_export]
macro_rules! ice {
    ($($arg:tt)*) => {
        return Err($crate::error::CompileError::Ice {
            site: concat!(file!(), ":", line!()),
            message: format!($($arg)*),
        })
    };
}

/// Raise a "not implemented" error, recording the call site.
#[macro_export]
macro_rules! notimp {
    ($($arg:tt)*) => {
        return Err($crate::error::CompileError::NotImplemented {
            site: concat!(file!(), ":", line!()),
            feature: format!($($arg)*),
        })
    };
}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::Io(e.to_string())
    }
}

/// Accumulates warnings produced while compiling one translation unit.
#[derive(Debug, Default)]
pub struct WarningSink {
    warnings: Vec<Warning>,
}

impl WarningSink {
    pub fn new() -> Self {
        WarningSink::default()
    }

    pub fn push(&mut self, w: Warning) {
        tracing::warn!(pos = %w.pos, "{}", w.message);
        self.warnings.push(w);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl fmt::Display for WarningSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for w in &self.warnings {
            writeln!(f, "{}", w)?;
        }
        Ok(())
    }
}
