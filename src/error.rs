//! Render-core error type

use thiserror::Error;

use crate::backend::{BackendError, FramebufferStatus, UniformKind};

/// How an error is handled by the frame loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Programmer error: logged, then the process exits non-zero.
    Fatal,
    /// Missing uniform, unknown resource, bad attribute: logged and skipped.
    Recoverable,
    /// Bad command payload or missing asset file: logged and skipped.
    External,
    /// Cleared by the next successful attempt.
    Transient,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Framebuffer '{key}' is incomplete: {status:?}")]
    FramebufferIncomplete {
        key: String,
        status: FramebufferStatus,
    },
    #[error("Render targets must be the same size: {0}")]
    RenderTargetSizeMismatch(String),
    #[error("Failed to link program '{0}'")]
    ProgramLink(String),
    #[error("Uniform '{name}' of '{material}' expects {expected:?}")]
    UniformTypeMismatch {
        material: String,
        name: String,
        expected: UniformKind,
    },
    #[error("Unknown render mode: {0}")]
    UnknownRenderMode(String),
    #[error("Invalid resolution {0}x{1}")]
    InvalidResolution(u32, u32),
    #[error("Instance attribute '{name}' is {size} bytes, not a multiple of 16")]
    InstanceLayout { name: String, size: u64 },
    #[error("Missing resource: {0}")]
    MissingResource(String),
    #[error("Invalid value for attribute '{attribute}': {message}")]
    InvalidAttribute { attribute: String, message: String },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid material file '{path}': {message}")]
    MaterialFile { path: String, message: String },
    #[error("Invalid texture file '{path}': {message}")]
    TextureFile { path: String, message: String },
    #[error("Malformed command: {0}")]
    Command(String),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Window error: {0}")]
    Window(String),
}

impl RenderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RenderError::Backend(BackendError::ProgramLinkFailed { .. }) => ErrorKind::Transient,
            RenderError::Backend(BackendError::UniformTypeMismatch { .. }) => ErrorKind::Fatal,
            RenderError::Backend(BackendError::InvalidHandle(_)) => ErrorKind::Recoverable,
            RenderError::Backend(_) => ErrorKind::Fatal,
            RenderError::FramebufferIncomplete { .. }
            | RenderError::RenderTargetSizeMismatch(_)
            | RenderError::UniformTypeMismatch { .. }
            | RenderError::UnknownRenderMode(_)
            | RenderError::InstanceLayout { .. }
            | RenderError::Window(_) => ErrorKind::Fatal,
            RenderError::ProgramLink(_) => ErrorKind::Transient,
            RenderError::InvalidResolution(..)
            | RenderError::MissingResource(_)
            | RenderError::InvalidAttribute { .. } => ErrorKind::Recoverable,
            RenderError::Config(_)
            | RenderError::Io(_)
            | RenderError::MaterialFile { .. }
            | RenderError::TextureFile { .. }
            | RenderError::Command(_)
            | RenderError::Json(_) => ErrorKind::External,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Log a non-fatal error with context and drop it; fatal errors pass through.
pub fn log_recoverable<T>(context: &str, result: RenderResult<T>) -> RenderResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if !error.is_fatal() => {
            log::warn!("{}: {}", context, error);
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let incomplete = RenderError::FramebufferIncomplete {
            key: "hdr".into(),
            status: FramebufferStatus::IncompleteDimensions,
        };
        assert_eq!(incomplete.kind(), ErrorKind::Fatal);
        assert_eq!(
            RenderError::MissingResource("sphere".into()).kind(),
            ErrorKind::Recoverable
        );
        assert_eq!(RenderError::Command("eof".into()).kind(), ErrorKind::External);
        let link: RenderError = BackendError::ProgramLinkFailed {
            name: "ssao".into(),
            message: "syntax".into(),
        }
        .into();
        assert_eq!(link.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_log_recoverable_passes_fatal_through() {
        let ok: RenderResult<Option<i32>> =
            log_recoverable("test", Err(RenderError::MissingResource("x".into())));
        assert!(matches!(ok, Ok(None)));
        let fatal: RenderResult<Option<i32>> =
            log_recoverable("test", Err(RenderError::UnknownRenderMode("x".into())));
        assert!(fatal.is_err());
    }
}
