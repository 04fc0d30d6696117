//! Error taxonomy for sandbox operations
//!
//! Substrate faults are errors; a program that compiles wrong or crashes is
//! not - that comes back as a `CommandResult` with a non-zero exit code.

/// Errors raised by backends, the registry, and the session supervisor
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
}

impl SandboxError {
    pub fn backend(msg: impl Into<String>) -> Self {
        SandboxError::Backend(msg.into())
    }

    pub fn not_available(key: impl Into<String>) -> Self {
        SandboxError::BackendNotAvailable(key.into())
    }
}
