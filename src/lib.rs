//! runbox - multi-language code-execution sandbox supervisor
//!
//! Accepts untrusted source plus declared dependencies, provisions an
//! isolated environment (Docker container or Kubernetes pod), materialises
//! and runs the code, captures streams and requested artifacts, and tears
//! the environment down deterministically.

use std::future::Future;
use std::pin::Pin;

pub mod archive;
pub mod backend;
pub mod data;
pub mod errors;
pub mod lang;
pub mod mcp;
pub mod session;
pub mod tools;

pub use backend::{Backend, BackendKind, ExecOptions, SandboxHandle};
pub use data::{
    ArtifactHandle, ArtifactRequest, CommandResult, ExecutionRequest, ExecutionResult, FileType,
};
pub use errors::SandboxError;
pub use lang::SupportedLanguage;
pub use session::{Session, SessionState};

/// Boxed future for dyn compatibility - registry constructors and
/// scoped-session closures return these
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
