//! Session supervisor - scoped sandbox lifecycle
//!
//! A session binds one backend instance and one sandbox environment to a
//! caller for the duration of a scope: acquire backend, create, start, run,
//! collect artifacts, then tear down on every exit path. Teardown failures
//! are logged and swallowed so they never mask an in-flight error.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::archive;
use crate::backend::{registry, Backend, BackendKind, ExecOptions, SandboxHandle, SANDBOX_WORKDIR};
use crate::data::{
    ArtifactHandle, ArtifactRequest, CommandResult, ExecutionRequest, ExecutionResult, FileType,
};
use crate::errors::SandboxError;
use crate::lang::SupportedLanguage;
use crate::BoxFuture;

/// Host directory staged artifacts land in
pub const DEFAULT_OUTPUT_DIR: &str = "./output";

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Fresh,
    Provisioning,
    Ready,
    Running,
    Done,
    Failed,
    Destroyed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Fresh => "fresh",
            SessionState::Provisioning => "provisioning",
            SessionState::Ready => "ready",
            SessionState::Running => "running",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
            SessionState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// One scoped use of a sandbox
///
/// Owns exactly one [`SandboxHandle`], which never escapes. Prefer
/// [`Session::scope`], which guarantees teardown on every exit path;
/// `open`/`close` are for callers that manage the scope themselves.
pub struct Session {
    backend: Box<dyn Backend>,
    handle: Option<SandboxHandle>,
    language: SupportedLanguage,
    state: SessionState,
    output_dir: PathBuf,
    created_at: DateTime<Utc>,
}

impl Session {
    /// Acquire a backend from the registry and provision a sandbox
    ///
    /// On create/start failure nothing leaks: whatever handle exists is
    /// destroyed before the error propagates.
    pub async fn open(
        backend_kind: BackendKind,
        language: SupportedLanguage,
    ) -> Result<Self, SandboxError> {
        let backend = registry::create(backend_kind.as_str()).await?;

        info!("creating sandbox for language={language} backend={backend_kind}");
        let handle = backend.create(language).await?;

        if let Err(e) = backend.start(&handle).await {
            error!("sandbox failed to start: {e}");
            if let Err(de) = backend.destroy(&handle).await {
                error!("teardown after failed start also failed: {de}");
            }
            return Err(e);
        }

        Ok(Self {
            backend,
            handle: Some(handle),
            language,
            state: SessionState::Ready,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            created_at: Utc::now(),
        })
    }

    /// Run `f` against a fresh session, tearing the sandbox down afterwards
    /// no matter how `f` exits
    pub async fn scope<T, F>(
        backend_kind: BackendKind,
        language: SupportedLanguage,
        f: F,
    ) -> Result<T, SandboxError>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, Result<T, SandboxError>>,
    {
        let mut session = Session::open(backend_kind, language).await?;
        let result = f(&mut session).await;
        session.close().await;
        result
    }

    pub fn language(&self) -> SupportedLanguage {
        self.language
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Redirect artifact staging away from [`DEFAULT_OUTPUT_DIR`]
    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) {
        self.output_dir = dir.into();
    }

    /// Run a single command in the sandbox
    pub async fn exec(&mut self, argv: &[String]) -> Result<CommandResult, SandboxError> {
        let handle = self.live_handle()?.clone();
        self.state = SessionState::Running;
        let result = self
            .backend
            .exec(&handle, argv, ExecOptions::default())
            .await;
        self.settle(&result);
        result
    }

    /// Execute `code` in the sandbox; plain mode, no artifact collection
    pub async fn run_code(
        &mut self,
        code: &str,
        dependencies: Option<Vec<String>>,
    ) -> Result<CommandResult, SandboxError> {
        let mut request = ExecutionRequest::new(code, self.language);
        if let Some(deps) = dependencies {
            request = request.with_dependencies(deps);
        }
        let handle = self.live_handle()?.clone();
        self.state = SessionState::Running;
        let result = self.backend.run_code(&handle, &request).await;
        self.settle(&result);
        result
    }

    /// Execute `code` and stage the requested artifacts to the host
    ///
    /// The result lists only artifacts that were actually retrieved;
    /// requested paths the code never produced are logged and omitted.
    pub async fn run_code_with_artifacts(
        &mut self,
        code: &str,
        dependencies: Option<Vec<String>>,
        artifact_paths: &[String],
    ) -> Result<ExecutionResult, SandboxError> {
        let output = self.run_code(code, dependencies).await?;

        let handle = self.live_handle()?.clone();
        let mut artifacts = Vec::new();
        for requested in artifact_paths {
            let sandbox_path = normalise_artifact_path(requested);
            match self.fetch_artifact(&handle, &sandbox_path).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!("artifact {requested} not retrieved: {e}"),
            }
        }

        Ok(ExecutionResult { output, artifacts })
    }

    /// Run a full artifact request produced by an adapter
    ///
    /// The request's language must match the language this session was
    /// provisioned for.
    pub async fn run(&mut self, req: &ArtifactRequest) -> Result<ExecutionResult, SandboxError> {
        if req.request.language != self.language {
            return Err(SandboxError::backend(format!(
                "session provisioned for {} cannot run {} code",
                self.language, req.request.language
            )));
        }
        self.run_code_with_artifacts(
            &req.request.code,
            req.request.dependencies.clone(),
            &req.artifact_paths,
        )
        .await
    }

    /// Copy a host file into the sandbox at `sandbox_path`
    pub async fn put_file(
        &mut self,
        host_path: impl AsRef<std::path::Path>,
        sandbox_path: &str,
    ) -> Result<(), SandboxError> {
        let handle = self.live_handle()?.clone();
        self.backend
            .put(&handle, host_path.as_ref(), sandbox_path)
            .await
    }

    /// Tear the sandbox down; errors are logged, never raised
    pub async fn close(mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("destroying sandbox {}", handle.id());
            if let Err(e) = self.backend.destroy(&handle).await {
                error!("failed to destroy sandbox {}: {e}", handle.id());
            }
        }
        self.state = SessionState::Destroyed;
    }

    fn settle<T>(&mut self, result: &Result<T, SandboxError>) {
        self.state = if result.is_ok() {
            SessionState::Done
        } else {
            SessionState::Failed
        };
    }

    async fn fetch_artifact(
        &self,
        handle: &SandboxHandle,
        sandbox_path: &str,
    ) -> Result<ArtifactHandle, SandboxError> {
        let (archive_bytes, stat) = self.backend.get(handle, sandbox_path).await?;
        let (name, contents) = archive::unpack_first(&archive_bytes)
            .map_err(|e| SandboxError::backend(format!("unpack {sandbox_path}: {e}")))?;
        let host_path = archive::stage(&self.output_dir, &name, &contents)
            .map_err(|e| SandboxError::backend(format!("stage {name}: {e}")))?;
        info!(
            "staged artifact {} ({} bytes)",
            host_path.display(),
            stat.size
        );
        Ok(ArtifactHandle {
            host_path,
            size: contents.len() as u64,
            file_type: FileType::from_path(&name),
            logical_name: name,
        })
    }

    fn live_handle(&self) -> Result<&SandboxHandle, SandboxError> {
        self.handle
            .as_ref()
            .ok_or_else(|| SandboxError::backend("session already destroyed"))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            warn!(
                "session dropped without close(); sandbox {} may leak",
                handle.id()
            );
        }
    }
}

/// Resolve a requested artifact path to an absolute sandbox path
fn normalise_artifact_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{SANDBOX_WORKDIR}/{path}")
    }
}
