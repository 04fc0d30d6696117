//! Backend abstraction over execution substrates
//!
//! Two backends:
//! - Docker: one container per session via the Docker Engine API
//! - K8s: one single-replica Deployment per session via the cluster API
//!
//! Both hide behind the same [`Backend`] contract; the supervisor never
//! learns which substrate it is driving.

mod docker;
mod k8s;
pub mod registry;

pub use docker::{DockerBackend, DockerConfig};
pub use k8s::{K8sBackend, K8sConfig};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::{CommandResult, ExecutionRequest};
use crate::errors::SandboxError;
use crate::lang::SupportedLanguage;

/// Substrate selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LocalEngine,
    Orchestrator,
}

impl BackendKind {
    /// Registry key for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LocalEngine => "local_engine",
            BackendKind::Orchestrator => "orchestrator",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local_engine" | "docker" | "local" => Ok(BackendKind::LocalEngine),
            "orchestrator" | "k8s" | "kubernetes" => Ok(BackendKind::Orchestrator),
            _ => Err(SandboxError::not_available(s)),
        }
    }
}

/// Identity of one live sandbox environment
///
/// Opaque outside the backend that minted it: a container id for the local
/// engine, a pod name plus parent deployment for the orchestrator. The
/// supervisor owns the handle for the session's lifetime and never exposes it.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    kind: BackendKind,
    id: String,
    deployment: Option<String>,
}

impl SandboxHandle {
    pub fn new(kind: BackendKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            deployment: None,
        }
    }

    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = Some(deployment.into());
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Container id or pod name
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parent deployment name, orchestrator only
    pub fn deployment(&self) -> Option<&str> {
        self.deployment.as_deref()
    }
}

/// Options for executing commands
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub working_dir: Option<String>,
}

/// Sandbox working directory; generated sources and bare-name artifacts
/// live here
pub const SANDBOX_WORKDIR: &str = "/sandbox";

/// Keep-alive command pinning an environment until explicit destroy
pub const KEEPALIVE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Contract every execution substrate implements
///
/// All operations block until the substrate answers. A non-zero exit code
/// from `exec` is an ordinary result; only substrate faults (environment
/// lost, channel broken, provisioning refused) surface as errors.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend kind identifier
    fn kind(&self) -> BackendKind;

    /// Provision a fresh environment for `language`
    ///
    /// Returns once the environment is addressable, not necessarily ready.
    async fn create(&self, language: SupportedLanguage) -> Result<SandboxHandle, SandboxError>;

    /// Transition the environment to runnable
    ///
    /// For substrates where create already starts, this is a wait-for-ready.
    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Run a single command synchronously, capturing stdout and stderr
    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<CommandResult, SandboxError>;

    /// Copy a host file into the sandbox at the given absolute path
    async fn put(
        &self,
        handle: &SandboxHandle,
        host_path: &std::path::Path,
        sandbox_path: &str,
    ) -> Result<(), SandboxError>;

    /// Copy one file out of the sandbox as a packed archive stream
    async fn get(
        &self,
        handle: &SandboxHandle,
        sandbox_path: &str,
    ) -> Result<(Vec<u8>, crate::archive::ArchiveStat), SandboxError>;

    /// Tear the environment down; idempotent, tolerates "already gone"
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Install dependencies, materialise the source, run it
    ///
    /// Installation failures are logged and do not short-circuit the run.
    /// The source is base64-encoded on the host and decoded inside the
    /// sandbox, so any UTF-8 payload survives the trip byte-identical.
    async fn run_code(
        &self,
        handle: &SandboxHandle,
        req: &ExecutionRequest,
    ) -> Result<CommandResult, SandboxError> {
        if let Some(deps) = req.dependencies.as_deref().filter(|d| !d.is_empty()) {
            if let Some(install) = req.language.install_command(deps) {
                info!("installing dependencies: {}", deps.join(", "));
                match self.exec(handle, &install, ExecOptions::default()).await {
                    Ok(result) if !result.success() => {
                        warn!(
                            "dependency install exited with {}: {}",
                            result.exit_code, result.stderr
                        );
                    }
                    Err(e) => warn!("dependency install failed: {e}"),
                    Ok(_) => {}
                }
            }
        }

        let file_path = materialise_source(self, handle, req).await?;

        let run = req.language.run_command(&file_path);
        self.exec(
            handle,
            &run,
            ExecOptions {
                working_dir: Some(SANDBOX_WORKDIR.to_string()),
            },
        )
        .await
    }
}

/// Write the request's source text into the sandbox under a fresh random
/// name, returning the sandbox path
async fn materialise_source<B: Backend + ?Sized>(
    backend: &B,
    handle: &SandboxHandle,
    req: &ExecutionRequest,
) -> Result<String, SandboxError> {
    let file_path = format!(
        "{SANDBOX_WORKDIR}/code_{}{}",
        uuid::Uuid::new_v4().simple(),
        req.language.extension()
    );
    let encoded = BASE64.encode(req.code.as_bytes());
    let write = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo {encoded} | base64 -d > {file_path}"),
    ];
    let result = backend.exec(handle, &write, ExecOptions::default()).await?;
    if !result.success() {
        return Err(SandboxError::backend(format!(
            "failed to materialise source at {file_path}: {}",
            result.stderr
        )));
    }
    Ok(file_path)
}
