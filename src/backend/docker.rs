//! Docker backend - local containers via the Docker Engine API
//!
//! Environment model: one container per session from the language's image,
//! kept alive with `tail -f /dev/null` until the session destroys it.
//! `create` leaves the container created-but-stopped; `start` brings it up.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};

use super::{Backend, BackendKind, ExecOptions, SandboxHandle, KEEPALIVE_COMMAND, SANDBOX_WORKDIR};
use crate::archive::ArchiveStat;
use crate::data::CommandResult;
use crate::errors::SandboxError;
use crate::lang::SupportedLanguage;

/// Docker backend configuration
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Docker socket path (default: auto-detect)
    pub socket_path: Option<String>,
    /// Container name prefix
    pub name_prefix: String,
    /// Labels applied to all containers
    pub labels: HashMap<String, String>,
    /// Per-language image overrides
    pub images: HashMap<SupportedLanguage, String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        let socket_path = match std::env::var("RUNBOX_DOCKER_SOCKET") {
            Ok(path) => Some(path),
            Err(_) => {
                if std::path::Path::new("/var/run/docker.sock").exists() {
                    None // Use default
                } else {
                    // Docker Desktop on macOS
                    let home = std::env::var("HOME").unwrap_or_default();
                    let desktop_sock = format!("{home}/.docker/run/docker.sock");
                    std::path::Path::new(&desktop_sock)
                        .exists()
                        .then_some(desktop_sock)
                }
            }
        };

        Self {
            socket_path,
            name_prefix: "runbox-".to_string(),
            labels: HashMap::from([("managed-by".to_string(), "runbox".to_string())]),
            images: HashMap::new(),
        }
    }
}

impl DockerConfig {
    fn image_for(&self, language: SupportedLanguage) -> String {
        self.images
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.default_image().to_string())
    }
}

/// Docker backend implementation
pub struct DockerBackend {
    docker: Docker,
    config: DockerConfig,
}

impl DockerBackend {
    /// Connect to the local engine using the config's socket, or the
    /// ambient default
    pub fn connect(config: DockerConfig) -> Result<Self, SandboxError> {
        let docker = if let Some(ref path) = config.socket_path {
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| SandboxError::backend(format!("Docker socket {path}: {e}")))?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| SandboxError::backend(format!("Docker: {e}")))?
        };

        Ok(Self { docker, config })
    }

    /// Pull image if not present
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("pulling image {image}");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("pull {image}: {status}");
                    }
                }
                Err(_) => return Err(SandboxError::ImageNotFound(image.to_string())),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalEngine
    }

    async fn create(&self, language: SupportedLanguage) -> Result<SandboxHandle, SandboxError> {
        let image = self.config.image_for(language);
        let name = format!(
            "{}{}-{}",
            self.config.name_prefix,
            language,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        self.ensure_image(&image).await?;

        let config = Config {
            image: Some(image.clone()),
            cmd: Some(KEEPALIVE_COMMAND.iter().map(|s| s.to_string()).collect()),
            working_dir: Some(SANDBOX_WORKDIR.to_string()),
            labels: Some(self.config.labels.clone()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::ImageNotFound(image.clone()),
                e => SandboxError::backend(format!("create container: {e}")),
            })?;

        info!("created container {name} ({})", &response.id[..12]);
        Ok(SandboxHandle::new(BackendKind::LocalEngine, response.id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.docker
            .start_container(handle.id(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::backend(format!("start container: {e}")))?;

        let info = self
            .docker
            .inspect_container(handle.id(), None)
            .await
            .map_err(|e| SandboxError::backend(format!("inspect container: {e}")))?;
        let running = info
            .state
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Err(SandboxError::backend(format!(
                "container {} did not reach running state",
                handle.id()
            )));
        }
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<CommandResult, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                handle.id(),
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv.to_vec()),
                    working_dir: options.working_dir,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::backend(format!("create exec: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::backend(format!("start exec: {e}")))?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(msg) = output.next().await {
                match msg.map_err(|e| SandboxError::backend(format!("exec stream: {e}")))? {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.extend_from_slice(&message)
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.extend_from_slice(&message)
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::backend(format!("inspect exec: {e}")))?;
        let exit_code = inspect.exit_code.unwrap_or(0) as i32;

        Ok(CommandResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn put(
        &self,
        handle: &SandboxHandle,
        host_path: &Path,
        sandbox_path: &str,
    ) -> Result<(), SandboxError> {
        let contents = tokio::fs::read(host_path)
            .await
            .map_err(|e| SandboxError::backend(format!("read {}: {e}", host_path.display())))?;

        let target = Path::new(sandbox_path);
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::backend(format!("invalid sandbox path {sandbox_path}")))?;
        let parent = target
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        let archive = crate::archive::pack_file(&name, &contents)
            .map_err(|e| SandboxError::backend(format!("pack archive: {e}")))?;

        self.docker
            .upload_to_container(
                handle.id(),
                Some(UploadToContainerOptions {
                    path: parent,
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| SandboxError::backend(format!("upload archive: {e}")))
    }

    async fn get(
        &self,
        handle: &SandboxHandle,
        sandbox_path: &str,
    ) -> Result<(Vec<u8>, ArchiveStat), SandboxError> {
        let mut stream = self.docker.download_from_container(
            handle.id(),
            Some(DownloadFromContainerOptions {
                path: sandbox_path.to_string(),
            }),
        );

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| SandboxError::backend(format!("download {sandbox_path}: {e}")))?;
            archive.extend_from_slice(&chunk);
        }

        let stat = crate::archive::entry_stat(&archive)
            .map_err(|e| SandboxError::backend(format!("archive for {sandbox_path}: {e}")))?;
        Ok((archive, stat))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true, // Remove anonymous volumes
            ..Default::default()
        };

        match self.docker.remove_container(handle.id(), Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(SandboxError::backend(format!("remove container: {e}"))),
        }
    }
}
