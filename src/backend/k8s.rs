//! K8s backend - sandbox pods via a cluster orchestrator
//!
//! Environment model: one Deployment per session, `replicas=1`, selected by
//! an `app=sandbox-<lang>-<nonce>` label. `create` waits until the pod under
//! that label reports the Running phase; `start` is therefore a no-op. Exec
//! goes over the websocket attach channel, file transport is a tar stream
//! piped through exec stdin/stdout.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{AttachParams, DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{Backend, BackendKind, ExecOptions, SandboxHandle, KEEPALIVE_COMMAND, SANDBOX_WORKDIR};
use crate::archive::ArchiveStat;
use crate::data::CommandResult;
use crate::errors::SandboxError;
use crate::lang::SupportedLanguage;

/// K8s backend configuration
#[derive(Debug, Clone)]
pub struct K8sConfig {
    /// Namespace sandboxes are created in
    pub namespace: String,
    /// Readiness poll budget: attempts x interval
    pub ready_attempts: usize,
    pub ready_interval: Duration,
    /// Per-language image overrides
    pub images: HashMap<SupportedLanguage, String>,
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            namespace: std::env::var("RUNBOX_K8S_NAMESPACE")
                .unwrap_or_else(|_| "default".to_string()),
            ready_attempts: std::env::var("RUNBOX_READY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            ready_interval: Duration::from_secs(1),
            images: HashMap::new(),
        }
    }
}

impl K8sConfig {
    fn image_for(&self, language: SupportedLanguage) -> String {
        self.images
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.default_image().to_string())
    }
}

/// K8s backend implementation
pub struct K8sBackend {
    client: Client,
    config: K8sConfig,
}

impl K8sBackend {
    /// Connect using the ambient configuration - kubeconfig outside a
    /// cluster, the service account inside one
    pub async fn connect(config: K8sConfig) -> Result<Self, SandboxError> {
        let client = Client::try_default()
            .await
            .map_err(|e| SandboxError::backend(format!("cluster client: {e}")))?;
        Ok(Self { client, config })
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Poll the pod list under `app=<label>` until one pod is Running
    async fn wait_for_pod_running(&self, label: &str) -> Result<String, SandboxError> {
        let pods = self.pods();
        let params = ListParams::default().labels(&format!("app={label}"));

        for attempt in 0..self.config.ready_attempts {
            let list = pods
                .list(&params)
                .await
                .map_err(|e| SandboxError::backend(format!("list pods: {e}")))?;
            if let Some(pod) = list.items.iter().find(|p| {
                p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            }) {
                let name = pod.name_any();
                debug!("pod {name} running after {attempt} polls");
                return Ok(name);
            }
            tokio::time::sleep(self.config.ready_interval).await;
        }

        Err(SandboxError::backend(format!(
            "no pod under app={label} reached Running within {} polls",
            self.config.ready_attempts
        )))
    }

    /// Run a shell command in the pod, optionally feeding `stdin_data` and
    /// capturing stdout; the workhorse behind exec/put/get
    async fn exec_shell(
        &self,
        pod_name: &str,
        command: &str,
        stdin_data: Option<&[u8]>,
    ) -> Result<(i32, Vec<u8>, Vec<u8>), SandboxError> {
        let pods = self.pods();
        let params = AttachParams::default()
            .stdin(stdin_data.is_some())
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(pod_name, vec!["/bin/sh", "-c", command], &params)
            .await
            .map_err(|e| SandboxError::backend(format!("exec channel: {e}")))?;

        if let Some(data) = stdin_data {
            let mut stdin = attached
                .stdin()
                .ok_or_else(|| SandboxError::backend("exec channel missing stdin"))?;
            stdin
                .write_all(data)
                .await
                .map_err(|e| SandboxError::backend(format!("exec stdin: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| SandboxError::backend(format!("exec stdin close: {e}")))?;
        }

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| SandboxError::backend("exec channel missing stdout"))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| SandboxError::backend("exec channel missing stderr"))?;
        let status = attached.take_status();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out, err) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout),
            stderr_reader.read_to_end(&mut stderr),
        );
        out.map_err(|e| SandboxError::backend(format!("exec stdout: {e}")))?;
        err.map_err(|e| SandboxError::backend(format!("exec stderr: {e}")))?;

        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| SandboxError::backend(format!("exec channel: {e}")))?;

        Ok((exit_code_from_status(status), stdout, stderr))
    }
}

#[async_trait]
impl Backend for K8sBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Orchestrator
    }

    async fn create(&self, language: SupportedLanguage) -> Result<SandboxHandle, SandboxError> {
        let image = self.config.image_for(language);
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("sandbox-{language}-{}", &nonce[..8]);

        let deployment: Deployment = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": &name },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": &name } },
                "template": {
                    "metadata": { "labels": { "app": &name } },
                    "spec": {
                        "containers": [{
                            "name": "sandbox",
                            "image": &image,
                            "command": KEEPALIVE_COMMAND,
                            "workingDir": SANDBOX_WORKDIR,
                        }]
                    }
                }
            }
        }))
        .map_err(|e| SandboxError::backend(format!("deployment spec: {e}")))?;

        let deployments = self.deployments();

        // Clear any leftover deployment under the same name
        match deployments.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(SandboxError::backend(format!("delete deployment: {e}"))),
        }

        deployments
            .create(&PostParams::default(), &deployment)
            .await
            .map_err(|e| SandboxError::backend(format!("create deployment: {e}")))?;
        info!("created deployment {name} ({image})");

        let pod_name = match self.wait_for_pod_running(&name).await {
            Ok(pod_name) => pod_name,
            Err(e) => {
                // The handle was never minted; clean up the deployment here
                if let Err(de) = deployments.delete(&name, &DeleteParams::default()).await {
                    if !is_not_found(&de) {
                        warn!("cleanup of deployment {name} failed: {de}");
                    }
                }
                return Err(e);
            }
        };

        Ok(SandboxHandle::new(BackendKind::Orchestrator, pod_name).with_deployment(name))
    }

    async fn start(&self, _handle: &SandboxHandle) -> Result<(), SandboxError> {
        // Provisioning already waited for the Running phase
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<CommandResult, SandboxError> {
        let mut command = shell_command(argv);
        if let Some(dir) = options.working_dir {
            command = format!("cd {dir} && {command}");
        }

        let (exit_code, stdout, stderr) = self.exec_shell(handle.id(), &command, None).await?;
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

        let (parent, name) = split_sandbox_path(sandbox_path)?;
        let archive = crate::archive::pack_file(&name, &contents)
            .map_err(|e| SandboxError::backend(format!("pack archive: {e}")))?;

        let command = format!("tar xf - -C {parent}");
        let (exit_code, _, stderr) = self
            .exec_shell(handle.id(), &command, Some(&archive))
            .await?;
        if exit_code != 0 {
            return Err(SandboxError::backend(format!(
                "unpack into {parent}: {}",
                String::from_utf8_lossy(&stderr)
            )));
        }
        Ok(())
    }

    async fn get(
        &self,
        handle: &SandboxHandle,
        sandbox_path: &str,
    ) -> Result<(Vec<u8>, ArchiveStat), SandboxError> {
        let (parent, name) = split_sandbox_path(sandbox_path)?;
        let command = format!("tar cf - -C {parent} {name}");

        let (exit_code, archive, stderr) = self.exec_shell(handle.id(), &command, None).await?;
        if exit_code != 0 {
            return Err(SandboxError::backend(format!(
                "pack {sandbox_path}: {}",
                String::from_utf8_lossy(&stderr)
            )));
        }

        let stat = crate::archive::entry_stat(&archive)
            .map_err(|e| SandboxError::backend(format!("archive for {sandbox_path}: {e}")))?;
        Ok((archive, stat))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let name = handle
            .deployment()
            .ok_or_else(|| SandboxError::backend("handle carries no deployment name"))?;

        // Fire the delete and return; pod teardown proceeds in the cluster
        match self.deployments().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(SandboxError::backend(format!("delete deployment: {e}"))),
        }
    }
}

/// Join an argv into the single string handed to `/bin/sh -c`
///
/// Elements are passed verbatim, separated by single spaces. An argv that is
/// already a `sh -c <script>` wrapper passes its script through unchanged so
/// the shell is not nested.
fn shell_command(argv: &[String]) -> String {
    match argv {
        [shell, flag, script] if (shell == "sh" || shell == "/bin/sh") && flag == "-c" => {
            script.clone()
        }
        _ => argv.join(" "),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn split_sandbox_path(sandbox_path: &str) -> Result<(String, String), SandboxError> {
    let path = Path::new(sandbox_path);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SandboxError::backend(format!("invalid sandbox path {sandbox_path}")))?;
    let parent = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());
    Ok((parent, name))
}

/// Map the exec channel's terminal `Status` to a process exit code
fn exit_code_from_status(status: Option<Status>) -> i32 {
    let Some(status) = status else { return 0 };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .and_then(|details| details.causes)
        .and_then(|causes| {
            causes
                .into_iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message)
        .and_then(|code| code.parse().ok())
        .unwrap_or(1)
}
