//! run_code_in_sandbox - the sandbox tool behind the MCP server
//!
//! Maps wire arguments onto one scoped session and hands back the domain
//! result; how it goes on the wire is the server's business. Program-level
//! failures (non-zero exit) come back inside the [`ExecutionResult`]; only
//! substrate faults and unusable arguments surface as [`SandboxError`].

use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::backend::BackendKind;
use crate::data::{ArtifactRequest, ExecutionRequest, ExecutionResult};
use crate::errors::SandboxError;
use crate::lang::SupportedLanguage;
use crate::session::Session;

/// Wire arguments for [`RunCodeTool`]
#[derive(Debug, Clone, Deserialize)]
pub struct RunCodeArgs {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Packages to install before the run
    #[serde(default)]
    pub libraries: Option<Vec<String>>,
    /// Files the code produces, staged back to the host
    #[serde(default)]
    pub file_paths: Option<Vec<String>>,
    /// Backend override; the local engine unless told otherwise
    #[serde(default)]
    pub backend: Option<String>,
}

fn default_language() -> String {
    "python".to_string()
}

pub struct RunCodeTool;

impl RunCodeTool {
    pub const NAME: &'static str = "run_code_in_sandbox";
    pub const DESCRIPTION: &'static str =
        "Run code in an isolated sandbox and return exit code, stdout, stderr, \
         and any requested output files staged to the host";

    pub fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "Source text to execute"},
                "language": {
                    "type": "string",
                    "description": "python, java, javascript, cpp, go, ruby, or r",
                    "default": "python"
                },
                "libraries": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Packages to install before the run"
                },
                "file_paths": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Files the code produces, to be copied back to the host"
                },
                "backend": {"type": "string", "description": "local_engine or orchestrator"}
            },
            "required": ["code"]
        })
    }

    /// Run the request in a scoped session; the sandbox is gone by the time
    /// this returns
    pub async fn call(args: RunCodeArgs) -> Result<ExecutionResult, SandboxError> {
        let language = SupportedLanguage::from_str(&args.language)?;
        let backend_kind = match args.backend.as_deref() {
            Some(s) => BackendKind::from_str(s)?,
            None => BackendKind::LocalEngine,
        };

        let request = ArtifactRequest {
            request: ExecutionRequest {
                code: args.code,
                language,
                dependencies: args.libraries,
            },
            artifact_paths: args.file_paths.unwrap_or_default(),
        };
        Session::scope(backend_kind, language, |session| {
            Box::pin(async move { session.run(&request).await })
        })
        .await
    }
}
