//! Request and result value types shared by backends, the supervisor, and
//! the adapter binaries

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::lang::SupportedLanguage;

/// One code-execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: SupportedLanguage,
    /// Package names as understood by the language's package manager
    pub dependencies: Option<Vec<String>>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: SupportedLanguage) -> Self {
        Self {
            code: code.into(),
            language,
            dependencies: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }
}

/// An execution request that also asks for files produced by the code
///
/// Each path is the path as the code sees it; bare names resolve relative to
/// the sandbox working directory `/sandbox`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRequest {
    pub request: ExecutionRequest,
    pub artifact_paths: Vec<String>,
}

/// Output of one synchronous command execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Result of a run that may have produced artifacts
///
/// `artifacts` holds only the files that were actually retrieved and staged;
/// requested-but-missing paths are logged and omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(flatten)]
    pub output: CommandResult,
    pub artifacts: Vec<ArtifactHandle>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.output.success()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// A staged artifact on the host filesystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub host_path: PathBuf,
    pub size: u64,
    /// Name the file had inside the sandbox
    pub logical_name: String,
    /// MIME tag derived from the extension, when recognised
    pub file_type: Option<FileType>,
}

/// Recognised artifact file types; informational, drives MIME tagging only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Png,
    Jpeg,
    Pdf,
    Svg,
    Csv,
    Json,
    Txt,
    Html,
}

impl FileType {
    pub fn mime(&self) -> &'static str {
        match self {
            FileType::Png => "image/png",
            FileType::Jpeg => "image/jpeg",
            FileType::Pdf => "application/pdf",
            FileType::Svg => "image/svg+xml",
            FileType::Csv => "text/csv",
            FileType::Json => "application/json",
            FileType::Txt => "text/plain",
            FileType::Html => "text/html",
        }
    }

    /// Sniff a file type from a path's extension
    pub fn from_path(path: &str) -> Option<FileType> {
        let ext = path.rsplit('.').next()?;
        match ext.to_lowercase().as_str() {
            "png" => Some(FileType::Png),
            "jpg" | "jpeg" => Some(FileType::Jpeg),
            "pdf" => Some(FileType::Pdf),
            "svg" => Some(FileType::Svg),
            "csv" => Some(FileType::Csv),
            "json" => Some(FileType::Json),
            "txt" => Some(FileType::Txt),
            "html" | "htm" => Some(FileType::Html),
            _ => None,
        }
    }
}
