//! Language plan - per-language image, source extension, install and run commands
//!
//! Pure data keyed on [`SupportedLanguage`]. Backends consult this table when
//! provisioning an environment and when turning a request into shell commands;
//! nothing here touches a substrate.

use serde::{Deserialize, Serialize};

use crate::errors::SandboxError;

/// Languages the sandbox can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedLanguage {
    Python,
    Java,
    Javascript,
    Cpp,
    Go,
    Ruby,
    R,
}

impl SupportedLanguage {
    /// All supported languages, in declaration order
    pub fn all() -> &'static [SupportedLanguage] {
        &[
            SupportedLanguage::Python,
            SupportedLanguage::Java,
            SupportedLanguage::Javascript,
            SupportedLanguage::Cpp,
            SupportedLanguage::Go,
            SupportedLanguage::Ruby,
            SupportedLanguage::R,
        ]
    }

    /// Canonical lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            SupportedLanguage::Python => "python",
            SupportedLanguage::Java => "java",
            SupportedLanguage::Javascript => "javascript",
            SupportedLanguage::Cpp => "cpp",
            SupportedLanguage::Go => "go",
            SupportedLanguage::Ruby => "ruby",
            SupportedLanguage::R => "r",
        }
    }

    /// Source file extension, including the dot
    pub fn extension(&self) -> &'static str {
        match self {
            SupportedLanguage::Python => ".py",
            SupportedLanguage::Java => ".java",
            SupportedLanguage::Javascript => ".js",
            SupportedLanguage::Cpp => ".cpp",
            SupportedLanguage::Go => ".go",
            SupportedLanguage::Ruby => ".rb",
            SupportedLanguage::R => ".R",
        }
    }

    /// Default container image; backend configs may override per language
    pub fn default_image(&self) -> &'static str {
        match self {
            SupportedLanguage::Python => "python:3.11-slim",
            SupportedLanguage::Java => "eclipse-temurin:21",
            SupportedLanguage::Javascript => "node:20-slim",
            SupportedLanguage::Cpp => "gcc:13",
            SupportedLanguage::Go => "golang:1.22-bookworm",
            SupportedLanguage::Ruby => "ruby:3.3-slim",
            SupportedLanguage::R => "r-base:4.3.2",
        }
    }

    /// Dependency install command, or `None` for languages without a
    /// package-manager plan (java, cpp, r)
    pub fn install_command(&self, dependencies: &[String]) -> Option<Vec<String>> {
        let mut argv: Vec<String> = match self {
            SupportedLanguage::Python => {
                vec!["pip".into(), "install".into(), "--quiet".into()]
            }
            SupportedLanguage::Go => vec!["go".into(), "get".into()],
            SupportedLanguage::Javascript => vec!["npm".into(), "install".into()],
            SupportedLanguage::Ruby => vec!["gem".into(), "install".into()],
            SupportedLanguage::Java | SupportedLanguage::Cpp | SupportedLanguage::R => {
                return None;
            }
        };
        argv.extend(dependencies.iter().cloned());
        Some(argv)
    }

    /// Command that runs a materialised source file
    ///
    /// Java and C++ are executed without a compile step, mirroring the
    /// interpreter-style plans of the other languages.
    pub fn run_command(&self, file_path: &str) -> Vec<String> {
        match self {
            SupportedLanguage::Python => vec!["python".into(), file_path.into()],
            SupportedLanguage::Go => vec!["go".into(), "run".into(), file_path.into()],
            SupportedLanguage::Java => vec!["java".into(), file_path.into()],
            SupportedLanguage::Javascript => vec!["node".into(), file_path.into()],
            SupportedLanguage::Cpp => vec!["./a.out".into()],
            SupportedLanguage::Ruby => vec!["ruby".into(), file_path.into()],
            SupportedLanguage::R => vec!["Rscript".into(), file_path.into()],
        }
    }
}

impl std::fmt::Display for SupportedLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SupportedLanguage {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" => Ok(SupportedLanguage::Python),
            "java" => Ok(SupportedLanguage::Java),
            "javascript" | "js" => Ok(SupportedLanguage::Javascript),
            "cpp" | "c++" => Ok(SupportedLanguage::Cpp),
            "go" => Ok(SupportedLanguage::Go),
            "ruby" => Ok(SupportedLanguage::Ruby),
            "r" => Ok(SupportedLanguage::R),
            _ => Err(SandboxError::UnsupportedLanguage(s.to_string())),
        }
    }
}
