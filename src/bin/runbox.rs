//! runbox - sandboxed code execution from the command line
//!
//! Thin adapter over the session supervisor: pick a backend and language,
//! hand over code, get streams and artifacts back.

use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use runbox::backend::registry;
use runbox::{BackendKind, Session, SupportedLanguage};

#[derive(Parser)]
#[command(name = "runbox")]
#[command(about = "Run untrusted code in disposable sandboxes (Docker or Kubernetes)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(short, long, default_value = "text", global = true)]
    output: OutputFormat,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute code in a fresh sandbox
    Run {
        /// Source text; omit to read from --file or stdin
        code: Option<String>,
        /// Read source from a file instead
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Language to execute
        #[arg(short, long, default_value = "python")]
        language: String,
        /// Backend: local_engine (docker) or orchestrator (k8s)
        #[arg(short, long, default_value = "local_engine")]
        backend: String,
        /// Dependency to install before running (repeatable)
        #[arg(long = "dep")]
        deps: Vec<String>,
        /// Artifact path to copy back to ./output (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
    },

    /// Run a single command in a fresh sandbox
    Exec {
        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        argv: Vec<String>,
        #[arg(short, long, default_value = "python")]
        language: String,
        #[arg(short, long, default_value = "local_engine")]
        backend: String,
    },

    /// List supported languages
    Languages,

    /// List registered backends
    Backends,

    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("RUNBOX_LOG")
        .unwrap_or_else(|_| EnvFilter::new("runbox=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    registry::install_defaults();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            code,
            file,
            language,
            backend,
            deps,
            artifacts,
        } => {
            let source = read_source(code, file)?;
            let language = SupportedLanguage::from_str(&language)?;
            let backend = BackendKind::from_str(&backend)?;
            let deps = (!deps.is_empty()).then_some(deps);

            let result = Session::scope(backend, language, |session| {
                Box::pin(async move {
                    session
                        .run_code_with_artifacts(&source, deps, &artifacts)
                        .await
                })
            })
            .await?;

            match cli.output {
                OutputFormat::Json => println!("{}", result.to_json()),
                OutputFormat::Text => {
                    print!("{}", result.output.stdout);
                    if !result.output.stderr.is_empty() {
                        eprint!("{}", result.output.stderr);
                    }
                    for artifact in &result.artifacts {
                        println!("saved: {}", artifact.host_path.display());
                    }
                }
            }
            std::process::exit(result.output.exit_code);
        }

        Commands::Exec {
            argv,
            language,
            backend,
        } => {
            let language = SupportedLanguage::from_str(&language)?;
            let backend = BackendKind::from_str(&backend)?;

            let result = Session::scope(backend, language, |session| {
                Box::pin(async move { session.exec(&argv).await })
            })
            .await?;

            match cli.output {
                OutputFormat::Json => println!("{}", result.to_json()),
                OutputFormat::Text => {
                    print!("{}", result.stdout);
                    if !result.stderr.is_empty() {
                        eprint!("{}", result.stderr);
                    }
                }
            }
            std::process::exit(result.exit_code);
        }

        Commands::Languages => {
            for language in SupportedLanguage::all() {
                println!("{language}\t{}", language.default_image());
            }
        }

        Commands::Backends => {
            for key in registry::available() {
                println!("{key}");
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        }
    }

    Ok(())
}

fn read_source(code: Option<String>, file: Option<PathBuf>) -> anyhow::Result<String> {
    match (code, file) {
        (Some(code), _) => Ok(code),
        (None, Some(path)) => Ok(std::fs::read_to_string(path)?),
        (None, None) => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}
