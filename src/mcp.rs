//! MCP tool server - JSON-RPC over stdio
//!
//! One request per line on stdin, one response per line on stdout; logs go
//! to stderr. The server speaks the sandbox's error taxonomy: substrate
//! faults map onto distinct JSON-RPC error codes, while program-level
//! failures (non-zero exit) stay inside the execution payload - a crash of
//! the code under test is a result, not a protocol error.

use serde_json::{json, Value};
use std::io::{self, BufRead, Write};

use tracing::error;

use crate::data::ExecutionResult;
use crate::errors::SandboxError;
use crate::tools::{RunCodeArgs, RunCodeTool};

// Standard JSON-RPC codes
const CODE_PARSE_ERROR: i32 = -32700;
const CODE_METHOD_NOT_FOUND: i32 = -32601;
const CODE_INVALID_PARAMS: i32 = -32602;

// Sandbox fault taxonomy on the wire
const CODE_BACKEND_NOT_AVAILABLE: i32 = -32001;
const CODE_BACKEND_FAULT: i32 = -32002;
const CODE_IMAGE_NOT_FOUND: i32 = -32003;

/// JSON-RPC error code for a sandbox fault
fn error_code(err: &SandboxError) -> i32 {
    match err {
        SandboxError::BackendNotAvailable(_) => CODE_BACKEND_NOT_AVAILABLE,
        SandboxError::Backend(_) => CODE_BACKEND_FAULT,
        SandboxError::ImageNotFound(_) => CODE_IMAGE_NOT_FOUND,
        SandboxError::UnsupportedLanguage(_) => CODE_INVALID_PARAMS,
    }
}

fn reply(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn fail(id: Value, code: i32, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// Frame an execution result for tools/call
///
/// stdout (with stderr tagged on after it, the way a terminal would show
/// it) is the readable content; the machine-readable result - exit code,
/// streams, staged artifact handles - rides in structuredContent.
fn frame_execution(execution: &ExecutionResult) -> Value {
    let mut text = execution.output.stdout.clone();
    if !execution.output.stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str("[stderr]\n");
        text.push_str(&execution.output.stderr);
    }
    for artifact in &execution.artifacts {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("saved: {}\n", artifact.host_path.display()));
    }

    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": execution,
        "isError": false
    })
}

/// Serves [`RunCodeTool`] over stdio
#[derive(Default)]
pub struct McpServer;

impl McpServer {
    pub fn new() -> Self {
        Self
    }

    /// Run the server (blocking, reads from stdin)
    pub async fn run(&self) -> io::Result<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();

        for line in stdin.lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let response = self.handle_line(&line).await;
            writeln!(stdout, "{response}")?;
            stdout.flush()?;
        }

        Ok(())
    }

    async fn handle_line(&self, line: &str) -> Value {
        let req: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => return fail(Value::Null, CODE_PARSE_ERROR, format!("parse error: {e}")),
        };
        let id = req.get("id").cloned().unwrap_or(Value::Null);
        let method = req.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = req.get("params").cloned().unwrap_or_else(|| json!({}));

        match method {
            "initialize" => reply(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "runbox",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            ),
            "notifications/initialized" => reply(id, json!({})),
            "tools/list" => reply(
                id,
                json!({
                    "tools": [{
                        "name": RunCodeTool::NAME,
                        "description": RunCodeTool::DESCRIPTION,
                        "inputSchema": RunCodeTool::schema()
                    }]
                }),
            ),
            "tools/call" => self.handle_tools_call(id, params).await,
            other => fail(id, CODE_METHOD_NOT_FOUND, format!("method not found: {other}")),
        }
    }

    async fn handle_tools_call(&self, id: Value, params: Value) -> Value {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        if name != RunCodeTool::NAME {
            return fail(id, CODE_INVALID_PARAMS, format!("unknown tool: {name}"));
        }

        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let args: RunCodeArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return fail(id, CODE_INVALID_PARAMS, format!("invalid arguments: {e}")),
        };

        match RunCodeTool::call(args).await {
            Ok(execution) => reply(id, frame_execution(&execution)),
            Err(e) => {
                error!("{} failed: {e}", RunCodeTool::NAME);
                fail(id, error_code(&e), e.to_string())
            }
        }
    }
}
