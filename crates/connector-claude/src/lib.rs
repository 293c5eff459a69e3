//! Claude CLI connector
//!
//! Spawns the `claude` CLI as a subprocess per invocation and talks to it over
//! stdin/stdout using the NDJSON stream-json protocol. Tool approvals arrive
//! as `can_use_tool` control requests and are answered through the
//! invocation's `PermissionHandler`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cowork_connector_core::{
    AgentEvent, AgentService, AgentStream, ConnectorError, InvocationRequest, PermissionHandler,
};
use cowork_protocol::{McpServer, PermissionResult};

/// How long the CLI gets to exit on its own after its final result.
const EXIT_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Stdin messages (Rust → CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User {
        session_id: String,
        message: UserMessagePayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Serialize)]
struct UserMessagePayload {
    role: &'static str,
    content: Vec<UserContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContentBlock {
    Text { text: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponsePayload {
    Success { request_id: String, response: Value },
    Error { request_id: String, error: String },
}

// ---------------------------------------------------------------------------
// ClaudeCliService
// ---------------------------------------------------------------------------

/// Launch settings shared by every invocation.
#[derive(Debug, Clone)]
pub struct ClaudeCliConfig {
    /// Explicit binary path; resolved from the environment when `None`.
    pub binary: Option<String>,
    pub permission_mode: String,
    pub include_partial_messages: bool,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            binary: None,
            permission_mode: "default".to_string(),
            include_partial_messages: true,
        }
    }
}

/// `AgentService` backed by the `claude` CLI.
#[derive(Debug, Clone, Default)]
pub struct ClaudeCliService {
    config: ClaudeCliConfig,
}

impl ClaudeCliService {
    pub fn new(config: ClaudeCliConfig) -> Self {
        Self { config }
    }
}

impl AgentService for ClaudeCliService {
    fn invoke(
        &self,
        request: InvocationRequest,
        permissions: Arc<dyn PermissionHandler>,
    ) -> AgentStream {
        let (event_tx, event_rx) = mpsc::channel::<Result<AgentEvent, ConnectorError>>(256);
        let config = self.config.clone();

        tokio::spawn(async move {
            if let Err(e) = run_invocation(config, request, permissions, event_tx.clone()).await {
                let _ = event_tx.send(Err(e)).await;
            }
        });

        futures::stream::unfold(event_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }
}

/// Drive one CLI subprocess from spawn to exit.
async fn run_invocation(
    config: ClaudeCliConfig,
    request: InvocationRequest,
    permissions: Arc<dyn PermissionHandler>,
    event_tx: mpsc::Sender<Result<AgentEvent, ConnectorError>>,
) -> Result<(), ConnectorError> {
    let claude_bin = resolve_claude_binary(config.binary.as_deref())?;
    let args = build_args(&config, &request)?;

    info!(
        component = "claude_connector",
        event = "claude.spawn",
        cwd = %request.cwd,
        claude_bin = %claude_bin,
        resume_token = ?request.resume_token,
        "Spawning Claude CLI"
    );

    let mut child = tokio::process::Command::new(&claude_bin)
        .args(&args)
        .current_dir(&request.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("CLAUDE_CODE_ENTRYPOINT", "cowork")
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ConnectorError::Spawn(format!("Failed to spawn claude CLI: {}", e)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ConnectorError::Provider("No stdin on child".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ConnectorError::Provider("No stdout on child".into()))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(
                    component = "claude_connector",
                    event = "claude.stderr",
                    line = %line,
                    "Claude CLI stderr"
                );
            }
        });
    }

    let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
    tokio::spawn(stdin_writer(stdin, stdin_rx));

    let prompt = StdinMessage::User {
        session_id: String::new(),
        message: UserMessagePayload {
            role: "user",
            content: vec![UserContentBlock::Text {
                text: request.prompt.clone(),
            }],
        },
        parent_tool_use_id: None,
    };
    write_stdin_message(&stdin_tx, &prompt).await?;

    let mut lines = BufReader::new(stdout).lines();
    let mut finished = false;

    loop {
        let line = tokio::select! {
            _ = request.cancel.cancelled() => {
                info!(
                    component = "claude_connector",
                    event = "claude.cancelled",
                    "Invocation cancelled, killing CLI"
                );
                let _ = child.kill().await;
                return Ok(());
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(
                    component = "claude_connector",
                    event = "claude.stdout.read_error",
                    error = %e,
                    "Error reading CLI stdout"
                );
                let _ = child.kill().await;
                return Err(ConnectorError::Io(e));
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    component = "claude_connector",
                    event = "claude.stdout.parse_error",
                    error = %e,
                    line_preview = %line.chars().take(200).collect::<String>(),
                    "Failed to parse stdout JSON"
                );
                continue;
            }
        };

        match raw.get("type").and_then(Value::as_str).unwrap_or("") {
            "control_request" => {
                handle_control_request(&raw, &permissions, &stdin_tx);
                continue;
            }
            "control_cancel_request" | "control_response" | "keep_alive" => {
                debug!(
                    component = "claude_connector",
                    event = "claude.control.ignored",
                    request_id = ?raw.get("request_id"),
                    "Ignoring control message"
                );
                continue;
            }
            _ => {}
        }

        let event = AgentEvent::from_raw(raw);
        let is_final = matches!(event, AgentEvent::Finished { .. });
        if event_tx.send(Ok(event)).await.is_err() {
            info!(
                component = "claude_connector",
                event = "claude.event_loop.channel_closed",
                "Event channel closed, stopping CLI"
            );
            let _ = child.kill().await;
            return Ok(());
        }
        if is_final {
            finished = true;
            break;
        }
    }

    // Closing stdin lets the CLI exit on its own.
    drop(stdin_tx);
    let status = match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(status) => Some(status?),
        Err(_) => {
            warn!(
                component = "claude_connector",
                event = "claude.exit.timeout",
                "CLI did not exit after result, killing"
            );
            let _ = child.kill().await;
            None
        }
    };

    if finished {
        return Ok(());
    }
    match status {
        Some(status) if !status.success() => Err(ConnectorError::Provider(format!(
            "claude CLI exited with {}",
            status
        ))),
        _ => Err(ConnectorError::Provider(
            "claude CLI exited before reporting a result".to_string(),
        )),
    }
}

/// Answer a `control_request` from the CLI without blocking the stdout reader.
fn handle_control_request(
    raw: &Value,
    permissions: &Arc<dyn PermissionHandler>,
    stdin_tx: &mpsc::Sender<String>,
) {
    let request_id = raw
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let request = raw.get("request").cloned().unwrap_or(Value::Null);
    let subtype = request.get("subtype").and_then(Value::as_str).unwrap_or("");

    if subtype != "can_use_tool" {
        debug!(
            component = "claude_connector",
            event = "claude.control_request.unhandled",
            subtype = %subtype,
            "Unhandled CLI control request subtype"
        );
        let reply = StdinMessage::ControlResponse {
            response: ControlResponsePayload::Error {
                request_id,
                error: format!("Unsupported control request: {}", subtype),
            },
        };
        let stdin_tx = stdin_tx.clone();
        tokio::spawn(async move {
            let _ = write_stdin_message(&stdin_tx, &reply).await;
        });
        return;
    }

    let tool_name = request
        .get("tool_name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let input = request.get("input").cloned().unwrap_or(Value::Null);
    let tool_use_id = request
        .get("tool_use_id")
        .and_then(Value::as_str)
        .map(String::from);

    debug!(
        component = "claude_connector",
        event = "claude.approval_requested",
        request_id = %request_id,
        tool_name = %tool_name,
        tool_use_id = ?tool_use_id,
        "CLI requesting tool approval"
    );

    let decision = permissions.can_use_tool(tool_name, input.clone());
    let stdin_tx = stdin_tx.clone();
    tokio::spawn(async move {
        let result = decision.await;
        let reply = StdinMessage::ControlResponse {
            response: ControlResponsePayload::Success {
                request_id,
                response: permission_payload(&result, &input, tool_use_id.as_deref()),
            },
        };
        if let Err(e) = write_stdin_message(&stdin_tx, &reply).await {
            debug!(
                component = "claude_connector",
                event = "claude.approval.reply_dropped",
                error = %e,
                "CLI exited before the approval reply was written"
            );
        }
    });
}

/// Translate a decision into the `can_use_tool` response body the CLI expects.
fn permission_payload(
    result: &PermissionResult,
    original_input: &Value,
    tool_use_id: Option<&str>,
) -> Value {
    let mut payload = match result {
        PermissionResult::Allow { updated_input } => json!({
            "behavior": "allow",
            "updatedInput": updated_input.clone().unwrap_or_else(|| original_input.clone()),
        }),
        PermissionResult::Deny { message, interrupt } => json!({
            "behavior": "deny",
            "message": message,
            "interrupt": interrupt,
        }),
    };
    if let Some(id) = tool_use_id {
        payload["toolUseID"] = json!(id);
    }
    payload
}

/// Serialize and send a message to the stdin channel.
async fn write_stdin_message(
    stdin_tx: &mpsc::Sender<String>,
    msg: &StdinMessage,
) -> Result<(), ConnectorError> {
    let json = serde_json::to_string(msg)?;

    debug!(
        component = "claude_connector",
        event = "claude.stdin.write",
        payload_len = json.len(),
        "Writing to CLI stdin"
    );

    stdin_tx
        .send(json)
        .await
        .map_err(|_| ConnectorError::ChannelClosed)
}

/// Dedicated stdin writer task: reads from channel, writes to child stdin.
async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.write_error",
                error = %e,
                "Failed to write to CLI stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.flush_error",
                error = %e,
                "Failed to flush CLI stdin"
            );
            break;
        }
    }
    debug!(
        component = "claude_connector",
        event = "claude.stdin.closed",
        "Stdin writer task ended"
    );
}

/// CLI arguments for one invocation.
fn build_args(
    config: &ClaudeCliConfig,
    request: &InvocationRequest,
) -> Result<Vec<String>, ConnectorError> {
    let mut args: Vec<String> = [
        "--print",
        "--output-format",
        "stream-json",
        "--verbose",
        "--input-format",
        "stream-json",
        "--permission-prompt-tool",
        "stdio",
        "--permission-mode",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(config.permission_mode.clone());

    if config.include_partial_messages {
        args.push("--include-partial-messages".to_string());
    }
    if let Some(token) = &request.resume_token {
        args.push("--resume".to_string());
        args.push(token.clone());
    }
    if !request.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(request.allowed_tools.join(","));
    }
    if let Some(mcp) = mcp_config_json(&request.mcp_servers)? {
        args.push("--mcp-config".to_string());
        args.push(mcp);
    }
    Ok(args)
}

#[derive(Serialize)]
struct McpLaunch<'a> {
    command: &'a str,
    args: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<&'a BTreeMap<String, String>>,
}

/// `{"mcpServers": {...}}` for the enabled servers that carry a launch config.
fn mcp_config_json(servers: &[McpServer]) -> Result<Option<String>, ConnectorError> {
    let launches: BTreeMap<&str, McpLaunch<'_>> = servers
        .iter()
        .filter(|server| server.enabled)
        .filter_map(|server| {
            let config = server.config.as_ref()?;
            Some((
                server.id.as_str(),
                McpLaunch {
                    command: &config.command,
                    args: &config.args,
                    env: config.env.as_ref(),
                },
            ))
        })
        .collect();

    if launches.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&json!({ "mcpServers": launches }))?))
}

/// Resolve the claude binary path.
/// 1. Explicit configuration
/// 2. CLAUDE_BIN env var
/// 3. ~/.claude/local/claude
/// 4. Search PATH via `which`
fn resolve_claude_binary(explicit: Option<&str>) -> Result<String, ConnectorError> {
    if let Some(path) = explicit {
        if std::path::Path::new(path).exists() {
            return Ok(path.to_string());
        }
        return Err(ConnectorError::Spawn(format!(
            "Configured claude binary does not exist: {}",
            path
        )));
    }

    if let Ok(path) = std::env::var("CLAUDE_BIN") {
        if std::path::Path::new(&path).exists() {
            return Ok(path);
        }
        warn!(
            component = "claude_connector",
            event = "claude.binary.env_not_found",
            path = %path,
            "CLAUDE_BIN path does not exist, trying fallbacks"
        );
    }

    if let Ok(home) = std::env::var("HOME") {
        let local_path = format!("{}/.claude/local/claude", home);
        if std::path::Path::new(&local_path).exists() {
            return Ok(local_path);
        }
    }

    if let Ok(output) = std::process::Command::new("which").arg("claude").output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() && std::path::Path::new(&path).exists() {
                return Ok(path);
            }
        }
    }

    Err(ConnectorError::Spawn(
        "Claude CLI binary not found. Install Claude Code or set CLAUDE_BIN.".to_string(),
    ))
}
