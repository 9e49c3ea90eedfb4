// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Shell/CLI agent.
//!
//! Drives an external CLI runner (`node <bundle>/cli.js`) that emits
//! newline-delimited JSON events, while supervising long-running server
//! launches.  The supervision rules are the heart of this module: quick
//! server-launch tasks get a 3 s timeout so foreground `npm start`s are
//! promoted to tracked background processes fast, localhost claims in the
//! model's output are verified against real TCP reachability, and textual
//! management commands bypass the subprocess entirely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::procs::{extract_port_candidates, wait_for_any_port, ManagedProcess, ProcessManager};
use crate::{Agent, StatusTx, StepOutcome};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Quick server-launch tasks are cut short so promotion happens fast.
const QUICK_SERVER_LAUNCH_TIMEOUT: Duration = Duration::from_secs(3);
/// Ports a localhost claim must answer on within this window.
const LOCALHOST_CLAIM_WAIT: Duration = Duration::from_secs(15);
/// Window in which an already-running server is detected before promoting.
const ALREADY_RUNNING_PROBE: Duration = Duration::from_millis(1200);

/// Structured response from one CLI runner invocation.
#[derive(Debug, Clone, Default)]
pub struct CliResponse {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// One `tool_use` event, joined with its `tool_result` by id.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub tool_id: String,
    pub parameters: Value,
    pub result: Option<Value>,
    pub status: Option<String>,
    pub error: Option<Value>,
}

/// Seam over the subprocess so tests can script responses.
#[async_trait]
pub(crate) trait CliRunner: Send + Sync {
    async fn run(
        &self,
        task: &str,
        timeout: Duration,
        env: &HashMap<String, String>,
        status: Option<&StatusTx>,
    ) -> CliResponse;
}

/// Seam over the background process table so promotion is testable.
#[async_trait]
pub(crate) trait BackgroundProcesses: Send + Sync {
    async fn promote(
        &self,
        command: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        task: &str,
    ) -> anyhow::Result<(ManagedProcess, String)>;
    fn stop(&self, id: &str) -> bool;
    fn stop_all(&self) -> usize;
    fn list(&self) -> Vec<ManagedProcess>;
}

struct GlobalProcesses;

#[async_trait]
impl BackgroundProcesses for GlobalProcesses {
    async fn promote(
        &self,
        command: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        task: &str,
    ) -> anyhow::Result<(ManagedProcess, String)> {
        ProcessManager::global().start(command, cwd, env, task).await
    }
    fn stop(&self, id: &str) -> bool {
        ProcessManager::global().stop(id)
    }
    fn stop_all(&self) -> usize {
        ProcessManager::global().stop_all()
    }
    fn list(&self) -> Vec<ManagedProcess> {
        ProcessManager::global().list()
    }
}

/// Desktop control agent wrapping the external CLI runner.
pub struct CliAgent {
    cli_home: PathBuf,
    trusted_folders_path: PathBuf,
    default_timeout: Duration,
    claim_wait: Duration,
    status: Option<StatusTx>,
    runner: Box<dyn CliRunner>,
    procs: Box<dyn BackgroundProcesses>,
}

impl CliAgent {
    /// Build the agent around `<cli_root>/bundle/cli.js`.
    ///
    /// Fails fast when the bundle or the API key is missing: both are
    /// configuration errors, not runtime surprises.
    pub fn new(cli_root: impl Into<PathBuf>, model: Option<String>) -> anyhow::Result<Self> {
        let cli_root = cli_root.into();
        let cli_bin = cli_root.join("bundle").join("cli.js");
        if !cli_bin.is_file() {
            anyhow::bail!(
                "CLI runner not built: {} missing (run npm install && npm run build in {})",
                cli_bin.display(),
                cli_root.display()
            );
        }
        std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .context("GEMINI_API_KEY not set")?;

        let cli_home = cli_root.join(".clovis_cli_home");
        std::fs::create_dir_all(&cli_home)
            .with_context(|| format!("creating CLI home {}", cli_home.display()))?;
        let trusted_folders_path = write_trusted_folders(&cli_root)?;

        let runner = SubprocessRunner {
            cli_bin,
            workspace_dirs: workspace_dirs(),
            model,
        };
        Ok(Self {
            cli_home,
            trusted_folders_path,
            default_timeout: DEFAULT_TIMEOUT,
            claim_wait: LOCALHOST_CLAIM_WAIT,
            status: None,
            runner: Box::new(runner),
            procs: Box::new(GlobalProcesses),
        })
    }

    pub fn with_status(mut self, status: StatusTx) -> Self {
        self.status = Some(status);
        self
    }

    #[cfg(test)]
    fn for_test(runner: Box<dyn CliRunner>, procs: Box<dyn BackgroundProcesses>) -> Self {
        Self {
            cli_home: std::env::temp_dir(),
            trusted_folders_path: std::env::temp_dir().join("trusted.json"),
            default_timeout: DEFAULT_TIMEOUT,
            claim_wait: Duration::from_millis(200),
            status: None,
            runner,
            procs,
        }
    }

    /// Environment for both the CLI subprocess and promoted servers: the
    /// permissive policy flag, the trusted-folders file so the runner does
    /// not downgrade its approval mode in untrusted paths, and a writable
    /// CLI home.  The API key requirement is enforced in `new()`.
    fn build_cli_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.insert("CLOVIS_CLI_PERMISSIVE_POLICY".into(), "1".into());
        env.insert(
            "GEMINI_CLI_TRUSTED_FOLDERS_PATH".into(),
            self.trusted_folders_path.display().to_string(),
        );
        env.insert("GEMINI_CLI_HOME".into(), self.cli_home.display().to_string());
        env.insert("GEMINI_SANDBOX".into(), "false".into());
        env
    }

    /// Execute a CLI task with the full supervision pipeline.
    pub async fn execute_task(&self, task: &str, timeout: Duration) -> CliResponse {
        match self.execute_inner(task, timeout).await {
            Ok(response) => response,
            Err(e) => CliResponse {
                success: false,
                output: String::new(),
                error: Some(e.to_string()),
                tool_calls: Vec::new(),
            },
        }
    }

    async fn execute_inner(&self, task: &str, timeout: Duration) -> anyhow::Result<CliResponse> {
        if let Some(managed) = self.handle_background_management_task(task).await {
            return Ok(managed);
        }

        // Explicit server-like command with background intent: bypass the
        // model entirely and launch it as a tracked background process.
        if let Some(command) = extract_explicit_shell_command(task) {
            if is_background_intent_task(task, &command) {
                let env = self.build_cli_env();
                let cwd = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
                let (_record, summary) = self.procs.promote(&command, &cwd, &env, task).await?;
                return Ok(CliResponse {
                    success: true,
                    output: summary,
                    error: None,
                    tool_calls: Vec::new(),
                });
            }
        }

        let env = self.build_cli_env();
        let mut run_timeout = timeout;
        let mut short_timeout_applied = false;
        if is_quick_server_launch_task(task) {
            run_timeout = run_timeout.min(QUICK_SERVER_LAUNCH_TIMEOUT);
            short_timeout_applied = run_timeout < timeout;
        }

        let prepared = prepare_cli_task(task);
        let mut response = self
            .runner
            .run(&prepared, run_timeout, &env, self.status.as_ref())
            .await;

        // Short timeout fired before any tool execution: retry once at the
        // full timeout so setup-heavy tasks can proceed.
        if short_timeout_applied
            && is_timeout_error_text(response.error.as_deref())
            && response.tool_calls.is_empty()
        {
            response = self
                .runner
                .run(&prepared, timeout, &env, self.status.as_ref())
                .await;
        }

        // The model answered "run this yourself": retry once with stronger
        // execution-only instructions.
        if response.success
            && response.tool_calls.is_empty()
            && looks_like_execution_refusal(&response.output)
        {
            let retry = prepare_retry_task(task);
            response = self
                .runner
                .run(&retry, run_timeout, &env, self.status.as_ref())
                .await;
        }

        // A server-like launch in the tool trace is persisted before it can
        // die with the turn.
        if !response.tool_calls.is_empty() {
            if let Some(promoted) = self
                .maybe_promote_server_launch(task, &response, &env)
                .await
            {
                return Ok(promoted);
            }
        }

        if let Some(claim_error) =
            validate_local_server_claim(&response.output, self.claim_wait).await
        {
            // Last chance: one more promotion pass before failing the chain
            // on localhost reachability.
            if !response.tool_calls.is_empty() {
                if let Some(promoted) = self
                    .maybe_promote_server_launch(task, &response, &env)
                    .await
                {
                    return Ok(promoted);
                }
            }
            return Ok(CliResponse {
                success: false,
                output: response.output,
                error: Some(claim_error),
                tool_calls: response.tool_calls,
            });
        }

        Ok(response)
    }

    /// Textual background-management commands never reach the subprocess.
    async fn handle_background_management_task(&self, task: &str) -> Option<CliResponse> {
        let lower = task.trim().to_lowercase();

        if lower.contains("list background process") || lower.contains("show background process") {
            let rows = self.procs.list();
            let output = if rows.is_empty() {
                "No managed background processes.".to_string()
            } else {
                let lines: Vec<String> = rows
                    .iter()
                    .map(|r| {
                        format!(
                            "{} pid={} port={} uptime={}s cmd={}",
                            r.id,
                            r.pid,
                            r.active_port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                            r.uptime_seconds(),
                            r.command
                        )
                    })
                    .collect();
                format!("Managed background processes:\n{}", lines.join("\n"))
            };
            return Some(CliResponse { success: true, output, ..Default::default() });
        }

        if lower.contains("stop all background process") || lower.contains("kill all background process") {
            let count = self.procs.stop_all();
            return Some(CliResponse {
                success: true,
                output: format!("Stopped {count} background process(es)."),
                ..Default::default()
            });
        }

        static STOP_ONE: OnceLock<Regex> = OnceLock::new();
        let re = STOP_ONE.get_or_init(|| {
            Regex::new(r"(?i)(?:stop|kill)\s+background\s+process\s+([a-zA-Z0-9_-]+)").unwrap()
        });
        if let Some(cap) = re.captures(task) {
            let id = cap[1].trim().to_string();
            return Some(if self.procs.stop(&id) {
                CliResponse {
                    success: true,
                    output: format!("Stopped background process {id}."),
                    ..Default::default()
                }
            } else {
                CliResponse {
                    success: false,
                    error: Some(format!("No background process found: {id}")),
                    ..Default::default()
                }
            });
        }

        None
    }

    /// When the tool trace contains a server-like launch, persist it.
    ///
    /// If the claimed port already answers, a timed-out run is converted to
    /// success (the server is up); an untroubled run is left alone.
    async fn maybe_promote_server_launch(
        &self,
        task: &str,
        response: &CliResponse,
        env: &HashMap<String, String>,
    ) -> Option<CliResponse> {
        let launch = infer_server_launch_from_tool_calls(&response.tool_calls)?;

        let combined = format!("{task}\n{}\n{}", response.output, launch.command);
        let ports = extract_port_candidates(&combined);
        if !ports.is_empty() {
            if let Some(port) = wait_for_any_port(&ports, ALREADY_RUNNING_PROBE).await {
                if is_timeout_error_text(response.error.as_deref()) {
                    let note = format!("Local server is reachable on http://127.0.0.1:{port}.");
                    return Some(CliResponse {
                        success: true,
                        output: clean_join_text(&[response.output.as_str(), note.as_str()]),
                        error: None,
                        tool_calls: response.tool_calls.clone(),
                    });
                }
                return None;
            }
        }

        let (_record, summary) = match self
            .procs
            .promote(&launch.command, &launch.cwd, env, task)
            .await
        {
            Ok(started) => started,
            Err(e) => {
                warn!("background promotion failed: {e}");
                return None;
            }
        };

        Some(CliResponse {
            success: true,
            output: clean_join_text(&[response.output.as_str(), summary.as_str()]),
            error: None,
            tool_calls: response.tool_calls.clone(),
        })
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn source(&self) -> &'static str {
        "cua_cli"
    }

    async fn execute(&self, task: &str) -> StepOutcome {
        let response = self.execute_task(task, self.default_timeout).await;
        if response.success {
            let message = if response.output.trim().is_empty() {
                "CLI task completed.".to_string()
            } else {
                response.output
            };
            StepOutcome::ok(self.source(), message)
        } else {
            let message = response
                .error
                .unwrap_or_else(|| "CLI task failed".to_string());
            StepOutcome::failed(self.source(), message)
        }
    }
}

// ─── Task preparation ─────────────────────────────────────────────────────────

fn prepare_cli_task(task: &str) -> String {
    let instruction = "You are running inside CLOVIS with tool access enabled. \
        Execute the request directly using tools/shell commands instead of giving manual instructions. \
        Do not claim you cannot access the system. \
        If a command is blocked by policy or fails, report the exact command and exact error. \
        For long-running local servers, never run foreground. \
        Launch detached with nohup/background so it stays alive after this turn, \
        then verify localhost/port reachability before claiming success.";
    format!("{instruction}\n\nTask:\n{task}")
}

fn prepare_retry_task(task: &str) -> String {
    let instruction = "Your previous response incorrectly refused execution. \
        You MUST execute the task now using tools (run_shell_command, file tools, etc.). \
        Do not provide a 'run this in terminal' suggestion. \
        Return what you executed and outcome.";
    format!("{instruction}\n\nTask:\n{task}")
}

fn clean_join_text(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

// ─── Command classification ───────────────────────────────────────────────────

/// Explicit command given in the task: a backticked snippet, a `command:`
/// line, or a bare "run/start/launch <cmd>" line with a known runner token.
pub(crate) fn extract_explicit_shell_command(task: &str) -> Option<String> {
    if task.is_empty() {
        return None;
    }

    static BACKTICK: OnceLock<Regex> = OnceLock::new();
    let backtick = BACKTICK.get_or_init(|| Regex::new(r"(?s)`([^`]+)`").unwrap());
    if let Some(cap) = backtick.captures(task) {
        let command = cap[1].trim();
        if !command.is_empty() {
            return Some(command.to_string());
        }
    }

    static PREFIXED: OnceLock<Regex> = OnceLock::new();
    let prefixed = PREFIXED.get_or_init(|| {
        Regex::new(r"(?im)(?:^|\n)\s*command\s*:\s*(.+)$").unwrap()
    });
    if let Some(cap) = prefixed.captures(task) {
        let command = cap[1].trim();
        if !command.is_empty() {
            return Some(command.to_string());
        }
    }

    static RUN_LINE: OnceLock<Regex> = OnceLock::new();
    let run_line = RUN_LINE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:run|start|launch)\s+(.+)$").unwrap()
    });
    if let Some(cap) = run_line.captures(task.trim()) {
        let candidate = cap[1].trim();
        let known = ["npm ", "pnpm ", "yarn ", "python", "uvicorn", "node ", "flask"];
        if known.iter().any(|token| candidate.contains(token)) {
            return Some(candidate.to_string());
        }
    }

    None
}

fn server_like_regexes() -> &'static Vec<Regex> {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r"\bnpm\s+run\s+(dev|start|serve)\b",
            r"\bnpm\s+(start|serve)\b",
            r"\bpnpm\s+(dev|start|serve)\b",
            r"\byarn\s+(dev|start|serve)\b",
            r"\bnext\s+dev\b",
            r"\bvite\b",
            r"\bwebpack-dev-server\b",
            r"\buvicorn\b",
            r"\bflask\s+run\b",
            r"\bpython(?:3)?\s+-m\s+http\.server\b",
            r"\bnode\s+.+\b(server|dev)\b",
            r"\bgunicorn\b",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

pub(crate) fn is_server_like_command(command: &str) -> bool {
    let lowered = command.to_lowercase();
    server_like_regexes().iter().any(|re| re.is_match(&lowered))
}

/// Background intent: the command is server-like, or the task text carries
/// markers of a long-running expectation.
pub(crate) fn is_background_intent_task(task: &str, command: &str) -> bool {
    if is_server_like_command(command) {
        return true;
    }
    let text = task.to_lowercase();
    [
        "localhost",
        "port ",
        "dev server",
        "web server",
        "api server",
        "keep running",
        "background",
        "until i stop",
    ]
    .iter()
    .any(|marker| text.contains(marker))
}

fn is_server_intent_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    if lowered.is_empty() {
        return false;
    }
    let markers = [
        "localhost",
        "127.0.0.1",
        "local server",
        "dev server",
        "web server",
        "api server",
        "npm start",
        "npm run dev",
        "pnpm dev",
        "yarn dev",
        "uvicorn",
        "flask run",
    ];
    if markers.iter().any(|m| lowered.contains(m)) {
        return true;
    }
    is_server_like_command(&lowered)
}

/// True only when the request is primarily "start/run an existing local
/// server".  Setup-heavy tasks (clone/install/build) keep the full timeout.
pub(crate) fn is_quick_server_launch_task(text: &str) -> bool {
    let lowered = text.to_lowercase();
    if lowered.is_empty() {
        return false;
    }
    let setup_markers = [
        "clone", "git ", "install", "dependency", "dependencies", "setup", "set up",
        "bootstrap", "scaffold", "build", "compile", "create", "download",
        "npm ci", "pip install", "pnpm install", "yarn install",
    ];
    if setup_markers.iter().any(|m| lowered.contains(m)) {
        return false;
    }
    is_server_intent_text(&lowered)
}

// ─── Server-launch inference ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServerLaunch {
    pub command: String,
    pub cwd: PathBuf,
}

fn resolve_shell_path(path_expr: &str, base: &Path) -> PathBuf {
    let trimmed = path_expr.trim().trim_matches(|c| c == '\'' || c == '"');
    let expanded = shellexpand::full(trimmed)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| trimmed.to_string());
    let candidate = PathBuf::from(expanded);
    if candidate.is_absolute() {
        candidate
    } else {
        base.join(candidate)
    }
}

/// The actual server segment of a chained command: last server-like piece
/// of an `a && b && c` chain.
fn extract_server_subcommand(command: &str) -> String {
    command
        .split("&&")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .find(|segment| is_server_like_command(segment))
        .unwrap_or(command.trim())
        .to_string()
}

fn extract_shell_command_from_tool_call(call: &ToolCallRecord) -> Option<String> {
    let name = call.tool_name.trim().to_lowercase();
    if !matches!(name.as_str(), "run_shell_command" | "shell" | "bash") {
        return None;
    }
    let params = call.parameters.as_object()?;
    let raw = params
        .get("command")
        .or_else(|| params.get("cmd"))
        .or_else(|| params.get("script"))?;
    let command = raw.as_str()?.trim();
    if command.is_empty() {
        None
    } else {
        Some(command.to_string())
    }
}

/// Walk the tool trace, honoring chained `cd` steps against a rolling cwd,
/// and return the last server-like launch with its resolved directory.
pub(crate) fn infer_server_launch_from_tool_calls(
    tool_calls: &[ToolCallRecord],
) -> Option<ServerLaunch> {
    if tool_calls.is_empty() {
        return None;
    }

    static CD_CHAIN: OnceLock<Regex> = OnceLock::new();
    let cd_chain = CD_CHAIN.get_or_init(|| {
        Regex::new(r"(?is)^\s*cd\s+([^;&|]+?)\s*&&\s*(.+)$").unwrap()
    });
    static CD_ONLY: OnceLock<Regex> = OnceLock::new();
    let cd_only = CD_ONLY.get_or_init(|| Regex::new(r"(?is)^\s*cd\s+(.+?)\s*$").unwrap());

    let mut current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let mut candidate: Option<ServerLaunch> = None;

    for call in tool_calls {
        if call.status.as_deref() == Some("error") {
            continue;
        }
        let command = match extract_shell_command_from_tool_call(call) {
            Some(c) => c,
            None => continue,
        };

        if let Some(cap) = cd_chain.captures(&command) {
            current_dir = resolve_shell_path(&cap[1], &current_dir);
            let remaining = cap[2].trim();
            if is_server_like_command(remaining) {
                candidate = Some(ServerLaunch {
                    command: extract_server_subcommand(remaining),
                    cwd: current_dir.clone(),
                });
            }
            continue;
        }

        if let Some(cap) = cd_only.captures(&command) {
            current_dir = resolve_shell_path(&cap[1], &current_dir);
            continue;
        }

        if is_server_like_command(&command) {
            candidate = Some(ServerLaunch {
                command: extract_server_subcommand(&command),
                cwd: current_dir.clone(),
            });
        }
    }

    candidate
}

// ─── Output validation ────────────────────────────────────────────────────────

pub(crate) fn is_timeout_error_text(text: Option<&str>) -> bool {
    let lowered = text.unwrap_or_default().to_lowercase();
    lowered.contains("timed out") || lowered.contains("timeout")
}

fn refusal_regexes() -> &'static Vec<Regex> {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r"\bi (?:am|do not have|don't have).{0,30}\b(?:ability|access|permission)\b",
            r"\bi cannot\b.{0,40}\b(?:run|execute|create|move|delete|modify)\b",
            r"\bi can (?:however )?provide (?:you )?with (?:the )?commands\b",
            r"\brun (?:the|this) command in your terminal\b",
            r"\bi(?:'m| am) unable to execute shell commands\b",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

pub(crate) fn looks_like_execution_refusal(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    refusal_regexes().iter().any(|re| re.is_match(&lowered))
}

/// When the output claims a local server is running, verify one of the
/// mentioned ports actually answers within `wait`.  Returns the failure
/// text when the claim does not hold.
pub(crate) async fn validate_local_server_claim(output: &str, wait: Duration) -> Option<String> {
    if output.is_empty() {
        return None;
    }
    let lowered = output.to_lowercase();
    let has_localhost_hint = lowered.contains("localhost")
        || lowered.contains("127.0.0.1")
        || lowered.contains("port ");
    let has_running_hint = ["running", "started", "listening", "serving", "available at"]
        .iter()
        .any(|w| lowered.contains(w));
    if !(has_localhost_hint && has_running_hint) {
        return None;
    }

    let ports = extract_port_candidates(output);
    if ports.is_empty() {
        return None;
    }
    if wait_for_any_port(&ports, wait).await.is_some() {
        return None;
    }
    Some(format!(
        "Task reported a local server as running, but none of the claimed ports are reachable: \
         {ports:?}. The process likely exited or never started successfully."
    ))
}

// ─── Status strings ───────────────────────────────────────────────────────────

fn safe_preview(value: &str, max_len: usize) -> String {
    let text = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.len() > max_len {
        format!("{}...", &text[..max_len.saturating_sub(3)])
    } else {
        text
    }
}

fn friendly(name: &str) -> String {
    name.replace('_', " ")
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_tool_status(tool_name: &str, parameters: &Value) -> String {
    let name = tool_name.trim();
    let get = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .filter_map(|k| parameters.get(k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(String::from)
    };

    match name {
        "run_shell_command" | "shell" | "bash" => match get(&["command", "cmd", "script"]) {
            Some(cmd) => format!("Running command: {}", safe_preview(&cmd, 72)),
            None => "Running shell command...".into(),
        },
        "read_file" | "read_many_files" => match get(&["file_path", "path"]) {
            Some(path) => format!("Reading file: {}", safe_preview(&path, 80)),
            None => "Reading files...".into(),
        },
        "write_file" | "edit" => match get(&["file_path", "path"]) {
            Some(path) => format!("Updating file: {}", safe_preview(&path, 80)),
            None => "Updating files...".into(),
        },
        "ls" | "glob" | "grep" | "ripgrep" => match get(&["path", "query"]) {
            Some(q) => format!("{}: {}", title_case(&friendly(name)), safe_preview(&q, 80)),
            None => format!("{}...", title_case(&friendly(name))),
        },
        _ => format!("Using {}...", friendly(name)),
    }
}

/// Human-readable status for one stream-json event, tracking tool names by
/// id so results can name the tool that produced them.
fn status_from_stream_event(event: &Value, tool_by_id: &mut HashMap<String, String>) -> Option<String> {
    let event_type = event.get("type")?.as_str()?;
    match event_type {
        "init" => Some("CLI session started...".into()),
        "tool_use" => {
            let tool_name = event
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string();
            if let Some(id) = event.get("tool_id").and_then(Value::as_str) {
                if !id.is_empty() {
                    tool_by_id.insert(id.to_string(), tool_name.clone());
                }
            }
            let params = event.get("parameters").cloned().unwrap_or(Value::Null);
            Some(format_tool_status(&tool_name, &params))
        }
        "tool_result" => {
            let tool_id = event
                .get("tool_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let tool_name = tool_by_id
                .get(tool_id)
                .cloned()
                .unwrap_or_else(|| "tool".into());
            if event.get("status").and_then(Value::as_str) == Some("error") {
                let err_msg = match event.get("error") {
                    Some(Value::Object(o)) => o
                        .get("message")
                        .and_then(Value::as_str)
                        .map(|m| safe_preview(m, 72)),
                    Some(Value::String(s)) => Some(safe_preview(s, 72)),
                    _ => None,
                };
                Some(match err_msg.filter(|m| !m.is_empty()) {
                    Some(m) => format!("{} failed: {m}", title_case(&friendly(&tool_name))),
                    None => format!("{} failed.", title_case(&friendly(&tool_name))),
                })
            } else {
                Some(format!("Finished {}.", friendly(&tool_name)))
            }
        }
        "error" => {
            let msg = event
                .get("message")
                .and_then(Value::as_str)
                .map(|m| safe_preview(m, 96))
                .filter(|m| !m.is_empty());
            Some(match msg {
                Some(m) => format!("CLI error: {m}"),
                None => "CLI error.".into(),
            })
        }
        "result" => {
            if event.get("status").and_then(Value::as_str) == Some("success") {
                Some("Finalizing CLI response...".into())
            } else {
                let err_msg = match event.get("error") {
                    Some(Value::Object(o)) => o
                        .get("message")
                        .and_then(Value::as_str)
                        .map(|m| safe_preview(m, 80)),
                    Some(Value::String(s)) => Some(safe_preview(s, 80)),
                    _ => None,
                };
                Some(match err_msg.filter(|m| !m.is_empty()) {
                    Some(m) => format!("CLI task failed: {m}"),
                    None => "CLI task failed.".into(),
                })
            }
        }
        _ => None,
    }
}

// ─── Stream parsing ───────────────────────────────────────────────────────────

/// Parse stream-json output (newline-delimited JSON events) into a
/// structured response.  Non-JSON lines are debug output and skipped.
pub(crate) fn parse_stream_json(stdout: &str, stderr: &str, exit_code: Option<i32>) -> CliResponse {
    let mut output_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
    let mut error: Option<String> = None;

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        match event.get("type").and_then(Value::as_str) {
            Some("message") => {
                if event.get("role").and_then(Value::as_str) == Some("assistant") {
                    if let Some(content) = event.get("content").and_then(Value::as_str) {
                        if !content.is_empty() {
                            output_parts.push(content.to_string());
                        }
                    }
                }
            }
            Some("tool_use") => {
                tool_calls.push(ToolCallRecord {
                    tool_name: event
                        .get("tool_name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    tool_id: event
                        .get("tool_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    parameters: event.get("parameters").cloned().unwrap_or(Value::Null),
                    result: None,
                    status: None,
                    error: None,
                });
            }
            Some("tool_result") => {
                let tool_id = event
                    .get("tool_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                for call in tool_calls.iter_mut().filter(|c| c.tool_id == tool_id) {
                    call.result = event.get("output").cloned();
                    call.status = event
                        .get("status")
                        .and_then(Value::as_str)
                        .map(String::from);
                    call.error = event.get("error").cloned();
                }
            }
            Some("error") => {
                error = Some(
                    event
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown error")
                        .to_string(),
                );
            }
            Some("result") => {
                if event.get("status").and_then(Value::as_str) != Some("success") {
                    error = Some(
                        event
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("Task failed")
                            .to_string(),
                    );
                }
            }
            _ => {}
        }
    }

    let exit_ok = exit_code == Some(0);
    let fallback_error = if !exit_ok && !stderr.is_empty() {
        Some(stderr.to_string())
    } else {
        None
    };
    CliResponse {
        success: exit_ok && error.is_none(),
        output: output_parts.concat(),
        error: error.or(fallback_error),
        tool_calls,
    }
}

// ─── Subprocess runner ────────────────────────────────────────────────────────

struct SubprocessRunner {
    cli_bin: PathBuf,
    workspace_dirs: Vec<PathBuf>,
    model: Option<String>,
}

impl SubprocessRunner {
    fn build_argv(&self, task: &str) -> Vec<String> {
        let mut argv = vec![
            self.cli_bin.display().to_string(),
            "--prompt".into(),
            task.into(),
            "--output-format".into(),
            "stream-json".into(),
            "--approval-mode".into(),
            "yolo".into(),
        ];
        for dir in &self.workspace_dirs {
            argv.push("--include-directories".into());
            argv.push(dir.display().to_string());
        }
        if let Some(model) = &self.model {
            argv.push("--model".into());
            argv.push(model.clone());
        }
        argv
    }
}

#[async_trait]
impl CliRunner for SubprocessRunner {
    async fn run(
        &self,
        task: &str,
        timeout: Duration,
        env: &HashMap<String, String>,
        status: Option<&StatusTx>,
    ) -> CliResponse {
        let argv = self.build_argv(task);
        let mut cmd = Command::new("node");
        cmd.args(&argv)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(bin = %self.cli_bin.display(), "launching CLI runner");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CliResponse {
                    success: false,
                    error: Some(format!("failed to launch CLI runner: {e}")),
                    ..Default::default()
                };
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let status_tx = status.cloned();

        let stdout_task = tokio::spawn(async move {
            let mut lines_out: Vec<String> = Vec::new();
            let mut tool_by_id: HashMap<String, String> = HashMap::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let (Some(tx), Ok(event)) =
                        (&status_tx, serde_json::from_str::<Value>(&line))
                    {
                        if let Some(text) = status_from_stream_event(&event, &mut tool_by_id) {
                            let _ = tx.send(text).await;
                        }
                    }
                    lines_out.push(line);
                }
            }
            lines_out
        });
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    text.push_str(&line);
                    text.push('\n');
                }
            }
            text
        });

        let mut timed_out = false;
        let exit_code = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!("CLI runner wait failed: {e}");
                None
            }
            Err(_) => {
                timed_out = true;
                let _ = child.kill().await;
                let _ = child.wait().await;
                None
            }
        };

        // Reader tasks are awaited to completion with errors suppressed.
        let stdout_text = stdout_task.await.unwrap_or_default().join("\n");
        let stderr_text = stderr_task.await.unwrap_or_default();

        let mut response = parse_stream_json(&stdout_text, &stderr_text, exit_code);
        if timed_out {
            let timeout_msg = format!("CLI task timed out after {} seconds", timeout.as_secs());
            response.success = false;
            response.error = Some(match response.error.take() {
                Some(prior) => clean_join_text(&[prior.as_str(), timeout_msg.as_str()]),
                None => timeout_msg,
            });
        }
        response
    }
}

fn workspace_dirs() -> Vec<PathBuf> {
    let mut dirs_out: Vec<PathBuf> = Vec::new();
    let mut push = |p: Option<PathBuf>| {
        if let Some(p) = p {
            if p.exists() && !dirs_out.contains(&p) {
                dirs_out.push(p);
            }
        }
    };
    push(std::env::current_dir().ok());
    push(dirs::home_dir());
    push(dirs::home_dir().map(|h| h.join("Desktop")));
    push(Some(PathBuf::from("/tmp")));
    dirs_out
}

/// Mark the working directories as trusted so the CLI runner keeps its
/// yolo approval mode in non-interactive runs.
fn write_trusted_folders(cli_root: &Path) -> anyhow::Result<PathBuf> {
    let path = std::env::temp_dir().join("clovis_cli_trusted_folders.json");
    let mut entries = serde_json::Map::new();
    let mut add = |p: Option<PathBuf>| {
        if let Some(p) = p {
            entries.insert(p.display().to_string(), Value::String("TRUST_FOLDER".into()));
        }
    };
    add(Some(cli_root.to_path_buf()));
    add(std::env::current_dir().ok());
    add(dirs::home_dir());
    std::fs::write(&path, serde_json::to_string_pretty(&Value::Object(entries))?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    fn tool_call(name: &str, command: &str, status: Option<&str>) -> ToolCallRecord {
        ToolCallRecord {
            tool_name: name.into(),
            tool_id: "t-1".into(),
            parameters: json!({ "command": command }),
            result: None,
            status: status.map(String::from),
            error: None,
        }
    }

    // ── Command classification ────────────────────────────────────────────────

    #[test]
    fn backticked_command_is_extracted() {
        assert_eq!(
            extract_explicit_shell_command("run this: `npm run dev`").as_deref(),
            Some("npm run dev")
        );
    }

    #[test]
    fn command_prefix_line_is_extracted() {
        let task = "please do\ncommand: python3 -m http.server 8080";
        assert_eq!(
            extract_explicit_shell_command(task).as_deref(),
            Some("python3 -m http.server 8080")
        );
    }

    #[test]
    fn bare_run_line_requires_known_runner() {
        assert_eq!(
            extract_explicit_shell_command("run npm start").as_deref(),
            Some("npm start")
        );
        assert!(extract_explicit_shell_command("run the dishwasher").is_none());
    }

    #[test]
    fn server_like_commands_match() {
        for cmd in [
            "npm run dev",
            "npm start",
            "pnpm dev",
            "yarn serve",
            "next dev",
            "vite",
            "webpack-dev-server",
            "uvicorn app:app",
            "flask run",
            "python3 -m http.server",
            "node scripts/server.js",
            "gunicorn app:app",
        ] {
            assert!(is_server_like_command(cmd), "{cmd} should be server-like");
        }
        assert!(!is_server_like_command("ls -la"));
        assert!(!is_server_like_command("npm install"));
    }

    #[test]
    fn quick_server_launch_excludes_setup_tasks() {
        assert!(is_quick_server_launch_task("run npm start in ~/Desktop/demo-app"));
        assert!(!is_quick_server_launch_task(
            "Clone repo, run npm install, then npm start on localhost"
        ));
        assert!(!is_quick_server_launch_task("what is 2+2"));
    }

    #[test]
    fn background_intent_from_markers_or_command() {
        assert!(is_background_intent_task("keep running forever", "sleep 30"));
        assert!(is_background_intent_task("start it", "npm run dev"));
        assert!(!is_background_intent_task("list files", "ls"));
    }

    // ── Launch inference ──────────────────────────────────────────────────────

    #[test]
    fn cd_chain_resolves_cwd_and_server_subcommand() {
        let calls = vec![tool_call(
            "run_shell_command",
            "cd /tmp/demo-app && npm install && npm run dev",
            Some("success"),
        )];
        let launch = infer_server_launch_from_tool_calls(&calls).unwrap();
        assert_eq!(launch.command, "npm run dev");
        assert_eq!(launch.cwd, PathBuf::from("/tmp/demo-app"));
    }

    #[test]
    fn cd_only_steps_update_rolling_cwd() {
        let calls = vec![
            tool_call("shell", "cd /tmp", Some("success")),
            tool_call("shell", "cd demo", Some("success")),
            tool_call("shell", "npm start", Some("success")),
        ];
        let launch = infer_server_launch_from_tool_calls(&calls).unwrap();
        assert_eq!(launch.command, "npm start");
        assert_eq!(launch.cwd, PathBuf::from("/tmp/demo"));
    }

    #[test]
    fn errored_tool_calls_are_skipped() {
        let calls = vec![tool_call("shell", "npm run dev", Some("error"))];
        assert!(infer_server_launch_from_tool_calls(&calls).is_none());
    }

    #[test]
    fn non_shell_tools_are_ignored() {
        let calls = vec![ToolCallRecord {
            tool_name: "write_file".into(),
            tool_id: "t".into(),
            parameters: json!({ "command": "npm run dev" }),
            result: None,
            status: None,
            error: None,
        }];
        assert!(infer_server_launch_from_tool_calls(&calls).is_none());
    }

    #[test]
    fn tilde_in_cd_target_is_expanded() {
        let calls = vec![tool_call(
            "run_shell_command",
            "cd ~/demo-app && npm start",
            Some("success"),
        )];
        let launch = infer_server_launch_from_tool_calls(&calls).unwrap();
        assert!(launch.cwd.is_absolute());
        assert!(launch.cwd.ends_with("demo-app"));
    }

    // ── Refusal / timeout text ────────────────────────────────────────────────

    #[test]
    fn refusal_phrases_are_detected() {
        assert!(looks_like_execution_refusal(
            "I cannot run commands on your system, but I can provide you with the commands."
        ));
        assert!(looks_like_execution_refusal(
            "Please run this command in your terminal: npm start"
        ));
        assert!(!looks_like_execution_refusal("Created folder hw on the desktop."));
    }

    #[test]
    fn timeout_text_detection() {
        assert!(is_timeout_error_text(Some("CLI task timed out after 3 seconds")));
        assert!(!is_timeout_error_text(Some("permission denied")));
        assert!(!is_timeout_error_text(None));
    }

    // ── Stream parsing ────────────────────────────────────────────────────────

    #[test]
    fn stream_json_joins_messages_and_tool_results() {
        let stdout = [
            r#"{"type":"init","session":"s1"}"#,
            r#"{"type":"message","role":"assistant","content":"Cloning now. "}"#,
            r#"{"type":"tool_use","tool_name":"run_shell_command","tool_id":"a1","parameters":{"command":"git clone x"}}"#,
            r#"{"type":"tool_result","tool_id":"a1","status":"success","output":"done"}"#,
            r#"{"type":"message","role":"assistant","content":"Repo cloned."}"#,
            "not json debug line",
            r#"{"type":"result","status":"success"}"#,
        ]
        .join("\n");
        let r = parse_stream_json(&stdout, "", Some(0));
        assert!(r.success);
        assert_eq!(r.output, "Cloning now. Repo cloned.");
        assert_eq!(r.tool_calls.len(), 1);
        assert_eq!(r.tool_calls[0].status.as_deref(), Some("success"));
        assert_eq!(r.tool_calls[0].result, Some(json!("done")));
    }

    #[test]
    fn stream_json_error_event_fails_the_run() {
        let stdout = r#"{"type":"error","message":"quota exceeded"}"#;
        let r = parse_stream_json(stdout, "", Some(0));
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn stream_json_nonzero_exit_uses_stderr() {
        let r = parse_stream_json("", "node: not found\n", Some(127));
        assert!(!r.success);
        assert!(r.error.unwrap().contains("not found"));
    }

    // ── Status strings ────────────────────────────────────────────────────────

    #[test]
    fn tool_use_status_previews_command() {
        let mut tool_by_id = HashMap::new();
        let event = json!({
            "type": "tool_use",
            "tool_name": "run_shell_command",
            "tool_id": "x1",
            "parameters": { "command": "npm run dev" }
        });
        let status = status_from_stream_event(&event, &mut tool_by_id).unwrap();
        assert_eq!(status, "Running command: npm run dev");
        assert_eq!(tool_by_id.get("x1").map(String::as_str), Some("run_shell_command"));
    }

    #[test]
    fn long_command_preview_is_truncated() {
        let long = "x".repeat(200);
        let event = json!({
            "type": "tool_use",
            "tool_name": "shell",
            "parameters": { "command": long }
        });
        let status = status_from_stream_event(&event, &mut HashMap::new()).unwrap();
        assert!(status.len() < 100);
        assert!(status.ends_with("..."));
    }

    #[test]
    fn tool_result_status_names_the_tool() {
        let mut tool_by_id = HashMap::new();
        tool_by_id.insert("a1".to_string(), "read_file".to_string());
        let ok = json!({ "type": "tool_result", "tool_id": "a1", "status": "success" });
        assert_eq!(
            status_from_stream_event(&ok, &mut tool_by_id).unwrap(),
            "Finished read file."
        );
        let err = json!({
            "type": "tool_result", "tool_id": "a1", "status": "error",
            "error": { "message": "no such file" }
        });
        assert_eq!(
            status_from_stream_event(&err, &mut tool_by_id).unwrap(),
            "Read File failed: no such file"
        );
    }

    // ── Supervision pipeline ──────────────────────────────────────────────────

    struct ScriptedRunner {
        responses: Mutex<Vec<CliResponse>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(responses: Vec<CliResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CliRunner for ScriptedRunner {
        async fn run(
            &self,
            task: &str,
            _timeout: Duration,
            _env: &HashMap<String, String>,
            _status: Option<&StatusTx>,
        ) -> CliResponse {
            self.calls.lock().unwrap().push(task.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                CliResponse { success: true, output: "ok".into(), ..Default::default() }
            } else {
                responses.remove(0)
            }
        }
    }

    /// Fake promotion: binds a listener on the claimed port so reachability
    /// checks pass, exactly like a freshly started dev server would.
    struct FakeProcs {
        listeners: Mutex<Vec<tokio::net::TcpListener>>,
        bind_port: Option<u16>,
        promoted: Mutex<Vec<String>>,
    }

    impl FakeProcs {
        fn new(bind_port: Option<u16>) -> Self {
            Self {
                listeners: Mutex::new(Vec::new()),
                bind_port,
                promoted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BackgroundProcesses for FakeProcs {
        async fn promote(
            &self,
            command: &str,
            cwd: &Path,
            _env: &HashMap<String, String>,
            task: &str,
        ) -> anyhow::Result<(ManagedProcess, String)> {
            self.promoted.lock().unwrap().push(command.to_string());
            let mut active_port = None;
            if let Some(port) = self.bind_port {
                let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
                active_port = Some(listener.local_addr()?.port());
                self.listeners.lock().unwrap().push(listener);
            }
            let record = ManagedProcess {
                id: "fake1234".into(),
                pid: 4242,
                pgid: 4242,
                command: command.into(),
                cwd: cwd.into(),
                started_at: chrono::Utc::now(),
                log_path: std::env::temp_dir().join("fake.log"),
                ports: active_port.into_iter().collect(),
                active_port,
                health_warning: None,
                task: task.into(),
            };
            let summary = format!("Started background process fake1234 | command: {command}");
            Ok((record, summary))
        }
        fn stop(&self, _id: &str) -> bool {
            true
        }
        fn stop_all(&self) -> usize {
            0
        }
        fn list(&self) -> Vec<ManagedProcess> {
            Vec::new()
        }
    }

    fn free_port() -> u16 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    }

    #[tokio::test]
    async fn timed_out_server_launch_is_promoted_to_background() {
        let port = free_port();
        let runner = ScriptedRunner::new(vec![CliResponse {
            success: false,
            output: format!("Server starting at http://127.0.0.1:{port}"),
            error: Some("CLI task timed out after 120 seconds".into()),
            tool_calls: vec![tool_call(
                "run_shell_command",
                "cd /tmp/demo-app && npm start",
                Some("success"),
            )],
        }]);
        let agent = CliAgent::for_test(Box::new(runner), Box::new(FakeProcs::new(Some(port))));

        let result = agent
            .execute_task("go into /tmp/demo-app and run npm start", Duration::from_secs(120))
            .await;
        assert!(result.success, "{result:?}");
        assert!(result.output.contains("Started background process"), "{result:?}");
    }

    #[tokio::test]
    async fn unreachable_localhost_claim_fails_without_tool_trace() {
        let port = free_port();
        let runner = ScriptedRunner::new(vec![CliResponse {
            success: true,
            output: format!("Server is running at http://127.0.0.1:{port}"),
            error: None,
            tool_calls: Vec::new(),
        }]);
        let agent = CliAgent::for_test(Box::new(runner), Box::new(FakeProcs::new(None)));

        let result = agent
            .execute_task("start my server", Duration::from_secs(30))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("none of the claimed ports are reachable"));
    }

    #[tokio::test]
    async fn refusal_reply_triggers_one_retry() {
        let runner = ScriptedRunner::new(vec![
            CliResponse {
                success: true,
                output: "I cannot run commands on your system.".into(),
                ..Default::default()
            },
            CliResponse {
                success: true,
                output: "Created the folder.".into(),
                ..Default::default()
            },
        ]);
        let agent = CliAgent::for_test(Box::new(runner), Box::new(FakeProcs::new(None)));
        let result = agent
            .execute_task("create a folder named hw", Duration::from_secs(30))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "Created the folder.");
    }

    #[tokio::test]
    async fn explicit_backtick_server_command_bypasses_the_model() {
        let runner = ScriptedRunner::new(vec![]);
        let procs = FakeProcs::new(None);
        let agent = CliAgent::for_test(Box::new(runner), Box::new(procs));
        let result = agent
            .execute_task(
                "Run this in background and keep it running on localhost: `sleep 30`",
                Duration::from_secs(30),
            )
            .await;
        assert!(result.success, "{result:?}");
        assert!(result.output.contains("Started background process"));
    }

    #[tokio::test]
    async fn management_list_task_bypasses_subprocess() {
        let runner = ScriptedRunner::new(vec![]);
        let agent = CliAgent::for_test(Box::new(runner), Box::new(FakeProcs::new(None)));
        let result = agent
            .execute_task("list background processes", Duration::from_secs(5))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "No managed background processes.");
    }

    #[tokio::test]
    async fn management_stop_unknown_process_fails() {
        struct NoProcs;
        #[async_trait]
        impl BackgroundProcesses for NoProcs {
            async fn promote(
                &self,
                _command: &str,
                _cwd: &Path,
                _env: &HashMap<String, String>,
                _task: &str,
            ) -> anyhow::Result<(ManagedProcess, String)> {
                anyhow::bail!("unused")
            }
            fn stop(&self, _id: &str) -> bool {
                false
            }
            fn stop_all(&self) -> usize {
                0
            }
            fn list(&self) -> Vec<ManagedProcess> {
                Vec::new()
            }
        }
        let agent = CliAgent::for_test(Box::new(ScriptedRunner::new(vec![])), Box::new(NoProcs));
        let result = agent
            .execute_task("stop background process abc123", Duration::from_secs(5))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("abc123"));
    }
}
