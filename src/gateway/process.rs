/// Adapter for completion backends invoked as local CLI subprocesses.
///
/// Spawns the tool in non-interactive mode, reads stdout incrementally, and
/// maps its newline-delimited JSON events onto the gateway's StreamEvent
/// contract. Stderr is drained concurrently and surfaced only on non-zero
/// exit. Signal-terminated exits fold into cancellation, never failure.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use serde_json::Value;

use super::error::BackendFailure;
use super::event::{AdapterOutcome, CancelToken, Request, SandboxMode, StreamEvent};
use super::fields;
use super::utils::{debug_log_for, resolve_binary, truncate_str};

pub const BACKEND_NAME: &str = "cli";

const DEFAULT_BINARY: &str = "agent";
const SUBCOMMAND: &str = "exec";
const NON_INTERACTIVE_FLAG: &str = "-p";
const OUTPUT_FORMAT_FLAG: &str = "--output-format";
const FORMAT_AGGREGATE: &str = "json";
const FORMAT_STREAM: &str = "stream-json";
const PARTIAL_OUTPUT_FLAG: &str = "--include-partial-messages";

const READ_CHUNK: usize = 8192;
const DIAGNOSTIC_CAP: usize = 8192;

/// Result of a non-streaming invocation: the raw aggregate payload, or a
/// cancellation observed while waiting.
#[derive(Debug)]
pub enum Aggregate {
    Output(String),
    Cancelled,
}

/// Cached regex pattern for session ID validation
fn session_id_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("Invalid session ID regex pattern"))
}

/// Validate session ID format (alphanumeric, dashes, underscores only)
/// Max length limited to 64 characters for security
fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty() && session_id.len() <= 64 && session_id_regex().is_match(session_id)
}

pub struct ProcessAdapter {
    /// Explicit binary path; when None the default tool is resolved on PATH.
    binary: Option<String>,
}

impl ProcessAdapter {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("LLMGATE_CLI_BIN").ok(),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: Some(path.into()),
        }
    }

    fn binary_path(&self, started: Instant) -> Result<String, BackendFailure> {
        if let Some(bin) = &self.binary {
            return Ok(bin.clone());
        }
        resolve_binary(DEFAULT_BINARY).ok_or_else(|| {
            BackendFailure::new(
                BACKEND_NAME,
                started.elapsed(),
                format!("{} CLI not found on PATH. Is it installed?", DEFAULT_BINARY),
            )
        })
    }

    /// Spawn the tool and stream its stdout into `sender` until completion,
    /// cancellation, or failure.
    pub fn execute_streaming(
        &self,
        req: &Request,
        sender: Sender<StreamEvent>,
        cancel: Option<Arc<CancelToken>>,
    ) -> Result<AdapterOutcome, BackendFailure> {
        let started = Instant::now();
        debug_log_for(BACKEND_NAME, &format!("prompt_len: {} chars", req.prompt.len()));
        debug_log_for(BACKEND_NAME, &format!("model: {}", req.model));

        let args = build_args(req, true)
            .map_err(|e| BackendFailure::new(BACKEND_NAME, started.elapsed(), e))?;
        let binary = self.binary_path(started)?;

        debug_log_for(BACKEND_NAME, &format!("spawning: {}", binary));
        let mut child = spawn(&binary, &args, &req.workspace_dir)
            .map_err(|e| BackendFailure::new(BACKEND_NAME, started.elapsed(), e))?;
        register_child(&cancel, &child);
        if check_cancelled(&cancel, &mut child) {
            return Ok(AdapterOutcome::Cancelled);
        }

        // Drain stderr on its own thread so a chatty tool cannot deadlock the
        // stdout loop on a full pipe.
        let stderr_thread = child.stderr.take().map(|mut handle| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = handle.read_to_string(&mut buf);
                buf
            })
        });

        let mut stdout = child.stdout.take().ok_or_else(|| {
            BackendFailure::new(BACKEND_NAME, started.elapsed(), "failed to capture stdout")
        })?;

        let mut carry = LineBuffer::new();
        let mut last_session: Option<String> = None;
        let mut raw_tail = String::new();
        let mut chunk = [0u8; READ_CHUNK];
        let mut receiver_open = true;
        let mut line_count: u64 = 0;

        loop {
            if check_cancelled(&cancel, &mut child) {
                return Ok(AdapterOutcome::Cancelled);
            }
            match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    for line in carry.push(&chunk[..n]) {
                        line_count += 1;
                        remember_tail(&mut raw_tail, &line);
                        if !handle_line(&line, &sender, &mut last_session) {
                            debug_log_for(BACKEND_NAME, "channel closed (receiver dropped)");
                            receiver_open = false;
                            break;
                        }
                    }
                    if !receiver_open {
                        break;
                    }
                }
                Err(e) => {
                    debug_log_for(BACKEND_NAME, &format!("failed to read output: {}", e));
                    let _ = sender.send(StreamEvent::Error {
                        message: format!("failed to read output: {}", e),
                    });
                    break;
                }
            }
        }
        debug_log_for(BACKEND_NAME, &format!("read loop finished, {} lines", line_count));

        if let Some(line) = carry.finish() {
            remember_tail(&mut raw_tail, &line);
            let _ = handle_line(&line, &sender, &mut last_session);
        }

        if check_cancelled(&cancel, &mut child) {
            return Ok(AdapterOutcome::Cancelled);
        }
        let status = child.wait().map_err(|e| {
            BackendFailure::new(BACKEND_NAME, started.elapsed(), format!("process error: {}", e))
        })?;
        debug_log_for(BACKEND_NAME, &format!("exit status: {:?}", status.code()));

        if cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Ok(AdapterOutcome::Cancelled);
        }
        if exit_signals_termination(&status) {
            debug_log_for(BACKEND_NAME, "terminated by signal, folding into cancellation");
            return Ok(AdapterOutcome::Cancelled);
        }

        if !status.success() {
            let stderr_text = stderr_thread
                .and_then(|h| h.join().ok())
                .unwrap_or_default();
            return Err(BackendFailure::new(
                BACKEND_NAME,
                started.elapsed(),
                exit_diagnostics(&status, stderr_text.trim(), raw_tail.trim()),
            ));
        }
        Ok(AdapterOutcome::Completed)
    }

    /// Run the tool to completion and return its aggregate payload. The
    /// prioritized field extraction happens in the normalizer.
    pub fn execute_aggregate(
        &self,
        req: &Request,
        cancel: Option<Arc<CancelToken>>,
    ) -> Result<Aggregate, BackendFailure> {
        let started = Instant::now();
        let args = build_args(req, false)
            .map_err(|e| BackendFailure::new(BACKEND_NAME, started.elapsed(), e))?;
        let binary = self.binary_path(started)?;

        let mut child = spawn(&binary, &args, &req.workspace_dir)
            .map_err(|e| BackendFailure::new(BACKEND_NAME, started.elapsed(), e))?;
        register_child(&cancel, &child);
        if check_cancelled(&cancel, &mut child) {
            return Ok(Aggregate::Cancelled);
        }

        let output = child.wait_with_output().map_err(|e| {
            BackendFailure::new(BACKEND_NAME, started.elapsed(), format!("failed to read output: {}", e))
        })?;

        if cancel.as_ref().is_some_and(|t| t.is_cancelled())
            || exit_signals_termination(&output.status)
        {
            return Ok(Aggregate::Cancelled);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(BackendFailure::new(
                BACKEND_NAME,
                started.elapsed(),
                exit_diagnostics(&output.status, stderr.trim(), stdout.trim()),
            ));
        }
        Ok(Aggregate::Output(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }
}

impl Default for ProcessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the argument vector:
/// `[subcommand, -p, --output-format FMT, --model M?, --workspace DIR?,
///   --force?, --sandbox MODE?, --resume SID?, prompt]`
fn build_args(req: &Request, streaming: bool) -> Result<Vec<String>, String> {
    let mut args = vec![
        SUBCOMMAND.to_string(),
        NON_INTERACTIVE_FLAG.to_string(),
        OUTPUT_FORMAT_FLAG.to_string(),
    ];
    if streaming {
        args.push(FORMAT_STREAM.to_string());
        args.push(PARTIAL_OUTPUT_FLAG.to_string());
    } else {
        args.push(FORMAT_AGGREGATE.to_string());
    }
    if !req.model.is_empty() {
        args.push("--model".to_string());
        args.push(req.model.clone());
    }
    if !req.workspace_dir.is_empty() {
        args.push("--workspace".to_string());
        args.push(req.workspace_dir.clone());
    }
    if req.force_approve {
        args.push("--force".to_string());
    }
    if req.sandbox == SandboxMode::Enabled {
        args.push("--sandbox".to_string());
        args.push(req.sandbox.as_str().to_string());
    }
    if let Some(sid) = &req.resume_session_id {
        if !is_valid_session_id(sid) {
            return Err("invalid session id format".to_string());
        }
        args.push("--resume".to_string());
        args.push(sid.clone());
    }
    // Prompt as positional argument (must be last)
    args.push(req.prompt.clone());
    Ok(args)
}

fn spawn(binary: &str, args: &[String], working_dir: &str) -> Result<Child, String> {
    Command::new(binary)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to start {}: {}. Is the CLI installed?", binary, e))
}

/// Store the child PID in the cancel token so `cancel()` can terminate a
/// process that never produces output.
fn register_child(cancel: &Option<Arc<CancelToken>>, child: &Child) {
    if let Some(token) = cancel {
        if let Ok(mut guard) = token.child_pid.lock() {
            *guard = Some(child.id());
        }
    }
}

fn check_cancelled(cancel: &Option<Arc<CancelToken>>, child: &mut Child) -> bool {
    if let Some(token) = cancel {
        if token.is_cancelled() {
            debug_log_for(BACKEND_NAME, "cancel detected, killing child process");
            let _ = child.kill();
            let _ = child.wait();
            return true;
        }
    }
    false
}

fn exit_signals_termination(status: &ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal().is_some() {
            return true;
        }
    }
    // Shell convention for SIGINT/SIGTERM propagated through a wrapper
    matches!(status.code(), Some(130) | Some(143))
}

fn exit_diagnostics(status: &ExitStatus, stderr: &str, partial_stdout: &str) -> String {
    let mut detail = format!("process exited with code {:?}", status.code());
    if !stderr.is_empty() {
        detail = format!("{}: {}", detail, truncate_str(stderr, DIAGNOSTIC_CAP));
    }
    if !partial_stdout.is_empty() {
        detail = format!(
            "{}; partial output: {}",
            detail,
            truncate_str(partial_stdout, DIAGNOSTIC_CAP)
        );
    }
    detail
}

fn remember_tail(tail: &mut String, line: &str) {
    if tail.len() < DIAGNOSTIC_CAP {
        tail.push_str(line);
        tail.push('\n');
    }
}

/// Carries incomplete trailing output between reads so only complete
/// newline-delimited JSON objects are parsed.
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Append a chunk and return every complete line it closed off.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.pending.drain(..=pos).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        lines
    }

    /// Flush whatever unterminated tail remains at end of stream.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

/// Process one complete stdout line. Malformed lines are logged and skipped.
/// Returns false once the receiver has gone away.
fn handle_line(line: &str, sender: &Sender<StreamEvent>, last_session: &mut Option<String>) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    let json: Value = match serde_json::from_str(line) {
        Ok(j) => j,
        Err(_) => {
            debug_log_for(
                BACKEND_NAME,
                &format!("skipping malformed line: {}", truncate_str(line, 200)),
            );
            return true;
        }
    };
    if let Some(sid) = fields::session_id(&json) {
        if last_session.as_deref() != Some(sid) {
            *last_session = Some(sid.to_string());
            let meta = StreamEvent::Metadata {
                session_id: sid.to_string(),
            };
            if sender.send(meta).is_err() {
                return false;
            }
        }
    }
    if let Some(event) = parse_stream_event(&json) {
        return sender.send(event).is_ok();
    }
    true
}

/// Map one structured-mode JSON object onto the common event contract.
///
/// Known shapes:
/// - `{"type":"text","content":"..."}` — incremental text
/// - `{"type":"assistant","message":{"content":[{"type":"text","text":"..."}]}}`
/// - `{"type":"result","result":"..."}` — terminal full text, overrides deltas
/// - `{"type":"error","message":"..."}` — stream-level error
fn parse_stream_event(json: &Value) -> Option<StreamEvent> {
    let msg_type = json.get("type")?.as_str()?;
    match msg_type {
        "text" => {
            let content = json.get("content")?.as_str()?.to_string();
            Some(StreamEvent::TextDelta { content })
        }
        "assistant" => {
            let content = json.get("message")?.get("content")?.as_array()?;
            for item in content {
                if item.get("type").and_then(|v| v.as_str()) == Some("text") {
                    let text = item.get("text")?.as_str()?.to_string();
                    return Some(StreamEvent::TextDelta { content: text });
                }
            }
            None
        }
        "result" => Some(StreamEvent::Done {
            final_text: json.get("result").and_then(|v| v.as_str()).map(String::from),
            cost_usd: json.get("total_cost_usd").and_then(|v| v.as_f64()),
        }),
        "error" => {
            let message = json
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown backend error")
                .to_string();
            Some(StreamEvent::Error { message })
        }
        _ => None,
    }
}
