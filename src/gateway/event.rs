/// Shared types for all completion backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Internal event sequence emitted by backend adapters.
/// Each adapter converts its native protocol into this common enum.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text chunk, in backend emission order
    TextDelta { content: String },
    /// Session/chat identifier announced by the backend
    Metadata { session_id: String },
    /// Completion. A non-empty `final_text` overrides accumulated deltas.
    Done { final_text: Option<String>, cost_usd: Option<f64> },
    /// Stream-level error reported by the backend
    Error { message: String },
}

/// Token for cooperative cancellation of in-flight requests.
/// Holds a flag and the child process PID so `cancel()` can terminate a
/// subprocess that has not produced any output yet.
pub struct CancelToken {
    pub cancelled: AtomicBool,
    pub child_pid: Mutex<Option<u32>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            child_pid: Mutex::new(None),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation: set the flag, then terminate the child process
    /// if one has been registered. Adapters that register a PID after this
    /// runs must re-check the flag and kill the child themselves.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        if let Ok(guard) = self.child_pid.lock() {
            if let Some(pid) = *guard {
                terminate_pid(pid);
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn terminate_pid(pid: u32) {
    let _ = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status();
}

#[cfg(not(unix))]
fn terminate_pid(_pid: u32) {}

/// How an adapter attempt ended when it did not raise a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterOutcome {
    Completed,
    Cancelled,
}

/// Why a terminal Response stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Success,
    Cancelled,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Success => "success",
            StopReason::Cancelled => "cancelled",
            StopReason::Error => "error",
        }
    }
}

/// Which transport family serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local CLI tool spawned as a subprocess
    Cli,
    /// Authenticated streaming HTTP service
    Api,
}

impl BackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cli" => Some(BackendKind::Cli),
            "api" => Some(BackendKind::Api),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    Enabled,
    Disabled,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::Enabled => "enabled",
            SandboxMode::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enabled" => Some(SandboxMode::Enabled),
            "disabled" => Some(SandboxMode::Disabled),
            _ => None,
        }
    }
}

/// One prompt submission. Immutable once handed to the gateway.
#[derive(Debug, Clone)]
pub struct Request {
    pub prompt: String,
    pub backend: BackendKind,
    pub model: String,
    pub workspace_dir: String,
    pub streaming: bool,
    pub resume_session_id: Option<String>,
    pub force_approve: bool,
    pub sandbox: SandboxMode,
}

impl Request {
    pub fn new(prompt: &str, backend: BackendKind, model: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            backend,
            model: model.to_string(),
            workspace_dir: ".".to_string(),
            streaming: true,
            resume_session_id: None,
            force_approve: false,
            sandbox: SandboxMode::Disabled,
        }
    }
}

/// Normalized terminal result. Fully populated on every path, including
/// cancellation and error folding.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub text: String,
    pub duration: Duration,
    pub model_used: String,
    pub session_id: Option<String>,
    pub cost_estimate: Option<f64>,
    pub stop_reason: StopReason,
    /// Fallback substitution history as (from, to) pairs
    pub substitutions: Vec<(String, String)>,
}
