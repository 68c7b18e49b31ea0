/// Adapter for authenticated streaming HTTP completion backends.
///
/// Authenticates with a short-lived bearer token from the credential manager,
/// falling back to a static API key from the environment. Streaming responses
/// use server-sent-event framing: blank-line-delimited messages carrying a
/// `data:` prefixed JSON payload, with a `[DONE]` sentinel that is ignored.

use std::io::{BufRead, BufReader};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use super::credentials::CredentialSource;
use super::error::{BackendFailure, GatewayError};
use super::event::{AdapterOutcome, CancelToken, Request, StreamEvent};
use super::fields::{self, Step};
use super::utils::{debug_log_for, truncate_str};

pub const BACKEND_NAME: &str = "api";

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Static API key for this backend family, used when no bearer token exists.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
const API_KEY_HEADER: &str = "x-goog-api-key";

const DIAGNOSTIC_CAP: usize = 2048;

/// Where streamed text lives inside each SSE frame.
const CANDIDATE_TEXT_PATH: &[Step] = &[
    Step::Key("candidates"),
    Step::Index(0),
    Step::Key("content"),
    Step::Key("parts"),
    Step::Index(0),
    Step::Key("text"),
];

/// Resolved authentication for one request.
#[derive(Debug, Clone)]
pub enum Auth {
    Bearer(String),
    ApiKey(String),
}

/// Obtain a bearer token, else the static key. When neither path succeeds
/// the error names both remediation options.
pub fn resolve_auth(creds: &dyn CredentialSource) -> Result<Auth, GatewayError> {
    if let Some(token) = creds.get_token() {
        return Ok(Auth::Bearer(token));
    }
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.trim().is_empty() {
            return Ok(Auth::ApiKey(key));
        }
    }
    let remediation = if creds.is_available() {
        format!(
            "the credential helper has an active account but produced no usable token; \
             re-authenticate with the helper, or set {}",
            API_KEY_ENV
        )
    } else {
        format!(
            "no authenticated account found; log in with the credential helper, or set {}",
            API_KEY_ENV
        )
    };
    Err(GatewayError::CredentialUnavailable { remediation })
}

pub struct HttpAdapter {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpAdapter {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::blocking::Client::new(),
        }
    }

    /// Issue a streaming request and forward each frame's text as a delta.
    pub fn execute_streaming(
        &self,
        req: &Request,
        auth: &Auth,
        sender: Sender<StreamEvent>,
        cancel: Option<Arc<CancelToken>>,
    ) -> Result<AdapterOutcome, BackendFailure> {
        let started = Instant::now();
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.endpoint, req.model
        );
        debug_log_for(BACKEND_NAME, &format!("POST {}", url));

        let response = apply_auth(self.client.post(&url), auth)
            .json(&request_body(&req.prompt))
            .send()
            .map_err(|e| {
                BackendFailure::new(BACKEND_NAME, started.elapsed(), format!("request failed: {}", e))
            })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(BackendFailure::new(
                BACKEND_NAME,
                started.elapsed(),
                format!("HTTP {}: {}", status, truncate_str(body.trim(), DIAGNOSTIC_CAP)),
            ));
        }

        let mut last_session: Option<String> = None;
        let reader = BufReader::new(response);
        for line in reader.lines() {
            // Dropping the reader on this path closes the connection.
            if cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                debug_log_for(BACKEND_NAME, "cancel detected, closing stream");
                return Ok(AdapterOutcome::Cancelled);
            }
            let line = line.map_err(|e| {
                BackendFailure::new(
                    BACKEND_NAME,
                    started.elapsed(),
                    format!("stream read failed: {}", e),
                )
            })?;
            if !handle_frame_line(&line, &sender, &mut last_session) {
                debug_log_for(BACKEND_NAME, "channel closed (receiver dropped)");
                break;
            }
        }

        if cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Ok(AdapterOutcome::Cancelled);
        }
        let _ = sender.send(StreamEvent::Done {
            final_text: None,
            cost_usd: None,
        });
        Ok(AdapterOutcome::Completed)
    }

    /// Single-shot request. Returns the raw body; the normalizer performs the
    /// prioritized field extraction.
    pub fn execute_aggregate(&self, req: &Request, auth: &Auth) -> Result<String, BackendFailure> {
        let started = Instant::now();
        let url = format!("{}/models/{}:generateContent", self.endpoint, req.model);
        debug_log_for(BACKEND_NAME, &format!("POST {}", url));

        let response = apply_auth(self.client.post(&url), auth)
            .json(&request_body(&req.prompt))
            .send()
            .map_err(|e| {
                BackendFailure::new(BACKEND_NAME, started.elapsed(), format!("request failed: {}", e))
            })?;
        let status = response.status();
        let body = response.text().map_err(|e| {
            BackendFailure::new(BACKEND_NAME, started.elapsed(), format!("read failed: {}", e))
        })?;
        if !status.is_success() {
            return Err(BackendFailure::new(
                BACKEND_NAME,
                started.elapsed(),
                format!("HTTP {}: {}", status, truncate_str(body.trim(), DIAGNOSTIC_CAP)),
            ));
        }
        Ok(body)
    }
}

impl Default for HttpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn request_body(prompt: &str) -> Value {
    json!({ "contents": [{ "parts": [{ "text": prompt }] }] })
}

fn apply_auth(
    builder: reqwest::blocking::RequestBuilder,
    auth: &Auth,
) -> reqwest::blocking::RequestBuilder {
    match auth {
        Auth::Bearer(token) => builder.bearer_auth(token),
        Auth::ApiKey(key) => builder.header(API_KEY_HEADER, key),
    }
}

/// Process one line of the SSE byte stream. Blank lines separate frames;
/// only `data:` payloads matter. Malformed frames are skipped without
/// aborting the stream. Returns false once the receiver has gone away.
fn handle_frame_line(
    line: &str,
    sender: &Sender<StreamEvent>,
    last_session: &mut Option<String>,
) -> bool {
    let Some(payload) = parse_sse_data(line) else {
        return true;
    };
    let json: Value = match serde_json::from_str(payload) {
        Ok(j) => j,
        Err(_) => {
            debug_log_for(
                BACKEND_NAME,
                &format!("skipping malformed frame: {}", truncate_str(payload, 200)),
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
    if let Some(text) = fields::str_at(&json, CANDIDATE_TEXT_PATH) {
        let delta = StreamEvent::TextDelta {
            content: text.to_string(),
        };
        return sender.send(delta).is_ok();
    }
    true
}

/// Extract the JSON payload from a `data:` line. Returns None for frame
/// separators, comments, and the `[DONE]` sentinel.
fn parse_sse_data(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    // --- parse_sse_data ---

    #[test]
    fn test_sse_data_payload() {
        assert_eq!(parse_sse_data(r#"data: {"x":1}"#), Some(r#"{"x":1}"#));
    }

    #[test]
    fn test_sse_data_no_space_after_colon() {
        assert_eq!(parse_sse_data(r#"data:{"x":1}"#), Some(r#"{"x":1}"#));
    }

    #[test]
    fn test_sse_blank_line_ignored() {
        assert!(parse_sse_data("").is_none());
    }

    #[test]
    fn test_sse_done_sentinel_ignored() {
        assert!(parse_sse_data("data: [DONE]").is_none());
    }

    #[test]
    fn test_sse_non_data_field_ignored() {
        assert!(parse_sse_data("event: ping").is_none());
        assert!(parse_sse_data(": comment").is_none());
    }

    // --- handle_frame_line ---

    fn frame(text: &str) -> String {
        format!(
            r#"data: {{"candidates":[{{"content":{{"parts":[{{"text":"{}"}}]}}}}]}}"#,
            text
        )
    }

    #[test]
    fn test_frames_stream_in_order() {
        let (tx, rx) = mpsc::channel();
        let mut session = None;
        for chunk in ["He", "llo", " world"] {
            assert!(handle_frame_line(&frame(chunk), &tx, &mut session));
            assert!(handle_frame_line("", &tx, &mut session));
        }
        assert!(handle_frame_line("data: [DONE]", &tx, &mut session));
        drop(tx);

        let deltas: Vec<String> = rx
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { content } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(
            deltas,
            vec!["He".to_string(), "llo".to_string(), " world".to_string()]
        );
    }

    #[test]
    fn test_malformed_frame_skipped() {
        let (tx, rx) = mpsc::channel();
        let mut session = None;
        assert!(handle_frame_line(&frame("a"), &tx, &mut session));
        assert!(handle_frame_line("data: {broken json", &tx, &mut session));
        assert!(handle_frame_line(&frame("b"), &tx, &mut session));
        drop(tx);
        let deltas: Vec<String> = rx
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { content } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_frame_without_candidate_text_skipped() {
        let (tx, rx) = mpsc::channel();
        let mut session = None;
        assert!(handle_frame_line(
            r#"data: {"usageMetadata":{"totalTokenCount":12}}"#,
            &tx,
            &mut session
        ));
        drop(tx);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_frame_session_metadata() {
        let (tx, rx) = mpsc::channel();
        let mut session = None;
        let line = r#"data: {"chatId":"c-3","candidates":[{"content":{"parts":[{"text":"x"}]}}]}"#;
        assert!(handle_frame_line(line, &tx, &mut session));
        drop(tx);
        let events: Vec<StreamEvent> = rx.iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Metadata { session_id } if session_id == "c-3")));
    }

    // --- request_body ---

    #[test]
    fn test_request_body_shape() {
        let body = request_body("2+2");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "2+2");
    }

    // --- resolve_auth ---

    struct FakeCreds {
        token: Option<String>,
        available: bool,
    }

    impl CredentialSource for FakeCreds {
        fn get_token(&self) -> Option<String> {
            self.token.clone()
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn clear_token(&self) {}
    }

    #[test]
    fn test_resolve_auth_prefers_bearer() {
        let creds = FakeCreds {
            token: Some("tok-1".to_string()),
            available: true,
        };
        match resolve_auth(&creds) {
            Ok(Auth::Bearer(t)) => assert_eq!(t, "tok-1"),
            other => panic!("expected bearer auth, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_resolve_auth_unavailable_names_both_remedies() {
        // Guard against a key leaking in from the test environment.
        if std::env::var(API_KEY_ENV).is_ok() {
            return;
        }
        let creds = FakeCreds {
            token: None,
            available: false,
        };
        match resolve_auth(&creds) {
            Err(GatewayError::CredentialUnavailable { remediation }) => {
                assert!(remediation.contains("credential helper"));
                assert!(remediation.contains(API_KEY_ENV));
            }
            other => panic!("expected CredentialUnavailable, got {:?}", other.map(|_| ())),
        }
    }
}
