/// Collapses adapter event streams and aggregate payloads into final text.
///
/// Streaming: deltas concatenate in arrival order; a completion event with
/// non-empty final text overrides the accumulation. Aggregate: a prioritized
/// key probe over the parsed payload, falling back to the raw body.

use std::sync::mpsc::Receiver;

use serde_json::Value;

use super::event::StreamEvent;
use super::fields;

/// Everything learned from draining one event stream.
#[derive(Debug, Default)]
pub struct Collected {
    pub text: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    /// Whether the adapter announced completion.
    pub completed: bool,
    /// Last stream-level error, if any.
    pub error: Option<String>,
}

/// Drain the receiver until the sender side closes, invoking `on_chunk` for
/// each text delta in order. Returns once every event has been folded in.
pub fn collect(
    receiver: &Receiver<StreamEvent>,
    mut on_chunk: Option<&mut (dyn FnMut(&str) + '_)>,
) -> Collected {
    let mut out = Collected::default();
    for event in receiver.iter() {
        match event {
            StreamEvent::TextDelta { content } => {
                if let Some(cb) = on_chunk.as_deref_mut() {
                    cb(&content);
                }
                out.text.push_str(&content);
            }
            StreamEvent::Metadata { session_id } => {
                out.session_id = Some(session_id);
            }
            StreamEvent::Done {
                final_text,
                cost_usd,
            } => {
                if let Some(text) = final_text {
                    if !text.trim().is_empty() {
                        out.text = text;
                    }
                }
                if cost_usd.is_some() {
                    out.cost_usd = cost_usd;
                }
                out.completed = true;
            }
            StreamEvent::Error { message } => {
                out.error = Some(message);
            }
        }
    }
    out
}

/// Extracted fields from one aggregate response body.
#[derive(Debug)]
pub struct AggregateResult {
    pub text: String,
    pub session_id: Option<String>,
}

/// Where aggregate text lives when the payload is a candidate-list document.
const CANDIDATE_TEXT_PATH: &[fields::Step] = &[
    fields::Step::Key("candidates"),
    fields::Step::Index(0),
    fields::Step::Key("content"),
    fields::Step::Key("parts"),
    fields::Step::Index(0),
    fields::Step::Key("text"),
];

/// Normalize a raw aggregate body. Prefers the prioritized flat keys, then
/// the nested candidate path, then the raw body itself; a payload that is
/// not JSON at all is passed through trimmed.
pub fn from_aggregate(raw: &str) -> AggregateResult {
    let Ok(json) = serde_json::from_str::<Value>(raw) else {
        return AggregateResult {
            text: raw.trim().to_string(),
            session_id: None,
        };
    };
    let session_id = fields::session_id(&json).map(str::to_string);
    let text = fields::aggregate_text(&json)
        .or_else(|| fields::str_at(&json, CANDIDATE_TEXT_PATH))
        .map(str::to_string)
        .unwrap_or_else(|| raw.trim().to_string());
    AggregateResult { text, session_id }
}
