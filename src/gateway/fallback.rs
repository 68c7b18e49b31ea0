/// Model fallback on transient failure.
///
/// A failure is either transient (worth retrying on a sibling model) or
/// terminal (fail fast). Transient detection matches the failure detail
/// against a versioned signature table, so new provider phrasings are a
/// data change rather than a logic change. Each model has a fixed fallback
/// chain that only ever moves to same-or-newer generations.

use std::sync::OnceLock;

use regex::Regex;

use super::error::{BackendFailure, GatewayError};
use super::event::Response;
use super::utils::debug_log_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Likely to succeed on a different model or a later retry
    Transient,
    /// Retrying would reproduce the failure
    Terminal,
}

/// Substring signatures that mark a failure as transient. Versioned so a
/// persisted decision can name the table that produced it.
#[derive(Debug, Clone)]
pub struct TransientSignatures {
    pub version: u32,
    patterns: Vec<&'static str>,
}

impl Default for TransientSignatures {
    fn default() -> Self {
        Self {
            version: 1,
            patterns: vec![
                "rate limit",
                "429",
                "too many requests",
                "overloaded",
                "unavailable",
                "503",
                "529",
                "connection refused",
                "connection reset",
                "timed out",
                "temporarily",
            ],
        }
    }
}

impl TransientSignatures {
    pub fn classify(&self, failure: &BackendFailure) -> FailureClass {
        let detail = failure.detail.to_lowercase();
        if self.patterns.iter().any(|p| detail.contains(p)) {
            FailureClass::Transient
        } else {
            FailureClass::Terminal
        }
    }
}

/// Per-model fallback chains. Each chain starts with the model itself so a
/// transient failure retries once in place before substituting.
#[derive(Debug, Clone)]
pub struct FallbackChains {
    table: Vec<(&'static str, Vec<&'static str>)>,
}

impl Default for FallbackChains {
    fn default() -> Self {
        Self {
            table: vec![
                (
                    "gemini-2.0-flash",
                    vec!["gemini-2.0-flash", "gemini-2.5-flash", "gemini-2.5-pro"],
                ),
                ("gemini-2.5-flash", vec!["gemini-2.5-flash", "gemini-2.5-pro"]),
                ("gemini-2.5-pro", vec!["gemini-2.5-pro"]),
            ],
        }
    }
}

impl FallbackChains {
    pub fn with_table(table: Vec<(&'static str, Vec<&'static str>)>) -> Self {
        Self { table }
    }

    /// Chain for a model. Unknown models get a single-entry chain, which
    /// means one attempt and no substitution.
    pub fn chain_for(&self, model: &str) -> Vec<String> {
        self.table
            .iter()
            .find(|(m, _)| *m == model)
            .map(|(_, chain)| chain.iter().map(|s| s.to_string()).collect())
            .unwrap_or_else(|| vec![model.to_string()])
    }
}

fn generation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("Invalid model generation pattern"))
}

/// First numeric component of a model name, e.g. 2.5 for "gemini-2.5-pro".
pub fn model_generation(model: &str) -> Option<f64> {
    let captures = generation_regex().captures(model)?;
    captures.get(1)?.as_str().parse().ok()
}

/// Runs attempts down a model's fallback chain.
pub struct FallbackPolicy {
    chains: FallbackChains,
    signatures: TransientSignatures,
}

impl FallbackPolicy {
    pub fn new() -> Self {
        Self {
            chains: FallbackChains::default(),
            signatures: TransientSignatures::default(),
        }
    }

    pub fn with_chains(mut self, chains: FallbackChains) -> Self {
        self.chains = chains;
        self
    }

    pub fn with_signatures(mut self, signatures: TransientSignatures) -> Self {
        self.signatures = signatures;
        self
    }

    /// Walk the chain for `requested`, invoking `attempt` per candidate.
    /// A terminal failure stops immediately; transient failures continue to
    /// the next untried candidate. On success the response is annotated with
    /// the model actually used and the substitution history.
    pub fn run(
        &self,
        requested: &str,
        mut attempt: impl FnMut(&str) -> Result<Response, BackendFailure>,
    ) -> Result<Response, GatewayError> {
        let chain = self.chains.chain_for(requested);
        let mut attempted: Vec<String> = Vec::new();
        let mut last_failure: Option<BackendFailure> = None;

        for candidate in &chain {
            if attempted.iter().any(|m| m == candidate) {
                continue;
            }
            attempted.push(candidate.clone());
            match attempt(candidate) {
                Ok(mut response) => {
                    response.model_used = candidate.clone();
                    response.substitutions = attempted
                        .windows(2)
                        .map(|pair| (pair[0].clone(), pair[1].clone()))
                        .collect();
                    return Ok(response);
                }
                Err(failure) => {
                    let class = self.signatures.classify(&failure);
                    debug_log_for(
                        "fallback",
                        &format!(
                            "{} failed ({:?}, signatures v{}): {}",
                            candidate, class, self.signatures.version, failure.detail
                        ),
                    );
                    if class == FailureClass::Terminal {
                        return Err(GatewayError::BackendExhausted {
                            failure,
                            attempted,
                        });
                    }
                    last_failure = Some(failure);
                }
            }
        }

        // Transient all the way down the chain.
        let failure = match last_failure {
            Some(f) => f,
            None => BackendFailure::new(
                "fallback",
                std::time::Duration::ZERO,
                format!("no fallback candidates for model {}", requested),
            ),
        };
        Err(GatewayError::BackendExhausted { failure, attempted })
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::event::StopReason;
    use std::time::Duration;

    fn failure(detail: &str) -> BackendFailure {
        BackendFailure::new("api", Duration::from_millis(50), detail)
    }

    fn ok_response(text: &str) -> Response {
        Response {
            text: text.to_string(),
            duration: Duration::from_millis(10),
            model_used: String::new(),
            session_id: None,
            cost_estimate: None,
            stop_reason: StopReason::Success,
            substitutions: Vec::new(),
        }
    }

    // --- classification ---

    #[test]
    fn test_rate_limit_is_transient() {
        let sigs = TransientSignatures::default();
        assert_eq!(
            sigs.classify(&failure("HTTP 429: Rate Limit exceeded")),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_overloaded_and_unavailable_are_transient() {
        let sigs = TransientSignatures::default();
        assert_eq!(
            sigs.classify(&failure("model is overloaded")),
            FailureClass::Transient
        );
        assert_eq!(
            sigs.classify(&failure("HTTP 503: Service Unavailable")),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        let sigs = TransientSignatures::default();
        assert_eq!(
            sigs.classify(&failure("HTTP 401: invalid credentials")),
            FailureClass::Terminal
        );
    }

    #[test]
    fn test_bad_request_is_terminal() {
        let sigs = TransientSignatures::default();
        assert_eq!(
            sigs.classify(&failure("HTTP 400: unknown field")),
            FailureClass::Terminal
        );
    }

    // --- chains ---

    #[test]
    fn test_chain_starts_with_requested_model() {
        let chains = FallbackChains::default();
        let chain = chains.chain_for("gemini-2.0-flash");
        assert_eq!(chain.first().map(String::as_str), Some("gemini-2.0-flash"));
    }

    #[test]
    fn test_unknown_model_gets_singleton_chain() {
        let chains = FallbackChains::default();
        assert_eq!(chains.chain_for("mystery-model"), vec!["mystery-model"]);
    }

    #[test]
    fn test_default_chains_never_regress_generation() {
        let chains = FallbackChains::default();
        for model in ["gemini-2.0-flash", "gemini-2.5-flash", "gemini-2.5-pro"] {
            let chain = chains.chain_for(model);
            let start = model_generation(model).unwrap();
            for candidate in &chain {
                let gen = model_generation(candidate).unwrap();
                assert!(
                    gen >= start,
                    "{} regresses to {} in chain for {}",
                    candidate,
                    gen,
                    model
                );
            }
        }
    }

    #[test]
    fn test_model_generation_parse() {
        assert_eq!(model_generation("gemini-2.5-pro"), Some(2.5));
        assert_eq!(model_generation("gemini-2.0-flash"), Some(2.0));
        assert!(model_generation("no-digits-here").is_none());
    }

    // --- policy runs ---

    fn two_step_policy() -> FallbackPolicy {
        FallbackPolicy::new().with_chains(FallbackChains::with_table(vec![(
            "m1",
            vec!["m1", "m2"],
        )]))
    }

    #[test]
    fn test_first_attempt_success_no_substitution() {
        let policy = two_step_policy();
        let result = policy.run("m1", |_| Ok(ok_response("done")));
        let response = result.unwrap();
        assert_eq!(response.model_used, "m1");
        assert!(response.substitutions.is_empty());
    }

    #[test]
    fn test_transient_failure_substitutes_next_model() {
        let policy = two_step_policy();
        let result = policy.run("m1", |model| {
            if model == "m1" {
                Err(failure("rate limit hit"))
            } else {
                Ok(ok_response("recovered"))
            }
        });
        let response = result.unwrap();
        assert_eq!(response.model_used, "m2");
        assert_eq!(
            response.substitutions,
            vec![("m1".to_string(), "m2".to_string())]
        );
    }

    #[test]
    fn test_terminal_failure_stops_immediately() {
        let policy = two_step_policy();
        let mut calls = 0;
        let result = policy.run("m1", |_| {
            calls += 1;
            Err(failure("HTTP 400: malformed request"))
        });
        assert_eq!(calls, 1);
        match result {
            Err(GatewayError::BackendExhausted { attempted, .. }) => {
                assert_eq!(attempted, vec!["m1".to_string()]);
            }
            other => panic!("expected BackendExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_exhausted_chain_reports_all_attempts() {
        let policy = two_step_policy();
        let result = policy.run("m1", |_| Err(failure("connection reset by peer")));
        match result {
            Err(GatewayError::BackendExhausted { attempted, failure }) => {
                assert_eq!(attempted, vec!["m1".to_string(), "m2".to_string()]);
                assert!(failure.detail.contains("connection reset"));
            }
            other => panic!("expected BackendExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_duplicate_chain_entries_attempted_once() {
        let policy = FallbackPolicy::new().with_chains(FallbackChains::with_table(vec![(
            "m1",
            vec!["m1", "m2", "m1"],
        )]));
        let mut calls = Vec::new();
        let _ = policy.run("m1", |model| {
            calls.push(model.to_string());
            Err(failure("timed out"))
        });
        assert_eq!(calls, vec!["m1".to_string(), "m2".to_string()]);
    }
}
