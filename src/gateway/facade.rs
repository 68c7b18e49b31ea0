/// Single entry point tying the adapters, credential manager, normalizer,
/// and fallback policy together.
///
/// `submit` resolves credentials up front (API transport only), then walks
/// the model fallback chain. Each attempt streams through an internal
/// channel: the adapter produces events on its own thread while this thread
/// folds them into the final Response. Cancellation always folds into a
/// Response with `StopReason::Cancelled`, never an error.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use super::credentials::{CredentialManager, CredentialSource};
use super::error::{BackendFailure, GatewayError};
use super::event::{
    AdapterOutcome, BackendKind, CancelToken, Request, Response, StopReason, StreamEvent,
};
use super::fallback::FallbackPolicy;
use super::http::{self, Auth, HttpAdapter};
use super::normalize::{self, Collected};
use super::process::{Aggregate, ProcessAdapter};
use super::utils::debug_log_for;

/// Hooks for observing request lifecycle. All methods are best-effort: a
/// panicking observer never disturbs the exchange itself.
pub trait ExchangeObserver: Send + Sync {
    fn on_attempt(&self, _model: &str) {}
    fn on_failure(&self, _failure: &BackendFailure) {}
    /// Receives the full exchange: the original request and the Response
    /// that settled it.
    fn on_complete(&self, _request: &Request, _response: &Response) {}
}

pub struct Gateway {
    credentials: Arc<dyn CredentialSource>,
    policy: FallbackPolicy,
    process: ProcessAdapter,
    http: HttpAdapter,
    observer: Option<Box<dyn ExchangeObserver>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self {
            credentials: Arc::new(CredentialManager::new()),
            policy: FallbackPolicy::new(),
            process: ProcessAdapter::new(),
            http: HttpAdapter::new(),
            observer: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_process_adapter(mut self, adapter: ProcessAdapter) -> Self {
        self.process = adapter;
        self
    }

    pub fn with_http_adapter(mut self, adapter: HttpAdapter) -> Self {
        self.http = adapter;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn ExchangeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Submit one request. Delivers chunks to `on_chunk` in emission order,
    /// only from the attempt that settles the request, and returns the
    /// normalized Response.
    pub fn submit(
        &self,
        req: &Request,
        cancel: Option<Arc<CancelToken>>,
        mut on_chunk: Option<&mut dyn FnMut(&str)>,
    ) -> Result<Response, GatewayError> {
        // Credential problems are an auth concern, not a model fallback
        // concern: resolve before any attempt so the chain never runs on a
        // request that cannot authenticate.
        let auth = match req.backend {
            BackendKind::Api => Some(http::resolve_auth(self.credentials.as_ref())?),
            BackendKind::Cli => None,
        };

        let result = self.policy.run(&req.model, |candidate| {
            self.notify(|o| o.on_attempt(candidate));
            let mut attempt_req = req.clone();
            attempt_req.model = candidate.to_string();
            let outcome = if attempt_req.streaming {
                self.attempt_streaming(
                    &attempt_req,
                    auth.as_ref(),
                    cancel.clone(),
                    on_chunk.as_deref_mut(),
                )
            } else {
                self.attempt_aggregate(&attempt_req, auth.as_ref(), cancel.clone())
            };
            if let Err(failure) = &outcome {
                self.notify(|o| o.on_failure(failure));
            }
            outcome
        });

        if let Ok(response) = &result {
            self.notify(|o| o.on_complete(req, response));
        }
        result
    }

    fn attempt_streaming(
        &self,
        req: &Request,
        auth: Option<&Auth>,
        cancel: Option<Arc<CancelToken>>,
        on_chunk: Option<&mut (dyn FnMut(&str) + '_)>,
    ) -> Result<Response, BackendFailure> {
        let started = Instant::now();
        let (tx, rx) = mpsc::channel::<StreamEvent>();
        let adapter_cancel = cancel.clone();

        // Deltas are buffered per attempt and released to the caller only
        // once this attempt is known to produce the Response. A fallback
        // retry after a mid-stream failure would otherwise leave the caller
        // with chunks from two different attempts.
        let mut buffered: Vec<String> = Vec::new();
        let mut capture = |chunk: &str| buffered.push(chunk.to_string());
        let chunk_sink: Option<&mut (dyn FnMut(&str) + '_)> = if on_chunk.is_some() {
            Some(&mut capture)
        } else {
            None
        };

        // The adapter owns the sender: when it returns, the channel closes
        // and the collector drains whatever is left.
        let (joined, collected) = std::thread::scope(|scope| {
            let handle = scope.spawn(move || match req.backend {
                BackendKind::Cli => self.process.execute_streaming(req, tx, adapter_cancel),
                BackendKind::Api => match auth {
                    Some(auth) => self.http.execute_streaming(req, auth, tx, adapter_cancel),
                    None => Err(BackendFailure::new(
                        http::BACKEND_NAME,
                        started.elapsed(),
                        "no credential resolved for request",
                    )),
                },
            });
            let collected = normalize::collect(&rx, chunk_sink);
            (handle.join(), collected)
        });

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(_) => {
                debug_log_for("gateway", "adapter thread panicked");
                Err(BackendFailure::new(
                    backend_name(req.backend),
                    started.elapsed(),
                    "backend adapter panicked",
                ))
            }
        };

        let stop_reason = match outcome {
            Ok(AdapterOutcome::Cancelled) => StopReason::Cancelled,
            Ok(AdapterOutcome::Completed) => {
                if cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                    StopReason::Cancelled
                } else if !collected.completed && collected.error.is_some() {
                    // A stream-level error without completion is a failed
                    // attempt; an error alongside completion still yields
                    // the text, flagged on the Response.
                    let message = collected.error.clone().unwrap_or_default();
                    return Err(with_partial(
                        BackendFailure::new(
                            backend_name(req.backend),
                            started.elapsed(),
                            message,
                        ),
                        &collected.text,
                    ));
                } else if collected.error.is_some() {
                    StopReason::Error
                } else {
                    StopReason::Success
                }
            }
            Err(failure) => return Err(with_partial(failure, &collected.text)),
        };

        // This attempt produced the Response: release its chunks in order.
        if let Some(cb) = on_chunk {
            for chunk in &buffered {
                cb(chunk);
            }
        }
        Ok(self.finish(req, started, collected, stop_reason))
    }

    fn attempt_aggregate(
        &self,
        req: &Request,
        auth: Option<&Auth>,
        cancel: Option<Arc<CancelToken>>,
    ) -> Result<Response, BackendFailure> {
        let started = Instant::now();
        let raw = match req.backend {
            BackendKind::Cli => match self.process.execute_aggregate(req, cancel.clone())? {
                Aggregate::Output(raw) => raw,
                Aggregate::Cancelled => {
                    return Ok(self.finish(req, started, Collected::default(), StopReason::Cancelled));
                }
            },
            BackendKind::Api => {
                let auth = auth.ok_or_else(|| {
                    BackendFailure::new(
                        http::BACKEND_NAME,
                        started.elapsed(),
                        "no credential resolved for request",
                    )
                })?;
                self.http.execute_aggregate(req, auth)?
            }
        };
        if cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Ok(self.finish(req, started, Collected::default(), StopReason::Cancelled));
        }
        let extracted = normalize::from_aggregate(&raw);
        let collected = Collected {
            text: extracted.text,
            session_id: extracted.session_id,
            ..Collected::default()
        };
        Ok(self.finish(req, started, collected, StopReason::Success))
    }

    /// Every terminal path goes through here, so a Response is always fully
    /// populated regardless of how the attempt ended.
    fn finish(
        &self,
        req: &Request,
        started: Instant,
        collected: Collected,
        stop_reason: StopReason,
    ) -> Response {
        Response {
            text: collected.text,
            duration: started.elapsed(),
            model_used: req.model.clone(),
            session_id: collected.session_id,
            cost_estimate: collected.cost_usd,
            stop_reason,
            substitutions: Vec::new(),
        }
    }

    fn notify(&self, call: impl FnOnce(&dyn ExchangeObserver)) {
        if let Some(observer) = &self.observer {
            if catch_unwind(AssertUnwindSafe(|| call(observer.as_ref()))).is_err() {
                debug_log_for("gateway", "observer panicked, ignoring");
            }
        }
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

fn backend_name(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Cli => super::process::BACKEND_NAME,
        BackendKind::Api => http::BACKEND_NAME,
    }
}

fn with_partial(mut failure: BackendFailure, partial: &str) -> BackendFailure {
    if !partial.trim().is_empty() {
        failure.detail = format!("{}; partial output: {}", failure.detail, partial.trim());
    }
    failure
}
