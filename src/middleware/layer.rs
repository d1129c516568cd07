//! Admission control middleware for axum.
//!
//! Every request asks the daemon for a slot before reaching its handler.
//! Anonymous requests are turned away with `503 Service Unavailable` when the
//! daemon says no; authenticated requests always go through. Admitted
//! requests report their status and latency back to the daemon when they
//! finish.
//!
//! Diagnostic headers are added to gated responses:
//! - `X-AC-Limit`: current concurrency limit
//! - `X-AC-Inflight`: admitted requests in flight
//! - `X-AC-Degraded`: `1` if the last sampled request was slow
//! - `Retry-After`: seconds to wait (only on 503 responses)
//!
//! # Example
//!
//! ```ignore
//! use axum::{middleware, routing::get, Router};
//! use load_shedder::middleware::{admission_middleware, LoadShedder};
//!
//! let shedder = LoadShedder::from_config(&config);
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .layer(middleware::from_fn_with_state(shedder, admission_middleware));
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use tracing::{debug, warn};

use super::classify::{CookieClassifier, RequestClassifier};
use super::throttle::{WarnClass, WarnThrottle};
use crate::client::{AdmissionBackend, AdmissionClient, ClientDecision, CompletionReport, SharedClient};
use crate::config::ShedderConfig;
use crate::protocol::RequestKind;

/// Body of the 503 response.
pub const BUSY_BODY: &str = "The server is busy right now. Please try again shortly.";

/// Diagnostic header names.
pub mod names {
    use super::HeaderName;

    /// Current concurrency limit.
    pub static X_AC_LIMIT: HeaderName = HeaderName::from_static("x-ac-limit");
    /// Admitted requests currently in flight.
    pub static X_AC_INFLIGHT: HeaderName = HeaderName::from_static("x-ac-inflight");
    /// Whether the limiter is backing off.
    pub static X_AC_DEGRADED: HeaderName = HeaderName::from_static("x-ac-degraded");
    /// Handler-reported processing time in seconds.
    pub static X_RUNTIME: HeaderName = HeaderName::from_static("x-runtime");
}

/// Shared state of the admission middleware.
#[derive(Clone)]
pub struct LoadShedder {
    enabled: bool,
    backend: Arc<dyn AdmissionBackend>,
    classifier: Arc<dyn RequestClassifier>,
    retry_after_secs: u64,
    unsampled_path_prefixes: Arc<[String]>,
    throttle: Arc<WarnThrottle>,
}

impl LoadShedder {
    /// Build the middleware state around an existing backend.
    pub fn new(config: &ShedderConfig, backend: Arc<dyn AdmissionBackend>) -> Self {
        Self {
            enabled: config.enabled,
            backend,
            classifier: Arc::new(CookieClassifier::new(config.middleware.auth_cookie.clone())),
            retry_after_secs: config.middleware.retry_after_secs,
            unsampled_path_prefixes: config.middleware.unsampled_path_prefixes.clone().into(),
            throttle: Arc::new(WarnThrottle::new(config.warn_interval())),
        }
    }

    /// Build the middleware state talking to the daemon at
    /// `config.socket_path`.
    pub fn from_config(config: &ShedderConfig) -> Self {
        let client = SharedClient::new(AdmissionClient::from_config(config));
        Self::new(config, Arc::new(client))
    }

    /// Replace the default cookie-based classifier.
    pub fn with_classifier(mut self, classifier: impl RequestClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn handle(&self, request: Request, next: Next) -> Response {
        if !self.enabled {
            return next.run(request).await;
        }

        let kind = self.classify(&request);
        let sampled = !self.is_unsampled(request.uri().path());
        let start = Instant::now();

        let decision = self.backend.admit(kind).await;
        if !decision.contacted {
            self.warn(WarnClass::Admit, "Admission daemon unavailable, admitting unmetered");
        }

        let admitted = kind == RequestKind::User || decision.admitted;
        if !admitted {
            debug!(
                limit = ?decision.limit,
                inflight = ?decision.inflight,
                path = %request.uri().path(),
                "Shedding request"
            );
            return self.busy_response(&decision);
        }

        let guard = decision
            .contacted
            .then(|| CompletionGuard::new(self.backend.clone(), start));
        let outcome = AssertUnwindSafe(next.run(request)).catch_unwind().await;

        if let Some(guard) = guard {
            let (status, reported_ms) = match &outcome {
                Ok(response) => (response.status(), runtime_ms(response.headers())),
                Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
            };
            let report = CompletionReport {
                status: status.as_u16(),
                rtt_ms: reported_ms.unwrap_or_else(|| elapsed_ms(start)),
                sampled,
            };
            if !guard.finish(report).await {
                self.warn(WarnClass::Complete, "Failed to report completion to admission daemon");
            }
        }

        match outcome {
            Ok(mut response) => {
                attach_headers(response.headers_mut(), &decision);
                response
            }
            Err(panic) => {
                self.warn(WarnClass::Handler, "Handler panicked behind admission control");
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn classify(&self, request: &Request) -> RequestKind {
        match self.classifier.classify(request) {
            Ok(kind) => kind,
            Err(e) => {
                if self.throttle.should_emit(WarnClass::Classify) {
                    warn!(error = %e, "Request classification failed, treating as anonymous");
                }
                RequestKind::Anon
            }
        }
    }

    fn is_unsampled(&self, path: &str) -> bool {
        self.unsampled_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn busy_response(&self, decision: &ClientDecision) -> Response {
        let mut response = (StatusCode::SERVICE_UNAVAILABLE, BUSY_BODY).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        attach_headers(headers, decision);
        response
    }

    fn warn(&self, class: WarnClass, message: &str) {
        if self.throttle.should_emit(class) {
            warn!(class = ?class, "{}", message);
        }
    }
}

/// Status reported for a request whose future was dropped before the
/// handler produced a response.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Owns the slot taken by a contacted admission until its completion is
/// reported.
///
/// If the request future is dropped mid-handler the guard reports the
/// completion from a detached task, unsampled, so the daemon's inflight
/// count does not leak.
struct CompletionGuard {
    backend: Arc<dyn AdmissionBackend>,
    start: Instant,
    armed: bool,
}

impl CompletionGuard {
    fn new(backend: Arc<dyn AdmissionBackend>, start: Instant) -> Self {
        Self {
            backend,
            start,
            armed: true,
        }
    }

    /// Report the completion of a handler that ran to the end.
    async fn finish(mut self, report: CompletionReport) -> bool {
        // At most one report per admission, even if this await is cancelled
        self.armed = false;
        self.backend.complete(report).await
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let report = CompletionReport {
            status: CLIENT_CLOSED_REQUEST,
            rtt_ms: elapsed_ms(self.start),
            sampled: false,
        };
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(rtt_ms = report.rtt_ms, "Request dropped, releasing admission slot");
                runtime.spawn(async move {
                    if !backend.complete(report).await {
                        debug!("Failed to release slot of dropped request");
                    }
                });
            }
            Err(_) => warn!("No runtime to release slot of dropped request"),
        }
    }
}

/// Gate a request through the admission daemon.
///
/// Install with `axum::middleware::from_fn_with_state(shedder, admission_middleware)`.
pub async fn admission_middleware(
    State(shedder): State<LoadShedder>,
    request: Request,
    next: Next,
) -> Response {
    shedder.handle(request, next).await
}

/// Add the diagnostic headers for the values the decision carries.
fn attach_headers(headers: &mut HeaderMap, decision: &ClientDecision) {
    if let Some(limit) = decision.limit {
        headers.insert(names::X_AC_LIMIT.clone(), HeaderValue::from(limit));
    }
    if let Some(inflight) = decision.inflight {
        headers.insert(names::X_AC_INFLIGHT.clone(), HeaderValue::from(inflight));
    }
    let degraded = if decision.degraded { "1" } else { "0" };
    headers.insert(names::X_AC_DEGRADED.clone(), HeaderValue::from_static(degraded));
}

/// Handler-reported duration from `X-Runtime` (seconds), in milliseconds.
fn runtime_ms(headers: &HeaderMap) -> Option<f64> {
    let seconds: f64 = headers
        .get(&names::X_RUNTIME)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| (seconds * 1000.0).round())
}

fn elapsed_ms(start: Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 1000.0).round()
}
