//! Admission control middleware.
//!
//! Each request is resolved to a client identity, checked against the
//! override lists and then charged one token from that client's bucket.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};
use tracing::{debug, info, trace, warn};

use super::response::{AccessDenied, RateLimited};
use crate::config::AdmissionSettings;
use crate::ratelimit::identity::{self, ClientIdentity};
use crate::ratelimit::{Decision, LimiterRegistry, Override, OverrideLists};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATE_LIMIT_IP: HeaderName = HeaderName::from_static("x-rate-limit-ip");
pub const X_RATE_LIMIT_ACTIVE_IPS: HeaderName = HeaderName::from_static("x-rate-limit-active-ips");

/// Raw peer address for transports that do not provide `ConnectInfo`.
#[derive(Debug, Clone)]
pub struct RemoteAddr(pub String);

struct AdmissionState {
    registry: Arc<LimiterRegistry>,
    overrides: OverrideLists,
    limit: u32,
    window_secs: u64,
}

impl AdmissionState {
    /// Decide what to do with a request from `identity`.
    fn admit(&self, identity: &ClientIdentity) -> Verdict {
        match self.overrides.check(identity.as_str()) {
            Override::Allow => return Verdict::Bypass,
            Override::Deny => return Verdict::Denied,
            Override::None => {}
        }

        let bucket = self.registry.get_or_create(identity.as_str());
        let clock = self.registry.clock();
        let decision = bucket.try_acquire(clock.now());
        let reset = clock.unix_timestamp() + self.window_secs as i64;

        Verdict::Limited { decision, reset }
    }

    fn quota_headers(&self, headers: &mut HeaderMap, decision: &Decision, reset: i64) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining_display()));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset));
    }
}

enum Verdict {
    Bypass,
    Denied,
    Limited { decision: Decision, reset: i64 },
}

/// Tower layer that wraps a service with admission control.
#[derive(Clone)]
pub struct AdmissionLayer {
    state: Arc<AdmissionState>,
}

impl AdmissionLayer {
    /// Build a layer around an existing registry.
    ///
    /// The registry is shared so its sweeper can be managed by the caller.
    pub fn new(settings: &AdmissionSettings, registry: Arc<LimiterRegistry>) -> Self {
        Self {
            state: Arc::new(AdmissionState {
                registry,
                overrides: settings.overrides.clone(),
                limit: settings.limit.get(),
                window_secs: settings.window_secs(),
            }),
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            state: Arc::clone(&self.state),
        }
    }
}

/// Tower service produced by [`AdmissionLayer`].
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    state: Arc<AdmissionState>,
}

impl<S> Service<Request> for AdmissionService<S>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let remote = remote_addr(&req);
        let identity = identity::resolve(req.headers(), remote.as_deref());

        // Take the service that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        match self.state.admit(&identity) {
            Verdict::Bypass => {
                trace!(identity = %identity, "Client on allow list, skipping limiter");
                Box::pin(async move { Ok(inner.call(req).await?.into_response()) })
            }
            Verdict::Denied => {
                debug!(identity = %identity, path = %req.uri().path(), "Client on deny list");
                Box::pin(async move { Ok(AccessDenied.into_response()) })
            }
            Verdict::Limited { decision, reset } if !decision.admitted => {
                let user_agent = req
                    .headers()
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                warn!(
                    identity = %identity,
                    user_agent = %user_agent,
                    path = %req.uri().path(),
                    "Rate limit exceeded"
                );

                let mut response = RateLimited {
                    retry_after_secs: self.state.window_secs,
                }
                .into_response();
                self.state.quota_headers(response.headers_mut(), &decision, reset);
                Box::pin(async move { Ok(response) })
            }
            Verdict::Limited { decision, reset } => {
                let active = self.state.registry.count();
                let state = Arc::clone(&self.state);

                Box::pin(async move {
                    let mut response = inner.call(req).await?.into_response();
                    let headers = response.headers_mut();
                    state.quota_headers(headers, &decision, reset);
                    if let Ok(value) = HeaderValue::from_str(identity.as_str()) {
                        headers.insert(X_RATE_LIMIT_IP, value);
                    }
                    headers.insert(X_RATE_LIMIT_ACTIVE_IPS, HeaderValue::from(active));
                    Ok(response)
                })
            }
        }
    }
}

/// Peer address as a string, from `ConnectInfo` or [`RemoteAddr`].
fn remote_addr(req: &Request) -> Option<String> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.to_string());
    }
    req.extensions().get::<RemoteAddr>().map(|r| r.0.clone())
}

/// Build an admission layer from settings.
///
/// Returns `None` if admission control is disabled, so a disabled
/// deployment pays nothing per request.
pub fn build_admission_layer(
    settings: &AdmissionSettings,
    registry: Arc<LimiterRegistry>,
) -> Option<AdmissionLayer> {
    if !settings.enabled {
        info!("Rate limiting is disabled");
        return None;
    }

    Some(AdmissionLayer::new(settings, registry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::RateLimitSettings;
    use crate::http::response::ErrorBody;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;
    use tower::ServiceExt;

    const UNIX_START: i64 = 1_700_000_000;

    fn settings(limit: i64, window: &str, allow: &str, deny: &str) -> AdmissionSettings {
        RateLimitSettings {
            enabled: true,
            limit,
            window: window.to_string(),
            allow_list: allow.to_string(),
            deny_list: deny.to_string(),
            ..RateLimitSettings::default()
        }
        .resolve()
    }

    struct Harness {
        app: Router,
        registry: Arc<LimiterRegistry>,
        clock: Arc<ManualClock>,
    }

    fn harness(settings: AdmissionSettings) -> Harness {
        let clock = Arc::new(ManualClock::starting_at(UNIX_START));
        let registry = Arc::new(LimiterRegistry::new(settings.quota(), settings.registry, clock.clone()));
        let layer = build_admission_layer(&settings, registry.clone()).unwrap();
        let app = Router::new().route("/", get(|| async { "ok" })).layer(layer);
        Harness { app, registry, clock }
    }

    fn request_from(addr: &str) -> Request {
        let mut req = axum::http::Request::builder().uri("/").body(Body::empty()).unwrap();
        let addr: SocketAddr = addr.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    async fn send(app: &Router, req: Request) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    fn header_str(response: &Response, name: HeaderName) -> Option<String> {
        response
            .headers()
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
    }

    async fn body_json(response: Response) -> ErrorBody {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_disabled_builds_no_layer() {
        let mut disabled = settings(10, "1m", "", "");
        disabled.enabled = false;
        let registry = Arc::new(LimiterRegistry::new(
            disabled.quota(),
            disabled.registry,
            Arc::new(ManualClock::new()),
        ));
        assert!(build_admission_layer(&disabled, registry).is_none());
    }

    #[tokio::test]
    async fn test_window_scenario() {
        let h = harness(settings(2, "10s", "", ""));

        let first = send(&h.app, request_from("203.0.113.5:40000")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(header_str(&first, X_RATELIMIT_LIMIT).as_deref(), Some("2"));
        assert_eq!(header_str(&first, X_RATELIMIT_REMAINING).as_deref(), Some("1"));
        assert_eq!(
            header_str(&first, X_RATELIMIT_RESET),
            Some((UNIX_START + 10).to_string())
        );

        h.clock.advance(Duration::from_secs(1));
        let second = send(&h.app, request_from("203.0.113.5:40001")).await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(header_str(&second, X_RATELIMIT_REMAINING).as_deref(), Some("0"));

        h.clock.advance(Duration::from_secs(1));
        let third = send(&h.app, request_from("203.0.113.5:40002")).await;
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header_str(&third, header::RETRY_AFTER).as_deref(), Some("10"));
        assert_eq!(header_str(&third, X_RATELIMIT_LIMIT).as_deref(), Some("2"));
        assert_eq!(header_str(&third, X_RATELIMIT_REMAINING).as_deref(), Some("0"));
        assert!(header_str(&third, X_RATE_LIMIT_IP).is_none());
        let body = body_json(third).await;
        assert!(!body.success);
        assert_eq!(body.message, "Rate limit exceeded. Please try again in 10 seconds");

        h.clock.advance(Duration::from_secs(9));
        let fourth = send(&h.app, request_from("203.0.113.5:40003")).await;
        assert_eq!(fourth.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_burst_plus_one_is_rejected() {
        let h = harness(settings(5, "1m", "", ""));

        for i in 0..5 {
            let response = send(&h.app, request_from("192.0.2.10:1000")).await;
            assert_eq!(response.status(), StatusCode::OK, "request {} should pass", i + 1);
        }

        let response = send(&h.app, request_from("192.0.2.10:1000")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header_str(&response, header::RETRY_AFTER).as_deref(), Some("60"));
    }

    #[tokio::test]
    async fn test_admitted_response_carries_diagnostics() {
        let h = harness(settings(5, "1m", "", ""));

        send(&h.app, request_from("192.0.2.1:1000")).await;
        let response = send(&h.app, request_from("192.0.2.2:1000")).await;

        assert_eq!(header_str(&response, X_RATE_LIMIT_IP).as_deref(), Some("192.0.2.2"));
        assert_eq!(header_str(&response, X_RATE_LIMIT_ACTIVE_IPS).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_identity_from_forwarded_chain() {
        let h = harness(settings(5, "1m", "", ""));

        let mut req = request_from("127.0.0.1:5000");
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("10.0.0.9, 10.0.0.1"));
        let response = send(&h.app, req).await;

        assert_eq!(header_str(&response, X_RATE_LIMIT_IP).as_deref(), Some("10.0.0.9"));
        assert!(h.registry.contains("10.0.0.9"));
        assert!(!h.registry.contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_raw_remote_addr_extension() {
        let h = harness(settings(5, "1m", "", ""));

        let mut req = axum::http::Request::builder().uri("/").body(Body::empty()).unwrap();
        req.extensions_mut().insert(RemoteAddr("198.51.100.7:54321".to_string()));
        let response = send(&h.app, req).await;

        assert_eq!(header_str(&response, X_RATE_LIMIT_IP).as_deref(), Some("198.51.100.7"));
    }

    #[tokio::test]
    async fn test_allow_listed_never_limited() {
        let h = harness(settings(1, "1m", "192.0.2.50", ""));

        for _ in 0..20 {
            let response = send(&h.app, request_from("192.0.2.50:1000")).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(header_str(&response, X_RATELIMIT_LIMIT).is_none());
        }

        assert!(!h.registry.contains("192.0.2.50"));
        assert_eq!(h.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_deny_listed_always_rejected() {
        let h = harness(settings(100, "1m", "", "192.0.2.66"));

        let response = send(&h.app, request_from("192.0.2.66:1000")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(header_str(&response, X_RATELIMIT_LIMIT).is_none());
        assert!(header_str(&response, X_RATELIMIT_REMAINING).is_none());
        assert!(header_str(&response, header::RETRY_AFTER).is_none());
        assert_eq!(body_json(response).await.message, "Access denied");
        assert_eq!(h.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_allow_beats_deny() {
        let h = harness(settings(1, "1m", "192.0.2.77", "192.0.2.77"));

        for _ in 0..3 {
            let response = send(&h.app, request_from("192.0.2.77:1000")).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_share_one_entry() {
        let h = harness(settings(100, "1m", "", ""));

        let requests = (0..32).map(|_| {
            let app = h.app.clone();
            tokio::spawn(async move { send(&app, request_from("198.51.100.99:1234")).await })
        });
        let responses = futures::future::join_all(requests).await;

        for response in responses {
            assert_eq!(response.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(h.registry.count(), 1);
        let remaining = h
            .registry
            .get_or_create("198.51.100.99")
            .tokens(h.clock.now());
        assert_eq!(remaining, 68.0);
    }

    #[tokio::test]
    async fn test_idle_client_evicted_then_recreated() {
        let h = harness(settings(1, "1m", "", ""));

        send(&h.app, request_from("192.0.2.5:1000")).await;
        assert!(h.registry.contains("192.0.2.5"));

        h.clock.advance(Duration::from_secs(2 * 60 * 60));
        assert_eq!(h.registry.sweep(), 1);
        assert!(!h.registry.contains("192.0.2.5"));

        let response = send(&h.app, request_from("192.0.2.5:1000")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
