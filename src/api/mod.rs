//! HTTP layer for the admission gate.
//!
//! `enforce_admission` runs before the protected routes. Allowed requests
//! get `RateLimit-*` headers on the way out; denied ones get a 429 with
//! `Retry-After` and never reach the handler.

pub mod events;

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::admission::{AdmissionController, SweeperHandle, Sweeper, Verdict};
use crate::keys::RequestMeta;
use events::{AdmissionEvent, EventLog, MAX_EVENTS};

const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
const RATELIMIT_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");

const DENIED_MESSAGE: &str = "Too many requests, please try again later.";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: AdmissionController,
    pub events: EventLog,
}

impl AppState {
    pub fn new(controller: AdmissionController) -> Self {
        Self {
            controller,
            events: EventLog::new(),
        }
    }
}

/// Authenticated user id, inserted as a request extension by whatever
/// authentication layer runs in front of the gate. This router installs no
/// such layer, so on its own the `subject` strategy keys by IP and route.
#[derive(Debug, Clone)]
pub struct AuthenticatedSubject(pub String);

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }
}

impl ApiResponse<()> {
    pub fn err(msg: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(msg.into()) }
    }
}

/// Body of a 429
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeniedBody {
    success: bool,
    error: &'static str,
    retry_after_seconds: u64,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/api/auth/login", post(passthrough))
        .route("/api/auth/register", post(passthrough))
        .route("/api/products", get(passthrough))
        .route("/api/admin/users", get(passthrough))
        .route_layer(middleware::from_fn_with_state(state.clone(), enforce_admission));

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Introspection, never limited
        .route("/admission/stats", get(get_stats))
        .route("/admission/events", get(get_events))
        .route("/admission/policies", get(get_policies))
        .merge(limited)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Gather what the key extractor needs from an axum request
pub fn request_meta(request: &Request) -> RequestMeta {
    let headers = request.headers();
    RequestMeta {
        forwarded_for: header_str(headers, "x-forwarded-for"),
        connecting_ip: header_str(headers, "cf-connecting-ip")
            .or_else(|| header_str(headers, "x-real-ip")),
        peer_addr: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr),
        route: Some(request.uri().path().to_string()),
        subject: request
            .extensions()
            .get::<AuthenticatedSubject>()
            .map(|s| s.0.clone()),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Admission middleware
pub async fn enforce_admission(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let meta = request_meta(&request);
    let verdict = state.controller.check(&meta);

    if !verdict.allowed() {
        let retry_after_secs = verdict.retry_after_secs();
        state
            .events
            .push(AdmissionEvent::RequestDenied {
                timestamp: verdict.now,
                route: request.uri().path().to_string(),
                policy: verdict.policy_name.clone(),
                limit: verdict.decision.limit,
                retry_after_secs,
            })
            .await;

        return denied_response(&verdict);
    }

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &verdict);
    response
}

/// 429 with retry hint. Carries nothing about the key or client.
pub fn denied_response(verdict: &Verdict) -> Response {
    let retry_after_secs = verdict.retry_after_secs();
    let body = DeniedBody {
        success: false,
        error: DENIED_MESSAGE,
        retry_after_seconds: retry_after_secs,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    apply_rate_limit_headers(headers, verdict);
    response
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    let decision = &verdict.decision;
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATELIMIT_RESET, HeaderValue::from(verdict.retry_after_secs()));

    let policy = format!(
        "{};w={};name=\"{}\"",
        verdict.policy.max_requests(),
        verdict.policy.window_secs(),
        verdict.policy_name
    );
    match HeaderValue::from_str(&policy) {
        Ok(value) => {
            headers.insert(RATELIMIT_POLICY, value);
        }
        Err(_) => warn!("Policy name {:?} is not a valid header value", verdict.policy_name),
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("Admission gate is alive"))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(ApiResponse::<()>::err("Not found")))
}

/// Stand-in for the upstream handler behind the gate
async fn passthrough(uri: Uri) -> impl IntoResponse {
    #[derive(Serialize)]
    struct Accepted {
        route: String,
    }

    Json(ApiResponse::ok(Accepted { route: uri.path().to_string() }))
}

/// Admission counters
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(state.controller.stats()))
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

/// Recent admission events, newest first
async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).min(MAX_EVENTS);
    Json(ApiResponse::ok(state.events.latest(limit).await))
}

/// Active policy table
async fn get_policies(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(state.controller.policies().clone()))
}

/// Start the sweeper, recording each eviction pass in the event log
pub fn spawn_sweeper(state: &AppState, interval: Duration) -> SweeperHandle {
    let events = state.events.clone();
    Sweeper::spawn_with(state.controller.clone(), interval, move |report| {
        let events = events.clone();
        tokio::spawn(async move {
            events
                .push(AdmissionEvent::SweepCompleted {
                    timestamp: report.timestamp,
                    evicted: report.evicted,
                    remaining: report.remaining,
                })
                .await;
        });
    })
}

/// Start the API server; returns once `shutdown` resolves and in-flight
/// requests have drained.
pub async fn start_server<F>(state: AppState, addr: &str, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("🌐 API server listening on {}", addr);
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::{KeyExtractor, KeyStrategy};
    use crate::policy::{PolicyRule, PolicyTable};
    use crate::types::Policy;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use std::sync::Arc;
    use tower::ServiceExt;

    const T: u64 = 1_700_000_000_000;

    fn state(strategy: KeyStrategy) -> (AppState, ManualClock) {
        let table = PolicyTable::standard()
            .unwrap()
            .with_overrides(vec![PolicyRule::new(
                "/api/auth",
                "login",
                Policy::new(5, 60_000).unwrap(),
            )])
            .unwrap();
        let clock = ManualClock::new(T);
        let controller = AdmissionController::with_clock(
            table,
            KeyExtractor::new(strategy),
            Arc::new(clock.clone()),
        );
        (AppState::new(controller), clock)
    }

    fn login(ip: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/auth/login")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_request_carries_headers() {
        let (state, _) = state(KeyStrategy::IpRoute);
        let response = create_router(state).oneshot(login("1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["ratelimit-limit"], "5");
        assert_eq!(headers["ratelimit-remaining"], "4");
        assert_eq!(headers["ratelimit-reset"], "60");
        assert_eq!(headers["ratelimit-policy"], "5;w=60;name=\"login\"");
        assert!(headers.get(header::RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_sixth_login_is_rejected_then_recovers() {
        let (state, clock) = state(KeyStrategy::IpRoute);
        let app = create_router(state.clone());

        for _ in 0..5 {
            let response = app.clone().oneshot(login("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            clock.advance(2_000);
        }

        let response = app.clone().oneshot(login("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "50");
        assert_eq!(response.headers()["ratelimit-remaining"], "0");

        let body = json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["retryAfterSeconds"], 50);
        assert!(!body.to_string().contains("1.2.3.4"));

        clock.set(T + 60_000);
        let response = app.oneshot(login("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let events = state.events.latest(10).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AdmissionEvent::RequestDenied { policy, retry_after_secs: 50, .. } if policy == "login"
        ));
    }

    #[tokio::test]
    async fn test_clients_limited_independently() {
        let (state, _) = state(KeyStrategy::IpRoute);
        let app = create_router(state);

        for _ in 0..6 {
            app.clone().oneshot(login("1.1.1.1")).await.unwrap();
        }
        let response = app.oneshot(login("2.2.2.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_peer_address_used_without_forwarding_headers() {
        let (state, _) = state(KeyStrategy::Ip);
        let app = create_router(state.clone());

        let mut request = Request::builder().uri("/api/products").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("10.1.2.3:4567".parse().unwrap()));
        assert_eq!(request_meta(&request).peer_addr.unwrap().port(), 4567);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["ratelimit-remaining"], "99");
    }

    #[tokio::test]
    async fn test_subject_extension_selects_user_bucket() {
        let (state, _) = state(KeyStrategy::Subject);

        let mut request = login("1.2.3.4");
        request
            .extensions_mut()
            .insert(AuthenticatedSubject("user-7".into()));
        let meta = request_meta(&request);
        assert_eq!(meta.subject.as_deref(), Some("user-7"));

        let verdict = state.controller.check(&meta);
        assert_eq!(verdict.key.as_str(), "user:user-7|policy:/api/auth");
    }

    #[tokio::test]
    async fn test_subject_strategy_without_auth_layer_keys_by_ip_route() {
        let (state, _) = state(KeyStrategy::Subject);
        let app = create_router(state.clone());

        let response = app.oneshot(login("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let verdict = state.controller.check(&request_meta(&login("1.2.3.4")));
        assert_eq!(
            verdict.key.as_str(),
            "ip:1.2.3.4|route:/api/auth/login|policy:/api/auth"
        );
        assert_eq!(verdict.decision.remaining, 3);
    }

    #[tokio::test]
    async fn test_cf_connecting_ip_wins_over_x_real_ip() {
        let (state, _) = state(KeyStrategy::Ip);
        let app = create_router(state);

        let request = |cf: Option<&str>, real: Option<&str>| {
            let mut builder = Request::builder().method(Method::POST).uri("/api/auth/login");
            if let Some(ip) = cf {
                builder = builder.header("cf-connecting-ip", ip);
            }
            if let Some(ip) = real {
                builder = builder.header("x-real-ip", ip);
            }
            builder.body(Body::empty()).unwrap()
        };

        let both = request(Some("7.7.7.7"), Some("8.8.8.8"));
        assert_eq!(request_meta(&both).connecting_ip.as_deref(), Some("7.7.7.7"));

        // Five logins sent with both headers spend the Cloudflare address's quota
        for _ in 0..5 {
            let response = app.clone().oneshot(request(Some("7.7.7.7"), Some("8.8.8.8"))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request(None, Some("7.7.7.7"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.clone().oneshot(request(None, Some("8.8.8.8"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["ratelimit-remaining"], "4");

        let response = app.oneshot(request(Some("8.8.8.8"), None)).await.unwrap();
        assert_eq!(response.headers()["ratelimit-remaining"], "3");
    }

    #[tokio::test]
    async fn test_introspection_routes_are_not_limited() {
        let (state, _) = state(KeyStrategy::IpRoute);
        let app = create_router(state);

        for _ in 0..20 {
            let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let request = Request::builder().uri("/admission/stats").body(Body::empty()).unwrap();
        let body = json(app.oneshot(request).await.unwrap()).await;
        assert_eq!(body["data"]["allowed"], 0);
        assert_eq!(body["data"]["trackedKeys"], 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_json() {
        let (state, _) = state(KeyStrategy::IpRoute);
        let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let response = create_router(state.clone()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["error"], "Not found");
        assert_eq!(state.controller.stats().tracked_keys, 0);
    }

    #[tokio::test]
    async fn test_events_endpoint_respects_limit() {
        let (state, _) = state(KeyStrategy::IpRoute);
        let app = create_router(state.clone());

        for _ in 0..8 {
            app.clone().oneshot(login("9.9.9.9")).await.unwrap();
        }

        let request = Request::builder()
            .uri("/admission/events?limit=2")
            .body(Body::empty())
            .unwrap();
        let body = json(app.oneshot(request).await.unwrap()).await;
        let events = body["data"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "request_denied");
        assert_eq!(state.events.len().await, 3);
    }
}
