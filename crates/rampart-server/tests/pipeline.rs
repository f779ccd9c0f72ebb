//! End-to-end checks of the middleware pipeline, driven through the router
//! without binding a socket.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    middleware,
    response::Response,
    routing::get,
};
use jsonwebtoken::{EncodingKey, Header, encode};
use parking_lot::Mutex;
use rampart_server::{
    AppConfig, AppState, build_app,
    config::RunMode,
    middleware::{
        auth::Claims,
        recover::{install_panic_hook, panic_guard},
        request_id::request_id_middleware,
        timeout::{RequestTimeout, timeout_middleware},
    },
};
use serde_json::Value;
use tower::ServiceExt;

const SECRET: &str = "pipeline-test-secret";

fn dev_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.auth.jwt_secret = SECRET.to_string();
    cfg
}

fn bearer(subject: &str) -> String {
    let claims = Claims {
        sub: subject.to_string(),
        exp: time::OffsetDateTime::now_utc().unix_timestamp() + 3600,
        iss: None,
        roles: vec!["reader".into()],
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("encode token");
    format!("Bearer {token}")
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn request_id_of(response: &Response) -> String {
    response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn is_generated_id(id: &str) -> bool {
    id.len() == 36 && id.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_request_id_is_generated_and_echoed() {
    let state = AppState::new(dev_config(), None, None);
    let app = build_app(&state);

    let response = app.clone().oneshot(get_req("/ping")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let generated = request_id_of(&response);
    assert!(is_generated_id(&generated), "unexpected id {generated}");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ping")
                .header("x-request-id", "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(request_id_of(&response), "abc-123");
}

fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || writer.clone())
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

#[tokio::test]
async fn test_access_log_carries_request_id() {
    let (buffer, _guard) = capture_logs();

    let state = AppState::new(dev_config(), None, None);
    let app = build_app(&state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/whoami")
                .header("x-request-id", "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let logs = buffer.contents();
    let line = logs
        .lines()
        .find(|l| l.contains("/api/v1/whoami") && l.contains("status=401"))
        .unwrap_or_else(|| panic!("no access log line in:\n{logs}"));
    assert!(line.contains("abc-123"));
}

#[tokio::test]
async fn test_access_log_carries_minted_request_id() {
    let (buffer, _guard) = capture_logs();

    let state = AppState::new(dev_config(), None, None);
    let response = build_app(&state)
        .oneshot(get_req("/api/v1/whoami"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let minted = request_id_of(&response);
    assert!(is_generated_id(&minted), "unexpected id {minted}");

    let logs = buffer.contents();
    let line = logs
        .lines()
        .find(|l| l.contains("/api/v1/whoami") && l.contains("status=401"))
        .unwrap_or_else(|| panic!("no access log line in:\n{logs}"));
    assert!(line.contains(&minted), "{minted} missing from: {line}");
}

#[tokio::test]
async fn test_security_headers_on_api_responses() {
    let state = AppState::new(dev_config(), None, None);
    let response = build_app(&state)
        .oneshot(get_req("/api/v1/whoami"))
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["cache-control"], "no-store");
    assert!(headers.contains_key("content-security-policy"));
    assert!(headers.contains_key("referrer-policy"));
}

#[tokio::test]
async fn test_unknown_route_is_enveloped_404() {
    let state = AppState::new(dev_config(), None, None);
    let response = build_app(&state)
        .oneshot(get_req("/nope"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], 4004);
}

#[tokio::test]
async fn test_cors_preflight() {
    let mut cfg = dev_config();
    cfg.server.mode = RunMode::Production;
    cfg.cors.allowed_origins = vec!["https://app.example.com".into()];
    let state = AppState::new(cfg, None, None);
    let app = build_app(&state);

    let preflight = |origin: &str| {
        Request::builder()
            .method("OPTIONS")
            .uri("/api/v1/whoami")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization")
            .body(Body::empty())
            .unwrap()
    };

    let allowed = app
        .clone()
        .oneshot(preflight("https://app.example.com"))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://app.example.com"
    );
    assert_eq!(
        allowed.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
        "authorization"
    );

    let denied = app
        .clone()
        .oneshot(preflight("https://evil.example.com"))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    // Localhost is a development convenience only.
    let local = app.oneshot(preflight("http://localhost:3000")).await.unwrap();
    assert_eq!(local.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_auth_required_for_whoami() {
    let state = AppState::new(dev_config(), None, None);
    let app = build_app(&state);

    let anonymous = app.clone().oneshot(get_req("/api/v1/whoami")).await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(anonymous).await["code"], 4001);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/whoami")
                .header(header::AUTHORIZATION, bearer("user-7"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["subject"], "user-7");
    assert_eq!(body["data"]["roles"][0], "reader");
}

#[tokio::test]
async fn test_auth_limiter_returns_429() {
    let mut cfg = dev_config();
    cfg.rate_limit.auth_burst = 1.0;
    cfg.rate_limit.auth_per_minute = 0.1;
    let state = AppState::new(cfg, None, None);
    let app = build_app(&state);

    let login = || {
        Request::builder()
            .method("POST")
            .uri("/api/v1/auth/login")
            .body(Body::empty())
            .unwrap()
    };

    let first = app.clone().oneshot(login()).await.unwrap();
    assert_eq!(first.status(), StatusCode::NOT_IMPLEMENTED);

    let second = app.oneshot(login()).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(second).await["code"], 4029);

    state.limiters.stop_all().await;
}

#[tokio::test]
async fn test_open_breaker_returns_503() {
    let mut cfg = dev_config();
    cfg.breaker.min_requests = 1;
    let state = AppState::new(cfg, None, None);
    let app = build_app(&state);

    let breaker = state.breakers.get("api");
    breaker.try_acquire().unwrap().record(false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/whoami")
                .header(header::AUTHORIZATION, bearer("user-7"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], 5003);
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "late"
}

async fn boom() -> &'static str {
    panic!("handler exploded")
}

fn guarded(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(panic_guard))
}

#[tokio::test]
async fn test_timeout_returns_408() {
    let app = guarded(Router::new().route("/slow", get(slow)).route_layer(
        middleware::from_fn_with_state(
            RequestTimeout(Duration::from_millis(50)),
            timeout_middleware,
        ),
    ));

    let response = app.oneshot(get_req("/slow")).await.unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert!(is_generated_id(&request_id_of(&response)));
    assert_eq!(body_json(response).await["code"], 4008);
}

#[tokio::test]
async fn test_panic_becomes_500_with_request_id() {
    install_panic_hook();
    let app = guarded(Router::new().route("/boom", get(boom)));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/boom")
                .header("x-request-id", "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(request_id_of(&response), "abc-123");
    let body = body_json(response).await;
    assert_eq!(body["code"], 5000);
    // The panic message is logged, never returned.
    assert!(!body.to_string().contains("exploded"));
}

#[tokio::test]
async fn test_panic_under_timeout_is_recovered() {
    install_panic_hook();
    let app = guarded(Router::new().route("/boom", get(boom)).route_layer(
        middleware::from_fn_with_state(
            RequestTimeout(Duration::from_secs(5)),
            timeout_middleware,
        ),
    ));

    let response = app.oneshot(get_req("/boom")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(is_generated_id(&request_id_of(&response)));
    assert_eq!(body_json(response).await["code"], 5000);
}
