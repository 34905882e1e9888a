//! Integration tests for the balancer.
//!
//! These tests drive the full router against mock upstreams and verify:
//! - Request forwarding and model rewriting
//! - Retry across backends and the 502 on exhaustion
//! - SSE relay framing
//! - CORS, method handling and the listing endpoints

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use llm_balancer::{
    build_router,
    core::config::AppConfig,
    services::{BackendSelector, SeededRandom},
    AppState,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header as header_matcher, method, path};
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

/// Echoes the model it was sent, like a real completion endpoint does.
struct EchoModel {
    backend: &'static str,
}

impl Respond for EchoModel {
    fn respond(&self, request: &wiremock::Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        ResponseTemplate::new(200).set_body_json(json!({
            "object": "chat.completion",
            "model": body["model"],
            "backend": self.backend
        }))
    }
}

fn create_test_app(yaml: &str) -> Router {
    let config = AppConfig::from_yaml(yaml).unwrap();
    let selector = BackendSelector::with_random(&config, Arc::new(SeededRandom::new(7)));
    let state = AppState::with_selector(config, selector).unwrap();
    build_router(Arc::new(state))
}

fn chat_request(body: Value) -> Request<Body> {
    Request::post("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_non_streaming_response_copied_verbatim() {
    let upstream = MockServer::start().await;
    let raw = r#"{"id":"chatcmpl-1","model":"alpha-1","choices":[]}"#;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header_matcher("authorization", "Bearer sk-alpha"))
        .and(body_partial_json(json!({
            "model": "alpha-1",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.3
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(raw, "application/json"))
        .expect(1)
        .mount(&upstream)
        .await;

    let app = create_test_app(&format!(
        r#"
backends:
  - name: alpha
    url: {}/v1
    api_key: sk-alpha
    models: [alpha-1]
"#,
        upstream.uri()
    ));

    let response = app
        .oneshot(chat_request(json!({
            "model": "alpha-1",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.3
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_bytes(response).await, raw.as_bytes());
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&upstream)
        .await;

    let app = create_test_app(&format!(
        "backends:\n  - name: a\n    url: {}\n    default_model: m\n",
        upstream.uri()
    ));

    let mut request = chat_request(json!({"model": "auto"}));
    request
        .headers_mut()
        .insert("x-request-id", "req-123".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-123");
}

#[tokio::test]
async fn test_retry_moves_to_next_backend_until_success() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    let third = MockServer::start().await;

    for server in [&first, &second] {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .expect(1)
            .mount(server)
            .await;
    }
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"model": "c-default"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(r#"{"id":"from-c"}"#, "application/json"),
        )
        .expect(1)
        .mount(&third)
        .await;

    let app = create_test_app(&format!(
        r#"
mode: round-robin
retry: 3
backends:
  - {{ name: a, url: "{}", default_model: a-default }}
  - {{ name: b, url: "{}", default_model: b-default }}
  - {{ name: c, url: "{}", default_model: c-default }}
"#,
        first.uri(),
        second.uri(),
        third.uri()
    ));

    let response = app
        .oneshot(chat_request(json!({"model": "auto", "messages": []})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, br#"{"id":"from-c"}"#);
}

#[tokio::test]
async fn test_all_backends_failing_returns_bad_gateway() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("first down"))
        .mount(&first)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("final detail"))
        .mount(&second)
        .await;

    let app = create_test_app(&format!(
        r#"
mode: round-robin
retry: 2
backends:
  - {{ name: a, url: "{}", default_model: m }}
  - {{ name: b, url: "{}", default_model: m }}
"#,
        first.uri(),
        second.uri()
    ));

    let response = app
        .oneshot(chat_request(json!({"model": ""})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], 502);
    assert_eq!(
        body["error"]["message"],
        "All backends failed: HTTP 500: final detail"
    );
}

#[tokio::test]
async fn test_unreachable_backend_is_retried() {
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(EchoModel { backend: "healthy" })
        .expect(1)
        .mount(&healthy)
        .await;

    let app = create_test_app(&format!(
        r#"
mode: round-robin
timeout: 2s
backends:
  - {{ name: dead, url: "http://127.0.0.1:1", default_model: dead-model }}
  - {{ name: healthy, url: "{}", default_model: healthy-model }}
"#,
        healthy.uri()
    ));

    let response = app
        .oneshot(chat_request(json!({"messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["backend"], "healthy");
    assert_eq!(body["model"], "healthy-model");
}

#[tokio::test]
async fn test_unknown_model_gets_backend_default() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(EchoModel { backend: "one" })
        .mount(&first)
        .await;
    Mock::given(method("POST"))
        .respond_with(EchoModel { backend: "two" })
        .mount(&second)
        .await;

    let app = create_test_app(&format!(
        r#"
backends:
  - {{ name: one, url: "{}", default_model: one-default, models: [m1] }}
  - {{ name: two, url: "{}", default_model: two-default, models: [m2] }}
"#,
        first.uri(),
        second.uri()
    ));

    let response = app
        .oneshot(chat_request(json!({"model": "gpt-x", "stream": false})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let expected = match body["backend"].as_str() {
        Some("one") => "one-default",
        Some("two") => "two-default",
        other => panic!("unexpected backend {:?}", other),
    };
    assert_eq!(body["model"], expected);
}

#[tokio::test]
async fn test_exact_model_routes_to_listing_backend() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(EchoModel { backend: "one" })
        .expect(0)
        .mount(&first)
        .await;
    Mock::given(method("POST"))
        .respond_with(EchoModel { backend: "two" })
        .expect(1)
        .mount(&second)
        .await;

    let app = create_test_app(&format!(
        r#"
backends:
  - {{ name: one, url: "{}", default_model: one-default, weight: 100 }}
  - {{ name: two, url: "{}", models: [special] }}
"#,
        first.uri(),
        second.uri()
    ));

    let response = app
        .oneshot(chat_request(json!({"model": "special"})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["backend"], "two");
    assert_eq!(body["model"], "special");
}

#[tokio::test]
async fn test_streaming_relay_reframes_lines() {
    let upstream = MockServer::start().await;
    let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
               \n\
               data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\r\n\r\n\
               data: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"stream": true, "model": "s-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(&upstream)
        .await;

    let app = create_test_app(&format!(
        "backends:\n  - name: s\n    url: {}\n    default_model: s-model\n",
        upstream.uri()
    ));

    let response = app
        .oneshot(chat_request(json!({"model": "auto", "stream": true})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(response.headers()[header::CONNECTION], "keep-alive");

    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(
        body,
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
         data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
         data: [DONE]\n\n"
    );
}

#[tokio::test]
async fn test_streaming_error_status_is_retried() {
    let failing = MockServer::start().await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .expect(1)
        .mount(&failing)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("data: ok\n\ndata: [DONE]\n\n", "text/event-stream"),
        )
        .expect(1)
        .mount(&healthy)
        .await;

    let app = create_test_app(&format!(
        r#"
mode: round-robin
backends:
  - {{ name: failing, url: "{}", default_model: m }}
  - {{ name: healthy, url: "{}", default_model: m }}
"#,
        failing.uri(),
        healthy.uri()
    ));

    let response = app
        .oneshot(chat_request(json!({"stream": true})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"data: ok\n\ndata: [DONE]\n\n");
}

#[tokio::test]
async fn test_malformed_json_is_rejected_without_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let app = create_test_app(&format!(
        "backends:\n  - name: a\n    url: {}\n    default_model: m\n",
        upstream.uri()
    ));

    let response = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cors_preflight() {
    let app = create_test_app("backends:\n  - name: a\n    url: http://127.0.0.1:1\n");

    let response = app
        .oneshot(
            Request::options("/v1/chat/completions")
                .header(header::ORIGIN, "http://example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
    let methods = response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
        .to_str()
        .unwrap();
    assert!(methods.contains("POST"));
}

#[tokio::test]
async fn test_cors_header_on_simple_request() {
    let app = create_test_app("backends:\n  - name: a\n    url: http://127.0.0.1:1\n");

    let response = app
        .oneshot(
            Request::get("/health")
                .header(header::ORIGIN, "http://example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
}

#[tokio::test]
async fn test_method_not_allowed() {
    let app = create_test_app("backends:\n  - name: a\n    url: http://127.0.0.1:1\n");
    for verb in ["GET", "PUT", "DELETE"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(verb)
                    .uri("/v1/chat/completions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{}", verb);
    }
}

#[tokio::test]
async fn test_models_and_health() {
    let app = create_test_app(
        r#"
mode: round-robin
backends:
  - { name: a, url: "http://127.0.0.1:1", models: [gpt-4o, gpt-4o-mini] }
  - { name: b, url: "http://127.0.0.1:1", models: [gpt-4o, claude-3] }
  - { name: c, url: "http://127.0.0.1:1" }
"#,
    );

    let response = app
        .clone()
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({
            "object": "list",
            "data": [
                {"id": "gpt-4o", "object": "model", "owned_by": "a"},
                {"id": "gpt-4o-mini", "object": "model", "owned_by": "a"},
                {"id": "claude-3", "object": "model", "owned_by": "b"}
            ]
        })
    );

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(
        body_json(response).await,
        json!({"status": "ok", "backends": 3, "mode": "round-robin"})
    );
}

#[tokio::test]
async fn test_backend_without_usable_model_is_skipped() {
    let bare = MockServer::start().await;
    let good = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&bare)
        .await;
    Mock::given(method("POST"))
        .respond_with(EchoModel { backend: "good" })
        .expect(1)
        .mount(&good)
        .await;

    let app = create_test_app(&format!(
        r#"
mode: round-robin
backends:
  - {{ name: bare, url: "{}" }}
  - {{ name: good, url: "{}", default_model: g }}
"#,
        bare.uri(),
        good.uri()
    ));

    let response = app
        .oneshot(chat_request(json!({"model": "auto"})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["model"], "g");
}
