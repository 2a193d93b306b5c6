use apitally_serverless::{
    ApitallyLayer, Config, MemorySink, ProcessState, RequestBody, RequestContext, Routes,
    RUNTIME_VERSION,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream;
use http::{header, Method, Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tower::{service_fn, Layer, ServiceExt};

type Body = BoxBody<Bytes, Infallible>;

const SENTINEL: &str = "PGJvZHkgdG9vIGxhcmdlPg==";

#[derive(Debug)]
struct AppError(&'static str);

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for AppError {}

fn full(body: impl Into<Bytes>) -> Body {
    Full::new(body.into()).boxed()
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full(body.to_string()))
        .unwrap()
}

async fn app(req: Request<RequestBody<Body>>) -> Result<Response<Body>, AppError> {
    let path = req.uri().path().to_string();

    match path.as_str() {
        "/hello" => {
            if let Some(ctx) = RequestContext::from_extensions(req.extensions()) {
                ctx.set_consumer("test", Some("Test"), Some("Test"));
            }
            Ok(json_response(StatusCode::OK, json!({"message": "Hello John!"})))
        }
        "/hello/123" => Ok(json_response(StatusCode::OK, json!({"message": "Hello 123!"}))),
        "/login" => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let login: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            Ok(json_response(
                StatusCode::OK,
                json!({"token": "abc123", "user": login["username"]}),
            ))
        }
        "/echo" => {
            let content_type = req.headers().get(header::CONTENT_TYPE).cloned();
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let mut response = Response::new(full(body));
            if let Some(content_type) = content_type {
                response.headers_mut().insert(header::CONTENT_TYPE, content_type);
            }
            Ok(response)
        }
        "/reverse" => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let reversed: Vec<u8> = body.iter().rev().copied().collect();
            Ok(Response::builder()
                .header(header::CONTENT_TYPE, "text/plain")
                .body(full(reversed))
                .unwrap())
        }
        "/validate" => Ok(json_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({"detail": [
                {"loc": ["query", "name"], "msg": "String should have at least 2 characters", "type": "string_too_short"},
                {"loc": ["query", "age"], "msg": "Input should be greater than or equal to 18", "type": "greater_than_equal"},
            ]}),
        )),
        "/stream" => {
            let frames: Vec<Result<Frame<Bytes>, Infallible>> = ["first ", "second ", "third"]
                .into_iter()
                .map(|chunk| Ok(Frame::data(Bytes::from_static(chunk.as_bytes()))))
                .collect();
            Ok(Response::builder()
                .header(header::CONTENT_TYPE, "text/plain")
                .body(StreamBody::new(stream::iter(frames)).boxed())
                .unwrap())
        }
        "/handled" => {
            if let Some(ctx) = RequestContext::from_extensions(req.extensions()) {
                ctx.capture_error(&AppError("payment provider timed out"));
            }
            Ok(json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "internal"}),
            ))
        }
        "/healthz" => Ok(Response::new(full("ok"))),
        "/error" => Err(AppError("database unavailable")),
        "/panic" => panic!("handler panicked"),
        _ => Ok(json_response(StatusCode::NOT_FOUND, json!({"detail": "Not Found"}))),
    }
}

fn routes() -> Routes {
    Routes::new()
        .route("/hello", [Method::GET])
        .route("/hello/{id}", [Method::GET])
        .route("/login", [Method::POST])
        .route("/echo", [Method::POST])
        .route("/reverse", [Method::POST])
        .route("/validate", [Method::GET])
        .route("/stream", [Method::GET])
        .route("/handled", [Method::GET])
        .route("/healthz", [Method::GET])
        .route("/error", [Method::GET])
        .route("/panic", [Method::GET])
}

fn full_logging() -> Config {
    Config::new()
        .log_request_headers(true)
        .log_request_body(true)
        .log_response_headers(true)
        .log_response_body(true)
}

fn layer(config: Config, sink: &MemorySink) -> ApitallyLayer {
    ApitallyLayer::builder(config)
        .routes(routes())
        .sink(sink.clone())
        .package_version("layer-test", "1.0.0")
        .build()
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(full(Bytes::new()))
        .unwrap()
}

fn post(uri: &str, content_type: &str, body: impl Into<Bytes>) -> Request<Body> {
    let body = body.into();
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body.len())
        .body(full(body))
        .unwrap()
}

/// Send a request through a fresh service and read the whole response.
async fn send(layer: &ApitallyLayer, req: Request<Body>) -> (StatusCode, Bytes) {
    let service = layer.layer(service_fn(app));
    let response = service.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn decode_body(value: &Value) -> String {
    let bytes = STANDARD.decode(value.as_str().unwrap()).unwrap();
    String::from_utf8(bytes).unwrap()
}

fn has_header(headers: &Value, name: &str) -> bool {
    headers
        .as_array()
        .map(|pairs| pairs.iter().any(|pair| pair[0] == name))
        .unwrap_or(false)
}

/// Alphanumeric text that gzip cannot shrink much
fn noise(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ALPHABET[(state % ALPHABET.len() as u64) as usize] as char
        })
        .collect()
}

#[tokio::test]
async fn test_logs_get_request_with_consumer() {
    let sink = MemorySink::new();
    let layer = layer(full_logging(), &sink);

    let (status, body) = send(&layer, get("/hello?name=John&age=20")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("Hello John"));

    let records = sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];

    assert_eq!(record["instance_uuid"], layer.instance_uuid().to_string());
    assert!(record["request_uuid"].is_string());
    assert_eq!(record["consumer"]["identifier"], "test");
    assert_eq!(record["consumer"]["name"], "Test");
    assert_eq!(record["consumer"]["group"], "Test");
    assert_eq!(record["request"]["path"], "/hello");
    assert_eq!(record["request"]["consumer"], "test");
    assert!(has_header(&record["response"]["headers"], "content-type"));
    assert!(record["response"]["size"].as_u64().unwrap() > 0);
    assert!(record["response"]["response_time"].as_f64().unwrap() >= 0.0);
    assert!(decode_body(&record["response"]["body"]).contains("Hello John"));

    let startup = &record["startup"];
    assert_eq!(startup["client"], "rust-serverless:tower");
    assert_eq!(startup["versions"]["layer-test"], "1.0.0");
    assert!(startup["versions"]["apitally-serverless"].is_string());
    assert_eq!(startup["versions"]["rust"], RUNTIME_VERSION);
    assert!(startup["paths"]
        .as_array()
        .unwrap()
        .contains(&json!({"method": "GET", "path": "/hello/{id}"})));
}

#[tokio::test]
async fn test_repeated_consumer_metadata_is_dropped() {
    let sink = MemorySink::new();
    let layer = layer(Config::default(), &sink);

    send(&layer, get("/hello")).await;
    send(&layer, get("/hello")).await;

    let records = sink.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["consumer"]["name"], "Test");
    assert!(records[1].get("consumer").is_none());
    assert_eq!(records[1]["request"]["consumer"], "test");
}

#[tokio::test]
async fn test_startup_metadata_sent_once() {
    let sink = MemorySink::new();
    let layer = layer(Config::default(), &sink);

    for _ in 0..3 {
        send(&layer, get("/hello/123")).await;
    }

    let records = sink.records();
    assert_eq!(records.len(), 3);
    assert!(records[0]["startup"].is_object());
    assert!(records[1].get("startup").is_none());
    assert!(records[2].get("startup").is_none());
    assert!(records.iter().all(|r| r["instance_uuid"] == records[0]["instance_uuid"]));
    assert_ne!(records[0]["request_uuid"], records[1]["request_uuid"]);
}

#[tokio::test]
async fn test_shared_state_across_layers() {
    let state = Arc::new(ProcessState::new());
    let sink = MemorySink::new();
    let build = || {
        ApitallyLayer::builder(Config::default())
            .routes(routes())
            .sink(sink.clone())
            .state(state.clone())
            .build()
            .unwrap()
    };
    let (first, second) = (build(), build());

    send(&first, get("/hello")).await;
    send(&second, get("/hello")).await;

    let records = sink.records();
    assert!(records[0]["startup"].is_object());
    assert!(records[1].get("startup").is_none());
    assert!(records[1].get("consumer").is_none());

    state.reset();
    send(&second, get("/hello")).await;
    let records = sink.records();
    assert!(records[2]["startup"].is_object());
    assert_eq!(records[2]["consumer"]["name"], "Test");
}

#[tokio::test]
async fn test_path_template_is_reported() {
    let sink = MemorySink::new();
    let layer = layer(Config::default(), &sink);

    send(&layer, get("/hello/123")).await;

    assert_eq!(sink.records()[0]["request"]["path"], "/hello/{id}");
}

#[tokio::test]
async fn test_unmatched_path_has_no_template() {
    let sink = MemorySink::new();
    let layer = layer(Config::default(), &sink);

    let (status, _) = send(&layer, get("/unhandled")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let record = &sink.records()[0];
    assert!(record["request"].get("path").is_none());
    assert_eq!(record["response"]["status_code"], 404);
}

#[tokio::test]
async fn test_post_json_body_is_masked() {
    let sink = MemorySink::new();
    let layer = layer(full_logging(), &sink);

    let mut req = post(
        "/login",
        "application/json",
        r#"{"username":"bob","password":"hunter2"}"#,
    );
    req.headers_mut()
        .insert(header::AUTHORIZATION, "Bearer xyz".parse().unwrap());
    let (status, body) = send(&layer, req).await;

    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("abc123"));

    let record = &sink.records()[0];
    assert_eq!(record["request"]["path"], "/login");
    assert_eq!(record["request"]["size"], 39);
    assert_eq!(
        decode_body(&record["request"]["body"]),
        r#"{"username":"bob","password":"******"}"#
    );
    assert_eq!(
        decode_body(&record["response"]["body"]),
        r#"{"token":"******","user":"bob"}"#
    );

    let headers = record["request"]["headers"].as_array().unwrap();
    assert!(headers.contains(&json!(["authorization", "******"])));
    assert!(headers.contains(&json!(["content-type", "application/json"])));
}

#[tokio::test]
async fn test_headers_and_bodies_off_by_default() {
    let sink = MemorySink::new();
    let layer = layer(Config::default(), &sink);

    send(&layer, post("/login", "application/json", r#"{"username":"bob"}"#)).await;

    let record = &sink.records()[0];
    assert!(record["request"].get("headers").is_none());
    assert!(record["request"].get("body").is_none());
    assert!(record["response"].get("body").is_none());
    assert!(has_header(&record["response"]["headers"], "content-type"));
}

#[tokio::test]
async fn test_validation_errors_captured_without_body_logging() {
    let sink = MemorySink::new();
    let layer = layer(Config::default(), &sink);

    let (status, _) = send(&layer, get("/validate?name=X&age=17")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let record = &sink.records()[0];
    let errors = record["validation_errors"].as_array().unwrap();
    assert_eq!(errors.len(), 2);
    let locs: Vec<&Value> = errors.iter().map(|e| &e["loc"]).collect();
    assert!(locs.contains(&&json!(["query", "name"])));
    assert!(locs.contains(&&json!(["query", "age"])));
    assert_eq!(errors[0]["type"], "string_too_short");
    assert!(record["response"].get("body").is_none());
}

#[tokio::test]
async fn test_oversized_request_body_is_replaced_by_sentinel() {
    let sink = MemorySink::new();
    let layer = layer(full_logging(), &sink);

    let body = format!("\"{}\"", "a".repeat(12_000));
    let mut req = post("/echo", "application/json", body.clone());
    req.headers_mut().remove(header::CONTENT_LENGTH);
    let (_, echoed) = send(&layer, req).await;
    assert_eq!(echoed.len(), body.len());

    let record = &sink.records()[0];
    assert_eq!(record["request"]["body"], SENTINEL);
    assert_eq!(record["response"]["body"], SENTINEL);
    assert_eq!(record["response"]["size"], body.len());
}

#[tokio::test]
async fn test_declared_oversized_body_without_reading_it() {
    let sink = MemorySink::new();
    let layer = layer(full_logging(), &sink);

    let req = post("/hello", "application/json", vec![b' '; 20_000]);
    send(&layer, req).await;

    let record = &sink.records()[0];
    assert_eq!(record["request"]["size"], 20_000);
    assert_eq!(record["request"]["body"], SENTINEL);
}

#[tokio::test]
async fn test_unsupported_content_type_is_not_captured() {
    let sink = MemorySink::new();
    let layer = layer(full_logging(), &sink);

    send(&layer, post("/echo", "application/octet-stream", &b"\x00\x01\x02"[..])).await;

    let record = &sink.records()[0];
    assert_eq!(record["request"]["size"], 3);
    assert!(record["request"].get("body").is_none());
    assert!(record["response"].get("body").is_none());
}

#[tokio::test]
async fn test_chunked_response_size_is_measured() {
    let sink = MemorySink::new();
    let layer = layer(full_logging(), &sink);

    let (_, body) = send(&layer, get("/stream")).await;
    assert_eq!(&body[..], b"first second third");

    let record = &sink.records()[0];
    assert_eq!(record["response"]["size"], 18);
    assert_eq!(decode_body(&record["response"]["body"]), "first second third");
}

#[tokio::test]
async fn test_health_check_is_excluded() {
    let sink = MemorySink::new();
    let layer = layer(full_logging(), &sink);

    send(&layer, get("/healthz")).await;

    let record = &sink.records()[0];
    assert_eq!(record["exclude"], true);
    assert_eq!(record["request"]["path"], "/healthz");
    assert!(record["request"].get("headers").is_none());
    assert!(record["response"].get("headers").is_none());
    assert!(record["response"].get("body").is_none());
}

#[tokio::test]
async fn test_service_error_is_recorded_and_returned() {
    let sink = MemorySink::new();
    let layer = layer(Config::default(), &sink);

    let err = layer
        .layer(service_fn(app))
        .oneshot(get("/error"))
        .await
        .err()
        .expect("service error is returned unchanged");
    assert_eq!(err.to_string(), "database unavailable");

    let record = &sink.records()[0];
    assert_eq!(record["request"]["path"], "/error");
    assert_eq!(record["response"]["status_code"], 500);
    assert!(record["exception"]["type"].as_str().unwrap().ends_with("AppError"));
    assert_eq!(record["exception"]["msg"], "database unavailable");
    assert!(record["exception"]["traceback"]
        .as_str()
        .unwrap()
        .contains("database unavailable"));
}

#[tokio::test]
async fn test_handler_panic_is_recorded_and_resumed() {
    let sink = MemorySink::new();
    let service = layer(Config::default(), &sink).layer(service_fn(app));

    let result = tokio::spawn(service.oneshot(get("/panic"))).await;
    assert!(result.err().expect("task panicked").is_panic());

    let record = &sink.records()[0];
    assert_eq!(record["request"]["path"], "/panic");
    assert_eq!(record["response"]["status_code"], 500);
    assert_eq!(record["exception"]["type"], "panic");
    assert_eq!(record["exception"]["msg"], "handler panicked");
}

#[tokio::test]
async fn test_handler_captured_error() {
    let sink = MemorySink::new();
    let layer = layer(Config::default(), &sink);

    let (status, _) = send(&layer, get("/handled")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let record = &sink.records()[0];
    assert_eq!(record["response"]["status_code"], 500);
    assert_eq!(record["exception"]["msg"], "payment provider timed out");
}

#[tokio::test]
async fn test_dropped_response_body_still_emits() {
    let sink = MemorySink::new();
    let layer = layer(full_logging(), &sink);

    let response = layer
        .layer(service_fn(app))
        .oneshot(get("/stream"))
        .await
        .unwrap();
    assert!(sink.lines().is_empty());
    drop(response);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["response"]["status_code"], 200);
    assert_eq!(records[0]["response"]["size"], 0);
}

#[tokio::test]
async fn test_disabled_and_preflight_requests_are_not_recorded() {
    let sink = MemorySink::new();
    let disabled = layer(Config::default().enabled(false), &sink);
    let (status, _) = send(&disabled, get("/hello")).await;
    assert_eq!(status, StatusCode::OK);

    let enabled = layer(Config::default(), &sink);
    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/hello")
        .body(full(Bytes::new()))
        .unwrap();
    send(&enabled, preflight).await;

    assert!(sink.lines().is_empty());
}

#[tokio::test]
async fn test_oversized_line_drops_bodies() {
    let sink = MemorySink::new();
    let layer = layer(full_logging(), &sink);

    let body = noise(9_500);
    let (_, reversed) = send(&layer, post("/reverse", "text/plain", body.clone())).await;
    assert_eq!(reversed.len(), body.len());

    let lines = sink.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].len() <= 15_000);

    let record = &sink.records()[0];
    assert!(record["request"].get("body").is_none());
    assert!(record["response"].get("body").is_none());
    assert_eq!(record["request"]["size"], 9_500);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // However a body is split into frames, the record holds it verbatim up
    // to the cap and the sentinel beyond it.
    #[test]
    fn prop_request_body_capture_respects_cap(
        len in 0usize..14_000,
        chunk in 1usize..4_000,
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let sink = MemorySink::new();
        let layer = layer(Config::new().log_request_body(true), &sink);
        let body = noise(len);

        let frames: Vec<Result<Frame<Bytes>, Infallible>> = body
            .as_bytes()
            .chunks(chunk)
            .map(|part| Ok(Frame::data(Bytes::copy_from_slice(part))))
            .collect();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(StreamBody::new(stream::iter(frames)).boxed())
            .unwrap();

        runtime.block_on(send(&layer, req));

        let record = &sink.records()[0];
        let captured = record["request"].get("body");
        if len == 0 {
            prop_assert!(captured.is_none());
        } else if len <= 10_000 {
            prop_assert_eq!(decode_body(captured.unwrap()), body);
        } else {
            prop_assert_eq!(captured.unwrap(), SENTINEL);
        }
    }
}
