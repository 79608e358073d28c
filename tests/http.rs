//! OpenAI-compatible HTTP adapter against a canned local server.

use std::time::Duration;

use conductor::dispatch::http::{HttpProvider, MAX_RESPONSE_BYTES, parse_completion};
use conductor::{CallContext, GenerateRequest, OrchestratorError, Provider};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Accept one connection, capture the request head, reply with `status`
/// and `body`. Resolves to the captured request text.
async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return String::new();
        };
        let mut buf = vec![0u8; 8192];
        let n = socket.read(&mut buf).await.unwrap_or(0);
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = socket.write_all(response.as_bytes()).await;
        String::from_utf8_lossy(&buf[..n]).into_owned()
    });

    (format!("http://127.0.0.1:{port}/v1/chat/completions"), server)
}

/// Accept one connection and stream `len` bytes of filler with no
/// Content-Length, ending the body by closing the socket.
async fn serve_unbounded(status: &'static str, len: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let head = format!("HTTP/1.1 {status}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n");
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        let chunk = vec![b'x'; 64 * 1024];
        let mut sent = 0;
        while sent < len {
            if socket.write_all(&chunk).await.is_err() {
                return;
            }
            sent += chunk.len();
        }
    });

    format!("http://127.0.0.1:{port}/v1/chat/completions")
}

fn ctx(secs: u64) -> CallContext {
    CallContext::new(Instant::now() + Duration::from_secs(secs))
}

#[tokio::test]
async fn successful_completion_returns_text_and_model() {
    let (url, server) = serve_once(
        "200 OK",
        r#"{"model":"llama3.2","choices":[{"message":{"role":"assistant","content":"Hello there"}}]}"#,
    )
    .await;
    let provider = HttpProvider::new("ollama", url, "llama3.2", Some("sk-test".to_string())).unwrap();

    let output = provider
        .generate(&GenerateRequest::new("hi"), ctx(5))
        .await
        .unwrap();

    assert_eq!(output.text, "Hello there");
    assert_eq!(output.model.as_deref(), Some("llama3.2"));

    let captured = server.await.unwrap().to_lowercase();
    assert!(captured.starts_with("post /v1/chat/completions"));
    assert!(captured.contains("authorization: bearer sk-test"));
}

#[tokio::test]
async fn rate_limit_maps_to_rate_limited() {
    let (url, _server) = serve_once("429 Too Many Requests", "{}").await;
    let provider = HttpProvider::new("openrouter", url, "m", None).unwrap();

    let err = provider
        .generate(&GenerateRequest::new("hi"), ctx(5))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::RateLimited { ref provider } if provider == "openrouter"));
}

#[tokio::test]
async fn unauthorized_maps_to_auth_failed() {
    let (url, _server) = serve_once("401 Unauthorized", "{}").await;
    let provider = HttpProvider::new("hf", url, "m", Some("bad".to_string())).unwrap();

    let err = provider
        .generate(&GenerateRequest::new("hi"), ctx(5))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AuthFailed { .. }));
    assert_eq!(err.user_message(), "authentication failed for hf");
}

#[tokio::test]
async fn server_error_keeps_body_out_of_user_message() {
    let (url, _server) = serve_once(
        "502 Bad Gateway",
        r#"{"error":"upstream 10.1.2.3:8080 refused"}"#,
    )
    .await;
    let provider = HttpProvider::new("gemini", url, "m", None).unwrap();

    let err = provider
        .generate(&GenerateRequest::new("hi"), ctx(5))
        .await
        .unwrap_err();
    match &err {
        OrchestratorError::Upstream { status, message, .. } => {
            assert_eq!(*status, Some(502));
            assert!(message.contains("10.1.2.3"));
        }
        other => panic!("expected Upstream, got {other:?}"),
    }
    assert_eq!(err.user_message(), "upstream error from gemini (status 502)");
}

#[tokio::test]
async fn oversized_body_without_length_is_rejected() {
    let url = serve_unbounded("200 OK", 3 * MAX_RESPONSE_BYTES).await;
    let provider = HttpProvider::new("ollama", url, "m", None).unwrap();

    let err = provider
        .generate(&GenerateRequest::new("hi"), ctx(10))
        .await
        .unwrap_err();
    match err {
        OrchestratorError::Upstream { message, status, .. } => {
            assert!(message.contains("too large"), "{message}");
            assert_eq!(status, None);
        }
        other => panic!("expected Upstream, got {other:?}"),
    }
}

#[tokio::test]
async fn oversized_error_body_is_truncated() {
    let url = serve_unbounded("500 Internal Server Error", 3 * MAX_RESPONSE_BYTES).await;
    let provider = HttpProvider::new("ollama", url, "m", None).unwrap();

    let err = provider
        .generate(&GenerateRequest::new("hi"), ctx(10))
        .await
        .unwrap_err();
    match err {
        OrchestratorError::Upstream { message, status, .. } => {
            assert_eq!(status, Some(500));
            assert!(message.len() <= MAX_RESPONSE_BYTES + 64);
            assert!(message.ends_with('x'));
        }
        other => panic!("expected Upstream, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_choices_is_a_decline() {
    let (url, _server) = serve_once("200 OK", r#"{"choices":[]}"#).await;
    let provider = HttpProvider::new("gemini", url, "m", None).unwrap();

    let err = provider
        .generate(&GenerateRequest::new("hi"), ctx(5))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Declined { .. }));
}

#[tokio::test]
async fn cancellation_ends_a_stalled_call() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _server = tokio::spawn(async move {
        // Accept and never answer.
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(socket);
    });

    let provider = HttpProvider::new(
        "stalled",
        format!("http://127.0.0.1:{port}/v1/chat/completions"),
        "m",
        None,
    )
    .unwrap();
    let ctx = ctx(30);
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let start = std::time::Instant::now();
    let err = provider
        .generate(&GenerateRequest::new("hi"), ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Timeout(_)));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn expired_deadline_fails_without_a_request() {
    let provider = HttpProvider::new("p", "http://127.0.0.1:9/never", "m", None).unwrap();
    let ctx = CallContext::new(Instant::now());
    let err = provider
        .generate(&GenerateRequest::new("hi"), ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Timeout(_)));
}

#[tokio::test]
async fn empty_base_url_fails_init_and_health() {
    let provider = HttpProvider::new("p", "", "m", None).unwrap();
    assert!(provider.init().await.is_err());
    assert!(!provider.health().await.healthy);
}

#[test]
fn parse_completion_rejects_garbage_and_null_content() {
    assert!(matches!(
        parse_completion("p", b"<html>"),
        Err(OrchestratorError::SchemaParse(_))
    ));
    assert!(matches!(
        parse_completion("p", br#"{"choices":[{"message":{"content":null}}]}"#),
        Err(OrchestratorError::Declined { .. })
    ));
    assert!(matches!(
        parse_completion("p", br#"{"choices":[{"message":{"content":"   "}}]}"#),
        Err(OrchestratorError::Declined { .. })
    ));
}

#[test]
fn debug_redacts_api_key() {
    let provider =
        HttpProvider::new("p", "http://localhost", "m", Some("sk-very-secret".to_string())).unwrap();
    let debug = format!("{provider:?}");
    assert!(!debug.contains("sk-very-secret"));
    assert!(debug.contains("[REDACTED]"));
}
