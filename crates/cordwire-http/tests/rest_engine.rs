use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use cordwire_http::{Client, HttpConfig, HttpError, RequestOptions};
use cordwire_models::message::{SendFile, SendMessage};
use cordwire_util::{ChannelId, MessageId};
use serde_json::{json, Value};

// ── Mock REST server ────────────────────────────────────────────────────────

const TOTAL_MESSAGES: u64 = 250;

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Default)]
struct Mock {
    requests: Mutex<Vec<Recorded>>,
    flaky_hits: AtomicUsize,
}

impl Mock {
    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method.as_str() == method && r.path == path)
            .count()
    }
}

fn message_json(id: u64) -> Value {
    json!({
        "id": id.to_string(),
        "channel_id": "1",
        "author": { "id": "9", "username": "cordwire", "bot": true },
        "content": format!("message {id}"),
        "type": 0
    })
}

async fn handle(
    State(mock): State<Arc<Mock>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().trim_start_matches("/api/v10").to_string();
    let query: HashMap<String, String> = uri
        .query()
        .map(|q| serde_urlencoded::from_str(q).unwrap_or_default())
        .unwrap_or_default();
    mock.requests.lock().unwrap().push(Recorded {
        method: method.clone(),
        path: path.clone(),
        query: query.clone(),
        headers,
        body,
    });

    match (method.as_str(), path.as_str()) {
        ("GET", "/flaky") => {
            if mock.flaky_hits.fetch_add(1, Ordering::SeqCst) < 2 {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "0.05")],
                    Json(json!({ "message": "You are being rate limited.", "retry_after": 0.05, "global": false })),
                )
                    .into_response()
            } else {
                Json(json!({ "ok": true })).into_response()
            }
        }
        ("GET", "/broken") => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "code": 50035,
                "message": "Invalid Form Body",
                "errors": { "content": { "_errors": [{ "code": "BASE_TYPE_MAX_LENGTH" }] } }
            })),
        )
            .into_response(),
        ("GET", "/down") => StatusCode::BAD_GATEWAY.into_response(),
        ("GET", "/empty") => StatusCode::NO_CONTENT.into_response(),
        ("GET", "/channels/1/messages") => {
            let limit: u64 = query.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50);
            let start = query
                .get("before")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(TOTAL_MESSAGES, |before| before.saturating_sub(1));
            let page: Vec<Value> = (1..=start).rev().take(limit as usize).map(message_json).collect();
            Json(page).into_response()
        }
        ("POST", "/channels/1/messages") => Json(message_json(1000)).into_response(),
        ("POST", "/channels/1/messages/bulk-delete") | ("DELETE", _) => {
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_mock() -> anyhow::Result<(String, Arc<Mock>)> {
    init_tracing();
    let mock = Arc::new(Mock::default());
    let app = Router::new().fallback(handle).with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api/v10"), mock))
}

fn client(base_url: &str, max_retries: u32) -> anyhow::Result<Client> {
    let config = HttpConfig {
        base_url: base_url.to_string(),
        max_retries,
        timeout_ms: 5_000,
        ..HttpConfig::default()
    };
    Ok(Client::new("secret-token", config)?)
}

// ── Request lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn retries_through_429_after_retry_after() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 5)?;

    let start = Instant::now();
    let body: Value = client
        .json(Method::GET, "flaky", RequestOptions::new())
        .await?;

    assert_eq!(body["ok"], true);
    assert_eq!(mock.count("GET", "/flaky"), 3);
    assert!(start.elapsed() >= Duration::from_millis(100), "{:?}", start.elapsed());
    Ok(())
}

#[tokio::test]
async fn client_errors_surface_immediately() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 5)?;

    let err = client
        .fast_request(Method::GET, "broken", RequestOptions::new())
        .await
        .unwrap_err();
    match err {
        HttpError::Status(status) => {
            assert_eq!(status.status.as_u16(), 400);
            assert_eq!(status.code, 50035);
            assert_eq!(status.message, "Invalid Form Body");
            assert!(status.errors.is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(mock.count("GET", "/broken"), 1);
    Ok(())
}

#[tokio::test]
async fn server_errors_exhaust_retry_budget() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 1)?;

    let err = client
        .fast_request(Method::GET, "down", RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.status().map(|s| s.as_u16()), Some(502));
    assert_eq!(mock.count("GET", "/down"), 2);
    Ok(())
}

#[tokio::test]
async fn no_content_leaves_output_untouched() -> anyhow::Result<()> {
    let (base, _mock) = spawn_mock().await?;
    let client = client(&base, 0)?;

    let mut out = json!({ "untouched": true });
    client
        .request_json(&mut out, Method::GET, "empty", RequestOptions::new())
        .await?;
    assert_eq!(out, json!({ "untouched": true }));
    Ok(())
}

#[tokio::test]
async fn sends_auth_and_user_agent() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 0)?;
    client
        .fast_request(Method::GET, "empty", RequestOptions::new())
        .await?;

    let requests = mock.requests();
    let request = &requests[0];
    assert_eq!(request.headers["authorization"], "Bot secret-token");
    let ua = request.headers["user-agent"].to_str()?;
    assert!(ua.starts_with("DiscordBot ("), "{ua}");
    Ok(())
}

// ── Endpoints ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn message_with_files_goes_multipart() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 0)?;

    let message = SendMessage::content("nightly report")
        .with_file(SendFile::new("report.csv", "a,b\n1,2\n"))
        .with_file(SendFile::new("graph.png", vec![0x89u8, b'P', b'N', b'G']).spoiler());
    let sent = client.send_message(ChannelId::new(1), &message).await?;
    assert_eq!(sent.id, MessageId::new(1000));

    let requests = mock.requests();
    let request = &requests[0];
    let content_type = request.headers["content-type"].to_str()?;
    assert!(content_type.starts_with("multipart/form-data; boundary="));

    let body = String::from_utf8_lossy(&request.body);
    let payload = body.find("name=\"payload_json\"").expect("payload part");
    let first = body.find("name=\"file0\"; filename=\"report.csv\"").expect("first file");
    let second = body
        .find("name=\"file1\"; filename=\"SPOILER_graph.png\"")
        .expect("second file");
    assert!(payload < first && first < second);
    assert!(body.contains(r#""content":"nightly report""#));
    Ok(())
}

#[tokio::test]
async fn message_without_files_is_json() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 0)?;

    client
        .send_message(ChannelId::new(1), &SendMessage::content("plain"))
        .await?;
    let requests = mock.requests();
    let request = &requests[0];
    assert_eq!(request.headers["content-type"], "application/json");
    let body: Value = serde_json::from_slice(&request.body)?;
    assert_eq!(body["content"], "plain");
    Ok(())
}

#[tokio::test]
async fn invalid_message_fails_before_io() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 0)?;

    let err = client
        .send_message(ChannelId::new(1), &SendMessage::content("x".repeat(2001)))
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Validation(_)));
    assert!(mock.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn bulk_delete_chunking() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 0)?;
    let channel = ChannelId::new(1);
    let ids = |n: u64| (1..=n).map(MessageId::new).collect::<Vec<_>>();

    client.delete_messages(channel, &[], None).await?;
    assert!(mock.requests().is_empty());

    client.delete_messages(channel, &ids(1), None).await?;
    assert_eq!(mock.count("DELETE", "/channels/1/messages/1"), 1);
    assert_eq!(mock.count("POST", "/channels/1/messages/bulk-delete"), 0);

    client.delete_messages(channel, &ids(150), None).await?;
    let bulk: Vec<usize> = mock
        .requests()
        .iter()
        .filter(|r| r.path == "/channels/1/messages/bulk-delete")
        .map(|r| {
            let body: Value = serde_json::from_slice(&r.body).unwrap();
            body["messages"].as_array().unwrap().len()
        })
        .collect();
    assert_eq!(bulk, vec![100, 50]);

    // 101 ids: one bulk request plus a single delete for the remainder.
    client.delete_messages(channel, &ids(101), None).await?;
    assert_eq!(mock.count("POST", "/channels/1/messages/bulk-delete"), 3);
    assert_eq!(mock.count("DELETE", "/channels/1/messages/101"), 1);
    Ok(())
}

#[tokio::test]
async fn audit_log_reason_is_percent_encoded() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 0)?;

    client
        .delete_message(ChannelId::new(1), MessageId::new(5), Some("spam räumen"))
        .await?;
    let requests = mock.requests();
    let request = &requests[0];
    assert_eq!(
        request.headers["x-audit-log-reason"],
        "spam%20r%C3%A4umen"
    );
    Ok(())
}

#[tokio::test]
async fn history_pages_until_short_page() -> anyhow::Result<()> {
    let (base, mock) = spawn_mock().await?;
    let client = client(&base, 0)?;

    let all = client.messages(ChannelId::new(1), 0, None).await?;
    assert_eq!(all.len() as u64, TOTAL_MESSAGES);
    assert_eq!(all.first().map(|m| m.id.get()), Some(TOTAL_MESSAGES));
    assert_eq!(all.last().map(|m| m.id.get()), Some(1));

    let limits: Vec<String> = mock
        .requests()
        .iter()
        .map(|r| r.query["limit"].clone())
        .collect();
    assert_eq!(limits, vec!["100", "100", "100"]);

    let some = client.messages(ChannelId::new(1), 120, None).await?;
    assert_eq!(some.len(), 120);
    let requests = mock.requests();
    let tail: Vec<&Recorded> = requests.iter().skip(3).collect();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].query["limit"], "100");
    assert_eq!(tail[1].query["limit"], "20");
    assert_eq!(tail[1].query["before"], "151");
    Ok(())
}
