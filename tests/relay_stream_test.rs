use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{extract::State, Json, Router};
use clap::Parser;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stratus::db::{init_db, load_chat_messages, DbPool};
use stratus::hardening::RetryPolicy;
use stratus::main_helper::{AppState, Args};
use stratus::persistence::{normalize_stored, ChatLocks};
use stratus::server::build_router;
use stratus::types::{Role, StreamEvent, ToolResultPayload};
use stratus::upstream::UpstreamClient;
use tempfile::TempDir;

/// Upstream behavior: each element is the body served for one
/// `/chat/completions` call, in order (the last repeats).
struct MockUpstream {
    completion_bodies: Vec<&'static str>,
    calls: AtomicUsize,
}

async fn mock_completions(State(mock): State<Arc<MockUpstream>>) -> impl IntoResponse {
    let n = mock.calls.fetch_add(1, Ordering::SeqCst);
    let idx = n.min(mock.completion_bodies.len() - 1);
    (
        [(CONTENT_TYPE, "text/event-stream")],
        mock.completion_bodies[idx],
    )
}

async fn mock_images() -> impl IntoResponse {
    Json(serde_json::json!({
        "data": [{ "b64_json": "aW1hZ2U=" }]
    }))
}

async fn spawn_mock_upstream(bodies: Vec<&'static str>) -> String {
    let mock = Arc::new(MockUpstream {
        completion_bodies: bodies,
        calls: AtomicUsize::new(0),
    });
    let router = Router::new()
        .route("/chat/completions", post(mock_completions))
        .route("/images/generations", post(mock_images))
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

struct TestApp {
    base_url: String,
    db: DbPool,
    _dir: TempDir,
}

async fn spawn_app(upstream_base: String) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = init_db(dir.path().join("relay_test.db"))
        .await
        .expect("init db");

    sqlx::query("INSERT INTO users (id, email) VALUES ('u1', 'u1@example.com')")
        .execute(&db)
        .await
        .expect("insert user");
    sqlx::query(
        "INSERT INTO sessions (token, user_id, expires_at) VALUES ('tok-1', 'u1', datetime('now', '+1 day'))",
    )
    .execute(&db)
    .await
    .expect("insert session");

    let upstream = UpstreamClient::new(
        reqwest::Client::new(),
        upstream_base,
        "test-key".to_string(),
        RetryPolicy::new(1, 1),
    );

    let state = Arc::new(AppState {
        upstream,
        db: db.clone(),
        chat_locks: ChatLocks::new(),
        system_preamble: "You are a test assistant.".to_string(),
        service_key: Some("svc-key".to_string()),
        args: Arc::new(Args::parse_from(["stratus"])),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind app");
    let addr = listener.local_addr().expect("app addr");
    let app = build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestApp {
        base_url: format!("http://{}", addr),
        db,
        _dir: dir,
    }
}

fn parse_frames(body: &str) -> Vec<StreamEvent> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| StreamEvent::decode(data).expect("decodable frame"))
        .collect()
}

fn concatenated_content(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content(c) => Some(c.as_str()),
            _ => None,
        })
        .collect()
}

const HELLO_STREAM: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n";

#[tokio::test]
async fn test_stream_framing_and_lazy_chat_creation() {
    let upstream = spawn_mock_upstream(vec![HELLO_STREAM]).await;
    let app = spawn_app(upstream).await;

    let response = reqwest::Client::new()
        .post(format!("{}/chat", app.base_url))
        .header("Authorization", "Bearer tok-1")
        .json(&serde_json::json!({
            "messages": [{ "role": "user", "content": "Say hello" }]
        }))
        .send()
        .await
        .expect("send chat request");

    assert!(response.status().is_success());
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = response.text().await.expect("stream body");
    let events = parse_frames(&body);

    // Content frames concatenate to the full text, in order
    assert_eq!(concatenated_content(&events), "Hello");

    // A chat id frame precedes the terminal sentinel
    let chat_id = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ChatAssigned(id) => Some(id.0.clone()),
            _ => None,
        })
        .expect("chat_id frame");
    assert_eq!(events.last(), Some(&StreamEvent::Done));

    // The transcript was persisted before the transport closed
    let messages = normalize_stored(
        load_chat_messages(&app.db, &chat_id)
            .await
            .expect("load messages"),
    );
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Say hello");
    assert_eq!(messages[0].message_number, 1);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello");
    assert_eq!(messages[1].message_number, 2);
}

const TOOL_CALL_STREAM: &str = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"tool_calls\":[{\"index\":0,\"id\":\"call_abc\",\"function\":{\"name\":\"generate_image\",\"arguments\":\"\"}}]},\"finish_reason\":null}]}\n\ndata: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"prompt\\\":\\\"a cat\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\ndata: [DONE]\n\n";

const FOLLOWUP_STREAM: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Here is your cat.\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n";

#[tokio::test]
async fn test_tool_round_trip_emits_result_and_persists_image() {
    let upstream = spawn_mock_upstream(vec![TOOL_CALL_STREAM, FOLLOWUP_STREAM]).await;
    let app = spawn_app(upstream).await;

    // Pre-seed a chat so this is not a first message (no title side effect)
    let seeded = serde_json::json!([
        { "id": "m1", "role": "user", "content": "hi", "files": null, "images": null,
          "created_at": "2025-07-01T00:00:00Z", "message_number": 1 },
        { "id": "m2", "role": "assistant", "content": "hello", "files": null, "images": null,
          "created_at": "2025-07-01T00:00:01Z", "message_number": 2 }
    ]);
    sqlx::query("INSERT INTO chats (id, user_id, title, messages) VALUES ('chat-1', 'u1', 'Seeded', ?)")
        .bind(seeded.to_string())
        .execute(&app.db)
        .await
        .expect("seed chat");

    let response = reqwest::Client::new()
        .post(format!("{}/chat", app.base_url))
        .header("Authorization", "Bearer tok-1")
        .json(&serde_json::json!({
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello" },
                { "role": "user", "content": "draw a cat" }
            ],
            "chatId": "chat-1"
        }))
        .send()
        .await
        .expect("send chat request");

    let body = response.text().await.expect("stream body");
    let events = parse_frames(&body);

    // Exactly one function_result frame, carrying the image and its prompt
    let tool_results: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolResult(ToolResultPayload::Image { url, prompt }) => {
                Some((url.clone(), prompt.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(tool_results.len(), 1);
    assert_eq!(tool_results[0].0, "data:image/png;base64,aW1hZ2U=");
    assert_eq!(tool_results[0].1.as_deref(), Some("a cat"));

    // The follow-up narrative streamed on the same transport
    assert_eq!(concatenated_content(&events), "Here is your cat.");
    assert_eq!(events.last(), Some(&StreamEvent::Done));

    // The persisted assistant turn carries the same image
    let messages = normalize_stored(
        load_chat_messages(&app.db, "chat-1")
            .await
            .expect("load messages"),
    );
    assert_eq!(messages.len(), 4);
    let assistant = messages.last().expect("assistant turn");
    assert_eq!(assistant.role, Role::Assistant);
    assert_eq!(assistant.content, "Here is your cat.");
    let images = assistant.images.as_ref().expect("persisted images");
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].url, "data:image/png;base64,aW1hZ2U=");
    assert_eq!(images[0].prompt.as_deref(), Some("a cat"));

    let numbers: Vec<u32> = messages.iter().map(|m| m.message_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
}

const ERROR_STREAM: &str =
    "data: {\"error\":{\"message\":\"upstream exploded\",\"code\":500}}\n\n";

#[tokio::test]
async fn test_midstream_error_becomes_content_frame_and_stream_closes() {
    let upstream = spawn_mock_upstream(vec![ERROR_STREAM]).await;
    let app = spawn_app(upstream).await;

    let response = reqwest::Client::new()
        .post(format!("{}/chat", app.base_url))
        .header("Authorization", "Bearer tok-1")
        .json(&serde_json::json!({
            "messages": [{ "role": "user", "content": "hello?" }]
        }))
        .send()
        .await
        .expect("send chat request");

    // The HTTP response itself committed before the failure
    assert!(response.status().is_success());

    let body = response.text().await.expect("stream body");
    let events = parse_frames(&body);

    let text = concatenated_content(&events);
    assert!(text.starts_with("\n\nError:"), "got: {:?}", text);
    assert!(text.contains("upstream exploded"));
    assert_eq!(events.last(), Some(&StreamEvent::Done));

    // No chat_id frame on the error path
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamEvent::ChatAssigned(_))));
}

#[tokio::test]
async fn test_auth_and_validation_rejected_before_streaming() {
    let upstream = spawn_mock_upstream(vec![HELLO_STREAM]).await;
    let app = spawn_app(upstream).await;
    let client = reqwest::Client::new();

    // Missing bearer token
    let response = client
        .post(format!("{}/chat", app.base_url))
        .json(&serde_json::json!({ "messages": [{ "role": "user", "content": "x" }] }))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), 401);

    // Malformed body: messages missing
    let response = client
        .post(format!("{}/chat", app.base_url))
        .header("Authorization", "Bearer tok-1")
        .json(&serde_json::json!({ "chatId": "whatever" }))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), 400);

    // Empty messages array
    let response = client
        .post(format!("{}/chat", app.base_url))
        .header("Authorization", "Bearer tok-1")
        .json(&serde_json::json!({ "messages": [] }))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), 400);

    // Unknown chat id
    let response = client
        .post(format!("{}/chat", app.base_url))
        .header("Authorization", "Bearer tok-1")
        .json(&serde_json::json!({
            "messages": [{ "role": "user", "content": "x" }],
            "chatId": "not-a-chat"
        }))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_chat_management_endpoints() {
    let upstream = spawn_mock_upstream(vec![HELLO_STREAM]).await;
    let app = spawn_app(upstream).await;
    let client = reqwest::Client::new();

    // Create
    let response = client
        .post(format!("{}/chats", app.base_url))
        .header("Authorization", "Bearer tok-1")
        .json(&serde_json::json!({ "title": "My Chat" }))
        .send()
        .await
        .expect("create");
    assert!(response.status().is_success());
    let created: serde_json::Value = response.json().await.expect("json");
    let chat_id = created["chat"]["id"].as_str().expect("id").to_string();
    assert_eq!(created["chat"]["title"], "My Chat");

    // List
    let response = client
        .get(format!("{}/chats", app.base_url))
        .header("Authorization", "Bearer tok-1")
        .send()
        .await
        .expect("list");
    let listed: serde_json::Value = response.json().await.expect("json");
    let chats = listed["chats"].as_array().expect("chats array");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["id"], chat_id.as_str());

    // Messages (empty)
    let response = client
        .get(format!("{}/chats/{}/messages", app.base_url, chat_id))
        .header("Authorization", "Bearer tok-1")
        .send()
        .await
        .expect("messages");
    let messages: serde_json::Value = response.json().await.expect("json");
    assert_eq!(messages["messages"], serde_json::json!([]));

    // Delete without id
    let response = client
        .delete(format!("{}/chats", app.base_url))
        .header("Authorization", "Bearer tok-1")
        .send()
        .await
        .expect("delete no id");
    assert_eq!(response.status(), 400);

    // Delete
    let response = client
        .delete(format!("{}/chats?id={}", app.base_url, chat_id))
        .header("Authorization", "Bearer tok-1")
        .send()
        .await
        .expect("delete");
    assert_eq!(response.status(), 200);

    // Gone
    let response = client
        .get(format!("{}/chats/{}/messages", app.base_url, chat_id))
        .header("Authorization", "Bearer tok-1")
        .send()
        .await
        .expect("messages after delete");
    assert_eq!(response.status(), 404);
}
