use crate::ingress::{ChatRequest, CreateChatRequest, TitleRequest};
use crate::main_helper::AppState;
use crate::streaming::ChatRelay;
use crate::types::*;
use axum::response::sse::KeepAlive;
use axum::{
    extract::{Path, Query, State},
    http as ax_http, middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route(
            "/chats",
            get(list_chats_handler)
                .post(create_chat_handler)
                .delete(delete_chat_handler),
        )
        .route("/chats/:chat_id/messages", get(chat_messages_handler))
        .route("/chats/:chat_id/title", post(chat_title_handler))
        .route("/user", axum::routing::delete(delete_user_handler))
        .route("/health", get(crate::health::liveness))
        .route("/readyz", get(crate::health::readiness))
        .layer(axum::extract::DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn(crate::logging::request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `POST /chat`: the streaming relay endpoint. Everything knowable before
/// the stream opens (auth, validation, chat resolution) is reported as a
/// plain HTTP error; after that, failures live inside the stream.
#[tracing::instrument(
    name = "relay.request",
    skip_all,
    fields(request_id = tracing::field::Empty, chat_id = tracing::field::Empty)
)]
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: ax_http::HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let span = tracing::Span::current();

    let user = match crate::identity::authenticate(&headers, &state.db).await {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!("[🖱️  -> ⚙️ ] Rejected unauthenticated chat request");
            return e.into_response();
        }
    };

    let request = match parse_chat_request(payload) {
        Ok(r) => r,
        Err(resp) => return *resp,
    };

    let chat_id = match resolve_chat(&state, &user, &request).await {
        Ok(id) => id,
        Err(resp) => return *resp,
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    span.record("request_id", &request_id);
    span.record("chat_id", &chat_id);

    tracing::info!(
        "[🖱️  -> ⚙️ ] Turn for chat [{}...] (history: {}, edit: {})",
        crate::str_utils::prefix_chars(&chat_id, 8),
        request.messages.len(),
        request.is_edit
    );

    let prompt = crate::conversation::build_messages(&state.system_preamble, &request.messages);

    let (tx, rx) = mpsc::channel(100);
    let relay = ChatRelay::new(state.clone(), tx, chat_id.clone(), request_id.clone());

    let stream_span = tracing::info_span!(
        "stream",
        rid = %crate::str_utils::prefix_chars(&request_id, 8),
        cid = %crate::str_utils::prefix_chars(&chat_id, 8),
    );
    tokio::spawn(relay.run(request, prompt).instrument(stream_span));

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text(": keepalive"),
        )
        .into_response()
}

fn parse_chat_request(
    payload: serde_json::Value,
) -> std::result::Result<ChatRequest, Box<Response>> {
    let request: ChatRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return Err(Box::new(
                (
                    ax_http::StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": format!("Payload deserialization failed: {}", e),
                        "code": "VALIDATION_ERROR",
                    })),
                )
                    .into_response(),
            ));
        }
    };

    if let Err(e) = request.validate() {
        tracing::error!("[🖱️  -> ⚙️ ] Validation Failed: {}", e.inner);
        return Err(Box::new(
            (
                ax_http::StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": e.inner.to_string(),
                    "code": "VALIDATION_ERROR",
                })),
            )
                .into_response(),
        ));
    }

    Ok(request)
}

/// Verifies ownership of an addressed chat, or creates one lazily on the
/// first user message so "New Chat" clicks never leave empty rows behind.
async fn resolve_chat(
    state: &Arc<AppState>,
    user: &UserId,
    request: &ChatRequest,
) -> std::result::Result<String, Box<Response>> {
    if let Some(chat_id) = &request.chat_id {
        match crate::db::chat_owner(&state.db, chat_id).await {
            Ok(Some(owner)) if &owner == user => Ok(chat_id.clone()),
            Ok(_) => Err(Box::new(
                (
                    ax_http::StatusCode::NOT_FOUND,
                    Json(serde_json::json!({ "error": "Chat not found" })),
                )
                    .into_response(),
            )),
            Err(e) => Err(Box::new(e.into_response())),
        }
    } else {
        let title = request.provisional_title();
        match crate::db::create_chat(&state.db, user, &title).await {
            Ok(chat) => {
                tracing::info!(
                    "[⚙️  -> 💾 ] Created chat [{}...] for first message",
                    crate::str_utils::prefix_chars(&chat.id, 8)
                );
                Ok(chat.id)
            }
            Err(e) => {
                tracing::error!("[⚙️  -> 💾 ] Failed to create chat: {}", e.inner);
                Err(Box::new(e.into_response()))
            }
        }
    }
}

/// `GET /chats`
async fn list_chats_handler(
    State(state): State<Arc<AppState>>,
    headers: ax_http::HeaderMap,
) -> Response {
    let user = match crate::identity::authenticate(&headers, &state.db).await {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };

    match crate::db::list_chats(&state.db, &user).await {
        Ok(chats) => Json(serde_json::json!({ "chats": chats })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /chats`
async fn create_chat_handler(
    State(state): State<Arc<AppState>>,
    headers: ax_http::HeaderMap,
    Json(body): Json<CreateChatRequest>,
) -> Response {
    let user = match crate::identity::authenticate(&headers, &state.db).await {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };

    let title = body
        .title
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| crate::constants::DEFAULT_CHAT_TITLE.to_string());

    match crate::db::create_chat(&state.db, &user, &title).await {
        Ok(chat) => Json(serde_json::json!({ "chat": chat })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct DeleteChatQuery {
    id: Option<String>,
}

/// `DELETE /chats?id=<id>`
async fn delete_chat_handler(
    State(state): State<Arc<AppState>>,
    headers: ax_http::HeaderMap,
    Query(query): Query<DeleteChatQuery>,
) -> Response {
    let user = match crate::identity::authenticate(&headers, &state.db).await {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };

    let Some(chat_id) = query.id else {
        return (
            ax_http::StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Chat ID is required" })),
        )
            .into_response();
    };

    match crate::db::delete_chat(&state.db, &user, &chat_id).await {
        Ok(true) => Json(serde_json::json!({ "success": true })).into_response(),
        Ok(false) => (
            ax_http::StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Chat not found" })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /chats/:chat_id/messages`
async fn chat_messages_handler(
    State(state): State<Arc<AppState>>,
    headers: ax_http::HeaderMap,
    Path(chat_id): Path<String>,
) -> Response {
    let user = match crate::identity::authenticate(&headers, &state.db).await {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };

    match crate::db::chat_owner(&state.db, &chat_id).await {
        Ok(Some(owner)) if owner == user => {}
        Ok(_) => {
            return (
                ax_http::StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "Chat not found" })),
            )
                .into_response()
        }
        Err(e) => return e.into_response(),
    }

    match crate::db::load_chat_messages(&state.db, &chat_id).await {
        Ok(records) => {
            let messages = crate::persistence::normalize_stored(records);
            Json(serde_json::json!({ "messages": messages })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `POST /chats/:chat_id/title`: synchronous title generation, used when a
/// first message is edited and the sidebar needs the new title immediately.
async fn chat_title_handler(
    State(state): State<Arc<AppState>>,
    headers: ax_http::HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<TitleRequest>,
) -> Response {
    let user = match crate::identity::authenticate(&headers, &state.db).await {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };

    if body.first_message.is_empty() {
        return (
            ax_http::StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "First message is required" })),
        )
            .into_response();
    }

    let title = crate::titles::generate_chat_title(&state, &body.first_message).await;

    match crate::db::update_chat_title(&state.db, &user, &chat_id, &title).await {
        Ok(Some(stored)) => Json(serde_json::json!({ "title": stored })).into_response(),
        Ok(None) => (
            ax_http::StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Chat not found" })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// `DELETE /user`: account deletion. Requires the elevated service key to
/// be configured server-side; the caller still authenticates as themselves.
async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    headers: ax_http::HeaderMap,
) -> Response {
    let user = match crate::identity::authenticate(&headers, &state.db).await {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };

    if state.service_key.is_none() {
        return (
            ax_http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": "Service key not configured. Please add STRATUS_SERVICE_KEY to your environment variables.",
            })),
        )
            .into_response();
    }

    match crate::db::delete_user_account(&state.db, &user).await {
        Ok(()) => {
            tracing::info!(
                "[⚙️  -> 💾 ] Deleted account [{}...]",
                crate::str_utils::prefix_chars(&user.0, 8)
            );
            Json(serde_json::json!({ "success": true })).into_response()
        }
        Err(e) => e.into_response(),
    }
}
