use crate::constants::*;
use crate::main_helper::AppState;
use crate::specs::openai::*;
use crate::str_utils;
use std::sync::Arc;

/// Generates a concise title for a chat from its first user message.
/// Never fails: any upstream problem falls back to a prefix of the seed.
pub async fn generate_chat_title(state: &AppState, first_message: &str) -> String {
    let fallback = || {
        let prefix = str_utils::prefix_chars(first_message, TITLE_MAX_CHARS);
        if prefix.is_empty() {
            DEFAULT_CHAT_TITLE.to_string()
        } else {
            prefix.to_string()
        }
    };

    if first_message.trim().is_empty() {
        return DEFAULT_CHAT_TITLE.to_string();
    }

    let request = OpenAiRequest {
        model: TITLE_MODEL.to_string(),
        messages: vec![
            OpenAiMessage::System {
                content: TITLE_SYSTEM_PROMPT.to_string(),
            },
            OpenAiMessage::User {
                content: OpenAiContent::String(first_message.to_string()),
            },
        ],
        stream: None,
        temperature: Some(TITLE_TEMPERATURE),
        max_tokens: Some(TITLE_MAX_TOKENS),
        tools: None,
    };

    match state.upstream.complete_chat(&request).await {
        Ok(response) => {
            let generated = response
                .choices
                .first()
                .and_then(|c| c.message.content.as_deref())
                .map(|c| c.trim().to_string())
                .unwrap_or_default();
            if generated.is_empty() {
                fallback()
            } else {
                str_utils::prefix_chars(&generated, TITLE_MAX_CHARS).to_string()
            }
        }
        Err(e) => {
            tracing::error!("[☁️  -> ⚙️ ] Title generation failed: {}", e);
            fallback()
        }
    }
}

/// Fire-and-forget title generation with its own error boundary. The task
/// outlives the request that spawned it and must never take the process
/// down, so every failure path ends in a log line.
pub fn spawn_title_generation(state: Arc<AppState>, chat_id: String, seed: String) {
    tokio::spawn(async move {
        let title = generate_chat_title(&state, &seed).await;
        let result = sqlx::query("UPDATE chats SET title = ? WHERE id = ?")
            .bind(&title)
            .bind(&chat_id)
            .execute(&state.db)
            .await;
        match result {
            Ok(_) => {
                tracing::info!(
                    "[⚙️  -> 💾 ] Title for chat [{}...]: {:?}",
                    crate::str_utils::prefix_chars(&chat_id, 8),
                    title
                );
            }
            Err(e) => {
                tracing::error!(
                    "Failed to store generated title for chat [{}...]: {}",
                    crate::str_utils::prefix_chars(&chat_id, 8),
                    e
                );
            }
        }
    });
}
