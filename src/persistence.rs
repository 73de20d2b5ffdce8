use crate::ingress::ChatRequest;
use crate::main_helper::AppState;
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Per-chat write locks. Two simultaneous sends against one chat id would
/// otherwise race the read-modify-write of the message document and corrupt
/// `message_number` ordering; holding the chat's lock across the whole
/// persist serializes them.
#[derive(Default)]
pub struct ChatLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, chat_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = match self.inner.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Backfills `id`/`created_at`/`message_number` on rows written before those
/// fields existed. Position-based numbering mirrors what the array order
/// already implied.
pub fn normalize_stored(records: Vec<StoredMessageRecord>) -> Vec<StoredMessage> {
    records
        .into_iter()
        .enumerate()
        .map(|(index, r)| StoredMessage {
            id: r.id.unwrap_or_else(new_id),
            role: r.role,
            content: r.content,
            files: r.files,
            images: r.images,
            created_at: r.created_at.unwrap_or_else(now_iso),
            message_number: r.message_number.unwrap_or(index as u32 + 1),
            edited: r.edited,
            edited_at: r.edited_at,
        })
        .collect()
}

pub fn next_message_number(messages: &[StoredMessage]) -> u32 {
    messages
        .iter()
        .map(|m| m.message_number)
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}

/// Result of reconciling a finished relay turn against the stored list.
pub struct ReconciledTranscript {
    pub messages: Vec<StoredMessage>,
    /// Seed text for title generation when this turn establishes (or edits)
    /// the chat's first user message.
    pub title_seed: Option<String>,
}

/// Normal mode: append the new user turn (if the request carried one) and
/// the assistant turn after the existing list.
pub fn reconcile_append(
    existing: Vec<StoredMessage>,
    request: &ChatRequest,
    assistant_text: &str,
    images: &[GeneratedImage],
) -> ReconciledTranscript {
    let mut messages = existing;
    let mut next = next_message_number(&messages);

    let user_turn = request.last_user_message();
    if let Some(user) = user_turn {
        messages.push(StoredMessage {
            id: new_id(),
            role: Role::User,
            content: user.content.clone(),
            files: user.files.clone(),
            images: None,
            created_at: now_iso(),
            message_number: next,
            edited: None,
            edited_at: None,
        });
        next += 1;
    }

    messages.push(assistant_turn(assistant_text, images, next));

    // First user message in the chat: kick off title generation
    let title_seed = if request.messages.len() == 1 {
        user_turn.map(|u| u.content.clone())
    } else {
        None
    };

    ReconciledTranscript {
        messages,
        title_seed,
    }
}

/// Edit mode: the request's message list (already truncated client-side to
/// end at the edited turn) becomes the source of truth. Every message before
/// the edited one recovers its stored metadata by `(role, content)` match;
/// the edited turn and the fresh assistant turn get new metadata. Nothing of
/// the discarded suffix survives.
pub fn reconcile_edit(
    stored: Vec<StoredMessage>,
    request: &ChatRequest,
    assistant_text: &str,
    images: &[GeneratedImage],
) -> ReconciledTranscript {
    let (edited, prefix) = match request.messages.split_last() {
        Some((e, p)) => (e, p),
        None => {
            // Validation rejects empty edit requests; degrade to append
            return reconcile_append(stored, request, assistant_text, images);
        }
    };

    let mut consumed = vec![false; stored.len()];
    let mut messages: Vec<StoredMessage> = Vec::with_capacity(prefix.len() + 2);
    let mut max_number = 0u32;

    for incoming in prefix {
        let recovered = stored.iter().enumerate().find(|(i, m)| {
            !consumed[*i] && m.role == incoming.role && m.content == incoming.content
        });
        let turn = match recovered {
            Some((i, m)) => {
                consumed[i] = true;
                m.clone()
            }
            None => StoredMessage {
                id: new_id(),
                role: incoming.role,
                content: incoming.content.clone(),
                files: incoming.files.clone(),
                images: None,
                created_at: now_iso(),
                message_number: max_number + 1,
                edited: incoming.edited,
                edited_at: incoming.edited_at.clone(),
            },
        };
        max_number = max_number.max(turn.message_number);
        messages.push(turn);
    }

    let edited_number = max_number + 1;
    let now = now_iso();
    messages.push(StoredMessage {
        id: new_id(),
        role: Role::User,
        content: edited.content.clone(),
        files: edited.files.clone(),
        images: None,
        created_at: now.clone(),
        message_number: edited_number,
        edited: Some(true),
        edited_at: Some(now),
    });

    messages.push(assistant_turn(assistant_text, images, edited_number + 1));

    // Editing the first user message regenerates the title
    let prefix_has_user = prefix.iter().any(|m| m.role == Role::User);
    let title_seed = if prefix_has_user {
        None
    } else {
        Some(edited.content.clone())
    };

    ReconciledTranscript {
        messages,
        title_seed,
    }
}

fn assistant_turn(text: &str, images: &[GeneratedImage], number: u32) -> StoredMessage {
    StoredMessage {
        id: new_id(),
        role: Role::Assistant,
        content: text.to_string(),
        files: None,
        images: if images.is_empty() {
            None
        } else {
            Some(images.to_vec())
        },
        created_at: now_iso(),
        message_number: number,
        edited: None,
        edited_at: None,
    }
}

/// Writes the finished turn back to storage. Runs under the chat's write
/// lock; the outbound stream has already received its terminal sentinel, so
/// failures here are logged by the caller and invisible to the client.
pub async fn persist_turn(
    state: &Arc<AppState>,
    chat_id: &str,
    request: &ChatRequest,
    assistant_text: &str,
    images: &[GeneratedImage],
) -> Result<Vec<StoredMessage>> {
    let lock = state.chat_locks.lock_for(chat_id);
    let _guard = lock.lock().await;

    let stored = normalize_stored(crate::db::load_chat_messages(&state.db, chat_id).await?);

    let reconciled = if request.is_edit {
        reconcile_edit(stored, request, assistant_text, images)
    } else {
        reconcile_append(stored, request, assistant_text, images)
    };

    // A provisional title goes in with the same write; the generated one
    // lands later from the background task.
    let provisional = reconciled
        .title_seed
        .as_ref()
        .map(|_| request.provisional_title());

    crate::db::store_chat_messages(
        &state.db,
        chat_id,
        &reconciled.messages,
        provisional.as_deref(),
    )
    .await?;

    tracing::info!(
        "[⚙️  -> 💾 ] Persisted chat [{}...]: {} messages",
        crate::str_utils::prefix_chars(chat_id, 8),
        reconciled.messages.len()
    );

    if let Some(seed) = reconciled.title_seed {
        crate::titles::spawn_title_generation(state.clone(), chat_id.to_string(), seed);
    }

    Ok(reconciled.messages)
}
