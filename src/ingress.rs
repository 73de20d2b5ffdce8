use crate::types::*;
use serde::{Deserialize, Serialize};

/// Body of `POST /chat`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<IncomingMessage>,
    #[serde(default, rename = "chatId")]
    pub chat_id: Option<String>,
    #[serde(default, rename = "isEdit")]
    pub is_edit: bool,
}

/// One turn as the client sends it. Ids and sequence numbers are assigned
/// server-side at persistence time, never trusted from the client.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IncomingMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub files: Option<Vec<FileAttachment>>,
    #[serde(default)]
    pub edited: Option<bool>,
    #[serde(default)]
    pub edited_at: Option<String>,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(StratusError::InvalidRequest(
                "Request must contain at least one message".into(),
            )
            .into());
        }

        if self.is_edit {
            if self.chat_id.is_none() {
                return Err(StratusError::InvalidRequest(
                    "Edit requests must reference an existing chat".into(),
                )
                .into());
            }
            let last_is_user = self
                .messages
                .last()
                .map(|m| m.role == Role::User)
                .unwrap_or(false);
            if !last_is_user {
                return Err(StratusError::InvalidRequest(
                    "Edit requests must end with the edited user message".into(),
                )
                .into());
            }
        }

        for (i, msg) in self.messages.iter().enumerate() {
            for (f_idx, file) in msg.files.iter().flatten().enumerate() {
                if file.name.is_empty() {
                    return Err(StratusError::InvalidRequest(format!(
                        "Message {} attachment {} has an empty name",
                        i, f_idx
                    ))
                    .into());
                }
            }
        }

        Ok(())
    }

    /// The user turn this request is asking the assistant to answer, if any.
    pub fn last_user_message(&self) -> Option<&IncomingMessage> {
        self.messages.last().filter(|m| m.role == Role::User)
    }

    /// Seed text for a lazily-created chat's provisional title.
    pub fn provisional_title(&self) -> String {
        let seed = self
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        if seed.is_empty() {
            crate::constants::DEFAULT_CHAT_TITLE.to_string()
        } else {
            crate::str_utils::prefix_chars(seed, crate::constants::TITLE_MAX_CHARS).to_string()
        }
    }
}

/// Body of `POST /chats`.
#[derive(Deserialize, Debug)]
pub struct CreateChatRequest {
    #[serde(default)]
    pub title: Option<String>,
}

/// Body of `POST /chats/:chat_id/title`.
#[derive(Deserialize, Debug)]
pub struct TitleRequest {
    #[serde(rename = "firstMessage")]
    pub first_message: String,
}
