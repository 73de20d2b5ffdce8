use crate::attachments::extract_file_content;
use crate::constants::{AVAILABLE_TOOLS_NOTE, FILE_SECTION_SEPARATOR};
use crate::ingress::IncomingMessage;
use crate::specs::openai::*;
use crate::types::*;

/// Reads the system preamble from disk and pins the tool-availability note
/// onto it. The note is a fixed policy string, not runtime-configurable.
pub async fn load_system_preamble(path: &str) -> Result<String> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        StratusError::Configuration(format!("Failed to read system preamble {}: {}", path, e))
    })?;
    Ok(format!("{}{}", raw.trim(), AVAILABLE_TOOLS_NOTE))
}

/// Maps the incoming turn list onto the chat-completions payload, in
/// chronological order, with attachments inlined.
///
/// Formatting strategy: image attachments become multimodal `image_url`
/// parts carrying the data URL; non-image attachments are inlined as
/// extracted text inside the user turn's text part.
pub fn build_messages(preamble: &str, history: &[IncomingMessage]) -> Vec<OpenAiMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(OpenAiMessage::System {
        content: preamble.to_string(),
    });

    for msg in history {
        match msg.role {
            Role::User => messages.push(build_user_message(msg)),
            Role::Assistant => messages.push(OpenAiMessage::Assistant {
                content: Some(msg.content.clone()),
                tool_calls: Vec::new(),
            }),
        }
    }

    messages
}

fn build_user_message(msg: &IncomingMessage) -> OpenAiMessage {
    let files = msg.files.as_deref().unwrap_or_default();
    if files.is_empty() {
        return OpenAiMessage::User {
            content: OpenAiContent::String(msg.content.clone()),
        };
    }

    let mut sections: Vec<String> = Vec::new();
    let mut image_parts: Vec<OpenAiContentPart> = Vec::new();

    for file in files {
        if file.is_image() {
            image_parts.push(OpenAiContentPart::ImageUrl {
                image_url: OpenAiImageUrl {
                    url: file.data.clone(),
                },
            });
        } else {
            sections.push(render_file_section(file));
        }
    }

    let text = render_user_text(&msg.content, &sections);

    if image_parts.is_empty() {
        return OpenAiMessage::User {
            content: OpenAiContent::String(text),
        };
    }

    // Text part first, image parts after, preserving attachment order
    let mut parts = vec![OpenAiContentPart::Text { text }];
    parts.extend(image_parts);
    OpenAiMessage::User {
        content: OpenAiContent::Parts(parts),
    }
}

fn render_file_section(file: &FileAttachment) -> String {
    match extract_file_content(file) {
        Some(content) => format!(
            "[File: {} ({} KB, type: {})]\nContent:\n{}",
            file.name,
            file.size_kb(),
            file.mime_type,
            content
        ),
        None => format!(
            "[File: {} ({} KB, type: {}) - Content could not be extracted]",
            file.name,
            file.size_kb(),
            file.mime_type
        ),
    }
}

fn render_user_text(content: &str, sections: &[String]) -> String {
    if sections.is_empty() {
        return content.to_string();
    }
    let block = sections.join(FILE_SECTION_SEPARATOR);
    if content.is_empty() {
        format!("Attached files:\n\n{}", block)
    } else {
        format!("{}\n\n---\n\nAttached files:\n\n{}", content, block)
    }
}
