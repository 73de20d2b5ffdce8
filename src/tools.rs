use crate::constants::{IMAGE_MODEL, IMAGE_SIZES, TOOL_GENERATE_IMAGE};
use crate::main_helper::AppState;
use crate::specs::openai::*;
use crate::types::*;
use serde::Deserialize;

/// Tool surface advertised on the primary completion call. A single tool is
/// defined; the follow-up call advertises none.
pub fn tool_descriptors() -> Vec<OpenAiTool> {
    vec![OpenAiTool {
        r#type: "function".to_string(),
        function: OpenAiFunctionDef {
            name: TOOL_GENERATE_IMAGE.to_string(),
            description: "Generate an image from a text prompt. Use when the user asks for an image to be generated, created, or visualized.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "Description of the image to generate"
                    },
                    "size": {
                        "type": "string",
                        "enum": IMAGE_SIZES,
                        "description": "Optional output dimensions"
                    }
                },
                "required": ["prompt"]
            }),
        },
    }]
}

#[derive(Deserialize, Debug)]
struct ImageToolArgs {
    prompt: String,
    #[serde(default)]
    size: Option<String>,
}

/// Outcome of one executed tool call, kept for the follow-up payload and
/// the persisted transcript.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
    /// Structured result fed back to the model; empty string on failure
    pub result_json: String,
    pub image: Option<GeneratedImage>,
}

/// Executes a single pending tool call. Unknown tool names are skipped
/// entirely (`None`, logged); execution failures still yield an outcome so
/// the follow-up turn stays aligned with the advertised calls.
pub async fn execute_call(state: &AppState, call: &ToolCallBuffer) -> Option<ToolOutcome> {
    if call.name != TOOL_GENERATE_IMAGE {
        tracing::warn!("[⚙️ ] Skipping unknown tool call '{}' ({})", call.name, call.id);
        return None;
    }

    let args: ImageToolArgs = match serde_json::from_str(&call.arguments) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(
                "[⚙️ ] Tool call {} has unparseable arguments: {}",
                call.id,
                e
            );
            return Some(ToolOutcome {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                result_json: String::new(),
                image: None,
            });
        }
    };

    match generate_image(state, &args).await {
        Ok(image) => {
            let result_json = serde_json::json!({
                "type": "image",
                "prompt": image.prompt,
                "status": "generated",
            })
            .to_string();
            Some(ToolOutcome {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                result_json,
                image: Some(image),
            })
        }
        Err(e) => {
            tracing::error!("[☁️  -> ⚙️ ] Image generation failed for {}: {}", call.id, e);
            Some(ToolOutcome {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                result_json: String::new(),
                image: None,
            })
        }
    }
}

async fn generate_image(state: &AppState, args: &ImageToolArgs) -> Result<GeneratedImage> {
    let size = args
        .size
        .as_deref()
        .filter(|s| IMAGE_SIZES.contains(s))
        .map(|s| s.to_string());

    let request = ImageGenerationRequest {
        model: IMAGE_MODEL.to_string(),
        prompt: args.prompt.clone(),
        size,
        n: 1,
    };

    let response = state.upstream.generate_image(&request).await?;
    let datum = response.data.into_iter().next().ok_or_else(|| {
        StratusError::Upstream(
            axum::http::StatusCode::BAD_GATEWAY,
            "Image API returned no data".to_string(),
        )
    })?;

    let url = match (datum.b64_json, datum.url) {
        (Some(b64), _) => format!("data:image/png;base64,{}", b64),
        (None, Some(url)) => url,
        (None, None) => {
            return Err(StratusError::Upstream(
                axum::http::StatusCode::BAD_GATEWAY,
                "Image API returned neither b64_json nor url".to_string(),
            )
            .into())
        }
    };

    Ok(GeneratedImage {
        url,
        prompt: Some(datum.revised_prompt.unwrap_or_else(|| args.prompt.clone())),
    })
}

/// Builds the follow-up payload: the original conversation plus a synthetic
/// assistant turn recording the executed calls and one tool turn per result.
pub fn build_followup_messages(
    mut messages: Vec<OpenAiMessage>,
    outcomes: &[ToolOutcome],
) -> Vec<OpenAiMessage> {
    messages.push(OpenAiMessage::Assistant {
        content: None,
        tool_calls: outcomes
            .iter()
            .map(|o| OpenAiToolCall {
                id: o.call_id.clone(),
                r#type: "function".to_string(),
                function: OpenAiFunctionCall {
                    name: o.name.clone(),
                    arguments: o.arguments.clone(),
                },
            })
            .collect(),
    });

    for outcome in outcomes {
        messages.push(OpenAiMessage::Tool {
            content: outcome.result_json.clone(),
            tool_call_id: outcome.call_id.clone(),
        });
    }

    messages
}
