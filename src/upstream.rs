use crate::constants::{CHAT_COMPLETIONS_PATH, IMAGES_PATH};
use crate::hardening::RetryPolicy;
use crate::specs::openai::*;
use crate::types::*;

/// Handle on the OpenAI-compatible provider. Built once at startup and
/// carried in `AppState`; tests construct one against a local mock server,
/// so nothing reads process-wide environment at call time.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry,
        }
    }

    /// Opens a streaming completion. Retries apply only to establishing the
    /// response; once streaming begins, failures belong to the relay.
    pub async fn stream_chat(&self, request: &OpenAiRequest) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, CHAT_COMPLETIONS_PATH);
        self.retry
            .execute_with_retry(|| {
                let url = url.clone();
                async move {
                    let response = self
                        .client
                        .post(&url)
                        .header("Authorization", format!("Bearer {}", self.api_key))
                        .json(request)
                        .send()
                        .await
                        .map_err(StratusError::Network)?;

                    let status = response.status();
                    if status.is_success() {
                        Ok(response)
                    } else {
                        let error_body = match response.text().await {
                            Ok(text) => text,
                            Err(_) => "Unknown error".to_string(),
                        };
                        Err(ObservedError::from(StratusError::Upstream(
                            status, error_body,
                        )))
                    }
                }
            })
            .await
    }

    /// One-shot, non-streaming completion (title generation).
    pub async fn complete_chat(&self, request: &OpenAiRequest) -> Result<ChatCompletionResponse> {
        let url = format!("{}{}", self.base_url, CHAT_COMPLETIONS_PATH);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(StratusError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(_) => "Unknown error".to_string(),
            };
            return Err(StratusError::Upstream(status, error_body).into());
        }

        Ok(response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(StratusError::Network)?)
    }

    pub async fn generate_image(
        &self,
        request: &ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse> {
        let url = format!("{}{}", self.base_url, IMAGES_PATH);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(StratusError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(_) => "Unknown error".to_string(),
            };
            return Err(StratusError::Upstream(status, error_body).into());
        }

        Ok(response
            .json::<ImageGenerationResponse>()
            .await
            .map_err(StratusError::Network)?)
    }
}
