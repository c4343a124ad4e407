use crate::error::Result;
use crate::llm::types::GenerationRequest;
use std::future::Future;

/// Anything that turns a prompt into free text.
///
/// Implementations report transport failures as
/// [`VarianceError::ModelUnreachable`](crate::error::VarianceError::ModelUnreachable);
/// every other error is treated like an unusable reply.
pub trait ModelEndpoint: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> impl Future<Output = Result<String>> + Send;

    /// Human-readable address, used in logs and error messages.
    fn describe(&self) -> String {
        "model endpoint".to_string()
    }
}

impl<E: ModelEndpoint> ModelEndpoint for &E {
    fn generate(&self, request: &GenerationRequest) -> impl Future<Output = Result<String>> + Send {
        (**self).generate(request)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[cfg(feature = "ollama")]
pub use ollama::OllamaClient;

#[cfg(feature = "ollama")]
mod ollama {
    use super::ModelEndpoint;
    use crate::config::ModelConfig;
    use crate::error::{Result, VarianceError};
    use crate::llm::types::*;
    use log::debug;
    use reqwest::Client;
    use std::time::Duration;

    const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Chat client for a local Ollama server.
    #[derive(Clone)]
    pub struct OllamaClient {
        client: Client,
        base_url: String,
        model: String,
    }

    impl OllamaClient {
        pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
            Self {
                client: Client::new(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
                model: model.into(),
            }
        }

        pub fn from_config(config: &ModelConfig) -> Self {
            Self::new(&config.base_url, &config.model)
        }

        pub fn model(&self) -> &str {
            &self.model
        }

        /// True when the server answers on `/api/tags`.
        pub async fn is_available(&self) -> bool {
            let url = format!("{}/api/tags", self.base_url);
            match self
                .client
                .get(&url)
                .timeout(HEALTH_CHECK_TIMEOUT)
                .send()
                .await
            {
                Ok(res) => res.status().is_success(),
                Err(e) => {
                    debug!("Ollama health check failed: {}", e);
                    false
                }
            }
        }

        /// Names of the models installed on the server.
        pub async fn list_models(&self) -> Result<Vec<String>> {
            let url = format!("{}/api/tags", self.base_url);
            let res = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| self.transport_error(e))?;

            let status = res.status();
            if !status.is_success() {
                return Err(VarianceError::ModelUnreachable {
                    endpoint: self.base_url.clone(),
                    details: format!("listing models failed with status {}", status),
                });
            }

            let body: OllamaTagsResponse = res
                .json()
                .await
                .map_err(|e| VarianceError::ResponseParseFailure(e.to_string()))?;
            Ok(body.models.into_iter().map(|m| m.name).collect())
        }

        fn transport_error(&self, e: reqwest::Error) -> VarianceError {
            if e.is_timeout() {
                VarianceError::ResponseParseFailure(format!("request timed out: {}", e))
            } else if e.is_decode() {
                VarianceError::ResponseParseFailure(format!("undecodable response: {}", e))
            } else {
                VarianceError::ModelUnreachable {
                    endpoint: self.base_url.clone(),
                    details: e.to_string(),
                }
            }
        }
    }

    impl ModelEndpoint for OllamaClient {
        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            let url = format!("{}/api/chat", self.base_url);

            let mut messages = Vec::with_capacity(request.messages.len() + 1);
            messages.push(ChatMessage::system(&request.system));
            messages.extend(request.messages.iter().cloned());

            let payload = OllamaChatRequest {
                model: &self.model,
                messages,
                stream: false,
                options: OllamaOptions {
                    temperature: request.temperature,
                },
            };

            let res = self
                .client
                .post(&url)
                .json(&payload)
                .send()
                .await
                .map_err(|e| self.transport_error(e))?;
            let status = res.status();

            if !status.is_success() {
                let err_text = res.text().await.unwrap_or_default();
                // A missing model or an overloaded server will not fix itself on a reworded prompt.
                return Err(VarianceError::ModelUnreachable {
                    endpoint: self.base_url.clone(),
                    details: format!("Ollama API error (status {}): {}", status, err_text),
                });
            }

            let body: OllamaChatResponse = res
                .json()
                .await
                .map_err(|e| self.transport_error(e))?;

            body.message
                .map(|m| m.content)
                .ok_or_else(|| VarianceError::ResponseParseFailure("no message in response".to_string()))
        }

        fn describe(&self) -> String {
            format!("{} ({})", self.base_url, self.model)
        }
    }

}
