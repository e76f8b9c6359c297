//! Classification model seam and the OpenAI-compatible implementation.

use async_trait::async_trait;

use crate::error::Result;

/// Anything that turns a prompt into raw model text.
///
/// Implementations may fail; the coordinator converts failures into a
/// fallback classification rather than propagating them.
#[async_trait]
pub trait ClassifierModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Identifier used in logs and run reports
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: ClassifierModel + ?Sized> ClassifierModel for std::sync::Arc<T> {
    async fn complete(&self, prompt: &str) -> Result<String> {
        (**self).complete(prompt).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[cfg(feature = "ml")]
pub use openai::OpenAiClassifier;

#[cfg(feature = "ml")]
mod openai {
    use async_openai::{
        config::OpenAIConfig,
        error::OpenAIError,
        types::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs},
        Client,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tracing::debug;

    use super::ClassifierModel;
    use crate::config::ClassifierConfig;
    use crate::error::{JanitorError, Result};

    /// Chat-completions client for OpenAI, Ollama and other compatible endpoints
    pub struct OpenAiClassifier {
        client: Client<OpenAIConfig>,
        model: String,
        temperature: f32,
        timeout: Duration,
    }

    impl OpenAiClassifier {
        pub fn new(api_base: &str, api_key: Option<String>, model: impl Into<String>) -> Self {
            let mut config = OpenAIConfig::new().with_api_base(api_base.trim_end_matches('/'));
            if let Some(key) = api_key {
                config = config.with_api_key(key);
            }

            Self {
                client: Client::with_config(config),
                model: model.into(),
                temperature: 0.4,
                timeout: Duration::from_secs(120),
            }
        }

        /// Build from the `[classifier]` section, reading the key from the configured env var.
        pub fn from_config(config: &ClassifierConfig) -> Self {
            let api_key = std::env::var(&config.api_key_env)
                .ok()
                .filter(|k| !k.is_empty());

            Self::new(&config.api_base, api_key, config.model.clone())
                .with_temperature(config.temperature)
                .with_timeout(Duration::from_secs(config.request_timeout_secs))
        }

        pub fn with_temperature(mut self, temperature: f32) -> Self {
            self.temperature = temperature;
            self
        }

        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }
    }

    #[async_trait]
    impl ClassifierModel for OpenAiClassifier {
        async fn complete(&self, prompt: &str) -> Result<String> {
            let message = ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|e| JanitorError::ModelError(e.to_string()))?;

            let request = CreateChatCompletionRequestArgs::default()
                .model(self.model.as_str())
                .temperature(self.temperature)
                .messages([message.into()])
                .build()
                .map_err(|e| JanitorError::ModelError(e.to_string()))?;

            debug!(model = %self.model, prompt_chars = prompt.len(), "Sending classification request");

            let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
                .await
                .map_err(|_| {
                    JanitorError::ModelError(format!(
                        "model call timed out after {:?}",
                        self.timeout
                    ))
                })?
                .map_err(endpoint_error)?;

            Ok(response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .unwrap_or_default())
        }

        fn name(&self) -> &str {
            &self.model
        }
    }

    /// Keep the endpoint's own message for rejected requests
    fn endpoint_error(error: OpenAIError) -> JanitorError {
        match error {
            OpenAIError::ApiError(api) => {
                JanitorError::ModelError(format!("Model endpoint rejected request: {}", api.message))
            }
            OpenAIError::JSONDeserialize(e) => {
                JanitorError::ModelError(format!("Failed to parse response: {}", e))
            }
            other => JanitorError::ModelError(other.to_string()),
        }
    }
}
