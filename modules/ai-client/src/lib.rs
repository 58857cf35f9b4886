//! Minimal OpenAI client used by the evaluation pipeline.
//!
//! Two entry points: [`OpenAi::extract`] for strict structured output and
//! [`OpenAi::chat_completion`] for free text. Both report token usage so
//! callers can cost each call.

mod client;
pub mod schema;
pub(crate) mod types;
pub mod util;

pub use schema::StructuredOutput;
pub use types::TokenUsage;

use anyhow::{anyhow, Result};

use client::OpenAiClient;

/// A model response paired with the tokens it consumed.
#[derive(Debug, Clone)]
pub struct Completion<T> {
    pub value: T,
    pub usage: TokenUsage,
}

#[derive(Clone)]
pub struct OpenAi {
    api_key: String,
    model: String,
    base_url: Option<String>,
}

impl OpenAi {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let mut client = Self::new(api_key, model);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            client = client.with_base_url(url);
        }
        Ok(client)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Default model used when a call does not name one.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn client(&self) -> OpenAiClient {
        let client = OpenAiClient::new(&self.api_key);
        match self.base_url {
            Some(ref url) => client.with_base_url(url),
            None => client,
        }
    }

    /// Strict JSON-schema extraction into `T`.
    ///
    /// `temperature` is ignored for reasoning models (`gpt-5*`, `o*`), which
    /// reject the parameter.
    pub async fn extract<T: StructuredOutput>(
        &self,
        model: &str,
        temperature: f32,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Result<Completion<T>> {
        let request = types::ChatRequest::new(model)
            .message(types::WireMessage::system(system_prompt))
            .message(types::WireMessage::user(user_prompt))
            .temperature(temperature)
            .response_format(types::ResponseFormat::json_schema(
                T::type_name(),
                T::openai_schema(),
            ));

        let (content, usage) = self.client().chat(&request).await?;
        let value = serde_json::from_str(util::strip_code_blocks(&content))
            .map_err(|e| anyhow!("Failed to deserialize structured response: {e}"))?;

        Ok(Completion { value, usage })
    }

    /// Free-text completion against the default model.
    pub async fn chat_completion(
        &self,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<Completion<String>> {
        let request = types::ChatRequest::new(&self.model)
            .message(types::WireMessage::system(system))
            .message(types::WireMessage::user(user))
            .temperature(0.0);

        let (value, usage) = self.client().chat(&request).await?;
        Ok(Completion { value, usage })
    }
}
