//! OpenAI-compatible implementations of the provider capabilities. Any
//! endpoint speaking the OpenAI API (including local gateways) works via
//! `openai_base_url`.

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        CreateEmbeddingRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};

use super::{ChatModel, EmbeddingModel};
use crate::error::RagError;

fn provider_error(err: impl std::fmt::Display) -> RagError {
    RagError::DependencyUnavailable(err.to_string())
}

pub struct OpenAiChatModel {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(client: Client<OpenAIConfig>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn generate(&self, prompt: &str) -> Result<String, RagError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .messages([ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(provider_error)?
                .into()])
            .build()
            .map_err(provider_error)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(provider_error)?;

        Ok(response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<BoxStream<'static, Result<String, RagError>>, RagError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .stream(true)
            .messages([ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(provider_error)?
                .into()])
            .build()
            .map_err(provider_error)?;

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(provider_error)?;

        let mapped = stream.filter_map(|item| async move {
            match item {
                Ok(response) => response
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                    .filter(|content| !content.is_empty())
                    .map(Ok),
                Err(err) => Some(Err(provider_error(err))),
            }
        });

        Ok(mapped.boxed())
    }
}

pub struct OpenAiEmbeddingModel {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: u32,
}

impl OpenAiEmbeddingModel {
    pub fn new(client: Client<OpenAIConfig>, model: impl Into<String>, dimensions: u32) -> Self {
        Self {
            client,
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddingModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn model_version(&self) -> &str {
        "1.0"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .dimensions(self.dimensions)
            .input(texts.to_vec())
            .build()
            .map_err(provider_error)?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(provider_error)?;

        if response.data.len() != texts.len() {
            return Err(RagError::DependencyUnavailable(format!(
                "embedding response size mismatch: sent {}, got {}",
                texts.len(),
                response.data.len()
            )));
        }

        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}
