//! # API Module
//!
//! The language-model seam of the analyst.
//!
//! [`LanguageModel::generate`] takes one prompt and yields the answer as a
//! [`TextStream`]: a finite, single-pass stream of text chunks in the order the
//! backend produced them. Callers that only need the whole answer use
//! [`collect_text`]; the report printer consumes the chunks as they arrive.
//!
//! [`OpenAiModel`] implements the trait for any OpenAI-compatible endpoint via
//! `async-openai`. With `should_stream: true` it forwards the token deltas of a
//! streaming completion; otherwise it fetches one completion and yields it as a
//! single chunk.
//!
//! # Example
//!
//! ```no_run
//! use db_analyst::api::{LanguageModel, OpenAiModel, collect_text};
//! use db_analyst::config::AnalystConfig;
//!
//! # async fn demo() -> db_analyst::error::Result<()> {
//! let model = OpenAiModel::new(&AnalystConfig::default());
//! let stream = model.generate("Say hello in SQL.").await?;
//! let text = collect_text(stream, |chunk| print!("{chunk}")).await?;
//! # Ok(()) }
//! ```

use std::pin::Pin;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt, future, stream};
use tracing::{debug, error};

use crate::{
    config::AnalystConfig,
    error::{AnalystError, Result},
};

/// Incremental model output. Finite, single-pass and not restartable.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Anything that can answer a prompt with a stream of text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start generating an answer for `prompt`.
    ///
    /// Errors may arrive either here (request rejected) or as an item of the
    /// returned stream (failure mid-generation).
    async fn generate(&self, prompt: &str) -> Result<TextStream>;
}

/// Drain `stream`, handing each chunk to `on_chunk`, and return the concatenation.
///
/// Stops at the first failed chunk and returns its error.
pub async fn collect_text(
    mut stream: TextStream,
    mut on_chunk: impl FnMut(&str),
) -> Result<String> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        on_chunk(&chunk);
        text.push_str(&chunk);
    }
    Ok(text)
}

/// A model served by an OpenAI-compatible chat completions endpoint.
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: Option<u32>,
    system_prompt: Option<String>,
    should_stream: bool,
}

impl OpenAiModel {
    pub fn new(config: &AnalystConfig) -> Self {
        Self {
            client: create_client(config),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
            should_stream: config.should_stream.unwrap_or(false),
        }
    }

    fn build_request(&self, prompt: &str) -> Result<CreateChatCompletionRequest> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);
        if let Some(system_prompt) = &self.system_prompt {
            messages.push(ChatCompletionRequestSystemMessage::from(system_prompt.as_str()).into());
        }
        messages.push(ChatCompletionRequestUserMessage::from(prompt).into());

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone()).messages(messages);
        if let Some(max_tokens) = self.max_tokens {
            args.max_completion_tokens(max_tokens);
        }
        Ok(args.build()?)
    }

    async fn stream_response(&self, request: CreateChatCompletionRequest) -> Result<TextStream> {
        let responses = self.client.chat().create_stream(request).await?;
        let chunks = responses.map(|result| match result {
            Ok(response) => {
                debug!("Received chunk: {:?}", response);
                Ok(response
                    .choices
                    .iter()
                    .filter_map(|choice| choice.delta.content.as_deref())
                    .collect::<String>())
            }
            Err(err) => {
                error!("Received error: {}", err);
                Err(AnalystError::from(err))
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn fetch_response(&self, request: CreateChatCompletionRequest) -> Result<TextStream> {
        let response = self.client.chat().create(request).await?;
        let text: String = response
            .choices
            .iter()
            .filter_map(|choice| choice.message.content.as_deref())
            .collect();
        debug!("Received response of {} bytes", text.len());
        Ok(Box::pin(stream::once(future::ready(Ok(text)))))
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn generate(&self, prompt: &str) -> Result<TextStream> {
        let request = self.build_request(prompt)?;
        debug!("Sending request: {:?}", request);
        if self.should_stream {
            self.stream_response(request).await
        } else {
            self.fetch_response(request).await
        }
    }
}

/// Creates a new OpenAI API client from configuration.
fn create_client(config: &AnalystConfig) -> Client<OpenAIConfig> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(config.api_key.clone())
        .with_api_base(config.api_base.clone());
    debug!("Client created for {}", config.api_base);
    Client::with_config(openai_config)
}
