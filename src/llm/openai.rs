use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
    },
};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use tokio_util::sync::CancellationToken;

use super::{
    GenerateRequest, Provider, ProviderError, ProviderKind, cancellable, inline_file_message,
};
use crate::config::ProviderSettings;

pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
    configured: bool,
    model: String,
}

impl OpenAIProvider {
    pub fn new(settings: &ProviderSettings) -> Self {
        let api_key = settings.api_key();
        let config = OpenAIConfig::new()
            .with_api_key(api_key.unwrap_or_default())
            .with_api_base(settings.base_url.trim_end_matches('/'));
        // A zero elapsed-time budget turns off the client's own 429/5xx retries.
        let no_retry = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();
        Self {
            client: Client::with_config(config).with_backoff(no_retry),
            configured: api_key.is_some(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for OpenAIProvider {
    async fn generate(
        &self,
        req: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        if !self.configured {
            return Err(ProviderError::Unconfigured(ProviderKind::OpenAi));
        }

        let messages = vec![ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(inline_file_message(req)),
                name: None,
            },
        )];

        #[allow(deprecated)]
        let request = CreateChatCompletionRequest {
            model: req.model_or(&self.model).to_string(),
            messages,
            ..Default::default()
        };

        let response = cancellable(cancel, async {
            Ok(self.client.chat().create(request).await?)
        })
        .await?;

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}
