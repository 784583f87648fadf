use std::sync::Arc;

use super::anthropic::AnthropicProvider;
use super::gemini::GeminiProvider;
use super::openai::OpenAIProvider;
use super::{Provider, ProviderError, ProviderKind};
use crate::config::ProvidersConfig;

/// Holds one client per provider family, built once from injected
/// configuration. Resolution never fails; missing credentials only surface
/// when the resolved client is used.
#[derive(Clone)]
pub struct ProviderFactory {
    gemini: Arc<dyn Provider>,
    openai: Arc<dyn Provider>,
    anthropic: Arc<dyn Provider>,
}

impl ProviderFactory {
    pub fn new(config: &ProvidersConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            gemini: Arc::new(GeminiProvider::new(&config.gemini)?),
            openai: Arc::new(OpenAIProvider::new(&config.openai)),
            anthropic: Arc::new(AnthropicProvider::new(&config.anthropic)),
        })
    }

    pub fn from_providers(
        gemini: Arc<dyn Provider>,
        openai: Arc<dyn Provider>,
        anthropic: Arc<dyn Provider>,
    ) -> Self {
        Self {
            gemini,
            openai,
            anthropic,
        }
    }

    pub fn resolve(&self, provider_name: &str) -> Arc<dyn Provider> {
        self.get(ProviderKind::from_selector(provider_name))
    }

    pub fn get(&self, kind: ProviderKind) -> Arc<dyn Provider> {
        match kind {
            ProviderKind::Gemini => Arc::clone(&self.gemini),
            ProviderKind::OpenAi => Arc::clone(&self.openai),
            ProviderKind::Anthropic => Arc::clone(&self.anthropic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;

    fn config() -> ProvidersConfig {
        ProvidersConfig {
            gemini: ProviderSettings {
                api_key: Some("g-key".to_string()),
                model: "gemini-2.5-flash".to_string(),
                base_url: "http://127.0.0.1:9".to_string(),
            },
            openai: ProviderSettings {
                api_key: None,
                model: "gpt-4.1-mini".to_string(),
                base_url: "http://127.0.0.1:9".to_string(),
            },
            anthropic: ProviderSettings {
                api_key: None,
                model: "claude-haiku-4-5-20251001".to_string(),
                base_url: "http://127.0.0.1:9".to_string(),
            },
        }
    }

    #[test]
    fn test_empty_selector_resolves_default_provider() {
        let factory = ProviderFactory::new(&config()).unwrap();
        let provider = factory.resolve("");

        assert_eq!(provider.kind(), ProviderKind::Gemini);
        assert_eq!(provider.default_model(), "gemini-2.5-flash");
    }

    #[test]
    fn test_unknown_selector_resolves_default_provider() {
        let factory = ProviderFactory::new(&config()).unwrap();
        assert_eq!(factory.resolve("llama").kind(), ProviderKind::Gemini);
    }

    #[test]
    fn test_known_selectors() {
        let factory = ProviderFactory::new(&config()).unwrap();

        let openai = factory.resolve("openai");
        assert_eq!(openai.kind(), ProviderKind::OpenAi);
        assert_eq!(openai.default_model(), "gpt-4.1-mini");

        let claude = factory.resolve("claude");
        assert_eq!(claude.kind(), ProviderKind::Anthropic);
        assert_eq!(claude.default_model(), "claude-haiku-4-5-20251001");
        assert_eq!(factory.resolve("anthropic").kind(), ProviderKind::Anthropic);
    }

    #[test]
    fn test_resolution_without_credentials_succeeds() {
        let factory = ProviderFactory::new(&ProvidersConfig::default()).unwrap();
        assert_eq!(factory.resolve("").kind(), ProviderKind::Gemini);
        assert_eq!(factory.resolve("openai").kind(), ProviderKind::OpenAi);
    }
}
