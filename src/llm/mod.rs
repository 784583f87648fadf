pub mod anthropic;
pub mod client;
pub mod factory;
pub mod gemini;
pub mod openai;

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use client::LlmClient;
pub use factory::ProviderFactory;

/// One analysis request as seen by a provider: the rendered prompt plus the uploaded file.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Overrides the provider's configured model when non-empty.
    pub model: String,
    pub file: Bytes,
    pub file_name: String,
    pub file_type: String,
}

impl GenerateRequest {
    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        let model = self.model.trim();
        if model.is_empty() { default } else { model }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProviderKind {
    #[default]
    Gemini,
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    /// Unknown and empty selectors fall back to the default provider.
    pub fn from_selector(selector: &str) -> Self {
        match selector.trim().to_ascii_lowercase().as_str() {
            "openai" => ProviderKind::OpenAi,
            "anthropic" | "claude" => ProviderKind::Anthropic,
            _ => ProviderKind::Gemini,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    pub fn server_address(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "generativelanguage.googleapis.com",
            ProviderKind::OpenAi => "api.openai.com",
            ProviderKind::Anthropic => "api.anthropic.com",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{0} API key is not set")]
    Unconfigured(ProviderKind),

    #[error("{0}")]
    Api(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("OpenAI request failed: {0}")]
    OpenAi(#[from] async_openai::error::OpenAIError),

    #[error("{0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Returns the primary text completion. An empty string means the provider
    /// answered without any candidate.
    async fn generate(
        &self,
        req: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;

    fn kind(&self) -> ProviderKind;

    fn default_model(&self) -> &str;
}

/// Races `fut` against `cancel`; cancellation wins ties.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        result = fut => result,
    }
}

/// File name without its final extension. Dotfiles keep their name.
pub(crate) fn file_stem(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 && !file_name[idx..].contains('/') => &file_name[..idx],
        _ => file_name,
    }
}

/// User message for providers that take the file inline as text.
pub(crate) fn inline_file_message(req: &GenerateRequest) -> String {
    format!(
        "{}\n\n---\nFile name: {}\nFile content:\n{}",
        req.prompt,
        file_stem(&req.file_name),
        String::from_utf8_lossy(&req.file)
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Provider double that returns a canned answer and records what it saw.
    pub struct StubProvider {
        pub kind: ProviderKind,
        pub reply: Result<String, String>,
        pub calls: AtomicUsize,
        pub last_request: Mutex<Option<GenerateRequest>>,
    }

    impl StubProvider {
        pub fn replying(kind: ProviderKind, reply: &str) -> Self {
            Self {
                kind,
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        pub fn failing(kind: ProviderKind, message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
                ..Self::replying(kind, "")
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Provider for StubProvider {
        async fn generate(
            &self,
            req: &GenerateRequest,
            _cancel: &CancellationToken,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(req.clone());
            self.reply.clone().map_err(ProviderError::Api)
        }

        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn default_model(&self) -> &str {
            "stub-model"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str) -> GenerateRequest {
        GenerateRequest {
            prompt: "Analyze".to_string(),
            model: model.to_string(),
            file: Bytes::from_static(b"a,b\n1,2"),
            file_name: "data.csv".to_string(),
            file_type: "text/csv".to_string(),
        }
    }

    #[test]
    fn test_selector_parsing() {
        let cases = vec![
            ("", ProviderKind::Gemini),
            ("gemini", ProviderKind::Gemini),
            ("openai", ProviderKind::OpenAi),
            ("OpenAI", ProviderKind::OpenAi),
            ("anthropic", ProviderKind::Anthropic),
            ("claude", ProviderKind::Anthropic),
            (" Claude ", ProviderKind::Anthropic),
            ("mistral", ProviderKind::Gemini),
        ];

        for (selector, expected) in cases {
            assert_eq!(
                ProviderKind::from_selector(selector),
                expected,
                "from_selector({selector:?})"
            );
        }
    }

    #[test]
    fn test_model_override_wins() {
        assert_eq!(request("gpt-override").model_or("default"), "gpt-override");
        assert_eq!(request("").model_or("default"), "default");
        assert_eq!(request("   ").model_or("default"), "default");
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("data.csv"), "data");
        assert_eq!(file_stem("archive.tar.gz"), "archive.tar");
        assert_eq!(file_stem("README"), "README");
        assert_eq!(file_stem(".env"), ".env");
        assert_eq!(file_stem("dir.v1/notes"), "dir.v1/notes");
    }

    #[test]
    fn test_inline_file_message() {
        let message = inline_file_message(&request(""));
        assert_eq!(message, "Analyze\n\n---\nFile name: data\nFile content:\na,b\n1,2");
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = cancellable(&token, async { Ok::<_, ProviderError>(1) }).await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let token = CancellationToken::new();
        let result = cancellable(&token, async { Ok::<_, ProviderError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
