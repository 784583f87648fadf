use std::time::Instant;

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::{GenerateRequest, Provider, ProviderError, ProviderFactory};
use crate::telemetry::metrics::{GEN_AI_ERROR_COUNT, GEN_AI_OPERATION_DURATION};

pub struct LlmClient {
    factory: ProviderFactory,
}

impl LlmClient {
    pub fn new(factory: ProviderFactory) -> Self {
        Self { factory }
    }

    /// Resolves `provider_name` and runs a single instrumented call. No retries.
    pub async fn generate(
        &self,
        provider_name: &str,
        req: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let provider = self.factory.resolve(provider_name);
        self.generate_once(provider.as_ref(), req, cancel).await
    }

    pub async fn generate_once(
        &self,
        provider: &dyn Provider,
        req: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let kind = provider.kind();
        let model = req.model_or(provider.default_model()).to_string();
        let span_display_name = format!("gen_ai.chat {model}");
        let start = Instant::now();

        let span = tracing::info_span!(
            "gen_ai.chat",
            otel.name = %span_display_name,
            gen_ai.operation.name = "chat",
            gen_ai.provider.name = %kind,
            gen_ai.request.model = %model,
            server.address = kind.server_address(),
            server.port = 443,
            file.name = %req.file_name,
            file.mime_type = %req.file_type,
            file.size = req.file.len() as i64,
            gen_ai.response.empty = tracing::field::Empty,
            otel.status_code = tracing::field::Empty,
            error.type = tracing::field::Empty,
        );

        span.add_event(
            "gen_ai.user.message",
            vec![KeyValue::new("gen_ai.prompt", truncate(&req.prompt, 1000))],
        );

        let result = provider.generate(req, cancel).instrument(span.clone()).await;

        let duration = start.elapsed().as_secs_f64();
        let provider_kv = KeyValue::new("gen_ai.provider.name", kind.as_str());
        let model_kv = KeyValue::new("gen_ai.request.model", model.clone());

        match result {
            Ok(text) => {
                span.record("gen_ai.response.empty", text.is_empty());
                if text.is_empty() {
                    tracing::warn!(
                        parent: &span,
                        provider = %kind,
                        model = %model,
                        "Provider returned no completion"
                    );
                }

                span.add_event(
                    "gen_ai.assistant.message",
                    vec![KeyValue::new("gen_ai.completion", truncate(&text, 2000))],
                );

                GEN_AI_OPERATION_DURATION.record(
                    duration,
                    &[
                        KeyValue::new("gen_ai.operation.name", "chat"),
                        provider_kv,
                        model_kv,
                    ],
                );

                Ok(text)
            }
            Err(err) => {
                let error_type = classify_error(&err);
                span.record("otel.status_code", "ERROR");
                span.record("error.type", error_type);

                GEN_AI_ERROR_COUNT.add(
                    1,
                    &[provider_kv, model_kv, KeyValue::new("error.type", error_type)],
                );

                Err(err)
            }
        }
    }
}

fn classify_error(err: &ProviderError) -> &'static str {
    match err {
        ProviderError::Unconfigured(_) => "unconfigured",
        ProviderError::Timeout(_) => "timeout",
        ProviderError::Cancelled => "cancelled",
        ProviderError::Transport(e) if e.is_timeout() => "timeout",
        ProviderError::Transport(e) if e.is_connect() => "network_error",
        other => classify_message(&other.to_string()),
    }
}

fn classify_message(msg: &str) -> &'static str {
    let msg = msg.to_lowercase();
    if msg.contains("rate limit") || msg.contains("429") {
        "rate_limit"
    } else if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline") {
        "timeout"
    } else if msg.contains("401")
        || msg.contains("403")
        || msg.contains("auth")
        || msg.contains("api key")
    {
        "auth_error"
    } else if msg.contains("400") || msg.contains("422") || msg.contains("invalid") {
        "invalid_request"
    } else if msg.contains("500")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("server")
    {
        "server_error"
    } else if msg.contains("connect")
        || msg.contains("dns")
        || msg.contains("network")
        || msg.contains("reset")
    {
        "network_error"
    } else {
        "unknown_error"
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.char_indices()
            .take_while(|&(i, _)| i < max)
            .map(|(_, c)| c)
            .collect()
    }
}
