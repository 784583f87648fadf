use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;

use super::prompt::build_prompt;
use super::sanitize::sanitize;
use crate::db::TemplateSource;
use crate::error::{AppError, AppResult};
use crate::llm::{GenerateRequest, LlmClient, ProviderKind};
use crate::telemetry::metrics::{REPORT_GENERATION_COUNT, REPORT_GENERATION_DURATION};

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub bytes: Bytes,
    pub name: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub template_id: i32,
    pub prompt: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub file: Option<UploadedFile>,
}

pub struct Generator {
    templates: Arc<dyn TemplateSource>,
    llm: Arc<LlmClient>,
    default_provider: String,
}

impl Generator {
    pub fn new(
        templates: Arc<dyn TemplateSource>,
        llm: Arc<LlmClient>,
        default_provider: impl Into<String>,
    ) -> Self {
        Self {
            templates,
            llm,
            default_provider: default_provider.into().trim().to_string(),
        }
    }

    /// Fills the stored template `request.template_id` with the provider's
    /// analysis of the uploaded file and returns the formatted HTML document.
    #[tracing::instrument(
        name = "pipeline report",
        skip(self, request, cancel),
        fields(
            report.template_id = request.template_id,
            gen_ai.provider.name,
            report.html_bytes,
            report.duration_ms,
        )
    )]
    pub async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        let start = Instant::now();
        let provider = self.selector(request.provider.as_deref()).to_string();
        let provider_label = if provider.is_empty() {
            "none"
        } else {
            ProviderKind::from_selector(&provider).as_str()
        };

        let span = tracing::Span::current();
        span.record("gen_ai.provider.name", provider_label);

        let result = self.run(request, &provider, cancel).await;

        let duration = start.elapsed();
        span.record("report.duration_ms", duration.as_millis() as u64);

        let outcome = match &result {
            Ok(html) => {
                span.record("report.html_bytes", html.len());
                "success"
            }
            Err(err) => err.kind(),
        };
        let attributes = [
            KeyValue::new("gen_ai.provider.name", provider_label),
            KeyValue::new("report.outcome", outcome),
        ];
        REPORT_GENERATION_DURATION.record(duration.as_secs_f64(), &attributes);
        REPORT_GENERATION_COUNT.add(1, &attributes);

        match &result {
            Ok(_) => tracing::info!(
                provider = provider_label,
                duration_ms = duration.as_millis() as u64,
                "Report generated"
            ),
            Err(err) => {
                tracing::warn!(provider = provider_label, error = %err, "Report generation failed")
            }
        }

        result
    }

    /// The request's selector when given, else the configured default. Empty
    /// when neither names a provider.
    fn selector<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.default_provider)
    }

    async fn run(
        &self,
        request: GenerationRequest,
        provider: &str,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        let file = match request.file {
            Some(file) if !file.name.trim().is_empty() && !file.content_type.trim().is_empty() => {
                file
            }
            _ => {
                return Err(AppError::Validation(
                    "file, fileName and fileType are required".to_string(),
                ));
            }
        };

        let template = self
            .templates
            .find_active(request.template_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Report template {} not found", request.template_id))
            })?;

        if provider.is_empty() {
            return Err(AppError::ProviderUnconfigured(
                "no LLM provider selected".to_string(),
            ));
        }

        let prompt = build_prompt(&template.template, request.prompt.as_deref().unwrap_or(""));

        let llm_request = GenerateRequest {
            prompt,
            model: request.model.unwrap_or_default(),
            file: file.bytes,
            file_name: file.name,
            file_type: file.content_type,
        };

        let raw = self.llm.generate(provider, &llm_request, cancel).await?;

        Ok(sanitize(&raw)?)
    }
}
