use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Response, header::CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tracing::Instrument;

use crate::llm::ProviderError;

/// Processing state of a remote file. Anything the API reports besides
/// `ACTIVE` and `FAILED` is treated as still uploading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    Active,
    Failed,
    #[default]
    #[serde(other)]
    Processing,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub state: FileState,
}

/// The slice of the Gemini API the upload-and-poll lifecycle drives.
#[async_trait::async_trait]
pub trait GeminiApi: Send + Sync {
    async fn upload_file(
        &self,
        display_name: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<RemoteFile, ProviderError>;

    async fn get_file(&self, name: &str, timeout: Duration) -> Result<RemoteFile, ProviderError>;

    async fn delete_file(&self, name: &str, timeout: Duration) -> Result<(), ProviderError>;

    async fn generate_content(
        &self,
        model: &str,
        file: &RemoteFile,
        prompt: &str,
    ) -> Result<String, ProviderError>;
}

pub struct GeminiRestApi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct FileEnvelope {
    file: RemoteFile,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
struct GoogleError {
    error: GoogleErrorDetail,
}

#[derive(Deserialize)]
struct GoogleErrorDetail {
    message: String,
}

impl GeminiRestApi {
    pub fn new(
        base_url: &str,
        api_key: &str,
        connect_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn check(response: Response, action: &str) -> Result<Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<GoogleError>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);

        Err(ProviderError::Api(format!(
            "Gemini {action} failed ({status}): {detail}"
        )))
    }
}

#[async_trait::async_trait]
impl GeminiApi for GeminiRestApi {
    async fn upload_file(
        &self,
        display_name: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<RemoteFile, ProviderError> {
        let start = self
            .http
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", data.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;
        let start = Self::check(start, "upload start").await?;

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Api("Gemini upload start returned no upload URL".into()))?;

        let finish = self
            .http
            .post(upload_url)
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header(CONTENT_TYPE, mime_type)
            .body(data)
            .send()
            .await?;
        let finish = Self::check(finish, "upload").await?;

        Ok(finish.json::<FileEnvelope>().await?.file)
    }

    async fn get_file(&self, name: &str, timeout: Duration) -> Result<RemoteFile, ProviderError> {
        let response = self
            .http
            .get(format!("{}/v1beta/{}", self.base_url, name))
            .header("x-goog-api-key", &self.api_key)
            .timeout(timeout)
            .send()
            .await?;

        Ok(Self::check(response, "file status")
            .await?
            .json::<RemoteFile>()
            .await?)
    }

    async fn delete_file(&self, name: &str, timeout: Duration) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(format!("{}/v1beta/{}", self.base_url, name))
            .header("x-goog-api-key", &self.api_key)
            .timeout(timeout)
            .send()
            .await?;

        Self::check(response, "file delete").await?;
        Ok(())
    }

    async fn generate_content(
        &self,
        model: &str,
        file: &RemoteFile,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let model = model_path_segment(model)?;
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "file_data": { "mime_type": file.mime_type, "file_uri": file.uri } },
                    { "text": prompt }
                ]
            }]
        });

        let response = self
            .http
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let resp: GenerateContentResponse =
            Self::check(response, "generateContent").await?.json().await?;

        Ok(resp
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<String>()
            })
            .unwrap_or_default())
    }
}

/// The model goes into the URL path unescaped, so only plain model ids pass.
/// An optional `models/` prefix is accepted.
fn model_path_segment(model: &str) -> Result<&str, ProviderError> {
    let id = model.strip_prefix("models/").unwrap_or(model);
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));

    if valid {
        Ok(id)
    } else {
        Err(ProviderError::Api(format!("invalid Gemini model name: {model:?}")))
    }
}

/// Handle to an uploaded file. Dropping it schedules a best-effort delete on
/// the current runtime, so every exit path after a successful upload cleans up.
pub struct UploadedFileGuard {
    api: Arc<dyn GeminiApi>,
    name: String,
    delete_timeout: Duration,
}

impl UploadedFileGuard {
    pub fn new(api: Arc<dyn GeminiApi>, name: String, delete_timeout: Duration) -> Self {
        Self {
            api,
            name,
            delete_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for UploadedFileGuard {
    fn drop(&mut self) {
        let api = Arc::clone(&self.api);
        let name = std::mem::take(&mut self.name);
        let timeout = self.delete_timeout;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(gen_ai.file.name = %name, "No runtime available, remote file left behind");
            return;
        };

        runtime.spawn(
            async move {
                match api.delete_file(&name, timeout).await {
                    Ok(()) => tracing::debug!(gen_ai.file.name = %name, "Remote file deleted"),
                    Err(err) => tracing::warn!(
                        gen_ai.file.name = %name,
                        error = %err,
                        "Failed to delete remote file"
                    ),
                }
            }
            .in_current_span(),
        );
    }
}
