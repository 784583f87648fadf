//! Gemini provider. Files are uploaded to the Files API, polled until the
//! backend reports them ready, referenced from `generateContent`, and deleted
//! afterwards.

pub mod api;

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use self::api::{FileState, GeminiApi, GeminiRestApi, RemoteFile, UploadedFileGuard};
use super::{GenerateRequest, Provider, ProviderError, ProviderKind, cancellable, file_stem};
use crate::config::ProviderSettings;
use crate::telemetry::metrics::GEN_AI_FILE_POLL_ATTEMPTS;

/// Bound on establishing the provider connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub fetch_timeout: Duration,
    pub delete_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 10,
            fetch_timeout: Duration::from_secs(10),
            delete_timeout: Duration::from_secs(10),
        }
    }
}

pub struct GeminiProvider {
    api: Option<Arc<dyn GeminiApi>>,
    model: String,
    policy: PollPolicy,
}

impl GeminiProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api = match settings.api_key() {
            Some(key) => Some(Arc::new(GeminiRestApi::new(
                &settings.base_url,
                key,
                CONNECT_TIMEOUT,
            )?) as Arc<dyn GeminiApi>),
            None => None,
        };

        Ok(Self {
            api,
            model: settings.model.clone(),
            policy: PollPolicy::default(),
        })
    }

    pub fn with_api(api: Arc<dyn GeminiApi>, model: &str, policy: PollPolicy) -> Self {
        Self {
            api: Some(api),
            model: model.to_string(),
            policy,
        }
    }

    /// Polls until the file is `ACTIVE`. Gives up with a timeout once
    /// `max_attempts` status fetches have not reported it ready.
    #[tracing::instrument(
        name = "gen_ai.file.await_ready",
        skip(self, api, file, cancel),
        fields(gen_ai.file.name = %file.name, gen_ai.file.poll_attempts)
    )]
    async fn await_ready(
        &self,
        api: &dyn GeminiApi,
        mut file: RemoteFile,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, ProviderError> {
        let mut attempts = 0;

        let outcome = loop {
            match file.state {
                FileState::Active => break Ok(file),
                FileState::Failed => {
                    break Err(ProviderError::Api(format!(
                        "Gemini could not process file {}",
                        file.name
                    )));
                }
                FileState::Processing if attempts >= self.policy.max_attempts => {
                    break Err(ProviderError::Timeout(format!(
                        "file {} was not ready after {} status checks",
                        file.name, attempts
                    )));
                }
                FileState::Processing => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(self.policy.interval) => {}
            }

            attempts += 1;
            tracing::debug!(attempt = attempts, "Checking remote file state");
            file = match cancellable(cancel, api.get_file(&file.name, self.policy.fetch_timeout)).await {
                Ok(next) => next,
                Err(err) => break Err(err),
            };
        };

        tracing::Span::current().record("gen_ai.file.poll_attempts", attempts);
        GEN_AI_FILE_POLL_ATTEMPTS.record(
            u64::from(attempts),
            &[KeyValue::new("outcome", if outcome.is_ok() { "ready" } else { "failed" })],
        );

        outcome
    }
}

#[async_trait::async_trait]
impl Provider for GeminiProvider {
    async fn generate(
        &self,
        req: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let api = self
            .api
            .clone()
            .ok_or(ProviderError::Unconfigured(ProviderKind::Gemini))?;

        // The upload runs detached and owns the guard, so a file that lands
        // after cancellation (or after this future is dropped) is still deleted.
        let upload = tokio::spawn(
            {
                let api = Arc::clone(&api);
                let display_name = file_stem(&req.file_name).to_string();
                let mime_type = req.file_type.clone();
                let data = req.file.clone();
                let delete_timeout = self.policy.delete_timeout;
                async move {
                    let uploaded = api.upload_file(&display_name, &mime_type, data).await?;
                    let guard = UploadedFileGuard::new(api, uploaded.name.clone(), delete_timeout);
                    Ok::<_, ProviderError>((uploaded, guard))
                }
            }
            .in_current_span(),
        );

        let (uploaded, guard) = cancellable(cancel, async {
            upload
                .await
                .map_err(|err| ProviderError::Api(format!("Gemini upload task failed: {err}")))?
        })
        .await?;
        tracing::debug!(gen_ai.file.name = %guard.name(), "File uploaded");

        let ready = self.await_ready(api.as_ref(), uploaded, cancel).await?;

        let text = cancellable(
            cancel,
            api.generate_content(req.model_or(&self.model), &ready, &req.prompt),
        )
        .await?;

        drop(guard);
        Ok(text)
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;

    /// In-memory Files API. Each status fetch pops the next scripted state;
    /// once the script runs out the last state repeats.
    pub struct FakeGeminiApi {
        pub upload_state: FileState,
        pub states: Mutex<VecDeque<FileState>>,
        pub reply: Result<String, String>,
        pub uploads: Mutex<Vec<(String, String, Bytes)>>,
        pub status_fetches: AtomicUsize,
        pub generated_with: Mutex<Vec<(String, String)>>,
        pub deleted: Mutex<Vec<String>>,
        pub upload_delay: Duration,
    }

    impl FakeGeminiApi {
        pub fn new(upload_state: FileState, states: &[FileState], reply: &str) -> Self {
            Self {
                upload_state,
                states: Mutex::new(states.iter().copied().collect()),
                reply: Ok(reply.to_string()),
                uploads: Mutex::new(Vec::new()),
                status_fetches: AtomicUsize::new(0),
                generated_with: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                upload_delay: Duration::ZERO,
            }
        }

        pub fn fetches(&self) -> usize {
            self.status_fetches.load(Ordering::SeqCst)
        }

        pub fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }

        fn file(&self, state: FileState) -> RemoteFile {
            RemoteFile {
                name: "files/fake-1".to_string(),
                display_name: String::new(),
                mime_type: "text/csv".to_string(),
                uri: "https://example.test/files/fake-1".to_string(),
                state,
            }
        }
    }

    #[async_trait::async_trait]
    impl GeminiApi for FakeGeminiApi {
        async fn upload_file(
            &self,
            display_name: &str,
            mime_type: &str,
            data: Bytes,
        ) -> Result<RemoteFile, ProviderError> {
            if !self.upload_delay.is_zero() {
                tokio::time::sleep(self.upload_delay).await;
            }
            self.uploads.lock().unwrap().push((
                display_name.to_string(),
                mime_type.to_string(),
                data,
            ));
            Ok(self.file(self.upload_state))
        }

        async fn get_file(
            &self,
            _name: &str,
            _timeout: Duration,
        ) -> Result<RemoteFile, ProviderError> {
            self.status_fetches.fetch_add(1, Ordering::SeqCst);
            let mut states = self.states.lock().unwrap();
            let state = if states.len() > 1 {
                states.pop_front()
            } else {
                states.front().copied()
            };
            Ok(self.file(state.unwrap_or(FileState::Processing)))
        }

        async fn delete_file(&self, name: &str, _timeout: Duration) -> Result<(), ProviderError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn generate_content(
            &self,
            model: &str,
            file: &RemoteFile,
            prompt: &str,
        ) -> Result<String, ProviderError> {
            self.generated_with
                .lock()
                .unwrap()
                .push((model.to_string(), format!("{}|{}", file.uri, prompt)));
            self.reply.clone().map_err(ProviderError::Api)
        }
    }

    /// Lets spawned cleanup tasks run before asserting on them.
    pub async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeGeminiApi, settle};
    use super::*;
    use bytes::Bytes;

    fn request(model: &str) -> GenerateRequest {
        GenerateRequest {
            prompt: "Analyze".to_string(),
            model: model.to_string(),
            file: Bytes::from_static(b"a,b\n1,2"),
            file_name: "data.csv".to_string(),
            file_type: "text/csv".to_string(),
        }
    }

    fn provider(api: &Arc<FakeGeminiApi>) -> GeminiProvider {
        GeminiProvider::with_api(api.clone(), "gemini-2.5-flash", PollPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_poll() {
        use FileState::*;
        let api = Arc::new(FakeGeminiApi::new(
            Processing,
            &[Processing, Processing, Active],
            "<p>ok</p>",
        ));

        let started = tokio::time::Instant::now();
        let text = provider(&api)
            .generate(&request(""), &CancellationToken::new())
            .await
            .unwrap();
        settle().await;

        assert_eq!(text, "<p>ok</p>");
        assert_eq!(api.fetches(), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(api.deleted(), vec!["files/fake-1".to_string()]);

        let uploads = api.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "data");
        assert_eq!(uploads[0].1, "text/csv");
        assert_eq!(uploads[0].2, Bytes::from_static(b"a,b\n1,2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_active_skips_polling() {
        let api = Arc::new(FakeGeminiApi::new(FileState::Active, &[], "done"));

        let text = provider(&api)
            .generate(&request(""), &CancellationToken::new())
            .await
            .unwrap();
        settle().await;

        assert_eq!(text, "done");
        assert_eq!(api.fetches(), 0);
        assert_eq!(api.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_polling_times_out() {
        let api = Arc::new(FakeGeminiApi::new(
            FileState::Processing,
            &[FileState::Processing],
            "never",
        ));

        let err = provider(&api)
            .generate(&request(""), &CancellationToken::new())
            .await
            .unwrap_err();
        settle().await;

        assert!(matches!(err, ProviderError::Timeout(_)), "{err:?}");
        assert_eq!(api.fetches(), 10);
        assert!(api.generated_with.lock().unwrap().is_empty());
        assert_eq!(api.deleted(), vec!["files/fake-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_file_fails_fast() {
        let api = Arc::new(FakeGeminiApi::new(
            FileState::Processing,
            &[FileState::Failed],
            "never",
        ));

        let err = provider(&api)
            .generate(&request(""), &CancellationToken::new())
            .await
            .unwrap_err();
        settle().await;

        assert!(matches!(err, ProviderError::Api(_)), "{err:?}");
        assert_eq!(api.fetches(), 1);
        assert_eq!(api.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_failure_still_deletes() {
        let mut fake = FakeGeminiApi::new(FileState::Active, &[], "");
        fake.reply = Err("Gemini generateContent failed (500): boom".to_string());
        let api = Arc::new(fake);

        let err = provider(&api)
            .generate(&request(""), &CancellationToken::new())
            .await
            .unwrap_err();
        settle().await;

        assert!(err.to_string().contains("boom"));
        assert_eq!(api.deleted(), vec!["files/fake-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_polling() {
        let api = Arc::new(FakeGeminiApi::new(
            FileState::Processing,
            &[FileState::Processing],
            "never",
        ));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let err = provider(&api)
            .generate(&request(""), &cancel)
            .await
            .unwrap_err();
        settle().await;

        assert!(matches!(err, ProviderError::Cancelled), "{err:?}");
        assert_eq!(api.fetches(), 2);
        assert_eq!(api.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_upload_still_deletes() {
        let mut fake = FakeGeminiApi::new(FileState::Active, &[], "never");
        fake.upload_delay = Duration::from_secs(2);
        let api = Arc::new(fake);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = provider(&api)
            .generate(&request(""), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled), "{err:?}");
        assert!(api.deleted().is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(api.uploads.lock().unwrap().len(), 1);
        assert!(api.generated_with.lock().unwrap().is_empty());
        assert_eq!(api.deleted(), vec!["files/fake-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_during_upload_still_deletes() {
        let mut fake = FakeGeminiApi::new(FileState::Active, &[], "never");
        fake.upload_delay = Duration::from_secs(2);
        let api = Arc::new(fake);
        let provider = provider(&api);

        let outcome = tokio::time::timeout(
            Duration::from_millis(500),
            provider.generate(&request(""), &CancellationToken::new()),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(api.deleted(), vec!["files/fake-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_override_reaches_generate_content() {
        let api = Arc::new(FakeGeminiApi::new(FileState::Active, &[], "ok"));

        provider(&api)
            .generate(&request("gemini-2.5-pro"), &CancellationToken::new())
            .await
            .unwrap();

        let calls = api.generated_with.lock().unwrap();
        assert_eq!(calls[0].0, "gemini-2.5-pro");
        assert_eq!(calls[0].1, "https://example.test/files/fake-1|Analyze");
    }

    #[tokio::test]
    async fn test_missing_key_is_unconfigured() {
        let provider = GeminiProvider::new(&ProviderSettings {
            api_key: None,
            model: "gemini-2.5-flash".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
        })
        .unwrap();

        let err = provider
            .generate(&request(""), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Unconfigured(ProviderKind::Gemini)));
    }
}
