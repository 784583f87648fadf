use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::Html;
use tokio_util::sync::CancellationToken;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::pipeline::{GenerationRequest, UploadedFile};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Request body ceiling: the file plus room for the text fields and multipart framing.
pub const MAX_BODY_BYTES: usize = MAX_UPLOAD_BYTES + 64 * 1024;

/// `POST /api/v1/reports/generate`: multipart `idReport`, `prompt`, `llm`,
/// `model` and `file`. Responds with the report as `text/html`.
pub async fn generate_report(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Html<String>> {
    let request = read_form(multipart).await?;

    // Dropping the handler future (client gone, request timeout) cancels the run.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let html = state.generator.generate(request, &cancel).await?;
    Ok(Html(html))
}

async fn read_form(mut multipart: Multipart) -> AppResult<GenerationRequest> {
    let mut template_id = None;
    let mut request = GenerationRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if request.file.is_some() {
                    return Err(AppError::Validation(
                        "send exactly one field named 'file'".to_string(),
                    ));
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;

                if bytes.len() > MAX_UPLOAD_BYTES {
                    return Err(AppError::PayloadTooLarge(format!(
                        "File is too large: {} > {MAX_UPLOAD_BYTES}",
                        bytes.len()
                    )));
                }

                tracing::info!(
                    file.name = %file_name,
                    file.size = bytes.len(),
                    file.mime_type = %content_type,
                    "Received file"
                );

                request.file = Some(UploadedFile {
                    bytes,
                    name: file_name,
                    content_type,
                });
            }
            "idReport" => {
                let value = field.text().await.map_err(multipart_error)?;
                template_id = value.trim().parse::<i32>().ok().filter(|id| *id > 0);
            }
            "prompt" => request.prompt = Some(field.text().await.map_err(multipart_error)?),
            "llm" => request.provider = Some(field.text().await.map_err(multipart_error)?),
            "model" => request.model = Some(field.text().await.map_err(multipart_error)?),
            _ => {}
        }
    }

    request.template_id =
        template_id.ok_or_else(|| AppError::Validation("Invalid idReport".to_string()))?;

    Ok(request)
}

fn multipart_error(err: MultipartError) -> AppError {
    let message = format!("Could not parse multipart form: {}", err.body_text());
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(message)
    } else {
        AppError::Validation(message)
    }
}
