use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;

use crate::AppState;
use crate::db::{PaginatedTemplates, Pagination, ReportTemplate};
use crate::error::{AppError, AppResult};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterQuery {
    pub id: Option<i32>,
    pub user_mail: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateBody {
    pub template: String,
    pub user_mail: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateBody {
    pub id: i32,
    pub template: String,
}

#[derive(Debug, Deserialize)]
pub struct TurnOnOffBody {
    pub id: i32,
    pub active: bool,
}

pub async fn list_templates(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<PaginatedTemplates>> {
    let pagination = Pagination::new(query.page, query.page_size);
    Ok(Json(state.templates.list(pagination).await?))
}

pub async fn filter_templates(
    State(state): State<AppState>,
    Query(query): Query<FilterQuery>,
) -> AppResult<Json<PaginatedTemplates>> {
    let id = required_id(query.id)?;
    let user_mail = query
        .user_mail
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty());
    let pagination = Pagination::new(query.page, query.page_size);

    let page = state.templates.filter(id, user_mail, pagination).await?;
    if page.templates.is_empty() {
        return Err(AppError::NotFound("report template not found".to_string()));
    }

    Ok(Json(page))
}

pub async fn create_template(
    State(state): State<AppState>,
    Json(body): Json<CreateTemplateBody>,
) -> AppResult<Json<ReportTemplate>> {
    let created = state
        .templates
        .create(&body.template, body.user_mail.trim())
        .await?;
    Ok(Json(created))
}

pub async fn update_template(
    State(state): State<AppState>,
    Json(body): Json<UpdateTemplateBody>,
) -> AppResult<Json<ReportTemplate>> {
    let id = required_id(Some(body.id))?;
    Ok(Json(state.templates.update(id, &body.template).await?))
}

pub async fn turn_on_off(
    State(state): State<AppState>,
    Json(body): Json<TurnOnOffBody>,
) -> AppResult<StatusCode> {
    let id = required_id(Some(body.id))?;
    state.templates.set_active(id, body.active).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn required_id(id: Option<i32>) -> AppResult<i32> {
    match id {
        Some(id) if id > 0 => Ok(id),
        _ => Err(AppError::Validation("id is required".to_string())),
    }
}
