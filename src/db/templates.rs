use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReportTemplate {
    pub id: i32,
    pub template: String,
    pub user_mail: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read access the generation pipeline needs from the template store.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// `Ok(None)` when no template has this id, `Err(InactiveTemplate)` when
    /// it exists but is switched off.
    async fn find_active(&self, id: i32) -> AppResult<Option<ReportTemplate>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub page_size: i64,
}

impl Pagination {
    pub fn new(page: Option<i64>, page_size: Option<i64>) -> Self {
        let page = page.filter(|p| *p > 0).unwrap_or(1);
        let page_size = match page_size {
            Some(size) if size > MAX_PAGE_SIZE => MAX_PAGE_SIZE,
            Some(size) if size > 0 => size,
            _ => DEFAULT_PAGE_SIZE,
        };
        Self { page, page_size }
    }

    /// Saturates for page numbers far past the last row; such pages are empty.
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn total_pages(&self, total_count: i64) -> i64 {
        (total_count + self.page_size - 1) / self.page_size
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedTemplates {
    pub templates: Vec<ReportTemplate>,
    pub total_count: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

impl PaginatedTemplates {
    pub fn new(templates: Vec<ReportTemplate>, total_count: i64, pagination: Pagination) -> Self {
        Self {
            templates,
            total_count,
            page: pagination.page,
            page_size: pagination.page_size,
            total_pages: pagination.total_pages(total_count),
        }
    }
}

/// Removes every whitespace character, line breaks included.
pub fn compact_template(template: &str) -> String {
    template.chars().filter(|c| !c.is_whitespace()).collect()
}

pub fn validate_user_mail(mail: &str) -> AppResult<()> {
    let valid = match mail.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !mail.chars().any(char::is_whitespace)
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid user_mail: {mail:?}")))
    }
}

const SELECT_COLUMNS: &str = "SELECT id, template, user_mail, active, created_at, updated_at \
                              FROM report_templates";

#[derive(Clone)]
pub struct TemplateRepository {
    pool: PgPool,
}

impl TemplateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(name = "db.templates.get", skip(self))]
    pub async fn find_by_id(&self, id: i32) -> Result<Option<ReportTemplate>, sqlx::Error> {
        sqlx::query_as::<_, ReportTemplate>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    #[tracing::instrument(name = "db.templates.list", skip(self), fields(db.rows))]
    pub async fn list(&self, pagination: Pagination) -> AppResult<PaginatedTemplates> {
        let templates = sqlx::query_as::<_, ReportTemplate>(&format!(
            "{SELECT_COLUMNS} ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(pagination.page_size)
        .bind(pagination.offset())
        .fetch_all(&self.pool)
        .await?;

        let (total_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM report_templates")
            .fetch_one(&self.pool)
            .await?;

        tracing::Span::current().record("db.rows", templates.len());

        Ok(PaginatedTemplates::new(templates, total_count, pagination))
    }

    /// Templates with `id`, optionally restricted to one owner. Any inactive
    /// match fails the whole lookup.
    #[tracing::instrument(name = "db.templates.filter", skip(self))]
    pub async fn filter(
        &self,
        id: i32,
        user_mail: Option<&str>,
        pagination: Pagination,
    ) -> AppResult<PaginatedTemplates> {
        let (total_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM report_templates \
             WHERE id = $1 AND ($2::text IS NULL OR user_mail = $2)",
        )
        .bind(id)
        .bind(user_mail)
        .fetch_one(&self.pool)
        .await?;

        let templates = sqlx::query_as::<_, ReportTemplate>(&format!(
            "{SELECT_COLUMNS} WHERE id = $1 AND ($2::text IS NULL OR user_mail = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(id)
        .bind(user_mail)
        .bind(pagination.page_size)
        .bind(pagination.offset())
        .fetch_all(&self.pool)
        .await?;

        if let Some(inactive) = templates.iter().find(|t| !t.active) {
            return Err(AppError::InactiveTemplate(inactive.id));
        }

        Ok(PaginatedTemplates::new(templates, total_count, pagination))
    }

    #[tracing::instrument(name = "db.templates.create", skip(self, template))]
    pub async fn create(&self, template: &str, user_mail: &str) -> AppResult<ReportTemplate> {
        validate_user_mail(user_mail)?;
        let template = compact_template(template);
        if template.is_empty() {
            return Err(AppError::Validation("template is required".to_string()));
        }

        let created = sqlx::query_as::<_, ReportTemplate>(
            "INSERT INTO report_templates (template, user_mail, active) \
             VALUES ($1, $2, TRUE) \
             RETURNING id, template, user_mail, active, created_at, updated_at",
        )
        .bind(&template)
        .bind(user_mail)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(template.id = created.id, "Report template created");

        Ok(created)
    }

    #[tracing::instrument(name = "db.templates.update", skip(self, template))]
    pub async fn update(&self, id: i32, template: &str) -> AppResult<ReportTemplate> {
        if id <= 0 {
            return Err(AppError::Validation("id must be greater than 0".to_string()));
        }
        let template = compact_template(template);
        if template.is_empty() {
            return Err(AppError::Validation("template is required".to_string()));
        }

        sqlx::query_as::<_, ReportTemplate>(
            "UPDATE report_templates SET template = $1, updated_at = now() \
             WHERE id = $2 \
             RETURNING id, template, user_mail, active, created_at, updated_at",
        )
        .bind(&template)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Report template {id} not found")))
    }

    #[tracing::instrument(name = "db.templates.set_active", skip(self))]
    pub async fn set_active(&self, id: i32, active: bool) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE report_templates SET active = $1, updated_at = now() WHERE id = $2",
        )
        .bind(active)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Report template {id} not found")));
        }

        tracing::info!(template.id = id, active, "Report template toggled");

        Ok(())
    }
}

#[async_trait]
impl TemplateSource for TemplateRepository {
    async fn find_active(&self, id: i32) -> AppResult<Option<ReportTemplate>> {
        match self.find_by_id(id).await? {
            Some(template) if !template.active => Err(AppError::InactiveTemplate(id)),
            found => Ok(found),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::InMemoryTemplates;
    use super::*;

    #[test]
    fn test_pagination_normalization() {
        assert_eq!(Pagination::new(None, None), Pagination { page: 1, page_size: 10 });
        assert_eq!(Pagination::new(Some(0), Some(0)), Pagination { page: 1, page_size: 10 });
        assert_eq!(Pagination::new(Some(-3), Some(-1)), Pagination { page: 1, page_size: 10 });
        assert_eq!(Pagination::new(Some(4), Some(250)), Pagination { page: 4, page_size: 100 });
        assert_eq!(Pagination::new(Some(2), Some(100)), Pagination { page: 2, page_size: 100 });
        assert_eq!(Pagination::new(Some(3), Some(25)).offset(), 50);
    }

    #[test]
    fn test_offset_saturates_for_huge_pages() {
        let pagination = Pagination::new(Some(i64::MAX), Some(100));
        assert_eq!(pagination.page, i64::MAX);
        assert_eq!(pagination.offset(), i64::MAX);
        assert!(pagination.offset() >= 0);

        let last_exact = Pagination::new(Some(i64::MAX / 100), Some(100));
        assert_eq!(last_exact.offset(), (i64::MAX / 100 - 1) * 100);
        assert_eq!(Pagination::new(Some(i64::MAX / 2), Some(100)).offset(), i64::MAX);
    }

    #[test]
    fn test_total_pages_rounds_up() {
        let pagination = Pagination::new(Some(1), Some(10));
        assert_eq!(pagination.total_pages(0), 0);
        assert_eq!(pagination.total_pages(1), 1);
        assert_eq!(pagination.total_pages(10), 1);
        assert_eq!(pagination.total_pages(11), 2);
        assert_eq!(pagination.total_pages(95), 10);
    }

    #[test]
    fn test_compact_template_strips_all_whitespace() {
        let template = "<div class=\"a\">\n\t<p> {{x}} </p>\r\n</div>  ";
        assert_eq!(compact_template(template), "<divclass=\"a\"><p>{{x}}</p></div>");
        assert_eq!(compact_template(" \n\t "), "");
    }

    #[test]
    fn test_validate_user_mail() {
        assert!(validate_user_mail("ana@empresa.com.br").is_ok());
        assert!(validate_user_mail("a.b+c@x.io").is_ok());

        for bad in ["", "no-at-sign", "@x.io", "a@b", "a@.io", "a@x.", "a@@x.io", "a b@x.io"] {
            assert!(
                matches!(validate_user_mail(bad), Err(AppError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_find_active_distinguishes_missing_and_inactive() {
        let store = InMemoryTemplates::default()
            .with(1, "<p>on</p>", true)
            .with(2, "<p>off</p>", false);

        let found = store.find_active(1).await.unwrap().unwrap();
        assert_eq!(found.template, "<p>on</p>");

        assert!(store.find_active(99).await.unwrap().is_none());
        assert!(matches!(
            store.find_active(2).await,
            Err(AppError::InactiveTemplate(2))
        ));
        assert_eq!(store.lookups(), 3);
    }

    #[test]
    fn test_paginated_templates_shape() {
        let page = PaginatedTemplates::new(Vec::new(), 23, Pagination::new(Some(2), Some(10)));
        let json = serde_json::to_value(&page).unwrap();

        assert_eq!(json["total_count"], 23);
        assert_eq!(json["page"], 2);
        assert_eq!(json["page_size"], 10);
        assert_eq!(json["total_pages"], 3);
        assert!(json["templates"].as_array().unwrap().is_empty());
    }
}
