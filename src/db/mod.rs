pub mod pool;
pub mod templates;

pub use pool::{create_pool, run_migrations};
pub use templates::{PaginatedTemplates, Pagination, ReportTemplate, TemplateRepository, TemplateSource};
