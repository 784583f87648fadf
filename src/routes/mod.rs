pub mod generate;
pub mod health;
pub mod reports;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/reports",
            get(reports::list_templates)
                .post(reports::create_template)
                .put(reports::update_template),
        )
        .route("/reports/filter", get(reports::filter_templates))
        .route("/reports/turnonoff", post(reports::turn_on_off))
        .route(
            "/reports/generate",
            post(generate::generate_report)
                .layer(DefaultBodyLimit::max(generate::MAX_BODY_BYTES)),
        );

    Router::new()
        .route("/health", get(health::health))
        .nest("/api/v1", api)
        .with_state(state)
}
