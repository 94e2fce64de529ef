//! Service summary endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct ServiceSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub job_lists: Vec<String>,
}

/// GET / - the service home document.
pub async fn service_summary(State(state): State<AppState>) -> Json<ServiceSummary> {
    let job_lists = state
        .service
        .job_lists()
        .await
        .iter()
        .map(|list| list.name().to_string())
        .collect();
    Json(ServiceSummary {
        name: state.service.name().to_string(),
        description: state.service.description().map(str::to_string),
        job_lists,
    })
}
