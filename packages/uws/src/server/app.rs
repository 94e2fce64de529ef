//! Application setup: the UWS router.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::kernel::UwsService;
use crate::server::routes;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<UwsService>,
}

/// Build the router for the UWS URL surface:
///
/// ```text
/// GET    /                                service summary
/// GET    /{list}                          job list enumeration
/// POST   /{list}                          create job (303 to the job)
/// GET    /{list}/{id}                     job summary
/// POST   /{list}/{id}                     parameter update / control action
/// DELETE /{list}/{id}                     destroy per policy
/// GET    /{list}/{id}/phase               current phase as text
/// POST   /{list}/{id}/phase               PHASE=RUN|ABORT|ARCHIVE|SUSPEND|HELD
/// GET    /{list}/{id}/executionduration   seconds as text
/// POST   /{list}/{id}/executionduration   EXECUTIONDURATION=<seconds>
/// GET    /{list}/{id}/destruction         ISO-8601 instant as text
/// POST   /{list}/{id}/destruction         DESTRUCTION=<ISO-8601>
/// GET    /{list}/{id}/results             result list
/// GET    /{list}/{id}/results/{rid}       stream or 303 redirect
/// GET    /{list}/{id}/error               error summary
/// GET    /{list}/{id}/owner               owner id as text
/// GET    /{list}/{id}/jobInfo             optional job info
/// ```
pub fn build_app(service: Arc<UwsService>) -> Router {
    Router::new()
        .route("/", get(routes::service_summary))
        .route(
            "/:list",
            get(routes::enumerate_jobs).post(routes::create_job),
        )
        .route(
            "/:list/:job",
            get(routes::job_summary)
                .post(routes::update_job)
                .delete(routes::destroy_job),
        )
        .route(
            "/:list/:job/phase",
            get(routes::read_phase).post(routes::write_phase),
        )
        .route(
            "/:list/:job/executionduration",
            get(routes::read_execution_duration).post(routes::write_execution_duration),
        )
        .route(
            "/:list/:job/destruction",
            get(routes::read_destruction).post(routes::write_destruction),
        )
        .route("/:list/:job/results", get(routes::read_results))
        .route("/:list/:job/results/:result", get(routes::read_result))
        .route("/:list/:job/error", get(routes::read_error))
        .route("/:list/:job/owner", get(routes::read_owner))
        .route("/:list/:job/jobInfo", get(routes::read_job_info))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}
