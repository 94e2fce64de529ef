//! Job resource handlers.
//!
//! POST side effects answer `303 See Other` pointing at the changed
//! resource; parameter-coercion warnings ride in the response body.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;

use crate::kernel::{
    FileManager, FormRequestParser, Job, JobDescription, JobOwnerRef, JobParameters, JobResult,
    PermissionTarget, RequestParser, UserIdentifier, UwsError, UwsRequest,
};
use crate::kernel::parameters::{PARAM_DESTRUCTION, PARAM_EXECUTION_DURATION, PARAM_PHASE};
use crate::server::app::AppState;
use crate::server::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

/// Resolve the requesting user through the service's identifier.
async fn identify(
    state: &AppState,
    headers: &HeaderMap,
    parameters: &JobParameters,
) -> ApiResult<Option<JobOwnerRef>> {
    let mut request = UwsRequest::default();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            request
                .headers
                .insert(name.as_str().to_ascii_lowercase(), text.to_string());
        }
    }
    request.parameters = parameters.clone();
    Ok(state
        .service
        .user_identifier()
        .extract_user(&request)
        .await?)
}

async fn parse_form(headers: &HeaderMap, body: Bytes) -> ApiResult<JobParameters> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let (parameters, _uploads) = FormRequestParser.parse(content_type, body).await?;
    Ok(parameters)
}

fn see_other(location: String, body: String) -> Response {
    (
        StatusCode::SEE_OTHER,
        [(header::LOCATION, location)],
        body,
    )
        .into_response()
}

fn job_url(list: &str, job: &str) -> String {
    format!("/{}/{}", list, job)
}

// =============================================================================
// Job list
// =============================================================================

#[derive(Serialize)]
pub struct JobRef {
    pub job_id: String,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub creation_time: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct JobListView {
    pub name: String,
    pub jobs: Vec<JobRef>,
}

impl JobRef {
    fn of(job: &Job) -> Self {
        Self {
            job_id: job.job_id().to_string(),
            phase: job.phase().to_string(),
            run_id: job.run_id(),
            owner_id: job.owner_id().map(str::to_string),
            creation_time: job.creation_time(),
        }
    }
}

/// GET /{list} - enumerate jobs, filtered by the caller's read
/// permission.
pub async fn enumerate_jobs(
    State(state): State<AppState>,
    Path(list_name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<JobListView>> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;

    let jobs = list
        .get_jobs()
        .await
        .into_iter()
        .filter(|job| match &user {
            Some(user) => user.has_read_permission(PermissionTarget::Job(job)),
            None => true,
        })
        .map(|job| JobRef::of(&job))
        .collect();

    Ok(Json(JobListView {
        name: list_name,
        jobs,
    }))
}

/// POST /{list} - create a job from the form parameters.
pub async fn create_job(
    State(state): State<AppState>,
    Path(list_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let parameters = parse_form(&headers, body).await?;
    let user = identify(&state, &headers, &parameters).await?;
    let list = state.service.job_list(&list_name).await?;

    let job = Job::new(user, parameters);
    let job_id = job.job_id().to_string();
    let warnings = list.add_job(job).await?;

    Ok(see_other(job_url(&list_name, &job_id), warnings.join("\n")))
}

// =============================================================================
// One job
// =============================================================================

/// GET /{list}/{id} - full job description.
pub async fn job_summary(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<JobDescription>> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    let job = list.get_job(&job_id, user.as_ref()).await?;
    Ok(Json(job.description()))
}

/// POST /{list}/{id} - parameter updates and control actions
/// (`PHASE=RUN|ABORT`, `ACTION=DELETE`).
pub async fn update_job(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let parameters = parse_form(&headers, body).await?;
    let user = identify(&state, &headers, &parameters).await?;
    let list = state.service.job_list(&list_name).await?;

    let warnings = list
        .update_job_parameters(&job_id, user.as_ref(), parameters)
        .await?;
    Ok(see_other(job_url(&list_name, &job_id), warnings.join("\n")))
}

/// DELETE /{list}/{id} - destroy per the list's policy.
pub async fn destroy_job(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    list.destroy_job(&job_id, user.as_ref()).await?;
    Ok(see_other(format!("/{}", list_name), String::new()))
}

// =============================================================================
// Phase
// =============================================================================

/// GET /{list}/{id}/phase - the phase as text.
pub async fn read_phase(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<String> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    let job = list.get_job(&job_id, user.as_ref()).await?;
    Ok(job.phase().to_string())
}

/// POST /{list}/{id}/phase - PHASE=RUN|ABORT|ARCHIVE|SUSPEND|HELD.
pub async fn write_phase(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let parameters = parse_form(&headers, body).await?;
    let user = identify(&state, &headers, &parameters).await?;
    let action = parameters
        .get_str(PARAM_PHASE)
        .ok_or_else(|| UwsError::BadRequest("missing PHASE parameter".into()))?
        .to_string();

    let list = state.service.job_list(&list_name).await?;
    list.control_phase(&job_id, user.as_ref(), &action).await?;
    Ok(see_other(job_url(&list_name, &job_id), String::new()))
}

// =============================================================================
// Execution duration and destruction time
// =============================================================================

/// GET /{list}/{id}/executionduration - seconds as text (0 = no limit).
pub async fn read_execution_duration(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<String> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    let job = list.get_job(&job_id, user.as_ref()).await?;
    Ok(job.execution_duration().to_string())
}

/// POST /{list}/{id}/executionduration - EXECUTIONDURATION=<seconds>.
pub async fn write_execution_duration(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    write_single_parameter(state, list_name, job_id, headers, body, PARAM_EXECUTION_DURATION)
        .await
}

/// GET /{list}/{id}/destruction - the destruction instant as text.
pub async fn read_destruction(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<String> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    let job = list.get_job(&job_id, user.as_ref()).await?;
    Ok(job
        .destruction_time()
        .map(|instant| instant.to_rfc3339())
        .unwrap_or_default())
}

/// POST /{list}/{id}/destruction - DESTRUCTION=<ISO-8601 instant>.
pub async fn write_destruction(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    write_single_parameter(state, list_name, job_id, headers, body, PARAM_DESTRUCTION).await
}

async fn write_single_parameter(
    state: AppState,
    list_name: String,
    job_id: String,
    headers: HeaderMap,
    body: Bytes,
    parameter: &str,
) -> ApiResult<Response> {
    let form = parse_form(&headers, body).await?;
    let user = identify(&state, &headers, &form).await?;
    let value: Value = form
        .get(parameter)
        .cloned()
        .ok_or_else(|| UwsError::BadRequest(format!("missing {} parameter", parameter)))?;

    let mut update = JobParameters::new();
    update.set(parameter, value);

    let list = state.service.job_list(&list_name).await?;
    let warnings = list
        .update_job_parameters(&job_id, user.as_ref(), update)
        .await?;
    Ok(see_other(job_url(&list_name, &job_id), warnings.join("\n")))
}

// =============================================================================
// Results, error, owner, job info
// =============================================================================

/// GET /{list}/{id}/results - the ordered result list.
pub async fn read_results(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<JobResult>>> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    let job = list.get_job(&job_id, user.as_ref()).await?;
    Ok(Json(job.results()))
}

/// GET /{list}/{id}/results/{rid} - stream the result file, or redirect
/// when the result lives elsewhere.
pub async fn read_result(
    State(state): State<AppState>,
    Path((list_name, job_id, result_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    let job = list.get_job(&job_id, user.as_ref()).await?;

    let result = job.result(&result_id).ok_or_else(|| UwsError::ResultNotFound {
        job: job_id.clone(),
        result: result_id.clone(),
    })?;

    // A destroyed or archived job has released its result resources.
    if job.resources_cleared() {
        return Err(UwsError::ResultNotFound {
            job: job_id,
            result: result_id,
        }
        .into());
    }

    if result.redirection_required {
        if let Some(href) = &result.href {
            return Ok(see_other(href.clone(), String::new()));
        }
    }

    let reader = state
        .service
        .file_manager()
        .result_reader(&job, &result_id)
        .await?;
    let mime_type = result
        .mime_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime_type)],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

/// GET /{list}/{id}/error - the error summary.
pub async fn read_error(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    let job = list.get_job(&job_id, user.as_ref()).await?;

    match job.error_summary() {
        Some(summary) => Ok(Json(summary).into_response()),
        None => Ok((StatusCode::NOT_FOUND, "no error summary").into_response()),
    }
}

/// GET /{list}/{id}/owner - the owner id as text.
pub async fn read_owner(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<String> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    let job = list.get_job(&job_id, user.as_ref()).await?;
    Ok(job.owner_id().unwrap_or("anonymous").to_string())
}

/// GET /{list}/{id}/jobInfo - the optional opaque descriptor.
pub async fn read_job_info(
    State(state): State<AppState>,
    Path((list_name, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = identify(&state, &headers, &JobParameters::new()).await?;
    let list = state.service.job_list(&list_name).await?;
    let job = list.get_job(&job_id, user.as_ref()).await?;

    match job.job_info() {
        Some(info) => {
            let mut content = Vec::new();
            info.write_full_content(&mut content)
                .map_err(|error| UwsError::Internal(error.into()))?;
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/xml".to_string())],
                content,
            )
                .into_response())
        }
        None => Ok((StatusCode::NOT_FOUND, "no job info").into_response()),
    }
}
