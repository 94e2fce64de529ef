// Consumed contracts of the engine.
//
// These are INFRASTRUCTURE traits only - no lifecycle logic. The engine
// calls them; bindings and embedding applications implement them. Default
// implementations that need real I/O live in `files` (local file manager)
// and `backup` (JSON backup manager).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::{UwsError, UwsResult};
use super::job::Job;
use super::joblist::JobList;
use super::parameters::JobParameters;

// =============================================================================
// Owners and permissions
// =============================================================================

pub type JobOwnerRef = Arc<dyn JobOwner>;

/// What a permission predicate is being asked about.
pub enum PermissionTarget<'a> {
    List(&'a JobList),
    Job(&'a Job),
}

/// An identified principal able to hold permissions on lists and jobs.
///
/// Owners are referenced by jobs but never owned by them; the same owner
/// value is shared across all of that user's jobs.
pub trait JobOwner: Send + Sync {
    /// Stable unique identifier.
    fn id(&self) -> &str;

    /// Optional human-readable name.
    fn pseudonym(&self) -> Option<&str> {
        None
    }

    fn has_read_permission(&self, target: PermissionTarget<'_>) -> bool;

    fn has_write_permission(&self, target: PermissionTarget<'_>) -> bool;

    fn has_execute_permission(&self, job: &Job) -> bool;
}

/// Default owner: full access to job lists, read/write/execute restricted
/// to the user's own jobs (and unowned ones).
#[derive(Debug, Clone)]
pub struct DefaultJobOwner {
    id: String,
    pseudonym: Option<String>,
}

impl DefaultJobOwner {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pseudonym: None,
        }
    }

    pub fn with_pseudonym(id: impl Into<String>, pseudonym: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pseudonym: Some(pseudonym.into()),
        }
    }

    fn owns(&self, job: &Job) -> bool {
        match job.owner_id() {
            Some(owner_id) => owner_id == self.id,
            None => true,
        }
    }
}

impl JobOwner for DefaultJobOwner {
    fn id(&self) -> &str {
        &self.id
    }

    fn pseudonym(&self) -> Option<&str> {
        self.pseudonym.as_deref()
    }

    fn has_read_permission(&self, target: PermissionTarget<'_>) -> bool {
        match target {
            PermissionTarget::List(_) => true,
            PermissionTarget::Job(job) => self.owns(job),
        }
    }

    fn has_write_permission(&self, target: PermissionTarget<'_>) -> bool {
        match target {
            PermissionTarget::List(_) => true,
            PermissionTarget::Job(job) => self.owns(job),
        }
    }

    fn has_execute_permission(&self, job: &Job) -> bool {
        self.owns(job)
    }
}

// =============================================================================
// Requests and user identification
// =============================================================================

/// A named byte stream uploaded with a request.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub content: Bytes,
}

/// Framework-neutral view of an inbound request, as surfaced by a
/// [`RequestParser`] and consumed by a [`UserIdentifier`].
#[derive(Debug, Clone, Default)]
pub struct UwsRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub parameters: JobParameters,
    pub uploads: Vec<Upload>,
}

impl UwsRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Extracts the requesting user from an inbound request. `None` means
/// anonymous (all permission checks pass).
#[async_trait]
pub trait UserIdentifier: Send + Sync {
    async fn extract_user(&self, request: &UwsRequest) -> UwsResult<Option<JobOwnerRef>>;
}

/// Identifier for deployments without authentication: everyone is
/// anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthIdentifier;

#[async_trait]
impl UserIdentifier for NoAuthIdentifier {
    async fn extract_user(&self, _request: &UwsRequest) -> UwsResult<Option<JobOwnerRef>> {
        Ok(None)
    }
}

/// Identifier that trusts a request header (set by a fronting proxy) to
/// carry the user id.
#[derive(Debug, Clone)]
pub struct HeaderUserIdentifier {
    header: String,
}

impl HeaderUserIdentifier {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
        }
    }
}

impl Default for HeaderUserIdentifier {
    fn default() -> Self {
        Self::new("x-uws-user")
    }
}

#[async_trait]
impl UserIdentifier for HeaderUserIdentifier {
    async fn extract_user(&self, request: &UwsRequest) -> UwsResult<Option<JobOwnerRef>> {
        Ok(request
            .header(&self.header)
            .filter(|id| !id.trim().is_empty())
            .map(|id| Arc::new(DefaultJobOwner::new(id.trim())) as JobOwnerRef))
    }
}

/// Turns a raw request body into parameters and uploads.
#[async_trait]
pub trait RequestParser: Send + Sync {
    async fn parse(
        &self,
        content_type: Option<&str>,
        body: Bytes,
    ) -> UwsResult<(JobParameters, Vec<Upload>)>;
}

/// Parser for `application/x-www-form-urlencoded` bodies (and query
/// strings, which use the same encoding).
#[derive(Debug, Clone, Copy, Default)]
pub struct FormRequestParser;

impl FormRequestParser {
    pub fn parse_pairs(raw: &[u8]) -> JobParameters {
        let mut parameters = JobParameters::new();
        for (name, value) in url::form_urlencoded::parse(raw) {
            parameters.set(&name, Value::String(value.into_owned()));
        }
        parameters
    }
}

#[async_trait]
impl RequestParser for FormRequestParser {
    async fn parse(
        &self,
        content_type: Option<&str>,
        body: Bytes,
    ) -> UwsResult<(JobParameters, Vec<Upload>)> {
        match content_type {
            None => Ok((JobParameters::new(), Vec::new())),
            Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => {
                Ok((Self::parse_pairs(&body), Vec::new()))
            }
            Some(other) => Err(UwsError::BadRequest(format!(
                "unsupported content type '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// File storage
// =============================================================================

/// Storage abstraction for result and error files.
///
/// Implementations decide the on-disk layout (one directory per user,
/// optional grouping); the engine only asks for readers and writers.
#[async_trait]
pub trait FileManager: Send + Sync {
    /// Open a writer for a result file of the given job.
    async fn result_writer(
        &self,
        job: &Job,
        result_id: &str,
    ) -> UwsResult<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Open a reader for a previously written result file.
    async fn result_reader(
        &self,
        job: &Job,
        result_id: &str,
    ) -> UwsResult<Box<dyn AsyncRead + Send + Unpin>>;

    /// Size in bytes of a stored result file.
    async fn result_size(&self, job: &Job, result_id: &str) -> UwsResult<u64>;

    /// Persist the detailed error report of a failed job. Returns an
    /// opaque reference usable with [`FileManager::read_error_details`].
    async fn write_error_details(&self, job: &Job, details: &str) -> UwsResult<String>;

    /// Read back a detailed error report.
    async fn read_error_details(&self, job: &Job, details_ref: &str) -> UwsResult<String>;

    /// Delete every file belonging to the job.
    async fn delete_job_files(&self, job: &Job) -> UwsResult<()>;
}
