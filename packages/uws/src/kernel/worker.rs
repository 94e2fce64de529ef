//! The worker contract and the per-job supervisor.
//!
//! What a job actually does is supplied by the embedding application as
//! a [`JobTask`]. The engine spawns the task when the job enters
//! EXECUTING and supervises it: normal return completes the job,
//! cancellation aborts it, a raised [`TaskError`] records an error
//! summary, and an exceeded execution budget cancels the worker and
//! fails the job with a FATAL summary.
//!
//! Workers MUST observe the cancellation token at well-defined points.
//! One that overstays the grace period is marked leaked; the phase
//! transition completes regardless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::execution::ExecutionManager;
use super::job::{ErrorSummary, ErrorType, Job};
use super::traits::FileManager;

/// The work a job performs.
///
/// The task runs only while its job is EXECUTING. It must periodically
/// check `cancel` and return promptly once the token is triggered;
/// returning `Ok` after observing cancellation counts as a clean stop.
#[async_trait]
pub trait JobTask: Send + Sync {
    async fn run(&self, job: Arc<Job>, cancel: CancellationToken) -> Result<(), TaskError>;
}

/// A worker-side failure, classified for the job's error summary.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub error_type: ErrorType,
    /// Optional detail report, persisted best-effort through the file
    /// manager and referenced from the error summary.
    pub details: Option<String>,
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: ErrorType::Transient,
            details: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: ErrorType::Fatal,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            error_type: ErrorType::Fatal,
            details: Some(format!("{:#}", error)),
        }
    }
}

enum Outcome {
    Finished(Result<Result<(), TaskError>, JoinError>),
    TimedOut,
}

/// Supervise one run of a job's worker. Spawned by [`Job::start`].
pub(crate) async fn supervise(
    job: Arc<Job>,
    task: Arc<dyn JobTask>,
    cancel: CancellationToken,
    budget_sec: i64,
    grace: Duration,
    file_manager: Option<Arc<dyn FileManager>>,
) {
    let mut worker: JoinHandle<Result<(), TaskError>> = tokio::spawn({
        let job = job.clone();
        let cancel = cancel.clone();
        async move { task.run(job, cancel).await }
    });

    let outcome = if budget_sec > 0 {
        tokio::select! {
            result = &mut worker => Outcome::Finished(result),
            _ = tokio::time::sleep(Duration::from_secs(budget_sec as u64)) => Outcome::TimedOut,
        }
    } else {
        Outcome::Finished((&mut worker).await)
    };

    match outcome {
        Outcome::Finished(Ok(Ok(()))) => {
            if cancel.is_cancelled() {
                debug!(job_id = %job.job_id(), "worker stopped after cancellation");
                job.finish_aborted();
            } else {
                job.finish_completed();
            }
        }
        Outcome::Finished(Ok(Err(task_error))) => {
            if cancel.is_cancelled() {
                debug!(
                    job_id = %job.job_id(),
                    error = %task_error,
                    "worker failed after cancellation"
                );
                job.finish_aborted();
            } else {
                let summary = ErrorSummary::new(task_error.message.clone(), task_error.error_type);
                if job.finish_error(summary) {
                    if let Some(details) = &task_error.details {
                        write_details(&job, &file_manager, details).await;
                    }
                }
            }
        }
        Outcome::Finished(Err(join_error)) => {
            warn!(job_id = %job.job_id(), error = %join_error, "worker terminated abnormally");
            let summary = ErrorSummary::new(
                format!("worker terminated abnormally: {}", join_error),
                ErrorType::Fatal,
            );
            job.finish_error(summary);
        }
        Outcome::TimedOut => {
            warn!(
                job_id = %job.job_id(),
                budget_sec,
                "execution duration exceeded; cancelling worker"
            );
            cancel.cancel();
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                job.mark_leaked();
                warn!(
                    job_id = %job.job_id(),
                    "worker did not stop within the grace period; marked as leaked"
                );
            }
            let summary = ErrorSummary::new("execution duration exceeded", ErrorType::Fatal);
            if job.finish_error(summary) {
                let details = format!(
                    "job exceeded its execution duration of {} seconds",
                    budget_sec
                );
                write_details(&job, &file_manager, &details).await;
            }
        }
    }

    // The run is settled; release the job's slot so queued work can
    // advance.
    if let Some(list) = job.job_list() {
        list.execution_manager().remove(&job).await;
    }
}

/// Persist an error detail report, best-effort: a write failure is
/// logged and the job keeps its final phase.
async fn write_details(job: &Arc<Job>, file_manager: &Option<Arc<dyn FileManager>>, details: &str) {
    let Some(file_manager) = file_manager else {
        return;
    };
    match file_manager.write_error_details(job, details).await {
        Ok(details_ref) => job.set_error_details_ref(details_ref),
        Err(error) => {
            warn!(job_id = %job.job_id(), error = %error, "failed to write error details");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_constructors_classify() {
        let transient = TaskError::transient("flaky");
        assert_eq!(transient.error_type, ErrorType::Transient);
        assert!(transient.details.is_none());

        let fatal = TaskError::fatal("broken").with_details("stack trace");
        assert_eq!(fatal.error_type, ErrorType::Fatal);
        assert_eq!(fatal.details.as_deref(), Some("stack trace"));
    }

    #[test]
    fn anyhow_conversion_is_fatal_with_details() {
        let error: TaskError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(error.error_type, ErrorType::Fatal);
        assert_eq!(error.message, "disk on fire");
        assert!(error.details.is_some());
    }
}
