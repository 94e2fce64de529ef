//! End-to-end job lifecycle: start, completion, worker failures, and
//! execution-duration enforcement.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use uws_core::kernel::parameters::PARAM_EXECUTION_DURATION;
use uws_core::kernel::{
    ErrorType, ExecutionPhase, Job, JobParameters, TaskError, UwsError,
};

#[tokio::test]
async fn pending_job_runs_to_completion() {
    let list = make_list(
        "jobs",
        Arc::new(ResultTask {
            duration: Duration::from_millis(50),
        }),
        2,
    );
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = Job::new(None, JobParameters::from_pairs([("x", json!(1))]));
    let observer = RecordingObserver::new();
    job.add_observer(observer.clone());

    list.add_job(job.clone()).await.unwrap();
    assert_eq!(job.phase(), ExecutionPhase::Pending);

    list.control_phase(job.job_id(), None, "RUN").await.unwrap();
    assert!(wait_for_phase(&job, ExecutionPhase::Completed, Duration::from_secs(2)).await);

    let start = job.start_time().expect("start time set on EXECUTING entry");
    let end = job.end_time().expect("end time set on terminal entry");
    assert!(start <= end);

    let results = job.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "out");

    // The worker went QUEUED -> EXECUTING -> COMPLETED, each transition
    // notified exactly once.
    assert_eq!(
        observer.count_of(ExecutionPhase::Queued, ExecutionPhase::Executing),
        1
    );
    assert_eq!(
        observer.count_of(ExecutionPhase::Executing, ExecutionPhase::Completed),
        1
    );
}

#[tokio::test]
async fn executing_is_observable_before_completion() {
    let list = make_list(
        "jobs",
        Arc::new(SleepTask {
            duration: Duration::from_millis(300),
        }),
        2,
    );
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = Job::new(None, JobParameters::new());
    list.add_job(job.clone()).await.unwrap();
    list.control_phase(job.job_id(), None, "RUN").await.unwrap();

    assert!(wait_for_phase(&job, ExecutionPhase::Executing, Duration::from_millis(100)).await);
    assert!(wait_for_phase(&job, ExecutionPhase::Completed, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn failing_worker_records_an_error_summary() {
    let list = make_list(
        "jobs",
        Arc::new(FailTask {
            error: TaskError::transient("upstream unavailable").with_details("trace: connect refused"),
        }),
        0,
    );
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = Job::new(None, JobParameters::new());
    list.add_job(job.clone()).await.unwrap();
    list.control_phase(job.job_id(), None, "RUN").await.unwrap();

    assert!(wait_for_phase(&job, ExecutionPhase::Error, Duration::from_secs(2)).await);
    let summary = job.error_summary().expect("error summary recorded");
    assert_eq!(summary.message, "upstream unavailable");
    assert_eq!(summary.error_type, ErrorType::Transient);
    assert!(job.end_time().is_some());

    // The details file is written best-effort after the transition.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if job
            .error_summary()
            .is_some_and(|summary| summary.details_ref.is_some())
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "details were never persisted"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn exceeded_execution_duration_fails_fatally() {
    let list = make_list(
        "jobs",
        Arc::new(SleepTask {
            duration: Duration::from_secs(30),
        }),
        0,
    );
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = Job::new(
        None,
        JobParameters::from_pairs([(PARAM_EXECUTION_DURATION, json!(1))]),
    );
    list.add_job(job.clone()).await.unwrap();
    assert_eq!(job.execution_duration(), 1);

    list.control_phase(job.job_id(), None, "RUN").await.unwrap();
    assert!(wait_for_phase(&job, ExecutionPhase::Error, Duration::from_secs(4)).await);

    let summary = job.error_summary().expect("timeout summary");
    assert_eq!(summary.error_type, ErrorType::Fatal);
    assert_eq!(summary.message, "execution duration exceeded");
}

#[tokio::test]
async fn finished_jobs_reject_updates_and_restarts() {
    let list = make_list(
        "jobs",
        Arc::new(SleepTask {
            duration: Duration::from_millis(10),
        }),
        0,
    );
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = Job::new(None, JobParameters::new());
    list.add_job(job.clone()).await.unwrap();
    list.control_phase(job.job_id(), None, "RUN").await.unwrap();
    assert!(wait_for_phase(&job, ExecutionPhase::Completed, Duration::from_secs(2)).await);

    let err = job.set_parameter("x", json!(2)).await.unwrap_err();
    assert!(matches!(err, UwsError::BadRequest(_)));

    let err = job.start().unwrap_err();
    assert!(matches!(err, UwsError::BadRequest(_)));

    // Terminal phases admit no force=false exit but ARCHIVED.
    let err = job
        .set_phase(ExecutionPhase::Executing, false)
        .unwrap_err();
    assert!(matches!(err, UwsError::IllegalPhaseTransition { .. }));
    job.set_phase(ExecutionPhase::Archived, false).unwrap();
    assert_eq!(job.phase(), ExecutionPhase::Archived);
}

#[tokio::test]
async fn immediate_start_at_creation() {
    let list = make_list(
        "jobs",
        Arc::new(SleepTask {
            duration: Duration::from_millis(20),
        }),
        2,
    );
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = Job::new(None, JobParameters::from_pairs([("PHASE", json!("RUN"))]));
    list.add_job(job.clone()).await.unwrap();
    assert!(wait_for_phase(&job, ExecutionPhase::Completed, Duration::from_secs(2)).await);
}
