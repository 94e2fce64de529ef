//! Owner permission enforcement on the engine API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use uws_core::kernel::{
    DefaultJobOwner, ExecutionPhase, Job, JobOwnerRef, JobParameters, UwsError,
};

fn owner(id: &str) -> JobOwnerRef {
    Arc::new(DefaultJobOwner::new(id))
}

fn sleeper() -> Arc<SleepTask> {
    Arc::new(SleepTask {
        duration: Duration::from_millis(50),
    })
}

#[tokio::test]
async fn foreign_users_cannot_read_or_destroy_a_job() {
    let list = make_list("private", sleeper(), 0);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let alice = owner("alice");
    let bob = owner("bob");

    let job = Job::new(Some(alice.clone()), JobParameters::new());
    list.add_job(job.clone()).await.unwrap();

    // The owner reads their own job.
    assert!(list.get_job(job.job_id(), Some(&alice)).await.is_ok());

    // A stranger gets 403-shaped errors, and the job is untouched.
    let err = list.get_job(job.job_id(), Some(&bob)).await.unwrap_err();
    assert!(matches!(err, UwsError::PermissionDenied(_)));

    let err = list.destroy_job(job.job_id(), Some(&bob)).await.unwrap_err();
    assert!(matches!(err, UwsError::PermissionDenied(_)));

    assert_eq!(job.phase(), ExecutionPhase::Pending);
    assert_eq!(list.nb_jobs().await, 1);
}

#[tokio::test]
async fn foreign_users_cannot_run_or_update_a_job() {
    let list = make_list("private", sleeper(), 0);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let alice = owner("alice");
    let bob = owner("bob");

    let job = Job::new(Some(alice.clone()), JobParameters::new());
    list.add_job(job.clone()).await.unwrap();

    let err = list
        .control_phase(job.job_id(), Some(&bob), "RUN")
        .await
        .unwrap_err();
    assert!(matches!(err, UwsError::PermissionDenied(_)));

    let err = list
        .update_job_parameters(
            job.job_id(),
            Some(&bob),
            JobParameters::from_pairs([("x", serde_json::json!(1))]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, UwsError::PermissionDenied(_)));

    assert_eq!(job.phase(), ExecutionPhase::Pending);
    assert!(job.parameter("x").is_none());
}

#[tokio::test]
async fn anonymous_jobs_are_open_to_identified_users() {
    let list = make_list("open", sleeper(), 0);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = Job::new(None, JobParameters::new());
    list.add_job(job.clone()).await.unwrap();

    let bob = owner("bob");
    assert!(list.get_job(job.job_id(), Some(&bob)).await.is_ok());
}

#[tokio::test]
async fn an_owner_without_list_write_permission_cannot_create_jobs() {
    let list = make_list("locked", sleeper(), 0);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let denied: JobOwnerRef = Arc::new(DenyAllOwner {
        id: "mallory".to_string(),
    });
    let job = Job::new(Some(denied), JobParameters::new());
    let err = list.add_job(job).await.unwrap_err();
    assert!(matches!(err, UwsError::PermissionDenied(_)));
    assert_eq!(list.nb_jobs().await, 0);
}

#[tokio::test]
async fn owner_indices_track_per_user_jobs() {
    let list = make_list("indexed", sleeper(), 0);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let alice = owner("alice");
    let bob = owner("bob");

    for _ in 0..2 {
        list.add_job(Job::new(Some(alice.clone()), JobParameters::new()))
            .await
            .unwrap();
    }
    list.add_job(Job::new(Some(bob.clone()), JobParameters::new()))
        .await
        .unwrap();
    list.add_job(Job::new(None, JobParameters::new()))
        .await
        .unwrap();

    assert_eq!(list.nb_jobs().await, 4);
    assert_eq!(list.nb_jobs_of("alice").await, 2);
    assert_eq!(list.nb_jobs_of("bob").await, 1);
    let mut users = list.get_users().await;
    users.sort();
    assert_eq!(users, ["alice", "bob"]);

    assert_eq!(list.clear_for("alice").await, 2);
    assert_eq!(list.nb_jobs().await, 2);
    assert_eq!(list.nb_jobs_of("alice").await, 0);
}

#[tokio::test]
async fn run_id_search_is_case_insensitive() {
    let list = make_list("searchable", sleeper(), 0);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = Job::new(
        None,
        JobParameters::from_pairs([("RUNID", serde_json::json!("Nightly-Sweep"))]),
    );
    list.add_job(job.clone()).await.unwrap();
    list.add_job(Job::new(None, JobParameters::new()))
        .await
        .unwrap();

    let hits = list.search_jobs("nightly-sweep").await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].job_id(), job.job_id());
    assert!(list.search_jobs("other").await.is_empty());
}
