//! Execution manager invariants: the parallelism bound, FIFO start
//! order, bound changes, and stop/restart semantics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use uws_core::kernel::{
    ExecutionManager, ExecutionPhase, Job, JobList, JobListSpec, JobParameters, JobTask,
    QueuedExecutionManager,
};

fn sleeper(ms: u64) -> Arc<dyn JobTask> {
    Arc::new(SleepTask {
        duration: Duration::from_millis(ms),
    })
}

async fn submit(list: &Arc<JobList>) -> Arc<Job> {
    let job = Job::new(None, JobParameters::new());
    list.add_job(job.clone()).await.unwrap();
    list.control_phase(job.job_id(), None, "RUN").await.unwrap();
    job
}

#[tokio::test]
async fn queue_bound_holds_one_running_two_queued() {
    let list = make_list("queue", sleeper(400), 1);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let j1 = submit(&list).await;
    let j2 = submit(&list).await;
    let j3 = submit(&list).await;

    assert!(wait_for_phase(&j1, ExecutionPhase::Executing, Duration::from_millis(200)).await);
    assert_eq!(j2.phase(), ExecutionPhase::Queued);
    assert_eq!(j3.phase(), ExecutionPhase::Queued);
    assert_eq!(list.execution_manager().running_jobs().await.len(), 1);
    assert_eq!(list.execution_manager().queued_jobs().await.len(), 2);

    // After j1 completes, j2 runs and j3 still waits.
    assert!(wait_for_phase(&j1, ExecutionPhase::Completed, Duration::from_secs(2)).await);
    assert!(wait_for_phase(&j2, ExecutionPhase::Executing, Duration::from_secs(2)).await);
    assert_eq!(j3.phase(), ExecutionPhase::Queued);

    assert!(wait_for_phase(&j3, ExecutionPhase::Completed, Duration::from_secs(3)).await);
}

#[tokio::test]
async fn queued_jobs_start_in_arrival_order() {
    let list = make_list("fifo", sleeper(100), 1);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let jobs = vec![
        submit(&list).await,
        submit(&list).await,
        submit(&list).await,
        submit(&list).await,
    ];

    for job in &jobs {
        assert!(
            wait_for_phase(job, ExecutionPhase::Completed, Duration::from_secs(5)).await,
            "job {} did not finish",
            job.job_id()
        );
    }

    let starts: Vec<_> = jobs
        .iter()
        .map(|job| job.start_time().expect("started"))
        .collect();
    for pair in starts.windows(2) {
        assert!(pair[0] <= pair[1], "FIFO start order violated");
    }
}

#[tokio::test]
async fn running_bound_is_never_exceeded() {
    let list = make_list("bounded", sleeper(150), 2);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let jobs: Vec<Arc<Job>> = {
        let mut jobs = Vec::new();
        for _ in 0..6 {
            jobs.push(submit(&list).await);
        }
        jobs
    };

    let manager = list.execution_manager();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        assert!(manager.running_jobs().await.len() <= 2, "bound exceeded");
        if jobs
            .iter()
            .all(|job| job.phase() == ExecutionPhase::Completed)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("jobs did not all complete in time");
}

#[tokio::test]
async fn raising_the_bound_starts_queued_jobs() {
    let manager = Arc::new(QueuedExecutionManager::new(1));
    let list = JobList::create(
        JobListSpec::builder()
            .name("resizable")
            .task(sleeper(400))
            .execution_manager(manager.clone() as Arc<dyn ExecutionManager>)
            .build(),
    )
    .unwrap();
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let j1 = submit(&list).await;
    let j2 = submit(&list).await;
    assert!(wait_for_phase(&j1, ExecutionPhase::Executing, Duration::from_millis(200)).await);
    assert_eq!(j2.phase(), ExecutionPhase::Queued);

    manager.set_max_running(2).await;
    assert!(wait_for_phase(&j2, ExecutionPhase::Executing, Duration::from_millis(200)).await);
    assert_eq!(manager.running_jobs().await.len(), 2);
}

#[tokio::test]
async fn stop_all_resets_jobs_and_stays_usable() {
    let list = make_list("stoppable", sleeper(5_000), 1);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let running = submit(&list).await;
    let queued = submit(&list).await;
    assert!(wait_for_phase(&running, ExecutionPhase::Executing, Duration::from_millis(200)).await);
    assert_eq!(queued.phase(), ExecutionPhase::Queued);

    let manager = list.execution_manager();
    manager.stop_all().await;

    assert_eq!(running.phase(), ExecutionPhase::Pending);
    assert_eq!(queued.phase(), ExecutionPhase::Pending);
    assert!(manager.running_jobs().await.is_empty());
    assert!(manager.queued_jobs().await.is_empty());

    // The manager accepts work again.
    manager.execute(&queued).await.unwrap();
    assert!(wait_for_phase(&queued, ExecutionPhase::Executing, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn terminal_job_presented_to_execute_is_dropped() {
    let list = make_list("terminal", sleeper(10), 1);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = Job::new(None, JobParameters::new());
    list.add_job(job.clone()).await.unwrap();
    job.set_phase(ExecutionPhase::Aborted, false).unwrap();

    let manager = list.execution_manager();
    let phase = manager.execute(&job).await.unwrap();
    assert_eq!(phase, ExecutionPhase::Aborted);
    assert!(manager.running_jobs().await.is_empty());
    assert!(manager.queued_jobs().await.is_empty());
}

#[tokio::test]
async fn executing_job_presented_again_stays_executing() {
    let list = make_list("idempotent", sleeper(300), 1);
    let (_service, _dir) = make_service(vec![list.clone()]).await;

    let job = submit(&list).await;
    assert!(wait_for_phase(&job, ExecutionPhase::Executing, Duration::from_millis(200)).await);

    let manager = list.execution_manager();
    let phase = manager.execute(&job).await.unwrap();
    assert_eq!(phase, ExecutionPhase::Executing);
    assert_eq!(manager.running_jobs().await.len(), 1);
}
