//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use uws_core::kernel::{
    DestructionPolicy, ExecutionPhase, FileManager, Job, JobList, JobListSpec, JobObserver,
    JobOwner, JobResult, JobTask, LocalFileManager, PermissionTarget, TaskError, UwsService,
    UwsServiceSpec,
};
use uws_core::kernel::parameters::ControllerMap;

/// Sleeps for a fixed duration, stopping promptly on cancellation.
pub struct SleepTask {
    pub duration: Duration,
}

#[async_trait]
impl JobTask for SleepTask {
    async fn run(&self, _job: Arc<Job>, cancel: CancellationToken) -> Result<(), TaskError> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(()),
            _ = cancel.cancelled() => Ok(()),
        }
    }
}

/// Sleeps, then records one result named `out`.
pub struct ResultTask {
    pub duration: Duration,
}

#[async_trait]
impl JobTask for ResultTask {
    async fn run(&self, job: Arc<Job>, cancel: CancellationToken) -> Result<(), TaskError> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
        job.add_result(JobResult::new("out"))
            .map_err(|error| TaskError::fatal(error.to_string()))?;
        Ok(())
    }
}

/// Fails immediately with the configured severity.
pub struct FailTask {
    pub error: TaskError,
}

#[async_trait]
impl JobTask for FailTask {
    async fn run(&self, _job: Arc<Job>, _cancel: CancellationToken) -> Result<(), TaskError> {
        Err(self.error.clone())
    }
}

/// Ignores cancellation entirely; used to exercise the grace period.
pub struct StubbornTask {
    pub duration: Duration,
}

#[async_trait]
impl JobTask for StubbornTask {
    async fn run(&self, _job: Arc<Job>, _cancel: CancellationToken) -> Result<(), TaskError> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Observer recording every phase change it sees.
pub struct RecordingObserver {
    events: Mutex<Vec<(ExecutionPhase, ExecutionPhase)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<(ExecutionPhase, ExecutionPhase)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of(&self, old: ExecutionPhase, new: ExecutionPhase) -> usize {
        self.events()
            .iter()
            .filter(|event| **event == (old, new))
            .count()
    }
}

impl JobObserver for RecordingObserver {
    fn on_phase_change(
        &self,
        _job: &Job,
        old: ExecutionPhase,
        new: ExecutionPhase,
    ) -> anyhow::Result<()> {
        self.events.lock().unwrap().push((old, new));
        Ok(())
    }
}

/// An owner with no permissions at all.
pub struct DenyAllOwner {
    pub id: String,
}

impl JobOwner for DenyAllOwner {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_read_permission(&self, _target: PermissionTarget<'_>) -> bool {
        false
    }

    fn has_write_permission(&self, _target: PermissionTarget<'_>) -> bool {
        false
    }

    fn has_execute_permission(&self, _job: &Job) -> bool {
        false
    }
}

/// A job list around the given task, with an optional bound.
pub fn make_list(name: &str, task: Arc<dyn JobTask>, max_running: usize) -> Arc<JobList> {
    JobList::create(
        JobListSpec::builder()
            .name(name)
            .task(task)
            .max_running(max_running)
            .build(),
    )
    .expect("valid job list spec")
}

pub fn make_list_with(
    name: &str,
    task: Arc<dyn JobTask>,
    max_running: usize,
    controllers: ControllerMap,
    policy: DestructionPolicy,
) -> Arc<JobList> {
    JobList::create(
        JobListSpec::builder()
            .name(name)
            .task(task)
            .max_running(max_running)
            .controllers(controllers)
            .destruction_policy(policy)
            .build(),
    )
    .expect("valid job list spec")
}

/// A service over a temp directory holding the given lists.
pub async fn make_service(lists: Vec<Arc<JobList>>) -> (Arc<UwsService>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let service = UwsService::create(
        UwsServiceSpec::builder()
            .name("test-uws")
            .file_manager(Arc::new(LocalFileManager::new(dir.path())) as Arc<dyn FileManager>)
            .build(),
    );
    for list in lists {
        service.add_job_list(list).await.expect("unique list name");
    }
    (service, dir)
}

/// Poll until the job reaches the phase or the deadline passes.
pub async fn wait_for_phase(job: &Arc<Job>, phase: ExecutionPhase, deadline: Duration) -> bool {
    let poll = async {
        loop {
            if job.phase() == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(deadline, poll).await.is_ok()
}
