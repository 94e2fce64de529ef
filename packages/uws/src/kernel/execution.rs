//! Admission control and parallelism bound for one job list.
//!
//! Two implementations of the [`ExecutionManager`] trait:
//! - [`DefaultExecutionManager`] starts every admitted job immediately
//!   and only tracks the running set for enumeration.
//! - [`QueuedExecutionManager`] bounds the number of concurrently
//!   running jobs and queues the rest in FIFO arrival order. A
//!   `max_running` of 0 means "no queue" and reverts to the default
//!   semantics.
//!
//! All operations of a manager are mutually exclusive per job list.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::warn;

use super::error::UwsResult;
use super::job::Job;
use super::phase::ExecutionPhase;

/// Admission and queueing authority for a job list.
#[async_trait]
pub trait ExecutionManager: Send + Sync {
    /// Admit a job: start it now, queue it, or evict it if terminal.
    /// Returns the job's phase after admission.
    async fn execute(&self, job: &Arc<Job>) -> UwsResult<ExecutionPhase>;

    /// Forget a job (running or queued), then let queued work advance.
    async fn remove(&self, job: &Job);

    /// Start queued jobs while capacity allows.
    async fn refresh(&self);

    /// Abort running jobs, reset queued ones to PENDING, and empty both
    /// sets. The manager stays usable afterwards.
    async fn stop_all(&self);

    async fn running_jobs(&self) -> Vec<Arc<Job>>;

    async fn queued_jobs(&self) -> Vec<Arc<Job>>;
}

// =============================================================================
// Unbounded manager
// =============================================================================

/// Starts every job immediately; no queue, no bound.
#[derive(Default)]
pub struct DefaultExecutionManager {
    running: Mutex<IndexMap<String, Arc<Job>>>,
}

impl DefaultExecutionManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionManager for DefaultExecutionManager {
    async fn execute(&self, job: &Arc<Job>) -> UwsResult<ExecutionPhase> {
        let phase = job.phase();
        if phase.is_final() {
            self.running.lock().await.shift_remove(job.job_id());
            return Ok(phase);
        }

        self.running
            .lock()
            .await
            .insert(job.job_id().to_string(), job.clone());

        if phase == ExecutionPhase::Executing {
            return Ok(ExecutionPhase::Executing);
        }

        // Route through QUEUED so the start transition stays legal.
        job.set_phase(ExecutionPhase::Queued, true)?;
        if let Err(error) = job.start() {
            self.running.lock().await.shift_remove(job.job_id());
            return Err(error);
        }
        Ok(ExecutionPhase::Executing)
    }

    async fn remove(&self, job: &Job) {
        self.running.lock().await.shift_remove(job.job_id());
    }

    async fn refresh(&self) {
        // Nothing queued, but drop finished jobs from the running set.
        self.running
            .lock()
            .await
            .retain(|_, job| !job.phase().is_final());
    }

    async fn stop_all(&self) {
        let running: Vec<Arc<Job>> = self.running.lock().await.drain(..).map(|(_, j)| j).collect();
        for job in running {
            if let Err(error) = job.abort().await {
                warn!(job_id = %job.job_id(), error = %error, "failed to abort job");
                continue;
            }
            if !job.is_leaked() {
                let _ = job.set_phase(ExecutionPhase::Pending, true);
            }
        }
    }

    async fn running_jobs(&self) -> Vec<Arc<Job>> {
        self.running.lock().await.values().cloned().collect()
    }

    async fn queued_jobs(&self) -> Vec<Arc<Job>> {
        Vec::new()
    }
}

// =============================================================================
// Bounded FIFO manager
// =============================================================================

struct ExecState {
    /// 0 means unbounded.
    max_running: usize,
    running: IndexMap<String, Arc<Job>>,
    queue: VecDeque<Arc<Job>>,
}

/// Bounded-parallelism manager with a FIFO queue over `execute` arrival
/// order.
pub struct QueuedExecutionManager {
    state: Mutex<ExecState>,
    /// Serializes whole refresh/stop passes so queued jobs start
    /// strictly in arrival order.
    refresh_gate: Mutex<()>,
}

impl QueuedExecutionManager {
    pub fn new(max_running: usize) -> Self {
        Self {
            state: Mutex::new(ExecState {
                max_running,
                running: IndexMap::new(),
                queue: VecDeque::new(),
            }),
            refresh_gate: Mutex::new(()),
        }
    }

    pub async fn max_running(&self) -> usize {
        self.state.lock().await.max_running
    }

    /// Change the parallelism bound. An increase lets queued jobs start;
    /// a decrease never preempts already-running jobs. 0 removes the
    /// bound.
    pub async fn set_max_running(&self, max_running: usize) {
        self.state.lock().await.max_running = max_running;
        self.refresh().await;
    }

    /// Pop and start queued jobs while capacity allows. Terminal jobs
    /// found at the head are evicted; a failed start is logged and
    /// processing continues.
    async fn refresh_inner(&self) {
        loop {
            let job = loop {
                let mut st = self.state.lock().await;
                if st.max_running != 0 && st.running.len() >= st.max_running {
                    return;
                }
                match st.queue.pop_front() {
                    None => return,
                    Some(job) if job.phase().is_final() => {
                        st.running.shift_remove(job.job_id());
                    }
                    Some(job) => {
                        st.running.insert(job.job_id().to_string(), job.clone());
                        break job;
                    }
                }
            };

            // The slot is reserved; start outside the state lock.
            if let Err(error) = job.start() {
                warn!(
                    job_id = %job.job_id(),
                    error = %error,
                    "failed to start queued job; dropping it"
                );
                self.state.lock().await.running.shift_remove(job.job_id());
            }
        }
    }
}

#[async_trait]
impl ExecutionManager for QueuedExecutionManager {
    async fn execute(&self, job: &Arc<Job>) -> UwsResult<ExecutionPhase> {
        self.refresh().await;

        let phase = job.phase();
        if phase.is_final() {
            let mut st = self.state.lock().await;
            st.running.shift_remove(job.job_id());
            st.queue.retain(|queued| queued.job_id() != job.job_id());
            return Ok(phase);
        }

        {
            let mut st = self.state.lock().await;
            let id = job.job_id();
            if phase == ExecutionPhase::Executing || st.running.contains_key(id) {
                st.running.insert(id.to_string(), job.clone());
                st.queue.retain(|queued| queued.job_id() != id);
                return Ok(ExecutionPhase::Executing);
            }
            if st.queue.iter().any(|queued| queued.job_id() == id) {
                return Ok(phase);
            }
            st.queue.push_back(job.clone());
        }

        // Admission transition; forced because the manager also admits
        // phases (e.g. SUSPENDED) with no direct QUEUED edge.
        job.set_phase(ExecutionPhase::Queued, true)?;
        self.refresh().await;
        Ok(job.phase())
    }

    async fn remove(&self, job: &Job) {
        {
            let mut st = self.state.lock().await;
            st.running.shift_remove(job.job_id());
            st.queue.retain(|queued| queued.job_id() != job.job_id());
        }
        self.refresh().await;
    }

    async fn refresh(&self) {
        let _gate = self.refresh_gate.lock().await;
        self.refresh_inner().await;
    }

    async fn stop_all(&self) {
        let _gate = self.refresh_gate.lock().await;
        let (queued, running) = {
            let mut st = self.state.lock().await;
            let queued: Vec<Arc<Job>> = st.queue.drain(..).collect();
            let running: Vec<Arc<Job>> = st.running.drain(..).map(|(_, job)| job).collect();
            (queued, running)
        };

        for job in queued {
            let _ = job.set_phase(ExecutionPhase::Pending, true);
        }
        for job in running {
            if let Err(error) = job.abort().await {
                warn!(job_id = %job.job_id(), error = %error, "failed to abort running job");
                continue;
            }
            if !job.is_leaked() {
                let _ = job.set_phase(ExecutionPhase::Pending, true);
            }
        }
    }

    async fn running_jobs(&self) -> Vec<Arc<Job>> {
        self.state.lock().await.running.values().cloned().collect()
    }

    async fn queued_jobs(&self) -> Vec<Arc<Job>> {
        self.state.lock().await.queue.iter().cloned().collect()
    }
}
