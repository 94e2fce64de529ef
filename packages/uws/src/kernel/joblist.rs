//! Ownership-indexed job container.
//!
//! A job list owns its execution manager, its destruction manager, the
//! parameter controllers of its jobs, and the destruction policy. Every
//! operation invoked on behalf of a user consults that user's
//! permissions; `None` means an anonymous caller with full access.
//!
//! The reserved parameter `ACTION=DELETE` is routed here (not in the
//! job) so destroy-policy handling stays in one place.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration as StdDuration;

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use super::destruction::{DefaultDestructionManager, DestructionManager};
use super::error::{UwsError, UwsResult};
use super::execution::{DefaultExecutionManager, ExecutionManager, QueuedExecutionManager};
use super::job::Job;
use super::parameters::{
    ControllerMap, JobParameters, ParamContext, ParameterController, PARAM_ACTION, PARAM_PHASE,
};
use super::phase::ExecutionPhase;
use super::service::UwsService;
use super::traits::{FileManager, JobOwnerRef, PermissionTarget};
use super::worker::JobTask;

/// Per-list rule mapping destroy requests to delete or archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DestructionPolicy {
    #[default]
    AlwaysDelete,
    /// Archive when destroyed at or past the destruction time, delete
    /// on earlier explicit destruction.
    ArchiveOnDate,
    /// Archive on the first destroy; a second destroy of the archived
    /// job deletes it.
    AlwaysArchive,
}

/// Construction options for a job list.
#[derive(TypedBuilder)]
pub struct JobListSpec {
    #[builder(setter(into))]
    pub name: String,
    /// The work every job of this list performs.
    pub task: Arc<dyn JobTask>,
    #[builder(default)]
    pub controllers: ControllerMap,
    /// Maximum concurrently running jobs; 0 means unbounded.
    #[builder(default)]
    pub max_running: usize,
    #[builder(default)]
    pub destruction_policy: DestructionPolicy,
    /// How long abort and timeout wait for a worker to stop.
    #[builder(default = StdDuration::from_secs(1))]
    pub abort_grace: StdDuration,
    #[builder(default, setter(strip_option))]
    pub execution_manager: Option<Arc<dyn ExecutionManager>>,
    #[builder(default, setter(strip_option))]
    pub destruction_manager: Option<Arc<dyn DestructionManager>>,
}

#[derive(Default)]
struct ListIndex {
    jobs: IndexMap<String, Arc<Job>>,
    by_owner: HashMap<String, IndexMap<String, Arc<Job>>>,
}

/// A named collection of jobs with its own execution and destruction
/// policies.
pub struct JobList {
    name: String,
    policy: DestructionPolicy,
    controllers: Arc<ControllerMap>,
    task: Arc<dyn JobTask>,
    abort_grace: StdDuration,
    execution: Arc<dyn ExecutionManager>,
    destruction: Arc<dyn DestructionManager>,
    index: RwLock<ListIndex>,
    /// Weak backref to the enclosing service; set by insertion.
    service: StdRwLock<Weak<UwsService>>,
    /// Weak self-handle handed to inserted jobs.
    me: Weak<JobList>,
}

impl JobList {
    /// Validate the spec and wire the managers.
    pub fn create(spec: JobListSpec) -> UwsResult<Arc<Self>> {
        validate_name(&spec.name)?;

        let execution: Arc<dyn ExecutionManager> = match spec.execution_manager {
            Some(manager) => manager,
            None if spec.max_running == 0 => Arc::new(DefaultExecutionManager::new()),
            None => Arc::new(QueuedExecutionManager::new(spec.max_running)),
        };
        let destruction: Arc<dyn DestructionManager> = match spec.destruction_manager {
            Some(manager) => manager,
            None => DefaultDestructionManager::new(),
        };

        let list = Arc::new_cyclic(|me| Self {
            name: spec.name,
            policy: spec.destruction_policy,
            controllers: Arc::new(spec.controllers),
            task: spec.task,
            abort_grace: spec.abort_grace,
            execution,
            destruction,
            index: RwLock::new(ListIndex::default()),
            service: StdRwLock::new(Weak::new()),
            me: me.clone(),
        });
        list.destruction.attach(list.me.clone());
        Ok(list)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destruction_policy(&self) -> DestructionPolicy {
        self.policy
    }

    pub fn job_task(&self) -> Arc<dyn JobTask> {
        self.task.clone()
    }

    pub fn abort_grace(&self) -> StdDuration {
        self.abort_grace
    }

    pub fn controller(&self, name: &str) -> Option<ParameterController> {
        self.controllers.get(name).cloned()
    }

    pub fn execution_manager(&self) -> Arc<dyn ExecutionManager> {
        self.execution.clone()
    }

    pub fn destruction_manager(&self) -> Arc<dyn DestructionManager> {
        self.destruction.clone()
    }

    pub fn service(&self) -> Option<Arc<UwsService>> {
        self.service
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    pub fn file_manager(&self) -> Option<Arc<dyn FileManager>> {
        self.service().map(|service| service.file_manager())
    }

    /// Wire the list to a service. Moving a non-empty list to another
    /// service is refused.
    pub(crate) async fn set_service(&self, service: Weak<UwsService>) -> UwsResult<()> {
        let changing = {
            let slot = self.service.read().unwrap_or_else(|e| e.into_inner());
            match (slot.upgrade(), service.upgrade()) {
                (Some(existing), Some(new)) => !Arc::ptr_eq(&existing, &new),
                (Some(_), None) => true,
                (None, _) => false,
            }
        };
        if changing && !self.index.read().await.jobs.is_empty() {
            return Err(UwsError::BadRequest(format!(
                "job list '{}' is not empty and cannot move to another service",
                self.name
            )));
        }
        *self.service.write().unwrap_or_else(|e| e.into_inner()) = service;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Add a freshly created job: validate its parameters, index it,
    /// apply controller defaults, register its destruction deadline,
    /// and start it if its parameters request an immediate run.
    /// Returns the coercion warnings of the checked parameters.
    pub async fn add_job(&self, job: Arc<Job>) -> UwsResult<Vec<String>> {
        let service = self.service().ok_or_else(|| {
            UwsError::BadRequest(format!(
                "job list '{}' is not attached to a service",
                self.name
            ))
        })?;

        if let Some(owner) = job.owner() {
            if !owner.has_write_permission(PermissionTarget::List(self)) {
                return Err(UwsError::PermissionDenied(format!(
                    "user {} may not add jobs to list '{}'",
                    owner.id(),
                    self.name
                )));
            }
        }

        // Check the supplied parameters before the job becomes visible;
        // a rejected value rejects the whole creation.
        let ctx = ParamContext::new(job.creation_time());
        let mut warnings = Vec::new();
        for (name, value) in job.parameters().iter() {
            if let Some(controller) = self.controllers.get(name) {
                let checked = controller.check(&ctx, name, value)?;
                if let Some(warning) = checked.warning {
                    warnings.push(warning);
                }
                job.store_parameter(name, checked.value)?;
            }
        }

        self.insert(&job).await?;

        // Controller defaults for parameters the client did not supply.
        for (name, controller) in self.controllers.iter() {
            if job.parameter(name).is_none() {
                if let Some(value) = controller.default_value(&ctx) {
                    job.store_parameter(name, value)?;
                }
            }
        }

        self.destruction.update(&job).await;
        service.notify_job_change(job.owner_id());

        let run_requested = job
            .parameter(PARAM_PHASE)
            .and_then(|value| value.as_str().map(str::to_string))
            .is_some_and(|phase| phase.eq_ignore_ascii_case("RUN"));
        if run_requested {
            self.execution.execute(&job).await?;
        }

        debug!(list = %self.name, job_id = %job.job_id(), "job added");
        Ok(warnings)
    }

    /// Re-insert a restored job, keeping its phase and skipping defaults
    /// and permission checks.
    pub(crate) async fn restore_job(&self, job: Arc<Job>) -> UwsResult<()> {
        self.insert(&job).await?;
        self.destruction.update(&job).await;
        Ok(())
    }

    async fn insert(&self, job: &Arc<Job>) -> UwsResult<()> {
        let me = self.me.upgrade().ok_or_else(|| {
            UwsError::Internal(anyhow::anyhow!("job list '{}' handle expired", self.name))
        })?;
        let mut index = self.index.write().await;
        if index.jobs.contains_key(job.job_id()) {
            return Err(UwsError::BadRequest(format!(
                "job id {} already exists in list '{}'",
                job.job_id(),
                self.name
            )));
        }
        job.attach_list(&me)?;
        index
            .jobs
            .insert(job.job_id().to_string(), job.clone());
        if let Some(owner_id) = job.owner_id() {
            index
                .by_owner
                .entry(owner_id.to_string())
                .or_default()
                .insert(job.job_id().to_string(), job.clone());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup and enumeration
    // ------------------------------------------------------------------

    pub async fn get_job(
        &self,
        job_id: &str,
        user: Option<&JobOwnerRef>,
    ) -> UwsResult<Arc<Job>> {
        if let Some(user) = user {
            if !user.has_read_permission(PermissionTarget::List(self)) {
                return Err(UwsError::PermissionDenied(format!(
                    "user {} may not read list '{}'",
                    user.id(),
                    self.name
                )));
            }
        }
        let job = self
            .index
            .read()
            .await
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| UwsError::JobNotFound(job_id.to_string()))?;
        if let Some(user) = user {
            if !user.has_read_permission(PermissionTarget::Job(&job)) {
                return Err(UwsError::PermissionDenied(format!(
                    "user {} may not read job {}",
                    user.id(),
                    job_id
                )));
            }
        }
        Ok(job)
    }

    /// All jobs in insertion order.
    pub async fn get_jobs(&self) -> Vec<Arc<Job>> {
        self.index.read().await.jobs.values().cloned().collect()
    }

    /// Jobs of one owner, in insertion order.
    pub async fn get_jobs_of(&self, owner_id: &str) -> Vec<Arc<Job>> {
        self.index
            .read()
            .await
            .by_owner
            .get(owner_id)
            .map(|owned| owned.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Owner ids with at least one job in the list.
    pub async fn get_users(&self) -> Vec<String> {
        self.index.read().await.by_owner.keys().cloned().collect()
    }

    pub async fn nb_jobs(&self) -> usize {
        self.index.read().await.jobs.len()
    }

    pub async fn nb_jobs_of(&self, owner_id: &str) -> usize {
        self.index
            .read()
            .await
            .by_owner
            .get(owner_id)
            .map(IndexMap::len)
            .unwrap_or(0)
    }

    /// Case-insensitive search by run id.
    pub async fn search_jobs(&self, run_id: &str) -> Vec<Arc<Job>> {
        self.index
            .read()
            .await
            .jobs
            .values()
            .filter(|job| {
                job.run_id()
                    .is_some_and(|label| label.eq_ignore_ascii_case(run_id))
            })
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Destruction
    // ------------------------------------------------------------------

    /// Destroy a job per the list's destruction policy. Invoked by
    /// clients, by `ACTION=DELETE`, and by the destruction manager
    /// (with `user=None`).
    pub async fn destroy_job(&self, job_id: &str, user: Option<&JobOwnerRef>) -> UwsResult<()> {
        let job = self
            .index
            .read()
            .await
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| UwsError::JobNotFound(job_id.to_string()))?;

        if let Some(user) = user {
            let allowed = user.has_write_permission(PermissionTarget::List(self))
                && user.has_write_permission(PermissionTarget::Job(&job));
            if !allowed {
                return Err(UwsError::PermissionDenied(format!(
                    "user {} may not destroy job {}",
                    user.id(),
                    job_id
                )));
            }
        }

        let archive = match self.policy {
            DestructionPolicy::AlwaysDelete => false,
            DestructionPolicy::ArchiveOnDate => job
                .destruction_time()
                .is_some_and(|deadline| Utc::now() >= deadline),
            // Already-archived jobs fall through to deletion.
            DestructionPolicy::AlwaysArchive => job.phase() != ExecutionPhase::Archived,
        };

        if archive {
            self.archive_job_inner(&job).await
        } else {
            self.delete_job_inner(&job).await
        }
    }

    /// Archive a job directly (the `PHASE=ARCHIVE` action), regardless
    /// of the destruction policy.
    pub async fn archive_job(&self, job_id: &str, user: Option<&JobOwnerRef>) -> UwsResult<()> {
        let job = self.get_job(job_id, user).await?;
        if let Some(user) = user {
            if !user.has_write_permission(PermissionTarget::Job(&job)) {
                return Err(UwsError::PermissionDenied(format!(
                    "user {} may not archive job {}",
                    user.id(),
                    job_id
                )));
            }
        }
        self.archive_job_inner(&job).await
    }

    async fn delete_job_inner(&self, job: &Arc<Job>) -> UwsResult<()> {
        {
            let mut index = self.index.write().await;
            index.jobs.shift_remove(job.job_id());
            if let Some(owner_id) = job.owner_id() {
                if let Some(owned) = index.by_owner.get_mut(owner_id) {
                    owned.shift_remove(job.job_id());
                    if owned.is_empty() {
                        index.by_owner.remove(owner_id);
                    }
                }
            }
        }

        if !job.phase().is_final() {
            if let Err(error) = job.abort().await {
                warn!(job_id = %job.job_id(), error = %error, "failed to abort job before deletion");
            }
        }
        job.clear_resources().await;
        self.destruction.remove(job).await;
        self.execution.remove(job).await;
        self.notify_backup(job.owner_id());
        debug!(list = %self.name, job_id = %job.job_id(), "job deleted");
        Ok(())
    }

    /// Abort if needed, transition to ARCHIVED, release resources, and
    /// keep the job enumerable.
    async fn archive_job_inner(&self, job: &Arc<Job>) -> UwsResult<()> {
        if !job.phase().is_final() {
            job.abort().await?;
        }
        job.set_phase(ExecutionPhase::Archived, false)?;
        job.clear_resources().await;
        self.destruction.remove(job).await;
        self.execution.remove(job).await;
        self.notify_backup(job.owner_id());
        debug!(list = %self.name, job_id = %job.job_id(), "job archived");
        Ok(())
    }

    /// Destroy every job of the list.
    pub async fn clear(&self) -> usize {
        let ids: Vec<String> = self.index.read().await.jobs.keys().cloned().collect();
        let mut destroyed = 0;
        for job_id in ids {
            match self.destroy_job(&job_id, None).await {
                Ok(()) => destroyed += 1,
                Err(error) => {
                    warn!(list = %self.name, job_id = %job_id, error = %error, "failed to destroy job")
                }
            }
        }
        destroyed
    }

    /// Destroy every job of one owner.
    pub async fn clear_for(&self, owner_id: &str) -> usize {
        let ids: Vec<String> = self
            .index
            .read()
            .await
            .by_owner
            .get(owner_id)
            .map(|owned| owned.keys().cloned().collect())
            .unwrap_or_default();
        let mut destroyed = 0;
        for job_id in ids {
            match self.destroy_job(&job_id, None).await {
                Ok(()) => destroyed += 1,
                Err(error) => {
                    warn!(list = %self.name, job_id = %job_id, error = %error, "failed to destroy job")
                }
            }
        }
        destroyed
    }

    // ------------------------------------------------------------------
    // Client updates
    // ------------------------------------------------------------------

    /// Apply a parameter update request. Routes the reserved
    /// `ACTION=DELETE`, honors `PHASE=RUN|ABORT`, and returns the
    /// coercion warnings of the stored parameters.
    pub async fn update_job_parameters(
        &self,
        job_id: &str,
        user: Option<&JobOwnerRef>,
        parameters: JobParameters,
    ) -> UwsResult<Vec<String>> {
        let job = self.get_job(job_id, user).await?;
        if let Some(user) = user {
            if !user.has_write_permission(PermissionTarget::Job(&job)) {
                return Err(UwsError::PermissionDenied(format!(
                    "user {} may not modify job {}",
                    user.id(),
                    job_id
                )));
            }
        }

        if parameters
            .get_str(PARAM_ACTION)
            .is_some_and(|action| action.eq_ignore_ascii_case("DELETE"))
        {
            self.destroy_job(job_id, user).await?;
            return Ok(Vec::new());
        }

        let mut warnings = Vec::new();
        let mut run_requested = false;
        let mut abort_requested = false;
        for (name, value) in parameters.iter() {
            if name == PARAM_PHASE {
                match value.as_str() {
                    Some(phase) if phase.eq_ignore_ascii_case("RUN") => run_requested = true,
                    Some(phase) if phase.eq_ignore_ascii_case("ABORT") => abort_requested = true,
                    other => {
                        return Err(UwsError::BadRequest(format!(
                            "unsupported PHASE value '{:?}' in a parameter update",
                            other
                        )))
                    }
                }
                continue;
            }
            if let Some(warning) = job.set_parameter(name, value.clone()).await? {
                warnings.push(warning);
            }
        }

        if run_requested {
            if let Some(user) = user {
                if !user.has_execute_permission(&job) {
                    return Err(UwsError::PermissionDenied(format!(
                        "user {} may not execute job {}",
                        user.id(),
                        job_id
                    )));
                }
            }
            self.execution.execute(&job).await?;
        }
        if abort_requested {
            job.abort().await?;
        }

        self.notify_backup(job.owner_id());
        Ok(warnings)
    }

    /// Apply a `PHASE=...` control action (`RUN`, `ABORT`, `ARCHIVE`,
    /// `SUSPEND`, `HELD`).
    pub async fn control_phase(
        &self,
        job_id: &str,
        user: Option<&JobOwnerRef>,
        action: &str,
    ) -> UwsResult<()> {
        let job = self.get_job(job_id, user).await?;
        if let Some(user) = user {
            if !user.has_write_permission(PermissionTarget::Job(&job)) {
                return Err(UwsError::PermissionDenied(format!(
                    "user {} may not control job {}",
                    user.id(),
                    job_id
                )));
            }
        }

        match action.to_ascii_uppercase().as_str() {
            "RUN" => {
                if let Some(user) = user {
                    if !user.has_execute_permission(&job) {
                        return Err(UwsError::PermissionDenied(format!(
                            "user {} may not execute job {}",
                            user.id(),
                            job_id
                        )));
                    }
                }
                self.execution.execute(&job).await?;
                Ok(())
            }
            "ABORT" => job.abort().await,
            "ARCHIVE" => self.archive_job_inner(&job).await,
            "SUSPEND" => job.set_phase(ExecutionPhase::Suspended, false),
            "HELD" => job.set_phase(ExecutionPhase::Held, false),
            other => Err(UwsError::BadRequest(format!(
                "unsupported phase action '{}'",
                other
            ))),
        }?;

        self.notify_backup(job.owner_id());
        Ok(())
    }

    fn notify_backup(&self, owner_id: Option<&str>) {
        if let Some(service) = self.service() {
            service.notify_job_change(owner_id);
        }
    }
}

fn validate_name(name: &str) -> UwsResult<()> {
    if name.is_empty() {
        return Err(UwsError::BadRequest("job list name must not be empty".into()));
    }
    if name
        .chars()
        .any(|c| c == '.' || c == '=' || c.is_whitespace())
    {
        return Err(UwsError::BadRequest(format!(
            "job list name '{}' must not contain '.', '=' or whitespace",
            name
        )));
    }
    Ok(())
}

impl std::fmt::Debug for JobList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobList")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}
