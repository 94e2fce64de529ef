//! The job entity: one unit of asynchronous work.
//!
//! A [`Job`] owns its parameters, results, error summary, phase, and
//! deadlines. Identity fields (id, owner, creation time) are immutable;
//! everything else lives behind a single per-job mutex so that phase
//! transitions are serialized. Observer callbacks run outside that lock,
//! in transition order, through a per-job notification queue with a
//! single drainer.
//!
//! The worker side of a job (spawning, cancellation, timeout) is in
//! [`crate::kernel::worker`].

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::destruction::DestructionManager;
use super::error::{UwsError, UwsResult};
use super::execution::ExecutionManager;
use super::joblist::JobList;
use super::parameters::{
    canonical_name, JobParameters, ParamContext, PARAM_DESTRUCTION, PARAM_EXECUTION_DURATION,
    PARAM_RUN_ID,
};
use super::phase::ExecutionPhase;
use super::traits::{FileManager, JobOwnerRef};
use super::worker;

/// One entry of a job's ordered result list. Result ids are unique
/// within the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub redirection_required: bool,
}

impl JobResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            href: None,
            mime_type: None,
            size: None,
            redirection_required: false,
        }
    }

    pub fn redirect(id: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            href: Some(href.into()),
            mime_type: None,
            size: None,
            redirection_required: true,
        }
    }
}

/// Severity of a worker-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorType {
    /// Recoverable failure; the job stays in ERROR but a resubmission
    /// may succeed.
    Transient,
    /// Unrecoverable failure, including execution-budget exhaustion.
    Fatal,
}

/// Client-visible summary of a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub message: String,
    pub error_type: ErrorType,
    /// Reference to a detail file written through the file manager,
    /// when one could be persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details_ref: Option<String>,
}

impl ErrorSummary {
    pub fn new(message: impl Into<String>, error_type: ErrorType) -> Self {
        Self {
            message: message.into(),
            error_type,
            details_ref: None,
        }
    }
}

/// Opaque additional job descriptor, destroyed with the job.
pub trait JobInfo: Send + Sync {
    /// XML fragment for embedding into a job representation.
    fn xml_fragment(&self, indent: &str) -> String;

    /// Full standalone content.
    fn write_full_content(&self, sink: &mut dyn io::Write) -> io::Result<()>;

    /// Release whatever the descriptor holds.
    fn destroy(&self) {}
}

/// Notification sink subscribed to a job's phase transitions.
///
/// Callbacks are invoked outside any lock held on the job, once per
/// transition, in transition order. A failing callback is logged and
/// does not affect the job.
pub trait JobObserver: Send + Sync {
    fn on_phase_change(
        &self,
        job: &Job,
        old_phase: ExecutionPhase,
        new_phase: ExecutionPhase,
    ) -> anyhow::Result<()>;
}

/// Serializable snapshot of a job's public state; also the restoration
/// form consumed at startup. Observers, the cancellation token, and the
/// opaque job info are deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub phase: ExecutionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<i64>,
    pub creation_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub execution_duration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destruction_time: Option<DateTime<Utc>>,
    pub parameters: indexmap::IndexMap<String, Value>,
    #[serde(default)]
    pub results: Vec<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,
}

struct JobState {
    run_id: Option<String>,
    phase: ExecutionPhase,
    quote: Option<i64>,
    /// Execution budget in seconds; 0 means no limit.
    execution_duration_sec: i64,
    destruction_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    parameters: JobParameters,
    results: Vec<JobResult>,
    error_summary: Option<ErrorSummary>,
    job_info: Option<Arc<dyn JobInfo>>,
    /// Cancellation signal of the current run, if any.
    cancel: Option<CancellationToken>,
    /// Set when a worker ignored cancellation past the grace period.
    leaked: bool,
    resources_cleared: bool,
}

/// A single unit of asynchronous work.
pub struct Job {
    job_id: String,
    owner: Option<JobOwnerRef>,
    creation_time: DateTime<Utc>,
    state: Mutex<JobState>,
    observers: Mutex<Vec<Arc<dyn JobObserver>>>,
    notifications: Mutex<VecDeque<(ExecutionPhase, ExecutionPhase)>>,
    /// Exclusivity gate for the notification drainer; never held while
    /// the state lock is held.
    notify_gate: Mutex<()>,
    /// Signaled whenever the job enters a terminal phase.
    done: Notify,
    /// Weak backref, set exactly once on insertion into a list.
    list: RwLock<Weak<JobList>>,
    /// Weak self-handle for spawning the worker supervisor.
    me: Weak<Job>,
}

impl Job {
    /// Create a fresh job in PENDING with a generated id.
    pub fn new(owner: Option<JobOwnerRef>, parameters: JobParameters) -> Arc<Self> {
        Self::with_id(Uuid::new_v4().to_string(), owner, parameters)
    }

    /// Create a fresh job with a caller-supplied id (which must be unique
    /// within the destination list).
    pub fn with_id(
        job_id: impl Into<String>,
        owner: Option<JobOwnerRef>,
        parameters: JobParameters,
    ) -> Arc<Self> {
        let run_id = parameters.get_str(PARAM_RUN_ID).map(str::to_string);
        let execution_duration_sec = parameters
            .get(PARAM_EXECUTION_DURATION)
            .and_then(as_seconds)
            .unwrap_or(0);
        let destruction_time = parameters
            .get_str(PARAM_DESTRUCTION)
            .and_then(parse_instant);

        Arc::new_cyclic(|me| Self {
            job_id: job_id.into(),
            owner,
            creation_time: Utc::now(),
            state: Mutex::new(JobState {
                run_id,
                phase: ExecutionPhase::Pending,
                quote: None,
                execution_duration_sec,
                destruction_time,
                start_time: None,
                end_time: None,
                parameters,
                results: Vec::new(),
                error_summary: None,
                job_info: None,
                cancel: None,
                leaked: false,
                resources_cleared: false,
            }),
            observers: Mutex::new(Vec::new()),
            notifications: Mutex::new(VecDeque::new()),
            notify_gate: Mutex::new(()),
            done: Notify::new(),
            list: RwLock::new(Weak::new()),
            me: me.clone(),
        })
    }

    /// Rebuild a job from a saved description, preserving its phase and
    /// timestamps verbatim.
    pub fn restore(description: JobDescription, owner: Option<JobOwnerRef>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            job_id: description.job_id,
            owner,
            creation_time: description.creation_time,
            state: Mutex::new(JobState {
                run_id: description.run_id,
                phase: description.phase,
                quote: description.quote,
                execution_duration_sec: description.execution_duration,
                destruction_time: description.destruction_time,
                start_time: description.start_time,
                end_time: description.end_time,
                parameters: JobParameters::from(description.parameters),
                results: description.results,
                error_summary: description.error_summary,
                job_info: None,
                cancel: None,
                leaked: false,
                resources_cleared: false,
            }),
            observers: Mutex::new(Vec::new()),
            notifications: Mutex::new(VecDeque::new()),
            notify_gate: Mutex::new(()),
            done: Notify::new(),
            list: RwLock::new(Weak::new()),
            me: me.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn owner(&self) -> Option<&JobOwnerRef> {
        self.owner.as_ref()
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner.as_ref().map(|owner| owner.id())
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.lock_state().phase
    }

    pub fn run_id(&self) -> Option<String> {
        self.lock_state().run_id.clone()
    }

    pub fn quote(&self) -> Option<i64> {
        self.lock_state().quote
    }

    pub fn set_quote(&self, quote: Option<i64>) {
        self.lock_state().quote = quote;
    }

    /// Execution budget in seconds; 0 means no limit.
    pub fn execution_duration(&self) -> i64 {
        self.lock_state().execution_duration_sec
    }

    pub fn destruction_time(&self) -> Option<DateTime<Utc>> {
        self.lock_state().destruction_time
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.lock_state().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.lock_state().end_time
    }

    pub fn results(&self) -> Vec<JobResult> {
        self.lock_state().results.clone()
    }

    pub fn result(&self, result_id: &str) -> Option<JobResult> {
        self.lock_state()
            .results
            .iter()
            .find(|result| result.id == result_id)
            .cloned()
    }

    pub fn error_summary(&self) -> Option<ErrorSummary> {
        self.lock_state().error_summary.clone()
    }

    pub fn parameters(&self) -> JobParameters {
        self.lock_state().parameters.clone()
    }

    pub fn parameter(&self, name: &str) -> Option<Value> {
        self.lock_state().parameters.get(name).cloned()
    }

    pub fn job_info(&self) -> Option<Arc<dyn JobInfo>> {
        self.lock_state().job_info.clone()
    }

    pub fn set_job_info(&self, info: Arc<dyn JobInfo>) {
        self.lock_state().job_info = Some(info);
    }

    pub fn is_leaked(&self) -> bool {
        self.lock_state().leaked
    }

    pub fn resources_cleared(&self) -> bool {
        self.lock_state().resources_cleared
    }

    pub fn job_list(&self) -> Option<Arc<JobList>> {
        self.list
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    /// Serializable snapshot of the job's public state.
    pub fn description(&self) -> JobDescription {
        let st = self.lock_state();
        JobDescription {
            job_id: self.job_id.clone(),
            run_id: st.run_id.clone(),
            owner_id: self.owner_id().map(str::to_string),
            phase: st.phase,
            quote: st.quote,
            creation_time: self.creation_time,
            start_time: st.start_time,
            end_time: st.end_time,
            execution_duration: st.execution_duration_sec,
            destruction_time: st.destruction_time,
            parameters: st.parameters.as_map().clone(),
            results: st.results.clone(),
            error_summary: st.error_summary.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Phase transitions
    // ------------------------------------------------------------------

    /// Apply a phase transition. With `force=false` the legality table
    /// of [`ExecutionPhase::can_transition_to`] is enforced and the
    /// phase is left unchanged on violation.
    pub fn set_phase(&self, target: ExecutionPhase, force: bool) -> UwsResult<()> {
        let change = {
            let mut st = self.lock_state();
            self.transition_locked(&mut st, target, force)?
        };
        self.after_transition(change);
        Ok(())
    }

    fn transition_locked(
        &self,
        st: &mut JobState,
        target: ExecutionPhase,
        force: bool,
    ) -> UwsResult<Option<(ExecutionPhase, ExecutionPhase)>> {
        let old = st.phase;
        if old == target {
            return Ok(None);
        }
        if !force && !old.can_transition_to(target) {
            return Err(UwsError::IllegalPhaseTransition {
                from: old,
                to: target,
            });
        }

        st.phase = target;
        let now = Utc::now();
        if target == ExecutionPhase::Executing && st.start_time.is_none() {
            st.start_time = Some(now);
        }
        if target.is_final() && st.end_time.is_none() {
            st.end_time = Some(now);
        }
        if target == ExecutionPhase::Pending {
            // A reset (stop_all) wipes the previous run's timestamps.
            st.start_time = None;
            st.end_time = None;
        }

        Ok(Some((old, target)))
    }

    fn after_transition(&self, change: Option<(ExecutionPhase, ExecutionPhase)>) {
        let Some((old, new)) = change else {
            return;
        };
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((old, new));
        if new.is_final() {
            self.done.notify_waiters();
        }
        self.drain_notifications();
    }

    /// Deliver queued phase-change notifications, one drainer at a time.
    fn drain_notifications(&self) {
        loop {
            let Ok(gate) = self.notify_gate.try_lock() else {
                // Another drainer is active and will pick this event up.
                return;
            };
            loop {
                let event = self
                    .notifications
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front();
                let Some((old, new)) = event else {
                    break;
                };
                let observers: Vec<Arc<dyn JobObserver>> = self
                    .observers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                for observer in observers {
                    if let Err(error) = observer.on_phase_change(self, old, new) {
                        warn!(job_id = %self.job_id, error = %error, "job observer failed");
                    }
                }
            }
            drop(gate);
            // A pusher may have bailed on the gate while we were
            // releasing it; re-check before giving up the role.
            if self
                .notifications
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
            {
                return;
            }
        }
    }

    /// Resolves once the job is in a terminal phase.
    pub async fn wait_until_finished(&self) {
        loop {
            let notified = self.done.notified();
            if self.phase().is_final() {
                return;
            }
            notified.await;
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Transition into EXECUTING and spawn the worker. The caller (the
    /// execution manager) is responsible for having queued the job
    /// first; starting a PENDING job directly is illegal.
    pub fn start(&self) -> UwsResult<()> {
        let me = self.me.upgrade().ok_or_else(|| {
            UwsError::Internal(anyhow::anyhow!("job {} handle expired", self.job_id))
        })?;
        let list = self.job_list().ok_or_else(|| {
            UwsError::BadRequest(format!("job {} is not attached to a job list", self.job_id))
        })?;
        let task = list.job_task();
        let grace = list.abort_grace();
        let file_manager = list.file_manager();

        let (change, cancel, budget) = {
            let mut st = self.lock_state();
            if st.phase.is_final() {
                return Err(UwsError::BadRequest(format!(
                    "job {} is already finished ({})",
                    self.job_id, st.phase
                )));
            }
            if st.phase == ExecutionPhase::Executing {
                return Ok(());
            }
            let change = self.transition_locked(&mut st, ExecutionPhase::Executing, false)?;
            let token = CancellationToken::new();
            st.cancel = Some(token.clone());
            st.leaked = false;
            (change, token, st.execution_duration_sec)
        };
        self.after_transition(change);

        tokio::spawn(worker::supervise(
            me,
            task,
            cancel,
            budget,
            grace,
            file_manager,
        ));
        Ok(())
    }

    /// Request cooperative termination. Running workers are signalled
    /// and given a bounded grace period; a worker that overstays is
    /// marked leaked but the job still reaches ABORTED. Idempotent on a
    /// finished job.
    pub async fn abort(&self) -> UwsResult<()> {
        let grace = self
            .job_list()
            .map(|list| list.abort_grace())
            .unwrap_or(StdDuration::from_secs(1));

        let (phase, cancel) = {
            let st = self.lock_state();
            (st.phase, st.cancel.clone())
        };
        if phase.is_final() {
            return Ok(());
        }

        if phase == ExecutionPhase::Executing {
            if let Some(token) = &cancel {
                token.cancel();
            }
            let _ = tokio::time::timeout(grace, self.wait_until_finished()).await;

            let change = {
                let mut st = self.lock_state();
                if st.phase == ExecutionPhase::Executing {
                    st.leaked = true;
                    self.transition_locked(&mut st, ExecutionPhase::Aborted, false)?
                } else {
                    None
                }
            };
            if change.is_some() {
                warn!(
                    job_id = %self.job_id,
                    "worker did not stop within the grace period; marked as leaked"
                );
            }
            self.after_transition(change);
        } else {
            let change = {
                let mut st = self.lock_state();
                if st.phase.is_final() {
                    None
                } else {
                    self.transition_locked(&mut st, ExecutionPhase::Aborted, false)?
                }
            };
            self.after_transition(change);
            // A queued job must also leave the execution manager.
            if let Some(list) = self.job_list() {
                list.execution_manager().remove(self).await;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Parameters and results
    // ------------------------------------------------------------------

    /// Set one parameter. Permitted only while the job is PENDING;
    /// controlled parameters go through their controller and may be
    /// coerced (the returned warning describes the coercion).
    pub async fn set_parameter(&self, name: &str, value: Value) -> UwsResult<Option<String>> {
        let canonical = canonical_name(name);
        let list = self.job_list();

        {
            let st = self.lock_state();
            if !st.phase.is_updatable() {
                return Err(UwsError::BadRequest(format!(
                    "job {} can no longer be updated (phase {})",
                    self.job_id, st.phase
                )));
            }
        }

        let controller = list.as_ref().and_then(|l| l.controller(&canonical));
        let (stored, warning) = match controller {
            Some(controller) => {
                if !controller.allows_modification() {
                    return Err(UwsError::ModificationForbidden(canonical));
                }
                let checked = controller.check(
                    &ParamContext::new(self.creation_time),
                    &canonical,
                    &value,
                )?;
                (checked.value, checked.warning)
            }
            None => (value, None),
        };

        self.store_parameter(&canonical, stored)?;

        if canonical == PARAM_DESTRUCTION {
            if let (Some(list), Some(me)) = (&list, self.me.upgrade()) {
                list.destruction_manager().update(&me).await;
            }
        }

        Ok(warning)
    }

    /// Store a parameter value and keep the derived job fields in sync.
    pub(crate) fn store_parameter(&self, canonical: &str, value: Value) -> UwsResult<()> {
        let mut st = self.lock_state();
        match canonical {
            PARAM_RUN_ID => {
                st.run_id = value.as_str().map(str::to_string);
            }
            PARAM_EXECUTION_DURATION => {
                st.execution_duration_sec = as_seconds(&value).ok_or_else(|| {
                    UwsError::InvalidParameter {
                        name: canonical.to_string(),
                        reason: "expected integer seconds".to_string(),
                    }
                })?;
            }
            PARAM_DESTRUCTION => {
                let instant = value
                    .as_str()
                    .and_then(parse_instant)
                    .ok_or_else(|| UwsError::InvalidParameter {
                        name: canonical.to_string(),
                        reason: "expected an ISO-8601 instant".to_string(),
                    })?;
                st.destruction_time = Some(instant);
            }
            _ => {}
        }
        st.parameters.set(canonical, value);
        Ok(())
    }

    /// Append a result. Permitted only while EXECUTING; result ids are
    /// unique within the job.
    pub fn add_result(&self, result: JobResult) -> UwsResult<()> {
        let mut st = self.lock_state();
        if st.phase != ExecutionPhase::Executing {
            return Err(UwsError::BadRequest(format!(
                "results can only be added while job {} is executing (phase {})",
                self.job_id, st.phase
            )));
        }
        if st.results.iter().any(|existing| existing.id == result.id) {
            return Err(UwsError::BadRequest(format!(
                "duplicate result id '{}' in job {}",
                result.id, self.job_id
            )));
        }
        st.results.push(result);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn add_observer(&self, observer: Arc<dyn JobObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn JobObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    // ------------------------------------------------------------------
    // Resources and wiring
    // ------------------------------------------------------------------

    /// Release files, cancel the worker signal, drop observers and the
    /// job info. Metadata stays readable. Called by the destroy paths.
    pub async fn clear_resources(&self) {
        let (cancel, job_info) = {
            let mut st = self.lock_state();
            st.resources_cleared = true;
            (st.cancel.take(), st.job_info.take())
        };
        if let Some(token) = cancel {
            token.cancel();
        }
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        if let Some(info) = job_info {
            info.destroy();
        }
        if let Some(file_manager) = self.job_list().and_then(|list| list.file_manager()) {
            if let Err(error) = file_manager.delete_job_files(self).await {
                warn!(job_id = %self.job_id, error = %error, "failed to delete job files");
            }
        }
    }

    pub(crate) fn attach_list(&self, list: &Arc<JobList>) -> UwsResult<()> {
        let mut slot = self.list.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.upgrade() {
            if Arc::ptr_eq(&existing, list) {
                return Ok(());
            }
            return Err(UwsError::BadRequest(format!(
                "job {} already belongs to job list '{}'",
                self.job_id,
                existing.name()
            )));
        }
        *slot = Arc::downgrade(list);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Worker-side completion (crate-internal)
    // ------------------------------------------------------------------

    /// EXECUTING -> COMPLETED, if the job is still executing.
    pub(crate) fn finish_completed(&self) {
        self.finish_with(ExecutionPhase::Completed, None);
    }

    /// EXECUTING -> ABORTED, if the job is still executing.
    pub(crate) fn finish_aborted(&self) {
        self.finish_with(ExecutionPhase::Aborted, None);
    }

    /// EXECUTING -> ERROR with the given summary, if still executing.
    /// Returns false when another path already settled the job.
    pub(crate) fn finish_error(&self, summary: ErrorSummary) -> bool {
        self.finish_with(ExecutionPhase::Error, Some(summary))
    }

    fn finish_with(&self, target: ExecutionPhase, summary: Option<ErrorSummary>) -> bool {
        let change = {
            let mut st = self.lock_state();
            if st.phase != ExecutionPhase::Executing {
                return false;
            }
            if let Some(summary) = summary {
                st.error_summary = Some(summary);
            }
            match self.transition_locked(&mut st, target, false) {
                Ok(change) => change,
                Err(_) => None,
            }
        };
        self.after_transition(change);
        true
    }

    pub(crate) fn set_error_details_ref(&self, details_ref: String) {
        let mut st = self.lock_state();
        if let Some(summary) = &mut st.error_summary {
            summary.details_ref = Some(details_ref);
        }
    }

    pub(crate) fn mark_leaked(&self) {
        self.lock_state().leaked = true;
    }

    pub(crate) fn cancellation_token(&self) -> Option<CancellationToken> {
        self.lock_state().cancel.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("job_id", &self.job_id)
            .field("owner", &self.owner_id())
            .field("phase", &self.phase())
            .finish()
    }
}

fn as_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|seconds| *seconds >= 0)
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::parameters::PARAM_RUN_ID;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_job() -> Arc<Job> {
        Job::new(
            None,
            JobParameters::from_pairs([(PARAM_RUN_ID, json!("nightly"))]),
        )
    }

    #[test]
    fn new_job_starts_pending_with_generated_id() {
        let job = sample_job();
        assert_eq!(job.phase(), ExecutionPhase::Pending);
        assert!(!job.job_id().is_empty());
        assert_eq!(job.run_id().as_deref(), Some("nightly"));
        assert_eq!(job.execution_duration(), 0);
        assert!(job.start_time().is_none());
        assert!(job.end_time().is_none());
    }

    #[test]
    fn illegal_transition_leaves_phase_unchanged() {
        let job = sample_job();
        let err = job.set_phase(ExecutionPhase::Completed, false).unwrap_err();
        assert!(matches!(err, UwsError::IllegalPhaseTransition { .. }));
        assert_eq!(job.phase(), ExecutionPhase::Pending);
    }

    #[test]
    fn forced_transition_bypasses_the_table() {
        let job = sample_job();
        job.set_phase(ExecutionPhase::Completed, true).unwrap();
        assert_eq!(job.phase(), ExecutionPhase::Completed);
        assert!(job.end_time().is_some());
    }

    #[test]
    fn terminal_entry_sets_end_time_once() {
        let job = sample_job();
        job.set_phase(ExecutionPhase::Aborted, false).unwrap();
        let end = job.end_time().unwrap();
        job.set_phase(ExecutionPhase::Archived, false).unwrap();
        assert_eq!(job.end_time(), Some(end));
    }

    #[test]
    fn reset_to_pending_clears_timestamps() {
        let job = sample_job();
        job.set_phase(ExecutionPhase::Executing, true).unwrap();
        assert!(job.start_time().is_some());
        job.set_phase(ExecutionPhase::Pending, true).unwrap();
        assert!(job.start_time().is_none());
        assert!(job.end_time().is_none());
    }

    struct CountingObserver {
        seen: Mutex<Vec<(ExecutionPhase, ExecutionPhase)>>,
    }

    impl CountingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl JobObserver for CountingObserver {
        fn on_phase_change(
            &self,
            _job: &Job,
            old: ExecutionPhase,
            new: ExecutionPhase,
        ) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push((old, new));
            Ok(())
        }
    }

    #[test]
    fn observers_see_transitions_in_order() {
        let job = sample_job();
        let observer = CountingObserver::new();
        job.add_observer(observer.clone());

        job.set_phase(ExecutionPhase::Queued, false).unwrap();
        job.set_phase(ExecutionPhase::Executing, false).unwrap();
        job.set_phase(ExecutionPhase::Completed, false).unwrap();

        let seen = observer.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (ExecutionPhase::Pending, ExecutionPhase::Queued),
                (ExecutionPhase::Queued, ExecutionPhase::Executing),
                (ExecutionPhase::Executing, ExecutionPhase::Completed),
            ]
        );
    }

    #[test]
    fn self_transition_does_not_notify() {
        let job = sample_job();
        let observer = CountingObserver::new();
        job.add_observer(observer.clone());
        job.set_phase(ExecutionPhase::Pending, false).unwrap();
        assert!(observer.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_observer_does_not_affect_the_job() {
        struct FailingObserver(AtomicUsize);
        impl JobObserver for FailingObserver {
            fn on_phase_change(
                &self,
                _: &Job,
                _: ExecutionPhase,
                _: ExecutionPhase,
            ) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("observer exploded")
            }
        }

        let job = sample_job();
        let observer = Arc::new(FailingObserver(AtomicUsize::new(0)));
        job.add_observer(observer.clone());
        job.set_phase(ExecutionPhase::Queued, false).unwrap();
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert_eq!(job.phase(), ExecutionPhase::Queued);
    }

    #[test]
    fn remove_observer_stops_notifications() {
        let job = sample_job();
        let observer = CountingObserver::new();
        let as_dyn: Arc<dyn JobObserver> = observer.clone();
        job.add_observer(as_dyn.clone());
        job.remove_observer(&as_dyn);
        job.set_phase(ExecutionPhase::Queued, false).unwrap();
        assert!(observer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn parameters_are_frozen_after_pending() {
        let job = sample_job();
        job.set_parameter("x", json!(1)).await.unwrap();
        assert_eq!(job.parameter("x"), Some(json!(1)));

        job.set_phase(ExecutionPhase::Queued, false).unwrap();
        let err = job.set_parameter("x", json!(2)).await.unwrap_err();
        assert!(matches!(err, UwsError::BadRequest(_)));
        assert_eq!(job.parameter("x"), Some(json!(1)));
    }

    #[tokio::test]
    async fn setting_control_parameters_updates_job_fields() {
        let job = sample_job();
        job.set_parameter(PARAM_EXECUTION_DURATION, json!(120))
            .await
            .unwrap();
        assert_eq!(job.execution_duration(), 120);

        let deadline = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        job.set_parameter(PARAM_DESTRUCTION, json!(deadline))
            .await
            .unwrap();
        assert!(job.destruction_time().is_some());

        job.set_parameter(PARAM_RUN_ID, json!("relabeled"))
            .await
            .unwrap();
        assert_eq!(job.run_id().as_deref(), Some("relabeled"));
    }

    #[test]
    fn results_only_while_executing_and_unique() {
        let job = sample_job();
        let err = job.add_result(JobResult::new("r1")).unwrap_err();
        assert!(matches!(err, UwsError::BadRequest(_)));

        job.set_phase(ExecutionPhase::Executing, true).unwrap();
        job.add_result(JobResult::new("r1")).unwrap();
        let err = job.add_result(JobResult::new("r1")).unwrap_err();
        assert!(matches!(err, UwsError::BadRequest(_)));
        job.add_result(JobResult::new("r2")).unwrap();
        assert_eq!(job.results().len(), 2);
    }

    #[test]
    fn description_roundtrips_through_restore() {
        let job = sample_job();
        job.set_phase(ExecutionPhase::Executing, true).unwrap();
        job.add_result(JobResult::redirect("out", "http://example.org/out"))
            .unwrap();
        job.set_quote(Some(30));
        assert!(job.finish_error(ErrorSummary::new("boom", ErrorType::Transient)));

        let description = job.description();
        let json = serde_json::to_string(&description).unwrap();
        let parsed: JobDescription = serde_json::from_str(&json).unwrap();
        let restored = Job::restore(parsed, None);

        assert_eq!(restored.job_id(), job.job_id());
        assert_eq!(restored.phase(), ExecutionPhase::Error);
        assert_eq!(restored.quote(), Some(30));
        assert_eq!(restored.creation_time(), job.creation_time());
        assert_eq!(restored.start_time(), job.start_time());
        assert_eq!(restored.end_time(), job.end_time());
        assert_eq!(restored.results(), job.results());
        assert_eq!(restored.error_summary(), job.error_summary());
        assert_eq!(restored.run_id(), job.run_id());
    }

    #[test]
    fn finish_is_ignored_once_settled() {
        let job = sample_job();
        job.set_phase(ExecutionPhase::Executing, true).unwrap();
        job.finish_completed();
        assert!(!job.finish_error(ErrorSummary::new("late", ErrorType::Fatal)));
        assert_eq!(job.phase(), ExecutionPhase::Completed);
        assert!(job.error_summary().is_none());
    }
}
