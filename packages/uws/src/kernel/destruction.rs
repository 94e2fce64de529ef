//! Time-triggered job destruction.
//!
//! Every job in a list is destroyed at its destruction time. The
//! default manager keeps the pending jobs in a set sorted by
//! `(destruction_time, arrival)` and arms at most one abortable sleeper
//! task for the earliest deadline, re-arming whenever the head of the
//! set changes. Past-due jobs are destroyed immediately through the
//! owning list's destroy path, which applies the destruction policy.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::job::Job;
use super::joblist::JobList;

/// Reclamation authority for a job list.
#[async_trait]
pub trait DestructionManager: Send + Sync {
    /// Wire the manager to its owning list. Called once by the list.
    fn attach(&self, list: Weak<JobList>);

    /// Register a job or take note of its changed destruction time.
    /// Ignores jobs of other lists and jobs without a deadline; a
    /// past-due job is destroyed immediately.
    async fn update(&self, job: &Arc<Job>);

    /// Forget a job; re-arms the timer if that job was its target.
    async fn remove(&self, job: &Job);

    /// Re-evaluate the timer against the sorted set, destroying any
    /// past-due jobs on the way.
    async fn refresh(&self);

    /// Cancel the timer and go idle. The next `update` or `refresh`
    /// reactivates the manager.
    async fn stop(&self);

    /// Deadline the armed timer will fire at, if any.
    fn next_destruction(&self) -> Option<DateTime<Utc>>;
}

struct ArmedTimer {
    job: Arc<Job>,
    deadline: DateTime<Utc>,
    handle: AbortHandle,
}

type SortKey = (DateTime<Utc>, u64);

struct DestructionState {
    /// Jobs awaiting destruction, earliest deadline first; ties broken
    /// by arrival into the manager.
    entries: BTreeMap<SortKey, Arc<Job>>,
    index: HashMap<String, SortKey>,
    seq: u64,
    armed: Option<ArmedTimer>,
}

/// Default deadline scheduler: sorted set plus one abortable sleeper.
pub struct DefaultDestructionManager {
    me: Weak<DefaultDestructionManager>,
    list: RwLock<Weak<JobList>>,
    state: Mutex<DestructionState>,
}

impl DefaultDestructionManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            list: RwLock::new(Weak::new()),
            state: Mutex::new(DestructionState {
                entries: BTreeMap::new(),
                index: HashMap::new(),
                seq: 0,
                armed: None,
            }),
        })
    }

    fn owning_list(&self) -> Option<Arc<JobList>> {
        self.list.read().unwrap_or_else(|e| e.into_inner()).upgrade()
    }

    fn lock_state(&self) -> MutexGuard<'_, DestructionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert_locked(st: &mut DestructionState, job: Arc<Job>, deadline: DateTime<Utc>) {
        let key = (deadline, st.seq);
        st.seq += 1;
        st.index.insert(job.job_id().to_string(), key);
        st.entries.insert(key, job);
    }

    fn spawn_timer(&self, deadline: DateTime<Utc>) -> AbortHandle {
        let me = self.me.clone();
        tokio::spawn(async move {
            let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            if let Some(manager) = me.upgrade() {
                manager.on_timer().await;
            }
        })
        .abort_handle()
    }

    async fn on_timer(&self) {
        let fired = self.lock_state().armed.take();
        if let Some(armed) = fired {
            debug!(job_id = %armed.job.job_id(), "destruction deadline reached");
            self.destroy_one(armed.job).await;
        }
        self.refresh().await;
    }

    async fn destroy_one(&self, job: Arc<Job>) {
        let Some(list) = self.owning_list() else {
            return;
        };
        if let Err(error) = list.destroy_job(job.job_id(), None).await {
            warn!(
                job_id = %job.job_id(),
                error = %error,
                "failed to destroy job at its destruction time"
            );
        }
    }
}

#[async_trait]
impl DestructionManager for DefaultDestructionManager {
    fn attach(&self, list: Weak<JobList>) {
        *self.list.write().unwrap_or_else(|e| e.into_inner()) = list;
    }

    async fn update(&self, job: &Arc<Job>) {
        let Some(list) = self.owning_list() else {
            return;
        };
        match job.job_list() {
            Some(job_list) if Arc::ptr_eq(&list, &job_list) => {}
            _ => return,
        }
        let Some(deadline) = job.destruction_time() else {
            return;
        };

        if deadline <= Utc::now() {
            self.destroy_one(job.clone()).await;
            return;
        }

        {
            let mut st = self.lock_state();
            // Already armed for exactly this deadline; nothing to do.
            if st
                .armed
                .as_ref()
                .is_some_and(|armed| armed.job.job_id() == job.job_id() && armed.deadline == deadline)
            {
                return;
            }
            if let Some(key) = st.index.remove(job.job_id()) {
                st.entries.remove(&key);
            }
            Self::insert_locked(&mut st, job.clone(), deadline);
        }
        self.refresh().await;
    }

    async fn remove(&self, job: &Job) {
        let disarmed = {
            let mut st = self.lock_state();
            if let Some(key) = st.index.remove(job.job_id()) {
                st.entries.remove(&key);
            }
            if st
                .armed
                .as_ref()
                .is_some_and(|armed| armed.job.job_id() == job.job_id())
            {
                let armed = st.armed.take().expect("armed checked above");
                armed.handle.abort();
                true
            } else {
                false
            }
        };
        if disarmed {
            self.refresh().await;
        }
    }

    async fn refresh(&self) {
        let mut due: Vec<Arc<Job>> = Vec::new();
        {
            let mut st = self.lock_state();
            let now = Utc::now();

            let stale = match &st.armed {
                Some(armed) => {
                    armed.deadline <= now
                        || armed.job.destruction_time() != Some(armed.deadline)
                        || st
                            .entries
                            .keys()
                            .next()
                            .is_some_and(|(head, _)| *head < armed.deadline)
                }
                None => false,
            };
            if stale {
                let armed = st.armed.take().expect("armed checked above");
                armed.handle.abort();
                if let Some(deadline) = armed.job.destruction_time() {
                    if !st.index.contains_key(armed.job.job_id()) {
                        Self::insert_locked(&mut st, armed.job, deadline);
                    }
                }
            }

            if st.armed.is_none() {
                while let Some(((deadline, _seq), job)) = st.entries.pop_first() {
                    st.index.remove(job.job_id());
                    if deadline <= now {
                        due.push(job);
                    } else {
                        let handle = self.spawn_timer(deadline);
                        st.armed = Some(ArmedTimer {
                            job,
                            deadline,
                            handle,
                        });
                        break;
                    }
                }
            }
        }

        for job in due {
            self.destroy_one(job).await;
        }
    }

    async fn stop(&self) {
        let mut st = self.lock_state();
        if let Some(armed) = st.armed.take() {
            armed.handle.abort();
            // The head goes back into the set so a later refresh can
            // re-arm for it.
            if let Some(deadline) = armed.job.destruction_time() {
                if !st.index.contains_key(armed.job.job_id()) {
                    Self::insert_locked(&mut st, armed.job, deadline);
                }
            }
        }
    }

    fn next_destruction(&self) -> Option<DateTime<Utc>> {
        let st = self.lock_state();
        match &st.armed {
            Some(armed) => Some(armed.deadline),
            None => st.entries.keys().next().map(|(deadline, _)| *deadline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::parameters::JobParameters;
    use chrono::Duration;

    #[tokio::test]
    async fn detached_manager_ignores_updates() {
        let manager = DefaultDestructionManager::new();
        let job = Job::new(None, JobParameters::new());
        manager.update(&job).await;
        assert!(manager.next_destruction().is_none());
    }

    #[tokio::test]
    async fn stop_disarms_but_keeps_the_set() {
        // A manager without a list never arms, so drive the state
        // directly through the sorted set.
        let manager = DefaultDestructionManager::new();
        let job = Job::new(None, JobParameters::new());
        let deadline = Utc::now() + Duration::hours(1);
        {
            let mut st = manager.lock_state();
            DefaultDestructionManager::insert_locked(&mut st, job.clone(), deadline);
        }
        assert_eq!(manager.next_destruction(), Some(deadline));

        manager.stop().await;
        assert_eq!(manager.next_destruction(), Some(deadline));
    }

    #[tokio::test]
    async fn ties_are_broken_by_arrival_order() {
        let manager = DefaultDestructionManager::new();
        let deadline = Utc::now() + Duration::hours(1);
        let first = Job::new(None, JobParameters::new());
        let second = Job::new(None, JobParameters::new());
        {
            let mut st = manager.lock_state();
            DefaultDestructionManager::insert_locked(&mut st, first.clone(), deadline);
            DefaultDestructionManager::insert_locked(&mut st, second.clone(), deadline);
        }
        let st = manager.lock_state();
        let ids: Vec<&str> = st.entries.values().map(|job| job.job_id()).collect();
        assert_eq!(ids, vec![first.job_id(), second.job_id()]);
    }
}
