//! Root container of job lists.
//!
//! The service owns the shared infrastructure every list consumes: the
//! file manager, the user identifier, and the optional backup manager.
//! `start` restores a backup (preserving saved phases) and arms the
//! periodic backup task; `stop` shuts down every list's managers and
//! flushes a final backup.

use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use super::backup::{BackupFrequency, BackupManager, RestoredJob};
use super::destruction::DestructionManager;
use super::error::{UwsError, UwsResult};
use super::execution::ExecutionManager;
use super::job::Job;
use super::joblist::JobList;
use super::traits::{
    DefaultJobOwner, FileManager, JobOwnerRef, NoAuthIdentifier, UserIdentifier,
};

/// Construction options for a service.
#[derive(TypedBuilder)]
pub struct UwsServiceSpec {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default, setter(strip_option, into))]
    pub description: Option<String>,
    pub file_manager: Arc<dyn FileManager>,
    #[builder(default = Arc::new(NoAuthIdentifier))]
    pub user_identifier: Arc<dyn UserIdentifier>,
    #[builder(default, setter(strip_option))]
    pub backup: Option<Arc<dyn BackupManager>>,
}

/// A named UWS service: job lists plus their shared collaborators.
pub struct UwsService {
    name: String,
    description: Option<String>,
    file_manager: Arc<dyn FileManager>,
    user_identifier: Arc<dyn UserIdentifier>,
    backup: Option<Arc<dyn BackupManager>>,
    lists: RwLock<IndexMap<String, Arc<JobList>>>,
    backup_timer: Mutex<Option<AbortHandle>>,
    me: Weak<UwsService>,
}

impl UwsService {
    pub fn create(spec: UwsServiceSpec) -> Arc<Self> {
        let service = Arc::new_cyclic(|me| Self {
            name: spec.name,
            description: spec.description,
            file_manager: spec.file_manager,
            user_identifier: spec.user_identifier,
            backup: spec.backup,
            lists: RwLock::new(IndexMap::new()),
            backup_timer: Mutex::new(None),
            me: me.clone(),
        });
        if let Some(backup) = &service.backup {
            backup.attach(service.me.clone());
        }
        service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn file_manager(&self) -> Arc<dyn FileManager> {
        self.file_manager.clone()
    }

    pub fn user_identifier(&self) -> Arc<dyn UserIdentifier> {
        self.user_identifier.clone()
    }

    pub fn backup_manager(&self) -> Option<Arc<dyn BackupManager>> {
        self.backup.clone()
    }

    /// Register a job list and wire its service backref.
    pub async fn add_job_list(&self, list: Arc<JobList>) -> UwsResult<()> {
        list.set_service(self.me.clone()).await?;
        let mut lists = self.lists.write().await;
        if lists.contains_key(list.name()) {
            return Err(UwsError::BadRequest(format!(
                "job list '{}' already exists in service '{}'",
                list.name(),
                self.name
            )));
        }
        lists.insert(list.name().to_string(), list);
        Ok(())
    }

    pub async fn job_list(&self, name: &str) -> UwsResult<Arc<JobList>> {
        self.lists
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| UwsError::ListNotFound(name.to_string()))
    }

    pub async fn job_lists(&self) -> Vec<Arc<JobList>> {
        self.lists.read().await.values().cloned().collect()
    }

    /// Restore the backup (if any) and arm the periodic backup task.
    pub async fn start(&self) -> UwsResult<()> {
        let Some(backup) = self.backup.clone() else {
            return Ok(());
        };

        match backup.restore_all().await {
            Ok(restored) => {
                let total = restored.len();
                let mut ok = 0usize;
                for record in restored {
                    match self.restore_record(record).await {
                        Ok(()) => ok += 1,
                        Err(error) => warn!(error = %error, "failed to restore a job"),
                    }
                }
                if total > 0 {
                    info!(restored = ok, total, service = %self.name, "backup restored");
                }
            }
            Err(error) => warn!(error = %error, "failed to read the backup"),
        }

        if let BackupFrequency::Every(period) = backup.frequency() {
            let weak = self.me.clone();
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // skip the immediate tick
                loop {
                    interval.tick().await;
                    let Some(service) = weak.upgrade() else { break };
                    let Some(backup) = service.backup.clone() else { break };
                    if let Err(error) = backup.save_all().await {
                        warn!(error = %error, "periodic backup failed");
                    }
                }
            })
            .abort_handle();
            *self
                .backup_timer
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        Ok(())
    }

    async fn restore_record(&self, record: RestoredJob) -> UwsResult<()> {
        let list = self.job_list(&record.list).await?;
        let owner: Option<JobOwnerRef> = record.owner_id.map(|id| {
            let owner = match record.owner_pseudonym {
                Some(pseudonym) => DefaultJobOwner::with_pseudonym(id, pseudonym),
                None => DefaultJobOwner::new(id),
            };
            Arc::new(owner) as JobOwnerRef
        });
        let job = Job::restore(record.description, owner);
        list.restore_job(job).await
    }

    /// Stop every list's managers and flush the backup.
    pub async fn stop(&self) {
        if let Some(handle) = self
            .backup_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        for list in self.job_lists().await {
            list.execution_manager().stop_all().await;
            list.destruction_manager().stop().await;
        }

        if let Some(backup) = &self.backup {
            match backup.save_all().await {
                Ok(saved) => info!(saved, service = %self.name, "backup flushed"),
                Err(error) => warn!(error = %error, "final backup failed"),
            }
        }
    }

    /// Called by lists on every user-visible job change; drives the
    /// AT_USER_ACTION backup frequency.
    pub(crate) fn notify_job_change(&self, owner_id: Option<&str>) {
        let Some(backup) = self.backup.clone() else {
            return;
        };
        if backup.frequency() != BackupFrequency::AtUserAction {
            return;
        }
        let owner_id = owner_id.map(str::to_string);
        tokio::spawn(async move {
            let result = match owner_id {
                Some(id) => backup.save_owner(&id).await,
                None => backup.save_all().await,
            };
            if let Err(error) = result {
                warn!(error = %error, "backup after user action failed");
            }
        });
    }
}

impl std::fmt::Debug for UwsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UwsService").field("name", &self.name).finish()
    }
}
