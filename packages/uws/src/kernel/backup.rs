//! Job backup and restoration.
//!
//! The [`BackupManager`] contract serializes jobs so a restarted service
//! can restore them with their phases, results, and timestamps intact.
//! Observers and live worker state are never serialized.
//!
//! [`JsonBackupManager`] is the shipped implementation: one global JSON
//! file, or one directory per owner (a manifest plus one file per job).

use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::warn;

use super::error::{UwsError, UwsResult};
use super::job::JobDescription;
use super::service::UwsService;

/// How often jobs are saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFrequency {
    Never,
    /// After every user-visible job change.
    AtUserAction,
    /// Periodically.
    Every(Duration),
}

/// One job as read back from a backup.
#[derive(Debug, Clone)]
pub struct RestoredJob {
    pub list: String,
    pub owner_id: Option<String>,
    pub owner_pseudonym: Option<String>,
    pub description: JobDescription,
}

/// Optional persistence for jobs and owners.
#[async_trait]
pub trait BackupManager: Send + Sync {
    /// Wire the manager to the service it snapshots. Called once by
    /// [`UwsService::create`]; managers that do not need the service
    /// may ignore it.
    fn attach(&self, _service: Weak<UwsService>) {}

    fn frequency(&self) -> BackupFrequency;

    /// Save every job of every list. Returns the number of jobs saved.
    async fn save_all(&self) -> UwsResult<usize>;

    /// Save the jobs of one owner. Returns the number of jobs saved.
    async fn save_owner(&self, owner_id: &str) -> UwsResult<usize>;

    /// Read the whole backup back.
    async fn restore_all(&self) -> UwsResult<Vec<RestoredJob>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupEntry {
    list: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner_pseudonym: Option<String>,
    job: JobDescription,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    saved_at: DateTime<Utc>,
    jobs: Vec<BackupEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OwnerManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pseudonym: Option<String>,
}

const GLOBAL_BACKUP_FILE: &str = "jobs.backup";
const OWNER_MANIFEST_FILE: &str = "owner.json";

/// JSON-file backup, global or one directory per owner.
pub struct JsonBackupManager {
    root: PathBuf,
    by_user: bool,
    frequency: BackupFrequency,
    service: RwLock<Weak<UwsService>>,
}

impl JsonBackupManager {
    pub fn new(root: impl Into<PathBuf>, frequency: BackupFrequency) -> Self {
        Self {
            root: root.into(),
            by_user: false,
            frequency,
            service: RwLock::new(Weak::new()),
        }
    }

    /// Switch to the one-directory-per-owner layout.
    pub fn per_owner(mut self) -> Self {
        self.by_user = true;
        self
    }

    fn service(&self) -> Option<Arc<UwsService>> {
        self.service
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    async fn snapshot(&self) -> Vec<BackupEntry> {
        let Some(service) = self.service() else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for list in service.job_lists().await {
            for job in list.get_jobs().await {
                entries.push(BackupEntry {
                    list: list.name().to_string(),
                    owner_id: job.owner_id().map(str::to_string),
                    owner_pseudonym: job
                        .owner()
                        .and_then(|owner| owner.pseudonym())
                        .map(str::to_string),
                    job: job.description(),
                });
            }
        }
        entries
    }

    fn owner_dir(&self, owner_id: Option<&str>) -> PathBuf {
        self.root.join(owner_hash(owner_id))
    }

    async fn save_global(&self, entries: Vec<BackupEntry>) -> UwsResult<usize> {
        let count = entries.len();
        let file = BackupFile {
            saved_at: Utc::now(),
            jobs: entries,
        };
        let payload =
            serde_json::to_vec_pretty(&file).context("failed to serialize the backup")?;
        fs::create_dir_all(&self.root)
            .await
            .context("failed to create the backup directory")?;
        fs::write(self.root.join(GLOBAL_BACKUP_FILE), payload)
            .await
            .context("failed to write the backup file")?;
        Ok(count)
    }

    async fn save_owner_entries(
        &self,
        owner_id: Option<&str>,
        entries: &[BackupEntry],
    ) -> UwsResult<usize> {
        let dir = self.owner_dir(owner_id);
        // Rewrite the owner directory from scratch so destroyed jobs
        // do not resurrect on restore.
        if let Err(error) = fs::remove_dir_all(&dir).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                return Err(UwsError::Internal(
                    anyhow::Error::from(error).context("failed to reset the owner backup"),
                ));
            }
        }
        fs::create_dir_all(&dir)
            .await
            .context("failed to create the owner backup directory")?;

        let manifest = OwnerManifest {
            owner_id: owner_id.map(str::to_string),
            pseudonym: entries
                .iter()
                .find_map(|entry| entry.owner_pseudonym.clone()),
        };
        let manifest_payload =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize the manifest")?;
        fs::write(dir.join(OWNER_MANIFEST_FILE), manifest_payload)
            .await
            .context("failed to write the owner manifest")?;

        for entry in entries {
            let payload =
                serde_json::to_vec_pretty(entry).context("failed to serialize a job")?;
            fs::write(dir.join(format!("{}.json", entry.job.job_id)), payload)
                .await
                .context("failed to write a job backup")?;
        }
        Ok(entries.len())
    }

    async fn restore_global(&self) -> UwsResult<Vec<RestoredJob>> {
        let path = self.root.join(GLOBAL_BACKUP_FILE);
        let payload = match fs::read(&path).await {
            Ok(payload) => payload,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(UwsError::Internal(
                    anyhow::Error::from(error).context("failed to read the backup file"),
                ))
            }
        };
        let file: BackupFile =
            serde_json::from_slice(&payload).context("failed to parse the backup file")?;
        Ok(file.jobs.into_iter().map(into_restored).collect())
    }

    async fn restore_per_owner(&self) -> UwsResult<Vec<RestoredJob>> {
        let mut restored = Vec::new();
        let mut dirs = match fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(restored),
            Err(error) => {
                return Err(UwsError::Internal(
                    anyhow::Error::from(error).context("failed to list the backup directory"),
                ))
            }
        };

        while let Some(dir) = dirs
            .next_entry()
            .await
            .context("failed to walk the backup directory")?
        {
            if !dir
                .file_type()
                .await
                .context("failed to stat a backup entry")?
                .is_dir()
            {
                continue;
            }
            let mut files = fs::read_dir(dir.path())
                .await
                .context("failed to list an owner backup")?;
            while let Some(file) = files
                .next_entry()
                .await
                .context("failed to walk an owner backup")?
            {
                if file.file_name() == OWNER_MANIFEST_FILE {
                    continue;
                }
                if file.path().extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let payload = fs::read(file.path())
                    .await
                    .context("failed to read a job backup")?;
                match serde_json::from_slice::<BackupEntry>(&payload) {
                    Ok(entry) => restored.push(into_restored(entry)),
                    Err(error) => {
                        warn!(path = %file.path().display(), error = %error, "skipping unreadable job backup")
                    }
                }
            }
        }
        Ok(restored)
    }
}

fn into_restored(entry: BackupEntry) -> RestoredJob {
    RestoredJob {
        list: entry.list,
        owner_id: entry.owner_id,
        owner_pseudonym: entry.owner_pseudonym,
        description: entry.job,
    }
}

/// Directory name of an owner: a truncated digest of the id, so ids
/// with path-hostile characters stay safe.
pub(crate) fn owner_hash(owner_id: Option<&str>) -> String {
    match owner_id {
        None => "anonymous".to_string(),
        Some(id) => {
            let digest = Sha256::digest(id.as_bytes());
            let hex: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();
            hex[..16].to_string()
        }
    }
}

#[async_trait]
impl BackupManager for JsonBackupManager {
    fn attach(&self, service: Weak<UwsService>) {
        *self.service.write().unwrap_or_else(|e| e.into_inner()) = service;
    }

    fn frequency(&self) -> BackupFrequency {
        self.frequency
    }

    async fn save_all(&self) -> UwsResult<usize> {
        let entries = self.snapshot().await;
        if self.by_user {
            let mut saved = 0;
            let mut owners: Vec<Option<String>> = entries
                .iter()
                .map(|entry| entry.owner_id.clone())
                .collect();
            owners.sort();
            owners.dedup();
            for owner in owners {
                let owned: Vec<BackupEntry> = entries
                    .iter()
                    .filter(|entry| entry.owner_id == owner)
                    .cloned()
                    .collect();
                saved += self.save_owner_entries(owner.as_deref(), &owned).await?;
            }
            Ok(saved)
        } else {
            self.save_global(entries).await
        }
    }

    async fn save_owner(&self, owner_id: &str) -> UwsResult<usize> {
        if !self.by_user {
            return self.save_all().await;
        }
        let entries: Vec<BackupEntry> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|entry| entry.owner_id.as_deref() == Some(owner_id))
            .collect();
        self.save_owner_entries(Some(owner_id), &entries).await
    }

    async fn restore_all(&self) -> UwsResult<Vec<RestoredJob>> {
        if self.by_user {
            self.restore_per_owner().await
        } else {
            self.restore_global().await
        }
    }
}
