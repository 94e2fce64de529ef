//! Service configuration.
//!
//! Two layers, following the usual split: [`Config`] reads the process
//! environment (port, path of the service description), while
//! [`UwsConfig`] is the structured service description (JSON) naming the
//! job lists, their limits, and the backup policy. Duration values
//! accept the unit suffixes of [`crate::common::units`].
//!
//! Job work cannot be named in a config file the way a class reference
//! would be; instead the embedding application registers its
//! [`JobTask`] implementations in a [`TaskRegistry`] and the config
//! refers to them by name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;

use crate::common::units;
use crate::kernel::{
    BackupFrequency, BackupManager, ControllerMap, DestructionPolicy, FileManager, JobList,
    JobListSpec, JobTask, JsonBackupManager, LocalFileManager, ParameterController, UwsError,
    UwsResult, UwsService, UwsServiceSpec,
};
use crate::kernel::parameters::{
    DestructionTimeController, ExecutionDurationController, PARAM_DESTRUCTION,
    PARAM_EXECUTION_DURATION,
};

/// Registered job work, keyed by the name config files refer to.
pub type TaskRegistry = HashMap<String, Arc<dyn JobTask>>;

/// Process-level configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Path of the JSON service description; `None` runs the built-in
    /// demo service.
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            config_path: env::var("UWS_CONFIG").ok().map(PathBuf::from),
        })
    }
}

/// Structured description of a UWS service.
#[derive(Debug, Clone, Deserialize)]
pub struct UwsConfig {
    pub service_name: String,
    #[serde(default)]
    pub service_description: Option<String>,
    #[serde(default = "default_file_root")]
    pub file_root_path: PathBuf,
    #[serde(default)]
    pub directory_per_user: bool,
    #[serde(default)]
    pub group_user_directories: bool,
    /// `never`, `user_action`, or a duration like `30s`; absent means
    /// no backup at all.
    #[serde(default)]
    pub backup_frequency: Option<String>,
    #[serde(default)]
    pub backup_by_user: bool,
    #[serde(default)]
    pub backup_root_path: Option<PathBuf>,
    #[serde(default)]
    pub joblists: Vec<JobListConfig>,
}

/// Per-job-list block of the service description.
#[derive(Debug, Clone, Deserialize)]
pub struct JobListConfig {
    pub name: String,
    /// Name of the registered job task; defaults to the list name.
    #[serde(default)]
    pub job_task: Option<String>,
    /// 0 means unbounded.
    #[serde(default)]
    pub max_running_jobs: usize,
    #[serde(default)]
    pub default_execution_duration: Option<String>,
    #[serde(default)]
    pub max_execution_duration: Option<String>,
    #[serde(default)]
    pub default_destruction_interval: Option<String>,
    #[serde(default)]
    pub max_destruction_interval: Option<String>,
    #[serde(default)]
    pub destruction_policy: DestructionPolicy,
}

fn default_file_root() -> PathBuf {
    PathBuf::from("./uws-files")
}

impl UwsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let payload = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&payload)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// A single-list demo service backed by the `sleep` task.
    pub fn demo() -> Self {
        Self {
            service_name: "uws".to_string(),
            service_description: Some("demo UWS service".to_string()),
            file_root_path: default_file_root(),
            directory_per_user: false,
            group_user_directories: false,
            backup_frequency: None,
            backup_by_user: false,
            backup_root_path: None,
            joblists: vec![JobListConfig {
                name: "jobs".to_string(),
                job_task: Some("sleep".to_string()),
                max_running_jobs: 2,
                default_execution_duration: Some("10m".to_string()),
                max_execution_duration: Some("1h".to_string()),
                default_destruction_interval: Some("1W".to_string()),
                max_destruction_interval: Some("4W".to_string()),
                destruction_policy: DestructionPolicy::AlwaysDelete,
            }],
        }
    }

    /// Wire a service from this description and the registered tasks.
    pub async fn build_service(&self, tasks: &TaskRegistry) -> UwsResult<Arc<UwsService>> {
        let mut file_manager = LocalFileManager::new(&self.file_root_path);
        if self.directory_per_user {
            file_manager = file_manager.directory_per_user();
        }
        if self.group_user_directories {
            file_manager = file_manager.group_user_directories();
        }

        let backup: Option<Arc<dyn BackupManager>> = match &self.backup_frequency {
            None => None,
            Some(frequency) => {
                let frequency = parse_backup_frequency(frequency)?;
                let root = self
                    .backup_root_path
                    .clone()
                    .unwrap_or_else(|| self.file_root_path.join("backup"));
                let mut manager = JsonBackupManager::new(root, frequency);
                if self.backup_by_user {
                    manager = manager.per_owner();
                }
                Some(Arc::new(manager))
            }
        };

        let spec = UwsServiceSpec::builder()
            .name(self.service_name.clone())
            .file_manager(Arc::new(file_manager) as Arc<dyn FileManager>);
        let service = match (&self.service_description, backup) {
            (Some(description), Some(backup)) => UwsService::create(
                spec.description(description.clone()).backup(backup).build(),
            ),
            (Some(description), None) => {
                UwsService::create(spec.description(description.clone()).build())
            }
            (None, Some(backup)) => UwsService::create(spec.backup(backup).build()),
            (None, None) => UwsService::create(spec.build()),
        };

        for list_config in &self.joblists {
            let list = build_job_list(list_config, tasks)?;
            service.add_job_list(list).await?;
        }
        Ok(service)
    }
}

fn build_job_list(config: &JobListConfig, tasks: &TaskRegistry) -> UwsResult<Arc<JobList>> {
    let task_name = config.job_task.as_deref().unwrap_or(&config.name);
    let task = tasks
        .get(task_name)
        .cloned()
        .ok_or_else(|| {
            UwsError::BadRequest(format!(
                "no job task registered under the name '{}'",
                task_name
            ))
        })?;

    let mut controllers = ControllerMap::new();

    let default_exec = parse_optional_seconds(config.default_execution_duration.as_deref())?;
    let max_exec = parse_optional_seconds(config.max_execution_duration.as_deref())?;
    if default_exec.is_some() || max_exec.is_some() {
        controllers.insert(
            PARAM_EXECUTION_DURATION.to_string(),
            ParameterController::ExecutionDuration(ExecutionDurationController::new(
                default_exec.unwrap_or(0),
                max_exec.unwrap_or(0),
            )),
        );
    }

    let default_destruction = parse_optional_ms(config.default_destruction_interval.as_deref())?;
    let max_destruction = parse_optional_ms(config.max_destruction_interval.as_deref())?;
    if let Some(default_interval) = default_destruction {
        controllers.insert(
            PARAM_DESTRUCTION.to_string(),
            ParameterController::DestructionTime(DestructionTimeController::new(
                chrono::Duration::milliseconds(default_interval),
                max_destruction.map(chrono::Duration::milliseconds),
            )),
        );
    }

    JobList::create(
        JobListSpec::builder()
            .name(config.name.clone())
            .task(task)
            .controllers(controllers)
            .max_running(config.max_running_jobs)
            .destruction_policy(config.destruction_policy)
            .build(),
    )
}

fn parse_optional_ms(value: Option<&str>) -> UwsResult<Option<i64>> {
    match value {
        None => Ok(None),
        Some(text) => units::parse_duration_ms(text)
            .map(Some)
            .map_err(|error| UwsError::BadRequest(error.to_string())),
    }
}

fn parse_optional_seconds(value: Option<&str>) -> UwsResult<Option<i64>> {
    Ok(parse_optional_ms(value)?.map(|ms| ms / 1000))
}

/// `never`, `user_action`, or a duration expression (e.g. `30s`,
/// `60000`).
pub fn parse_backup_frequency(value: &str) -> UwsResult<BackupFrequency> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("never") {
        return Ok(BackupFrequency::Never);
    }
    if trimmed.eq_ignore_ascii_case("user_action") {
        return Ok(BackupFrequency::AtUserAction);
    }
    let ms = units::parse_duration_ms(trimmed)
        .map_err(|error| UwsError::BadRequest(format!("invalid backup frequency: {}", error)))?;
    Ok(BackupFrequency::Every(StdDuration::from_millis(ms as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_frequency_parses_all_forms() {
        assert_eq!(
            parse_backup_frequency("never").unwrap(),
            BackupFrequency::Never
        );
        assert_eq!(
            parse_backup_frequency("USER_ACTION").unwrap(),
            BackupFrequency::AtUserAction
        );
        assert_eq!(
            parse_backup_frequency("30s").unwrap(),
            BackupFrequency::Every(StdDuration::from_secs(30))
        );
        assert_eq!(
            parse_backup_frequency("60000").unwrap(),
            BackupFrequency::Every(StdDuration::from_secs(60))
        );
        assert!(parse_backup_frequency("sometimes").is_err());
    }

    #[test]
    fn config_parses_from_json() {
        let json = r#"{
            "service_name": "tap",
            "file_root_path": "/var/lib/uws",
            "backup_frequency": "user_action",
            "backup_by_user": true,
            "joblists": [
                {
                    "name": "async-queries",
                    "job_task": "query",
                    "max_running_jobs": 4,
                    "default_execution_duration": "10m",
                    "max_execution_duration": "2h",
                    "default_destruction_interval": "1W",
                    "max_destruction_interval": "1M",
                    "destruction_policy": "archive_on_date"
                }
            ]
        }"#;
        let config: UwsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.service_name, "tap");
        assert_eq!(config.joblists.len(), 1);
        let list = &config.joblists[0];
        assert_eq!(list.max_running_jobs, 4);
        assert_eq!(list.destruction_policy, DestructionPolicy::ArchiveOnDate);
    }

    #[tokio::test]
    async fn build_service_requires_registered_tasks() {
        let config = UwsConfig::demo();
        let tasks = TaskRegistry::new();
        let err = config.build_service(&tasks).await.unwrap_err();
        assert!(matches!(err, UwsError::BadRequest(_)));
    }
}
