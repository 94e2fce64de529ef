//! Local-disk file manager.
//!
//! Stores each job's files under its own directory. With
//! `directory_per_user` the job directory nests under a hashed owner
//! directory, and `group_user_directories` adds one more level keyed by
//! the first character of the hash, keeping any single directory small.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::backup::owner_hash;
use super::error::{UwsError, UwsResult};
use super::job::Job;
use super::traits::FileManager;

const ERROR_DETAILS_FILE: &str = "error.log";

/// File manager writing under a root directory on the local disk.
pub struct LocalFileManager {
    root: PathBuf,
    directory_per_user: bool,
    group_user_directories: bool,
}

impl LocalFileManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            directory_per_user: false,
            group_user_directories: false,
        }
    }

    /// Nest each job under a per-owner directory.
    pub fn directory_per_user(mut self) -> Self {
        self.directory_per_user = true;
        self
    }

    /// Insert an alphabetic grouping level above the owner directories.
    pub fn group_user_directories(mut self) -> Self {
        self.group_user_directories = true;
        self
    }

    fn job_dir(&self, job: &Job) -> PathBuf {
        let mut path = self.root.clone();
        if self.directory_per_user {
            let owner_dir = owner_hash(job.owner_id());
            if self.group_user_directories {
                let prefix = owner_dir.chars().next().unwrap_or('_');
                path.push(prefix.to_string());
            }
            path.push(owner_dir);
        }
        path.push(job.job_id());
        path
    }

    fn result_path(&self, job: &Job, result_id: &str) -> PathBuf {
        self.job_dir(job).join(format!("result-{}", sanitize(result_id)))
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl FileManager for LocalFileManager {
    async fn result_writer(
        &self,
        job: &Job,
        result_id: &str,
    ) -> UwsResult<Box<dyn AsyncWrite + Send + Unpin>> {
        let path = self.result_path(job, result_id);
        let dir = path.parent().expect("result path always has a parent");
        fs::create_dir_all(dir)
            .await
            .context("failed to create the job directory")?;
        let file = fs::File::create(&path)
            .await
            .context("failed to create the result file")?;
        Ok(Box::new(file))
    }

    async fn result_reader(
        &self,
        job: &Job,
        result_id: &str,
    ) -> UwsResult<Box<dyn AsyncRead + Send + Unpin>> {
        let path = self.result_path(job, result_id);
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(UwsError::ResultNotFound {
                    job: job.job_id().to_string(),
                    result: result_id.to_string(),
                })
            }
            Err(error) => Err(UwsError::Internal(
                anyhow::Error::from(error).context("failed to open the result file"),
            )),
        }
    }

    async fn result_size(&self, job: &Job, result_id: &str) -> UwsResult<u64> {
        let path = self.result_path(job, result_id);
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(UwsError::ResultNotFound {
                    job: job.job_id().to_string(),
                    result: result_id.to_string(),
                })
            }
            Err(error) => Err(UwsError::Internal(
                anyhow::Error::from(error).context("failed to stat the result file"),
            )),
        }
    }

    async fn write_error_details(&self, job: &Job, details: &str) -> UwsResult<String> {
        let dir = self.job_dir(job);
        fs::create_dir_all(&dir)
            .await
            .context("failed to create the job directory")?;
        let mut file = fs::File::create(dir.join(ERROR_DETAILS_FILE))
            .await
            .context("failed to create the error details file")?;
        file.write_all(details.as_bytes())
            .await
            .context("failed to write the error details")?;
        file.flush()
            .await
            .context("failed to flush the error details")?;
        Ok(ERROR_DETAILS_FILE.to_string())
    }

    async fn read_error_details(&self, job: &Job, _details_ref: &str) -> UwsResult<String> {
        let path = self.job_dir(job).join(ERROR_DETAILS_FILE);
        match fs::read_to_string(&path).await {
            Ok(details) => Ok(details),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Err(
                UwsError::JobNotFound(format!("{} (error details)", job.job_id())),
            ),
            Err(error) => Err(UwsError::Internal(
                anyhow::Error::from(error).context("failed to read the error details"),
            )),
        }
    }

    async fn delete_job_files(&self, job: &Job) -> UwsResult<()> {
        match fs::remove_dir_all(self.job_dir(job)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(UwsError::Internal(
                anyhow::Error::from(error).context("failed to delete the job files"),
            )),
        }
    }
}
