#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod mem;
mod tables;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use tuner_core::dataset_key::ImageKeyParseError;
use tuner_core::types::{
    Dataset, DatasetId, DatasetImage, JobStatus, OwnerId, RemoteJobId, TrainingJob,
    TrainingJobId,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not authenticated")]
    Unauthenticated,
    /// Also returned when the record exists but belongs to another owner.
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid dataset key: {0}")]
    InvalidKey(#[from] ImageKeyParseError),
    #[error("dataset {dataset} already holds the maximum of {limit} {kind}")]
    LimitExceeded {
        dataset: DatasetId,
        kind: &'static str,
        limit: u64,
    },
    #[error("dataset name must be non-empty")]
    EmptyName,
    #[error("snapshot encode/decode failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Fields of a job accepted by the orchestrator, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewTrainingJob {
    pub dataset_id: DatasetId,
    pub owner: OwnerId,
    pub remote_job_id: RemoteJobId,
    pub remote_job_name: String,
    pub status: JobStatus,
    pub gpu_ids: Vec<u32>,
    pub unix_time_ms: u64,
}

/// Result of one remote status poll.
///
/// Output path lists replace the stored ones only when non-empty.
#[derive(Debug, Clone)]
pub struct JobStatusUpdate {
    pub status: JobStatus,
    pub unix_time_ms: u64,
    pub sample_paths: Vec<String>,
    pub checkpoint_paths: Vec<String>,
}

/// Persistence seam for datasets, their images and training jobs.
///
/// Every method taking an `owner` enforces `dataset.owner == owner` and reports a
/// mismatch as [`StoreError::NotFound`]. Methods without an owner are internal.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn create_dataset(
        &self,
        owner: &OwnerId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Dataset, StoreError>;

    async fn get_dataset(&self, owner: &OwnerId, id: &DatasetId) -> Result<Dataset, StoreError>;

    /// Creates the row for an uploaded object. The dataset is derived from `key`.
    ///
    /// `text/plain` objects count against the caption limit, everything else against
    /// the image limit.
    async fn record_image(
        &self,
        owner: &OwnerId,
        bucket: &str,
        key: &str,
        bytes: u64,
        content_type: &str,
    ) -> Result<DatasetImage, StoreError>;

    async fn list_images(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
    ) -> Result<Vec<DatasetImage>, StoreError>;

    async fn insert_job(&self, job: NewTrainingJob) -> Result<TrainingJob, StoreError>;

    /// Newest first, at most `limit`.
    async fn list_jobs(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
        limit: usize,
    ) -> Result<Vec<TrainingJob>, StoreError>;

    async fn jobs_for_sync(&self, dataset: &DatasetId) -> Result<Vec<TrainingJob>, StoreError>;

    async fn update_job_status(
        &self,
        job: &TrainingJobId,
        update: JobStatusUpdate,
    ) -> Result<TrainingJob, StoreError>;

    async fn mark_dataset_synced(
        &self,
        dataset: &DatasetId,
        unix_time_ms: u64,
        path: Option<&str>,
    ) -> Result<(), StoreError>;
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.to_path_buf();
    let suffix = format!(
        "tmp.{}.{}",
        std::process::id(),
        tuner_observe::time::unix_time_ms()
    );
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    tmp.set_file_name(format!("{file_name}.{suffix}"));

    {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}
