use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use tuner_core::types::{Dataset, DatasetId, DatasetImage, OwnerId, TrainingJob, TrainingJobId};
use tuner_observe::time::unix_time_ms;

use crate::tables::Tables;
use crate::{write_atomic, JobStatusUpdate, MetadataStore, NewTrainingJob, StoreError};

/// Metadata store kept in memory, optionally snapshotted to a JSON file after every write.
#[derive(Debug)]
pub struct MemMetadataStore {
    bucket: String,
    snapshot_path: Option<PathBuf>,
    tables: RwLock<Tables>,
}

impl MemMetadataStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            snapshot_path: None,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Loads `path` if it exists and persists every mutation back to it.
    pub async fn open(bucket: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(err) => return Err(StoreError::Io(err)),
        };
        Ok(Self {
            bucket: bucket.into(),
            snapshot_path: Some(path),
            tables: RwLock::new(tables),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(tables)?;
        let len = bytes.len();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        debug!(snapshot_bytes = len as u64, "persisted metadata snapshot");
        Ok(())
    }

    /// Applies `f` to the tables. With a snapshot configured the change is made on a
    /// copy and only swapped in once that copy is on disk.
    async fn commit<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.write().await;
        if self.snapshot_path.is_none() {
            return f(&mut tables);
        }
        let mut candidate = tables.clone();
        let out = f(&mut candidate)?;
        self.persist(&candidate).await?;
        *tables = candidate;
        Ok(out)
    }
}

#[async_trait]
impl MetadataStore for MemMetadataStore {
    async fn create_dataset(
        &self,
        owner: &OwnerId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Dataset, StoreError> {
        let now = unix_time_ms();
        let bucket = self.bucket.as_str();
        self.commit(|t| t.create_dataset(owner, bucket, name, description, now))
            .await
    }

    async fn get_dataset(&self, owner: &OwnerId, id: &DatasetId) -> Result<Dataset, StoreError> {
        let tables = self.tables.read().await;
        tables.owned_dataset(owner, id).cloned()
    }

    async fn record_image(
        &self,
        owner: &OwnerId,
        bucket: &str,
        key: &str,
        bytes: u64,
        content_type: &str,
    ) -> Result<DatasetImage, StoreError> {
        let now = unix_time_ms();
        self.commit(|t| t.record_image(owner, bucket, key, bytes, content_type, now))
            .await
    }

    async fn list_images(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
    ) -> Result<Vec<DatasetImage>, StoreError> {
        self.tables.read().await.list_images(owner, dataset)
    }

    async fn insert_job(&self, job: NewTrainingJob) -> Result<TrainingJob, StoreError> {
        self.commit(|t| t.insert_job(job)).await
    }

    async fn list_jobs(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
        limit: usize,
    ) -> Result<Vec<TrainingJob>, StoreError> {
        self.tables.read().await.list_jobs(owner, dataset, limit)
    }

    async fn jobs_for_sync(&self, dataset: &DatasetId) -> Result<Vec<TrainingJob>, StoreError> {
        Ok(self.tables.read().await.jobs_for_sync(dataset))
    }

    async fn update_job_status(
        &self,
        job: &TrainingJobId,
        update: JobStatusUpdate,
    ) -> Result<TrainingJob, StoreError> {
        self.commit(|t| t.update_job_status(job, update)).await
    }

    async fn mark_dataset_synced(
        &self,
        dataset: &DatasetId,
        unix_time_ms: u64,
        path: Option<&str>,
    ) -> Result<(), StoreError> {
        self.commit(|t| t.mark_dataset_synced(dataset, unix_time_ms, path))
            .await
    }
}
