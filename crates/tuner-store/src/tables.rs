use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tuner_core::dataset_key::{data_prefix, ImageKey};
use tuner_core::limits::{MAX_CAPTIONS_PER_DATASET, MAX_IMAGES_PER_DATASET};
use tuner_core::types::{
    Dataset, DatasetId, DatasetImage, ImageId, OwnerId, TrainingJob, TrainingJobId,
};

use crate::{JobStatusUpdate, NewTrainingJob, StoreError};

/// Row storage shared by the in-memory and snapshot-backed stores.
///
/// `images` and `jobs` are append-only and kept in insertion order, which is also
/// creation order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    datasets: BTreeMap<DatasetId, Dataset>,
    images: Vec<DatasetImage>,
    jobs: Vec<TrainingJob>,
}

fn ensure_authenticated(owner: &OwnerId) -> Result<(), StoreError> {
    if owner.is_authenticated() {
        Ok(())
    } else {
        Err(StoreError::Unauthenticated)
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

impl Tables {
    fn owned_dataset_mut(
        &mut self,
        owner: &OwnerId,
        id: &DatasetId,
    ) -> Result<&mut Dataset, StoreError> {
        ensure_authenticated(owner)?;
        match self.datasets.get_mut(id) {
            Some(ds) if ds.is_owned_by(owner) => Ok(ds),
            _ => Err(StoreError::NotFound("dataset".to_string())),
        }
    }

    pub(crate) fn owned_dataset(
        &self,
        owner: &OwnerId,
        id: &DatasetId,
    ) -> Result<&Dataset, StoreError> {
        ensure_authenticated(owner)?;
        match self.datasets.get(id) {
            Some(ds) if ds.is_owned_by(owner) => Ok(ds),
            _ => Err(StoreError::NotFound("dataset".to_string())),
        }
    }

    pub(crate) fn create_dataset(
        &mut self,
        owner: &OwnerId,
        bucket: &str,
        name: &str,
        description: Option<&str>,
        now_ms: u64,
    ) -> Result<Dataset, StoreError> {
        ensure_authenticated(owner)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        let id = DatasetId(new_id("ds"));
        let dataset = Dataset {
            prefix: data_prefix(&id),
            id: id.clone(),
            owner: owner.clone(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_unix_time_ms: now_ms,
            updated_unix_time_ms: now_ms,
            bucket: bucket.to_string(),
            object_count: 0,
            byte_count: 0,
            last_synced_unix_time_ms: None,
            last_synced_path: None,
        };
        self.datasets.insert(id, dataset.clone());
        Ok(dataset)
    }

    pub(crate) fn record_image(
        &mut self,
        owner: &OwnerId,
        bucket: &str,
        key: &str,
        bytes: u64,
        content_type: &str,
        now_ms: u64,
    ) -> Result<DatasetImage, StoreError> {
        let parsed = ImageKey::parse(key)?;
        self.owned_dataset(owner, &parsed.dataset_id)?;

        let caption = content_type == "text/plain";
        let (kind, limit) = if caption {
            ("captions", MAX_CAPTIONS_PER_DATASET)
        } else {
            ("images", MAX_IMAGES_PER_DATASET)
        };
        let existing = self
            .images
            .iter()
            .filter(|img| img.dataset_id == parsed.dataset_id && img.is_caption() == caption)
            .count() as u64;
        if existing >= limit {
            return Err(StoreError::LimitExceeded {
                dataset: parsed.dataset_id,
                kind,
                limit,
            });
        }

        let dataset = self.owned_dataset_mut(owner, &parsed.dataset_id)?;
        dataset.object_count += 1;
        dataset.byte_count = dataset.byte_count.saturating_add(bytes);
        dataset.updated_unix_time_ms = now_ms;

        let image = DatasetImage {
            id: ImageId(new_id("img")),
            dataset_id: parsed.dataset_id,
            owner: owner.clone(),
            key: key.to_string(),
            bucket: bucket.to_string(),
            bytes,
            content_type: content_type.to_string(),
            created_unix_time_ms: now_ms,
        };
        self.images.push(image.clone());
        Ok(image)
    }

    pub(crate) fn list_images(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
    ) -> Result<Vec<DatasetImage>, StoreError> {
        self.owned_dataset(owner, dataset)?;
        Ok(self
            .images
            .iter()
            .filter(|img| img.dataset_id == *dataset)
            .cloned()
            .collect())
    }

    pub(crate) fn insert_job(&mut self, job: NewTrainingJob) -> Result<TrainingJob, StoreError> {
        self.owned_dataset(&job.owner, &job.dataset_id)?;
        let row = TrainingJob {
            id: TrainingJobId(new_id("job")),
            dataset_id: job.dataset_id,
            owner: job.owner,
            remote_job_id: Some(job.remote_job_id),
            remote_job_name: Some(job.remote_job_name),
            status: job.status,
            gpu_ids: job.gpu_ids,
            created_unix_time_ms: job.unix_time_ms,
            updated_unix_time_ms: job.unix_time_ms,
            last_status_sync_unix_time_ms: Some(job.unix_time_ms),
            sample_paths: Vec::new(),
            checkpoint_paths: Vec::new(),
        };
        self.jobs.push(row.clone());
        Ok(row)
    }

    pub(crate) fn list_jobs(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
        limit: usize,
    ) -> Result<Vec<TrainingJob>, StoreError> {
        self.owned_dataset(owner, dataset)?;
        Ok(self
            .jobs
            .iter()
            .rev()
            .filter(|j| j.dataset_id == *dataset)
            .take(limit)
            .cloned()
            .collect())
    }

    pub(crate) fn jobs_for_sync(&self, dataset: &DatasetId) -> Vec<TrainingJob> {
        self.jobs
            .iter()
            .filter(|j| j.dataset_id == *dataset)
            .cloned()
            .collect()
    }

    pub(crate) fn update_job_status(
        &mut self,
        id: &TrainingJobId,
        update: JobStatusUpdate,
    ) -> Result<TrainingJob, StoreError> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| j.id == *id)
            .ok_or_else(|| StoreError::NotFound("job".to_string()))?;
        job.status = update.status;
        job.updated_unix_time_ms = update.unix_time_ms;
        job.last_status_sync_unix_time_ms = Some(update.unix_time_ms);
        if !update.sample_paths.is_empty() {
            job.sample_paths = update.sample_paths;
        }
        if !update.checkpoint_paths.is_empty() {
            job.checkpoint_paths = update.checkpoint_paths;
        }
        Ok(job.clone())
    }

    pub(crate) fn mark_dataset_synced(
        &mut self,
        dataset: &DatasetId,
        now_ms: u64,
        path: Option<&str>,
    ) -> Result<(), StoreError> {
        let ds = self
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| StoreError::NotFound("dataset".to_string()))?;
        ds.last_synced_unix_time_ms = Some(now_ms);
        if let Some(p) = path {
            ds.last_synced_path = Some(p.to_string());
        }
        ds.updated_unix_time_ms = now_ms;
        Ok(())
    }
}
