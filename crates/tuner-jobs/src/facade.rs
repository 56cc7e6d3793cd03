use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use tuner_core::dataset_key::images_prefix;
use tuner_core::limits::JOB_LIST_LIMIT;
use tuner_core::types::{Dataset, DatasetId, JobStatus, OwnerId, RemoteJobId, TrainingJob};
use tuner_observe::time::unix_time_ms;
use tuner_store::{JobStatusUpdate, MetadataStore, NewTrainingJob, StoreError};

use crate::config::{JobConfig, DEFAULT_GPU_IDS};
use crate::orchestrator::{gpu_ids_param, CreateJobRequest, Orchestrator, OrchestratorError};
use crate::sync_worker::{DatasetSyncWorker, SyncDatasetRequest};

pub const DEFAULT_DATASETS_ROOT: &str = "/app/ai-toolkit/datasets/r2";

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("dataset sync failed: {0}")]
    Sync(#[source] OrchestratorError),
    #[error("job launch failed: {0}")]
    Launch(#[source] OrchestratorError),
    #[error("job status fetch failed: {0}")]
    Status(#[source] OrchestratorError),
    /// The orchestrator accepted the job but no local row could be written.
    #[error("job {remote_job_id} was accepted but not recorded: {source}")]
    Unrecorded {
        remote_job_id: RemoteJobId,
        #[source]
        source: StoreError,
    },
    #[error("watch interval must be > 0")]
    InvalidInterval,
}

impl JobError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, JobError::Store(e) if e.is_not_found())
    }
}

#[derive(Debug, Clone)]
pub struct StartedJob {
    pub job: TrainingJob,
    pub remote_job_id: RemoteJobId,
    pub dataset_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub rounds: u64,
    /// Jobs still not in a terminal state when watching ended.
    pub pending: usize,
    pub last: SyncSummary,
}

/// Launches training jobs for datasets and mirrors remote job state locally.
pub struct JobFacade {
    store: Arc<dyn MetadataStore>,
    orchestrator: Arc<dyn Orchestrator>,
    sync_worker: Option<Arc<dyn DatasetSyncWorker>>,
    datasets_root: String,
    gpu_ids: Vec<u32>,
}

impl JobFacade {
    pub fn new(store: Arc<dyn MetadataStore>, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
            sync_worker: None,
            datasets_root: DEFAULT_DATASETS_ROOT.to_string(),
            gpu_ids: DEFAULT_GPU_IDS.to_vec(),
        }
    }

    pub fn with_sync_worker(mut self, worker: Arc<dyn DatasetSyncWorker>) -> Self {
        self.sync_worker = Some(worker);
        self
    }

    /// Where datasets land on the GPU host when no sync worker reports a path.
    pub fn with_datasets_root(mut self, root: impl Into<String>) -> Self {
        self.datasets_root = root.into();
        self
    }

    pub fn with_gpu_ids(mut self, gpu_ids: Vec<u32>) -> Self {
        self.gpu_ids = gpu_ids;
        self
    }

    pub async fn start(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
    ) -> Result<StartedJob, JobError> {
        let ds = self.store.get_dataset(owner, dataset).await?;
        let dataset_path = self.stage(&ds).await?;

        let now = unix_time_ms();
        let name = format!("qwen-2509-{}-{}", ds.name, now);
        let req = CreateJobRequest {
            name: name.clone(),
            gpu_ids: gpu_ids_param(&self.gpu_ids),
            job_config: JobConfig::qwen_image_edit_2509(&dataset_path, &name),
        };
        let accepted = self
            .orchestrator
            .create_job(&req)
            .await
            .map_err(JobError::Launch)?;

        let job = self
            .store
            .insert_job(NewTrainingJob {
                dataset_id: ds.id.clone(),
                owner: owner.clone(),
                remote_job_id: accepted.id.clone(),
                remote_job_name: accepted.name,
                status: JobStatus::Queued,
                gpu_ids: self.gpu_ids.clone(),
                unix_time_ms: now,
            })
            .await
            .map_err(|source| JobError::Unrecorded {
                remote_job_id: accepted.id.clone(),
                source,
            })?;
        // The remote job is queued at this point; the launch itself succeeded.
        if let Err(err) = self
            .store
            .mark_dataset_synced(&ds.id, now, Some(&dataset_path))
            .await
        {
            warn!(
                dataset_id = %ds.id,
                remote_job_id = %accepted.id,
                error = %err,
                "recording dataset sync failed"
            );
        }

        info!(
            target: "tuner_events",
            event = "job_started",
            dataset_id = %ds.id,
            remote_job_id = %accepted.id,
            queue_position = accepted.queue_position.unwrap_or(-1),
            dataset_path = %dataset_path,
            "training job accepted"
        );
        Ok(StartedJob {
            job,
            remote_job_id: accepted.id,
            dataset_path,
        })
    }

    async fn stage(&self, ds: &Dataset) -> Result<String, JobError> {
        let Some(worker) = &self.sync_worker else {
            return Ok(format!(
                "{}/{}",
                self.datasets_root.trim_end_matches('/'),
                ds.id
            ));
        };
        let synced = worker
            .sync_dataset(&SyncDatasetRequest {
                dataset_id: ds.id.to_string(),
                r2_bucket: ds.bucket.clone(),
                r2_prefix: images_prefix(&ds.id),
                overwrite: None,
            })
            .await
            .map_err(JobError::Sync)?;
        info!(
            target: "tuner_events",
            event = "dataset_staged",
            dataset_id = %ds.id,
            local_path = %synced.local_path,
            already_synced = synced.already_synced,
            bytes_written = synced.bytes_written,
            object_count = synced.object_count,
            "dataset staged for training"
        );
        Ok(synced.local_path)
    }

    /// Pulls the remote status of every job of `dataset` once.
    ///
    /// A job whose status cannot be fetched or stored is logged and skipped.
    pub async fn sync(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
    ) -> Result<SyncSummary, JobError> {
        self.store.get_dataset(owner, dataset).await?;
        let jobs = self.store.jobs_for_sync(dataset).await?;

        let mut summary = SyncSummary::default();
        for job in jobs {
            let Some(remote_id) = job.remote_job_id.as_ref() else {
                continue;
            };
            match self.sync_one(&job, remote_id).await {
                Ok(()) => summary.synced += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        dataset_id = %dataset,
                        job_id = %job.id,
                        remote_job_id = %remote_id,
                        error = %err,
                        "job status sync failed"
                    );
                }
            }
        }
        Ok(summary)
    }

    async fn sync_one(&self, job: &TrainingJob, remote_id: &RemoteJobId) -> Result<(), JobError> {
        let remote = self
            .orchestrator
            .job_status(remote_id)
            .await
            .map_err(JobError::Status)?;
        let status = remote
            .status
            .as_deref()
            .map(JobStatus::parse)
            .unwrap_or_else(|| job.status.clone());
        let row = self
            .store
            .update_job_status(
                &job.id,
                JobStatusUpdate {
                    status,
                    unix_time_ms: unix_time_ms(),
                    sample_paths: remote.samples,
                    checkpoint_paths: remote.checkpoints,
                },
            )
            .await?;
        if row.status != job.status {
            info!(
                target: "tuner_events",
                event = "job_status_changed",
                job_id = %row.id,
                remote_job_id = %remote_id,
                from = %job.status,
                to = %row.status,
                "job status changed"
            );
        }
        Ok(())
    }

    /// Repeats [`JobFacade::sync`] every `interval` until no job is pending or `stop` resolves.
    pub async fn watch<S>(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
        interval: Duration,
        stop: S,
    ) -> Result<WatchSummary, JobError>
    where
        S: Future<Output = ()>,
    {
        if interval.is_zero() {
            return Err(JobError::InvalidInterval);
        }
        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut summary = WatchSummary::default();
        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!(dataset_id = %dataset, rounds = summary.rounds, "watch stopped");
                    return Ok(summary);
                }
                _ = ticker.tick() => {}
            }

            summary.last = self.sync(owner, dataset).await?;
            summary.rounds += 1;
            summary.pending = self
                .store
                .jobs_for_sync(dataset)
                .await?
                .iter()
                .filter(|j| j.remote_job_id.is_some() && !j.status.is_terminal())
                .count();
            info!(
                target: "tuner_events",
                event = "sync_round",
                dataset_id = %dataset,
                round = summary.rounds,
                synced = summary.last.synced as u64,
                failed = summary.last.failed as u64,
                pending = summary.pending as u64,
                "job sync round"
            );
            if summary.pending == 0 {
                return Ok(summary);
            }
        }
    }

    /// Newest first, capped at the listing limit.
    pub async fn list(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
    ) -> Result<Vec<TrainingJob>, JobError> {
        Ok(self.store.list_jobs(owner, dataset, JOB_LIST_LIMIT).await?)
    }
}
