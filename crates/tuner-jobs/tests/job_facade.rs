use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use tuner_core::types::{
    Dataset, DatasetId, DatasetImage, JobStatus, OwnerId, RemoteJobId, TrainingJob, TrainingJobId,
};
use tuner_jobs::facade::{JobError, JobFacade};
use tuner_jobs::orchestrator::{
    AcceptedJob, CreateJobRequest, Orchestrator, OrchestratorError, RemoteJobStatus,
};
use tuner_jobs::sync_worker::{DatasetSyncWorker, SyncDatasetRequest, SyncedDataset};
use tuner_store::mem::MemMetadataStore;
use tuner_store::{JobStatusUpdate, MetadataStore, NewTrainingJob, StoreError};

#[derive(Default)]
struct FakeOrchestrator {
    next_id: AtomicU64,
    reject_with: Option<String>,
    created: Mutex<Vec<CreateJobRequest>>,
    /// Remote id -> reported status; `Err` makes the poll fail.
    statuses: Mutex<HashMap<String, Result<RemoteJobStatus, u16>>>,
}

impl FakeOrchestrator {
    fn set_status(&self, id: &RemoteJobId, status: Result<RemoteJobStatus, u16>) {
        self.statuses.lock().unwrap().insert(id.0.clone(), status);
    }

    fn created(&self) -> Vec<CreateJobRequest> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn create_job(&self, req: &CreateJobRequest) -> Result<AcceptedJob, OrchestratorError> {
        if let Some(error) = &self.reject_with {
            return Err(OrchestratorError::Rejected(error.clone()));
        }
        self.created.lock().unwrap().push(req.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AcceptedJob {
            id: RemoteJobId(format!("remote-{n}")),
            name: req.name.clone(),
            queue_position: Some(0),
            created_at: None,
        })
    }

    async fn job_status(&self, id: &RemoteJobId) -> Result<RemoteJobStatus, OrchestratorError> {
        match self.statuses.lock().unwrap().get(&id.0).cloned() {
            Some(Ok(status)) => Ok(status),
            Some(Err(status)) => Err(OrchestratorError::Status {
                status,
                body: "unavailable".to_string(),
            }),
            None => Ok(RemoteJobStatus::default()),
        }
    }
}

struct FakeSyncWorker {
    local_path: Option<String>,
    requests: Mutex<Vec<SyncDatasetRequest>>,
}

#[async_trait]
impl DatasetSyncWorker for FakeSyncWorker {
    async fn sync_dataset(
        &self,
        req: &SyncDatasetRequest,
    ) -> Result<SyncedDataset, OrchestratorError> {
        self.requests.lock().unwrap().push(req.clone());
        match &self.local_path {
            Some(path) => Ok(SyncedDataset {
                dataset_id: req.dataset_id.clone(),
                local_path: path.clone(),
                already_synced: false,
                bytes_written: 10,
                object_count: 1,
            }),
            None => Err(OrchestratorError::Rejected("bucket missing".to_string())),
        }
    }
}

/// Delegates to an in-memory store but fails the chosen job-bookkeeping writes.
struct FlakyStore {
    inner: MemMetadataStore,
    fail_insert_job: bool,
    fail_mark_synced: bool,
}

fn disk_full() -> StoreError {
    StoreError::Io(std::io::Error::other("disk full"))
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn create_dataset(
        &self,
        owner: &OwnerId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Dataset, StoreError> {
        self.inner.create_dataset(owner, name, description).await
    }

    async fn get_dataset(&self, owner: &OwnerId, id: &DatasetId) -> Result<Dataset, StoreError> {
        self.inner.get_dataset(owner, id).await
    }

    async fn record_image(
        &self,
        owner: &OwnerId,
        bucket: &str,
        key: &str,
        bytes: u64,
        content_type: &str,
    ) -> Result<DatasetImage, StoreError> {
        self.inner
            .record_image(owner, bucket, key, bytes, content_type)
            .await
    }

    async fn list_images(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
    ) -> Result<Vec<DatasetImage>, StoreError> {
        self.inner.list_images(owner, dataset).await
    }

    async fn insert_job(&self, job: NewTrainingJob) -> Result<TrainingJob, StoreError> {
        if self.fail_insert_job {
            return Err(disk_full());
        }
        self.inner.insert_job(job).await
    }

    async fn list_jobs(
        &self,
        owner: &OwnerId,
        dataset: &DatasetId,
        limit: usize,
    ) -> Result<Vec<TrainingJob>, StoreError> {
        self.inner.list_jobs(owner, dataset, limit).await
    }

    async fn jobs_for_sync(&self, dataset: &DatasetId) -> Result<Vec<TrainingJob>, StoreError> {
        self.inner.jobs_for_sync(dataset).await
    }

    async fn update_job_status(
        &self,
        job: &TrainingJobId,
        update: JobStatusUpdate,
    ) -> Result<TrainingJob, StoreError> {
        self.inner.update_job_status(job, update).await
    }

    async fn mark_dataset_synced(
        &self,
        dataset: &DatasetId,
        unix_time_ms: u64,
        path: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.fail_mark_synced {
            return Err(disk_full());
        }
        self.inner.mark_dataset_synced(dataset, unix_time_ms, path).await
    }
}

async fn flaky_store(
    fail_insert_job: bool,
    fail_mark_synced: bool,
) -> Result<(Arc<FlakyStore>, DatasetId)> {
    let inner = MemMetadataStore::new("training");
    let ds = inner.create_dataset(&owner(), "cats", None).await?;
    let store = Arc::new(FlakyStore {
        inner,
        fail_insert_job,
        fail_mark_synced,
    });
    Ok((store, ds.id))
}

fn owner() -> OwnerId {
    OwnerId("u1".to_string())
}

async fn store_with_dataset() -> Result<(Arc<MemMetadataStore>, DatasetId)> {
    let store = Arc::new(MemMetadataStore::new("training"));
    let ds = store.create_dataset(&owner(), "cats", None).await?;
    Ok((store, ds.id))
}

fn status(s: &str) -> RemoteJobStatus {
    RemoteJobStatus {
        status: Some(s.to_string()),
        ..RemoteJobStatus::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_creates_exactly_one_queued_job() -> Result<()> {
    let (store, ds) = store_with_dataset().await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let facade =
        JobFacade::new(store.clone(), orchestrator.clone()).with_datasets_root("/data/r2/");

    assert!(facade.list(&owner(), &ds).await?.is_empty());
    let started = facade.start(&owner(), &ds).await?;

    let jobs = facade.list(&owner(), &ds).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Queued);
    assert_eq!(jobs[0].gpu_ids, vec![0]);
    let remote = jobs[0].remote_job_id.clone().unwrap();
    assert!(!remote.0.is_empty());
    assert_eq!(remote, started.remote_job_id);

    let expected_path = format!("/data/r2/{ds}");
    assert_eq!(started.dataset_path, expected_path);
    let created = orchestrator.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].gpu_ids, "0");
    assert!(created[0].name.starts_with("qwen-2509-cats-"));
    assert_eq!(created[0].job_config.config.name, created[0].name);
    assert_eq!(
        created[0].job_config.config.process[0].datasets[0].folder_path,
        expected_path
    );

    let dataset = store.get_dataset(&owner(), &ds).await?;
    assert!(dataset.last_synced_unix_time_ms.is_some());
    assert_eq!(dataset.last_synced_path.as_deref(), Some(expected_path.as_str()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_launch_leaves_no_row() -> Result<()> {
    let (store, ds) = store_with_dataset().await?;
    let orchestrator = Arc::new(FakeOrchestrator {
        reject_with: Some("no gpu available".to_string()),
        ..FakeOrchestrator::default()
    });
    let facade = JobFacade::new(store.clone(), orchestrator);

    let err = facade.start(&owner(), &ds).await.unwrap_err();
    assert!(
        matches!(err, JobError::Launch(OrchestratorError::Rejected(_))),
        "got {err:?}"
    );
    assert!(facade.list(&owner(), &ds).await?.is_empty());
    let dataset = store.get_dataset(&owner(), &ds).await?;
    assert!(dataset.last_synced_unix_time_ms.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_dataset_is_not_found() -> Result<()> {
    let (store, ds) = store_with_dataset().await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let facade = JobFacade::new(store, orchestrator.clone());

    let intruder = OwnerId("u2".to_string());
    assert!(facade.start(&intruder, &ds).await.unwrap_err().is_not_found());
    assert!(facade.sync(&intruder, &ds).await.unwrap_err().is_not_found());
    assert!(facade.list(&intruder, &ds).await.unwrap_err().is_not_found());
    assert!(orchestrator.created().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_failing_poll_does_not_stop_the_rest() -> Result<()> {
    let (store, ds) = store_with_dataset().await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let facade = JobFacade::new(store.clone(), orchestrator.clone());

    let mut remote = Vec::new();
    for _ in 0..4 {
        remote.push(facade.start(&owner(), &ds).await?.remote_job_id);
    }
    orchestrator.set_status(
        &remote[0],
        Ok(RemoteJobStatus {
            status: Some("IN_PROGRESS".to_string()),
            samples: vec!["samples/1.png".to_string()],
            checkpoints: vec![],
        }),
    );
    orchestrator.set_status(&remote[1], Err(503));
    orchestrator.set_status(&remote[2], Ok(status("COMPLETED")));
    // remote[3] reports nothing: status is kept.

    let summary = facade.sync(&owner(), &ds).await?;
    assert_eq!(summary.synced, 3);
    assert_eq!(summary.failed, 1);

    let by_remote: HashMap<RemoteJobId, _> = facade
        .list(&owner(), &ds)
        .await?
        .into_iter()
        .map(|j| (j.remote_job_id.clone().unwrap(), j))
        .collect();
    assert_eq!(by_remote[&remote[0]].status, JobStatus::Running);
    assert_eq!(by_remote[&remote[0]].sample_paths, vec!["samples/1.png".to_string()]);
    assert_eq!(by_remote[&remote[1]].status, JobStatus::Queued);
    assert_eq!(by_remote[&remote[2]].status, JobStatus::Succeeded);
    assert_eq!(by_remote[&remote[3]].status, JobStatus::Queued);
    assert!(by_remote[&remote[3]].last_status_sync_unix_time_ms.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_worker_path_feeds_the_job_config() -> Result<()> {
    let (store, ds) = store_with_dataset().await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let worker = Arc::new(FakeSyncWorker {
        local_path: Some("/mnt/datasets/cats".to_string()),
        requests: Mutex::new(Vec::new()),
    });
    let facade = JobFacade::new(store.clone(), orchestrator.clone()).with_sync_worker(worker.clone());

    let started = facade.start(&owner(), &ds).await?;
    assert_eq!(started.dataset_path, "/mnt/datasets/cats");

    let requests = worker.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].dataset_id, ds.0);
    assert_eq!(requests[0].r2_bucket, "training");
    assert_eq!(requests[0].r2_prefix, format!("datasets/{ds}/images"));
    assert_eq!(
        orchestrator.created()[0].job_config.config.process[0].datasets[0].folder_path,
        "/mnt/datasets/cats"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_sync_blocks_the_launch() -> Result<()> {
    let (store, ds) = store_with_dataset().await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let worker = Arc::new(FakeSyncWorker {
        local_path: None,
        requests: Mutex::new(Vec::new()),
    });
    let facade = JobFacade::new(store, orchestrator.clone()).with_sync_worker(worker);

    let err = facade.start(&owner(), &ds).await.unwrap_err();
    assert!(matches!(err, JobError::Sync(_)), "got {err:?}");
    assert!(orchestrator.created().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_returns_once_every_job_is_terminal() -> Result<()> {
    let (store, ds) = store_with_dataset().await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let facade = JobFacade::new(store, orchestrator.clone());

    let a = facade.start(&owner(), &ds).await?.remote_job_id;
    let b = facade.start(&owner(), &ds).await?.remote_job_id;
    orchestrator.set_status(&a, Ok(status("COMPLETED")));
    orchestrator.set_status(&b, Ok(status("FAILED")));

    let summary = facade
        .watch(
            &owner(),
            &ds,
            Duration::from_millis(10),
            std::future::pending::<()>(),
        )
        .await?;
    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.last.synced, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_honours_the_stop_signal() -> Result<()> {
    let (store, ds) = store_with_dataset().await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let facade = JobFacade::new(store, orchestrator.clone());

    let a = facade.start(&owner(), &ds).await?.remote_job_id;
    orchestrator.set_status(&a, Ok(status("running")));

    let summary = facade
        .watch(
            &owner(),
            &ds,
            Duration::from_millis(5),
            tokio::time::sleep(Duration::from_millis(40)),
        )
        .await?;
    assert!(summary.rounds >= 1);
    assert_eq!(summary.pending, 1);

    let err = facade
        .watch(&owner(), &ds, Duration::ZERO, std::future::pending::<()>())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidInterval));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_treats_stopped_jobs_as_finished() -> Result<()> {
    let (store, ds) = store_with_dataset().await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let facade = JobFacade::new(store, orchestrator.clone());

    let a = facade.start(&owner(), &ds).await?.remote_job_id;
    let b = facade.start(&owner(), &ds).await?.remote_job_id;
    orchestrator.set_status(&a, Ok(status("stopped")));
    orchestrator.set_status(&b, Ok(status("CANCELLED")));

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        facade.watch(
            &owner(),
            &ds,
            Duration::from_millis(10),
            std::future::pending::<()>(),
        ),
    )
    .await??;
    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.pending, 0);

    let jobs = facade.list(&owner(), &ds).await?;
    assert!(jobs.iter().all(|j| j.status == JobStatus::Cancelled));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_succeeds_when_sync_bookkeeping_fails() -> Result<()> {
    let (store, ds) = flaky_store(false, true).await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let facade = JobFacade::new(store.clone(), orchestrator.clone());

    let started = facade.start(&owner(), &ds).await?;
    assert_eq!(orchestrator.created().len(), 1);
    let jobs = facade.list(&owner(), &ds).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].remote_job_id.as_ref(), Some(&started.remote_job_id));
    let dataset = store.get_dataset(&owner(), &ds).await?;
    assert!(dataset.last_synced_path.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrecorded_launch_reports_the_remote_job() -> Result<()> {
    let (store, ds) = flaky_store(true, false).await?;
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let facade = JobFacade::new(store, orchestrator.clone());

    let err = facade.start(&owner(), &ds).await.unwrap_err();
    let JobError::Unrecorded { remote_job_id, .. } = &err else {
        panic!("expected an unrecorded launch, got {err:?}");
    };
    assert_eq!(remote_job_id, &RemoteJobId("remote-1".to_string()));
    assert_eq!(orchestrator.created().len(), 1);
    Ok(())
}
