#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, info_span, warn, Instrument};

use tuner_core::limits::{MAX_IMAGE_PIXELS, UPLOAD_CONCURRENCY};
use tuner_core::selection::{AddOutcome, PendingSelection, SelectedFile, SelectionLimits};
use tuner_core::types::{DatasetId, OwnerId};
use tuner_jobs::facade::{JobError, JobFacade, DEFAULT_DATASETS_ROOT};
use tuner_jobs::orchestrator::AiToolkitClient;
use tuner_jobs::sync_worker::SyncWorkerClient;
use tuner_runtime::backend::StoreBackend;
use tuner_runtime::normalize::ResizeBackend;
use tuner_runtime::s3::{client_from_env, S3Presigner};
use tuner_runtime::session::{BoundDataset, DatasetSession};
use tuner_runtime::transport::HttpTransport;
use tuner_runtime::uploader::{UploadCaps, UploadMetrics, Uploader};
use tuner_store::mem::MemMetadataStore;
use tuner_store::MetadataStore;

const UPLOAD_FAILED: &str = "Upload failed. Please try again.";
const START_FAILED: &str = "Could not start the training job. Please try again.";

#[derive(Debug, Parser)]
#[command(name = "tuner", about = "Upload training datasets and run fine-tuning jobs")]
struct Args {
    /// Authenticated subject every dataset operation acts as.
    #[arg(long, env = "TUNER_OWNER")]
    owner: String,

    /// JSON snapshot backing the metadata store.
    #[arg(long, env = "TUNER_STORE_PATH", default_value = ".tuner/store.json")]
    store_path: PathBuf,

    /// Bucket that holds dataset objects.
    #[arg(long, env = "TUNER_BUCKET")]
    bucket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::Args)]
struct RemoteArgs {
    /// Base URL of the ai-toolkit jobs API.
    #[arg(long, env = "TUNER_ORCHESTRATOR_URL", default_value = "http://127.0.0.1:8675")]
    orchestrator_url: String,

    #[arg(long, env = "TUNER_ORCHESTRATOR_TOKEN", hide_env_values = true)]
    orchestrator_token: Option<String>,

    /// If set, datasets are staged through this worker before a job starts.
    #[arg(long, env = "TUNER_SYNC_WORKER_URL")]
    sync_worker_url: Option<String>,

    /// Where datasets live on the GPU host when no sync worker is configured.
    #[arg(long, env = "TUNER_DATASETS_ROOT", default_value = DEFAULT_DATASETS_ROOT)]
    datasets_root: String,

    #[arg(long, env = "TUNER_GPU_IDS", value_delimiter = ',', default_value = "0")]
    gpu_ids: Vec<u32>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload files into a dataset, creating one unless `--dataset` is given.
    Upload {
        #[arg(long, env = "TUNER_DATASET_ID")]
        dataset: Option<String>,

        /// Name for a newly created dataset.
        #[arg(long, env = "TUNER_DATASET_NAME")]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long, env = "TUNER_UPLOAD_CONCURRENCY", default_value_t = UPLOAD_CONCURRENCY)]
        concurrency: usize,

        /// Pixel budget per image; larger images are downscaled.
        #[arg(
            long,
            env = "TUNER_MAX_IMAGE_PIXELS",
            default_value_t = MAX_IMAGE_PIXELS,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        max_pixels: u64,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Start a training job for a dataset.
    Start {
        #[arg(long, env = "TUNER_DATASET_ID")]
        dataset: String,

        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Pull the remote status of a dataset's jobs once.
    Sync {
        #[arg(long, env = "TUNER_DATASET_ID")]
        dataset: String,

        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Keep syncing until every job finished or Ctrl-C.
    Watch {
        #[arg(long, env = "TUNER_DATASET_ID")]
        dataset: String,

        #[arg(long, env = "TUNER_WATCH_INTERVAL_MS", default_value_t = 15_000)]
        interval_ms: u64,

        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// List the newest jobs of a dataset.
    Jobs {
        #[arg(long, env = "TUNER_DATASET_ID")]
        dataset: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tuner_observe::logging::init_tracing();

    let args = Args::parse();
    let owner = OwnerId(args.owner.clone());
    if let Some(parent) = args.store_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let store = Arc::new(MemMetadataStore::open(args.bucket.clone(), &args.store_path).await?);

    match args.command {
        Command::Upload {
            dataset,
            name,
            description,
            concurrency,
            max_pixels,
            files,
        } => {
            let span = info_span!(
                "upload",
                owner = %owner,
                dataset_id = dataset.as_deref().unwrap_or("new")
            );
            let caps = UploadCaps {
                concurrency,
                max_pixels,
                resize_backend: ResizeBackend::from_env()?,
            };
            let target = match dataset {
                Some(id) => UploadTarget::Existing(DatasetId(id)),
                None => UploadTarget::New { name, description },
            };
            upload(store, owner, &args.bucket, target, caps, files)
                .instrument(span)
                .await
        }
        Command::Start { dataset, remote } => {
            let dataset = DatasetId(dataset);
            let span = info_span!("start", owner = %owner, dataset_id = %dataset);
            async move {
                let facade = job_facade(store, &remote)?;
                match facade.start(&owner, &dataset).await {
                    Ok(started) => {
                        println!(
                            "started job {} (remote {}) from {}",
                            started.job.id, started.remote_job_id, started.dataset_path
                        );
                        Ok(())
                    }
                    Err(JobError::Unrecorded { remote_job_id, source }) => {
                        error!(remote_job_id = %remote_job_id, error = %source, "job not recorded");
                        anyhow::bail!(
                            "Training job {remote_job_id} was started but could not be saved locally. Do not start it again."
                        )
                    }
                    Err(err) => {
                        error!(error = %err, "job start failed");
                        anyhow::bail!(START_FAILED)
                    }
                }
            }
            .instrument(span)
            .await
        }
        Command::Sync { dataset, remote } => {
            let dataset = DatasetId(dataset);
            let span = info_span!("sync", owner = %owner, dataset_id = %dataset);
            async move {
                let facade = job_facade(store, &remote)?;
                let summary = facade.sync(&owner, &dataset).await?;
                println!("synced {} jobs ({} failed)", summary.synced, summary.failed);
                Ok(())
            }
            .instrument(span)
            .await
        }
        Command::Watch {
            dataset,
            interval_ms,
            remote,
        } => {
            let dataset = DatasetId(dataset);
            let span = info_span!("watch", owner = %owner, dataset_id = %dataset);
            async move {
                let facade = job_facade(store, &remote)?;
                let stop = async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = %err, "ctrl-c handler unavailable; watching until done");
                        std::future::pending::<()>().await;
                    }
                };
                let summary = facade
                    .watch(&owner, &dataset, Duration::from_millis(interval_ms), stop)
                    .await?;
                println!(
                    "{} rounds, {} jobs still pending",
                    summary.rounds, summary.pending
                );
                Ok(())
            }
            .instrument(span)
            .await
        }
        Command::Jobs { dataset } => {
            let dataset = DatasetId(dataset);
            let jobs = store
                .list_jobs(&owner, &dataset, tuner_core::limits::JOB_LIST_LIMIT)
                .await?;
            for job in jobs {
                let remote = job
                    .remote_job_id
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{}\tsamples={}\tcheckpoints={}",
                    job.id,
                    remote,
                    job.status,
                    format_ms(job.created_unix_time_ms),
                    job.sample_paths.len(),
                    job.checkpoint_paths.len()
                );
            }
            Ok(())
        }
    }
}

enum UploadTarget {
    Existing(DatasetId),
    New {
        name: Option<String>,
        description: Option<String>,
    },
}

async fn upload(
    store: Arc<MemMetadataStore>,
    owner: OwnerId,
    bucket: &str,
    target: UploadTarget,
    caps: UploadCaps,
    paths: Vec<PathBuf>,
) -> Result<()> {
    let s3 = client_from_env().await?;
    let presigner = Arc::new(S3Presigner::new(s3, bucket));
    let backend = Arc::new(StoreBackend::new(store.clone(), presigner, owner.clone()));

    let (session, limits) = match target {
        UploadTarget::Existing(id) => {
            let ds = store.get_dataset(&owner, &id).await?;
            let images = store.list_images(&owner, &id).await?;
            let captions = images.iter().filter(|i| i.is_caption()).count() as u64;
            let limits = SelectionLimits::remaining(images.len() as u64 - captions, captions);
            let bound = BoundDataset {
                id: ds.id,
                name: ds.name,
            };
            (DatasetSession::bound(backend.clone(), bound), limits)
        }
        UploadTarget::New { name, description } => (
            DatasetSession::with_name(backend.clone(), name, description),
            SelectionLimits::default(),
        ),
    };

    let mut selection = PendingSelection::new(limits);
    for path in &paths {
        let file = read_selected_file(path).await?;
        let name = file.name.clone();
        match selection.add(file) {
            AddOutcome::Added => {}
            AddOutcome::Duplicate => info!(file = %name, "skipping duplicate selection"),
            AddOutcome::LimitReached(kind) => {
                warn!(file = %name, kind = ?kind, "dataset limit reached; skipping")
            }
            AddOutcome::Unsupported => warn!(file = %name, "unsupported file type; skipping"),
        }
    }
    if selection.is_empty() {
        anyhow::bail!("nothing to upload");
    }
    info!(
        images = selection.image_count(),
        captions = selection.caption_count(),
        backend = caps.resize_backend.name(),
        "upload selection ready"
    );

    let transport = Arc::new(HttpTransport::new()?);
    let uploader = Uploader::new(backend, transport, caps);
    let report = match uploader.upload(&session, selection.into_files()).await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "upload failed");
            anyhow::bail!(UPLOAD_FAILED);
        }
    };
    log_metrics(&uploader.metrics());

    println!(
        "dataset {} ({}): {} of {} files uploaded",
        report.dataset.id,
        report.dataset.name,
        report.uploaded.len(),
        report.total()
    );
    if let Some(message) = report.user_message() {
        anyhow::bail!(message);
    }
    Ok(())
}

async fn read_selected_file(path: &Path) -> Result<SelectedFile> {
    let meta = tokio::fs::metadata(path).await?;
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let bytes = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("not a file path: {}", path.display()))?;
    Ok(SelectedFile::new(name, modified_ms, None, bytes))
}

fn job_facade(store: Arc<MemMetadataStore>, remote: &RemoteArgs) -> Result<JobFacade> {
    let orchestrator = Arc::new(AiToolkitClient::new(
        &remote.orchestrator_url,
        remote.orchestrator_token.clone(),
    )?);
    let mut facade = JobFacade::new(store, orchestrator)
        .with_datasets_root(remote.datasets_root.clone())
        .with_gpu_ids(remote.gpu_ids.clone());
    if let Some(url) = &remote.sync_worker_url {
        facade = facade.with_sync_worker(Arc::new(SyncWorkerClient::new(url)?));
    }
    Ok(facade)
}

fn log_metrics(metrics: &UploadMetrics) {
    let latency = metrics.transfer_latency.snapshot();
    info!(
        target: "tuner_events",
        event = "upload_metrics",
        started = metrics.started_total.get(),
        uploaded = metrics.uploaded_total.get(),
        failed = metrics.failed_total.get(),
        resized = metrics.resized_total.get(),
        uploaded_bytes = metrics.uploaded_bytes_total.get(),
        inflight_high_water = metrics.inflight_high_water.get(),
        transfer_avg_ms = latency.avg_ms(),
        transfer_max_ms = latency.max_ms(),
        "upload metrics"
    );
}

fn format_ms(unix_time_ms: u64) -> String {
    i64::try_from(unix_time_ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| unix_time_ms.to_string())
}
