use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use tuner_core::limits::{MAX_IMAGE_PIXELS, UPLOAD_CONCURRENCY};
use tuner_core::selection::SelectedFile;
use tuner_core::types::{DatasetId, DatasetImage};
use tuner_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};

use crate::backend::UploadBackend;
use crate::bounded::{run_with_concurrency, ConcurrencyError};
use crate::normalize::{ensure_max_resolution, NormalizeOutcome, ResizeBackend};
use crate::session::{BoundDataset, DatasetSession, SessionError};
use crate::transport::ObjectTransport;

#[derive(Debug, Clone, Copy)]
pub struct UploadCaps {
    pub concurrency: usize,
    pub max_pixels: u64,
    pub resize_backend: ResizeBackend,
}

impl Default for UploadCaps {
    fn default() -> Self {
        Self {
            concurrency: UPLOAD_CONCURRENCY,
            max_pixels: MAX_IMAGE_PIXELS,
            resize_backend: ResizeBackend::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct UploadMetrics {
    pub started_total: Counter,
    pub uploaded_total: Counter,
    pub failed_total: Counter,
    pub resized_total: Counter,
    pub uploaded_bytes_total: Counter,
    pub inflight: Gauge,
    pub inflight_high_water: Gauge,
    pub transfer_latency: DurationAgg,
}

struct InflightGuard {
    metrics: Arc<UploadMetrics>,
}

impl InflightGuard {
    fn enter(metrics: &Arc<UploadMetrics>) -> Self {
        let now = metrics.inflight.add(1);
        metrics.inflight_high_water.max(now);
        Self {
            metrics: metrics.clone(),
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics.inflight.sub(1);
    }
}

#[derive(Debug, Clone)]
pub struct UploadFailure {
    pub index: usize,
    pub name: String,
    /// Internal detail for logs; never shown to the user.
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub dataset: BoundDataset,
    pub uploaded: Vec<DatasetImage>,
    pub failed: Vec<UploadFailure>,
}

impl UploadReport {
    pub fn total(&self) -> usize {
        self.uploaded.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Generic retry prompt for the user, if anything failed.
    pub fn user_message(&self) -> Option<String> {
        if self.failed.is_empty() {
            return None;
        }
        Some(format!(
            "{} of {} files failed to upload. Please try again.",
            self.failed.len(),
            self.total()
        ))
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
}

#[derive(Clone)]
struct WorkerCtx {
    backend: Arc<dyn UploadBackend>,
    transport: Arc<dyn ObjectTransport>,
    metrics: Arc<UploadMetrics>,
    caps: UploadCaps,
    dataset: DatasetId,
}

/// Pushes selected files into a dataset through a fixed-width worker pool.
pub struct Uploader {
    backend: Arc<dyn UploadBackend>,
    transport: Arc<dyn ObjectTransport>,
    caps: UploadCaps,
    metrics: Arc<UploadMetrics>,
}

impl Uploader {
    pub fn new(
        backend: Arc<dyn UploadBackend>,
        transport: Arc<dyn ObjectTransport>,
        caps: UploadCaps,
    ) -> Self {
        Self {
            backend,
            transport,
            caps,
            metrics: Arc::new(UploadMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<UploadMetrics> {
        self.metrics.clone()
    }

    /// Uploads `files` into the session's dataset, creating it on first use.
    ///
    /// Per-file failures land in the report; only session and configuration
    /// errors fail the whole call.
    pub async fn upload(
        &self,
        session: &DatasetSession,
        files: Vec<SelectedFile>,
    ) -> Result<UploadReport, UploadError> {
        if self.caps.concurrency == 0 {
            return Err(ConcurrencyError::InvalidLimit.into());
        }
        let dataset = session.ensure_dataset().await?;
        let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();

        let ctx = WorkerCtx {
            backend: self.backend.clone(),
            transport: self.transport.clone(),
            metrics: self.metrics.clone(),
            caps: self.caps,
            dataset: dataset.id.clone(),
        };
        let outcomes = run_with_concurrency(files, self.caps.concurrency, |file, index| {
            let ctx = ctx.clone();
            async move {
                let name = file.name.clone();
                let res = upload_one(&ctx, index, file).await;
                if let Err(err) = &res {
                    ctx.metrics.failed_total.inc();
                    warn!(
                        dataset_id = %ctx.dataset,
                        index = index as u64,
                        name = %name,
                        error = %format!("{err:#}"),
                        "upload failed"
                    );
                }
                res
            }
        })
        .await?;

        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        for (index, (outcome, name)) in outcomes.into_iter().zip(names).enumerate() {
            match outcome {
                Ok(image) => uploaded.push(image),
                Err(err) => failed.push(UploadFailure {
                    index,
                    name,
                    error: format!("{err:#}"),
                }),
            }
        }

        info!(
            target: "tuner_events",
            event = "upload_finished",
            dataset_id = %dataset.id,
            uploaded = uploaded.len() as u64,
            failed = failed.len() as u64,
            inflight_high_water = self.metrics.inflight_high_water.get(),
            "upload batch finished"
        );
        Ok(UploadReport {
            dataset,
            uploaded,
            failed,
        })
    }
}

async fn upload_one(
    ctx: &WorkerCtx,
    index: usize,
    file: SelectedFile,
) -> anyhow::Result<DatasetImage> {
    let _inflight = InflightGuard::enter(&ctx.metrics);
    ctx.metrics.started_total.inc();

    let dest = ctx.backend.generate_upload_destination(&ctx.dataset).await?;

    let caps = ctx.caps;
    let normalized = tokio::task::spawn_blocking(move || {
        ensure_max_resolution(file, caps.max_pixels, caps.resize_backend)
    })
    .await?;
    if matches!(normalized.outcome, NormalizeOutcome::Resized { .. }) {
        ctx.metrics.resized_total.inc();
    }

    let file = normalized.file;
    let content_type = file.effective_content_type();
    let size = file.size;
    {
        let _timer = ScopedTimer::new(&ctx.metrics.transfer_latency);
        ctx.transport
            .put(&dest.url, file.bytes, &content_type)
            .await?;
    }

    let image = ctx
        .backend
        .acknowledge_upload(&dest.key, size, &content_type)
        .await?;
    ctx.metrics.uploaded_total.inc();
    ctx.metrics.uploaded_bytes_total.inc_by(size);
    info!(
        target: "tuner_events",
        event = "object_uploaded",
        dataset_id = %ctx.dataset,
        key = %dest.key,
        index = index as u64,
        bytes = size,
        "uploaded object"
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(failed: usize, ok: usize) -> UploadReport {
        UploadReport {
            dataset: BoundDataset {
                id: DatasetId("ds".to_string()),
                name: "cats".to_string(),
            },
            uploaded: (0..ok)
                .map(|i| DatasetImage {
                    id: tuner_core::types::ImageId(format!("img{i}")),
                    dataset_id: DatasetId("ds".to_string()),
                    owner: tuner_core::types::OwnerId("u".to_string()),
                    key: format!("datasets/ds/images/{i}"),
                    bucket: "b".to_string(),
                    bytes: 1,
                    content_type: "image/png".to_string(),
                    created_unix_time_ms: 0,
                })
                .collect(),
            failed: (0..failed)
                .map(|i| UploadFailure {
                    index: i,
                    name: format!("f{i}.png"),
                    error: "status=403 from https://bucket.example/secret".to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn user_message_hides_transport_detail() {
        let r = report(1, 2);
        let msg = r.user_message().unwrap();
        assert_eq!(msg, "1 of 3 files failed to upload. Please try again.");
        assert!(!msg.contains("403"));
        assert!(report(0, 2).user_message().is_none());
        assert!(report(0, 2).is_complete());
    }
}
