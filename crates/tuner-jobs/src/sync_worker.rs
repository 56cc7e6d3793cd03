use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tuner_runtime::transport::http_with_retry;

use crate::orchestrator::{read_body, OrchestratorError};

/// Asks the sync worker to mirror `r2_prefix` of `r2_bucket` onto the GPU host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDatasetRequest {
    pub dataset_id: String,
    pub r2_bucket: String,
    pub r2_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedDataset {
    pub dataset_id: String,
    pub local_path: String,
    pub already_synced: bool,
    pub bytes_written: u64,
    pub object_count: u64,
}

/// Wire shape of both outcomes; `ok` decides which fields are meaningful.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncDatasetResponse {
    ok: bool,
    #[serde(default)]
    dataset_id: String,
    #[serde(default)]
    local_path: Option<String>,
    #[serde(default)]
    already_synced: bool,
    #[serde(default)]
    bytes_written: u64,
    #[serde(default)]
    object_count: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<u16>,
}

impl TryFrom<SyncDatasetResponse> for SyncedDataset {
    type Error = OrchestratorError;

    fn try_from(resp: SyncDatasetResponse) -> Result<Self, Self::Error> {
        if !resp.ok {
            let error = resp.error.unwrap_or_else(|| "sync failed".to_string());
            return Err(match resp.status {
                Some(status) => OrchestratorError::Status {
                    status,
                    body: error,
                },
                None => OrchestratorError::Rejected(error),
            });
        }
        let local_path = resp
            .local_path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                OrchestratorError::InvalidResponse("sync succeeded without a localPath".to_string())
            })?;
        Ok(Self {
            dataset_id: resp.dataset_id,
            local_path,
            already_synced: resp.already_synced,
            bytes_written: resp.bytes_written,
            object_count: resp.object_count,
        })
    }
}

/// Service that stages a dataset's bucket contents next to the orchestrator.
#[async_trait]
pub trait DatasetSyncWorker: Send + Sync + 'static {
    async fn sync_dataset(&self, req: &SyncDatasetRequest)
        -> Result<SyncedDataset, OrchestratorError>;
}

pub struct SyncWorkerClient {
    client: reqwest::Client,
    base_url: String,
    next_request_id: AtomicU64,
}

impl SyncWorkerClient {
    pub fn new(base_url: &str) -> Result<Self, OrchestratorError> {
        // Large datasets take a while to copy.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            next_request_id: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl DatasetSyncWorker for SyncWorkerClient {
    async fn sync_dataset(
        &self,
        req: &SyncDatasetRequest,
    ) -> Result<SyncedDataset, OrchestratorError> {
        let url = format!("{}/sync", self.base_url);
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let resp = http_with_retry(request_id, || self.client.post(&url).json(req).send()).await?;
        let (status, body) = read_body(resp).await?;
        let parsed = match serde_json::from_str::<SyncDatasetResponse>(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(OrchestratorError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
            Err(err) => return Err(err.into()),
        };
        let synced = SyncedDataset::try_from(parsed)?;
        debug!(
            dataset_id = %synced.dataset_id,
            local_path = %synced.local_path,
            already_synced = synced.already_synced,
            object_count = synced.object_count,
            "dataset synced"
        );
        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case() {
        let req = SyncDatasetRequest {
            dataset_id: "ds_1".to_string(),
            r2_bucket: "b".to_string(),
            r2_prefix: "datasets/ds_1/data".to_string(),
            overwrite: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "datasetId": "ds_1",
                "r2Bucket": "b",
                "r2Prefix": "datasets/ds_1/data"
            })
        );
    }

    #[test]
    fn failure_outcome_maps_to_error() {
        let resp: SyncDatasetResponse = serde_json::from_str(
            r#"{"ok":false,"datasetId":"ds_1","error":"bucket missing","status":404}"#,
        )
        .unwrap();
        let err = SyncedDataset::try_from(resp).unwrap_err();
        assert!(matches!(err, OrchestratorError::Status { status: 404, .. }));
    }

    #[test]
    fn success_without_path_is_invalid() {
        let resp: SyncDatasetResponse =
            serde_json::from_str(r#"{"ok":true,"datasetId":"ds_1"}"#).unwrap();
        assert!(matches!(
            SyncedDataset::try_from(resp),
            Err(OrchestratorError::InvalidResponse(_))
        ));
    }
}
