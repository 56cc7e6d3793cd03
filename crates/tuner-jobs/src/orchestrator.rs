use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use tuner_core::types::RemoteJobId;
use tuner_runtime::transport::http_with_retry;

use crate::config::JobConfig;

/// Failure talking to a remote service next to the GPU host.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("remote returned status={status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid remote response: {0}")]
    InvalidResponse(String),
    #[error("remote request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote response decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateJobRequest {
    pub name: String,
    /// Comma-separated, e.g. `"0"` or `"0,1"`.
    pub gpu_ids: String,
    pub job_config: JobConfig,
}

pub fn gpu_ids_param(ids: &[u32]) -> String {
    ids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedJob {
    pub id: RemoteJobId,
    pub name: String,
    pub queue_position: Option<i64>,
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CreateJobResponse {
    Accepted {
        id: String,
        name: String,
        #[serde(default)]
        queue_position: Option<i64>,
        #[serde(default)]
        created_at: Option<String>,
    },
    Rejected {
        error: String,
    },
}

impl CreateJobResponse {
    fn into_accepted(self) -> Result<AcceptedJob, OrchestratorError> {
        match self {
            CreateJobResponse::Accepted {
                id,
                name,
                queue_position,
                created_at,
            } => {
                let id = id.trim();
                if id.is_empty() {
                    return Err(OrchestratorError::InvalidResponse(
                        "accepted job has an empty id".to_string(),
                    ));
                }
                Ok(AcceptedJob {
                    id: RemoteJobId(id.to_string()),
                    name,
                    queue_position,
                    created_at,
                })
            }
            CreateJobResponse::Rejected { error } => Err(OrchestratorError::Rejected(error)),
        }
    }
}

/// Latest remote view of a job. `status` is `None` when the remote omitted it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteJobStatus {
    pub status: Option<String>,
    pub samples: Vec<String>,
    pub checkpoints: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JobStatusBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Option<JobOutputBody>,
}

#[derive(Debug, Default, Deserialize)]
struct JobOutputBody {
    #[serde(default)]
    samples: Vec<String>,
    #[serde(default)]
    checkpoints: Vec<String>,
    /// Older workers nest the bucket paths one level down.
    #[serde(default)]
    r2_outputs: Option<Box<JobOutputBody>>,
}

impl From<JobStatusBody> for RemoteJobStatus {
    fn from(body: JobStatusBody) -> Self {
        let output = body.output.unwrap_or_default();
        let nested = output.r2_outputs.map(|b| *b).unwrap_or_default();
        let pick = |own: Vec<String>, nested: Vec<String>| {
            if own.is_empty() {
                nested
            } else {
                own
            }
        };
        Self {
            status: body.status.filter(|s| !s.trim().is_empty()),
            samples: pick(output.samples, nested.samples),
            checkpoints: pick(output.checkpoints, nested.checkpoints),
        }
    }
}

/// Remote job runner that accepts training jobs and reports their progress.
#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    async fn create_job(&self, req: &CreateJobRequest) -> Result<AcceptedJob, OrchestratorError>;

    async fn job_status(&self, id: &RemoteJobId) -> Result<RemoteJobStatus, OrchestratorError>;
}

/// Client for the ai-toolkit jobs API (`/api/jobs`).
pub struct AiToolkitClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    next_request_id: AtomicU64,
}

impl AiToolkitClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            next_request_id: AtomicU64::new(0),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

pub(crate) async fn read_body(
    resp: reqwest::Response,
) -> Result<(reqwest::StatusCode, String), OrchestratorError> {
    let status = resp.status();
    let body = resp.text().await?;
    Ok((status, body))
}

#[async_trait]
impl Orchestrator for AiToolkitClient {
    async fn create_job(&self, req: &CreateJobRequest) -> Result<AcceptedJob, OrchestratorError> {
        let url = format!("{}/api/jobs", self.base_url);
        // Not retried: a lost response may still have queued the job.
        let resp = self
            .authorize(self.client.post(&url))
            .json(req)
            .send()
            .await?;
        let (status, body) = read_body(resp).await?;
        debug!(status = status.as_u16(), job_name = %req.name, "create job response");

        match serde_json::from_str::<CreateJobResponse>(&body) {
            Ok(parsed @ CreateJobResponse::Rejected { .. }) => parsed.into_accepted(),
            _ if !status.is_success() => Err(OrchestratorError::Status {
                status: status.as_u16(),
                body,
            }),
            Ok(parsed) => parsed.into_accepted(),
            Err(err) => Err(OrchestratorError::Decode(err)),
        }
    }

    async fn job_status(&self, id: &RemoteJobId) -> Result<RemoteJobStatus, OrchestratorError> {
        let url = format!("{}/api/jobs/{}", self.base_url, id);
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let resp = http_with_retry(request_id, || {
            self.authorize(self.client.get(&url)).send()
        })
        .await?;
        let (status, body) = read_body(resp).await?;
        if !status.is_success() {
            return Err(OrchestratorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: JobStatusBody = serde_json::from_str(&body)?;
        debug!(remote_job_id = %id, status = ?parsed.status, "job status response");
        Ok(parsed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_ids_are_comma_joined() {
        assert_eq!(gpu_ids_param(&[0]), "0");
        assert_eq!(gpu_ids_param(&[0, 1, 3]), "0,1,3");
    }

    #[test]
    fn accepted_response_needs_an_id() {
        let ok: CreateJobResponse = serde_json::from_str(
            r#"{"id":"j1","name":"n","queue_position":2,"created_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let job = ok.into_accepted().unwrap();
        assert_eq!(job.id, RemoteJobId("j1".to_string()));
        assert_eq!(job.queue_position, Some(2));

        let empty: CreateJobResponse = serde_json::from_str(r#"{"id":" ","name":"n"}"#).unwrap();
        assert!(matches!(
            empty.into_accepted(),
            Err(OrchestratorError::InvalidResponse(_))
        ));

        let rejected: CreateJobResponse =
            serde_json::from_str(r#"{"error":"gpu busy"}"#).unwrap();
        assert!(matches!(
            rejected.into_accepted(),
            Err(OrchestratorError::Rejected(e)) if e == "gpu busy"
        ));
    }

    #[test]
    fn status_body_falls_back_to_nested_outputs() {
        let body: JobStatusBody = serde_json::from_str(
            r#"{"status":"COMPLETED","output":{"r2_outputs":{"samples":["s/1.png"],"checkpoints":["c/1.safetensors"]}}}"#,
        )
        .unwrap();
        let st = RemoteJobStatus::from(body);
        assert_eq!(st.status.as_deref(), Some("COMPLETED"));
        assert_eq!(st.samples, vec!["s/1.png".to_string()]);
        assert_eq!(st.checkpoints, vec!["c/1.safetensors".to_string()]);

        let body: JobStatusBody = serde_json::from_str(r#"{"status":""}"#).unwrap();
        assert_eq!(RemoteJobStatus::from(body), RemoteJobStatus::default());
    }
}
